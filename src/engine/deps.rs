//! Checks for the external programs the engine depends on.

use std::{ffi::OsStr, process::Stdio, time::Duration};

use tokio::{process::Command, time::timeout};

use crate::{async_utils::check_for_command_failure, prelude::*, settings::FALLBACK_LANGUAGES};

/// How long to wait for `--version` style probes.
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for `tesseract --list-langs`.
const LIST_LANGS_TIMEOUT: Duration = Duration::from_secs(10);

/// Ghostscript goes by different names on different platforms.
const GHOSTSCRIPT_COMMANDS: &[&str] = &["gs", "gswin64c", "gswin32c"];

/// What we found out about one dependency.
#[derive(Clone, Debug)]
pub struct Dependency {
    /// Human-readable name.
    pub name: &'static str,
    /// The first line of the version output, if the program could be run.
    pub version: Option<String>,
}

impl Dependency {
    /// Was the program found and runnable?
    pub fn is_available(&self) -> bool {
        self.version.is_some()
    }
}

/// Probe OCRmyPDF, Tesseract and Ghostscript.
#[instrument(level = "debug", skip_all)]
pub async fn check_dependencies(ocrmypdf_command: &Path) -> Vec<Dependency> {
    let ocrmypdf = probe_version(ocrmypdf_command.as_os_str(), "--version").await;
    let tesseract = probe_version(OsStr::new("tesseract"), "--version").await;
    let mut ghostscript = None;
    for command in GHOSTSCRIPT_COMMANDS {
        ghostscript = probe_version(OsStr::new(command), "--version").await;
        if ghostscript.is_some() {
            break;
        }
    }
    vec![
        Dependency {
            name: "ocrmypdf",
            version: ocrmypdf,
        },
        Dependency {
            name: "tesseract",
            version: tesseract,
        },
        Dependency {
            name: "ghostscript",
            version: ghostscript,
        },
    ]
}

/// Run `command arg` and return the first line of output, or `None` if the
/// command can't be run, fails, or takes too long.
async fn probe_version(command: &OsStr, arg: &str) -> Option<String> {
    let name = command.to_string_lossy();
    let output = match run_with_timeout(command, &[arg], VERSION_TIMEOUT).await {
        Ok(output) => output,
        Err(err) => {
            debug!(command = %name, "Dependency probe failed: {:#}", err);
            return None;
        }
    };
    // Tesseract has been known to print its version on stderr.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_owned)
        .or_else(|| Some("unknown version".to_owned()))
}

/// Run a command, failing if it doesn't finish in time or exits unsuccessfully.
async fn run_with_timeout(
    command: &OsStr,
    args: &[&str],
    limit: Duration,
) -> Result<std::process::Output> {
    let name = command.to_string_lossy();
    let output = timeout(
        limit,
        Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .with_context(|| format!("{} timed out", name))?
    .with_context(|| format!("cannot run {}", name))?;
    check_for_command_failure(&name, &output)?;
    Ok(output)
}

/// Languages Tesseract has data for, falling back to a built-in list when
/// Tesseract can't tell us.
#[instrument(level = "debug", skip_all)]
pub async fn tesseract_languages() -> Vec<String> {
    match run_with_timeout(OsStr::new("tesseract"), &["--list-langs"], LIST_LANGS_TIMEOUT)
        .await
    {
        Ok(output) => {
            let languages = parse_language_list(&String::from_utf8_lossy(&output.stdout));
            if languages.is_empty() {
                fallback_languages()
            } else {
                languages
            }
        }
        Err(err) => {
            debug!("Using fallback language list: {:#}", err);
            fallback_languages()
        }
    }
}

fn fallback_languages() -> Vec<String> {
    FALLBACK_LANGUAGES.iter().map(|&l| l.to_owned()).collect()
}

/// Parse `tesseract --list-langs` output. The first line is a header like
/// `List of available languages in "/usr/share/tessdata/" (3):`.
pub fn parse_language_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}
