//! OCR engine wrapping the `ocrmypdf` CLI tool.

use std::{process::Stdio, sync::LazyLock};

use regex::Regex;
use tokio::process::Command;

use crate::{async_utils::check_for_command_failure, prelude::*};

use super::{EngineError, EngineParams, OcrEngine};

/// The command we run unless told otherwise.
pub const DEFAULT_COMMAND: &str = "ocrmypdf";

/// `ocrmypdf` exit codes we know how to explain.
mod exit_code {
    pub const INPUT_FILE: i32 = 2;
    pub const FILE_ACCESS_ERROR: i32 = 5;
    pub const ALREADY_DONE_OCR: i32 = 6;
    pub const ENCRYPTED_PDF: i32 = 8;
}

/// Unsupported image formats are reported with the same exit code as a bad
/// input file, so we have to look at the message.
static UNSUPPORTED_IMAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)unsupported\s*image\s*format").expect("failed to compile regex")
});

/// OCR engine which runs `ocrmypdf` once per file.
#[derive(Clone, Debug)]
pub struct OcrMyPdfEngine {
    /// The command to run.
    command: PathBuf,

    /// Passed to Tesseract as `TESSDATA_PREFIX`, if set.
    tessdata_dir: Option<PathBuf>,
}

impl OcrMyPdfEngine {
    /// Create a new `ocrmypdf` engine.
    pub fn new(command: impl Into<PathBuf>, tessdata_dir: Option<PathBuf>) -> Self {
        Self {
            command: command.into(),
            tessdata_dir,
        }
    }

    /// Build a base command with our environment applied.
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        if let Some(dir) = &self.tessdata_dir {
            cmd.env("TESSDATA_PREFIX", dir);
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl OcrEngine for OcrMyPdfEngine {
    #[instrument(level = "debug", skip_all, fields(command = %self.command.display()))]
    async fn check_available(&self) -> Result<String> {
        let output = self
            .command()
            .arg("--version")
            .output()
            .await
            .with_context(|| {
                format!(
                    "cannot run {:?}; is OCRmyPDF installed and on your PATH?",
                    self.command
                )
            })?;
        check_for_command_failure("ocrmypdf", &output)?;
        let version = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        debug!(%version, "Found OCRmyPDF");
        Ok(version)
    }

    #[instrument(level = "debug", skip_all, fields(input = %input.display()))]
    async fn ocr(
        &self,
        input: &Path,
        output: &Path,
        params: &EngineParams,
    ) -> Result<(), EngineError> {
        // Keep the directory alive until the engine has exited.
        let config = write_tesseract_config(params).await.map_err(|err| {
            EngineError::Other(format!("cannot write Tesseract config: {:#}", err))
        })?;
        let args = params.to_args(config.as_ref().map(|(_, path)| path.as_path()));
        debug!(?args, "Running OCRmyPDF");
        let result = self
            .command()
            .args(&args)
            .arg("--")
            .arg(input)
            .arg(output)
            .output()
            .await
            .map_err(|err| {
                EngineError::Other(format!(
                    "cannot run {}: {}",
                    self.command.display(),
                    err
                ))
            })?;
        if result.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&result.stderr);
        debug!(code = ?result.status.code(), %stderr, "OCRmyPDF failed");
        Err(classify_failure(result.status.code(), &stderr))
    }
}

/// Write [`EngineParams::tesseract_config_text`] to a file in a new temporary
/// directory, if there is anything to write.
async fn write_tesseract_config(
    params: &EngineParams,
) -> Result<Option<(tempfile::TempDir, PathBuf)>> {
    let Some(text) = params.tesseract_config_text() else {
        return Ok(None);
    };
    let tmpdir = tempfile::TempDir::with_prefix("tesseract-config")
        .context("cannot create temporary directory")?;
    let path = tmpdir.path().join("ocr-batch.cfg");
    tokio::fs::write(&path, text)
        .await
        .with_context(|| format!("cannot write {:?}", path.display()))?;
    Ok(Some((tmpdir, path)))
}

/// Turn an `ocrmypdf` exit code and error output into an [`EngineError`].
pub fn classify_failure(code: Option<i32>, stderr: &str) -> EngineError {
    match code {
        Some(exit_code::ALREADY_DONE_OCR) => EngineError::PriorOcrFound,
        Some(exit_code::ENCRYPTED_PDF) => EngineError::Encrypted,
        Some(exit_code::FILE_ACCESS_ERROR) => EngineError::OutputFileAccess,
        _ if UNSUPPORTED_IMAGE_REGEX.is_match(stderr) => {
            EngineError::UnsupportedImageFormat
        }
        Some(exit_code::INPUT_FILE) => EngineError::InputFile,
        Some(code) => EngineError::Other(match last_line(stderr) {
            Some(line) => format!("{} (exit code {})", line, code),
            None => format!("ocrmypdf exited with code {}", code),
        }),
        None => EngineError::Other(match last_line(stderr) {
            Some(line) => format!("{} (terminated by signal)", line),
            None => "ocrmypdf was terminated by a signal".to_owned(),
        }),
    }
}

/// The last non-blank line of some command output, which is where
/// `ocrmypdf` puts its summary of what went wrong.
fn last_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).rfind(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_exit_codes_are_classified() {
        assert!(matches!(
            classify_failure(Some(6), "page already has text!"),
            EngineError::PriorOcrFound
        ));
        assert!(matches!(
            classify_failure(Some(8), ""),
            EngineError::Encrypted
        ));
        assert!(matches!(
            classify_failure(Some(5), ""),
            EngineError::OutputFileAccess
        ));
        assert!(matches!(
            classify_failure(Some(2), "InputFileError: not a PDF"),
            EngineError::InputFile
        ));
        assert!(matches!(
            classify_failure(Some(2), "Unsupported image format: JBIG2"),
            EngineError::UnsupportedImageFormat
        ));
    }

    #[test]
    fn other_failures_keep_engine_text() {
        let err = classify_failure(Some(15), "lots of noise\nboom\n\n");
        match err {
            EngineError::Other(msg) => {
                assert!(msg.contains("boom"));
                assert!(msg.contains("15"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
        let err = classify_failure(Some(1), "");
        assert_eq!(err.to_string(), "ocrmypdf exited with code 1");
    }

    #[tokio::test]
    async fn tesseract_config_is_written_only_when_needed() -> Result<()> {
        assert!(write_tesseract_config(&EngineParams::default()).await?.is_none());

        let params = EngineParams {
            tesseract_config: vec![("preserve_interword_spaces".to_owned(), "1".to_owned())],
            ..EngineParams::default()
        };
        let (tmpdir, path) = write_tesseract_config(&params).await?.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(&path).await?,
            "preserve_interword_spaces 1\n"
        );
        drop(tmpdir);
        assert!(!path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn missing_command_is_reported() {
        let engine = OcrMyPdfEngine::new("/nonexistent/ocrmypdf-for-tests", None);
        assert!(engine.check_available().await.is_err());
        let err = engine
            .ocr(
                Path::new("in.pdf"),
                Path::new("out.pdf"),
                &EngineParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Other(msg) if msg.contains("cannot run")));
    }
}
