//! The `check` subcommand.

use clap::Args;

use crate::{
    cmd::EngineOpts,
    engine::deps::{check_dependencies, tesseract_languages},
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// Options for the `check` subcommand.
#[derive(Debug, Args)]
pub struct CheckOpts {
    #[clap(flatten)]
    pub engine: EngineOpts,
}

/// The `check` subcommand. Reports which external programs we found, and
/// which OCR languages are installed.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_check(ui: Ui, opts: &CheckOpts) -> Result<()> {
    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "🔎",
        msg: "Checking dependencies",
        done_msg: "Checked dependencies",
    });
    let deps = check_dependencies(&opts.engine.engine_command).await;
    let languages = tesseract_languages().await;
    spinner.finish_using_style();

    for dep in &deps {
        match &dep.version {
            Some(version) => println!("{:<12} {}", dep.name, version),
            None => println!("{:<12} missing", dep.name),
        }
    }
    println!("{:<12} {}", "languages", languages.join(" "));

    let missing = deps
        .iter()
        .filter(|dep| !dep.is_available())
        .map(|dep| dep.name)
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("missing dependencies: {}", missing.join(", ")))
    }
}
