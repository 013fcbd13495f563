//! Command-line entry points.

use clap::Args;

use crate::{engine::ocrmypdf, prelude::*, settings::SettingsStore};

pub mod check;
pub mod run;
pub mod schema;
pub mod settings;

/// Options for locating the OCR engine.
#[derive(Debug, Clone, Args)]
pub struct EngineOpts {
    /// The OCRmyPDF command to run.
    #[clap(long, env = "OCR_BATCH_ENGINE", default_value = ocrmypdf::DEFAULT_COMMAND)]
    pub engine_command: PathBuf,
}

/// Open the settings store at `path`, or at the default location.
pub async fn open_settings(path: Option<&Path>) -> Result<SettingsStore> {
    let path = match path {
        Some(path) => path.to_owned(),
        None => SettingsStore::default_path()?,
    };
    SettingsStore::open(path).await
}

/// The Tesseract data directory from settings, if one is configured.
pub fn tessdata_dir(data_dir: &str) -> Option<PathBuf> {
    let data_dir = data_dir.trim();
    (!data_dir.is_empty()).then(|| PathBuf::from(data_dir))
}
