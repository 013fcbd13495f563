//! The `settings` subcommand.

use clap::{Args, Subcommand};

use crate::{cmd::open_settings, prelude::*, settings::Settings};

/// Options for the `settings` subcommand.
#[derive(Debug, Args)]
pub struct SettingsOpts {
    #[clap(subcommand)]
    pub action: SettingsAction,
}

/// What to do with the stored settings.
#[derive(Debug, Subcommand)]
pub enum SettingsAction {
    /// Print all settings as JSON.
    Show,
    /// Print a single setting.
    Get {
        /// The setting name.
        key: String,
    },
    /// Change a single setting.
    Set {
        /// The setting name.
        key: String,
        /// The new value. Parsed as JSON if possible, otherwise used as a
        /// string.
        value: String,
    },
    /// Restore all defaults.
    Reset,
    /// Load settings from a JSON file. Unknown keys are ignored.
    Import {
        /// The file to read.
        path: PathBuf,
    },
    /// Save all settings to a JSON file.
    Export {
        /// The file to write.
        path: PathBuf,
    },
    /// Print the location of the settings file.
    Path,
    /// List all setting names.
    Keys,
}

/// Parse a value given on the command line.
fn parse_cli_value(value: &str) -> Value {
    serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()))
}

/// The `settings` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_settings(settings_path: Option<&Path>, opts: &SettingsOpts) -> Result<()> {
    let mut store = open_settings(settings_path).await?;
    match &opts.action {
        SettingsAction::Show => {
            let map = store.settings().to_map()?;
            let json = serde_json::to_string_pretty(&Value::Object(map))
                .context("failed to serialize settings")?;
            println!("{}", json);
        }
        SettingsAction::Get { key } => match store.get(key)? {
            Value::String(s) => println!("{}", s),
            other => println!("{}", other),
        },
        SettingsAction::Set { key, value } => {
            store.set(key, &parse_cli_value(value))?;
            store
                .settings()
                .validate()
                .with_context(|| format!("cannot set {:?} to {}", key, value))?;
            store.save().await?;
        }
        SettingsAction::Reset => {
            store.clear();
            store.save().await?;
        }
        SettingsAction::Import { path } => {
            let applied = store.import(path).await?;
            store.save().await?;
            eprintln!("Imported {} settings from {}", applied, path.display());
        }
        SettingsAction::Export { path } => {
            store.export(path).await?;
        }
        SettingsAction::Path => {
            println!("{}", store.path().display());
        }
        SettingsAction::Keys => {
            for key in Settings::keys() {
                println!("{}", key);
            }
        }
    }
    Ok(())
}
