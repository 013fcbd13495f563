use std::{fs::File, str::FromStr, sync::Mutex};

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod engine;
mod files;
mod prelude;
mod settings;
mod ui;
mod worker;

/// Turn scanned PDFs into searchable PDFs using OCRmyPDF.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
Environment Variables:
  - OCR_BATCH_SETTINGS (optional): Use this settings file.
  - OCR_BATCH_ENGINE (optional): The OCRmyPDF command to run.
  - RUST_LOG (optional): Log filter, such as `debug` or `ocr_batch=trace`.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    /// Settings file to use instead of the per-user default.
    #[clap(long, global = true, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Also write logs to this file.
    #[clap(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR PDF files, writing searchable PDFs and one JSONL record per file.
    Run(cmd::run::RunOpts),
    /// View or change stored settings.
    Settings(cmd::settings::SettingsOpts),
    /// Check for OCRmyPDF, Tesseract and Ghostscript.
    Check(cmd::check::CheckOpts),
    /// Print schemas for settings and output records.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Run(opts) => opts.output_path.is_none(),
            Cmd::Settings(_) | Cmd::Check(_) => true,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists. We do this
    // before parsing arguments, because some arguments can come from the
    // environment.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    let ui = Ui::init();
    init_tracing(&ui, opts.log_file.as_deref())?;
    debug!("Parsed options: {:?}", opts);

    // Call our real `main` function now that logging is set up.
    real_main(ui, opts).await
}

/// Set up `tracing`, writing to stderr and optionally to a log file.
fn init_tracing(ui: &Ui, log_file: Option<&Path>) -> Result<()> {
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive.clone())
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    let file_layer = match log_file {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {:?}", path))?;
            let file_filter = EnvFilter::builder()
                .with_default_directive(directive)
                .from_env_lossy();
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(file_filter),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui, opts: Opts) -> Result<()> {
    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    let settings_path = opts.settings.as_deref();
    match &opts.subcmd {
        Cmd::Run(run_opts) => {
            cmd::run::cmd_run(ui, settings_path, run_opts).await?;
        }
        Cmd::Settings(settings_opts) => {
            cmd::settings::cmd_settings(settings_path, settings_opts).await?;
        }
        Cmd::Check(check_opts) => {
            cmd::check::cmd_check(ui, check_opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
