//! The `run` subcommand.

use std::sync::Arc;

use clap::Args;
use futures::StreamExt as _;

use crate::{
    async_utils::io::JsonlWriter,
    cmd::{EngineOpts, open_settings, tessdata_dir},
    engine::ocrmypdf::OcrMyPdfEngine,
    files::{FileList, format_file_size},
    prelude::*,
    settings::{OutputType, Settings},
    ui::{ProgressConfig, Ui},
    worker::{CancelFlag, FileOutcome, JobEvent, JobHandle, OcrJob, start_job},
};

/// Options for the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// PDF files to process. Folders are expanded to the PDFs they contain.
    #[clap(required = true, value_name = "PATH")]
    pub inputs: Vec<PathBuf>,

    /// Directory for searchable PDFs. Defaults to the `output_dir` setting,
    /// or `OCR_Output` on the desktop.
    #[clap(short = 'd', long = "out-dir")]
    pub output_dir: Option<PathBuf>,

    /// Write JSONL result records here instead of standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// What portion of files may fail before we exit with an error? Specified
    /// as a number between 0.0 and 1.0.
    #[clap(long, default_value = "1.0")]
    pub allowed_failure_rate: f32,

    /// Save the options given here as the new defaults.
    #[clap(long)]
    pub save_settings: bool,

    #[clap(flatten)]
    pub overrides: OptionOverrides,

    #[clap(flatten)]
    pub engine: EngineOpts,
}

/// Per-run overrides for stored settings.
#[derive(Debug, Default, Args)]
pub struct OptionOverrides {
    /// Tesseract language(s), such as `eng` or `eng+deu`.
    #[clap(short = 'l', long)]
    pub language: Option<String>,

    /// Number of threads the engine may use per file.
    #[clap(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Rotate pages based on detected text orientation.
    #[clap(long)]
    pub rotate_pages: bool,

    /// Deskew crooked pages.
    #[clap(long)]
    pub deskew: bool,

    /// Clean pages before OCR.
    #[clap(long)]
    pub clean: bool,

    /// Remove page backgrounds.
    #[clap(long)]
    pub remove_background: bool,

    /// Kind of PDF to write.
    #[clap(long, value_enum)]
    pub output_type: Option<OutputType>,

    /// Optimization level (0-3).
    #[clap(long)]
    pub optimize: Option<u32>,

    /// OCR every page, even ones which already have text.
    #[clap(long, conflicts_with_all = ["skip_text", "redo_ocr"])]
    pub force_ocr: bool,

    /// Skip pages which already have text.
    #[clap(long, conflicts_with = "redo_ocr")]
    pub skip_text: bool,

    /// Replace any existing OCR layer.
    #[clap(long)]
    pub redo_ocr: bool,

    /// Tesseract page segmentation mode (0-13).
    #[clap(long)]
    pub psm: Option<u32>,

    /// Tesseract OCR engine mode (0-3).
    #[clap(long)]
    pub oem: Option<u32>,

    /// DPI to assume for images without resolution metadata.
    #[clap(long)]
    pub image_dpi: Option<u32>,

    /// Suffix for output file names.
    #[clap(long)]
    pub suffix: Option<String>,
}

impl OptionOverrides {
    /// Apply any overrides to `settings`. Flags can only turn things on.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(language) = &self.language {
            settings.ocr_language = language.clone();
        }
        if let Some(jobs) = self.jobs {
            settings.jobs = jobs;
        }
        settings.rotate_pages |= self.rotate_pages;
        settings.deskew |= self.deskew;
        settings.clean |= self.clean;
        settings.remove_background |= self.remove_background;
        if let Some(output_type) = self.output_type {
            settings.output_type = output_type;
        }
        if let Some(optimize) = self.optimize {
            settings.optimize = optimize;
        }
        // The OCR modes are exclusive, so choosing one clears the others.
        if self.force_ocr || self.skip_text || self.redo_ocr {
            settings.force_ocr = self.force_ocr;
            settings.skip_text = self.skip_text;
            settings.redo_ocr = self.redo_ocr;
        }
        if let Some(psm) = self.psm {
            settings.tesseract_psm = psm;
        }
        if let Some(oem) = self.oem {
            settings.tesseract_oem = oem;
        }
        if let Some(image_dpi) = self.image_dpi {
            settings.image_dpi = image_dpi;
        }
        if let Some(suffix) = &self.suffix {
            settings.output_suffix = suffix.clone();
        }
    }
}

/// Tallies of file outcomes, for the end-of-run summary.
#[derive(Clone, Debug, Default)]
struct OutcomeCounters {
    /// How many files did we finish?
    total: usize,

    /// How many of those failed?
    failures: usize,
}

impl OutcomeCounters {
    fn update(&mut self, outcome: &FileOutcome) {
        self.total += 1;
        if !outcome.success {
            self.failures += 1;
        }
    }

    /// Report our counts, and fail if too many files failed.
    fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        if self.total == 0 {
            return Ok(());
        }
        let failure_rate = self.failures as f32 / self.total as f32;
        if failure_rate > allowed_failure_rate {
            return Err(anyhow!(
                "{}/{} ({:.2}%) of files failed, but only {:.2}% were allowed",
                self.failures,
                self.total,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ));
        }
        if self.failures > 0 {
            ui.display_message(
                "❌",
                &format!("{} files could not be processed", self.failures),
            );
        }
        ui.display_message(
            "✅",
            &format!("{} of {} files processed", self.total - self.failures, self.total),
        );
        Ok(())
    }
}

/// The `run` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: Ui, settings_path: Option<&Path>, opts: &RunOpts) -> Result<()> {
    // Merge our command-line options over the stored settings.
    let mut store = open_settings(settings_path).await?;
    let mut settings = store.settings().clone();
    opts.overrides.apply(&mut settings);
    if let Some(output_dir) = &opts.output_dir {
        settings.output_dir = Some(output_dir.clone());
    }
    settings.validate().context("invalid OCR options")?;
    if opts.save_settings {
        store.replace(settings.clone());
        store.save().await?;
        info!("Saved settings to {:?}", store.path());
    }

    // Collect our input files.
    let mut files = FileList::new();
    for input in &opts.inputs {
        files.add_path(input)?;
    }
    if files.is_empty() {
        return Err(anyhow!("no PDF files to process"));
    }
    ui.display_message(
        "📚",
        &format!(
            "Processing {} files ({})",
            files.len(),
            format_file_size(files.total_size())
        ),
    );

    // Start the job.
    let engine = Arc::new(OcrMyPdfEngine::new(
        &opts.engine.engine_command,
        tessdata_dir(&settings.tesseract_data_dir),
    ));
    let output_dir = settings.resolved_output_dir();
    let total = files.len();
    let job = OcrJob::new(files.into_files(), settings.ocr_options(), output_dir.clone());
    let JobHandle {
        mut events,
        cancel,
        worker,
    } = start_job(job, engine)?;
    let ctrl_c = tokio::spawn(cancel_on_ctrl_c(ui.clone(), cancel.clone()));

    // Report events as they arrive.
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing files",
            done_msg: "OCRed files",
        },
        u64::try_from(total).context("too many files")?,
    );
    let mut writer = JsonlWriter::create(opts.output_path.as_deref()).await?;
    let mut counters = OutcomeCounters::default();
    let mut job_error = None;
    let mut write_error = None;
    while let Some(event) = events.next().await {
        match event {
            JobEvent::Progress { percent, label } => {
                debug!(percent, %label, "Progress");
                pb.set_message(label);
            }
            JobEvent::FileCompleted(outcome) => {
                pb.inc(1);
                counters.update(&outcome);
                if !outcome.success {
                    ui.display_message(
                        "❌",
                        &format!("{}: {}", outcome.name, outcome.message),
                    );
                }
                if let Err(err) = writer.write_record(&outcome).await {
                    // Nowhere to report further results, so stop early.
                    cancel.cancel();
                    write_error = Some(err);
                    break;
                }
            }
            JobEvent::Error(message) => job_error = Some(message),
            JobEvent::Finished => break,
        }
    }
    pb.finish_using_style();
    ctrl_c.abort();
    // The worker ignores a closed channel, so this can't block the join.
    drop(events);
    worker.join().await?;
    if let Some(err) = write_error {
        return Err(err);
    }
    writer.finish().await?;

    if let Some(message) = job_error {
        return Err(anyhow!(message));
    }
    if cancel.is_cancelled() {
        ui.display_message(
            "🛑",
            &format!("Cancelled; {} of {} files were not processed", total - counters.total, total),
        );
    }
    ui.display_message("📁", &format!("Output written to {}", output_dir.display()));
    counters.finish(&ui, opts.allowed_failure_rate)
}

/// Cancel the job on the first Ctrl-C, and exit on the second.
async fn cancel_on_ctrl_c(ui: Ui, cancel: CancelFlag) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for Ctrl-C")?;
    ui.display_message(
        "🛑",
        "Stopping after the current file. Press Ctrl-C again to quit now.",
    );
    cancel.cancel();
    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for Ctrl-C")?;
    std::process::exit(130);
}
