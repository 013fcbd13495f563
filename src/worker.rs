//! Background OCR jobs.
//!
//! A job is a fixed list of input files plus an option set. We run it on a
//! single background task, calling the engine once per file, in order, and
//! report what happens on a channel of [`JobEvent`]s:
//!
//! - zero or more [`JobEvent::Progress`] and [`JobEvent::FileCompleted`],
//! - then at most one [`JobEvent::Error`] if the job itself broke,
//! - then exactly one [`JobEvent::Finished`].
//!
//! A failure on one file never stops the job. It becomes that file's
//! [`FileOutcome`] and we move on. Only problems outside the per-file scope
//! (the engine is missing, the output directory can't be created, we can't
//! probe for output paths) abort the remaining files.
//!
//! Cancellation is cooperative. We look at the [`CancelFlag`] between files
//! only, because an engine call can't be interrupted once it has started.

use std::{
    collections::HashSet,
    ffi::OsString,
    sync::{
        Arc, LazyLock, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{SinkExt as _, channel::mpsc};
use schemars::JsonSchema;
use tracing::{Instrument as _, info_span};
use uuid::Uuid;

use crate::{
    async_utils::JoinWorker,
    engine::{EngineError, EngineParams, OcrEngine},
    prelude::*,
    settings::OcrOptions,
};

/// Label of the final progress event.
pub const DONE_LABEL: &str = "Completed";

/// How many events may be waiting for the consumer before the worker waits.
const EVENT_BUFFER: usize = 32;

/// A cooperative cancellation flag. Cheap to clone; all clones share state.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a new, un-cancelled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the job to stop after the current file.
    pub fn cancel(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            info!("OCR processing cancelled by user");
        }
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened to one input file.
#[derive(Clone, Debug, JsonSchema, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    /// The input's file name, for display.
    pub name: String,

    /// The input file.
    pub input_path: PathBuf,

    /// Did we produce an output file?
    pub success: bool,

    /// A human-readable explanation.
    pub message: String,

    /// Where the output was (or would have been) written.
    pub output_path: PathBuf,
}

/// Events reported by a running job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    /// A file is starting. `percent` is the share of files already done.
    Progress { percent: u8, label: String },
    /// A file is done, successfully or not.
    FileCompleted(FileOutcome),
    /// The job failed outside of any single file. Remaining files were
    /// skipped.
    Error(String),
    /// The job is over. Always the last event.
    Finished,
}

/// A single run of the worker.
#[derive(Clone, Debug)]
pub struct OcrJob {
    /// Used to tell jobs apart in logs.
    pub id: Uuid,

    /// Input files, in processing order.
    pub files: Vec<PathBuf>,

    /// Options, fixed for the life of the job.
    pub options: Arc<OcrOptions>,

    /// Where outputs go. Created if missing.
    pub output_dir: PathBuf,
}

impl OcrJob {
    /// Create a new job.
    pub fn new(files: Vec<PathBuf>, options: OcrOptions, output_dir: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            files,
            options: Arc::new(options),
            output_dir,
        }
    }
}

/// Return value of [`start_job`].
pub struct JobHandle {
    /// Events from the job. See the module docs for ordering.
    pub events: mpsc::Receiver<JobEvent>,

    /// Set this to stop the job after the current file.
    pub cancel: CancelFlag,

    /// The background task. Joining it waits for the job to end, but
    /// imposes no timeout of its own.
    pub worker: JoinWorker,
}

/// Output directories with a job running in this process.
static ACTIVE_OUTPUT_DIRS: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Exclusive use of an output directory by one job in this process. Released
/// on drop.
///
/// Two jobs writing to the same directory could both pick the same "free"
/// output name, so we refuse to start the second one. Separate processes are
/// not coordinated.
#[derive(Debug)]
struct OutputDirClaim {
    dir: PathBuf,
}

impl OutputDirClaim {
    fn acquire(dir: &Path) -> Result<Self> {
        let dir = std::path::absolute(dir).unwrap_or_else(|_| dir.to_owned());
        let mut active = ACTIVE_OUTPUT_DIRS.lock().expect("lock poisoned");
        if active.insert(dir.clone()) {
            Ok(Self { dir })
        } else {
            Err(anyhow!(
                "another OCR job is already writing to {:?}",
                dir.display()
            ))
        }
    }
}

impl Drop for OutputDirClaim {
    fn drop(&mut self) {
        let mut active = ACTIVE_OUTPUT_DIRS.lock().expect("lock poisoned");
        active.remove(&self.dir);
    }
}

/// Start a job on a background task.
///
/// This only fails if another job in this process is using the same output
/// directory. Everything else is reported through [`JobHandle::events`].
pub fn start_job(job: OcrJob, engine: Arc<dyn OcrEngine>) -> Result<JobHandle> {
    let claim = OutputDirClaim::acquire(&job.output_dir)?;
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancelFlag::new();
    let span = info_span!("job", id = %job.id);
    let worker_cancel = cancel.clone();
    let handle = tokio::spawn(
        async move {
            let mut events = EventSender::new(tx);
            run_job(&job, claim, engine.as_ref(), &worker_cancel, &mut events).await;
            Ok(())
        }
        .instrument(span),
    );
    Ok(JobHandle {
        events: rx,
        cancel,
        worker: JoinWorker::from_handle(handle),
    })
}

/// Sends events, tolerating a consumer which has gone away.
struct EventSender {
    tx: mpsc::Sender<JobEvent>,
    disconnected: bool,
}

impl EventSender {
    fn new(tx: mpsc::Sender<JobEvent>) -> Self {
        Self {
            tx,
            disconnected: false,
        }
    }

    async fn send(&mut self, event: JobEvent) {
        if self.disconnected {
            return;
        }
        if self.tx.send(event).await.is_err() {
            // The job keeps going; there's just nobody to tell.
            debug!("event receiver dropped");
            self.disconnected = true;
        }
    }
}

/// Run a whole job, making sure [`JobEvent::Finished`] is sent exactly once.
///
/// The output directory is released before `Finished` goes out, so a caller
/// may start the next job on it as soon as it sees that event.
async fn run_job(
    job: &OcrJob,
    claim: OutputDirClaim,
    engine: &dyn OcrEngine,
    cancel: &CancelFlag,
    events: &mut EventSender,
) {
    if let Err(err) = run_files(job, engine, cancel, events).await {
        let message = format!("OCR processing failed: {:#}", err);
        error!("{}", message);
        events.send(JobEvent::Error(message)).await;
    }
    drop(claim);
    events.send(JobEvent::Finished).await;
}

/// The file loop. Errors returned from here abort the job.
async fn run_files(
    job: &OcrJob,
    engine: &dyn OcrEngine,
    cancel: &CancelFlag,
    events: &mut EventSender,
) -> Result<()> {
    let version = engine
        .check_available()
        .await
        .context("OCR engine is not available")?;
    info!(%version, "Starting OCR processing for {} files", job.files.len());

    tokio::fs::create_dir_all(&job.output_dir)
        .await
        .with_context(|| {
            format!("cannot create output directory {:?}", job.output_dir.display())
        })?;

    let params = EngineParams::from_options(&job.options);
    let total = job.files.len();
    for (index, input) in job.files.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }

        let name = display_name(input)?;
        events
            .send(JobEvent::Progress {
                percent: percent_complete(index, total),
                label: name.clone(),
            })
            .await;

        let output =
            unique_output_path(&job.output_dir, input, &job.options.output_suffix).await?;
        let outcome = process_file(engine, input, name, output, &params).await;
        events.send(JobEvent::FileCompleted(outcome)).await;
    }

    if cancel.is_cancelled() {
        info!("OCR processing stopped early");
    } else {
        events
            .send(JobEvent::Progress {
                percent: 100,
                label: DONE_LABEL.to_owned(),
            })
            .await;
    }
    Ok(())
}

/// `floor(index / total * 100)`.
fn percent_complete(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(index.min(total) * 100 / total).unwrap_or(100)
}

/// The file name of `path`, for display.
fn display_name(path: &Path) -> Result<String> {
    Ok(path
        .file_name()
        .ok_or_else(|| anyhow!("input path {:?} has no file name", path.display()))?
        .to_string_lossy()
        .into_owned())
}

/// Pick an output path for `input` which doesn't exist yet.
///
/// We try `<stem><suffix>.pdf` first, then `<stem><suffix>_1.pdf`,
/// `<stem><suffix>_2.pdf`, and so on.
pub async fn unique_output_path(
    output_dir: &Path,
    input: &Path,
    suffix: &str,
) -> Result<PathBuf> {
    let stem = input
        .file_stem()
        .ok_or_else(|| anyhow!("input path {:?} has no file name", input.display()))?;
    let mut base = OsString::from(stem);
    base.push(suffix);

    let candidate = |counter: Option<usize>| {
        let mut name = base.clone();
        if let Some(counter) = counter {
            name.push(format!("_{}", counter));
        }
        name.push(".pdf");
        output_dir.join(name)
    };

    let mut path = candidate(None);
    let mut counter = 1;
    while tokio::fs::try_exists(&path)
        .await
        .with_context(|| format!("cannot check whether {:?} exists", path.display()))?
    {
        path = candidate(Some(counter));
        counter += 1;
    }
    Ok(path)
}

/// OCR a single file. Never fails: every problem becomes the outcome's
/// message.
#[instrument(level = "debug", skip_all, fields(file = %name))]
pub async fn process_file(
    engine: &dyn OcrEngine,
    input: &Path,
    name: String,
    output: PathBuf,
    params: &EngineParams,
) -> FileOutcome {
    let output_name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    info!("Processing {} -> {}", name, output_name);

    let (success, message) = match engine.ocr(input, &output, params).await {
        Ok(()) => {
            info!("Successfully processed {}", name);
            (true, format!("Successfully processed to {}", output_name))
        }
        Err(EngineError::PriorOcrFound) => match tokio::fs::copy(input, &output).await {
            Ok(_) => {
                let message =
                    format!("File already has OCR layer. Copied to {}", output_name);
                warn!("{}: {}", name, message);
                (true, message)
            }
            Err(err) => {
                let message = format!("File has OCR layer but copy failed: {}", err);
                error!("{}: {}", name, message);
                (false, message)
            }
        },
        Err(err) => {
            let message = failure_message(&err);
            error!("{}: {}", name, message);
            (false, message)
        }
    };

    FileOutcome {
        name,
        input_path: input.to_owned(),
        success,
        message,
        output_path: output,
    }
}

/// The message shown to users for an engine failure.
pub fn failure_message(err: &EngineError) -> String {
    match err {
        EngineError::PriorOcrFound => "PDF already has an OCR layer".to_owned(),
        EngineError::Encrypted => "PDF is encrypted, cannot process".to_owned(),
        EngineError::InputFile => {
            "invalid input: file not found or not a valid PDF".to_owned()
        }
        EngineError::OutputFileAccess => {
            "output access denied: cannot write output file (check permissions)"
                .to_owned()
        }
        EngineError::UnsupportedImageFormat => {
            "unsupported image format in PDF".to_owned()
        }
        EngineError::Other(msg) => format!("OCR failed: {}", msg),
    }
}
