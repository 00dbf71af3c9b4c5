use std::{
    fmt,
    future::Future,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use futures_util::{future::BoxFuture, stream::BoxStream, FutureExt, Stream, StreamExt};
use serde::Serialize;
use taskseeker_core::CapturedImage;
use taskseeker_platform::{process::PidSlot, OcrError, SelectionError};
use taskseeker_providers::LlmError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::stream_buffer::StreamBuffer;

pub type SharedBuffer = Arc<Mutex<StreamBuffer>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotName {
    Ocr,
    Query,
}

impl SlotName {
    pub const ALL: [SlotName; 2] = [SlotName::Ocr, SlotName::Query];

    pub fn as_str(self) -> &'static str {
        match self {
            SlotName::Ocr => "ocr",
            SlotName::Query => "query",
        }
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
}

impl JobError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new("E_CANCELLED", "cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == "E_CANCELLED"
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for JobError {}

impl From<OcrError> for JobError {
    fn from(e: OcrError) -> Self {
        Self::new(&e.code, e.message)
    }
}

impl From<LlmError> for JobError {
    fn from(e: LlmError) -> Self {
        Self::new(&e.code, e.message)
    }
}

impl From<SelectionError> for JobError {
    fn from(e: SelectionError) -> Self {
        Self::new(&e.code, e.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    Completed { text: String, elapsed: Duration },
    Failed { error: JobError, elapsed: Duration },
    Cancelled,
}

impl TerminalEvent {
    pub fn status(&self) -> &'static str {
        match self {
            TerminalEvent::Completed { .. } => "completed",
            TerminalEvent::Failed { .. } => "failed",
            TerminalEvent::Cancelled => "cancelled",
        }
    }

    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            TerminalEvent::Completed { elapsed, .. } | TerminalEvent::Failed { elapsed, .. } => {
                Some(*elapsed)
            }
            TerminalEvent::Cancelled => None,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            TerminalEvent::Failed { error, .. } => Some(&error.code),
            TerminalEvent::Cancelled => Some("E_CANCELLED"),
            TerminalEvent::Completed { .. } => None,
        }
    }
}

/// Worker → UI thread messages. Fragment text never travels here; it goes
/// through the job's own buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    FirstFragment {
        job_id: String,
    },
    ErrorLatched {
        job_id: String,
    },
    Terminal {
        job_id: String,
        slot: SlotName,
        event: TerminalEvent,
    },
}

#[derive(Debug, Clone)]
pub enum JobInput {
    Image(CapturedImage),
    Text(String),
}

impl JobInput {
    pub fn kind(&self) -> &'static str {
        match self {
            JobInput::Image(_) => "image",
            JobInput::Text(_) => "text",
        }
    }
}

/// Keeps a job counted as live until the last clone is dropped. The runner
/// only treats a job as stopped once every holder is gone, so blocking work
/// that outlives the job's future keeps the slot occupied.
#[derive(Clone)]
pub struct JobLease(Arc<LeaseInner>);

struct LeaseInner {
    live: Arc<AtomicUsize>,
    _done: mpsc::Sender<()>,
}

impl JobLease {
    /// Counts one more live job in `live`. `done` disconnects when the lease
    /// is released, after the count has gone back down.
    pub fn new(live: Arc<AtomicUsize>, done: mpsc::Sender<()>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(Arc::new(LeaseInner { live, _done: done }))
    }
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        // Runs before the fields drop, so waiters on `done` see the new count.
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for JobLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLease")
            .field("holders", &Arc::strong_count(&self.0))
            .finish()
    }
}

/// Handed to every operation invocation.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub slot: SlotName,
    /// Cooperative cancel. Operations should observe it at every await point
    /// or poll it from blocking code.
    pub token: CancellationToken,
    /// Child process pid, killed by the runner if the job has to be forced.
    pub pid: PidSlot,
    pub data_dir: PathBuf,
    /// Move a clone into any work that can outlive the operation's future.
    pub lease: JobLease,
}

pub type SingleShotFn =
    dyn Fn(JobInput, JobContext) -> BoxFuture<'static, Result<String, JobError>> + Send + Sync;
pub type StreamingFn =
    dyn Fn(JobInput, JobContext) -> BoxStream<'static, Result<String, JobError>> + Send + Sync;

#[derive(Clone)]
pub enum Operation {
    /// Produces one final value.
    SingleShot(Arc<SingleShotFn>),
    /// Produces a lazy, finite, non-restartable sequence of fragments.
    Streaming(Arc<StreamingFn>),
}

impl Operation {
    pub fn single_shot<F, Fut>(f: F) -> Self
    where
        F: Fn(JobInput, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, JobError>> + Send + 'static,
    {
        Operation::SingleShot(Arc::new(move |input, ctx| f(input, ctx).boxed()))
    }

    pub fn streaming<F, S>(f: F) -> Self
    where
        F: Fn(JobInput, JobContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<String, JobError>> + Send + 'static,
    {
        Operation::Streaming(Arc::new(move |input, ctx| f(input, ctx).boxed()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::SingleShot(_) => "single_shot",
            Operation::Streaming(_) => "streaming",
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// One unit of background work. When `buffer` is set, the runner feeds every
/// produced fragment (or the single-shot result) into it.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub operation: Operation,
    pub input: JobInput,
    pub buffer: Option<SharedBuffer>,
}

impl Job {
    pub fn new(operation: Operation, input: JobInput) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation,
            input,
            buffer: None,
        }
    }

    pub fn with_buffer(mut self, buffer: SharedBuffer) -> Self {
        self.buffer = Some(buffer);
        self
    }
}
