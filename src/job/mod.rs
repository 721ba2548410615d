//! Client-side job engine.
//!
//! A job drives one or more workers through a command and reports what
//! happens as `JobEvent`s on the context's event channel. Every job ends with
//! exactly one terminal event: `Result`, or `Killed` when a parent tore it
//! down quietly.

pub mod copy;
pub mod dispatch;
pub mod entry;
pub mod list;
pub mod metadata;
pub mod scheduler;
pub mod simple;
pub mod stat;
pub mod transfer;

use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use url::Url;

use crate::config::ShuttleConfig;
use crate::error::{classify, code, ShuttleError};
pub use entry::{Entry, EntryKind};
pub use metadata::MetaData;
use scheduler::{Worker, WorkerSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Cross-cutting job state bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtraFlags(u8);

impl ExtraFlags {
    pub const KILL_REQUESTED: u8 = 1;
    pub const DATA_SENT: u8 = 2;
    pub const ASYNC_DATA: u8 = 4;
    pub const UNRESTRICTED: u8 = 8;

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn insert(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn remove(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

/// Error code and text a failed job reports, verbatim from the worker when
/// the worker was the one failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub code: i32,
    pub text: String,
}

impl JobFailure {
    pub fn canceled() -> Self {
        Self {
            code: code::ERR_USER_CANCELED,
            text: code::describe(code::ERR_USER_CANCELED).to_string(),
        }
    }

    pub fn from_error(err: &anyhow::Error) -> Self {
        match classify(err) {
            Some(ShuttleError::Worker { code, text }) => Self {
                code: *code,
                text: text.clone(),
            },
            Some(other) => Self {
                code: other.code(),
                text: other.to_string(),
            },
            None => Self {
                code: code::ERR_INTERNAL,
                text: format!("{err:#}"),
            },
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.text, code::describe(self.code))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Data { job: JobId, data: Vec<u8> },
    TotalSize { job: JobId, size: u64 },
    ProcessedSize { job: JobId, size: u64 },
    Speed { job: JobId, bytes_per_sec: u64 },
    Redirection { job: JobId, url: String },
    Entries { job: JobId, entries: Vec<Entry> },
    MimeType { job: JobId, mime: String },
    /// Torn down by its parent; no `Result` follows.
    Killed { job: JobId },
    Result { job: JobId, outcome: Result<(), JobFailure> },
}

impl JobEvent {
    pub fn job(&self) -> JobId {
        match self {
            JobEvent::Data { job, .. }
            | JobEvent::TotalSize { job, .. }
            | JobEvent::ProcessedSize { job, .. }
            | JobEvent::Speed { job, .. }
            | JobEvent::Redirection { job, .. }
            | JobEvent::Entries { job, .. }
            | JobEvent::MimeType { job, .. }
            | JobEvent::Killed { job }
            | JobEvent::Result { job, .. } => *job,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Killed { .. } | JobEvent::Result { .. })
    }
}

/// Shared by every job of one client: worker source, configuration and the
/// event channel.
#[derive(Clone)]
pub struct JobContext {
    pub workers: Arc<dyn WorkerSource>,
    pub config: Arc<ShuttleConfig>,
    events: mpsc::UnboundedSender<JobEvent>,
    next_id: Arc<AtomicU64>,
}

impl JobContext {
    pub fn new(workers: Arc<dyn WorkerSource>, config: Arc<ShuttleConfig>) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                workers,
                config,
                events: tx,
                next_id: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    fn next_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub async fn acquire(&self, url: &Url) -> Result<Worker> {
        self.workers.acquire(url).await
    }
}

/// Requests a kill of the job holding the matching `KillSignal`.
#[derive(Debug)]
pub struct KillSwitch(watch::Sender<bool>);

#[derive(Debug, Clone)]
pub struct KillSignal(watch::Receiver<bool>);

impl KillSwitch {
    pub fn pair() -> (Self, KillSignal) {
        let (tx, rx) = watch::channel(false);
        (Self(tx), KillSignal(rx))
    }

    pub fn kill(&self) {
        let _ = self.0.send(true);
    }
}

impl KillSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        KillSignal(rx)
    }

    pub fn is_killed(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes once a kill was requested. Never completes if the switch is
    /// dropped without firing.
    pub async fn killed(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// State every job kind carries.
pub struct JobCore {
    pub id: JobId,
    pub parent: Option<JobId>,
    pub flags: ExtraFlags,
    /// Sent to the worker ahead of the command.
    pub outgoing: MetaData,
    /// Received from the worker.
    pub incoming: MetaData,
    pub subjobs: Vec<JobId>,
    ctx: JobContext,
    concluded: bool,
}

impl JobCore {
    pub fn new(ctx: &JobContext, parent: Option<JobId>) -> Self {
        Self {
            id: ctx.next_id(),
            parent,
            flags: ExtraFlags::default(),
            outgoing: MetaData::new(),
            incoming: MetaData::new(),
            subjobs: Vec::new(),
            ctx: ctx.clone(),
            concluded: false,
        }
    }

    pub fn ctx(&self) -> &JobContext {
        &self.ctx
    }

    pub fn emit(&self, event: JobEvent) {
        self.ctx.emit(event);
    }

    pub fn is_concluded(&self) -> bool {
        self.concluded
    }

    /// Emit the terminal `Result`, once.
    pub fn conclude(&mut self, outcome: Result<(), JobFailure>) {
        if std::mem::replace(&mut self.concluded, true) {
            return;
        }
        debug!(job = %self.id, ?outcome, "job finished");
        self.ctx.emit(JobEvent::Result { job: self.id, outcome });
    }

    /// Emit the terminal `Killed`, once. Used for subjobs torn down by
    /// their parent.
    pub fn conclude_quietly(&mut self) {
        if std::mem::replace(&mut self.concluded, true) {
            return;
        }
        self.flags.insert(ExtraFlags::KILL_REQUESTED);
        debug!(job = %self.id, "job killed quietly");
        self.ctx.emit(JobEvent::Killed { job: self.id });
    }
}

/// A runnable job kind.
#[allow(async_fn_in_trait)]
pub trait Job {
    fn core(&mut self) -> &mut JobCore;

    /// Do the work. Cancelled by dropping when the job is killed.
    async fn execute(&mut self) -> Result<()>;

    /// Tear down after a kill: subjobs quietly, own workers discarded.
    fn abort(&mut self);
}

/// Run `job` to its terminal event, honouring `kill`.
pub async fn run_job<J: Job>(job: &mut J, kill: &mut KillSignal) -> Result<(), JobFailure> {
    let finished = tokio::select! {
        r = job.execute() => Some(r),
        _ = kill.killed() => None,
    };
    let outcome = match finished {
        Some(r) => r.map_err(|e| JobFailure::from_error(&e)),
        None => {
            job.core().flags.insert(ExtraFlags::KILL_REQUESTED);
            job.abort();
            Err(JobFailure::canceled())
        }
    };
    job.core().conclude(outcome.clone());
    outcome
}

/// A command-line target: a URL with a scheme, or a local path.
pub fn parse_target(s: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(s) {
        if url.scheme().len() > 1 {
            return Ok(url);
        }
    }
    let path = Path::new(s);
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Url::from_file_path(&abs).map_err(|_| anyhow!("not a usable path: {}", abs.display()))
}
