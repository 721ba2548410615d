//! Get and put jobs: a command plus a data stream in either direction.

use anyhow::{anyhow, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};
use url::Url;

use super::dispatch::{Dispatcher, WorkerCommand, WorkerEvent};
use super::{ExtraFlags, Job, JobContext, JobCore, JobEvent, JobFailure, JobId, MetaData};
use crate::error::ShuttleError;
use crate::protocol::CHUNK_SIZE;

/// A URL may show up this many times in the redirection history; one more
/// visit fails the job.
pub const MAX_REDIRECT_REPEATS: usize = 5;

/// What a transfer job surfaces to whoever drives it step by step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStep {
    /// Read side produced a chunk; empty means end of data.
    Data(Vec<u8>),
    /// Write side wants the next chunk.
    DataRequest,
    /// Write side found this many bytes already in place and asks whether to
    /// continue after them. Needs `answer_resume` when non-zero.
    CanResume(u64),
    /// Read side started at the requested offset.
    ResumeGranted,
    MimeType(String),
    Finished,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    pub overwrite: bool,
    pub resume: bool,
    pub permissions: Option<u32>,
}

pub struct TransferJob {
    core: JobCore,
    url: Url,
    command: WorkerCommand,
    dispatcher: Option<Dispatcher>,
    redirections: Vec<Url>,
    pending_redirect: Option<Url>,
    handle_redirection: bool,
    received: u64,
    source: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

impl TransferJob {
    fn new(ctx: &JobContext, url: Url, command: WorkerCommand, parent: Option<JobId>) -> Self {
        Self {
            core: JobCore::new(ctx, parent),
            url,
            command,
            dispatcher: None,
            redirections: Vec::new(),
            pending_redirect: None,
            handle_redirection: true,
            received: 0,
            source: None,
        }
    }

    pub fn get(ctx: &JobContext, url: Url, parent: Option<JobId>) -> Self {
        let command = WorkerCommand::Get { url: url.to_string() };
        Self::new(ctx, url, command, parent)
    }

    /// Read starting at `offset`; the worker confirms with `ResumeGranted`.
    pub fn get_from(ctx: &JobContext, url: Url, offset: u64, parent: Option<JobId>) -> Self {
        let mut job = Self::get(ctx, url, parent);
        if offset > 0 {
            job.core.outgoing.insert("resume", offset.to_string());
        }
        job
    }

    pub fn put(ctx: &JobContext, url: Url, opts: PutOptions, parent: Option<JobId>) -> Self {
        let command = WorkerCommand::Put {
            url: url.to_string(),
            permissions: opts.permissions,
            overwrite: opts.overwrite,
            resume: opts.resume,
        };
        Self::new(ctx, url, command, parent)
    }

    /// Feed a put job from `source` when run on its own.
    pub fn with_source<R: AsyncRead + Send + Unpin + 'static>(mut self, source: R) -> Self {
        self.source = Some(Box::new(source));
        self.core.flags.insert(ExtraFlags::ASYNC_DATA);
        self
    }

    pub fn set_handle_redirection(&mut self, on: bool) {
        self.handle_redirection = on;
    }

    pub fn id(&self) -> JobId {
        self.core.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn metadata_mut(&mut self) -> &mut MetaData {
        &mut self.core.outgoing
    }

    pub fn incoming(&self) -> &MetaData {
        &self.core.incoming
    }

    pub fn data_sent(&self) -> bool {
        self.core.flags.contains(ExtraFlags::DATA_SENT)
    }

    pub async fn start(&mut self) -> Result<()> {
        let worker = self.core.ctx().acquire(&self.url).await?;
        let mut d = Dispatcher::new(worker);
        if let Some(host) = self.url.host_str() {
            d.send(&WorkerCommand::Host {
                host: host.to_string(),
                port: self.url.port().unwrap_or(0),
                user: self.url.username().to_string(),
            })
            .await?;
        }
        if !self.core.outgoing.is_empty() {
            d.send(&WorkerCommand::MetaData(self.core.outgoing.clone())).await?;
        }
        d.send(&self.command).await?;
        debug!(job = %self.core.id, cmd = self.command.name(), url = %self.url, pid = d.worker().pid, "transfer started");
        self.dispatcher = Some(d);
        Ok(())
    }

    fn dispatcher(&mut self) -> Result<&mut Dispatcher> {
        let id = self.core.id;
        self.dispatcher
            .as_mut()
            .ok_or_else(|| anyhow!("transfer job {id} has no worker"))
    }

    /// Next event that needs the driver's attention. Progress, metadata and
    /// redirections are dealt with here. A failure concludes the job.
    pub async fn next_step(&mut self) -> Result<TransferStep> {
        match self.step().await {
            Ok(step) => Ok(step),
            Err(e) => {
                if let Some(d) = self.dispatcher.take() {
                    let worker = d.into_worker();
                    match crate::error::classify(&e) {
                        Some(ShuttleError::Worker { .. }) => self.core.ctx().workers.release(worker),
                        _ => self.core.ctx().workers.discard(worker),
                    }
                }
                self.core.conclude(Err(JobFailure::from_error(&e)));
                Err(e)
            }
        }
    }

    async fn step(&mut self) -> Result<TransferStep> {
        loop {
            let id = self.core.id;
            let event = self.dispatcher()?.next_event().await?;
            match event {
                WorkerEvent::Data(data) => {
                    self.received += data.len() as u64;
                    return Ok(TransferStep::Data(data));
                }
                WorkerEvent::DataRequest => return Ok(TransferStep::DataRequest),
                WorkerEvent::CanResume(offset) => return Ok(TransferStep::CanResume(offset)),
                WorkerEvent::ResumeGranted => return Ok(TransferStep::ResumeGranted),
                WorkerEvent::MimeType(mime) => {
                    self.core.emit(JobEvent::MimeType { job: id, mime: mime.clone() });
                    return Ok(TransferStep::MimeType(mime));
                }
                WorkerEvent::TotalSize(size) => self.core.emit(JobEvent::TotalSize { job: id, size }),
                WorkerEvent::ProcessedSize(size) => self.core.emit(JobEvent::ProcessedSize { job: id, size }),
                WorkerEvent::Speed(bytes_per_sec) => self.core.emit(JobEvent::Speed { job: id, bytes_per_sec }),
                WorkerEvent::MetaData(md) => self.core.incoming.merge(md),
                WorkerEvent::Redirection(target) => {
                    let next = self.url.join(&target).map_err(|e| anyhow!("bad redirection {target:?}: {e}"))?;
                    self.core.emit(JobEvent::Redirection { job: id, url: next.to_string() });
                    if self.handle_redirection {
                        self.pending_redirect = Some(next);
                    }
                }
                WorkerEvent::Finished => {
                    if let Some(next) = self.pending_redirect.take() {
                        self.follow(next).await?;
                        continue;
                    }
                    self.release_worker();
                    self.core.conclude(Ok(()));
                    return Ok(TransferStep::Finished);
                }
                WorkerEvent::Error { code, text } => {
                    return Err(ShuttleError::Worker { code, text }.into());
                }
                WorkerEvent::Warning(text) => warn!(job = %id, "{text}"),
                other @ (WorkerEvent::Connected | WorkerEvent::StatEntry(_) | WorkerEvent::ListEntries(_)) => {
                    debug!(job = %id, ?other, "ignored in a transfer");
                }
            }
        }
    }

    async fn follow(&mut self, next: Url) -> Result<()> {
        let seen = self.redirections.iter().filter(|u| **u == next).count();
        if seen >= MAX_REDIRECT_REPEATS {
            return Err(ShuttleError::CyclicRedirection(next.to_string()).into());
        }
        debug!(job = %self.core.id, from = %self.url, to = %next, "following redirection");
        self.redirections.push(next.clone());
        self.release_worker();
        self.command = self.command.retarget(next.as_str());
        self.url = next;
        self.core.outgoing.insert("cache", "refresh");
        self.start().await
    }

    pub async fn send_data(&mut self, data: Vec<u8>) -> Result<()> {
        self.dispatcher()?.send_data(data).await?;
        self.core.flags.insert(ExtraFlags::DATA_SENT);
        Ok(())
    }

    /// Queue a metadata update for the worker, ahead of the next data.
    pub async fn send_metadata(&mut self, md: MetaData) -> Result<()> {
        self.dispatcher()?.send(&WorkerCommand::MetaData(md)).await
    }

    pub async fn answer_resume(&mut self, accept: bool) -> Result<()> {
        let answer = if accept { WorkerCommand::ResumeAnswer } else { WorkerCommand::None };
        self.dispatcher()?.send_now(&answer).await
    }

    pub fn suspend(&mut self) {
        if let Some(d) = self.dispatcher.as_mut() {
            d.suspend();
        }
    }

    pub fn resume(&mut self) {
        if let Some(d) = self.dispatcher.as_mut() {
            d.resume();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.dispatcher.as_ref().is_some_and(|d| d.is_suspended())
    }

    fn release_worker(&mut self) {
        if let Some(d) = self.dispatcher.take() {
            self.core.ctx().workers.release(d.into_worker());
        }
    }

    /// Hand the worker back to the pool reserved for this URL and end the job
    /// quietly. Whoever asks for the same URL next (typically the program
    /// the content was handed to) picks up the same worker.
    pub async fn put_on_hold(&mut self) -> Result<()> {
        let id = self.core.id;
        let d = self
            .dispatcher
            .take()
            .ok_or_else(|| anyhow!("transfer job {id} has no worker to hold"))?;
        let url = self.url.clone();
        let outcome = self.core.ctx().workers.hold(d.into_worker(), &url).await;
        if let Err(e) = &outcome {
            warn!(job = %id, %url, "could not put worker on hold: {e:#}");
        }
        self.core.conclude_quietly();
        outcome
    }

    /// Torn down by the parent: drop the worker, report `Killed`.
    pub fn kill_quietly(&mut self) {
        if let Some(d) = self.dispatcher.take() {
            self.core.ctx().workers.discard(d.into_worker());
        }
        self.core.conclude_quietly();
    }

    pub fn is_concluded(&self) -> bool {
        self.core.is_concluded()
    }

    async fn read_source(&mut self) -> Result<Vec<u8>> {
        let Some(source) = self.source.as_mut() else {
            return Ok(Vec::new());
        };
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = source.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }
}

impl Job for TransferJob {
    fn core(&mut self) -> &mut JobCore {
        &mut self.core
    }

    async fn execute(&mut self) -> Result<()> {
        self.start().await?;
        loop {
            match self.next_step().await? {
                TransferStep::Data(data) => {
                    if !data.is_empty() {
                        let job = self.core.id;
                        self.core.emit(JobEvent::Data { job, data });
                    }
                }
                TransferStep::DataRequest => {
                    let chunk = if self.core.flags.contains(ExtraFlags::ASYNC_DATA) {
                        self.read_source().await?
                    } else {
                        Vec::new()
                    };
                    self.send_data(chunk).await?;
                }
                // a stream cannot skip ahead, start over
                TransferStep::CanResume(offset) if offset > 0 => self.answer_resume(false).await?,
                TransferStep::CanResume(_) | TransferStep::ResumeGranted | TransferStep::MimeType(_) => {}
                TransferStep::Finished => {
                    debug!(job = %self.core.id, bytes = self.received, "transfer done");
                    return Ok(());
                }
            }
        }
    }

    fn abort(&mut self) {
        if let Some(d) = self.dispatcher.take() {
            self.core.ctx().workers.discard(d.into_worker());
        }
    }
}
