//! One command, no data stream: mkdir, del, chmod, special, mimetype and the
//! single-worker rename and copy a copy job tries first.
//!
//! `SimpleJob` is also the worker handling StatJob and ListJob build on.

use anyhow::{anyhow, Result};
use tracing::{debug, warn};
use url::Url;

use super::dispatch::{Dispatcher, WorkerCommand, WorkerEvent};
use super::{Job, JobContext, JobCore, JobEvent, JobId, MetaData};
use crate::error::ShuttleError;
use crate::job::transfer::MAX_REDIRECT_REPEATS;

pub struct SimpleJob {
    core: JobCore,
    url: Url,
    command: WorkerCommand,
    dispatcher: Option<Dispatcher>,
    redirections: Vec<Url>,
    pending_redirect: Option<Url>,
    keep_worker: bool,
    mime_type: Option<String>,
}

impl SimpleJob {
    /// `url` picks the worker; `command` is what it is asked to do.
    pub fn new(ctx: &JobContext, url: Url, command: WorkerCommand, parent: Option<JobId>) -> Self {
        Self {
            core: JobCore::new(ctx, parent),
            url,
            command,
            dispatcher: None,
            redirections: Vec::new(),
            pending_redirect: None,
            keep_worker: false,
            mime_type: None,
        }
    }

    pub fn mkdir(ctx: &JobContext, url: Url, permissions: Option<u32>) -> Self {
        let command = WorkerCommand::Mkdir { url: url.to_string(), permissions };
        Self::new(ctx, url, command, None)
    }

    pub fn del(ctx: &JobContext, url: Url, is_file: bool) -> Self {
        let command = WorkerCommand::Del { url: url.to_string(), is_file };
        Self::new(ctx, url, command, None)
    }

    /// Delete a directory tree; the worker removes the contents itself.
    pub fn del_recursive(ctx: &JobContext, url: Url) -> Self {
        let mut job = Self::del(ctx, url, false);
        job.core.outgoing.insert("recurse", "true");
        job
    }

    pub fn chmod(ctx: &JobContext, url: Url, permissions: u32) -> Self {
        let command = WorkerCommand::Chmod { url: url.to_string(), permissions };
        Self::new(ctx, url, command, None)
    }

    pub fn special(ctx: &JobContext, url: Url, data: Vec<u8>) -> Self {
        Self::new(ctx, url, WorkerCommand::Special { data }, None)
    }

    pub fn mimetype(ctx: &JobContext, url: Url) -> Self {
        let command = WorkerCommand::Mimetype { url: url.to_string() };
        Self::new(ctx, url, command, None)
    }

    pub fn rename(ctx: &JobContext, worker_url: Url, src: &Url, dst: &Url, overwrite: bool) -> Self {
        let command = WorkerCommand::Rename {
            src: src.to_string(),
            dst: dst.to_string(),
            overwrite,
        };
        Self::new(ctx, worker_url, command, None)
    }

    pub fn copy(
        ctx: &JobContext,
        worker_url: Url,
        src: &Url,
        dst: &Url,
        permissions: Option<u32>,
        overwrite: bool,
    ) -> Self {
        let command = WorkerCommand::Copy {
            src: src.to_string(),
            dst: dst.to_string(),
            permissions,
            overwrite,
        };
        Self::new(ctx, worker_url, command, None)
    }

    pub fn with_parent(mut self, parent: JobId) -> Self {
        self.core.parent = Some(parent);
        self
    }

    pub fn id(&self) -> JobId {
        self.core.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn core_mut(&mut self) -> &mut JobCore {
        &mut self.core
    }

    pub fn metadata_mut(&mut self) -> &mut MetaData {
        &mut self.core.outgoing
    }

    pub fn incoming(&self) -> &MetaData {
        &self.core.incoming
    }

    /// Mime type reported by the worker, for mimetype jobs.
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// Keep the worker after `Finished` so `restart` can issue a follow-up.
    pub fn set_keep_worker(&mut self, keep: bool) {
        self.keep_worker = keep;
    }

    pub fn is_concluded(&self) -> bool {
        self.core.is_concluded()
    }

    pub async fn start(&mut self) -> Result<()> {
        let mut d = match self.dispatcher.take() {
            Some(d) => d,
            None => {
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
                d
            }
        };
        if !self.core.outgoing.is_empty() {
            d.send(&WorkerCommand::MetaData(self.core.outgoing.clone())).await?;
        }
        d.send(&self.command).await?;
        debug!(job = %self.core.id, cmd = self.command.name(), url = %self.url, "command sent");
        self.dispatcher = Some(d);
        Ok(())
    }

    /// Issue another command on the kept worker.
    pub async fn restart(&mut self, url: Url, command: WorkerCommand) -> Result<()> {
        self.url = url;
        self.command = command;
        self.redirections.clear();
        self.start().await
    }

    fn dispatcher(&mut self) -> Result<&mut Dispatcher> {
        let id = self.core.id;
        self.dispatcher
            .as_mut()
            .ok_or_else(|| anyhow!("job {id} has no worker"))
    }

    /// Next event the caller has to look at; `None` once the command
    /// finished. Progress, metadata and redirections are handled here.
    pub async fn next_event(&mut self) -> Result<Option<WorkerEvent>> {
        loop {
            let id = self.core.id;
            let event = self.dispatcher()?.next_event().await?;
            match event {
                WorkerEvent::TotalSize(size) => self.core.emit(JobEvent::TotalSize { job: id, size }),
                WorkerEvent::ProcessedSize(size) => self.core.emit(JobEvent::ProcessedSize { job: id, size }),
                WorkerEvent::Speed(bytes_per_sec) => self.core.emit(JobEvent::Speed { job: id, bytes_per_sec }),
                WorkerEvent::MetaData(md) => self.core.incoming.merge(md),
                WorkerEvent::Warning(text) => warn!(job = %id, "{text}"),
                WorkerEvent::Connected => {}
                WorkerEvent::MimeType(mime) => {
                    self.core.emit(JobEvent::MimeType { job: id, mime: mime.clone() });
                    self.mime_type = Some(mime.clone());
                    return Ok(Some(WorkerEvent::MimeType(mime)));
                }
                WorkerEvent::Redirection(target) => {
                    let next = self.url.join(&target).map_err(|e| anyhow!("bad redirection {target:?}: {e}"))?;
                    self.core.emit(JobEvent::Redirection { job: id, url: next.to_string() });
                    if self.command.retarget(next.as_str()) != self.command {
                        self.pending_redirect = Some(next);
                    }
                }
                WorkerEvent::Finished => {
                    if let Some(next) = self.pending_redirect.take() {
                        self.follow(next).await?;
                        continue;
                    }
                    if !self.keep_worker {
                        self.release_worker();
                    }
                    return Ok(None);
                }
                WorkerEvent::Error { code, text } => {
                    return Err(ShuttleError::Worker { code, text }.into());
                }
                other => return Ok(Some(other)),
            }
        }
    }

    async fn follow(&mut self, next: Url) -> Result<()> {
        let seen = self.redirections.iter().filter(|u| **u == next).count();
        if seen >= MAX_REDIRECT_REPEATS {
            return Err(ShuttleError::CyclicRedirection(next.to_string()).into());
        }
        self.redirections.push(next.clone());
        self.release_worker();
        self.command = self.command.retarget(next.as_str());
        self.url = next;
        self.core.outgoing.insert("cache", "refresh");
        self.start().await
    }

    pub fn release_worker(&mut self) {
        if let Some(d) = self.dispatcher.take() {
            self.core.ctx().workers.release(d.into_worker());
        }
    }

    pub fn discard_worker(&mut self) {
        if let Some(d) = self.dispatcher.take() {
            self.core.ctx().workers.discard(d.into_worker());
        }
    }

    /// A worker that reported an error is still usable; one that broke the
    /// protocol is not.
    pub fn drop_worker_after(&mut self, err: &anyhow::Error) {
        match crate::error::classify(err) {
            Some(ShuttleError::Worker { .. }) => self.release_worker(),
            _ => self.discard_worker(),
        }
    }

    pub fn kill_quietly(&mut self) {
        self.discard_worker();
        self.core.conclude_quietly();
    }
}

impl Job for SimpleJob {
    fn core(&mut self) -> &mut JobCore {
        &mut self.core
    }

    async fn execute(&mut self) -> Result<()> {
        self.start().await?;
        let outcome = async {
            while let Some(event) = self.next_event().await? {
                if !matches!(event, WorkerEvent::MimeType(_)) {
                    debug!(job = %self.core.id, ?event, "unexpected event");
                }
            }
            Ok(())
        }
        .await;
        if let Err(e) = &outcome {
            self.drop_worker_after(e);
        }
        outcome
    }

    fn abort(&mut self) {
        self.discard_worker();
    }
}
