//! Copy or move one file between any two URLs.
//!
//! Tried in order: a single worker serving both URLs (same scheme, host, port
//! and user), a protocol that can take or hand over a local file itself,
//! and finally a get worker pumping into a put worker. Only one of the two
//! pump sides is ever un-suspended and at most one chunk sits between them.

use anyhow::{anyhow, Result};
use tracing::debug;
use url::Url;

use super::simple::SimpleJob;
use super::transfer::{PutOptions, TransferJob, TransferStep};
use super::{run_job, Job, JobContext, JobCore, JobEvent, JobId, KillSignal, MetaData};
use crate::config::FILE_PROTOCOL;
use crate::error::{code, ShuttleError};

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    pub permissions: Option<u32>,
    pub overwrite: bool,
    pub resume: bool,
    /// Remove the source once the copy succeeded (or rename outright).
    pub is_move: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Get,
    Put,
}

/// State of a running pump.
#[derive(Debug, Default)]
struct Pump {
    /// Bytes the put side keeps from an earlier attempt.
    offset: u64,
    /// The put side waits for a resume answer.
    answer_due: bool,
    /// The get side started at `offset`.
    granted: bool,
    buffer: Option<Vec<u8>>,
    put_wants_data: bool,
    get_finished: bool,
    written: u64,
}

pub struct FileCopyJob {
    core: JobCore,
    src: Url,
    dst: Url,
    opts: CopyOptions,
    direct: Option<SimpleJob>,
    get: Option<TransferJob>,
    put: Option<TransferJob>,
}

/// One worker can address both URLs.
pub fn same_space(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port() == b.port()
        && a.username() == b.username()
}

impl FileCopyJob {
    pub fn new(ctx: &JobContext, src: Url, dst: Url, opts: CopyOptions) -> Self {
        Self {
            core: JobCore::new(ctx, None),
            src,
            dst,
            opts,
            direct: None,
            get: None,
            put: None,
        }
    }

    pub fn copy(ctx: &JobContext, src: Url, dst: Url, overwrite: bool) -> Self {
        Self::new(ctx, src, dst, CopyOptions { overwrite, ..CopyOptions::default() })
    }

    pub fn rename(ctx: &JobContext, src: Url, dst: Url, overwrite: bool) -> Self {
        Self::new(
            ctx,
            src,
            dst,
            CopyOptions {
                overwrite,
                is_move: true,
                ..CopyOptions::default()
            },
        )
    }

    pub fn id(&self) -> JobId {
        self.core.id
    }

    /// Worker URL for a cross-scheme shortcut, when one side is local and the
    /// other protocol offers it.
    fn shortcut_url(&self, rename: bool) -> Option<Url> {
        let config = &self.core.ctx().config;
        if self.src.scheme() == FILE_PROTOCOL {
            let info = config.protocol(self.dst.scheme())?;
            let offered = if rename { info.rename_from_file } else { info.copy_from_file };
            return offered.then(|| self.dst.clone());
        }
        if self.dst.scheme() == FILE_PROTOCOL {
            let info = config.protocol(self.src.scheme())?;
            let offered = if rename { info.rename_to_file } else { info.copy_to_file };
            return offered.then(|| self.src.clone());
        }
        None
    }

    /// Run a one-command copy or rename. `false` when the worker does not
    /// support it and the next method should be tried.
    async fn try_single(&mut self, worker_url: Url, rename: bool) -> Result<bool> {
        let ctx = self.core.ctx().clone();
        let job = if rename {
            SimpleJob::rename(&ctx, worker_url, &self.src, &self.dst, self.opts.overwrite)
        } else {
            SimpleJob::copy(&ctx, worker_url, &self.src, &self.dst, self.opts.permissions, self.opts.overwrite)
        };
        let job = job.with_parent(self.core.id);
        self.core.subjobs.push(job.id());
        let sub = self.direct.insert(job);
        let outcome = run_job(sub, &mut KillSignal::never()).await;
        self.direct = None;
        match outcome {
            Ok(()) => Ok(true),
            Err(f) if f.code == code::ERR_UNSUPPORTED_ACTION => {
                debug!(job = %self.core.id, rename, "single-worker method unsupported, falling back");
                Ok(false)
            }
            Err(f) => Err(ShuttleError::Worker { code: f.code, text: f.text }.into()),
        }
    }

    async fn delete_source(&mut self) -> Result<()> {
        let ctx = self.core.ctx().clone();
        let job = SimpleJob::del(&ctx, self.src.clone(), true).with_parent(self.core.id);
        self.core.subjobs.push(job.id());
        let sub = self.direct.insert(job);
        let outcome = run_job(sub, &mut KillSignal::never()).await;
        self.direct = None;
        outcome.map_err(|f| ShuttleError::Worker { code: f.code, text: f.text }.into())
    }

    fn check_pump_capable(&self) -> Result<()> {
        let config = &self.core.ctx().config;
        if config.protocol(self.src.scheme()).is_some_and(|p| !p.input) {
            return Err(ShuttleError::Worker {
                code: code::ERR_UNSUPPORTED_ACTION,
                text: format!("cannot read from {}", self.src.scheme()),
            }
            .into());
        }
        if config.protocol(self.dst.scheme()).is_some_and(|p| !p.output) {
            return Err(ShuttleError::Worker {
                code: code::ERR_UNSUPPORTED_ACTION,
                text: format!("cannot write to {}", self.dst.scheme()),
            }
            .into());
        }
        Ok(())
    }

    fn side(&mut self, side: Side) -> Result<&mut TransferJob> {
        let id = self.core.id;
        match side {
            Side::Get => self.get.as_mut(),
            Side::Put => self.put.as_mut(),
        }
        .ok_or_else(|| anyhow!("copy {id}: {side:?} side not running"))
    }

    fn switch_to(&mut self, side: Side) -> Result<Side> {
        let other = match side {
            Side::Get => Side::Put,
            Side::Put => Side::Get,
        };
        if let Ok(job) = self.side(other) {
            job.suspend();
        }
        self.side(side)?.resume();
        Ok(side)
    }

    async fn start_get(&mut self, offset: u64) -> Result<()> {
        let ctx = self.core.ctx().clone();
        let mut get = TransferJob::get_from(&ctx, self.src.clone(), offset, Some(self.core.id));
        self.core.subjobs.push(get.id());
        get.start().await?;
        self.get = Some(get);
        Ok(())
    }

    /// Hand the put side what it asked for, or go fetch it.
    async fn feed(&mut self, pump: &mut Pump) -> Result<Side> {
        if !pump.put_wants_data {
            return Ok(Side::Put);
        }
        if let Some(chunk) = pump.buffer.take() {
            pump.written += chunk.len() as u64;
            pump.put_wants_data = false;
            self.side(Side::Put)?.send_data(chunk).await?;
            let size = pump.offset + pump.written;
            self.core.emit(JobEvent::ProcessedSize { job: self.core.id, size });
            return Ok(Side::Put);
        }
        if pump.get_finished {
            pump.put_wants_data = false;
            self.side(Side::Put)?.send_data(Vec::new()).await?;
            return Ok(Side::Put);
        }
        self.switch_to(Side::Get)
    }

    async fn answer_resume(&mut self, pump: &mut Pump) -> Result<()> {
        if !pump.answer_due {
            return Ok(());
        }
        pump.answer_due = false;
        let granted = pump.granted;
        debug!(job = %self.core.id, offset = pump.offset, granted, "answering resume");
        self.side(Side::Put)?.answer_resume(granted).await?;
        if !granted {
            pump.offset = 0;
        }
        Ok(())
    }

    async fn pump(&mut self) -> Result<()> {
        self.check_pump_capable()?;
        let ctx = self.core.ctx().clone();
        let opts = PutOptions {
            overwrite: self.opts.overwrite,
            resume: self.opts.resume,
            permissions: self.opts.permissions,
        };
        let mut put = TransferJob::put(&ctx, self.dst.clone(), opts, Some(self.core.id));
        self.core.subjobs.push(put.id());
        put.start().await?;
        self.put = Some(put);

        let mut pump = Pump::default();
        let mut active = Side::Put;
        loop {
            let step = self.side(active)?.next_step().await?;
            active = match (active, step) {
                (Side::Put, TransferStep::CanResume(offset)) => {
                    if self.get.is_some() {
                        Side::Put
                    } else {
                        pump.offset = offset;
                        pump.answer_due = offset > 0;
                        self.start_get(offset).await?;
                        self.switch_to(Side::Get)?
                    }
                }
                (Side::Put, TransferStep::DataRequest) => {
                    pump.put_wants_data = true;
                    if self.get.is_none() {
                        self.start_get(0).await?;
                    }
                    self.feed(&mut pump).await?
                }
                (Side::Put, TransferStep::Finished) => {
                    if let Some(get) = self.get.as_mut().filter(|g| !g.is_concluded()) {
                        debug!(job = %self.core.id, "write side done before the read side, stopping it");
                        get.kill_quietly();
                    }
                    debug!(job = %self.core.id, bytes = pump.written, "pump done");
                    return Ok(());
                }
                (Side::Get, TransferStep::ResumeGranted) => {
                    pump.granted = true;
                    Side::Get
                }
                (Side::Get, TransferStep::Data(chunk)) if !chunk.is_empty() => {
                    if !self.side(Side::Put)?.data_sent() {
                        self.answer_resume(&mut pump).await?;
                        self.forward_metadata().await?;
                    }
                    pump.buffer = Some(chunk);
                    self.switch_to(Side::Put)?;
                    self.feed(&mut pump).await?
                }
                (Side::Get, TransferStep::Finished) => {
                    pump.get_finished = true;
                    self.answer_resume(&mut pump).await?;
                    self.side(Side::Put)?.resume();
                    self.feed(&mut pump).await?
                }
                (side, _) => side,
            };
        }
    }

    /// Pass the source's modification time on to the destination.
    async fn forward_metadata(&mut self) -> Result<()> {
        let modified = self
            .get
            .as_ref()
            .and_then(|g| g.incoming().get("modified").map(str::to_string));
        if let Some(modified) = modified {
            let mut md = MetaData::new();
            md.insert("modified", modified);
            self.side(Side::Put)?.send_metadata(md).await?;
        }
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let renames: &[bool] = if self.opts.is_move { &[true, false] } else { &[false] };
        for &rename in renames {
            let worker_url = if same_space(&self.src, &self.dst) {
                Some(self.src.clone())
            } else {
                self.shortcut_url(rename)
            };
            let Some(worker_url) = worker_url else { continue };
            if self.try_single(worker_url, rename).await? {
                if self.opts.is_move && !rename {
                    self.delete_source().await?;
                }
                return Ok(());
            }
        }
        self.pump().await?;
        if self.opts.is_move {
            self.delete_source().await?;
        }
        Ok(())
    }

    fn kill_subjobs(&mut self) {
        if let Some(job) = self.direct.as_mut() {
            job.kill_quietly();
        }
        for job in [self.get.as_mut(), self.put.as_mut()].into_iter().flatten() {
            if !job.is_concluded() {
                job.kill_quietly();
            }
        }
        self.direct = None;
        self.get = None;
        self.put = None;
    }
}

impl Job for FileCopyJob {
    fn core(&mut self) -> &mut JobCore {
        &mut self.core
    }

    async fn execute(&mut self) -> Result<()> {
        let outcome = self.run().await;
        if outcome.is_err() {
            self.kill_subjobs();
        }
        outcome
    }

    fn abort(&mut self) {
        self.kill_subjobs();
    }
}
