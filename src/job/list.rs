//! Directory listings, flat or recursive.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use tracing::{debug, warn};
use url::Url;

use super::dispatch::{WorkerCommand, WorkerEvent};
use super::simple::SimpleJob;
use super::{Entry, EntryKind, ExtraFlags, Job, JobContext, JobCore, JobEvent, JobId};
use crate::error::{classify, ShuttleError};

pub struct ListJob {
    inner: SimpleJob,
    recursive: bool,
    /// Directories still to list, with the name prefix their entries get.
    pending: VecDeque<(Url, String)>,
    listed: usize,
}

/// `base` with `name` appended as one more path segment.
pub fn child_url(base: &Url, name: &str) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("{base} cannot hold children"))?
        .pop_if_empty()
        .push(name);
    Ok(url)
}

impl ListJob {
    pub fn new(ctx: &JobContext, url: Url, parent: Option<JobId>) -> Self {
        let command = WorkerCommand::ListDir { url: url.to_string() };
        let mut inner = SimpleJob::new(ctx, url, command, parent);
        inner.set_keep_worker(true);
        Self {
            inner,
            recursive: false,
            pending: VecDeque::new(),
            listed: 0,
        }
    }

    pub fn recursive(ctx: &JobContext, url: Url, parent: Option<JobId>) -> Self {
        let mut job = Self::new(ctx, url, parent);
        job.recursive = true;
        job
    }

    /// Report (and descend into) dot entries too.
    pub fn include_hidden(mut self, on: bool) -> Self {
        let flags = &mut self.inner.core_mut().flags;
        if on {
            flags.insert(ExtraFlags::UNRESTRICTED);
        } else {
            flags.remove(ExtraFlags::UNRESTRICTED);
        }
        self
    }

    pub fn id(&self) -> JobId {
        self.inner.id()
    }

    /// Entries reported so far.
    pub fn listed(&self) -> usize {
        self.listed
    }

    fn take_batch(&mut self, dir: &Url, prefix: &str, entries: Vec<Entry>) -> Result<Vec<Entry>> {
        let unrestricted = self.inner.core_mut().flags.contains(ExtraFlags::UNRESTRICTED);
        let mut out = Vec::with_capacity(entries.len());
        for mut entry in entries {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            if entry.is_hidden() && !unrestricted {
                continue;
            }
            if self.recursive && entry.kind == EntryKind::Dir {
                let sub = child_url(dir, &entry.name)?;
                self.pending.push_back((sub, format!("{prefix}{}/", entry.name)));
            }
            if !prefix.is_empty() {
                entry.name = format!("{prefix}{}", entry.name);
            }
            out.push(entry);
        }
        Ok(out)
    }

    /// Drain one listing. Errors below the top directory are skipped.
    async fn list_one(&mut self, dir: Url, prefix: String) -> Result<()> {
        loop {
            let event = match self.inner.next_event().await {
                Ok(event) => event,
                Err(e) if !prefix.is_empty() && matches!(classify(&e), Some(ShuttleError::Worker { .. })) => {
                    warn!(job = %self.id(), %dir, "skipping: {e:#}");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            match event {
                Some(WorkerEvent::ListEntries(entries)) => {
                    let batch = self.take_batch(&dir, &prefix, entries)?;
                    if !batch.is_empty() {
                        self.listed += batch.len();
                        let job = self.id();
                        self.inner.core_mut().emit(JobEvent::Entries { job, entries: batch });
                    }
                }
                Some(_) => {}
                None => return Ok(()),
            }
        }
    }

    async fn run(&mut self) -> Result<()> {
        self.inner.start().await?;
        let root = self.inner.url().clone();
        self.list_one(root, String::new()).await?;
        while let Some((dir, prefix)) = self.pending.pop_front() {
            debug!(job = %self.id(), %dir, "listing subdirectory");
            self.inner
                .restart(dir.clone(), WorkerCommand::ListDir { url: dir.to_string() })
                .await?;
            self.list_one(dir, prefix).await?;
        }
        Ok(())
    }
}

impl Job for ListJob {
    fn core(&mut self) -> &mut JobCore {
        self.inner.core_mut()
    }

    async fn execute(&mut self) -> Result<()> {
        let outcome = self.run().await;
        match &outcome {
            Ok(()) => self.inner.release_worker(),
            Err(e) => self.inner.drop_worker_after(e),
        }
        outcome
    }

    fn abort(&mut self) {
        self.inner.discard_worker();
    }
}
