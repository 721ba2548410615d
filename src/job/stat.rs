use anyhow::{anyhow, Result};
use url::Url;

use super::dispatch::{WorkerCommand, WorkerEvent};
use super::simple::SimpleJob;
use super::{Entry, Job, JobContext, JobCore, JobId};

/// Which end of a transfer a stat is for; some workers answer differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatSide {
    Source,
    Destination,
}

/// Stat one URL.
pub struct StatJob {
    inner: SimpleJob,
    entry: Option<Entry>,
}

impl StatJob {
    pub fn new(ctx: &JobContext, url: Url, parent: Option<JobId>) -> Self {
        let command = WorkerCommand::Stat { url: url.to_string() };
        Self {
            inner: SimpleJob::new(ctx, url, command, parent),
            entry: None,
        }
    }

    pub fn side(mut self, side: StatSide) -> Self {
        let value = match side {
            StatSide::Source => "source",
            StatSide::Destination => "dest",
        };
        self.inner.metadata_mut().insert("statSide", value);
        self
    }

    pub fn id(&self) -> JobId {
        self.inner.id()
    }

    /// The entry, once the job succeeded.
    pub fn entry(&self) -> Option<&Entry> {
        self.entry.as_ref()
    }

    pub fn into_entry(self) -> Option<Entry> {
        self.entry
    }
}

impl Job for StatJob {
    fn core(&mut self) -> &mut JobCore {
        self.inner.core_mut()
    }

    async fn execute(&mut self) -> Result<()> {
        self.inner.start().await?;
        loop {
            match self.inner.next_event().await {
                Ok(Some(WorkerEvent::StatEntry(entry))) => self.entry = Some(entry),
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    self.inner.drop_worker_after(&e);
                    return Err(e);
                }
            }
        }
        if self.entry.is_none() {
            return Err(anyhow!("{} finished without a stat entry", self.inner.url()));
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.inner.discard_worker();
    }
}
