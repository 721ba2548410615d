//! Idle worker pool.
//!
//! Workers that finished their job connect to the pool socket and announce
//! themselves with `MSG_SLAVE_STATUS`. The pool hands them out again to the
//! next job asking for the same protocol.

use anyhow::Result;
use std::time::{Duration, Instant};

use crate::protocol_core::{PayloadReader, PayloadWriter};

/// What a worker reports about itself when it parks in the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub pid: i32,
    pub protocol: String,
    pub host: String,
    pub connected: bool,
    pub hold_url: Option<String>,
}

impl WorkerStatus {
    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_i32(self.pid)
            .put_str(&self.protocol)
            .put_str(&self.host)
            .put_bool(self.connected)
            .put_opt_str(self.hold_url.as_deref())
            .finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let status = Self {
            pid: r.get_i32()?,
            protocol: r.get_str()?,
            host: r.get_str()?,
            connected: r.get_bool()?,
            hold_url: r.get_opt_str()?,
        };
        r.finish()?;
        Ok(status)
    }
}

#[derive(Debug)]
pub struct IdleWorker<T> {
    pub status: WorkerStatus,
    pub since: Instant,
    pub link: T,
}

impl<T> IdleWorker<T> {
    pub fn new(status: WorkerStatus, link: T) -> Self {
        Self {
            status,
            since: Instant::now(),
            link,
        }
    }

    pub fn pid(&self) -> i32 {
        self.status.pid
    }

    pub fn on_hold(&self) -> bool {
        self.status.hold_url.is_some()
    }

    /// An empty `host` accepts a worker for any host.
    pub fn matches(&self, protocol: &str, host: &str, need_connected: bool) -> bool {
        if self.on_hold() || self.status.protocol != protocol {
            return false;
        }
        if host.is_empty() {
            return true;
        }
        if self.status.host != host {
            return false;
        }
        !need_connected || self.status.connected
    }
}

pub struct IdlePool<T> {
    workers: Vec<IdleWorker<T>>,
    idle_ceiling: Duration,
    keep_warm: String,
}

impl<T> IdlePool<T> {
    pub fn new(idle_ceiling: Duration, keep_warm: &str) -> Self {
        Self {
            workers: Vec::new(),
            idle_ceiling,
            keep_warm: keep_warm.to_string(),
        }
    }

    pub fn insert(&mut self, worker: IdleWorker<T>) {
        self.workers.push(worker);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn contains_pid(&self, pid: i32) -> bool {
        self.workers.iter().any(|w| w.pid() == pid)
    }

    pub fn remove_pid(&mut self, pid: i32) -> Option<IdleWorker<T>> {
        let idx = self.workers.iter().position(|w| w.pid() == pid)?;
        Some(self.workers.remove(idx))
    }

    pub fn find_mut<F: Fn(&IdleWorker<T>) -> bool>(&mut self, pred: F) -> Option<&mut IdleWorker<T>> {
        self.workers.iter_mut().find(|w| pred(w))
    }

    pub fn remove_where<F: Fn(&IdleWorker<T>) -> bool>(&mut self, pred: F) -> Option<IdleWorker<T>> {
        let idx = self.workers.iter().position(pred)?;
        Some(self.workers.remove(idx))
    }

    /// Remove and return the best worker for `protocol`/`host`. Passes, from
    /// strict to loose: same host and connected, same host, any host.
    pub fn take_match(&mut self, protocol: &str, host: &str) -> Option<IdleWorker<T>> {
        let passes = [(host, true), (host, false), ("", false)];
        for (h, need_connected) in passes {
            if let Some(idx) = self.workers.iter().position(|w| w.matches(protocol, h, need_connected)) {
                return Some(self.workers.remove(idx));
            }
        }
        None
    }

    /// Remove the worker parked for exactly `url`.
    pub fn take_held(&mut self, url: &str) -> Option<IdleWorker<T>> {
        let idx = self
            .workers
            .iter()
            .position(|w| w.status.hold_url.as_deref() == Some(url))?;
        Some(self.workers.remove(idx))
    }

    /// Evict workers idle longer than the ceiling. The oldest worker of the
    /// keep-warm protocol stays regardless of age.
    pub fn sweep(&mut self, now: Instant) -> Vec<IdleWorker<T>> {
        let warm_pid = self
            .workers
            .iter()
            .find(|w| w.status.protocol == self.keep_warm && !w.on_hold())
            .map(|w| w.pid());
        let ceiling = self.idle_ceiling;
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.workers)
            .into_iter()
            .partition(|w| Some(w.pid()) != warm_pid && now.saturating_duration_since(w.since) > ceiling);
        self.workers = kept;
        expired
    }
}
