//! Where jobs get their workers from.
//!
//! `LauncherScheduler` asks the launcher daemon for a worker (pooled or
//! freshly started) that connects back to a one-off socket. `InProcessWorkers`
//! runs protocol implementations on threads of the current process instead.
//! It only backs the CLI's `--direct` mode and tests.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tracing::{debug, warn};
use url::Url;

use super::dispatch::WorkerCommand;
use crate::config::ShuttleConfig;
use crate::connection::Connection;
use crate::launcher::LauncherClient;
use crate::protocol::timeouts::WORKER_CONNECT_MS;
use crate::protocol_core::ensure_parent_exists;
use crate::worker::{Protocol, WorkerBase};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A worker attached to one job.
pub struct Worker {
    /// 0 for workers without a process of their own.
    pub pid: i32,
    pub protocol: String,
    pub conn: Connection,
}

impl Worker {
    pub fn in_process(protocol: &str, conn: Connection) -> Self {
        Self {
            pid: 0,
            protocol: protocol.to_string(),
            conn,
        }
    }
}

pub trait WorkerSource: Send + Sync {
    /// A worker able to serve `url`.
    fn acquire<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Worker>>;
    /// The job is done with a healthy worker.
    fn release(&self, worker: Worker);
    /// The worker is in an unknown state (job killed mid-command).
    fn discard(&self, worker: Worker);
    /// Park `worker` for `url` so the next job for exactly that URL gets it
    /// back. Sources without a pool just let it go.
    fn hold<'a>(&'a self, worker: Worker, url: &'a Url) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.release(worker);
            debug!(%url, "no pool to hold the worker in");
            Ok(())
        })
    }
}

/// Ask the worker to go on hold and wait for it to hang up, which it does
/// once the command in progress is over.
async fn send_on_hold(worker: &mut Worker, url: &Url) -> Result<()> {
    let frame = WorkerCommand::Hold { url: url.to_string() }.encode();
    worker.conn.send(frame.cmd, frame.payload).await?;
    worker.conn.resume();
    let drained = tokio::time::timeout(Duration::from_millis(WORKER_CONNECT_MS), async {
        while worker.conn.read().await.is_ok() {}
    })
    .await;
    if drained.is_err() {
        bail!("worker {} did not let go of the job within {WORKER_CONNECT_MS} ms", worker.pid);
    }
    Ok(())
}

/// Workers provided by the launcher daemon.
pub struct LauncherScheduler {
    config: Arc<ShuttleConfig>,
    launcher_socket: PathBuf,
    held: Mutex<Option<String>>,
}

impl LauncherScheduler {
    pub fn new(config: Arc<ShuttleConfig>) -> Self {
        Self {
            launcher_socket: config.launcher_socket(),
            config,
            held: Mutex::new(None),
        }
    }

    /// Talk to the daemon listening on `path` instead of the session default.
    pub fn with_launcher_socket(mut self, path: PathBuf) -> Self {
        self.launcher_socket = path;
        self
    }

    async fn hold_inner(&self, mut worker: Worker, url: &Url) -> Result<()> {
        send_on_hold(&mut worker, url).await?;
        *self.held.lock() = Some(url.to_string());
        debug!(pid = worker.pid, %url, "worker put on hold");
        Ok(())
    }

    async fn acquire_inner(&self, url: &Url) -> Result<Worker> {
        let app_socket = self.config.app_socket();
        ensure_parent_exists(&app_socket)?;
        let listener = UnixListener::bind(&app_socket)
            .with_context(|| format!("binding {}", app_socket.display()))?;
        let result = self.connect_worker(url, &listener, &app_socket).await;
        let _ = std::fs::remove_file(&app_socket);
        result
    }

    async fn connect_worker(&self, url: &Url, listener: &UnixListener, app_socket: &std::path::Path) -> Result<Worker> {
        let mut client = LauncherClient::connect(&self.launcher_socket)
            .await
            .context("launcher daemon not reachable")?;
        let held = self.held.lock().take();
        let mut pid = None;
        if held.as_deref() == Some(url.as_str()) {
            pid = client.request_hold_worker(url.as_str(), app_socket).await?;
        }
        let pid = match pid {
            Some(pid) => pid,
            None => client.request_worker(url.scheme(), url.host_str().unwrap_or(""), app_socket).await?,
        };
        let (stream, _) = tokio::time::timeout(Duration::from_millis(WORKER_CONNECT_MS), listener.accept())
            .await
            .map_err(|_| anyhow!("worker {pid} did not connect within {WORKER_CONNECT_MS} ms"))??;
        debug!(pid, protocol = url.scheme(), "worker connected");
        Ok(Worker {
            pid,
            protocol: url.scheme().to_string(),
            conn: Connection::new(stream),
        })
    }
}

impl WorkerSource for LauncherScheduler {
    fn acquire<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Worker>> {
        Box::pin(self.acquire_inner(url))
    }

    // Closing the connection sends the worker back to the pool.
    fn release(&self, worker: Worker) {
        debug!(pid = worker.pid, "worker released");
    }

    fn discard(&self, worker: Worker) {
        if worker.pid > 0 {
            debug!(pid = worker.pid, "terminating worker");
            unsafe { libc::kill(worker.pid, libc::SIGTERM) };
        }
    }

    fn hold<'a>(&'a self, worker: Worker, url: &'a Url) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.hold_inner(worker, url))
    }
}

pub type ProtocolFactory = Arc<dyn Fn() -> Box<dyn Protocol + Send> + Send + Sync>;

/// Protocol implementations served from threads of this process.
///
/// Only for `shuttle --direct` and tests: real sessions run every worker as
/// its own process started by the launcher.
#[derive(Default, Clone)]
pub struct InProcessWorkers {
    factories: HashMap<String, ProtocolFactory>,
}

impl InProcessWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheme: &str, factory: ProtocolFactory) {
        self.factories.insert(scheme.to_string(), factory);
    }

    fn spawn(&self, scheme: &str) -> Result<Worker> {
        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| anyhow!("no in-process worker for protocol {scheme}"))?;
        let (ours, theirs) = std::os::unix::net::UnixStream::pair()?;
        let mut base = WorkerBase::new(scheme, factory());
        let name = format!("worker-{scheme}");
        std::thread::Builder::new().name(name).spawn(move || {
            let mut stream = theirs;
            if let Err(e) = base.serve_once(&mut stream) {
                warn!("in-process worker stopped: {e:#}");
            }
        })?;
        ours.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(ours)?;
        Ok(Worker::in_process(scheme, Connection::new(stream)))
    }
}

impl WorkerSource for InProcessWorkers {
    fn acquire<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Worker>> {
        Box::pin(async move { self.spawn(url.scheme()) })
    }

    fn release(&self, _worker: Worker) {}

    fn discard(&self, _worker: Worker) {}
}
