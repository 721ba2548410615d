//! Launcher daemon event loop.
//!
//! One task owns all state: the launch table, the name registry, the idle
//! pool and the spawner channel. Client connections run in their own tasks
//! and forward decoded requests here together with a reply handle.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::autostart::Autostart;
use super::control::{ControlReply, ControlRequest};
use super::names::{NameRegistry, OwnerId};
use super::pool::{IdlePool, IdleWorker, WorkerStatus};
use super::request::{LaunchKind, LaunchRequest, LaunchStatus, LaunchTable, Requester};
use super::services::ServiceTable;
use super::spawner_link::SpawnerLink;
use crate::config::{DebugSettings, ShuttleConfig};
use crate::connection::Connection;
use crate::error::{code, ShuttleError};
use crate::protocol::timeouts::STATUS_ANSWER_MS;
use crate::protocol::{command, message};
use crate::protocol_core::{ensure_parent_exists, Frame, PayloadWriter};
use crate::spawner::wire::{ExecMode, ExecRequest, SpawnCommand, SpawnReply};

/// Exit status of the daemon when the spawner channel breaks.
pub const EXIT_SPAWNER_LOST: i32 = 3;
/// Exit status when the configuration cannot be loaded.
pub const EXIT_CONFIG: i32 = 2;

type PoolKey = u64;

enum ClientEvent {
    Request {
        client: OwnerId,
        request: ControlRequest,
        reply: oneshot::Sender<ControlReply>,
    },
    Gone {
        client: OwnerId,
    },
}

struct Unannounced {
    conn: Connection,
    deadline: Instant,
}

/// Bind a Unix listener, replacing a stale socket file.
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    ensure_parent_exists(path)?;
    if path.exists() {
        std::fs::remove_file(path).with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))
}

/// Pick the spawner command that carries the optional fields in use.
pub fn exec_request(
    argv: Vec<String>,
    env: Vec<String>,
    cwd: Option<String>,
    startup_id: Option<String>,
    tty: Option<String>,
) -> ExecRequest {
    let mode = if tty.is_some() {
        ExecMode::Wrapper
    } else if cwd.is_some() {
        ExecMode::Shell
    } else if startup_id.is_some() {
        ExecMode::ExtExec
    } else {
        ExecMode::ExecNew
    };
    let mut req = ExecRequest::new(argv);
    req.mode = mode;
    req.env = env;
    req.cwd = cwd;
    req.startup_id = startup_id;
    req.tty = tty;
    req
}

pub struct Launcher {
    config: ShuttleConfig,
    debug: DebugSettings,
    services: ServiceTable,
    table: LaunchTable,
    names: NameRegistry,
    pool: IdlePool<(PoolKey, Connection)>,
    unannounced: HashMap<PoolKey, Unannounced>,
    worker_pids: HashMap<i32, String>,
    worker_waiters: HashMap<i32, Vec<oneshot::Sender<ControlReply>>>,
    autostart: Autostart,
    autostart_waiters: Vec<oneshot::Sender<ControlReply>>,
    spawner: SpawnerLink,
    pool_socket: PathBuf,
    next_key: PoolKey,
    stop: Option<i32>,
}

impl Launcher {
    pub fn new(config: ShuttleConfig, debug: DebugSettings, spawner: SpawnerLink, pool_socket: PathBuf) -> Self {
        Self {
            services: ServiceTable::new(config.services.clone()),
            pool: IdlePool::new(config.idle_ceiling(), &config.keep_warm_protocol),
            autostart: Autostart::new(config.autostart.clone()),
            config,
            debug,
            table: LaunchTable::new(),
            names: NameRegistry::new(),
            unannounced: HashMap::new(),
            worker_pids: HashMap::new(),
            worker_waiters: HashMap::new(),
            autostart_waiters: Vec::new(),
            spawner,
            pool_socket,
            next_key: 0,
            stop: None,
        }
    }

    /// Serve until `shutdown` resolves, a client terminates the daemon, or the
    /// spawner channel breaks. Returns the process exit status.
    pub async fn run<F>(mut self, control: UnixListener, pool: UnixListener, shutdown: F) -> Result<i32>
    where
        F: Future<Output = ()>,
    {
        let (client_tx, mut client_rx) = mpsc::channel::<ClientEvent>(64);
        let (pool_tx, mut pool_rx) = mpsc::channel::<(PoolKey, Result<Frame>)>(64);
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        let mut next_client: OwnerId = 0;

        info!(pool = %self.pool_socket.display(), "launcher ready");
        loop {
            if let Err(e) = self.dispatch().await {
                error!("spawner channel write failed: {e:#}");
                return Ok(EXIT_SPAWNER_LOST);
            }
            if let Some(status) = self.stop {
                // let client tasks flush their last reply
                tokio::time::sleep(Duration::from_millis(50)).await;
                return Ok(status);
            }
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    return Ok(0);
                }
                accepted = control.accept() => match accepted {
                    Ok((stream, _)) => {
                        next_client += 1;
                        tokio::spawn(serve_client(next_client, stream, client_tx.clone()));
                    }
                    Err(e) => warn!("control accept failed: {e}"),
                },
                Some(event) = client_rx.recv() => self.on_client(event).await,
                accepted = pool.accept() => match accepted {
                    Ok((stream, _)) => self.accept_worker(stream, &pool_tx).await,
                    Err(e) => warn!("pool accept failed: {e}"),
                },
                Some((key, item)) = pool_rx.recv() => self.on_pool_frame(key, item),
                reply = self.spawner.read() => match reply {
                    Ok(reply) => self.on_spawner(reply),
                    Err(e) => {
                        error!("spawner channel lost: {e:#}");
                        return Ok(EXIT_SPAWNER_LOST);
                    }
                },
                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }
    }

    async fn dispatch(&mut self) -> Result<()> {
        if let Some(dispatch) = self.table.next_dispatch() {
            debug!(id = dispatch.id.0, "dispatching to spawner");
            for command in &dispatch.commands {
                self.spawner.send(command).await?;
            }
        }
        Ok(())
    }

    fn on_spawner(&mut self, reply: SpawnReply) {
        let done = match reply {
            SpawnReply::Ok { pid } => self.table.on_spawned(Ok(pid), &self.names),
            SpawnReply::Error { message } => self.table.on_spawned(Err(message), &self.names),
            SpawnReply::ChildDied { pid, status } => {
                debug!(pid, status, "child died");
                if let Some(protocol) = self.worker_pids.remove(&pid) {
                    debug!(pid, %protocol, "worker exited");
                    self.pool.remove_pid(pid);
                    for waiter in self.worker_waiters.remove(&pid).unwrap_or_default() {
                        let _ = waiter.send(ControlReply::Error {
                            code: code::ERR_WORKER_DIED,
                            message: format!("worker {pid} exited with status {status}"),
                        });
                    }
                }
                self.table.on_child_died(pid, status, &self.names)
            }
        };
        self.complete(done);
    }

    fn complete(&mut self, done: Vec<LaunchRequest>) {
        for mut req in done {
            let ok = matches!(req.status, LaunchStatus::Running | LaunchStatus::Done);
            match &req.error {
                Some(err) => warn!(name = %req.name, "launch failed: {err}"),
                None => info!(name = %req.name, pid = req.pid.unwrap_or(0), status = ?req.status, "launched"),
            }
            match &req.requester {
                Requester::Worker(_) if ok => {
                    if let Some(pid) = req.pid {
                        self.worker_pids.insert(pid, req.name.clone());
                    }
                }
                Requester::Autostart(name) => {
                    let name = name.clone();
                    self.autostart.finished(&name, ok);
                }
                _ => {}
            }
            req.reply();
        }
        self.kick_autostart();
    }

    fn kick_autostart(&mut self) {
        if let Some(entry) = self.autostart.next() {
            info!(name = %entry.name, "autostart");
            let exec = if entry.exec.is_empty() { entry.name.clone() } else { entry.exec.clone() };
            let mut argv = vec![exec];
            argv.extend(entry.args.iter().cloned());
            let req = LaunchRequest::new(
                &entry.name,
                exec_request(argv, Vec::new(), None, None, None),
                LaunchKind::None,
                Requester::Autostart(entry.name.clone()),
            );
            self.table.submit(req);
        } else if self.autostart.phase_done() && !self.autostart_waiters.is_empty() {
            let phase = self.autostart.phase().unwrap_or(0);
            info!(phase, "autostart phase done");
            for waiter in self.autostart_waiters.drain(..) {
                let _ = waiter.send(ControlReply::AutostartDone { phase });
            }
        }
    }

    async fn on_client(&mut self, event: ClientEvent) {
        let (client, request, reply) = match event {
            ClientEvent::Gone { client } => {
                for name in self.names.unregister_owner(client) {
                    debug!(%name, "name released");
                }
                return;
            }
            ClientEvent::Request { client, request, reply } => (client, request, reply),
        };
        debug!(client, ?request, "control request");
        match request {
            ControlRequest::ExecService { name, args, env, startup_id, wait } => {
                let svc = match self.services.resolve(&name, &args) {
                    Ok(svc) => svc,
                    Err(e) => {
                        let _ = reply.send(ControlReply::error(&e));
                        return;
                    }
                };
                let kind = if wait { LaunchKind::Wait } else { svc.kind };
                if kind == LaunchKind::Unique && self.names.is_registered(&svc.registered_name) {
                    let _ = reply.send(ControlReply::Launch {
                        result: 0,
                        name: svc.registered_name,
                        error: String::new(),
                        pid: 0,
                    });
                    return;
                }
                let mut req = LaunchRequest::new(
                    &svc.name,
                    exec_request(svc.argv, env, None, startup_id, None),
                    kind,
                    Requester::Launch(reply),
                );
                req.registered_name = svc.registered_name;
                self.table.submit(req);
            }
            ControlRequest::StartProgram { argv, env, cwd, startup_id, tty, kind, registered_name } => {
                let program = argv.first().cloned().unwrap_or_default();
                let name = Path::new(&program)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or(program);
                let mut req = LaunchRequest::new(
                    &name,
                    exec_request(argv, env, cwd, startup_id, tty),
                    kind,
                    Requester::Launch(reply),
                );
                if let Some(registered) = registered_name {
                    req.registered_name = registered;
                }
                self.table.submit(req);
            }
            ControlRequest::SetLaunchEnv { name, value } => {
                if let Err(e) = self.spawner.send(&SpawnCommand::SetEnv { name, value }).await {
                    error!("spawner channel write failed: {e:#}");
                    self.stop = Some(EXIT_SPAWNER_LOST);
                }
                let _ = reply.send(ControlReply::Ack);
            }
            ControlRequest::RegisterName { name } => {
                if !self.names.register(&name, client) {
                    let _ = reply.send(ControlReply::Error {
                        code: code::ERR_INTERNAL,
                        message: format!("{name} is already registered"),
                    });
                    return;
                }
                debug!(%name, client, "name registered");
                let done = self.table.on_name_registered(&name);
                self.complete(done);
                let _ = reply.send(ControlReply::Ack);
            }
            ControlRequest::RequestWorker { protocol, host, app_socket } => {
                self.request_worker(protocol, host, app_socket, reply).await;
            }
            ControlRequest::RequestHoldWorker { url, app_socket } => {
                let pid = match self.pool.take_held(&url) {
                    Some(worker) => {
                        let pid = worker.pid();
                        match handoff(worker, &app_socket).await {
                            Ok(()) => pid,
                            Err(e) => {
                                warn!(pid, "held worker handoff failed: {e:#}");
                                0
                            }
                        }
                    }
                    None => 0,
                };
                let _ = reply.send(ControlReply::Worker { pid, error: String::new() });
            }
            ControlRequest::WaitForWorker { pid } => {
                if self.pool.contains_pid(pid) {
                    let _ = reply.send(ControlReply::Ack);
                } else if self.worker_pids.contains_key(&pid) {
                    self.worker_waiters.entry(pid).or_default().push(reply);
                } else {
                    let _ = reply.send(ControlReply::Error {
                        code: code::ERR_DOES_NOT_EXIST,
                        message: format!("no worker with pid {pid}"),
                    });
                }
            }
            ControlRequest::Autostart { phase } => {
                let began = self.autostart.begin(phase);
                let passed = self.autostart.phase().is_some_and(|p| p > phase);
                if !began && (passed || self.autostart.phase_done()) {
                    let _ = reply.send(ControlReply::AutostartDone { phase });
                    return;
                }
                self.autostart_waiters.push(reply);
                self.kick_autostart();
            }
            ControlRequest::Terminate { session } => {
                info!(session, "terminate requested");
                if session {
                    if let Err(e) = self.spawner.send(&SpawnCommand::TerminateSession).await {
                        warn!("could not reach spawner: {e:#}");
                    }
                }
                let _ = reply.send(ControlReply::Ack);
                self.stop = Some(0);
            }
        }
    }

    async fn request_worker(
        &mut self,
        protocol: String,
        host: String,
        app_socket: String,
        reply: oneshot::Sender<ControlReply>,
    ) {
        while let Some(worker) = self.pool.take_match(&protocol, &host) {
            let pid = worker.pid();
            match handoff(worker, &app_socket).await {
                Ok(()) => {
                    debug!(pid, %protocol, %host, "reusing idle worker");
                    let _ = reply.send(ControlReply::Worker { pid, error: String::new() });
                    return;
                }
                Err(e) => warn!(pid, "idle worker handoff failed: {e:#}"),
            }
        }
        let Some(info) = self.config.protocol(&protocol) else {
            let _ = reply.send(ControlReply::Worker {
                pid: 0,
                error: format!("unknown protocol {protocol}"),
            });
            return;
        };
        let mut argv = vec![
            info.exec.clone(),
            protocol.clone(),
            self.pool_socket.to_string_lossy().into_owned(),
            app_socket,
        ];
        if self.debug.worker_valgrind.as_deref() == Some(protocol.as_str()) {
            let skin = self.debug.valgrind_skin.as_deref().unwrap_or("memcheck");
            info!(%protocol, skin, "running worker under valgrind");
            let mut wrapped = vec!["valgrind".to_string(), format!("--tool={skin}")];
            wrapped.append(&mut argv);
            argv = wrapped;
        }
        let mut req = LaunchRequest::new(
            &protocol,
            exec_request(argv, Vec::new(), None, None, None),
            LaunchKind::None,
            Requester::Worker(reply),
        );
        req.debug_wait = self.debug.worker_debug.as_deref() == Some(protocol.as_str());
        self.table.submit(req);
    }

    async fn accept_worker(&mut self, stream: UnixStream, inbox: &mpsc::Sender<(PoolKey, Result<Frame>)>) {
        self.next_key += 1;
        let key = self.next_key;
        let mut conn = Connection::with_shared_inbox(stream, key, inbox.clone());
        if let Err(e) = conn.send_now(command::SLAVE_STATUS, &[]).await {
            warn!("new pool connection: {e:#}");
            return;
        }
        self.unannounced.insert(
            key,
            Unannounced {
                conn,
                deadline: Instant::now() + Duration::from_millis(STATUS_ANSWER_MS),
            },
        );
    }

    fn on_pool_frame(&mut self, key: PoolKey, item: Result<Frame>) {
        let frame = match item {
            Ok(frame) => frame,
            Err(_) => {
                if self.unannounced.remove(&key).is_some() {
                    debug!(key, "pool connection closed before announcing");
                } else if let Some(w) = self.pool.remove_where(|w| w.link.0 == key) {
                    debug!(pid = w.pid(), "idle worker left the pool");
                }
                return;
            }
        };
        if frame.cmd != message::SLAVE_STATUS {
            debug!(key, cmd = frame.cmd, "ignoring pool message");
            return;
        }
        let status = match WorkerStatus::decode(&frame.payload) {
            Ok(status) => status,
            Err(e) => {
                warn!("bad worker status: {e:#}");
                self.unannounced.remove(&key);
                self.pool.remove_where(|w| w.link.0 == key);
                return;
            }
        };
        let pid = status.pid;
        if let Some(pending) = self.unannounced.remove(&key) {
            debug!(pid, protocol = %status.protocol, host = %status.host, hold = ?status.hold_url, "worker parked");
            self.worker_pids.entry(pid).or_insert_with(|| status.protocol.clone());
            self.pool.insert(IdleWorker::new(status, (key, pending.conn)));
            for waiter in self.worker_waiters.remove(&pid).unwrap_or_default() {
                let _ = waiter.send(ControlReply::Ack);
            }
        } else if let Some(worker) = self.pool.find_mut(|w| w.link.0 == key) {
            worker.status = status;
        }
    }

    fn sweep(&mut self, now: Instant) {
        for worker in self.pool.sweep(now) {
            debug!(pid = worker.pid(), protocol = %worker.status.protocol, "evicting idle worker");
        }
        self.unannounced.retain(|key, pending| {
            let keep = pending.deadline > now;
            if !keep {
                warn!(key, "pool connection never announced its status");
            }
            keep
        });
    }
}

/// Point an idle worker at a job's socket and let go of it.
async fn handoff(worker: IdleWorker<(PoolKey, Connection)>, app_socket: &str) -> Result<()> {
    let (_, mut conn) = worker.link;
    let payload = PayloadWriter::new().put_str(app_socket).finish();
    conn.send_now(command::SLAVE_CONNECT, &payload).await
}

async fn serve_client(id: OwnerId, stream: UnixStream, events: mpsc::Sender<ClientEvent>) {
    let mut conn = Connection::new(stream);
    while let Ok(frame) = conn.read().await {
        let reply = match ControlRequest::decode(&frame) {
            Ok(request) => {
                let (tx, rx) = oneshot::channel();
                let event = ClientEvent::Request {
                    client: id,
                    request,
                    reply: tx,
                };
                if events.send(event).await.is_err() {
                    break;
                }
                rx.await.unwrap_or_else(|_| ControlReply::Error {
                    code: code::ERR_INTERNAL,
                    message: "request dropped".into(),
                })
            }
            Err(e) => {
                warn!(client = id, "bad control request: {e:#}");
                ControlReply::error(&ShuttleError::malformed(format!("{e:#}")))
            }
        };
        let out = reply.encode();
        if conn.send(out.cmd, out.payload).await.is_err() {
            break;
        }
    }
    let _ = events.send(ClientEvent::Gone { client: id }).await;
}
