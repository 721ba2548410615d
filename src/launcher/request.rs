//! Launch requests and the table that serializes them through the spawner.
//!
//! The table is pure state: the daemon feeds it spawner replies, child deaths
//! and name registrations, and gets back the requests that reached a terminal
//! status and must be answered.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::control::ControlReply;
use super::names::NameRegistry;
use crate::spawner::wire::{ExecRequest, SpawnCommand};

/// How the daemon decides that a launched program is up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchKind {
    /// Running as soon as the spawner reports a pid.
    #[default]
    None,
    /// Running once the program registers its well-known name.
    Unique,
    /// Like `Unique`, but any instance name (`name-<pid>`) counts.
    Multi,
    /// Done when the program exits.
    Wait,
}

impl LaunchKind {
    pub fn to_wire(self) -> u8 {
        match self {
            LaunchKind::None => 0,
            LaunchKind::Unique => 1,
            LaunchKind::Multi => 2,
            LaunchKind::Wait => 3,
        }
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0 => LaunchKind::None,
            1 => LaunchKind::Unique,
            2 => LaunchKind::Multi,
            3 => LaunchKind::Wait,
            _ => return None,
        })
    }

    fn waits_for_name(self) -> bool {
        matches!(self, LaunchKind::Unique | LaunchKind::Multi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStatus {
    Init,
    Launching,
    Running,
    Done,
    Error,
}

impl LaunchStatus {
    fn rank(self) -> u8 {
        match self {
            LaunchStatus::Init => 0,
            LaunchStatus::Launching => 1,
            LaunchStatus::Running | LaunchStatus::Done | LaunchStatus::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

/// Who is waiting for the outcome, and in which shape it is answered.
#[derive(Debug)]
pub enum Requester {
    Launch(oneshot::Sender<ControlReply>),
    Worker(oneshot::Sender<ControlReply>),
    Autostart(String),
    Detached,
}

#[derive(Debug)]
pub struct LaunchRequest {
    pub id: RequestId,
    pub name: String,
    pub exec: ExecRequest,
    pub kind: LaunchKind,
    pub registered_name: String,
    pub debug_wait: bool,
    pub status: LaunchStatus,
    pub history: Vec<LaunchStatus>,
    pub pid: Option<i32>,
    pub exit_status: Option<i32>,
    pub error: Option<String>,
    pub requester: Requester,
}

impl LaunchRequest {
    pub fn new(name: &str, exec: ExecRequest, kind: LaunchKind, requester: Requester) -> Self {
        Self {
            id: RequestId(0),
            name: name.to_string(),
            exec,
            kind,
            registered_name: name.to_string(),
            debug_wait: false,
            status: LaunchStatus::Init,
            history: vec![LaunchStatus::Init],
            pid: None,
            exit_status: None,
            error: None,
            requester,
        }
    }

    /// Move forward only; a terminal status never changes again.
    pub fn advance(&mut self, to: LaunchStatus) -> bool {
        if self.status.is_terminal() || to.rank() <= self.status.rank() {
            return false;
        }
        debug!(id = self.id.0, name = %self.name, from = ?self.status, to = ?to, "launch status");
        self.status = to;
        self.history.push(to);
        true
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.advance(LaunchStatus::Error);
    }

    /// Answer the requester. Consumes the reply handle, so a request can only
    /// ever be answered once.
    pub fn reply(&mut self) {
        let requester = std::mem::replace(&mut self.requester, Requester::Detached);
        let error = self.error.clone().unwrap_or_default();
        let pid = self.pid.unwrap_or(0);
        let ok = matches!(self.status, LaunchStatus::Running | LaunchStatus::Done);
        match requester {
            Requester::Launch(tx) => {
                let _ = tx.send(ControlReply::Launch {
                    result: if ok { self.exit_status.unwrap_or(0) } else { -1 },
                    name: self.registered_name.clone(),
                    error,
                    pid,
                });
            }
            Requester::Worker(tx) => {
                let _ = tx.send(ControlReply::Worker {
                    pid: if ok { pid } else { 0 },
                    error,
                });
            }
            Requester::Autostart(_) | Requester::Detached => {}
        }
    }
}

/// First item in the queue that has to reach the spawner, plus its commands.
#[derive(Debug)]
pub struct Dispatch {
    pub id: RequestId,
    pub commands: Vec<SpawnCommand>,
}

#[derive(Debug, Default)]
pub struct LaunchTable {
    next_id: u64,
    requests: BTreeMap<RequestId, LaunchRequest>,
    queue: VecDeque<RequestId>,
    in_flight: Option<RequestId>,
    deferred_deaths: Vec<(i32, i32)>,
}

impl LaunchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, mut request: LaunchRequest) -> RequestId {
        self.next_id += 1;
        let id = RequestId(self.next_id);
        request.id = id;
        self.requests.insert(id, request);
        self.queue.push_back(id);
        id
    }

    pub fn get(&self, id: RequestId) -> Option<&LaunchRequest> {
        self.requests.get(&id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn in_flight(&self) -> Option<RequestId> {
        self.in_flight
    }

    /// Hand the next queued request to the spawner. Nothing is dispatched while
    /// another request still waits for its OK or ERROR.
    pub fn next_dispatch(&mut self) -> Option<Dispatch> {
        if self.in_flight.is_some() {
            return None;
        }
        while let Some(id) = self.queue.pop_front() {
            let Some(req) = self.requests.get_mut(&id) else {
                continue;
            };
            req.advance(LaunchStatus::Launching);
            let mut commands = Vec::with_capacity(2);
            if req.debug_wait {
                commands.push(SpawnCommand::DebugWait);
            }
            commands.push(SpawnCommand::Exec(req.exec.clone()));
            self.in_flight = Some(id);
            return Some(Dispatch { id, commands });
        }
        None
    }

    /// The spawner answered the in-flight request.
    pub fn on_spawned(&mut self, result: Result<i32, String>, names: &NameRegistry) -> Vec<LaunchRequest> {
        let mut done = Vec::new();
        let Some(id) = self.in_flight.take() else {
            warn!("spawner reply without a request in flight");
            return done;
        };
        match self.requests.get_mut(&id) {
            // finished early, e.g. its name showed up before the OK
            None => debug!(id = id.0, "late spawner reply ignored"),
            Some(req) => {
                match result {
                    Err(message) => req.fail(message),
                    Ok(pid) => {
                        req.pid = Some(pid);
                        match req.kind {
                            LaunchKind::None => {
                                req.advance(LaunchStatus::Running);
                            }
                            LaunchKind::Wait => {}
                            LaunchKind::Unique | LaunchKind::Multi => {
                                if names.find(&req.registered_name, req.kind == LaunchKind::Multi).is_some() {
                                    req.advance(LaunchStatus::Running);
                                }
                            }
                        }
                    }
                }
                if req.status.is_terminal() {
                    done.extend(self.requests.remove(&id));
                }
            }
        }
        for (pid, status) in std::mem::take(&mut self.deferred_deaths) {
            done.extend(self.on_child_died(pid, status, names));
        }
        done
    }

    /// A child exited. Deaths seen while a request is in flight are held back
    /// until its pid is known.
    pub fn on_child_died(&mut self, pid: i32, status: i32, names: &NameRegistry) -> Vec<LaunchRequest> {
        if self.in_flight.is_some() {
            self.deferred_deaths.push((pid, status));
            return Vec::new();
        }
        let Some(id) = self
            .requests
            .values()
            .find(|r| r.pid == Some(pid) && r.status == LaunchStatus::Launching)
            .map(|r| r.id)
        else {
            return Vec::new();
        };
        let Some(req) = self.requests.get_mut(&id) else {
            return Vec::new();
        };
        req.exit_status = Some(status);
        match req.kind {
            LaunchKind::Wait => {
                req.advance(LaunchStatus::Done);
            }
            kind if kind.waits_for_name()
                && names.find(&req.registered_name, kind == LaunchKind::Multi).is_some() =>
            {
                req.advance(LaunchStatus::Running);
            }
            _ => req.fail(format!("{} exited with status {status} before it was ready", req.name)),
        }
        self.requests.remove(&id).into_iter().collect()
    }

    /// A name appeared on the registry; launching requests waiting for it are up.
    pub fn on_name_registered(&mut self, name: &str) -> Vec<LaunchRequest> {
        let ids: Vec<RequestId> = self
            .requests
            .values()
            .filter(|r| r.status == LaunchStatus::Launching && r.kind.waits_for_name())
            .filter(|r| super::names::matches_pending(&r.registered_name, name, r.kind == LaunchKind::Multi))
            .map(|r| r.id)
            .collect();
        let mut done = Vec::new();
        for id in ids {
            if let Some(mut req) = self.requests.remove(&id) {
                req.advance(LaunchStatus::Running);
                done.push(req);
            }
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, kind: LaunchKind) -> LaunchRequest {
        LaunchRequest::new(name, ExecRequest::new(vec![name.to_string()]), kind, Requester::Detached)
    }

    fn is_subsequence(history: &[LaunchStatus]) -> bool {
        history.windows(2).all(|w| w[0].rank() < w[1].rank())
    }

    #[test]
    fn test_advance_is_forward_only() {
        let mut req = request("a", LaunchKind::None);
        assert!(req.advance(LaunchStatus::Launching));
        assert!(!req.advance(LaunchStatus::Init));
        assert!(req.advance(LaunchStatus::Running));
        assert!(!req.advance(LaunchStatus::Error));
        assert_eq!(
            req.history,
            vec![LaunchStatus::Init, LaunchStatus::Launching, LaunchStatus::Running]
        );
    }

    #[test]
    fn test_requests_are_serialized() {
        let names = NameRegistry::new();
        let mut table = LaunchTable::new();
        table.submit(request("a", LaunchKind::None));
        table.submit(request("b", LaunchKind::None));
        let first = table.next_dispatch().unwrap();
        assert!(table.next_dispatch().is_none());
        let done = table.on_spawned(Ok(10), &names);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, first.id);
        assert_eq!(done[0].status, LaunchStatus::Running);
        assert!(table.next_dispatch().is_some());
    }

    #[test]
    fn test_unique_waits_for_registration() {
        let mut names = NameRegistry::new();
        let mut table = LaunchTable::new();
        let mut req = request("editor", LaunchKind::Unique);
        req.registered_name = "org.example.editor".into();
        table.submit(req);
        table.next_dispatch().unwrap();
        assert!(table.on_spawned(Ok(77), &names).is_empty());
        names.register("org.example.editor", 1);
        let done = table.on_name_registered("org.example.editor");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, LaunchStatus::Running);
        assert_eq!(done[0].pid, Some(77));
        assert!(is_subsequence(&done[0].history));
    }

    #[test]
    fn test_registration_before_ok_ignores_late_reply() {
        let names = NameRegistry::new();
        let mut table = LaunchTable::new();
        table.submit(request("fast", LaunchKind::Unique));
        table.next_dispatch().unwrap();
        assert_eq!(table.on_name_registered("fast").len(), 1);
        assert!(table.on_spawned(Ok(5), &names).is_empty());
        assert!(table.is_empty());
        assert!(table.in_flight().is_none());
    }

    #[test]
    fn test_wait_kind_done_on_exit() {
        let names = NameRegistry::new();
        let mut table = LaunchTable::new();
        table.submit(request("job", LaunchKind::Wait));
        table.next_dispatch().unwrap();
        assert!(table.on_spawned(Ok(9), &names).is_empty());
        let done = table.on_child_died(9, 0, &names);
        assert_eq!(done[0].status, LaunchStatus::Done);
        assert_eq!(done[0].exit_status, Some(0));
    }

    #[test]
    fn test_early_death_is_error() {
        let names = NameRegistry::new();
        let mut table = LaunchTable::new();
        table.submit(request("crashy", LaunchKind::Unique));
        table.next_dispatch().unwrap();
        // death arrives before the OK and is replayed after it
        assert!(table.on_child_died(12, 139, &names).is_empty());
        let done = table.on_spawned(Ok(12), &names);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, LaunchStatus::Error);
        assert!(done[0].error.as_deref().unwrap().contains("139"));
    }

    #[test]
    fn test_spawn_error() {
        let names = NameRegistry::new();
        let mut table = LaunchTable::new();
        table.submit(request("missing", LaunchKind::None));
        table.next_dispatch().unwrap();
        let done = table.on_spawned(Err("could not find 'missing' executable".into()), &names);
        assert_eq!(done[0].status, LaunchStatus::Error);
        assert_eq!(
            done[0].history,
            vec![LaunchStatus::Init, LaunchStatus::Launching, LaunchStatus::Error]
        );
    }

    #[test]
    fn test_reply_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut req = LaunchRequest::new("a", ExecRequest::new(vec!["a".into()]), LaunchKind::None, Requester::Launch(tx));
        req.pid = Some(3);
        req.advance(LaunchStatus::Launching);
        req.advance(LaunchStatus::Running);
        req.reply();
        req.reply();
        match rx.try_recv().unwrap() {
            ControlReply::Launch { result, pid, .. } => {
                assert_eq!(result, 0);
                assert_eq!(pid, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(req.requester, Requester::Detached));
    }

    #[test]
    fn test_debug_wait_precedes_exec() {
        let mut table = LaunchTable::new();
        let mut req = request("w", LaunchKind::None);
        req.debug_wait = true;
        table.submit(req);
        let d = table.next_dispatch().unwrap();
        assert_eq!(d.commands.len(), 2);
        assert_eq!(d.commands[0], SpawnCommand::DebugWait);
    }
}
