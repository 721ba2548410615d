//! Process spawner: starts programs on behalf of the launcher daemon.
//!
//! The spawner is single-threaded and synchronous on purpose. It reads one
//! request at a time from the daemon channel, forks, waits for the child's
//! status byte and answers with OK(pid) or ERROR(message).

pub mod fork;
pub mod serve;
pub mod wire;

use anyhow::Result;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::ShuttleError;
use fork::PreparedLaunch;
use wire::{ExecMode, ExecRequest, SpawnCommand, SpawnReply};

/// In-process entry point run in the forked child instead of exec'ing a binary.
pub type EntryPoint = fn(&[String]) -> i32;

/// Programs that can be started by fork alone, keyed by program name.
#[derive(Clone, Default)]
pub struct EntryRegistry {
    entries: HashMap<String, EntryPoint>,
}

impl EntryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, entry: EntryPoint) {
        self.entries.insert(name.to_string(), entry);
    }

    /// Only bare program names take the fast path; explicit paths always exec.
    pub fn lookup(&self, program: &str) -> Option<EntryPoint> {
        if program.contains('/') {
            return None;
        }
        self.entries.get(program).copied()
    }
}

fn is_executable(p: &Path) -> bool {
    std::fs::metadata(p)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Every executable `name` resolves to, in PATH order. With `avoid` set,
/// candidates that are the same file as `avoid` are skipped so a wrapper named
/// like its target cannot start itself again.
pub fn find_executable(name: &str, path_var: Option<&OsStr>, avoid: Option<&Path>) -> Vec<PathBuf> {
    let avoid = avoid.and_then(|a| a.canonicalize().ok());
    let keep = |p: &Path| match (&avoid, p.canonicalize()) {
        (Some(a), Ok(c)) => &c != a,
        _ => true,
    };
    if name.contains('/') {
        let p = PathBuf::from(name);
        return if is_executable(&p) && keep(&p) { vec![p] } else { Vec::new() };
    }
    let Some(path_var) = path_var else {
        return Vec::new();
    };
    std::env::split_paths(path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .filter(|p| is_executable(p) && keep(p))
        .collect()
}

/// Path of a binary shipped next to the running executable, if present.
pub fn sibling_binary(name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe.parent()?.join(name);
    candidate.exists().then_some(candidate)
}

/// Start `exec_path` with `socket` duplicated onto fd 3.
pub fn spawn_socketed_process(exec_path: &Path, argv: &[String], socket: RawFd) -> std::io::Result<Child> {
    let mut cmd = Command::new(exec_path);
    cmd.args(argv);
    unsafe {
        cmd.pre_exec(move || {
            if socket == 3 {
                let flags = libc::fcntl(3, libc::F_GETFD);
                if flags < 0 || libc::fcntl(3, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                return Ok(());
            }
            let fd = libc::dup2(socket, 3);
            if fd != 3 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        })
    };
    cmd.spawn()
}

/// What the serve loop has to do after a command was handled.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Reply(SpawnReply),
    Quiet,
    TerminateSession,
    TerminateLauncher,
}

pub struct Spawner {
    registry: EntryRegistry,
    debug_wait_next: bool,
    home: Option<PathBuf>,
    self_exe: Option<PathBuf>,
}

impl Spawner {
    pub fn new(registry: EntryRegistry) -> Self {
        Self {
            registry,
            debug_wait_next: false,
            home: std::env::var_os("HOME").map(PathBuf::from),
            self_exe: std::env::current_exe().ok(),
        }
    }

    pub fn handle(&mut self, command: SpawnCommand) -> Outcome {
        match command {
            SpawnCommand::Exec(req) => {
                let debug_wait = std::mem::take(&mut self.debug_wait_next);
                match self.exec(&req, debug_wait) {
                    Ok(pid) => {
                        info!(program = req.program(), pid, "started");
                        Outcome::Reply(SpawnReply::Ok { pid })
                    }
                    Err(e) => {
                        warn!(program = req.program(), "launch failed: {e:#}");
                        Outcome::Reply(SpawnReply::Error { message: format!("{e:#}") })
                    }
                }
            }
            SpawnCommand::SetEnv { name, value } => {
                debug!(%name, %value, "setenv");
                std::env::set_var(name, value);
                Outcome::Quiet
            }
            SpawnCommand::DebugWait => {
                self.debug_wait_next = true;
                Outcome::Quiet
            }
            SpawnCommand::TerminateSession => Outcome::TerminateSession,
            SpawnCommand::TerminateLauncher => Outcome::TerminateLauncher,
        }
    }

    pub fn exec(&self, req: &ExecRequest, debug_wait: bool) -> Result<i32> {
        let prep = self.prepare(req, debug_wait)?;
        let pid = fork::launch(&prep)?;
        if debug_wait {
            info!(pid, program = req.program(), "stopped at start, attach a debugger and send SIGCONT");
        }
        Ok(pid)
    }

    fn prepare(&self, req: &ExecRequest, debug_wait: bool) -> Result<PreparedLaunch> {
        let program = req.program();
        if program.is_empty() {
            return Err(ShuttleError::SpawnFailure("empty program name".into()).into());
        }
        let title = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string());

        let clear_env = req.mode == ExecMode::Wrapper;
        let mut overrides: Vec<(String, String)> = req
            .env
            .iter()
            .filter_map(|e| match e.split_once('=') {
                Some((k, v)) if !k.is_empty() => Some((k.to_string(), v.to_string())),
                _ => {
                    warn!(entry = %e, "ignoring environment entry without '='");
                    None
                }
            })
            .collect();
        if let Some(id) = req.startup_id.as_deref().filter(|id| !id.is_empty() && *id != "0") {
            overrides.push(("DESKTOP_STARTUP_ID".to_string(), id.to_string()));
        }

        let mut env: Vec<(String, String)> = if clear_env {
            Vec::new()
        } else {
            std::env::vars().collect()
        };
        for (k, v) in &overrides {
            match env.iter_mut().find(|(ek, _)| ek == k) {
                Some(slot) => slot.1 = v.clone(),
                None => env.push((k.clone(), v.clone())),
            }
        }
        let envp: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let path_var = env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| std::ffi::OsString::from(v));
        let avoid = if req.avoid_loops { self.self_exe.as_deref() } else { None };
        let entry = self.registry.lookup(program);
        let candidates = find_executable(program, path_var.as_deref(), avoid);
        if entry.is_none() && candidates.is_empty() {
            return Err(ShuttleError::SpawnFailure(format!("could not find '{program}' executable")).into());
        }

        let cwd = req
            .cwd
            .clone()
            .or_else(|| self.home.as_ref().map(|h| h.to_string_lossy().into_owned()));

        PreparedLaunch::new(
            &title,
            &req.argv,
            &envp,
            &overrides,
            clear_env,
            &candidates,
            cwd.as_deref(),
            req.tty.as_deref(),
            entry,
            debug_wait,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_exe(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
        p
    }

    #[test]
    fn test_find_executable_path_order() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let first = make_exe(a.path(), "tool");
        let second = make_exe(b.path(), "tool");
        std::fs::write(a.path().join("plain"), "x").unwrap();
        let path = std::env::join_paths([a.path(), b.path()]).unwrap();
        assert_eq!(find_executable("tool", Some(&path), None), vec![first.clone(), second.clone()]);
        assert!(find_executable("plain", Some(&path), None).is_empty());
        assert_eq!(find_executable("tool", Some(&path), Some(&first)), vec![second]);
    }

    #[test]
    fn test_registry_only_for_bare_names() {
        fn entry(_: &[String]) -> i32 {
            0
        }
        let mut reg = EntryRegistry::new();
        reg.register("shuttle-file", entry);
        assert!(reg.lookup("shuttle-file").is_some());
        assert!(reg.lookup("/usr/bin/shuttle-file").is_none());
        assert!(reg.lookup("other").is_none());
    }

    #[test]
    fn test_unknown_program_is_error_reply() {
        let mut spawner = Spawner::new(EntryRegistry::new());
        let out = spawner.handle(SpawnCommand::Exec(ExecRequest::new(vec!["no-such-program-shuttle".into()])));
        match out {
            Outcome::Reply(SpawnReply::Error { message }) => assert!(message.contains("no-such-program-shuttle")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_debug_wait_is_one_shot() {
        let mut spawner = Spawner::new(EntryRegistry::new());
        assert_eq!(spawner.handle(SpawnCommand::DebugWait), Outcome::Quiet);
        assert!(spawner.debug_wait_next);
        let _ = spawner.handle(SpawnCommand::Exec(ExecRequest::new(vec!["no-such-program-shuttle".into()])));
        assert!(!spawner.debug_wait_next);
    }

    #[test]
    fn test_exec_reports_pid() {
        let spawner = Spawner::new(EntryRegistry::new());
        let mut req = ExecRequest::new(vec!["/bin/sh".into(), "-c".into(), "exit 0".into()]);
        req.cwd = Some("/".into());
        let pid = spawner.exec(&req, false).unwrap();
        let mut status = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(libc::WEXITSTATUS(status), 0);
    }
}
