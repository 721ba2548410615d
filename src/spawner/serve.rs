//! Spawner event loop: poll over the daemon channel and the SIGCHLD self-pipe.

use anyhow::{bail, Context, Result};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, error, info, warn};

use super::wire::{SpawnCommand, SpawnReply};
use super::{Outcome, Spawner};
use crate::protocol::launcher as cmd;
use crate::protocol_core::{read_frame, write_frame, Frame};

static DEAD_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigchld(_: libc::c_int) {
    let fd = DEAD_PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 0u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Install the SIGCHLD handler feeding a non-blocking self-pipe; returns the
/// read end. Also ignores SIGPIPE so a vanished daemon shows up as EPIPE.
pub fn install_child_handler() -> Result<RawFd> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
        return Err(std::io::Error::last_os_error()).context("creating SIGCHLD pipe");
    }
    DEAD_PIPE_WR.store(fds[1], Ordering::Relaxed);
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = on_sigchld as usize;
        libc::sigemptyset(&mut act.sa_mask);
        libc::sigaddset(&mut act.sa_mask, libc::SIGCHLD);
        act.sa_flags = libc::SA_NOCLDSTOP | libc::SA_RESTART;
        if libc::sigaction(libc::SIGCHLD, &act, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error()).context("installing SIGCHLD handler");
        }
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
    Ok(fds[0])
}

fn drain(fd: RawFd) {
    let mut buf = [0u8; 64];
    while unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) } > 0 {}
}

/// Exit status as reported to the daemon: the exit code, or 128 + signal.
pub fn decode_wait_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        status
    }
}

fn reap_one() -> Option<(i32, i32)> {
    let mut status = 0;
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    (pid > 0).then(|| (pid, decode_wait_status(status)))
}

/// Commands whose sender blocks until it gets OK or ERROR.
fn expects_reply(command: u32) -> bool {
    matches!(
        command,
        cmd::EXEC | cmd::EXEC_NEW | cmd::EXT_EXEC | cmd::SHELL | cmd::KWRAPPER
    )
}

pub struct SpawnerLoop {
    spawner: Spawner,
    launcher: Option<UnixStream>,
    launcher_pid: Option<i32>,
    dead_pipe: RawFd,
}

impl SpawnerLoop {
    pub fn new(spawner: Spawner, launcher: UnixStream, launcher_pid: Option<i32>, dead_pipe: RawFd) -> Self {
        Self {
            spawner,
            launcher: Some(launcher),
            launcher_pid,
            dead_pipe,
        }
    }

    /// Launch a program outside of the daemon protocol (startup list).
    pub fn start(&mut self, command: SpawnCommand) {
        if let Outcome::Reply(SpawnReply::Error { message }) = self.spawner.handle(command) {
            error!("startup program failed: {message}");
        }
    }

    fn send(&mut self, frame: &Frame) {
        if let Some(stream) = self.launcher.as_mut() {
            if let Err(e) = write_frame(stream, frame.cmd, &frame.payload) {
                warn!("launcher channel write failed: {e:#}");
                self.launcher = None;
            }
        }
    }

    fn reap(&mut self) {
        drain(self.dead_pipe);
        while let Some((pid, status)) = reap_one() {
            debug!(pid, status, "child terminated");
            if Some(pid) == self.launcher_pid {
                info!(pid, status, "launcher daemon exited");
                self.launcher_pid = None;
            }
            self.send(&SpawnReply::ChildDied { pid, status }.encode());
        }
    }

    fn signal_launcher(&self) {
        if let Some(pid) = self.launcher_pid {
            unsafe { libc::kill(pid, libc::SIGTERM) };
        }
    }

    /// Serve until the launcher channel closes or the session is terminated,
    /// then wait for the remaining children.
    pub fn run(mut self) -> Result<()> {
        loop {
            self.reap();
            let Some(launcher_fd) = self.launcher.as_ref().map(|s| s.as_raw_fd()) else {
                break;
            };
            let mut fds = [
                libc::pollfd { fd: launcher_fd, events: libc::POLLIN, revents: 0 },
                libc::pollfd { fd: self.dead_pipe, events: libc::POLLIN, revents: 0 },
            ];
            let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if n < 0 {
                let e = std::io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                bail!("poll failed: {e}");
            }
            if fds[0].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                if !self.handle_launcher_frame() {
                    break;
                }
            }
        }
        self.launcher = None;
        info!("launcher channel closed, waiting for remaining children");
        wait_all();
        Ok(())
    }

    /// Returns false once the channel is gone or the session ends.
    fn handle_launcher_frame(&mut self) -> bool {
        let Some(stream) = self.launcher.as_mut() else {
            return false;
        };
        let frame = match read_frame(stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => return false,
            Err(e) => {
                error!("launcher channel broken: {e:#}");
                return false;
            }
        };
        debug!(cmd = cmd::name(frame.cmd), len = frame.payload.len(), "request");
        let command = match SpawnCommand::decode(&frame) {
            Ok(c) => c,
            Err(e) => {
                warn!("{} request has invalid format: {e:#}", cmd::name(frame.cmd));
                if expects_reply(frame.cmd) {
                    self.send(&SpawnReply::Error { message: format!("{e:#}") }.encode());
                }
                return true;
            }
        };
        match self.spawner.handle(command) {
            Outcome::Reply(reply) => self.send(&reply.encode()),
            Outcome::Quiet => {}
            Outcome::TerminateLauncher => self.signal_launcher(),
            Outcome::TerminateSession => {
                self.signal_launcher();
                return false;
            }
        }
        true
    }
}

fn wait_all() {
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid > 0 {
            debug!(pid, status = decode_wait_status(status), "child terminated");
            continue;
        }
        if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        break;
    }
}
