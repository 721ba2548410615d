//! fork/exec with a status pipe.
//!
//! Everything the child needs (argv, envp, candidate paths, messages) is turned
//! into C strings before `fork()`; the child only makes raw syscalls.
//!
//! Status bytes on the pipe:
//! 0 ok (fast path entry about to run), 1 failed, 2 no entry point so exec
//! follows (keep waiting; EOF afterwards means the exec succeeded because the
//! pipe is close-on-exec), 3 failed with a u32-length-prefixed UTF-8 message.
//! EOF without any status byte is a failure.

use anyhow::{anyhow, Context, Result};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use crate::error::ShuttleError;
use crate::protocol::spawn_status;

use super::EntryPoint;

/// A launch with every pointer the child will touch already allocated.
pub struct PreparedLaunch {
    pub title: CString,
    pub argv: Vec<CString>,
    /// Full environment for execve.
    pub envp: Vec<CString>,
    /// Overrides applied with setenv before a fast-path entry runs.
    pub env_overrides: Vec<(CString, CString)>,
    pub clear_env: bool,
    /// Absolute candidates tried in order with execve.
    pub candidates: Vec<CString>,
    pub cwd: Option<CString>,
    pub cwd_error: Vec<u8>,
    pub tty: Option<CString>,
    pub tty_error: Vec<u8>,
    pub entry: Option<EntryPoint>,
    pub entry_args: Vec<String>,
    pub debug_wait: bool,
    /// Descriptors the child must keep open besides 0, 1 and 2.
    pub keep_fds: Vec<RawFd>,
    pub max_fd: RawFd,
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| anyhow!(ShuttleError::SpawnFailure(format!("'{s}' contains a NUL byte"))))
}

fn status_message(msg: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + msg.len());
    out.push(spawn_status::FAILED_WITH_MESSAGE);
    out.extend_from_slice(&(msg.len() as u32).to_le_bytes());
    out.extend_from_slice(msg.as_bytes());
    out
}

impl PreparedLaunch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        title: &str,
        argv: &[String],
        envp: &[String],
        env_overrides: &[(String, String)],
        clear_env: bool,
        candidates: &[PathBuf],
        cwd: Option<&str>,
        tty: Option<&str>,
        entry: Option<EntryPoint>,
        debug_wait: bool,
    ) -> Result<Self> {
        let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        let max_fd = if max_fd <= 0 { 1024 } else { max_fd.min(65_536) as RawFd };
        Ok(Self {
            title: cstring(title)?,
            argv: argv.iter().map(|a| cstring(a)).collect::<Result<_>>()?,
            envp: envp.iter().map(|e| cstring(e)).collect::<Result<_>>()?,
            env_overrides: env_overrides
                .iter()
                .map(|(k, v)| -> Result<(CString, CString)> { Ok((cstring(k)?, cstring(v)?)) })
                .collect::<Result<_>>()?,
            clear_env,
            candidates: candidates
                .iter()
                .map(|p| CString::new(p.as_os_str().as_bytes()).context("candidate path contains NUL"))
                .collect::<Result<_>>()?,
            cwd_error: status_message(&format!(
                "could not change directory to {}",
                cwd.unwrap_or("")
            )),
            cwd: cwd.map(cstring).transpose()?,
            tty_error: status_message(&format!("could not open terminal {}", tty.unwrap_or(""))),
            tty: tty.map(cstring).transpose()?,
            entry,
            entry_args: argv.to_vec(),
            debug_wait,
            keep_fds: Vec::new(),
            max_fd,
        })
    }
}

/// Fork and start the prepared program. Returns the child pid once the child
/// reported success; any failure is a `SpawnFailure`.
pub fn launch(prep: &PreparedLaunch) -> Result<i32> {
    let argv_ptrs: Vec<*const libc::c_char> = prep
        .argv
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let envp_ptrs: Vec<*const libc::c_char> = prep
        .envp
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        let e = std::io::Error::last_os_error();
        return Err(ShuttleError::SpawnFailure(format!("pipe() failed: {e}")).into());
    }
    let (rd, wr) = (fds[0], fds[1]);

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        let e = std::io::Error::last_os_error();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
        return Err(ShuttleError::SpawnFailure(format!("fork() failed: {e}")).into());
    }
    if pid == 0 {
        unsafe { child(prep, wr, rd, &argv_ptrs, &envp_ptrs) }
    }

    unsafe { libc::close(wr) };
    let status = wait_for_status(rd);
    unsafe { libc::close(rd) };
    status.map(|_| pid).map_err(|e| {
        anyhow!(ShuttleError::SpawnFailure(format!(
            "{}: {}",
            prep.title.to_string_lossy(),
            e
        )))
    })
}

/// Parent side of the status protocol.
pub fn wait_for_status(fd: RawFd) -> std::result::Result<(), String> {
    let mut exec = false;
    loop {
        let mut byte = 0u8;
        let n = unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if n == 1 {
            match byte {
                spawn_status::EXEC_FALLBACK => {
                    exec = true;
                    continue;
                }
                spawn_status::OK => return Ok(()),
                spawn_status::FAILED => return Err("could not start program".into()),
                spawn_status::FAILED_WITH_MESSAGE => return Err(read_message(fd)),
                other => return Err(format!("unknown status byte {other}")),
            }
        }
        if n < 0 {
            let e = std::io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::ECHILD) => continue,
                _ => return Err(format!("error reading from status pipe: {e}")),
            }
        }
        return if exec {
            Ok(())
        } else {
            Err("status pipe closed unexpectedly".into())
        };
    }
}

fn read_message(fd: RawFd) -> String {
    let mut len_buf = [0u8; 4];
    if !read_full(fd, &mut len_buf) {
        return "could not start program".into();
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut msg = vec![0u8; len.min(64 * 1024)];
    if !read_full(fd, &mut msg) {
        return "could not start program".into();
    }
    String::from_utf8_lossy(&msg).into_owned()
}

fn read_full(fd: RawFd, buf: &mut [u8]) -> bool {
    let mut filled = 0;
    while filled < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[filled..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - filled,
            )
        };
        if n > 0 {
            filled += n as usize;
        } else if n < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        } else {
            return false;
        }
    }
    true
}

unsafe fn write_status(fd: RawFd, bytes: &[u8]) {
    let _ = libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
}

/// Runs in the forked child. Only async-signal-safe calls until exec, except
/// for the fast path which the spawner only takes when it is single-threaded.
unsafe fn child(
    prep: &PreparedLaunch,
    wr: RawFd,
    rd: RawFd,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> ! {
    libc::close(rd);

    let mut all: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut all);
    libc::sigprocmask(libc::SIG_SETMASK, &all, std::ptr::null_mut());
    for sig in 1..32 {
        if sig != libc::SIGKILL && sig != libc::SIGSTOP {
            libc::signal(sig, libc::SIG_DFL);
        }
    }

    for fd in 3..prep.max_fd {
        if fd != wr && !prep.keep_fds.contains(&fd) {
            libc::close(fd);
        }
    }

    if let Some(tty) = &prep.tty {
        let t = libc::open(tty.as_ptr(), libc::O_RDWR);
        if t < 0 {
            write_status(wr, &prep.tty_error);
            libc::_exit(255);
        }
        libc::dup2(t, 0);
        libc::dup2(t, 1);
        libc::dup2(t, 2);
        if t > 2 {
            libc::close(t);
        }
    }

    if let Some(cwd) = &prep.cwd {
        if libc::chdir(cwd.as_ptr()) != 0 {
            write_status(wr, &prep.cwd_error);
            libc::_exit(255);
        }
    }

    #[cfg(target_os = "linux")]
    libc::prctl(libc::PR_SET_NAME, prep.title.as_ptr() as libc::c_ulong, 0, 0, 0);

    if prep.debug_wait {
        libc::raise(libc::SIGSTOP);
    }

    if let Some(entry) = prep.entry {
        if prep.clear_env {
            libc::clearenv();
        }
        for (k, v) in &prep.env_overrides {
            libc::setenv(k.as_ptr(), v.as_ptr(), 1);
        }
        write_status(wr, &[spawn_status::OK]);
        libc::close(wr);
        let code = entry(&prep.entry_args);
        libc::_exit(code);
    }

    write_status(wr, &[spawn_status::EXEC_FALLBACK]);
    for candidate in &prep.candidates {
        libc::execve(candidate.as_ptr(), argv.as_ptr(), envp.as_ptr());
    }
    write_status(wr, &[spawn_status::FAILED]);
    libc::close(wr);
    libc::_exit(255);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_with(bytes: &[u8]) -> RawFd {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            libc::write(fds[1], bytes.as_ptr() as *const libc::c_void, bytes.len());
            libc::close(fds[1]);
        }
        fds[0]
    }

    fn status_of(bytes: &[u8]) -> std::result::Result<(), String> {
        let fd = pipe_with(bytes);
        let out = wait_for_status(fd);
        unsafe { libc::close(fd) };
        out
    }

    fn exit_code(pid: i32) -> i32 {
        let mut status = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
        libc::WEXITSTATUS(status)
    }

    fn sh(script: &str) -> PreparedLaunch {
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        let env: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
        PreparedLaunch::new("sh", &argv, &env, &[], false, &[PathBuf::from("/bin/sh")], None, None, None, false)
            .unwrap()
    }

    #[test]
    fn test_status_protocol() {
        assert!(status_of(&[]).is_err(), "EOF without status must fail");
        assert!(status_of(&[spawn_status::OK]).is_ok());
        assert!(status_of(&[spawn_status::EXEC_FALLBACK]).is_ok(), "EOF after exec fallback is success");
        assert!(status_of(&[spawn_status::EXEC_FALLBACK, spawn_status::FAILED]).is_err());
        let mut msg = vec![spawn_status::FAILED_WITH_MESSAGE];
        msg.extend_from_slice(&5u32.to_le_bytes());
        msg.extend_from_slice(b"boom!");
        assert_eq!(status_of(&msg), Err("boom!".to_string()));
    }

    #[test]
    fn test_launch_exec_reports_pid() {
        let pid = launch(&sh("exit 3")).unwrap();
        assert!(pid > 0);
        assert_eq!(exit_code(pid), 3);
    }

    #[test]
    fn test_launch_env_reaches_child() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "test \"$SHUTTLE_T\" = yes".to_string()];
        let env = vec!["SHUTTLE_T=yes".to_string(), "PATH=/usr/bin:/bin".to_string()];
        let prep =
            PreparedLaunch::new("sh", &argv, &env, &[], false, &[PathBuf::from("/bin/sh")], None, None, None, false)
                .unwrap();
        let pid = launch(&prep).unwrap();
        assert_eq!(exit_code(pid), 0);
    }

    #[test]
    fn test_bad_cwd_reports_message() {
        let argv = vec!["sh".to_string()];
        let prep = PreparedLaunch::new(
            "sh",
            &argv,
            &[],
            &[],
            false,
            &[PathBuf::from("/bin/sh")],
            Some("/definitely/not/here"),
            None,
            None,
            false,
        )
        .unwrap();
        let err = launch(&prep).unwrap_err();
        assert!(format!("{err:#}").contains("could not change directory"));
    }

    #[test]
    fn test_no_candidate_fails() {
        let argv = vec!["nothing".to_string()];
        let prep = PreparedLaunch::new(
            "nothing",
            &argv,
            &[],
            &[],
            false,
            &[PathBuf::from("/definitely/not/here/nothing")],
            None,
            None,
            None,
            false,
        )
        .unwrap();
        assert!(launch(&prep).is_err());
    }

    fn seven(_args: &[String]) -> i32 {
        7
    }

    #[test]
    fn test_fast_path_entry() {
        let argv = vec!["seven".to_string()];
        let prep = PreparedLaunch::new("seven", &argv, &[], &[], false, &[], None, None, Some(seven), false).unwrap();
        let pid = launch(&prep).unwrap();
        assert_eq!(exit_code(pid), 7);
    }
}
