//! Typed messages of the daemon <-> spawner channel.
//!
//! Layouts (integers are i64 LE, strings NUL-terminated):
//! EXEC / EXEC_NEW: argc, argv..., envc, env..., avoid_loops
//! EXT_EXEC:        as EXEC_NEW, startup_id
//! SHELL:           as EXT_EXEC, cwd
//! KWRAPPER:        as SHELL, tty
//! SETENV:          name, value
//! OK:              pid
//! ERROR:           u32 length + UTF-8 message (an empty payload is tolerated)
//! CHILD_DIED:      pid, status

use anyhow::{bail, Result};

use crate::error::ShuttleError;
use crate::protocol::launcher as cmd;
use crate::protocol_core::{Frame, PayloadReader, PayloadWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Exec,
    ExecNew,
    ExtExec,
    Shell,
    Wrapper,
}

impl ExecMode {
    pub fn command(self) -> u32 {
        match self {
            ExecMode::Exec => cmd::EXEC,
            ExecMode::ExecNew => cmd::EXEC_NEW,
            ExecMode::ExtExec => cmd::EXT_EXEC,
            ExecMode::Shell => cmd::SHELL,
            ExecMode::Wrapper => cmd::KWRAPPER,
        }
    }

    fn from_command(c: u32) -> Option<Self> {
        match c {
            cmd::EXEC => Some(ExecMode::Exec),
            cmd::EXEC_NEW => Some(ExecMode::ExecNew),
            cmd::EXT_EXEC => Some(ExecMode::ExtExec),
            cmd::SHELL => Some(ExecMode::Shell),
            cmd::KWRAPPER => Some(ExecMode::Wrapper),
            _ => None,
        }
    }

    fn has_startup_id(self) -> bool {
        matches!(self, ExecMode::ExtExec | ExecMode::Shell | ExecMode::Wrapper)
    }

    fn has_cwd(self) -> bool {
        matches!(self, ExecMode::Shell | ExecMode::Wrapper)
    }
}

/// One launch order. `argv[0]` is the program name or path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub mode: ExecMode,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub avoid_loops: bool,
    pub startup_id: Option<String>,
    pub cwd: Option<String>,
    pub tty: Option<String>,
}

impl ExecRequest {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            mode: ExecMode::ExecNew,
            argv,
            env: Vec::new(),
            avoid_loops: false,
            startup_id: None,
            cwd: None,
            tty: None,
        }
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnCommand {
    Exec(ExecRequest),
    SetEnv { name: String, value: String },
    TerminateSession,
    TerminateLauncher,
    DebugWait,
}

impl SpawnCommand {
    pub fn encode(&self) -> Frame {
        match self {
            SpawnCommand::Exec(req) => {
                let mut w = PayloadWriter::new();
                w.put_block(&req.argv).put_block(&req.env).put_long(req.avoid_loops as i64);
                if req.mode.has_startup_id() {
                    w.put_cstr(req.startup_id.as_deref().unwrap_or("").as_bytes());
                }
                if req.mode.has_cwd() {
                    w.put_cstr(req.cwd.as_deref().unwrap_or("").as_bytes());
                }
                if req.mode == ExecMode::Wrapper {
                    w.put_cstr(req.tty.as_deref().unwrap_or("").as_bytes());
                }
                Frame::new(req.mode.command(), w.finish())
            }
            SpawnCommand::SetEnv { name, value } => {
                let mut w = PayloadWriter::new();
                w.put_cstr(name.as_bytes()).put_cstr(value.as_bytes());
                Frame::new(cmd::SETENV, w.finish())
            }
            SpawnCommand::TerminateSession => Frame::empty(cmd::TERMINATE_KDE),
            SpawnCommand::TerminateLauncher => Frame::empty(cmd::TERMINATE_LAUNCHER),
            SpawnCommand::DebugWait => Frame::empty(cmd::DEBUG_WAIT),
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        let mut r = PayloadReader::new(&frame.payload);
        let decoded = if let Some(mode) = ExecMode::from_command(frame.cmd) {
            let argv = r.get_block()?;
            if argv.is_empty() {
                return Err(ShuttleError::malformed("exec request without a program").into());
            }
            let env = r.get_block()?;
            let avoid_loops = r.get_long()? != 0;
            let startup_id = if mode.has_startup_id() { Some(r.get_cstring()?) } else { None };
            let cwd = if mode.has_cwd() { Some(r.get_cstring()?) } else { None };
            let tty = if mode == ExecMode::Wrapper { Some(r.get_cstring()?) } else { None };
            SpawnCommand::Exec(ExecRequest {
                mode,
                argv,
                env,
                avoid_loops,
                startup_id,
                cwd: cwd.filter(|c| !c.is_empty()),
                tty: tty.filter(|t| !t.is_empty()),
            })
        } else {
            match frame.cmd {
                cmd::SETENV => {
                    let name = r.get_cstring()?;
                    let value = r.get_cstring()?;
                    if frame.payload.len() != name.len() + value.len() + 2 {
                        return Err(ShuttleError::malformed("SETENV request has invalid format").into());
                    }
                    SpawnCommand::SetEnv { name, value }
                }
                cmd::TERMINATE_KDE => SpawnCommand::TerminateSession,
                cmd::TERMINATE_LAUNCHER => SpawnCommand::TerminateLauncher,
                cmd::DEBUG_WAIT => SpawnCommand::DebugWait,
                other => bail!(ShuttleError::malformed(format!(
                    "unexpected command {} ({}) on spawner channel",
                    other,
                    cmd::name(other)
                ))),
            }
        };
        r.finish()?;
        Ok(decoded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnReply {
    Ok { pid: i32 },
    Error { message: String },
    ChildDied { pid: i32, status: i32 },
}

impl SpawnReply {
    pub fn encode(&self) -> Frame {
        let mut w = PayloadWriter::new();
        match self {
            SpawnReply::Ok { pid } => {
                w.put_long(*pid as i64);
                Frame::new(cmd::OK, w.finish())
            }
            SpawnReply::Error { message } => {
                w.put_str(message);
                Frame::new(cmd::ERROR, w.finish())
            }
            SpawnReply::ChildDied { pid, status } => {
                w.put_long(*pid as i64).put_long(*status as i64);
                Frame::new(cmd::CHILD_DIED, w.finish())
            }
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        let mut r = PayloadReader::new(&frame.payload);
        let reply = match frame.cmd {
            cmd::OK => SpawnReply::Ok { pid: r.get_long()? as i32 },
            cmd::ERROR if frame.payload.is_empty() => SpawnReply::Error { message: String::new() },
            cmd::ERROR => SpawnReply::Error { message: r.get_str()? },
            cmd::CHILD_DIED => SpawnReply::ChildDied {
                pid: r.get_long()? as i32,
                status: r.get_long()? as i32,
            },
            other => bail!(ShuttleError::malformed(format!(
                "unexpected reply {} ({}) from spawner",
                other,
                cmd::name(other)
            ))),
        };
        r.finish()?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    fn round_trip(c: SpawnCommand) {
        let frame = c.encode();
        assert_eq!(SpawnCommand::decode(&frame).unwrap(), c);
    }

    #[test]
    fn test_exec_layouts() {
        let mut req = ExecRequest::new(vec!["editor".into(), "--new".into(), "a file".into()]);
        req.env = vec!["LANG=C".into()];
        round_trip(SpawnCommand::Exec(req.clone()));

        req.mode = ExecMode::ExtExec;
        req.startup_id = Some("id-1".into());
        round_trip(SpawnCommand::Exec(req.clone()));

        req.mode = ExecMode::Shell;
        req.cwd = Some("/tmp".into());
        round_trip(SpawnCommand::Exec(req.clone()));

        req.mode = ExecMode::Wrapper;
        req.tty = Some("/dev/pts/3".into());
        round_trip(SpawnCommand::Exec(req));
    }

    #[test]
    fn test_exec_new_field_order() {
        let req = ExecRequest::new(vec!["a".into(), "".into()]);
        let frame = SpawnCommand::Exec(req).encode();
        let mut expected = Vec::new();
        expected.extend_from_slice(&2i64.to_le_bytes());
        expected.extend_from_slice(b"a\0\0");
        expected.extend_from_slice(&0i64.to_le_bytes());
        expected.extend_from_slice(&0i64.to_le_bytes());
        assert_eq!(frame.cmd, cmd::EXEC_NEW);
        assert_eq!(frame.payload, expected);
    }

    #[test]
    fn test_exec_with_trailing_garbage_is_malformed() {
        let mut frame = SpawnCommand::Exec(ExecRequest::new(vec!["x".into()])).encode();
        frame.payload.push(0);
        let err = SpawnCommand::decode(&frame).unwrap_err();
        assert!(matches!(classify(&err), Some(ShuttleError::MalformedRequest(_))));
    }

    #[test]
    fn test_setenv_length_check() {
        round_trip(SpawnCommand::SetEnv { name: "PATH".into(), value: "/bin".into() });
        let bad = Frame::new(cmd::SETENV, b"PATH\0/bin\0\0".to_vec());
        assert!(SpawnCommand::decode(&bad).is_err());
    }

    #[test]
    fn test_replies() {
        for reply in [
            SpawnReply::Ok { pid: 4242 },
            SpawnReply::Error { message: "could not find 'nope'".into() },
            SpawnReply::ChildDied { pid: 17, status: 1 },
        ] {
            assert_eq!(SpawnReply::decode(&reply.encode()).unwrap(), reply);
        }
        assert_eq!(
            SpawnReply::decode(&Frame::empty(cmd::ERROR)).unwrap(),
            SpawnReply::Error { message: String::new() }
        );
    }

    #[test]
    fn test_empty_payload_commands() {
        round_trip(SpawnCommand::DebugWait);
        round_trip(SpawnCommand::TerminateSession);
        round_trip(SpawnCommand::TerminateLauncher);
        assert!(SpawnCommand::decode(&Frame::new(cmd::DEBUG_WAIT, vec![1])).is_err());
    }
}
