//! Control socket protocol between clients and the launcher daemon.
//!
//! Every request gets exactly one reply frame. A connection that registered
//! names keeps them until it closes.

use anyhow::{anyhow, bail, Result};
use std::path::Path;

use super::request::LaunchKind;
use crate::connection::Connection;
use crate::error::{code, ShuttleError};
use crate::protocol::control as cmd;
use crate::protocol_core::{Frame, PayloadReader, PayloadWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Start a configured service (or a program found on PATH) by name.
    ExecService {
        name: String,
        args: Vec<String>,
        env: Vec<String>,
        startup_id: Option<String>,
        wait: bool,
    },
    /// Start an explicit command line.
    StartProgram {
        argv: Vec<String>,
        env: Vec<String>,
        cwd: Option<String>,
        startup_id: Option<String>,
        tty: Option<String>,
        kind: LaunchKind,
        registered_name: Option<String>,
    },
    SetLaunchEnv { name: String, value: String },
    RegisterName { name: String },
    RequestWorker { protocol: String, host: String, app_socket: String },
    RequestHoldWorker { url: String, app_socket: String },
    WaitForWorker { pid: i32 },
    Autostart { phase: u8 },
    /// Stop the daemon; with `session` set the spawner goes down too.
    Terminate { session: bool },
}

impl ControlRequest {
    pub fn encode(&self) -> Frame {
        let mut w = PayloadWriter::new();
        let command = match self {
            ControlRequest::ExecService { name, args, env, startup_id, wait } => {
                w.put_str(name)
                    .put_str_list(args)
                    .put_str_list(env)
                    .put_opt_str(startup_id.as_deref())
                    .put_bool(*wait);
                cmd::EXEC_SERVICE
            }
            ControlRequest::StartProgram { argv, env, cwd, startup_id, tty, kind, registered_name } => {
                w.put_str_list(argv)
                    .put_str_list(env)
                    .put_opt_str(cwd.as_deref())
                    .put_opt_str(startup_id.as_deref())
                    .put_opt_str(tty.as_deref())
                    .put_u8(kind.to_wire())
                    .put_opt_str(registered_name.as_deref());
                cmd::START_PROGRAM
            }
            ControlRequest::SetLaunchEnv { name, value } => {
                w.put_str(name).put_str(value);
                cmd::SET_LAUNCH_ENV
            }
            ControlRequest::RegisterName { name } => {
                w.put_str(name);
                cmd::REGISTER_NAME
            }
            ControlRequest::RequestWorker { protocol, host, app_socket } => {
                w.put_str(protocol).put_str(host).put_str(app_socket);
                cmd::REQUEST_WORKER
            }
            ControlRequest::RequestHoldWorker { url, app_socket } => {
                w.put_str(url).put_str(app_socket);
                cmd::REQUEST_HOLD_WORKER
            }
            ControlRequest::WaitForWorker { pid } => {
                w.put_i32(*pid);
                cmd::WAIT_FOR_WORKER
            }
            ControlRequest::Autostart { phase } => {
                w.put_u8(*phase);
                cmd::AUTOSTART
            }
            ControlRequest::Terminate { session } => {
                w.put_bool(*session);
                cmd::TERMINATE
            }
        };
        Frame::new(command, w.finish())
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        let mut r = PayloadReader::new(&frame.payload);
        let req = match frame.cmd {
            cmd::EXEC_SERVICE => ControlRequest::ExecService {
                name: r.get_str()?,
                args: r.get_str_list()?,
                env: r.get_str_list()?,
                startup_id: r.get_opt_str()?,
                wait: r.get_bool()?,
            },
            cmd::START_PROGRAM => {
                let argv = r.get_str_list()?;
                let env = r.get_str_list()?;
                let cwd = r.get_opt_str()?;
                let startup_id = r.get_opt_str()?;
                let tty = r.get_opt_str()?;
                let raw_kind = r.get_u8()?;
                let kind = LaunchKind::from_wire(raw_kind)
                    .ok_or_else(|| ShuttleError::malformed(format!("unknown launch kind {raw_kind}")))?;
                let registered_name = r.get_opt_str()?;
                if argv.first().map_or(true, |p| p.is_empty()) {
                    return Err(ShuttleError::malformed("START_PROGRAM without a program").into());
                }
                ControlRequest::StartProgram { argv, env, cwd, startup_id, tty, kind, registered_name }
            }
            cmd::SET_LAUNCH_ENV => ControlRequest::SetLaunchEnv {
                name: r.get_str()?,
                value: r.get_str()?,
            },
            cmd::REGISTER_NAME => ControlRequest::RegisterName { name: r.get_str()? },
            cmd::REQUEST_WORKER => ControlRequest::RequestWorker {
                protocol: r.get_str()?,
                host: r.get_str()?,
                app_socket: r.get_str()?,
            },
            cmd::REQUEST_HOLD_WORKER => ControlRequest::RequestHoldWorker {
                url: r.get_str()?,
                app_socket: r.get_str()?,
            },
            cmd::WAIT_FOR_WORKER => ControlRequest::WaitForWorker { pid: r.get_i32()? },
            cmd::AUTOSTART => ControlRequest::Autostart { phase: r.get_u8()? },
            cmd::TERMINATE => ControlRequest::Terminate { session: r.get_bool()? },
            other => return Err(ShuttleError::malformed(format!("unknown control command {other}")).into()),
        };
        r.finish()?;
        Ok(req)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    /// `result` is 0 (or the exit status of a waited-for program) on success.
    Launch { result: i32, name: String, error: String, pid: i32 },
    /// `pid` is 0 when no worker could be provided.
    Worker { pid: i32, error: String },
    Ack,
    Error { code: i32, message: String },
    AutostartDone { phase: u8 },
}

impl ControlReply {
    pub fn error(err: &ShuttleError) -> Self {
        ControlReply::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn encode(&self) -> Frame {
        let mut w = PayloadWriter::new();
        let command = match self {
            ControlReply::Launch { result, name, error, pid } => {
                w.put_i32(*result).put_str(name).put_str(error).put_i32(*pid);
                cmd::REPLY_LAUNCH
            }
            ControlReply::Worker { pid, error } => {
                w.put_i32(*pid).put_str(error);
                cmd::REPLY_WORKER
            }
            ControlReply::Ack => cmd::REPLY_ACK,
            ControlReply::Error { code, message } => {
                w.put_i32(*code).put_str(message);
                cmd::REPLY_ERROR
            }
            ControlReply::AutostartDone { phase } => {
                w.put_u8(*phase);
                cmd::REPLY_AUTOSTART_DONE
            }
        };
        Frame::new(command, w.finish())
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        let mut r = PayloadReader::new(&frame.payload);
        let reply = match frame.cmd {
            cmd::REPLY_LAUNCH => ControlReply::Launch {
                result: r.get_i32()?,
                name: r.get_str()?,
                error: r.get_str()?,
                pid: r.get_i32()?,
            },
            cmd::REPLY_WORKER => ControlReply::Worker {
                pid: r.get_i32()?,
                error: r.get_str()?,
            },
            cmd::REPLY_ACK => ControlReply::Ack,
            cmd::REPLY_ERROR => ControlReply::Error {
                code: r.get_i32()?,
                message: r.get_str()?,
            },
            cmd::REPLY_AUTOSTART_DONE => ControlReply::AutostartDone { phase: r.get_u8()? },
            other => return Err(ShuttleError::malformed(format!("unknown control reply {other}")).into()),
        };
        r.finish()?;
        Ok(reply)
    }
}

/// Client end of the control socket.
pub struct LauncherClient {
    conn: Connection,
}

impl LauncherClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Connection::connect(path).await?,
        })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn call(&mut self, request: &ControlRequest) -> Result<ControlReply> {
        let frame = request.encode();
        self.conn.send(frame.cmd, frame.payload).await?;
        let reply = self.conn.read().await?;
        ControlReply::decode(&reply)
    }

    /// Like `call`, but a `REPLY_ERROR` becomes an `Err`.
    async fn call_ok(&mut self, request: &ControlRequest) -> Result<ControlReply> {
        match self.call(request).await? {
            ControlReply::Error { code: c, message } => {
                if c == code::ERR_SERVICE_NOT_FOUND {
                    return Err(ShuttleError::ServiceNotFound(message).into());
                }
                Err(ShuttleError::Worker { code: c, text: message }.into())
            }
            reply => Ok(reply),
        }
    }

    async fn launch(&mut self, request: &ControlRequest) -> Result<(i32, String)> {
        match self.call_ok(request).await? {
            ControlReply::Launch { result, name, error, pid } => {
                if result < 0 {
                    return Err(ShuttleError::SpawnFailure(error).into());
                }
                Ok((pid, name))
            }
            other => bail!("unexpected reply {other:?}"),
        }
    }

    pub async fn exec_service(&mut self, name: &str, args: &[String], wait: bool) -> Result<(i32, String)> {
        self.launch(&ControlRequest::ExecService {
            name: name.to_string(),
            args: args.to_vec(),
            env: Vec::new(),
            startup_id: None,
            wait,
        })
        .await
    }

    pub async fn start_program(
        &mut self,
        argv: &[String],
        cwd: Option<&str>,
        kind: LaunchKind,
        registered_name: Option<&str>,
    ) -> Result<(i32, String)> {
        self.launch(&ControlRequest::StartProgram {
            argv: argv.to_vec(),
            env: Vec::new(),
            cwd: cwd.map(String::from),
            startup_id: None,
            tty: None,
            kind,
            registered_name: registered_name.map(String::from),
        })
        .await
    }

    async fn ack(&mut self, request: &ControlRequest) -> Result<()> {
        match self.call_ok(request).await? {
            ControlReply::Ack => Ok(()),
            other => bail!("unexpected reply {other:?}"),
        }
    }

    pub async fn set_launch_env(&mut self, name: &str, value: &str) -> Result<()> {
        self.ack(&ControlRequest::SetLaunchEnv {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
    }

    pub async fn register_name(&mut self, name: &str) -> Result<()> {
        self.ack(&ControlRequest::RegisterName { name: name.to_string() }).await
    }

    pub async fn wait_for_worker(&mut self, pid: i32) -> Result<()> {
        self.ack(&ControlRequest::WaitForWorker { pid }).await
    }

    pub async fn terminate(&mut self, session: bool) -> Result<()> {
        self.ack(&ControlRequest::Terminate { session }).await
    }

    async fn worker(&mut self, request: &ControlRequest) -> Result<Option<i32>> {
        match self.call_ok(request).await? {
            ControlReply::Worker { pid, error } => {
                if pid > 0 {
                    Ok(Some(pid))
                } else if error.is_empty() {
                    Ok(None)
                } else {
                    Err(ShuttleError::SpawnFailure(error).into())
                }
            }
            other => bail!("unexpected reply {other:?}"),
        }
    }

    /// Ask for a worker that will connect to `app_socket`.
    pub async fn request_worker(&mut self, protocol: &str, host: &str, app_socket: &Path) -> Result<i32> {
        self.worker(&ControlRequest::RequestWorker {
            protocol: protocol.to_string(),
            host: host.to_string(),
            app_socket: app_socket.to_string_lossy().into_owned(),
        })
        .await?
        .ok_or_else(|| anyhow!("no worker for protocol {protocol}"))
    }

    /// The worker parked for `url`, if any.
    pub async fn request_hold_worker(&mut self, url: &str, app_socket: &Path) -> Result<Option<i32>> {
        self.worker(&ControlRequest::RequestHoldWorker {
            url: url.to_string(),
            app_socket: app_socket.to_string_lossy().into_owned(),
        })
        .await
    }

    pub async fn autostart(&mut self, phase: u8) -> Result<()> {
        match self.call_ok(&ControlRequest::Autostart { phase }).await? {
            ControlReply::AutostartDone { .. } => Ok(()),
            other => bail!("unexpected reply {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layouts() {
        let reqs = [
            ControlRequest::ExecService {
                name: "editor".into(),
                args: vec!["a b".into(), String::new()],
                env: vec!["LANG=C".into()],
                startup_id: Some("id-1".into()),
                wait: true,
            },
            ControlRequest::StartProgram {
                argv: vec!["/bin/true".into()],
                env: Vec::new(),
                cwd: Some("/tmp".into()),
                startup_id: None,
                tty: None,
                kind: LaunchKind::Multi,
                registered_name: Some("*.true".into()),
            },
            ControlRequest::RequestWorker {
                protocol: "file".into(),
                host: String::new(),
                app_socket: "/run/x.sock".into(),
            },
            ControlRequest::Terminate { session: false },
        ];
        for req in reqs {
            assert_eq!(ControlRequest::decode(&req.encode()).unwrap(), req);
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = ControlRequest::WaitForWorker { pid: 5 }.encode();
        frame.payload.push(1);
        assert!(ControlRequest::decode(&frame).is_err());
        let mut frame = ControlReply::Ack.encode();
        frame.payload.push(0);
        assert!(ControlReply::decode(&frame).is_err());
    }

    #[test]
    fn test_start_program_needs_argv() {
        let frame = ControlRequest::StartProgram {
            argv: Vec::new(),
            env: Vec::new(),
            cwd: None,
            startup_id: None,
            tty: None,
            kind: LaunchKind::None,
            registered_name: None,
        }
        .encode();
        assert!(ControlRequest::decode(&frame).is_err());
    }

    #[tokio::test]
    async fn test_client_maps_error_reply() {
        let (a, mut b) = Connection::pair().unwrap();
        let mut client = LauncherClient::from_connection(a);
        let server = tokio::spawn(async move {
            let frame = b.read().await.unwrap();
            assert_eq!(frame.cmd, cmd::EXEC_SERVICE);
            let reply = ControlReply::error(&ShuttleError::ServiceNotFound("nope".into())).encode();
            b.send(reply.cmd, reply.payload).await.unwrap();
        });
        let err = client.exec_service("nope", &[], false).await.unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(ShuttleError::ServiceNotFound(_))
        ));
        server.await.unwrap();
    }
}
