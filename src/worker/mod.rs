//! Worker side of the job/worker protocol.
//!
//! A worker process serves one job connection at a time. Commands are
//! decoded by `WorkerBase` and handed to a `Protocol` implementation, which
//! reports back through `WorkerIo`. When the job hangs up the worker parks
//! itself in the launcher's pool and waits to be handed to the next job.

pub mod file;

use anyhow::{anyhow, Result};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{classify, code, ShuttleError};
use crate::job::dispatch::{WorkerCommand, WorkerEvent};
use crate::job::{Entry, MetaData};
use crate::launcher::pool::WorkerStatus;
use crate::protocol::{command, message};
use crate::protocol_core::{read_frame, write_frame, PayloadReader};

/// Error a protocol returns for a command it does not implement.
pub fn unsupported(what: &str) -> anyhow::Error {
    ShuttleError::Worker {
        code: code::ERR_UNSUPPORTED_ACTION,
        text: what.to_string(),
    }
    .into()
}

/// Error carrying a wire code, surfaced verbatim to the job.
pub fn fail(code: i32, text: impl Into<String>) -> anyhow::Error {
    ShuttleError::Worker { code, text: text.into() }.into()
}

/// One I/O protocol. Every command defaults to "unsupported".
///
/// Returning `Ok` without calling `finished` or `error` finishes the command.
#[allow(unused_variables)]
pub trait Protocol {
    fn set_host(&mut self, host: &str, port: u16, user: &str) {}

    fn get(&mut self, io: &mut WorkerIo<'_>, url: &Url) -> Result<()> {
        Err(unsupported("get"))
    }

    fn put(&mut self, io: &mut WorkerIo<'_>, url: &Url, permissions: Option<u32>, overwrite: bool, resume: bool) -> Result<()> {
        Err(unsupported("put"))
    }

    fn stat(&mut self, io: &mut WorkerIo<'_>, url: &Url) -> Result<()> {
        Err(unsupported("stat"))
    }

    fn mimetype(&mut self, io: &mut WorkerIo<'_>, url: &Url) -> Result<()> {
        Err(unsupported("mimetype"))
    }

    fn list_dir(&mut self, io: &mut WorkerIo<'_>, url: &Url) -> Result<()> {
        Err(unsupported("listdir"))
    }

    fn mkdir(&mut self, io: &mut WorkerIo<'_>, url: &Url, permissions: Option<u32>) -> Result<()> {
        Err(unsupported("mkdir"))
    }

    fn rename(&mut self, io: &mut WorkerIo<'_>, src: &Url, dst: &Url, overwrite: bool) -> Result<()> {
        Err(unsupported("rename"))
    }

    fn copy(&mut self, io: &mut WorkerIo<'_>, src: &Url, dst: &Url, permissions: Option<u32>, overwrite: bool) -> Result<()> {
        Err(unsupported("copy"))
    }

    fn del(&mut self, io: &mut WorkerIo<'_>, url: &Url, is_file: bool) -> Result<()> {
        Err(unsupported("del"))
    }

    fn chmod(&mut self, io: &mut WorkerIo<'_>, url: &Url, permissions: u32) -> Result<()> {
        Err(unsupported("chmod"))
    }

    fn special(&mut self, io: &mut WorkerIo<'_>, data: &[u8]) -> Result<()> {
        Err(unsupported("special"))
    }
}

/// What a protocol implementation uses to talk to its job.
pub struct WorkerIo<'a> {
    stream: &'a mut UnixStream,
    incoming: &'a mut MetaData,
    outgoing: MetaData,
    resume_offered: bool,
    concluded: bool,
}

impl<'a> WorkerIo<'a> {
    fn new(stream: &'a mut UnixStream, incoming: &'a mut MetaData) -> Self {
        Self {
            stream,
            incoming,
            outgoing: MetaData::new(),
            resume_offered: false,
            concluded: false,
        }
    }

    fn send(&mut self, event: &WorkerEvent) -> Result<()> {
        let frame = event.encode();
        write_frame(self.stream, frame.cmd, &frame.payload)
    }

    fn flush_metadata(&mut self) -> Result<()> {
        if self.outgoing.is_empty() {
            return Ok(());
        }
        let md = std::mem::take(&mut self.outgoing);
        self.send(&WorkerEvent::MetaData(md))
    }

    /// Option set by the job for the current command.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.incoming.get(key)
    }

    pub fn metadata_u64(&self, key: &str) -> Option<u64> {
        self.incoming.get_u64(key)
    }

    /// Queued for the job; goes out ahead of the next data or `finished`.
    pub fn set_metadata(&mut self, key: &str, value: impl Into<String>) {
        self.outgoing.insert(key, value);
    }

    pub fn data(&mut self, bytes: &[u8]) -> Result<()> {
        self.flush_metadata()?;
        self.send(&WorkerEvent::Data(bytes.to_vec()))
    }

    /// Ask the job for the next chunk to write; empty means no more.
    pub fn data_request(&mut self) -> Result<Vec<u8>> {
        if !self.resume_offered {
            self.can_resume_at(0)?;
        }
        self.flush_metadata()?;
        self.send(&WorkerEvent::DataRequest)?;
        loop {
            let frame = self.read()?;
            match frame.cmd {
                message::DATA => return Ok(frame.payload),
                command::META_DATA => self.incoming.merge(MetaData::decode(&frame.payload)?),
                other => return Err(ShuttleError::malformed(format!("expected data, got command {other}")).into()),
            }
        }
    }

    /// Write side: `offset` bytes are already in place. Blocks for the job's
    /// answer when non-zero; `true` means continue after them.
    pub fn can_resume_at(&mut self, offset: u64) -> Result<bool> {
        self.resume_offered = true;
        self.send(&WorkerEvent::CanResume(offset))?;
        if offset == 0 {
            return Ok(true);
        }
        loop {
            let frame = self.read()?;
            match frame.cmd {
                command::RESUME_ANSWER => return Ok(true),
                command::NONE => return Ok(false),
                command::META_DATA => self.incoming.merge(MetaData::decode(&frame.payload)?),
                other => {
                    return Err(ShuttleError::ResumeNegotiationFailure(format!("unexpected command {other}")).into())
                }
            }
        }
    }

    /// Read side: the requested start offset is honoured.
    pub fn can_resume(&mut self) -> Result<()> {
        self.send(&WorkerEvent::ResumeGranted)
    }

    pub fn total_size(&mut self, size: u64) -> Result<()> {
        self.send(&WorkerEvent::TotalSize(size))
    }

    pub fn processed_size(&mut self, size: u64) -> Result<()> {
        self.send(&WorkerEvent::ProcessedSize(size))
    }

    pub fn mime_type(&mut self, mime: &str) -> Result<()> {
        self.send(&WorkerEvent::MimeType(mime.to_string()))
    }

    pub fn redirection(&mut self, url: &Url) -> Result<()> {
        self.send(&WorkerEvent::Redirection(url.to_string()))
    }

    pub fn warning(&mut self, text: &str) -> Result<()> {
        self.send(&WorkerEvent::Warning(text.to_string()))
    }

    pub fn stat_entry(&mut self, entry: Entry) -> Result<()> {
        self.send(&WorkerEvent::StatEntry(entry))
    }

    pub fn list_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.send(&WorkerEvent::ListEntries(entries))
    }

    pub fn finished(&mut self) -> Result<()> {
        self.flush_metadata()?;
        self.concluded = true;
        self.send(&WorkerEvent::Finished)
    }

    pub fn error(&mut self, code: i32, text: &str) -> Result<()> {
        self.concluded = true;
        self.send(&WorkerEvent::Error { code, text: text.to_string() })
    }

    fn read(&mut self) -> Result<crate::protocol_core::Frame> {
        read_frame(self.stream)?.ok_or_else(|| ShuttleError::lost("job hung up mid-command").into())
    }
}

/// Command loop and pool parking around a `Protocol`.
pub struct WorkerBase {
    scheme: String,
    protocol: Box<dyn Protocol + Send>,
    metadata: MetaData,
    host: String,
    hold_url: Option<String>,
}

fn parse_url(s: &str) -> Result<Url> {
    Url::parse(s).map_err(|e| fail(code::ERR_MALFORMED_URL, format!("{s}: {e}")))
}

impl WorkerBase {
    pub fn new(scheme: &str, protocol: Box<dyn Protocol + Send>) -> Self {
        Self {
            scheme: scheme.to_string(),
            protocol,
            metadata: MetaData::new(),
            host: String::new(),
            hold_url: None,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            pid: std::process::id() as i32,
            protocol: self.scheme.clone(),
            host: self.host.clone(),
            connected: !self.host.is_empty(),
            hold_url: self.hold_url.clone(),
        }
    }

    /// Serve one job connection until it hangs up or puts us on hold.
    pub fn serve_once(&mut self, stream: &mut UnixStream) -> Result<()> {
        while let Some(frame) = read_frame(stream)? {
            let cmd = match WorkerCommand::decode(&frame) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!("undecodable command {}: {e:#}", frame.cmd);
                    let event = WorkerEvent::Error {
                        code: code::ERR_MALFORMED_REQUEST,
                        text: format!("{e:#}"),
                    };
                    let f = event.encode();
                    write_frame(stream, f.cmd, &f.payload)?;
                    continue;
                }
            };
            match cmd {
                WorkerCommand::MetaData(md) => self.metadata.merge(md),
                WorkerCommand::Host { host, port, user } => {
                    self.protocol.set_host(&host, port, &user);
                    self.host = host;
                }
                WorkerCommand::Hold { url } => {
                    debug!(%url, "put on hold");
                    self.hold_url = Some(url);
                    return Ok(());
                }
                WorkerCommand::ResumeAnswer | WorkerCommand::None => {}
                cmd => self.dispatch(stream, cmd)?,
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, stream: &mut UnixStream, cmd: WorkerCommand) -> Result<()> {
        let name = cmd.name();
        debug!(cmd = name, "command");
        let mut metadata = std::mem::take(&mut self.metadata);
        let mut io = WorkerIo::new(stream, &mut metadata);
        let protocol = &mut self.protocol;
        let outcome = (|| match &cmd {
            WorkerCommand::Get { url } => protocol.get(&mut io, &parse_url(url)?),
            WorkerCommand::Put { url, permissions, overwrite, resume } => {
                protocol.put(&mut io, &parse_url(url)?, *permissions, *overwrite, *resume)
            }
            WorkerCommand::Stat { url } => protocol.stat(&mut io, &parse_url(url)?),
            WorkerCommand::Mimetype { url } => protocol.mimetype(&mut io, &parse_url(url)?),
            WorkerCommand::ListDir { url } => protocol.list_dir(&mut io, &parse_url(url)?),
            WorkerCommand::Mkdir { url, permissions } => protocol.mkdir(&mut io, &parse_url(url)?, *permissions),
            WorkerCommand::Rename { src, dst, overwrite } => {
                protocol.rename(&mut io, &parse_url(src)?, &parse_url(dst)?, *overwrite)
            }
            WorkerCommand::Copy { src, dst, permissions, overwrite } => {
                protocol.copy(&mut io, &parse_url(src)?, &parse_url(dst)?, *permissions, *overwrite)
            }
            WorkerCommand::Del { url, is_file } => protocol.del(&mut io, &parse_url(url)?, *is_file),
            WorkerCommand::Chmod { url, permissions } => protocol.chmod(&mut io, &parse_url(url)?, *permissions),
            WorkerCommand::Special { data } => protocol.special(&mut io, data),
            other => Err(anyhow!("{} is not a job command", other.name())),
        })();
        match outcome {
            Ok(()) if !io.concluded => io.finished(),
            Ok(()) => Ok(()),
            Err(e) if matches!(classify(&e), Some(ShuttleError::CommunicationLost(_))) => Err(e),
            Err(e) => match classify(&e) {
                Some(ShuttleError::Worker { code, text }) if !io.concluded => io.error(*code, text),
                Some(other) if !io.concluded => io.error(other.code(), &other.to_string()),
                None if !io.concluded => {
                    let text = format!("{e:#}");
                    io.error(code::ERR_INTERNAL, &text)
                }
                _ => {
                    warn!(cmd = name, "error after the command concluded: {e:#}");
                    Ok(())
                }
            },
        }
    }

    /// Wait in the pool. Returns the socket of the next job, or `None` when
    /// the launcher let go of us.
    pub fn park(&mut self, pool_socket: &Path) -> Result<Option<PathBuf>> {
        let mut stream = match UnixStream::connect(pool_socket) {
            Ok(s) => s,
            Err(e) => {
                debug!("no pool at {}: {e}", pool_socket.display());
                return Ok(None);
            }
        };
        while let Some(frame) = read_frame(&mut stream)? {
            match frame.cmd {
                command::SLAVE_STATUS => {
                    write_frame(&mut stream, message::SLAVE_STATUS, &self.status().encode())?;
                }
                command::SLAVE_CONNECT => {
                    let mut r = PayloadReader::new(&frame.payload);
                    let app = r.get_str()?;
                    r.finish()?;
                    // the launcher may already have closed its end
                    let _ = write_frame(&mut stream, message::SLAVE_ACK, &[]);
                    self.hold_url = None;
                    return Ok(Some(PathBuf::from(app)));
                }
                other => debug!(cmd = other, "ignoring pool command"),
            }
        }
        Ok(None)
    }

    /// Serve `app_socket`, then keep serving whatever the pool hands us
    /// until the launcher drops us.
    pub fn run(&mut self, pool_socket: Option<&Path>, app_socket: Option<&Path>) -> Result<()> {
        let mut next = app_socket.map(Path::to_path_buf);
        loop {
            if let Some(app) = next.take() {
                match UnixStream::connect(&app) {
                    Ok(mut stream) => {
                        info!(protocol = %self.scheme, app = %app.display(), "serving job");
                        if let Err(e) = self.serve_once(&mut stream) {
                            warn!("job connection failed: {e:#}");
                        }
                    }
                    Err(e) => warn!("cannot reach {}: {e}", app.display()),
                }
                self.metadata.clear();
            }
            let Some(pool) = pool_socket else {
                return Ok(());
            };
            match self.park(pool)? {
                Some(app) => next = Some(app),
                None => {
                    debug!("leaving the pool");
                    return Ok(());
                }
            }
        }
    }
}
