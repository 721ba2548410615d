//! Job side of the job/worker protocol.
//!
//! `WorkerCommand` and `WorkerEvent` are the typed forms of the frames in both
//! directions; the worker base uses the same codec. `Dispatcher` turns a
//! worker connection into a stream of events and smooths the transfer speed.

use anyhow::Result;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::trace;

use super::entry::Entry;
use super::metadata::MetaData;
use super::scheduler::Worker;
use crate::error::ShuttleError;
use crate::protocol::timeouts::SPEED_RECALC_MS;
use crate::protocol::{command, message};
use crate::protocol_core::{Frame, PayloadReader, PayloadWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    Host { host: String, port: u16, user: String },
    Get { url: String },
    Put { url: String, permissions: Option<u32>, overwrite: bool, resume: bool },
    Stat { url: String },
    Mimetype { url: String },
    ListDir { url: String },
    Mkdir { url: String, permissions: Option<u32> },
    Rename { src: String, dst: String, overwrite: bool },
    Copy { src: String, dst: String, permissions: Option<u32>, overwrite: bool },
    Del { url: String, is_file: bool },
    Chmod { url: String, permissions: u32 },
    Special { data: Vec<u8> },
    MetaData(MetaData),
    ResumeAnswer,
    None,
    /// Park in the pool, reserved for `url`.
    Hold { url: String },
}

fn put_perms(w: &mut PayloadWriter, p: Option<u32>) {
    match p {
        Some(mode) => w.put_i32(mode as i32),
        None => w.put_i32(-1),
    };
}

fn get_perms(r: &mut PayloadReader<'_>) -> Result<Option<u32>> {
    let v = r.get_i32()?;
    Ok((v >= 0).then_some(v as u32))
}

impl WorkerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::Host { .. } => "host",
            WorkerCommand::Get { .. } => "get",
            WorkerCommand::Put { .. } => "put",
            WorkerCommand::Stat { .. } => "stat",
            WorkerCommand::Mimetype { .. } => "mimetype",
            WorkerCommand::ListDir { .. } => "listdir",
            WorkerCommand::Mkdir { .. } => "mkdir",
            WorkerCommand::Rename { .. } => "rename",
            WorkerCommand::Copy { .. } => "copy",
            WorkerCommand::Del { .. } => "del",
            WorkerCommand::Chmod { .. } => "chmod",
            WorkerCommand::Special { .. } => "special",
            WorkerCommand::MetaData(_) => "metadata",
            WorkerCommand::ResumeAnswer => "resume-answer",
            WorkerCommand::None => "none",
            WorkerCommand::Hold { .. } => "hold",
        }
    }

    /// Same command aimed at another URL (after a redirection).
    pub fn retarget(&self, url: &str) -> Self {
        let mut cmd = self.clone();
        match &mut cmd {
            WorkerCommand::Get { url: u }
            | WorkerCommand::Put { url: u, .. }
            | WorkerCommand::Stat { url: u }
            | WorkerCommand::Mimetype { url: u }
            | WorkerCommand::ListDir { url: u } => *u = url.to_string(),
            _ => {}
        }
        cmd
    }

    pub fn encode(&self) -> Frame {
        let mut w = PayloadWriter::new();
        let cmd = match self {
            WorkerCommand::Host { host, port, user } => {
                w.put_str(host).put_u32(u32::from(*port)).put_str(user);
                command::HOST
            }
            WorkerCommand::Get { url } => {
                w.put_str(url);
                command::GET
            }
            WorkerCommand::Put { url, permissions, overwrite, resume } => {
                w.put_str(url);
                put_perms(&mut w, *permissions);
                w.put_bool(*overwrite).put_bool(*resume);
                command::PUT
            }
            WorkerCommand::Stat { url } => {
                w.put_str(url);
                command::STAT
            }
            WorkerCommand::Mimetype { url } => {
                w.put_str(url);
                command::MIMETYPE
            }
            WorkerCommand::ListDir { url } => {
                w.put_str(url);
                command::LISTDIR
            }
            WorkerCommand::Mkdir { url, permissions } => {
                w.put_str(url);
                put_perms(&mut w, *permissions);
                command::MKDIR
            }
            WorkerCommand::Rename { src, dst, overwrite } => {
                w.put_str(src).put_str(dst).put_bool(*overwrite);
                command::RENAME
            }
            WorkerCommand::Copy { src, dst, permissions, overwrite } => {
                w.put_str(src).put_str(dst);
                put_perms(&mut w, *permissions);
                w.put_bool(*overwrite);
                command::COPY
            }
            WorkerCommand::Del { url, is_file } => {
                w.put_str(url).put_bool(*is_file);
                command::DEL
            }
            WorkerCommand::Chmod { url, permissions } => {
                w.put_str(url).put_u32(*permissions);
                command::CHMOD
            }
            WorkerCommand::Special { data } => {
                w.put_bytes(data);
                command::SPECIAL
            }
            WorkerCommand::MetaData(md) => return Frame::new(command::META_DATA, md.encode()),
            WorkerCommand::ResumeAnswer => command::RESUME_ANSWER,
            WorkerCommand::None => command::NONE,
            WorkerCommand::Hold { url } => {
                w.put_str(url);
                command::SLAVE_HOLD
            }
        };
        Frame::new(cmd, w.finish())
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        if frame.cmd == command::META_DATA {
            return Ok(WorkerCommand::MetaData(MetaData::decode(&frame.payload)?));
        }
        let mut r = PayloadReader::new(&frame.payload);
        let cmd = match frame.cmd {
            command::HOST => {
                let host = r.get_str()?;
                let port = u16::try_from(r.get_u32()?)
                    .map_err(|_| ShuttleError::malformed("port out of range"))?;
                WorkerCommand::Host { host, port, user: r.get_str()? }
            }
            command::GET => WorkerCommand::Get { url: r.get_str()? },
            command::PUT => WorkerCommand::Put {
                url: r.get_str()?,
                permissions: get_perms(&mut r)?,
                overwrite: r.get_bool()?,
                resume: r.get_bool()?,
            },
            command::STAT => WorkerCommand::Stat { url: r.get_str()? },
            command::MIMETYPE => WorkerCommand::Mimetype { url: r.get_str()? },
            command::LISTDIR => WorkerCommand::ListDir { url: r.get_str()? },
            command::MKDIR => WorkerCommand::Mkdir {
                url: r.get_str()?,
                permissions: get_perms(&mut r)?,
            },
            command::RENAME => WorkerCommand::Rename {
                src: r.get_str()?,
                dst: r.get_str()?,
                overwrite: r.get_bool()?,
            },
            command::COPY => WorkerCommand::Copy {
                src: r.get_str()?,
                dst: r.get_str()?,
                permissions: get_perms(&mut r)?,
                overwrite: r.get_bool()?,
            },
            command::DEL => WorkerCommand::Del {
                url: r.get_str()?,
                is_file: r.get_bool()?,
            },
            command::CHMOD => WorkerCommand::Chmod {
                url: r.get_str()?,
                permissions: r.get_u32()?,
            },
            command::SPECIAL => WorkerCommand::Special { data: r.get_bytes()? },
            command::RESUME_ANSWER => WorkerCommand::ResumeAnswer,
            command::NONE => WorkerCommand::None,
            command::SLAVE_HOLD => WorkerCommand::Hold { url: r.get_str()? },
            other => return Err(ShuttleError::malformed(format!("unknown worker command {other}")).into()),
        };
        r.finish()?;
        Ok(cmd)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A chunk of the resource; empty marks the end of the stream.
    Data(Vec<u8>),
    DataRequest,
    Error { code: i32, text: String },
    Connected,
    Finished,
    StatEntry(Entry),
    ListEntries(Vec<Entry>),
    Redirection(String),
    /// Write side: "the destination already holds this many bytes, may I
    /// continue after them?"
    CanResume(u64),
    /// Read side: "I honoured the requested start offset."
    ResumeGranted,
    MimeType(String),
    TotalSize(u64),
    ProcessedSize(u64),
    Speed(u64),
    MetaData(MetaData),
    Warning(String),
}

impl WorkerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::Finished | WorkerEvent::Error { .. })
    }

    pub fn encode(&self) -> Frame {
        let mut w = PayloadWriter::new();
        let cmd = match self {
            WorkerEvent::Data(bytes) => return Frame::new(message::DATA, bytes.clone()),
            WorkerEvent::DataRequest => message::DATA_REQUEST,
            WorkerEvent::Error { code, text } => {
                w.put_i32(*code).put_str(text);
                message::ERROR
            }
            WorkerEvent::Connected => message::CONNECTED,
            WorkerEvent::Finished => message::FINISHED,
            WorkerEvent::StatEntry(entry) => {
                entry.write_to(&mut w);
                message::STAT_ENTRY
            }
            WorkerEvent::ListEntries(entries) => return Frame::new(message::LIST_ENTRIES, Entry::encode_list(entries)),
            WorkerEvent::Redirection(url) => {
                w.put_str(url);
                message::REDIRECTION
            }
            WorkerEvent::CanResume(offset) => {
                w.put_u64(*offset);
                message::RESUME
            }
            WorkerEvent::ResumeGranted => message::CAN_RESUME,
            WorkerEvent::MimeType(mime) => {
                w.put_str(mime);
                message::MIME_TYPE
            }
            WorkerEvent::TotalSize(n) => {
                w.put_u64(*n);
                message::TOTAL_SIZE
            }
            WorkerEvent::ProcessedSize(n) => {
                w.put_u64(*n);
                message::PROCESSED_SIZE
            }
            WorkerEvent::Speed(n) => {
                w.put_u64(*n);
                message::SPEED
            }
            WorkerEvent::MetaData(md) => return Frame::new(message::META_DATA, md.encode()),
            WorkerEvent::Warning(text) => {
                w.put_str(text);
                message::WARNING
            }
        };
        Frame::new(cmd, w.finish())
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        match frame.cmd {
            message::DATA => return Ok(WorkerEvent::Data(frame.payload.clone())),
            message::LIST_ENTRIES => return Ok(WorkerEvent::ListEntries(Entry::decode_list(&frame.payload)?)),
            message::META_DATA => return Ok(WorkerEvent::MetaData(MetaData::decode(&frame.payload)?)),
            _ => {}
        }
        let mut r = PayloadReader::new(&frame.payload);
        let event = match frame.cmd {
            message::DATA_REQUEST => WorkerEvent::DataRequest,
            message::ERROR => WorkerEvent::Error {
                code: r.get_i32()?,
                text: r.get_str()?,
            },
            message::CONNECTED => WorkerEvent::Connected,
            message::FINISHED => WorkerEvent::Finished,
            message::STAT_ENTRY => WorkerEvent::StatEntry(Entry::read_from(&mut r)?),
            message::REDIRECTION => WorkerEvent::Redirection(r.get_str()?),
            message::RESUME => WorkerEvent::CanResume(r.get_u64()?),
            message::CAN_RESUME => WorkerEvent::ResumeGranted,
            message::MIME_TYPE => WorkerEvent::MimeType(r.get_str()?),
            message::TOTAL_SIZE => WorkerEvent::TotalSize(r.get_u64()?),
            message::PROCESSED_SIZE => WorkerEvent::ProcessedSize(r.get_u64()?),
            message::SPEED => WorkerEvent::Speed(r.get_u64()?),
            message::WARNING => WorkerEvent::Warning(r.get_str()?),
            other => return Err(ShuttleError::malformed(format!("unknown worker message {other}")).into()),
        };
        r.finish()?;
        Ok(event)
    }
}

const SPEED_SAMPLES: usize = 8;

/// Transfer speed over a sliding window of (time, processed bytes) samples.
#[derive(Debug, Default)]
pub struct SpeedMeter {
    samples: VecDeque<(Instant, u64)>,
    last_calc: Option<Instant>,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record progress; returns a fresh speed at most once per recalculation
    /// interval.
    pub fn sample(&mut self, now: Instant, processed: u64) -> Option<u64> {
        if let Some(&(_, last)) = self.samples.back() {
            if processed < last {
                // restarted from an earlier offset
                self.samples.clear();
            }
        }
        if self.samples.len() == SPEED_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back((now, processed));
        if let Some(at) = self.last_calc {
            if now.saturating_duration_since(at) < Duration::from_millis(SPEED_RECALC_MS) {
                return None;
            }
        }
        let (t0, b0) = *self.samples.front()?;
        let elapsed = now.saturating_duration_since(t0).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        self.last_calc = Some(now);
        Some(((processed - b0) as f64 / elapsed) as u64)
    }
}

/// A worker connection seen as a stream of events.
pub struct Dispatcher {
    worker: Worker,
    speed: SpeedMeter,
    worker_reports_speed: bool,
    pending: VecDeque<WorkerEvent>,
}

impl Dispatcher {
    pub fn new(worker: Worker) -> Self {
        Self {
            worker,
            speed: SpeedMeter::new(),
            worker_reports_speed: false,
            pending: VecDeque::new(),
        }
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn into_worker(self) -> Worker {
        self.worker
    }

    /// Queued behind earlier commands.
    pub async fn send(&mut self, cmd: &WorkerCommand) -> Result<()> {
        trace!(pid = self.worker.pid, cmd = cmd.name(), "to worker");
        let frame = cmd.encode();
        self.worker.conn.send(frame.cmd, frame.payload).await
    }

    /// Ahead of anything still queued; used for control answers.
    pub async fn send_now(&mut self, cmd: &WorkerCommand) -> Result<()> {
        trace!(pid = self.worker.pid, cmd = cmd.name(), "to worker (now)");
        let frame = cmd.encode();
        self.worker.conn.send_now(frame.cmd, &frame.payload).await
    }

    pub async fn send_data(&mut self, data: Vec<u8>) -> Result<()> {
        self.worker.conn.send(message::DATA, data).await
    }

    pub fn suspend(&mut self) {
        self.worker.conn.suspend();
    }

    pub fn resume(&mut self) {
        self.worker.conn.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.worker.conn.is_suspended()
    }

    /// Next event. Never completes while suspended.
    pub async fn next_event(&mut self) -> Result<WorkerEvent> {
        // synthesized events are held back too
        if self.is_suspended() {
            std::future::pending::<()>().await;
        }
        if let Some(ev) = self.pending.pop_front() {
            return Ok(ev);
        }
        let frame = self.worker.conn.read().await?;
        let event = WorkerEvent::decode(&frame)?;
        match &event {
            WorkerEvent::Speed(_) => self.worker_reports_speed = true,
            WorkerEvent::ProcessedSize(n) if !self.worker_reports_speed => {
                if let Some(bps) = self.speed.sample(Instant::now(), *n) {
                    self.pending.push_back(WorkerEvent::Speed(bps));
                }
            }
            _ => {}
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;

    #[test]
    fn test_command_layouts() {
        let cmds = [
            WorkerCommand::Put {
                url: "file:///tmp/x".into(),
                permissions: None,
                overwrite: true,
                resume: false,
            },
            WorkerCommand::Copy {
                src: "file:///a".into(),
                dst: "file:///b".into(),
                permissions: Some(0o600),
                overwrite: false,
            },
            WorkerCommand::Host { host: "h".into(), port: 22, user: "u".into() },
            WorkerCommand::ResumeAnswer,
        ];
        for cmd in cmds {
            assert_eq!(WorkerCommand::decode(&cmd.encode()).unwrap(), cmd);
        }
    }

    #[test]
    fn test_resume_messages_stay_distinct() {
        let put_side = WorkerEvent::CanResume(4096).encode();
        let get_side = WorkerEvent::ResumeGranted.encode();
        assert_eq!(put_side.cmd, message::RESUME);
        assert_eq!(get_side.cmd, message::CAN_RESUME);
        assert_eq!(WorkerEvent::decode(&put_side).unwrap(), WorkerEvent::CanResume(4096));
        assert_eq!(WorkerEvent::decode(&get_side).unwrap(), WorkerEvent::ResumeGranted);
    }

    #[test]
    fn test_retarget() {
        let get = WorkerCommand::Get { url: "http://a/".into() };
        assert_eq!(get.retarget("http://b/"), WorkerCommand::Get { url: "http://b/".into() });
    }

    #[test]
    fn test_speed_meter_window() {
        let mut meter = SpeedMeter::new();
        let t0 = Instant::now();
        assert_eq!(meter.sample(t0, 0), None);
        let speed = meter.sample(t0 + Duration::from_secs(1), 1000).unwrap();
        assert_eq!(speed, 1000);
        // within the recalculation interval
        assert_eq!(meter.sample(t0 + Duration::from_millis(1500), 1500), None);
        let speed = meter.sample(t0 + Duration::from_secs(2), 4000).unwrap();
        assert_eq!(speed, 2000);
        for i in 3..20u64 {
            meter.sample(t0 + Duration::from_secs(i), i * 1000);
        }
        assert!(meter.samples.len() <= SPEED_SAMPLES);
    }

    #[tokio::test]
    async fn test_dispatcher_synthesizes_speed() {
        let (a, mut b) = Connection::pair().unwrap();
        let mut d = Dispatcher::new(Worker::in_process("file", a));
        let f = WorkerEvent::ProcessedSize(0).encode();
        b.send(f.cmd, f.payload).await.unwrap();
        assert_eq!(d.next_event().await.unwrap(), WorkerEvent::ProcessedSize(0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let f = WorkerEvent::ProcessedSize(100).encode();
        b.send(f.cmd, f.payload).await.unwrap();
        assert_eq!(d.next_event().await.unwrap(), WorkerEvent::ProcessedSize(100));
        assert!(matches!(d.next_event().await.unwrap(), WorkerEvent::Speed(_)));
    }

    #[tokio::test]
    async fn test_suspended_dispatcher_holds_back_synthesized_speed() {
        let (a, mut b) = Connection::pair().unwrap();
        let mut d = Dispatcher::new(Worker::in_process("file", a));
        let f = WorkerEvent::ProcessedSize(0).encode();
        b.send(f.cmd, f.payload).await.unwrap();
        d.next_event().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let f = WorkerEvent::ProcessedSize(100).encode();
        b.send(f.cmd, f.payload).await.unwrap();
        assert_eq!(d.next_event().await.unwrap(), WorkerEvent::ProcessedSize(100));

        d.suspend();
        let held = tokio::time::timeout(Duration::from_millis(50), d.next_event()).await;
        assert!(held.is_err());

        d.resume();
        assert!(matches!(d.next_event().await.unwrap(), WorkerEvent::Speed(_)));
    }
}
