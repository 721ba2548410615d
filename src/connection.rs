//! Message-oriented duplex channel over a Unix stream socket.
//!
//! A background task owns the read half and pushes complete frames into a
//! bounded channel of depth one, so a peer that outruns us is throttled by the
//! socket buffer rather than by our memory. `read()` is cancel-safe and can sit
//! in a `tokio::select!` next to other connections.
//!
//! Suspension only gates delivery: while suspended `read()` never completes,
//! but `send()` keeps writing.

use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::path::Path;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::trace;

use crate::error::ShuttleError;
use crate::protocol::timeouts::CONNECT_MS;
use crate::protocol_core::{read_frame_async, write_frame_async, Frame};

pub struct Connection {
    writer: OwnedWriteHalf,
    inbox: Option<mpsc::Receiver<Result<Frame>>>,
    outgoing: VecDeque<Frame>,
    suspended: bool,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Wrap a stream; incoming frames are delivered through `read()`.
    pub fn new(stream: UnixStream) -> Self {
        let (rd, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(1);
        let reader = tokio::spawn(async move {
            let mut rd = rd;
            loop {
                let item = next_item(&mut rd).await;
                let stop = item.is_err();
                if tx.send(item).await.is_err() || stop {
                    break;
                }
            }
        });
        Self {
            writer,
            inbox: Some(rx),
            outgoing: VecDeque::new(),
            suspended: false,
            reader,
        }
    }

    /// Wrap a stream whose incoming frames are forwarded, tagged with `key`, into
    /// a channel shared with other connections. `read()` is unavailable.
    pub fn with_shared_inbox<K>(stream: UnixStream, key: K, inbox: mpsc::Sender<(K, Result<Frame>)>) -> Self
    where
        K: Clone + Send + 'static,
    {
        let (rd, writer) = stream.into_split();
        let reader = tokio::spawn(async move {
            let mut rd = rd;
            loop {
                let item = next_item(&mut rd).await;
                let stop = item.is_err();
                if inbox.send((key.clone(), item)).await.is_err() || stop {
                    break;
                }
            }
        });
        Self {
            writer,
            inbox: None,
            outgoing: VecDeque::new(),
            suspended: false,
            reader,
        }
    }

    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = timeout(Duration::from_millis(CONNECT_MS), UnixStream::connect(path))
            .await
            .map_err(|_| anyhow!("connect timeout ({} ms) to {}", CONNECT_MS, path.display()))?
            .with_context(|| format!("connecting to {}", path.display()))?;
        Ok(Self::new(stream))
    }

    /// Connected in-memory pair, handy for tests and in-process peers.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Queue a frame and drain the queue in order.
    pub async fn send(&mut self, cmd: u32, payload: Vec<u8>) -> Result<()> {
        self.outgoing.push_back(Frame::new(cmd, payload));
        self.flush().await
    }

    /// Queue without writing; the frame goes out with the next `send`/`flush`.
    pub fn queue(&mut self, cmd: u32, payload: Vec<u8>) {
        self.outgoing.push_back(Frame::new(cmd, payload));
    }

    /// Write immediately, ahead of anything still queued.
    pub async fn send_now(&mut self, cmd: u32, payload: &[u8]) -> Result<()> {
        trace!(cmd, len = payload.len(), "send_now");
        write_frame_async(&mut self.writer, cmd, payload)
            .await
            .map_err(|e| ShuttleError::lost(format!("write failed: {e:#}")).into())
    }

    pub async fn flush(&mut self) -> Result<()> {
        while let Some(frame) = self.outgoing.front() {
            trace!(cmd = frame.cmd, len = frame.payload.len(), "send");
            write_frame_async(&mut self.writer, frame.cmd, &frame.payload)
                .await
                .map_err(|e| ShuttleError::lost(format!("write failed: {e:#}")))?;
            self.outgoing.pop_front();
        }
        Ok(())
    }

    /// Next incoming frame. Never completes while suspended; a closed or
    /// failed peer yields `CommunicationLost`.
    pub async fn read(&mut self) -> Result<Frame> {
        if self.suspended {
            std::future::pending::<()>().await;
        }
        let inbox = self
            .inbox
            .as_mut()
            .ok_or_else(|| anyhow!("frames of this connection go to a shared inbox"))?;
        match inbox.recv().await {
            Some(item) => item,
            None => Err(ShuttleError::lost("connection reader stopped").into()),
        }
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) {
        self.suspended = false;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn queued(&self) -> usize {
        self.outgoing.len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn next_item(rd: &mut tokio::net::unix::OwnedReadHalf) -> Result<Frame> {
    match read_frame_async(rd).await {
        Ok(Some(frame)) => Ok(frame),
        Ok(None) => Err(ShuttleError::lost("peer closed the connection").into()),
        Err(e) => Err(e),
    }
}
