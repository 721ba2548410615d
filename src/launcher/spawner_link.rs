//! The daemon's end of the spawner channel (inherited on fd 3).

use anyhow::{Context, Result};
use std::os::unix::io::{FromRawFd, RawFd};
use tracing::trace;

use crate::connection::Connection;
use crate::protocol::launcher as cmd;
use crate::spawner::wire::{SpawnCommand, SpawnReply};

pub const SPAWNER_FD: RawFd = 3;

pub struct SpawnerLink {
    conn: Connection,
}

impl SpawnerLink {
    pub fn new(stream: tokio::net::UnixStream) -> Self {
        Self {
            conn: Connection::new(stream),
        }
    }

    /// Adopt the inherited descriptor. Must be called from inside the runtime.
    ///
    /// # Safety
    /// `fd` must be an open Unix stream socket owned by nobody else.
    pub unsafe fn from_fd(fd: RawFd) -> Result<Self> {
        let std_stream = std::os::unix::net::UnixStream::from_raw_fd(fd);
        std_stream
            .set_nonblocking(true)
            .context("spawner channel: set_nonblocking")?;
        let stream = tokio::net::UnixStream::from_std(std_stream).context("spawner channel: register")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, command: &SpawnCommand) -> Result<()> {
        let frame = command.encode();
        trace!(cmd = cmd::name(frame.cmd), "to spawner");
        self.conn.send(frame.cmd, frame.payload).await
    }

    /// Next reply or child notification. Cancel-safe.
    pub async fn read(&mut self) -> Result<SpawnReply> {
        let frame = self.conn.read().await?;
        trace!(cmd = cmd::name(frame.cmd), "from spawner");
        SpawnReply::decode(&frame)
    }
}
