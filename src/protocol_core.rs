//! Shared framing and payload codec for the sync and async sides
//!
//! The spawner and the workers speak blocking `std::io`; the daemon and the job
//! engine speak tokio. Both go through the same header helpers and the same
//! `PayloadWriter`/`PayloadReader` pair so the layouts cannot drift.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ShuttleError;
use crate::protocol::{HEADER_LEN, MAX_FRAME_SIZE};

/// One framed message: command id plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(cmd: u32, payload: Vec<u8>) -> Self {
        Self { cmd, payload }
    }

    pub fn empty(cmd: u32) -> Self {
        Self { cmd, payload: Vec::new() }
    }
}

/// Validate frame payload size using protocol::MAX_FRAME_SIZE directly
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        bail!("frame payload too large: {} bytes (max: {})", size, MAX_FRAME_SIZE);
    }
    Ok(())
}

/// Build frame header (8 bytes)
/// Format: COMMAND (4, LE) | LENGTH (4, LE)
pub fn build_frame_header(cmd: u32, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&cmd.to_le_bytes());
    header[4..8].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (command, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u32, u32)> {
    let cmd = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    validate_frame_size(len as usize)
        .map_err(|e| ShuttleError::malformed(format!("header for command {cmd}: {e}")))?;
    Ok((cmd, len))
}

/// Blocking frame write used by the spawner and the workers.
pub fn write_frame<W: Write>(w: &mut W, cmd: u32, payload: &[u8]) -> Result<()> {
    validate_frame_size(payload.len())?;
    let header = build_frame_header(cmd, payload.len() as u32);
    w.write_all(&header)?;
    if !payload.is_empty() {
        w.write_all(payload)?;
    }
    w.flush()?;
    Ok(())
}

/// Blocking frame read. `Ok(None)` means the peer closed cleanly between frames.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match r.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ShuttleError::lost("peer closed inside a frame header").into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("reading frame header"),
        }
    }
    let (cmd, len) = parse_frame_header(&header)?;
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .map_err(|e| ShuttleError::lost(format!("short payload for command {cmd}: {e}")))?;
    Ok(Some(Frame { cmd, payload }))
}

pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    w: &mut W,
    cmd: u32,
    payload: &[u8],
) -> Result<()> {
    validate_frame_size(payload.len())?;
    let header = build_frame_header(cmd, payload.len() as u32);
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Async frame read. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = r
            .read(&mut header[filled..])
            .await
            .context("reading frame header")?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ShuttleError::lost("peer closed inside a frame header").into());
        }
        filled += n;
    }
    let (cmd, len) = parse_frame_header(&header)?;
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .map_err(|e| ShuttleError::lost(format!("short payload for command {cmd}: {e}")))?;
    Ok(Some(Frame { cmd, payload }))
}

/// Append-only payload builder.
///
/// `put_long` is the 64-bit integer of the launcher channel; `put_cstr` writes
/// raw bytes followed by a NUL; `put_str`/`put_bytes` are u32-length-prefixed.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.put_u8(v as u8)
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_long(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_cstr(&mut self, s: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(s);
        self.buf.push(0);
        self
    }

    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.put_bytes(s.as_bytes())
    }

    pub fn put_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.put_u32(b.len() as u32);
        self.buf.extend_from_slice(b);
        self
    }

    pub fn put_opt_str(&mut self, s: Option<&str>) -> &mut Self {
        match s {
            Some(s) => self.put_bool(true).put_str(s),
            None => self.put_bool(false),
        }
    }

    /// Count followed by that many NUL-terminated strings (argv and env blocks).
    pub fn put_block<S: AsRef<str>>(&mut self, items: &[S]) -> &mut Self {
        self.put_long(items.len() as i64);
        for item in items {
            self.put_cstr(item.as_ref().as_bytes());
        }
        self
    }

    pub fn put_str_list<S: AsRef<str>>(&mut self, items: &[S]) -> &mut Self {
        self.put_u32(items.len() as u32);
        for item in items {
            self.put_str(item.as_ref());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Cursor over a received payload. Every short read is a MalformedRequest and
/// `finish` insists the cursor landed exactly on the declared length.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let out = &self.buf[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(ShuttleError::malformed(format!(
                "payload ends before {what} (need {n} bytes at offset {}, have {})",
                self.pos,
                self.buf.len()
            ))
            .into()),
        }
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let b = self.take(4, "i32")?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8, "u64")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn get_long(&mut self) -> Result<i64> {
        let b = self.take(8, "long")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_le_bytes(raw))
    }

    pub fn get_cstr(&mut self) -> Result<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        match rest.iter().position(|b| *b == 0) {
            Some(nul) => {
                let s = &rest[..nul];
                self.pos += nul + 1;
                Ok(s)
            }
            None => Err(ShuttleError::malformed(format!(
                "unterminated string at offset {}",
                self.pos
            ))
            .into()),
        }
    }

    pub fn get_cstring(&mut self) -> Result<String> {
        let raw = self.get_cstr()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ShuttleError::malformed("string is not valid UTF-8").into())
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len, "byte string")?.to_vec())
    }

    pub fn get_str(&mut self) -> Result<String> {
        let raw = self.get_bytes()?;
        String::from_utf8(raw).map_err(|_| ShuttleError::malformed("string is not valid UTF-8").into())
    }

    pub fn get_opt_str(&mut self) -> Result<Option<String>> {
        if self.get_bool()? {
            Ok(Some(self.get_str()?))
        } else {
            Ok(None)
        }
    }

    pub fn get_block(&mut self) -> Result<Vec<String>> {
        let count = self.get_long()?;
        if count < 0 || count as usize > self.remaining() {
            return Err(ShuttleError::malformed(format!("bad block count {count}")).into());
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.get_cstring()?);
        }
        Ok(out)
    }

    pub fn get_str_list(&mut self) -> Result<Vec<String>> {
        let count = self.get_u32()? as usize;
        if count > self.remaining() {
            return Err(ShuttleError::malformed(format!("bad list count {count}")).into());
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.get_str()?);
        }
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    pub fn finish(self) -> Result<()> {
        if !self.is_at_end() {
            return Err(ShuttleError::malformed(format!(
                "payload has {} trailing bytes (parsed {} of {})",
                self.remaining(),
                self.pos,
                self.buf.len()
            ))
            .into());
        }
        Ok(())
    }
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, ShuttleError};
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_frame_header_round_trip() {
        let header = build_frame_header(42, 12345);
        let (cmd, len) = parse_frame_header(&header).unwrap();
        assert_eq!(cmd, 42);
        assert_eq!(len, 12345);
    }

    #[test]
    fn test_parse_frame_header_oversized() {
        let header = build_frame_header(1, (MAX_FRAME_SIZE + 1) as u32);
        let err = parse_frame_header(&header).unwrap_err();
        assert!(matches!(classify(&err), Some(ShuttleError::MalformedRequest(_))));
    }

    #[test]
    fn test_validate_frame_size_edge_cases() {
        assert!(validate_frame_size(0).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE + 1).is_err());
        assert!(validate_frame_size(usize::MAX).is_err());
    }

    #[test]
    fn test_sync_frame_io() {
        let mut wire = Vec::new();
        write_frame(&mut wire, 7, b"hello").unwrap();
        write_frame(&mut wire, 8, b"").unwrap();
        let mut cursor = std::io::Cursor::new(wire);
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(Frame::new(7, b"hello".to_vec())));
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(Frame::empty(8)));
        assert_eq!(read_frame(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_truncated_header_is_communication_lost() {
        let mut cursor = std::io::Cursor::new(vec![1u8, 0, 0]);
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(classify(&err), Some(ShuttleError::CommunicationLost(_))));
    }

    #[tokio::test]
    async fn test_async_frame_io() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame_async(&mut a, 3, &[1, 2, 3]).await.unwrap();
        drop(a);
        assert_eq!(read_frame_async(&mut b).await.unwrap(), Some(Frame::new(3, vec![1, 2, 3])));
        assert_eq!(read_frame_async(&mut b).await.unwrap(), None);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut w = PayloadWriter::new();
        w.put_long(5).put_u8(9);
        let payload = w.finish();
        let mut r = PayloadReader::new(&payload);
        assert_eq!(r.get_long().unwrap(), 5);
        let err = r.finish().unwrap_err();
        assert!(matches!(classify(&err), Some(ShuttleError::MalformedRequest(_))));
    }

    #[test]
    fn test_short_block_rejected() {
        let mut w = PayloadWriter::new();
        w.put_long(3).put_cstr(b"one").put_cstr(b"two");
        let payload = w.finish();
        let mut r = PayloadReader::new(&payload);
        assert!(r.get_block().is_err());
    }

    #[test]
    fn test_block_keeps_empty_and_spaced_strings() {
        let items = vec!["".to_string(), "with space".to_string(), "".to_string(), "x=y z".to_string()];
        let mut w = PayloadWriter::new();
        w.put_block(&items);
        let payload = w.finish();
        let mut r = PayloadReader::new(&payload);
        assert_eq!(r.get_block().unwrap(), items);
        r.finish().unwrap();
    }

    #[test]
    fn test_ensure_parent_exists() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("new").join("nested").join("file.txt");
        ensure_parent_exists(&file_path).unwrap();
        assert!(file_path.parent().unwrap().is_dir());
    }

    proptest! {
        #[test]
        fn prop_argv_env_round_trip(
            argv in proptest::collection::vec("[a-zA-Z0-9 ./=_-]{0,12}", 0..8),
            env in proptest::collection::vec("[A-Z_]{1,6}=[a-z0-9 :/]{0,10}", 0..6),
        ) {
            let mut w = PayloadWriter::new();
            w.put_block(&argv).put_block(&env).put_long(1);
            let payload = w.finish();
            let mut r = PayloadReader::new(&payload);
            prop_assert_eq!(r.get_block().unwrap(), argv);
            prop_assert_eq!(r.get_block().unwrap(), env);
            prop_assert_eq!(r.get_long().unwrap(), 1);
            prop_assert!(r.finish().is_ok());
        }
    }
}
