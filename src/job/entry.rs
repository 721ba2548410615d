use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::ShuttleError;
use crate::protocol_core::{PayloadReader, PayloadWriter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    #[default]
    File,
    Dir,
    Symlink,
    Other,
}

impl EntryKind {
    fn to_wire(self) -> u8 {
        match self {
            EntryKind::File => 0,
            EntryKind::Dir => 1,
            EntryKind::Symlink => 2,
            EntryKind::Other => 3,
        }
    }

    fn from_wire(v: u8) -> Result<Self> {
        Ok(match v {
            0 => EntryKind::File,
            1 => EntryKind::Dir,
            2 => EntryKind::Symlink,
            3 => EntryKind::Other,
            other => return Err(ShuttleError::malformed(format!("entry kind {other}")).into()),
        })
    }
}

/// One item of a stat or a directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub permissions: u32,
    /// Seconds since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }

    pub fn write_to(&self, w: &mut PayloadWriter) {
        w.put_str(&self.name)
            .put_u8(self.kind.to_wire())
            .put_u64(self.size)
            .put_u32(self.permissions)
            .put_opt_str(self.modified.map(|m| m.to_string()).as_deref())
            .put_opt_str(self.link_target.as_deref())
            .put_opt_str(self.mime_type.as_deref());
    }

    pub fn read_from(r: &mut PayloadReader<'_>) -> Result<Self> {
        let name = r.get_str()?;
        let kind = EntryKind::from_wire(r.get_u8()?)?;
        let size = r.get_u64()?;
        let permissions = r.get_u32()?;
        let modified = match r.get_opt_str()? {
            Some(s) => Some(
                s.parse::<i64>()
                    .map_err(|_| ShuttleError::malformed(format!("modified time {s:?}")))?,
            ),
            None => None,
        };
        Ok(Self {
            name,
            kind,
            size,
            permissions,
            modified,
            link_target: r.get_opt_str()?,
            mime_type: r.get_opt_str()?,
        })
    }

    pub fn encode_list(entries: &[Entry]) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        w.put_u32(entries.len() as u32);
        for e in entries {
            e.write_to(&mut w);
        }
        w.finish()
    }

    pub fn decode_list(payload: &[u8]) -> Result<Vec<Entry>> {
        let mut r = PayloadReader::new(payload);
        let n = r.get_u32()? as usize;
        let mut entries = Vec::with_capacity(n.min(4096));
        for _ in 0..n {
            entries.push(Entry::read_from(&mut r)?);
        }
        r.finish()?;
        Ok(entries)
    }
}
