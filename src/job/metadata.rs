use anyhow::Result;
use std::collections::BTreeMap;

use crate::protocol_core::{PayloadReader, PayloadWriter};

/// Ordered key/value options exchanged with a worker ahead of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaData(BTreeMap<String, String>);

impl MetaData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Overlay `other`; its values win.
    pub fn merge(&mut self, other: MetaData) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        w.put_u32(self.0.len() as u32);
        for (k, v) in &self.0 {
            w.put_str(k).put_str(v);
        }
        w.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let n = r.get_u32()?;
        let mut map = BTreeMap::new();
        for _ in 0..n {
            let k = r.get_str()?;
            let v = r.get_str()?;
            map.insert(k, v);
        }
        r.finish()?;
        Ok(Self(map))
    }

    /// Numeric value, if present and well formed.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }
}
