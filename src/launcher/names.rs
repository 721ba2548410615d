//! Names announced by running programs.
//!
//! A launched program that is started as `unique` or `multi` is only
//! considered up once it registers its well-known name on the control socket.
//! Registrations live as long as the registering connection.

use std::collections::BTreeMap;

pub type OwnerId = u64;

/// `editor-1234` -> `editor`; names without a dash are returned unchanged.
fn strip_pid_suffix(name: &str) -> &str {
    match name.rsplit_once('-') {
        Some((base, _)) if !base.is_empty() => base,
        _ => name,
    }
}

/// Whether `registered` satisfies a request waiting for `wanted`.
///
/// Exact equality always matches. With `tolerant` set, instance suffixes
/// (`-<pid>`) are ignored and a `*.name` pattern matches any name whose last
/// dot component is `name`.
pub fn matches_pending(wanted: &str, registered: &str, tolerant: bool) -> bool {
    if wanted == registered {
        return true;
    }
    if !tolerant {
        return false;
    }
    let base = strip_pid_suffix(registered);
    if let Some(tail) = wanted.strip_prefix("*.") {
        return base.rsplit('.').next() == Some(tail);
    }
    wanted == base
}

#[derive(Debug, Default)]
pub struct NameRegistry {
    names: BTreeMap<String, OwnerId>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the name is already held by someone else.
    pub fn register(&mut self, name: &str, owner: OwnerId) -> bool {
        match self.names.get(name) {
            Some(current) if *current != owner => false,
            _ => {
                self.names.insert(name.to_string(), owner);
                true
            }
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn find(&self, wanted: &str, tolerant: bool) -> Option<&str> {
        self.names
            .keys()
            .find(|n| matches_pending(wanted, n, tolerant))
            .map(String::as_str)
    }

    /// Drop every name held by `owner`; returns them.
    pub fn unregister_owner(&mut self, owner: OwnerId) -> Vec<String> {
        let gone: Vec<String> = self
            .names
            .iter()
            .filter(|(_, o)| **o == owner)
            .map(|(n, _)| n.clone())
            .collect();
        for n in &gone {
            self.names.remove(n);
        }
        gone
    }
}
