//! Autostart sequencing.
//!
//! Entries of one phase are started strictly one at a time. The next entry is
//! chosen in this order:
//!
//! 1. an entry that starts after the most recently started one,
//! 2. an entry without a predecessor,
//! 3. any remaining entry whose predecessor failed or is not part of this run.
//!
//! Entries whose predecessor is still pending wait for it.

use std::collections::HashSet;
use tracing::{debug, warn};

use crate::config::AutostartEntry;

#[derive(Debug, Default)]
pub struct Autostart {
    entries: Vec<AutostartEntry>,
    phase: Option<u8>,
    remaining: Vec<AutostartEntry>,
    started: Vec<String>,
    failed: HashSet<String>,
    running: Option<String>,
}

impl Autostart {
    pub fn new(entries: Vec<AutostartEntry>) -> Self {
        Self {
            entries,
            ..Self::default()
        }
    }

    pub fn phase(&self) -> Option<u8> {
        self.phase
    }

    /// Load the entries of `phase`. Ignored when that phase (or a later one)
    /// already ran.
    pub fn begin(&mut self, phase: u8) -> bool {
        if self.phase.is_some_and(|p| p >= phase) {
            debug!(phase, "autostart phase already reached");
            return false;
        }
        self.phase = Some(phase);
        self.remaining = self.entries.iter().filter(|e| e.phase == phase).cloned().collect();
        debug!(phase, count = self.remaining.len(), "autostart phase begins");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn phase_done(&self) -> bool {
        self.phase.is_some() && self.running.is_none() && self.remaining.is_empty()
    }

    fn is_pending(&self, name: &str) -> bool {
        self.running.as_deref() == Some(name) || self.remaining.iter().any(|e| e.name == name)
    }

    fn take(&mut self, idx: usize) -> AutostartEntry {
        let entry = self.remaining.remove(idx);
        self.running = Some(entry.name.clone());
        entry
    }

    /// The next entry to launch, if none is running.
    pub fn next(&mut self) -> Option<AutostartEntry> {
        if self.running.is_some() || self.remaining.is_empty() {
            return None;
        }
        while let Some(last) = self.started.last() {
            if let Some(idx) = self
                .remaining
                .iter()
                .position(|e| e.start_after.as_deref() == Some(last.as_str()))
            {
                return Some(self.take(idx));
            }
            self.started.pop();
        }
        if let Some(idx) = self.remaining.iter().position(|e| e.start_after.is_none()) {
            return Some(self.take(idx));
        }
        let ready = self.remaining.iter().position(|e| match e.start_after.as_deref() {
            Some(after) => self.failed.contains(after) || !self.is_pending(after),
            None => true,
        });
        let idx = match ready {
            Some(idx) => idx,
            None => {
                // only cycles are left
                warn!(entry = %self.remaining[0].name, "autostart dependency cycle, starting anyway");
                0
            }
        };
        Some(self.take(idx))
    }

    /// The running entry reached a terminal state.
    pub fn finished(&mut self, name: &str, ok: bool) {
        if self.running.as_deref() != Some(name) {
            return;
        }
        self.running = None;
        if ok {
            self.started.push(name.to_string());
        } else {
            self.failed.insert(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, after: Option<&str>, phase: u8) -> AutostartEntry {
        AutostartEntry {
            name: name.into(),
            exec: name.into(),
            args: Vec::new(),
            start_after: after.map(String::from),
            phase,
        }
    }

    fn drain(auto: &mut Autostart, fail: &[&str]) -> Vec<String> {
        let mut order = Vec::new();
        while let Some(e) = auto.next() {
            auto.finished(&e.name, !fail.contains(&e.name.as_str()));
            order.push(e.name);
        }
        order
    }

    #[test]
    fn test_dependency_order() {
        let mut auto = Autostart::new(vec![
            entry("c", Some("b"), 0),
            entry("b", Some("a"), 0),
            entry("a", None, 0),
            entry("x", None, 0),
            entry("late", None, 1),
        ]);
        assert!(auto.begin(0));
        assert_eq!(drain(&mut auto, &[]), vec!["a", "b", "c", "x"]);
        assert!(auto.phase_done());
        assert!(!auto.begin(0));
        assert!(auto.begin(1));
        assert_eq!(drain(&mut auto, &[]), vec!["late"]);
    }

    #[test]
    fn test_one_at_a_time() {
        let mut auto = Autostart::new(vec![entry("a", None, 0), entry("b", None, 0)]);
        auto.begin(0);
        let first = auto.next().unwrap();
        assert!(auto.next().is_none());
        assert!(!auto.phase_done());
        auto.finished(&first.name, true);
        assert_eq!(auto.next().unwrap().name, "b");
    }

    #[test]
    fn test_failed_or_absent_predecessor() {
        let mut auto = Autostart::new(vec![
            entry("needs-missing", Some("ghost"), 0),
            entry("needs-a", Some("a"), 0),
            entry("a", None, 0),
        ]);
        auto.begin(0);
        // a fails, so needs-a is only started after everything else
        assert_eq!(drain(&mut auto, &["a"]), vec!["a", "needs-missing", "needs-a"]);
    }

    #[test]
    fn test_cycle_does_not_stall() {
        let mut auto = Autostart::new(vec![entry("p", Some("q"), 0), entry("q", Some("p"), 0)]);
        auto.begin(0);
        assert_eq!(drain(&mut auto, &[]), vec!["p", "q"]);
    }
}
