//! Service name resolution.

use std::collections::BTreeMap;
use std::ffi::OsString;

use super::request::LaunchKind;
use crate::config::ServiceEntry;
use crate::error::ShuttleError;
use crate::spawner::find_executable;

/// A service resolved to something the spawner can start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub name: String,
    pub argv: Vec<String>,
    pub kind: LaunchKind,
    pub registered_name: String,
}

pub struct ServiceTable {
    entries: BTreeMap<String, ServiceEntry>,
    path: Option<OsString>,
}

impl ServiceTable {
    pub fn new(entries: BTreeMap<String, ServiceEntry>) -> Self {
        Self {
            entries,
            path: std::env::var_os("PATH"),
        }
    }

    /// Resolve against the configured services first, then against PATH as a
    /// plain program.
    pub fn resolve(&self, name: &str, args: &[String]) -> Result<ResolvedService, ShuttleError> {
        if let Some(entry) = self.entries.get(name) {
            let exec = if entry.exec.is_empty() { name } else { entry.exec.as_str() };
            let mut argv = vec![exec.to_string()];
            argv.extend(entry.args.iter().cloned());
            argv.extend(args.iter().cloned());
            return Ok(ResolvedService {
                name: name.to_string(),
                argv,
                kind: entry.kind,
                registered_name: entry.registered_name.clone().unwrap_or_else(|| name.to_string()),
            });
        }
        if !name.is_empty() && !find_executable(name, self.path.as_deref(), None).is_empty() {
            let mut argv = vec![name.to_string()];
            argv.extend(args.iter().cloned());
            return Ok(ResolvedService {
                name: name.to_string(),
                argv,
                kind: LaunchKind::None,
                registered_name: name.to_string(),
            });
        }
        Err(ShuttleError::ServiceNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_configured_service() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "editor".to_string(),
            ServiceEntry {
                exec: "/opt/editor/bin/edit".into(),
                args: vec!["--new-window".into()],
                kind: LaunchKind::Unique,
                registered_name: Some("org.example.editor".into()),
            },
        );
        let table = ServiceTable::new(entries);
        let svc = table.resolve("editor", &["notes.txt".into()]).unwrap();
        assert_eq!(svc.argv, vec!["/opt/editor/bin/edit", "--new-window", "notes.txt"]);
        assert_eq!(svc.kind, LaunchKind::Unique);
        assert_eq!(svc.registered_name, "org.example.editor");
    }

    #[test]
    fn test_resolve_falls_back_to_path() {
        let table = ServiceTable::new(BTreeMap::new());
        let svc = table.resolve("sh", &[]).unwrap();
        assert_eq!(svc.kind, LaunchKind::None);
        assert_eq!(
            table.resolve("no-such-service-shuttle", &[]),
            Err(ShuttleError::ServiceNotFound("no-such-service-shuttle".into()))
        );
    }
}
