//! TOML configuration and session paths.
//!
//! ```toml
//! idle_ceiling_secs = 30
//! sweep_interval_secs = 10
//!
//! [protocols.file]
//! exec = "shuttle-file"
//!
//! [protocols.archive]
//! exec = "/usr/lib/shuttle/archive-worker"
//! copy_from_file = true
//!
//! [services.editor]
//! exec = "editor"
//! kind = "unique"
//! registered_name = "org.example.editor"
//!
//! [[autostart]]
//! name = "indexer"
//! exec = "indexer"
//! start_after = "editor"
//! phase = 1
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::launcher::request::LaunchKind;

pub const FILE_PROTOCOL: &str = "file";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuttleConfig {
    pub socket_dir: Option<PathBuf>,
    pub idle_ceiling_secs: u64,
    pub sweep_interval_secs: u64,
    pub keep_warm_protocol: String,
    pub protocols: BTreeMap<String, ProtocolInfo>,
    pub services: BTreeMap<String, ServiceEntry>,
    pub autostart: Vec<AutostartEntry>,
}

/// How to start a worker for a protocol and which cross-scheme shortcuts it offers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolInfo {
    pub exec: String,
    /// Workers can produce data (GET).
    pub input: bool,
    /// Workers can accept data (PUT).
    pub output: bool,
    pub copy_from_file: bool,
    pub copy_to_file: bool,
    pub rename_from_file: bool,
    pub rename_to_file: bool,
}

impl Default for ProtocolInfo {
    fn default() -> Self {
        Self {
            exec: String::new(),
            input: true,
            output: true,
            copy_from_file: false,
            copy_to_file: false,
            rename_from_file: false,
            rename_to_file: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEntry {
    pub exec: String,
    pub args: Vec<String>,
    pub kind: LaunchKind,
    pub registered_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutostartEntry {
    pub name: String,
    pub exec: String,
    pub args: Vec<String>,
    pub start_after: Option<String>,
    pub phase: u8,
}

impl Default for ShuttleConfig {
    fn default() -> Self {
        let mut protocols = BTreeMap::new();
        protocols.insert(
            FILE_PROTOCOL.to_string(),
            ProtocolInfo {
                exec: "shuttle-file".to_string(),
                ..ProtocolInfo::default()
            },
        );
        Self {
            socket_dir: None,
            idle_ceiling_secs: 30,
            sweep_interval_secs: 10,
            keep_warm_protocol: FILE_PROTOCOL.to_string(),
            protocols,
            services: BTreeMap::new(),
            autostart: Vec::new(),
        }
    }
}

impl ShuttleConfig {
    /// Load `path`, or the per-user default location. A missing default file
    /// yields the built-in defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() && !required {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let mut cfg: ShuttleConfig = toml::from_str(text)?;
        // the file worker is always available unless overridden
        cfg.protocols
            .entry(FILE_PROTOCOL.to_string())
            .or_insert_with(|| ProtocolInfo {
                exec: "shuttle-file".to_string(),
                ..ProtocolInfo::default()
            });
        Ok(cfg)
    }

    pub fn idle_ceiling(&self) -> Duration {
        Duration::from_secs(self.idle_ceiling_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn protocol(&self, name: &str) -> Option<&ProtocolInfo> {
        self.protocols.get(name)
    }

    pub fn runtime_dir(&self) -> PathBuf {
        if let Some(dir) = &self.socket_dir {
            return dir.clone();
        }
        match std::env::var_os("XDG_RUNTIME_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => std::env::temp_dir().join(format!("shuttle-{}", user_name())),
        }
    }

    fn session_prefix(&self) -> PathBuf {
        self.runtime_dir()
            .join(format!("shuttle-{}_{}", user_name(), host_name()))
    }

    /// Control socket of the launcher daemon; `SHUTTLE_LAUNCHER_SOCKET` wins.
    pub fn launcher_socket(&self) -> PathBuf {
        if let Some(p) = std::env::var_os("SHUTTLE_LAUNCHER_SOCKET") {
            return PathBuf::from(p);
        }
        let mut p = self.session_prefix().into_os_string();
        p.push(".launcher");
        PathBuf::from(p)
    }

    /// Pool registration socket of the daemon with the given pid.
    pub fn pool_socket(&self, pid: u32) -> PathBuf {
        let mut p = self.session_prefix().into_os_string();
        p.push(format!(".pool-{pid}"));
        PathBuf::from(p)
    }

    /// A fresh, unique socket a job listens on for one worker to connect back.
    pub fn app_socket(&self) -> PathBuf {
        self.runtime_dir()
            .join(format!("shuttle-app-{}.sock", uuid::Uuid::new_v4().simple()))
    }
}

fn default_config_path() -> Option<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(std::env::var_os("HOME")?).join(".config"),
    };
    Some(base.join("shuttle").join("shuttle.toml"))
}

pub fn user_name() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| unsafe { libc::getuid() }.to_string())
}

pub fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Diagnostics switches read from the daemon's environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugSettings {
    /// Protocol whose workers start stopped, waiting for a debugger.
    pub worker_debug: Option<String>,
    /// Protocol whose workers run under valgrind.
    pub worker_valgrind: Option<String>,
    pub valgrind_skin: Option<String>,
}

impl DebugSettings {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            worker_debug: var("SHUTTLE_WORKER_DEBUG"),
            worker_valgrind: var("SHUTTLE_WORKER_VALGRIND"),
            valgrind_skin: var("SHUTTLE_WORKER_VALGRIND_SKIN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ShuttleConfig::default();
        assert_eq!(cfg.idle_ceiling(), Duration::from_secs(30));
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(10));
        assert_eq!(cfg.protocol("file").unwrap().exec, "shuttle-file");
    }

    #[test]
    fn test_parse_full_config() {
        let cfg = ShuttleConfig::from_toml(
            r#"
            idle_ceiling_secs = 5

            [protocols.archive]
            exec = "/opt/archive-worker"
            copy_from_file = true

            [services.editor]
            exec = "editor"
            kind = "unique"
            registered_name = "org.example.editor"

            [[autostart]]
            name = "indexer"
            exec = "indexer"
            start_after = "editor"
            phase = 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.idle_ceiling_secs, 5);
        assert_eq!(cfg.sweep_interval_secs, 10);
        let archive = cfg.protocol("archive").unwrap();
        assert!(archive.copy_from_file);
        assert!(archive.input && archive.output);
        assert!(cfg.protocol("file").is_some());
        let editor = &cfg.services["editor"];
        assert_eq!(editor.kind, LaunchKind::Unique);
        assert_eq!(editor.registered_name.as_deref(), Some("org.example.editor"));
        assert_eq!(cfg.autostart[0].start_after.as_deref(), Some("editor"));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(ShuttleConfig::load(Some(Path::new("/definitely/not/here.toml"))).is_err());
    }

    #[test]
    fn test_socket_names() {
        let cfg = ShuttleConfig {
            socket_dir: Some(PathBuf::from("/run/test")),
            ..ShuttleConfig::default()
        };
        let pool = cfg.pool_socket(42);
        assert!(pool.starts_with("/run/test"));
        assert!(pool.to_string_lossy().ends_with(".pool-42"));
        assert_ne!(cfg.app_socket(), cfg.app_socket());
    }
}
