//! Shared CLI helpers and small reusable Clap fragments

use clap::{Args, Parser};
use std::path::PathBuf;

use crate::logger::{LogConfig, LogLevel};

/// Diagnostics options every binary takes
#[derive(Clone, Debug, Args)]
pub struct LogOpts {
    /// Diagnostics verbosity (SHUTTLE_LOG overrides with a full filter)
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Warn, global = true)]
    pub log_level: LogLevel,

    /// Write diagnostics to this file instead of stderr
    #[arg(long = "log-output", global = true)]
    pub log_output: Option<PathBuf>,
}

impl LogOpts {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: self.log_output.clone(),
        }
    }
}

/// Options of the launcher daemon
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "shuttle launcher daemon")]
pub struct DaemonOpts {
    /// Configuration file (default: $XDG_CONFIG_HOME/shuttle/shuttle.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Control socket path (default: derived from the runtime dir)
    #[arg(long)]
    pub socket: Option<PathBuf>,

    #[command(flatten)]
    pub log: LogOpts,
}

/// Options of the process spawner
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "shuttle process spawner; starts shuttled and launches on its behalf")]
pub struct InitOpts {
    /// Configuration file handed on to the daemon
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Launcher daemon binary (default: shuttled next to this executable)
    #[arg(long)]
    pub daemon: Option<PathBuf>,

    /// Programs to start right away, outside of the daemon protocol
    #[arg(long = "start", action = clap::ArgAction::Append)]
    pub start: Vec<String>,

    #[command(flatten)]
    pub log: LogOpts,
}
