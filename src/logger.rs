//! Diagnostics logging (tracing) and the per-transfer audit log.

use anyhow::Result;
use chrono::Utc;
use clap::ValueEnum;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static INIT: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once. `SHUTTLE_LOG` overrides the level
/// with a full filter directive.
pub fn init_tracing(config: &LogConfig) -> Result<(), InitError> {
    if INIT.get().is_some() {
        return Ok(());
    }
    let filter = match std::env::var("SHUTTLE_LOG") {
        Ok(directive) if !directive.is_empty() => EnvFilter::new(directive),
        _ => EnvFilter::new(config.level.as_str()),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug);
    let result = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| InitError::Configure(e.to_string()))?;
    INIT.set(()).ok();
    Ok(())
}

/// Audit trail of jobs run by the client, one line per event.
pub trait TransferLogger: Send + Sync {
    fn start(&self, _op: &str, _src: &str, _dst: Option<&str>) {}
    fn redirected(&self, _from: &str, _to: &str) {}
    fn error(&self, _op: &str, _url: &str, _code: i32, _msg: &str) {}
    fn done(&self, _op: &str, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl TransferLogger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl TransferLogger for TextLogger {
    fn start(&self, op: &str, src: &str, dst: Option<&str>) {
        match dst {
            Some(dst) => self.line(&format!("START op={op} src={src} dst={dst}")),
            None => self.line(&format!("START op={op} url={src}")),
        }
    }
    fn redirected(&self, from: &str, to: &str) {
        self.line(&format!("REDIRECT from={from} to={to}"));
    }
    fn error(&self, op: &str, url: &str, code: i32, msg: &str) {
        self.line(&format!("ERROR op={op} url={url} code={code} msg={msg}"));
    }
    fn done(&self, op: &str, bytes: u64, seconds: f64) {
        self.line(&format!("DONE op={op} bytes={bytes} seconds={seconds:.3}"));
    }
}
