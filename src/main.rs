//! shuttle - command-line client
//!
//! Moves data through protocol workers (`get`, `put`, `copy`, ...) and talks
//! to the launcher daemon (`exec`, `start`, `terminate`, ...).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};
use url::Url;

use shuttle::cli::LogOpts;
use shuttle::config::{ShuttleConfig, FILE_PROTOCOL};
use shuttle::error::code;
use shuttle::job::copy::{CopyOptions, FileCopyJob};
use shuttle::job::list::ListJob;
use shuttle::job::scheduler::{InProcessWorkers, LauncherScheduler, WorkerSource};
use shuttle::job::simple::SimpleJob;
use shuttle::job::stat::StatJob;
use shuttle::job::transfer::{PutOptions, TransferJob};
use shuttle::job::{
    parse_target, run_job, Entry, EntryKind, Job, JobContext, JobEvent, JobFailure, KillSignal, KillSwitch,
};
use shuttle::launcher::{LaunchKind, LauncherClient};
use shuttle::logger::{init_tracing, NoopLogger, TextLogger, TransferLogger};
use shuttle::progress::TransferProgress;
use shuttle::worker::file::FileProtocol;
use shuttle::worker::Protocol;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "shuttle - move data through protocol workers and drive the launcher daemon"
)]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/shuttle/shuttle.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serve file:// URLs from threads of this process instead of launcher workers
    #[arg(long, global = true)]
    direct: bool,

    /// Show a progress line on stderr
    #[arg(short, long, global = true)]
    progress: bool,

    /// Print entries as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Append one audit line per job event to this file
    #[arg(long = "log-file", global = true)]
    log_file: Option<PathBuf>,

    #[command(flatten)]
    log: LogOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a URL to a file or stdout
    Get {
        url: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Store a file or stdin at a URL
    Put {
        url: String,
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(long)]
        overwrite: bool,
        /// Continue a partial upload left by an earlier attempt
        #[arg(long)]
        resume: bool,
        /// Permissions of the new file, octal
        #[arg(long, value_parser = parse_mode)]
        mode: Option<u32>,
    },
    /// Copy one file between URLs
    Copy {
        src: String,
        dst: String,
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        resume: bool,
        #[arg(long, value_parser = parse_mode)]
        mode: Option<u32>,
    },
    /// Move one file between URLs
    Move {
        src: String,
        dst: String,
        #[arg(long)]
        overwrite: bool,
    },
    /// Show what is at a URL
    Stat { url: String },
    /// List a directory
    Ls {
        url: String,
        #[arg(short, long)]
        recursive: bool,
        /// Include hidden entries
        #[arg(short = 'a', long)]
        all: bool,
    },
    /// Delete a file or directory
    Rm {
        url: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Create a directory
    Mkdir {
        url: String,
        #[arg(long, value_parser = parse_mode)]
        mode: Option<u32>,
    },
    /// Change permissions
    Chmod {
        #[arg(value_parser = parse_mode)]
        mode: u32,
        url: String,
    },
    /// Determine the MIME type of a URL
    Mimetype { url: String },
    /// Start a configured service through the launcher
    Exec {
        name: String,
        args: Vec<String>,
        /// Reply only after the service exits
        #[arg(long)]
        wait: bool,
    },
    /// Start a program through the launcher
    Start {
        #[arg(required = true, trailing_var_arg = true)]
        argv: Vec<String>,
        #[arg(long)]
        cwd: Option<String>,
        /// none, unique, multi or wait
        #[arg(long, value_parser = parse_kind, default_value = "none")]
        kind: LaunchKind,
        /// Name the program registers; defaults to the program name
        #[arg(long)]
        name: Option<String>,
    },
    /// Set a variable for everything the launcher starts from now on
    Setenv { name: String, value: String },
    /// Run an autostart phase
    Autostart { phase: u8 },
    /// Stop the launcher (and with --session, the session)
    Terminate {
        #[arg(long)]
        session: bool,
    },
}

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(|e| format!("bad octal mode {s}: {e}"))
}

fn parse_kind(s: &str) -> Result<LaunchKind, String> {
    match s {
        "none" => Ok(LaunchKind::None),
        "unique" => Ok(LaunchKind::Unique),
        "multi" => Ok(LaunchKind::Multi),
        "wait" => Ok(LaunchKind::Wait),
        other => Err(format!("unknown launch kind {other}")),
    }
}

/// What the client learned about the top job once it ended.
struct Report {
    outcome: Result<(), JobFailure>,
    bytes: u64,
    seconds: f64,
}

struct Session {
    ctx: JobContext,
    events: UnboundedReceiver<JobEvent>,
    kill: KillSignal,
    logger: Arc<dyn TransferLogger>,
    progress: bool,
    json: bool,
}

impl Session {
    /// Run `job` and feed its events to `sink` until the job's own terminal
    /// event arrives.
    async fn drive<J, F>(&mut self, op: &str, url: &Url, job: &mut J, mut sink: F) -> Result<Report>
    where
        J: Job,
        F: FnMut(&JobEvent) -> Result<()>,
    {
        let started = Instant::now();
        let top = job.core().id;
        let mut current = url.to_string();
        let mut bytes = 0;
        let mut ran = false;

        let run = run_job(job, &mut self.kill);
        tokio::pin!(run);
        loop {
            tokio::select! {
                _ = &mut run, if !ran => ran = true,
                event = self.events.recv() => {
                    let Some(event) = event else { bail!("job event channel closed") };
                    sink(&event)?;
                    if event.job() != top {
                        continue;
                    }
                    match event {
                        JobEvent::ProcessedSize { size, .. } => bytes = size,
                        JobEvent::Redirection { url, .. } => {
                            self.logger.redirected(&current, &url);
                            current = url;
                        }
                        JobEvent::Result { outcome, .. } => {
                            let seconds = started.elapsed().as_secs_f64();
                            match &outcome {
                                Ok(()) => self.logger.done(op, bytes, seconds),
                                Err(f) => self.logger.error(op, &current, f.code, &f.text),
                            }
                            return Ok(Report { outcome, bytes, seconds });
                        }
                        JobEvent::Killed { .. } => {
                            let failure = JobFailure::canceled();
                            self.logger.error(op, &current, failure.code, &failure.text);
                            return Ok(Report {
                                outcome: Err(failure),
                                bytes,
                                seconds: started.elapsed().as_secs_f64(),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn get(&mut self, url: &str, output: Option<PathBuf>) -> Result<Report> {
        let url = parse_target(url)?;
        let mut out: Box<dyn Write> = match &output {
            Some(path) => Box::new(BufWriter::new(
                std::fs::File::create(path).with_context(|| format!("cannot create {}", path.display()))?,
            )),
            None => Box::new(io::stdout().lock()),
        };
        let dst = output.as_ref().map(|p| p.display().to_string());
        self.logger.start("get", url.as_str(), dst.as_deref());

        let mut job = TransferJob::get(&self.ctx, url.clone(), None);
        let top = job.id();
        let mut progress = TransferProgress::new("Fetching", top, self.progress && output.is_some());
        let report = self
            .drive("get", &url, &mut job, |event| {
                progress.on_event(event);
                if let JobEvent::Data { job, data } = event {
                    if *job == top {
                        out.write_all(data)?;
                    }
                }
                Ok(())
            })
            .await?;
        out.flush()?;
        finish_progress(&progress, &report);
        Ok(report)
    }

    async fn put(&mut self, url: &str, input: Option<PathBuf>, opts: PutOptions) -> Result<Report> {
        let url = parse_target(url)?;
        let src = input.as_ref().map(|p| p.display().to_string());
        self.logger.start("put", src.as_deref().unwrap_or("-"), Some(url.as_str()));

        let job = TransferJob::put(&self.ctx, url.clone(), opts, None);
        let mut job = match &input {
            Some(path) => job.with_source(
                tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("cannot open {}", path.display()))?,
            ),
            None => job.with_source(tokio::io::stdin()),
        };
        let mut progress = TransferProgress::new("Storing", job.id(), self.progress);
        let report = self
            .drive("put", &url, &mut job, |event| {
                progress.on_event(event);
                Ok(())
            })
            .await?;
        finish_progress(&progress, &report);
        Ok(report)
    }

    async fn copy(&mut self, src: &str, dst: &str, opts: CopyOptions) -> Result<Report> {
        let (src, dst) = (parse_target(src)?, parse_target(dst)?);
        let op = if opts.is_move { "move" } else { "copy" };
        self.logger.start(op, src.as_str(), Some(dst.as_str()));

        let mut job = FileCopyJob::new(&self.ctx, src.clone(), dst.clone(), opts);
        let stage = if opts.is_move { "Moving" } else { "Copying" };
        let mut progress = TransferProgress::new(stage, job.id(), self.progress);
        progress.print_op(stage, &format!("{src} -> {dst}"));
        let report = self
            .drive(op, &src, &mut job, |event| {
                progress.on_event(event);
                Ok(())
            })
            .await?;
        finish_progress(&progress, &report);
        Ok(report)
    }

    async fn stat(&mut self, url: &str) -> Result<Report> {
        let url = parse_target(url)?;
        self.logger.start("stat", url.as_str(), None);
        let mut job = StatJob::new(&self.ctx, url.clone(), None);
        let report = self.drive("stat", &url, &mut job, |_| Ok(())).await?;
        if let Some(entry) = job.entry() {
            print_entry(entry, self.json)?;
        }
        Ok(report)
    }

    async fn list(&mut self, url: &str, recursive: bool, all: bool) -> Result<Report> {
        let url = parse_target(url)?;
        self.logger.start("list", url.as_str(), None);
        let job = if recursive {
            ListJob::recursive(&self.ctx, url.clone(), None)
        } else {
            ListJob::new(&self.ctx, url.clone(), None)
        };
        let mut job = job.include_hidden(all);
        let top = job.id();
        let json = self.json;
        self.drive("list", &url, &mut job, |event| {
            if let JobEvent::Entries { job, entries } = event {
                if *job == top {
                    for entry in entries {
                        print_entry(entry, json)?;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn remove(&mut self, url: &str, recursive: bool) -> Result<Report> {
        let url = parse_target(url)?;
        self.logger.start("del", url.as_str(), None);
        let mut stat = StatJob::new(&self.ctx, url.clone(), None);
        let report = self.drive("stat", &url, &mut stat, |_| Ok(())).await?;
        if report.outcome.is_err() {
            return Ok(report);
        }
        let is_dir = stat.entry().is_some_and(Entry::is_dir);
        let mut job = match (is_dir, recursive) {
            (true, true) => SimpleJob::del_recursive(&self.ctx, url.clone()),
            (true, false) => SimpleJob::del(&self.ctx, url.clone(), false),
            (false, _) => SimpleJob::del(&self.ctx, url.clone(), true),
        };
        self.drive("del", &url, &mut job, |_| Ok(())).await
    }

    async fn simple(&mut self, op: &str, mut job: SimpleJob) -> Result<Report> {
        let url = job.url().clone();
        self.logger.start(op, url.as_str(), None);
        self.drive(op, &url, &mut job, |_| Ok(())).await
    }

    async fn mimetype(&mut self, url: &str) -> Result<Report> {
        let url = parse_target(url)?;
        self.logger.start("mimetype", url.as_str(), None);
        let mut job = SimpleJob::mimetype(&self.ctx, url.clone());
        let report = self.drive("mimetype", &url, &mut job, |_| Ok(())).await?;
        if let Some(mime) = job.mime_type() {
            println!("{mime}");
        }
        Ok(report)
    }
}

fn finish_progress(progress: &TransferProgress, report: &Report) {
    match &report.outcome {
        Ok(()) => progress.finish_success(),
        Err(f) => progress.finish_error(&f.to_string()),
    }
    debug!(bytes = report.bytes, seconds = report.seconds, "transfer ended");
}

fn format_entry(entry: &Entry) -> String {
    let kind = match entry.kind {
        EntryKind::Dir => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::File => '-',
        EntryKind::Other => '?',
    };
    let modified = entry
        .modified
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".repeat(16));
    let mut line = format!(
        "{kind}{:04o} {:>12} {modified} {}",
        entry.permissions & 0o7777,
        entry.size,
        entry.name
    );
    if let Some(target) = &entry.link_target {
        line.push_str(" -> ");
        line.push_str(target);
    }
    line
}

fn print_entry(entry: &Entry, json: bool) -> Result<()> {
    let mut out = io::stdout().lock();
    if json {
        writeln!(out, "{}", serde_json::to_string(entry)?)?;
    } else {
        writeln!(out, "{}", format_entry(entry))?;
    }
    Ok(())
}

fn exit_code(outcome: &Result<(), JobFailure>) -> i32 {
    match outcome {
        Ok(()) => 0,
        Err(f) if f.code == code::ERR_USER_CANCELED => {
            eprintln!("Interrupted by user.");
            130
        }
        Err(f) => {
            eprintln!("shuttle: {f}");
            1
        }
    }
}

fn worker_source(direct: bool, config: &Arc<ShuttleConfig>) -> Arc<dyn WorkerSource> {
    if direct {
        let mut workers = InProcessWorkers::new();
        workers.register(
            FILE_PROTOCOL,
            Arc::new(|| Box::new(FileProtocol::new()) as Box<dyn Protocol + Send>),
        );
        Arc::new(workers)
    } else {
        Arc::new(LauncherScheduler::new(config.clone()))
    }
}

async fn launcher_command(config: &ShuttleConfig, command: Command) -> Result<i32> {
    let socket = config.launcher_socket();
    let mut client = LauncherClient::connect(&socket)
        .await
        .with_context(|| format!("cannot reach the launcher at {}", socket.display()))?;
    match command {
        Command::Exec { name, args, wait } => {
            let (pid, name) = client.exec_service(&name, &args, wait).await?;
            println!("{pid} {name}");
        }
        Command::Start { argv, cwd, kind, name } => {
            let (pid, name) = client.start_program(&argv, cwd.as_deref(), kind, name.as_deref()).await?;
            println!("{pid} {name}");
        }
        Command::Setenv { name, value } => client.set_launch_env(&name, &value).await?,
        Command::Autostart { phase } => client.autostart(phase).await?,
        Command::Terminate { session } => client.terminate(session).await?,
        other => bail!("not a launcher command: {other:?}"),
    }
    Ok(0)
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Arc::new(ShuttleConfig::load(cli.config.as_deref())?);

    if matches!(
        cli.command,
        Command::Exec { .. }
            | Command::Start { .. }
            | Command::Setenv { .. }
            | Command::Autostart { .. }
            | Command::Terminate { .. }
    ) {
        return launcher_command(&config, cli.command).await;
    }

    let (ctx, events) = JobContext::new(worker_source(cli.direct, &config), config.clone());
    let (switch, kill) = KillSwitch::pair();
    let interrupted = AtomicBool::new(false);
    if let Err(e) = ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        switch.kill();
    }) {
        warn!("cannot install Ctrl-C handler: {e}");
    }

    let logger: Arc<dyn TransferLogger> = match &cli.log_file {
        Some(path) => match TextLogger::new(path) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                warn!("cannot open {}: {e:#}", path.display());
                Arc::new(NoopLogger)
            }
        },
        None => Arc::new(NoopLogger),
    };

    let mut session = Session {
        ctx,
        events,
        kill,
        logger,
        progress: cli.progress,
        json: cli.json,
    };
    let report = match cli.command {
        Command::Get { url, output } => session.get(&url, output).await?,
        Command::Put {
            url,
            input,
            overwrite,
            resume,
            mode,
        } => {
            let opts = PutOptions {
                overwrite,
                resume,
                permissions: mode,
            };
            session.put(&url, input, opts).await?
        }
        Command::Copy {
            src,
            dst,
            overwrite,
            resume,
            mode,
        } => {
            let opts = CopyOptions {
                permissions: mode,
                overwrite,
                resume,
                is_move: false,
            };
            session.copy(&src, &dst, opts).await?
        }
        Command::Move { src, dst, overwrite } => {
            let opts = CopyOptions {
                overwrite,
                is_move: true,
                ..CopyOptions::default()
            };
            session.copy(&src, &dst, opts).await?
        }
        Command::Stat { url } => session.stat(&url).await?,
        Command::Ls { url, recursive, all } => session.list(&url, recursive, all).await?,
        Command::Rm { url, recursive } => session.remove(&url, recursive).await?,
        Command::Mkdir { url, mode } => {
            let job = SimpleJob::mkdir(&session.ctx, parse_target(&url)?, mode);
            session.simple("mkdir", job).await?
        }
        Command::Chmod { mode, url } => {
            let job = SimpleJob::chmod(&session.ctx, parse_target(&url)?, mode);
            session.simple("chmod", job).await?
        }
        Command::Mimetype { url } => session.mimetype(&url).await?,
        other => bail!("unhandled command {other:?}"),
    };
    Ok(exit_code(&report.outcome))
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(&cli.log.to_config()) {
        eprintln!("shuttle: {e}");
    }

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("shuttle: Failed to build tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    let code = match rt.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("shuttle: {e:#}");
            1
        }
    };
    std::process::exit(code);
}
