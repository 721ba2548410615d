use anyhow::{Context, Result};
use clap::Parser;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use tracing::{error, info};

use shuttle::cli::InitOpts;
use shuttle::logger::init_tracing;
use shuttle::spawner::serve::{install_child_handler, SpawnerLoop};
use shuttle::spawner::wire::{ExecRequest, SpawnCommand};
use shuttle::spawner::{find_executable, sibling_binary, spawn_socketed_process, EntryRegistry, Spawner};

fn main() {
    if let Err(e) = run() {
        error!("{e:#}");
        eprintln!("shuttle-init: {e:#}");
        std::process::exit(1);
    }
}

fn daemon_binary(opts: &InitOpts) -> PathBuf {
    if let Some(path) = &opts.daemon {
        return path.clone();
    }
    sibling_binary("shuttled")
        .or_else(|| {
            let path = std::env::var_os("PATH");
            find_executable("shuttled", path.as_deref(), None).into_iter().next()
        })
        .unwrap_or_else(|| PathBuf::from("shuttled"))
}

fn run() -> Result<()> {
    let opts = InitOpts::parse();
    init_tracing(&opts.log.to_config())?;

    let dead_pipe = install_child_handler()?;
    let (ours, theirs) = UnixStream::pair().context("spawner socket pair")?;

    let mut argv: Vec<String> = Vec::new();
    if let Some(config) = &opts.config {
        argv.push("--config".into());
        argv.push(config.display().to_string());
    }
    argv.push("--log-level".into());
    argv.push(opts.log.log_level.as_str().into());
    if let Some(out) = &opts.log.log_output {
        argv.push("--log-output".into());
        argv.push(out.display().to_string());
    }

    let daemon = daemon_binary(&opts);
    let child = spawn_socketed_process(&daemon, &argv, theirs.as_raw_fd())
        .with_context(|| format!("cannot start {}", daemon.display()))?;
    drop(theirs);
    let launcher_pid = child.id() as i32;
    info!(pid = launcher_pid, daemon = %daemon.display(), "launcher started");

    let mut registry = EntryRegistry::new();
    registry.register("shuttle-file", shuttle::worker::file::entry);

    let mut spawner = SpawnerLoop::new(Spawner::new(registry), ours, Some(launcher_pid), dead_pipe);
    for program in &opts.start {
        let argv: Vec<String> = program.split_whitespace().map(String::from).collect();
        if argv.is_empty() {
            continue;
        }
        spawner.start(SpawnCommand::Exec(ExecRequest::new(argv)));
    }
    spawner.run()
}
