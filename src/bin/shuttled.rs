use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use shuttle::cli::DaemonOpts;
use shuttle::config::{DebugSettings, ShuttleConfig};
use shuttle::launcher::daemon::{bind_socket, Launcher, EXIT_CONFIG};
use shuttle::launcher::spawner_link::{SpawnerLink, SPAWNER_FD};
use shuttle::logger::init_tracing;

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("shuttled: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn shutdown_signal() {
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("cannot watch SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn run() -> Result<i32> {
    let opts = DaemonOpts::parse();
    init_tracing(&opts.log.to_config())?;

    let config = match ShuttleConfig::load(opts.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("bad configuration: {e:#}");
            return Ok(EXIT_CONFIG);
        }
    };

    // Single-threaded: every piece of daemon state lives on one task.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        // SAFETY: shuttle-init hands us its end of the spawner socket on this fd.
        let spawner = unsafe { SpawnerLink::from_fd(SPAWNER_FD) }
            .context("no spawner socket; start shuttled through shuttle-init")?;

        let control_path = opts.socket.clone().unwrap_or_else(|| config.launcher_socket());
        let pool_path = config.pool_socket(std::process::id());
        let control = bind_socket(&control_path)?;
        let pool = bind_socket(&pool_path)?;
        info!(control = %control_path.display(), pool = %pool_path.display(), "launcher listening");

        let launcher = Launcher::new(config, DebugSettings::from_env(), spawner, pool_path.clone());
        let code = launcher.run(control, pool, shutdown_signal()).await;

        let _ = std::fs::remove_file(&control_path);
        let _ = std::fs::remove_file(&pool_path);
        code
    })
}
