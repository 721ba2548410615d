use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use url::Url;

use shuttle::config::{DebugSettings, ShuttleConfig};
use shuttle::connection::Connection;
use shuttle::job::scheduler::LauncherScheduler;
use shuttle::job::transfer::{TransferJob, TransferStep};
use shuttle::job::{run_job, JobContext, JobEvent, KillSignal};
use shuttle::launcher::daemon::{bind_socket, Launcher};
use shuttle::launcher::pool::WorkerStatus;
use shuttle::launcher::spawner_link::SpawnerLink;
use shuttle::launcher::{LaunchKind, LauncherClient, EXIT_SPAWNER_LOST};
use shuttle::protocol::{command, message};
use shuttle::protocol_core::PayloadReader;
use shuttle::spawner::wire::{SpawnCommand, SpawnReply};

/// Plays the spawner on the other end of the daemon's fd-3 channel.
struct FakeSpawner {
    conn: Connection,
}

impl FakeSpawner {
    async fn next_command(&mut self) -> Result<SpawnCommand> {
        let frame = self.conn.read().await?;
        SpawnCommand::decode(&frame)
    }

    async fn reply(&mut self, reply: SpawnReply) -> Result<()> {
        let frame = reply.encode();
        self.conn.send(frame.cmd, frame.payload).await
    }
}

struct Harness {
    _dir: TempDir,
    control: PathBuf,
    pool: PathBuf,
}

fn harness() -> Result<(Harness, Launcher, tokio::net::UnixListener, tokio::net::UnixListener, FakeSpawner)> {
    let dir = tempfile::tempdir()?;
    let control = dir.path().join("launcher.sock");
    let pool = dir.path().join("pool.sock");
    let control_listener = bind_socket(&control)?;
    let pool_listener = bind_socket(&pool)?;
    let (ours, theirs) = tokio::net::UnixStream::pair()?;
    let launcher = Launcher::new(
        ShuttleConfig::default(),
        DebugSettings::default(),
        SpawnerLink::new(theirs),
        pool.clone(),
    );
    let spawner = FakeSpawner {
        conn: Connection::new(ours),
    };
    Ok((
        Harness {
            _dir: dir,
            control,
            pool,
        },
        launcher,
        control_listener,
        pool_listener,
        spawner,
    ))
}

async fn client(path: &Path) -> Result<LauncherClient> {
    LauncherClient::connect(path).await
}

/// Poll until the worker with `pid` sits in the pool.
async fn wait_parked(app: &mut LauncherClient, pid: i32) -> bool {
    for _ in 0..200 {
        if app.wait_for_worker(pid).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn unique_launch_replies_once_the_name_is_registered() -> Result<()> {
    let (h, launcher, control, pool, mut spawner) = harness()?;
    let daemon = launcher.run(control, pool, std::future::pending());

    let script = async {
        let mut app = client(&h.control).await?;
        let launch = async {
            let launched = app
                .start_program(&["editor".to_string()], None, LaunchKind::Unique, Some("org.example.editor"))
                .await;
            (launched, Instant::now())
        };
        let play = async {
            match spawner.next_command().await? {
                SpawnCommand::Exec(req) => assert_eq!(req.program(), "editor"),
                other => panic!("unexpected spawner command {other:?}"),
            }
            spawner.reply(SpawnReply::Ok { pid: 4242 }).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut editor = client(&h.control).await?;
            let registered_at = Instant::now();
            editor.register_name("org.example.editor").await?;
            Ok::<_, anyhow::Error>((registered_at, editor))
        };
        let ((launched, replied_at), played) = tokio::join!(launch, play);
        let (registered_at, _editor) = played?;
        let (pid, name) = launched?;
        assert!(replied_at >= registered_at);
        assert_eq!(pid, 4242);
        assert_eq!(name, "org.example.editor");

        app.terminate(false).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (code, scripted) = tokio::join!(daemon, script);
    scripted?;
    assert_eq!(code?, 0);
    Ok(())
}

#[tokio::test]
async fn wait_launch_replies_when_the_child_exits() -> Result<()> {
    let (h, launcher, control, pool, mut spawner) = harness()?;
    let daemon = launcher.run(control, pool, std::future::pending());

    let script = async {
        let mut app = client(&h.control).await?;
        let started = Instant::now();
        let argv = ["make".to_string()];
        let launch = app.start_program(&argv, Some("/tmp"), LaunchKind::Wait, None);
        let play = async {
            match spawner.next_command().await? {
                SpawnCommand::Exec(req) => assert_eq!(req.cwd.as_deref(), Some("/tmp")),
                other => panic!("unexpected spawner command {other:?}"),
            }
            spawner.reply(SpawnReply::Ok { pid: 77 }).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            spawner.reply(SpawnReply::ChildDied { pid: 77, status: 0 }).await?;
            Ok::<_, anyhow::Error>(())
        };
        let (launched, played) = tokio::join!(launch, play);
        played?;
        let (pid, _) = launched?;
        assert_eq!(pid, 77);
        assert!(started.elapsed() >= Duration::from_millis(50));

        app.terminate(false).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (code, scripted) = tokio::join!(daemon, script);
    scripted?;
    assert_eq!(code?, 0);
    Ok(())
}

#[tokio::test]
async fn spawn_error_reaches_the_client() -> Result<()> {
    let (h, launcher, control, pool, mut spawner) = harness()?;
    let daemon = launcher.run(control, pool, std::future::pending());

    let script = async {
        let mut app = client(&h.control).await?;
        let argv = ["missing-tool".to_string()];
        let launch = app.start_program(&argv, None, LaunchKind::None, None);
        let play = async {
            spawner.next_command().await?;
            spawner
                .reply(SpawnReply::Error {
                    message: "Could not find 'missing-tool' executable.".into(),
                })
                .await
        };
        let (launched, played) = tokio::join!(launch, play);
        played?;
        let err = launched.expect_err("launch should fail");
        assert!(format!("{err:#}").contains("missing-tool"));

        // the next request is dispatched normally
        let argv = ["true".to_string()];
        let launch = app.start_program(&argv, None, LaunchKind::None, None);
        let play = async {
            spawner.next_command().await?;
            spawner.reply(SpawnReply::Ok { pid: 99 }).await
        };
        let (launched, played) = tokio::join!(launch, play);
        played?;
        assert_eq!(launched?.0, 99);

        app.terminate(false).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (code, scripted) = tokio::join!(daemon, script);
    scripted?;
    assert_eq!(code?, 0);
    Ok(())
}

#[tokio::test]
async fn losing_the_spawner_stops_the_daemon() -> Result<()> {
    let (_h, launcher, control, pool, spawner) = harness()?;
    drop(spawner);
    let code = tokio::time::timeout(
        Duration::from_secs(5),
        launcher.run(control, pool, std::future::pending()),
    )
    .await??;
    assert_eq!(code, EXIT_SPAWNER_LOST);
    Ok(())
}

#[tokio::test]
async fn idle_worker_is_handed_to_the_next_job() -> Result<()> {
    let (h, launcher, control, pool, _spawner) = harness()?;
    let daemon = launcher.run(control, pool, std::future::pending());

    let script = async {
        // a worker done with its previous job parks itself
        let mut worker = Connection::connect(&h.pool).await?;
        let status_query = worker.read().await?;
        assert_eq!(status_query.cmd, command::SLAVE_STATUS);
        let status = WorkerStatus {
            pid: 3131,
            protocol: "file".into(),
            host: String::new(),
            connected: false,
            hold_url: None,
        };
        worker.send(message::SLAVE_STATUS, status.encode()).await?;

        let mut app = client(&h.control).await?;
        let mut parked = false;
        for _ in 0..100 {
            if app.wait_for_worker(3131).await.is_ok() {
                parked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(parked, "worker never showed up in the pool");

        let app_socket = h.pool.with_file_name("job.sock");
        let pid = app.request_worker("file", "", &app_socket).await?;
        assert_eq!(pid, 3131);

        let connect = worker.read().await?;
        assert_eq!(connect.cmd, command::SLAVE_CONNECT);
        let mut r = PayloadReader::new(&connect.payload);
        assert_eq!(r.get_str()?, app_socket.to_string_lossy());

        app.terminate(false).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (code, scripted) = tokio::join!(daemon, script);
    scripted?;
    assert_eq!(code?, 0);
    Ok(())
}

#[tokio::test]
async fn unknown_service_is_reported() -> Result<()> {
    let (h, launcher, control, pool, _spawner) = harness()?;
    let daemon = launcher.run(control, pool, std::future::pending());

    let script = async {
        let mut app = client(&h.control).await?;
        let err = app
            .exec_service("no-such-service-anywhere", &[], false)
            .await
            .expect_err("unknown service");
        assert!(format!("{err:#}").contains("no-such-service-anywhere"));
        app.terminate(false).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (code, scripted) = tokio::join!(daemon, script);
    scripted?;
    assert_eq!(code?, 0);
    Ok(())
}

#[tokio::test]
async fn held_worker_is_only_handed_out_for_its_url() -> Result<()> {
    let (h, launcher, control, pool, _spawner) = harness()?;
    let daemon = launcher.run(control, pool, std::future::pending());

    let script = async {
        let mut worker = Connection::connect(&h.pool).await?;
        let status_query = worker.read().await?;
        assert_eq!(status_query.cmd, command::SLAVE_STATUS);
        let status = WorkerStatus {
            pid: 4545,
            protocol: "sftp".into(),
            host: "example.org".into(),
            connected: true,
            hold_url: Some("sftp://example.org/reports/q3.pdf".into()),
        };
        worker.send(message::SLAVE_STATUS, status.encode()).await?;

        let mut app = client(&h.control).await?;
        assert!(wait_parked(&mut app, 4545).await, "worker never showed up in the pool");

        let app_socket = h.pool.with_file_name("viewer.sock");
        let other = app.request_hold_worker("sftp://example.org/reports/q4.pdf", &app_socket).await?;
        assert_eq!(other, None);

        let held = app.request_hold_worker("sftp://example.org/reports/q3.pdf", &app_socket).await?;
        assert_eq!(held, Some(4545));
        let connect = worker.read().await?;
        assert_eq!(connect.cmd, command::SLAVE_CONNECT);
        let mut r = PayloadReader::new(&connect.payload);
        assert_eq!(r.get_str()?, app_socket.to_string_lossy());

        app.terminate(false).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (code, scripted) = tokio::join!(daemon, script);
    scripted?;
    assert_eq!(code?, 0);
    Ok(())
}

#[tokio::test]
async fn put_on_hold_parks_the_worker_for_the_next_job() -> Result<()> {
    let (h, launcher, control, pool, mut spawner) = harness()?;
    let daemon = launcher.run(control, pool, std::future::pending());

    let script = async {
        let files = tempfile::tempdir()?;
        let path = files.path().join("report.txt");
        std::fs::write(&path, b"quarterly numbers")?;
        let url = Url::from_file_path(&path).map_err(|_| anyhow!("not absolute"))?;

        let mut config = ShuttleConfig::default();
        config.socket_dir = Some(h._dir.path().to_path_buf());
        let config = Arc::new(config);
        let scheduler = LauncherScheduler::new(config.clone()).with_launcher_socket(h.control.clone());
        let (ctx, mut events) = JobContext::new(Arc::new(scheduler), config);

        // nothing pooled yet: the daemon has a worker started
        let mut first = TransferJob::get(&ctx, url.clone(), None);
        let start = first.start();
        let play = async {
            let argv = match spawner.next_command().await? {
                SpawnCommand::Exec(req) => req.argv,
                other => panic!("unexpected spawner command {other:?}"),
            };
            assert_eq!(argv[1], "file");
            std::thread::spawn(move || shuttle::worker::file::entry(&argv));
            spawner.reply(SpawnReply::Ok { pid: 5151 }).await
        };
        let (started, played) = tokio::join!(start, play);
        played?;
        started?;

        // the content type is known, hand the worker over
        assert_eq!(first.next_step().await?, TransferStep::MimeType("text/plain".into()));
        first.put_on_hold().await?;
        assert!(first.is_concluded());

        let mut app = client(&h.control).await?;
        let pid = std::process::id() as i32;
        assert!(wait_parked(&mut app, pid).await, "held worker never parked");
        let stray = h._dir.path().join("stray.sock");
        assert_eq!(app.request_hold_worker("file:///somewhere/else.txt", &stray).await?, None);

        // same URL again: served by the held worker, no new launch
        while events.try_recv().is_ok() {}
        let mut second = TransferJob::get(&ctx, url.clone(), None);
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            run_job(&mut second, &mut KillSignal::never()),
        )
        .await?;
        assert_eq!(outcome, Ok(()));
        let data: Vec<u8> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                JobEvent::Data { job, data } if job == second.id() => Some(data),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(data, b"quarterly numbers");

        app.terminate(false).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (code, scripted) = tokio::join!(daemon, script);
    scripted?;
    assert_eq!(code?, 0);
    Ok(())
}
