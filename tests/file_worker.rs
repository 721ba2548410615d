use anyhow::{anyhow, Result};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

use shuttle::config::{ShuttleConfig, FILE_PROTOCOL};
use shuttle::error::code;
use shuttle::job::copy::FileCopyJob;
use shuttle::job::list::ListJob;
use shuttle::job::scheduler::InProcessWorkers;
use shuttle::job::simple::SimpleJob;
use shuttle::job::stat::StatJob;
use shuttle::job::transfer::{PutOptions, TransferJob};
use shuttle::job::{run_job, Entry, EntryKind, Job, JobContext, JobEvent, JobFailure, KillSignal};
use shuttle::worker::file::FileProtocol;
use shuttle::worker::Protocol;

fn context() -> (JobContext, UnboundedReceiver<JobEvent>) {
    let mut workers = InProcessWorkers::new();
    workers.register(
        FILE_PROTOCOL,
        Arc::new(|| Box::new(FileProtocol::new()) as Box<dyn Protocol + Send>),
    );
    JobContext::new(Arc::new(workers), Arc::new(ShuttleConfig::default()))
}

fn file_url(path: &Path) -> Url {
    Url::from_file_path(path).unwrap()
}

async fn run<J: Job>(job: &mut J) -> Result<(), JobFailure> {
    run_job(job, &mut KillSignal::never()).await
}

async fn ok<J: Job>(job: &mut J) -> Result<()> {
    run(job).await.map_err(|f| anyhow!("{f}"))
}

fn drain(events: &mut UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = events.try_recv() {
        out.push(ev);
    }
    out
}

fn received_data(events: &[JobEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Data { data, .. } => Some(data.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

fn listed(events: &[JobEvent]) -> Vec<Entry> {
    let mut entries: Vec<Entry> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Entries { entries, .. } => Some(entries.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

#[tokio::test]
async fn put_then_get_round_trips_content() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let target = dir.path().join("notes.txt");
    let (ctx, mut events) = context();

    let body: Vec<u8> = (0..100_000u32).map(|i| (i % 97) as u8).collect();
    let mut put = TransferJob::put(&ctx, file_url(&target), PutOptions::default(), None)
        .with_source(std::io::Cursor::new(body.clone()));
    ok(&mut put).await?;
    assert_eq!(fs::read(&target)?, body);
    assert!(!dir.path().join("notes.txt.part").exists());
    drain(&mut events);

    let mut get = TransferJob::get(&ctx, file_url(&target), None);
    ok(&mut get).await?;
    let evs = drain(&mut events);
    assert_eq!(received_data(&evs), body);
    assert!(evs
        .iter()
        .any(|e| matches!(e, JobEvent::MimeType { mime, .. } if mime == "text/plain")));
    assert!(evs
        .iter()
        .any(|e| matches!(e, JobEvent::TotalSize { size, .. } if *size == body.len() as u64)));
    assert!(get.incoming().get("modified").is_some());
    Ok(())
}

#[tokio::test]
async fn get_from_an_offset_skips_the_head() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("data.bin");
    fs::write(&path, b"0123456789")?;
    let (ctx, mut events) = context();

    let mut get = TransferJob::get_from(&ctx, file_url(&path), 4, None);
    ok(&mut get).await?;
    assert_eq!(received_data(&drain(&mut events)), b"456789");
    Ok(())
}

#[tokio::test]
async fn put_refuses_to_clobber_without_overwrite() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("keep.txt");
    fs::write(&path, b"original")?;
    let (ctx, _events) = context();

    let mut put = TransferJob::put(&ctx, file_url(&path), PutOptions::default(), None)
        .with_source(std::io::Cursor::new(b"new".to_vec()));
    let failure = run(&mut put).await.expect_err("existing file");
    assert_eq!(failure.code, code::ERR_FILE_ALREADY_EXIST);
    assert_eq!(fs::read(&path)?, b"original");

    let opts = PutOptions {
        overwrite: true,
        permissions: Some(0o600),
        ..PutOptions::default()
    };
    let mut put = TransferJob::put(&ctx, file_url(&path), opts, None).with_source(std::io::Cursor::new(b"new".to_vec()));
    ok(&mut put).await?;
    assert_eq!(fs::read(&path)?, b"new");
    use std::os::unix::fs::PermissionsExt;
    assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
    Ok(())
}

#[tokio::test]
async fn stream_put_over_a_stale_part_file_starts_over() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("big.bin");
    fs::write(dir.path().join("big.bin.part"), vec![0xee; 700])?;
    let (ctx, _events) = context();

    let opts = PutOptions {
        resume: true,
        ..PutOptions::default()
    };
    let body = b"fresh content".to_vec();
    let mut put = TransferJob::put(&ctx, file_url(&path), opts, None).with_source(std::io::Cursor::new(body.clone()));
    ok(&mut put).await?;
    assert_eq!(fs::read(&path)?, body);
    assert!(!dir.path().join("big.bin.part").exists());
    Ok(())
}

#[tokio::test]
async fn stat_and_list_report_entries() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("a.txt"), b"aaa")?;
    fs::write(dir.path().join(".hidden"), b"")?;
    fs::create_dir(dir.path().join("sub"))?;
    fs::write(dir.path().join("sub").join("b.json"), b"{}")?;
    let (ctx, mut events) = context();

    let mut stat = StatJob::new(&ctx, file_url(&dir.path().join("a.txt")), None);
    ok(&mut stat).await?;
    let entry = stat.entry().cloned().ok_or_else(|| anyhow!("no entry"))?;
    assert_eq!(entry.name, "a.txt");
    assert_eq!(entry.kind, EntryKind::File);
    assert_eq!(entry.size, 3);

    let mut missing = StatJob::new(&ctx, file_url(&dir.path().join("nope")), None);
    let failure = run(&mut missing).await.expect_err("missing file");
    assert_eq!(failure.code, code::ERR_DOES_NOT_EXIST);
    drain(&mut events);

    let mut list = ListJob::new(&ctx, file_url(dir.path()), None);
    ok(&mut list).await?;
    let names: Vec<String> = listed(&drain(&mut events)).into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["a.txt", "sub"]);

    let mut list = ListJob::recursive(&ctx, file_url(dir.path()), None).include_hidden(true);
    ok(&mut list).await?;
    let names: Vec<String> = listed(&drain(&mut events)).into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec![".hidden", "a.txt", "sub", "sub/b.json"]);
    assert_eq!(list.listed(), 4);
    Ok(())
}

#[tokio::test]
async fn copy_and_move_between_local_paths() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src.txt");
    let copy = dir.path().join("copy.txt");
    let moved = dir.path().join("moved.txt");
    fs::write(&src, b"payload")?;
    let (ctx, _events) = context();

    let mut job = FileCopyJob::copy(&ctx, file_url(&src), file_url(&copy), false);
    ok(&mut job).await?;
    assert_eq!(fs::read(&copy)?, b"payload");
    assert!(src.exists());

    let mut job = FileCopyJob::copy(&ctx, file_url(&src), file_url(&copy), false);
    let failure = run(&mut job).await.expect_err("destination exists");
    assert_eq!(failure.code, code::ERR_FILE_ALREADY_EXIST);

    let mut job = FileCopyJob::rename(&ctx, file_url(&src), file_url(&moved), false);
    ok(&mut job).await?;
    assert!(!src.exists());
    assert_eq!(fs::read(&moved)?, b"payload");
    Ok(())
}

#[tokio::test]
async fn mkdir_mimetype_and_delete() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let tree = dir.path().join("tree");
    let (ctx, _events) = context();

    let mut mkdir = SimpleJob::mkdir(&ctx, file_url(&tree), Some(0o755));
    ok(&mut mkdir).await?;
    assert!(tree.is_dir());

    let mut again = SimpleJob::mkdir(&ctx, file_url(&tree), None);
    let failure = run(&mut again).await.expect_err("already there");
    assert_eq!(failure.code, code::ERR_DIR_ALREADY_EXIST);

    let mut mime = SimpleJob::mimetype(&ctx, file_url(&tree));
    ok(&mut mime).await?;
    assert_eq!(mime.mime_type(), Some("inode/directory"));

    fs::write(tree.join("leaf.txt"), b"x")?;
    let mut rmdir = SimpleJob::del(&ctx, file_url(&tree), false);
    assert!(run(&mut rmdir).await.is_err());
    assert!(tree.exists());

    let mut rm = SimpleJob::del_recursive(&ctx, file_url(&tree));
    ok(&mut rm).await?;
    assert!(!tree.exists());
    Ok(())
}
