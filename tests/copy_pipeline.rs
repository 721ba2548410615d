use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

use shuttle::config::ShuttleConfig;
use shuttle::error::code;
use shuttle::job::copy::{CopyOptions, FileCopyJob};
use shuttle::job::scheduler::InProcessWorkers;
use shuttle::job::transfer::TransferJob;
use shuttle::job::{run_job, JobContext, JobEvent, JobFailure, KillSignal, KillSwitch};
use shuttle::worker::{fail, Protocol, WorkerIo};

const CHUNK: usize = 1024;

/// Shared state behind every `mem://` worker instance.
#[derive(Default)]
struct MemState {
    files: HashMap<String, Vec<u8>>,
    get_offsets: Vec<u64>,
    put_chunks: Vec<Vec<u8>>,
    cache_refresh: Vec<bool>,
    redirects_left: usize,
    chunk_delay: Option<Duration>,
    /// The put side stops asking for data after this many chunks.
    put_limit: Option<usize>,
    /// Sides whose job connection went away mid-command.
    hangups: Vec<&'static str>,
}

type Store = Arc<Mutex<MemState>>;

struct MemProtocol {
    store: Store,
}

impl Protocol for MemProtocol {
    fn get(&mut self, io: &mut WorkerIo<'_>, url: &Url) -> Result<()> {
        let refresh = io.metadata("cache") == Some("refresh");
        let (content, delay) = {
            let mut st = self.store.lock();
            st.cache_refresh.push(refresh);
            if st.redirects_left > 0 {
                st.redirects_left -= 1;
                drop(st);
                return io.redirection(url);
            }
            let content = st
                .files
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| fail(code::ERR_DOES_NOT_EXIST, url.as_str()))?;
            (content, st.chunk_delay)
        };
        let offset = io.metadata_u64("resume").unwrap_or(0);
        self.store.lock().get_offsets.push(offset);
        if offset > 0 {
            io.can_resume()?;
        }
        io.total_size(content.len() as u64)?;
        let mut pos = offset as usize;
        while pos < content.len() {
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            let end = (pos + CHUNK).min(content.len());
            if let Err(e) = io.data(&content[pos..end]) {
                self.store.lock().hangups.push("get");
                return Err(e);
            }
            pos = end;
            io.processed_size(pos as u64)?;
        }
        io.data(&[])
    }

    fn put(&mut self, io: &mut WorkerIo<'_>, url: &Url, _permissions: Option<u32>, overwrite: bool, resume: bool) -> Result<()> {
        let existing = self.store.lock().files.get(url.as_str()).cloned();
        let mut content = match existing {
            Some(partial) if resume && !partial.is_empty() => {
                if io.can_resume_at(partial.len() as u64)? {
                    partial
                } else {
                    Vec::new()
                }
            }
            Some(_) if !overwrite && !resume => return Err(fail(code::ERR_FILE_ALREADY_EXIST, url.as_str())),
            _ => Vec::new(),
        };
        let limit = self.store.lock().put_limit;
        loop {
            if limit.is_some_and(|n| self.store.lock().put_chunks.len() >= n) {
                break;
            }
            let chunk = match io.data_request() {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.store.lock().hangups.push("put");
                    return Err(e);
                }
            };
            if chunk.is_empty() {
                break;
            }
            content.extend_from_slice(&chunk);
            self.store.lock().put_chunks.push(chunk);
        }
        self.store.lock().files.insert(url.to_string(), content);
        Ok(())
    }

    fn del(&mut self, _io: &mut WorkerIo<'_>, url: &Url, _is_file: bool) -> Result<()> {
        match self.store.lock().files.remove(url.as_str()) {
            Some(_) => Ok(()),
            None => Err(fail(code::ERR_DOES_NOT_EXIST, url.as_str())),
        }
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn mem_context(store: &Store) -> (JobContext, UnboundedReceiver<JobEvent>) {
    let mut workers = InProcessWorkers::new();
    let store = store.clone();
    workers.register(
        "mem",
        Arc::new(move || Box::new(MemProtocol { store: store.clone() }) as Box<dyn Protocol + Send>),
    );
    JobContext::new(Arc::new(workers), Arc::new(ShuttleConfig::default()))
}

fn drain(events: &mut UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = events.try_recv() {
        out.push(ev);
    }
    out
}

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

#[tokio::test]
async fn resumed_copy_starts_the_read_at_the_partial_length() -> Result<()> {
    let store = Store::default();
    let source = pattern(10_000);
    {
        let mut st = store.lock();
        st.files.insert("mem://a/src".into(), source.clone());
        st.files.insert("mem://b/dst".into(), source[..4096].to_vec());
    }
    let (ctx, mut events) = mem_context(&store);

    let opts = CopyOptions {
        resume: true,
        ..CopyOptions::default()
    };
    let mut job = FileCopyJob::new(&ctx, url("mem://a/src"), url("mem://b/dst"), opts);
    run_job(&mut job, &mut KillSignal::never()).await.map_err(|f| anyhow::anyhow!("{f}"))?;

    let st = store.lock();
    assert_eq!(st.get_offsets, vec![4096]);
    assert_eq!(st.put_chunks[0], source[4096..4096 + CHUNK].to_vec());
    assert_eq!(st.files["mem://b/dst"], source);

    let top = job.id();
    let last = drain(&mut events)
        .into_iter()
        .filter(|e| e.job() == top)
        .filter_map(|e| match e {
            JobEvent::ProcessedSize { size, .. } => Some(size),
            _ => None,
        })
        .last();
    assert_eq!(last, Some(10_000));
    Ok(())
}

#[tokio::test]
async fn refused_resume_rewrites_from_the_start() -> Result<()> {
    let store = Store::default();
    let source = pattern(3_000);
    {
        let mut st = store.lock();
        st.files.insert("mem://a/src".into(), source.clone());
        st.files.insert("mem://b/dst".into(), vec![0xff; 512]);
    }
    let (ctx, _events) = mem_context(&store);

    // a standalone put cannot skip ahead in its stream and declines
    let opts = shuttle::job::transfer::PutOptions {
        resume: true,
        ..Default::default()
    };
    let mut put = TransferJob::put(&ctx, url("mem://b/dst"), opts, None).with_source(std::io::Cursor::new(source.clone()));
    run_job(&mut put, &mut KillSignal::never()).await.map_err(|f| anyhow::anyhow!("{f}"))?;

    assert_eq!(store.lock().files["mem://b/dst"], source);
    Ok(())
}

#[tokio::test]
async fn move_between_hosts_pumps_then_deletes_the_source() -> Result<()> {
    let store = Store::default();
    let source = pattern(5_000);
    store.lock().files.insert("mem://a/src".into(), source.clone());
    let (ctx, mut events) = mem_context(&store);

    let mut job = FileCopyJob::rename(&ctx, url("mem://a/src"), url("mem://b/dst"), false);
    let outcome = run_job(&mut job, &mut KillSignal::never()).await;
    assert_eq!(outcome, Ok(()));

    let st = store.lock();
    assert!(!st.files.contains_key("mem://a/src"));
    assert_eq!(st.files["mem://b/dst"], source);

    let top = job.id();
    let results: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, JobEvent::Result { job, .. } if *job == top))
        .collect();
    assert_eq!(results.len(), 1);
    Ok(())
}

#[tokio::test]
async fn unsupported_direct_copy_falls_back_to_the_pump() -> Result<()> {
    let store = Store::default();
    let source = pattern(2_500);
    store.lock().files.insert("mem://a/src".into(), source.clone());
    let (ctx, mut events) = mem_context(&store);

    let mut job = FileCopyJob::copy(&ctx, url("mem://a/src"), url("mem://a/dst"), false);
    let outcome = run_job(&mut job, &mut KillSignal::never()).await;
    assert_eq!(outcome, Ok(()));
    assert_eq!(store.lock().files["mem://a/dst"], source);

    let top = job.id();
    let evs = drain(&mut events);
    assert!(evs.iter().any(|e| matches!(
        e,
        JobEvent::Result { job, outcome: Err(f) } if *job != top && f.code == code::ERR_UNSUPPORTED_ACTION
    )));
    assert!(evs
        .iter()
        .any(|e| matches!(e, JobEvent::Result { job, outcome: Ok(()) } if *job == top)));
    Ok(())
}

#[tokio::test]
async fn killing_a_copy_tears_down_both_sides_quietly() -> Result<()> {
    let store = Store::default();
    {
        let mut st = store.lock();
        st.files.insert("mem://a/src".into(), pattern(20 * CHUNK));
        st.chunk_delay = Some(Duration::from_millis(20));
    }
    let (ctx, mut events) = mem_context(&store);

    let (switch, mut kill) = KillSwitch::pair();
    let mut job = FileCopyJob::copy(&ctx, url("mem://a/src"), url("mem://b/dst"), false);
    let top = job.id();
    let mut seen = Vec::new();
    let outcome = {
        let run = run_job(&mut job, &mut kill);
        tokio::pin!(run);
        loop {
            tokio::select! {
                r = &mut run => break r,
                Some(ev) = events.recv() => {
                    if matches!(ev, JobEvent::ProcessedSize { job, .. } if job == top) {
                        switch.kill();
                    }
                    seen.push(ev);
                }
            }
        }
    };
    assert_eq!(outcome, Err(JobFailure::canceled()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    seen.extend(drain(&mut events));

    let killed = seen.iter().filter(|e| matches!(e, JobEvent::Killed { .. })).count();
    let results: Vec<_> = seen.iter().filter(|e| matches!(e, JobEvent::Result { .. })).collect();
    assert_eq!(killed, 2);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].job(), top);

    // nothing after the terminal event
    let pos = seen
        .iter()
        .position(|e| matches!(e, JobEvent::Result { job, .. } if *job == top))
        .unwrap();
    assert_eq!(pos, seen.len() - 1);

    // the workers only ever saw what was sent before the kill, then a hangup
    let sent = seen
        .iter()
        .filter(|e| matches!(e, JobEvent::ProcessedSize { job, .. } if *job == top))
        .count();
    let st = store.lock();
    assert_eq!(st.put_chunks.len(), sent);
    assert!(st.hangups.contains(&"put"));
    assert!(st.hangups.contains(&"get"));
    assert!(!st.files.contains_key("mem://b/dst"));
    Ok(())
}

#[tokio::test]
async fn write_side_finishing_first_stops_the_read_side() -> Result<()> {
    let store = Store::default();
    {
        let mut st = store.lock();
        st.files.insert("mem://a/src".into(), pattern(20 * CHUNK));
        st.put_limit = Some(1);
    }
    let (ctx, mut events) = mem_context(&store);

    let mut job = FileCopyJob::copy(&ctx, url("mem://a/src"), url("mem://b/dst"), false);
    let top = job.id();
    let outcome = run_job(&mut job, &mut KillSignal::never()).await;
    assert_eq!(outcome, Ok(()));
    assert_eq!(store.lock().files["mem://b/dst"], pattern(CHUNK));

    let evs = drain(&mut events);
    let killed: Vec<_> = evs.iter().filter(|e| matches!(e, JobEvent::Killed { .. })).collect();
    assert_eq!(killed.len(), 1);
    assert_ne!(killed[0].job(), top);
    let results: Vec<_> = evs.iter().filter(|e| matches!(e, JobEvent::Result { .. })).collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].job(), top);
    Ok(())
}

#[tokio::test]
async fn five_redirections_to_the_same_url_are_followed() -> Result<()> {
    let store = Store::default();
    {
        let mut st = store.lock();
        st.files.insert("mem://a/ping".into(), b"pong".to_vec());
        st.redirects_left = 5;
    }
    let (ctx, mut events) = mem_context(&store);

    let mut job = TransferJob::get(&ctx, url("mem://a/ping"), None);
    let outcome = run_job(&mut job, &mut KillSignal::never()).await;
    assert_eq!(outcome, Ok(()));

    let evs = drain(&mut events);
    let redirects = evs.iter().filter(|e| matches!(e, JobEvent::Redirection { .. })).count();
    assert_eq!(redirects, 5);
    let data: Vec<u8> = evs
        .into_iter()
        .filter_map(|e| match e {
            JobEvent::Data { data, .. } => Some(data),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(data, b"pong");

    // every retry after the first asks for a fresh copy
    let refresh = store.lock().cache_refresh.clone();
    assert_eq!(refresh, vec![false, true, true, true, true, true]);
    Ok(())
}

#[tokio::test]
async fn sixth_redirection_to_the_same_url_is_cyclic() -> Result<()> {
    let store = Store::default();
    {
        let mut st = store.lock();
        st.files.insert("mem://a/ping".into(), b"pong".to_vec());
        st.redirects_left = 6;
    }
    let (ctx, _events) = mem_context(&store);

    let mut job = TransferJob::get(&ctx, url("mem://a/ping"), None);
    let outcome = run_job(&mut job, &mut KillSignal::never()).await;
    let failure = outcome.expect_err("cyclic redirection");
    assert_eq!(failure.code, code::ERR_CYCLIC_LINK);
    Ok(())
}
