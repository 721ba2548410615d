//! The `file` protocol: the local filesystem.

use anyhow::Result;
use filetime::{set_file_mtime, FileTime};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, error};
use url::Url;
use walkdir::WalkDir;

use super::{fail, Protocol, WorkerBase, WorkerIo};
use crate::config::FILE_PROTOCOL;
use crate::error::code;
use crate::job::{Entry, EntryKind};
use crate::logger::{init_tracing, LogConfig};
use crate::protocol::CHUNK_SIZE;

const LIST_BATCH: usize = 200;
const PART_SUFFIX: &str = ".part";

const MIME_TABLE: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("rs", "text/rust"),
    ("toml", "application/toml"),
    ("json", "application/json"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("xml", "application/xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("desktop", "application/x-desktop"),
];

pub const DIRECTORY_MIME: &str = "inode/directory";
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Mime type guessed from the file name.
pub fn mime_for(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return DEFAULT_MIME;
    };
    let ext = ext.to_ascii_lowercase();
    MIME_TABLE
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, m)| *m)
        .unwrap_or(DEFAULT_MIME)
}

fn local_path(url: &Url) -> Result<PathBuf> {
    if url.scheme() != FILE_PROTOCOL {
        return Err(fail(code::ERR_UNSUPPORTED_PROTOCOL, url.to_string()));
    }
    url.to_file_path()
        .map_err(|_| fail(code::ERR_MALFORMED_URL, url.to_string()))
}

/// Map an I/O error to the wire code a job sees.
fn io_error(err: std::io::Error, path: &Path, fallback: i32) -> anyhow::Error {
    let code = match err.kind() {
        ErrorKind::NotFound => code::ERR_DOES_NOT_EXIST,
        ErrorKind::PermissionDenied => code::ERR_ACCESS_DENIED,
        ErrorKind::AlreadyExists => code::ERR_FILE_ALREADY_EXIST,
        _ => fallback,
    };
    fail(code, format!("{}: {err}", path.display()))
}

fn mtime_secs(meta: &fs::Metadata) -> Option<i64> {
    let t = meta.modified().ok()?;
    Some(t.duration_since(UNIX_EPOCH).ok()?.as_secs() as i64)
}

fn entry_for(path: &Path, name: String) -> Result<Entry> {
    let meta = fs::symlink_metadata(path).map_err(|e| io_error(e, path, code::ERR_COULD_NOT_READ))?;
    let ft = meta.file_type();
    let kind = if ft.is_dir() {
        EntryKind::Dir
    } else if ft.is_symlink() {
        EntryKind::Symlink
    } else if ft.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };
    let link_target = if ft.is_symlink() {
        fs::read_link(path).ok().map(|t| t.to_string_lossy().into_owned())
    } else {
        None
    };
    let mime_type = match kind {
        EntryKind::Dir => Some(DIRECTORY_MIME.to_string()),
        EntryKind::File => Some(mime_for(path).to_string()),
        _ => None,
    };
    Ok(Entry {
        name,
        kind,
        size: if kind == EntryKind::File { meta.len() } else { 0 },
        permissions: meta.permissions().mode() & 0o7777,
        modified: mtime_secs(&meta),
        link_target,
        mime_type,
    })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string())
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| io_error(e, path, code::ERR_CANNOT_CHMOD))
}

fn refuse_existing(path: &Path, overwrite: bool) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(fail(code::ERR_DIR_ALREADY_EXIST, path.display().to_string())),
        Ok(_) if !overwrite => Err(fail(code::ERR_FILE_ALREADY_EXIST, path.display().to_string())),
        _ => Ok(()),
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut p = dest.as_os_str().to_os_string();
    p.push(PART_SUFFIX);
    PathBuf::from(p)
}

fn copy_file(src: &Path, dst: &Path, permissions: Option<u32>) -> Result<u64> {
    let n = fs::copy(src, dst).map_err(|e| io_error(e, dst, code::ERR_COULD_NOT_WRITE))?;
    if let Some(mode) = permissions {
        set_mode(dst, mode)?;
    }
    if let Ok(meta) = fs::metadata(src) {
        let _ = set_file_mtime(dst, FileTime::from_last_modification_time(&meta));
    }
    Ok(n)
}

#[derive(Debug, Default)]
pub struct FileProtocol;

impl FileProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl Protocol for FileProtocol {
    fn get(&mut self, io: &mut WorkerIo<'_>, url: &Url) -> Result<()> {
        let path = local_path(url)?;
        let meta = fs::metadata(&path).map_err(|e| io_error(e, &path, code::ERR_CANNOT_OPEN_FOR_READING))?;
        if meta.is_dir() {
            return Err(fail(code::ERR_IS_DIRECTORY, path.display().to_string()));
        }
        let mut file = File::open(&path).map_err(|e| io_error(e, &path, code::ERR_CANNOT_OPEN_FOR_READING))?;
        io.mime_type(mime_for(&path))?;
        if let Some(secs) = mtime_secs(&meta) {
            io.set_metadata("modified", secs.to_string());
        }
        let size = meta.len();
        io.total_size(size)?;

        let mut processed = 0u64;
        let offset = io.metadata_u64("resume").unwrap_or(0);
        if offset > 0 && offset <= size {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| io_error(e, &path, code::ERR_CANNOT_RESUME))?;
            io.can_resume()?;
            processed = offset;
            debug!(path = %path.display(), offset, "resuming read");
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_error(e, &path, code::ERR_COULD_NOT_READ)),
            };
            io.data(&buf[..n])?;
            processed += n as u64;
            io.processed_size(processed)?;
        }
        io.data(&[])
    }

    fn put(&mut self, io: &mut WorkerIo<'_>, url: &Url, permissions: Option<u32>, overwrite: bool, resume: bool) -> Result<()> {
        let dest = local_path(url)?;
        refuse_existing(&dest, overwrite)?;
        let part = part_path(&dest);

        let existing = if resume {
            fs::metadata(&part).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };
        let keep = io.can_resume_at(existing)? && existing > 0;
        let mut file = if keep {
            OpenOptions::new().append(true).open(&part)
        } else {
            File::create(&part)
        }
        .map_err(|e| io_error(e, &part, code::ERR_CANNOT_OPEN_FOR_WRITING))?;

        let mut processed = if keep { existing } else { 0 };
        loop {
            let chunk = io.data_request()?;
            if chunk.is_empty() {
                break;
            }
            file.write_all(&chunk)
                .map_err(|e| io_error(e, &part, code::ERR_COULD_NOT_WRITE))?;
            processed += chunk.len() as u64;
            io.processed_size(processed)?;
        }
        file.flush().map_err(|e| io_error(e, &part, code::ERR_COULD_NOT_WRITE))?;
        drop(file);

        fs::rename(&part, &dest).map_err(|e| io_error(e, &dest, code::ERR_CANNOT_RENAME))?;
        if let Some(mode) = permissions {
            set_mode(&dest, mode)?;
        }
        if let Some(secs) = io.metadata("modified").and_then(|m| m.parse::<i64>().ok()) {
            let _ = set_file_mtime(&dest, FileTime::from_unix_time(secs, 0));
        }
        Ok(())
    }

    fn stat(&mut self, io: &mut WorkerIo<'_>, url: &Url) -> Result<()> {
        let path = local_path(url)?;
        let entry = entry_for(&path, display_name(&path))?;
        io.stat_entry(entry)
    }

    fn mimetype(&mut self, io: &mut WorkerIo<'_>, url: &Url) -> Result<()> {
        let path = local_path(url)?;
        let meta = fs::metadata(&path).map_err(|e| io_error(e, &path, code::ERR_COULD_NOT_READ))?;
        let mime = if meta.is_dir() { DIRECTORY_MIME } else { mime_for(&path) };
        io.mime_type(mime)
    }

    fn list_dir(&mut self, io: &mut WorkerIo<'_>, url: &Url) -> Result<()> {
        let path = local_path(url)?;
        let meta = fs::metadata(&path).map_err(|e| io_error(e, &path, code::ERR_CANNOT_ENTER_DIRECTORY))?;
        if !meta.is_dir() {
            return Err(fail(code::ERR_IS_FILE, path.display().to_string()));
        }
        let rd = fs::read_dir(&path).map_err(|e| io_error(e, &path, code::ERR_CANNOT_ENTER_DIRECTORY))?;
        let mut batch = Vec::with_capacity(LIST_BATCH);
        for item in rd {
            let item = item.map_err(|e| io_error(e, &path, code::ERR_COULD_NOT_READ))?;
            let name = item.file_name().to_string_lossy().into_owned();
            match entry_for(&item.path(), name) {
                Ok(entry) => batch.push(entry),
                // vanished between readdir and lstat
                Err(e) => debug!("skipping {}: {e:#}", item.path().display()),
            }
            if batch.len() == LIST_BATCH {
                io.list_entries(std::mem::take(&mut batch))?;
            }
        }
        io.list_entries(batch)
    }

    fn mkdir(&mut self, _io: &mut WorkerIo<'_>, url: &Url, permissions: Option<u32>) -> Result<()> {
        let path = local_path(url)?;
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => return Err(fail(code::ERR_DIR_ALREADY_EXIST, path.display().to_string())),
            Ok(_) => return Err(fail(code::ERR_FILE_ALREADY_EXIST, path.display().to_string())),
            Err(_) => {}
        }
        fs::create_dir(&path).map_err(|e| io_error(e, &path, code::ERR_WRITE_ACCESS_DENIED))?;
        if let Some(mode) = permissions {
            set_mode(&path, mode)?;
        }
        Ok(())
    }

    fn rename(&mut self, _io: &mut WorkerIo<'_>, src: &Url, dst: &Url, overwrite: bool) -> Result<()> {
        let from = local_path(src)?;
        let to = local_path(dst)?;
        fs::symlink_metadata(&from).map_err(|e| io_error(e, &from, code::ERR_DOES_NOT_EXIST))?;
        refuse_existing(&to, overwrite)?;
        match fs::rename(&from, &to) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                Err(fail(code::ERR_UNSUPPORTED_ACTION, format!("{} is on another filesystem", to.display())))
            }
            Err(e) => Err(io_error(e, &to, code::ERR_CANNOT_RENAME)),
        }
    }

    fn copy(&mut self, io: &mut WorkerIo<'_>, src: &Url, dst: &Url, permissions: Option<u32>, overwrite: bool) -> Result<()> {
        let from = local_path(src)?;
        let to = local_path(dst)?;
        let meta = fs::metadata(&from).map_err(|e| io_error(e, &from, code::ERR_CANNOT_OPEN_FOR_READING))?;
        if from == to {
            return Err(fail(code::ERR_CYCLIC_COPY, to.display().to_string()));
        }
        refuse_existing(&to, overwrite)?;
        if !meta.is_dir() {
            io.total_size(meta.len())?;
            let n = copy_file(&from, &to, permissions)?;
            return io.processed_size(n);
        }
        if to.starts_with(&from) {
            return Err(fail(code::ERR_CYCLIC_COPY, to.display().to_string()));
        }
        let mut copied = 0u64;
        for item in WalkDir::new(&from).follow_links(false) {
            let item = item.map_err(|e| fail(code::ERR_COULD_NOT_READ, e.to_string()))?;
            let rel = item.path().strip_prefix(&from).unwrap_or(item.path());
            let target = to.join(rel);
            let ft = item.file_type();
            if ft.is_dir() {
                fs::create_dir_all(&target).map_err(|e| io_error(e, &target, code::ERR_COULD_NOT_WRITE))?;
            } else if ft.is_symlink() {
                let link = fs::read_link(item.path()).map_err(|e| io_error(e, item.path(), code::ERR_COULD_NOT_READ))?;
                std::os::unix::fs::symlink(&link, &target).map_err(|e| io_error(e, &target, code::ERR_COULD_NOT_WRITE))?;
            } else {
                copied += copy_file(item.path(), &target, None)?;
                io.processed_size(copied)?;
            }
        }
        if let Some(mode) = permissions {
            set_mode(&to, mode)?;
        }
        Ok(())
    }

    fn del(&mut self, io: &mut WorkerIo<'_>, url: &Url, is_file: bool) -> Result<()> {
        let path = local_path(url)?;
        let result = if is_file {
            fs::remove_file(&path)
        } else if io.metadata("recurse") == Some("true") {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_dir(&path)
        };
        result.map_err(|e| io_error(e, &path, code::ERR_CANNOT_DELETE))
    }

    fn chmod(&mut self, _io: &mut WorkerIo<'_>, url: &Url, permissions: u32) -> Result<()> {
        let path = local_path(url)?;
        set_mode(&path, permissions)
    }
}

/// Worker process entry: `<program> <protocol> <pool socket> <app socket>`.
/// Also the fast-path entry the spawner runs in a forked child.
pub fn entry(args: &[String]) -> i32 {
    let _ = init_tracing(&LogConfig::default());
    let pool = args.get(2).filter(|s| !s.is_empty()).map(PathBuf::from);
    let app = args.get(3).filter(|s| !s.is_empty()).map(PathBuf::from);
    if app.is_none() {
        error!("usage: shuttle-file <protocol> <pool socket> <app socket>");
        return 1;
    }
    let mut base = WorkerBase::new(FILE_PROTOCOL, Box::new(FileProtocol::new()));
    match base.run(pool.as_deref(), app.as_deref()) {
        Ok(()) => 0,
        Err(e) => {
            error!("file worker: {e:#}");
            1
        }
    }
}
