//! Filesystem scanning and the chunked copy primitive shared by all
//! backup strategies.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, warn};

/// Chunk size used by [`copy_with_progress`]; each chunk produces one
/// progress callback.
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// A regular file discovered under a job's source root.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Recursively walks `root` and returns every regular file below it.
///
/// Symlinks are skipped so a backup can never escape its source tree or
/// loop. Entries whose metadata cannot be read are logged and skipped; a
/// directory that cannot be opened fails the scan. The walk itself runs on
/// the blocking pool.
pub async fn scan_source(root: &Path) -> io::Result<Vec<SourceFile>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        scan_recursive(&root, &mut files)?;
        Ok(files)
    })
    .await
    .map_err(io::Error::other)?
}

fn scan_recursive(dir: &Path, files: &mut Vec<SourceFile>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        let metadata = match std::fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if metadata.file_type().is_symlink() {
            debug!(path = %path.display(), "skipping symlink");
        } else if metadata.is_dir() {
            scan_recursive(&path, files)?;
        } else if metadata.is_file() {
            files.push(SourceFile {
                path,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }
    Ok(())
}

/// Case-insensitive extension match against a configured list.
///
/// Entries may be written with or without the leading dot ("pdf" and ".pdf"
/// both match `report.PDF`). Files without an extension never match.
pub fn extension_matches(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

/// Copies `source` to `dest` in [`COPY_CHUNK_SIZE`] chunks, reporting each
/// chunk through `on_bytes`. The destination is created or truncated; its
/// modification time is set to match the source afterwards. Returns the
/// number of bytes copied.
///
/// `chunk_delay` slows the loop down by sleeping after every chunk. It exists
/// for tests and simulations that need a run to stay observable long enough
/// to pause, stop, or contend with.
pub async fn copy_with_progress(
    source: &Path,
    dest: &Path,
    chunk_delay: Option<Duration>,
    on_bytes: &mut (dyn FnMut(u64) + Send),
) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(source).await?);
    let mut writer = BufWriter::new(File::create(dest).await?);
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut copied = 0u64;
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).await?;
        copied += read as u64;
        on_bytes(read as u64);
        if let Some(delay) = chunk_delay {
            tokio::time::sleep(delay).await;
        }
    }
    writer.flush().await?;
    drop(writer);

    if let Err(err) = copy_modified_time(source, dest) {
        debug!(
            source = %source.display(),
            dest = %dest.display(),
            error = %err,
            "could not preserve modification time"
        );
    }
    Ok(copied)
}

fn copy_modified_time(source: &Path, dest: &Path) -> io::Result<()> {
    let metadata = std::fs::metadata(source)?;
    let mtime = FileTime::from_last_modification_time(&metadata);
    filetime::set_file_mtime(dest, mtime)
}
