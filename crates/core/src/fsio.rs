//! JSON file IO with whole-file atomic replacement.
//!
//! Writes go to a temp file in the target's directory, are synced, then
//! renamed over the target, so readers never observe a partial file.

use crate::{Error, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist. A file that exists but does not
/// parse is a config error naming the file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::fs(path, e)),
    };

    serde_json::from_str(&content).map(Some).map_err(|e| {
        Error::config(
            format!("Failed to parse {}", path.display()),
            Some(Box::new(e)),
        )
    })
}

/// Serialize `data` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let parent = parent_dir(path);
    fs::create_dir_all(&parent).map_err(|e| Error::fs(&parent, e))?;

    let mut serialized = serde_json::to_string_pretty(data)?;
    serialized.push('\n');

    let mut temp = NamedTempFile::new_in(&parent).map_err(|e| Error::fs(&parent, e))?;
    temp.write_all(serialized.as_bytes())
        .map_err(|e| Error::fs(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| Error::fs(temp.path(), e))?;
    temp.persist(path).map_err(|e| Error::fs(path, e.error))?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// Modification time of `path`, or `None` if it can't be observed.
pub fn modified_time(path: &Path) -> Option<std::time::SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Exclusive advisory lock held for a read-modify-write cycle.
///
/// The lock lives on a sibling `<file>.lock` so the data file itself can be
/// replaced by rename while the lock is held. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock guarding `target` is acquired.
    pub fn acquire(target: &Path) -> Result<Self> {
        let parent = parent_dir(target);
        fs::create_dir_all(&parent).map_err(|e| Error::fs(&parent, e))?;

        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        let path = parent.join(name);

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::fs(&path, e))?;
        file.lock_exclusive().map_err(|e| Error::fs(&path, e))?;

        debug!("Acquired lock {}", path.display());
        Ok(Self { file, path })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}
