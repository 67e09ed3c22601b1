//! Per-server append-only log files.
//!
//! Every line is prefixed with an ISO-8601 UTC timestamp, optionally
//! followed by a tag such as `[ERROR]` or `[EXIT]`.

use crate::{Error, Result};
use chrono::{SecondsFormat, Utc};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub const TAG_ERROR: &str = "ERROR";
pub const TAG_EXIT: &str = "EXIT";
pub const TAG_FATAL: &str = "FATAL";

/// Log file for `name` inside `logs_dir`.
pub fn log_path(logs_dir: &Path, name: &str) -> PathBuf {
    logs_dir.join(format!("{}.log", name))
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `[<timestamp>] [<tag>] <text>\n`, tag omitted when `None`.
pub fn format_line(tag: Option<&str>, text: &str) -> String {
    match tag {
        Some(tag) => format!("[{}] [{}] {}\n", timestamp(), tag, text),
        None => format!("[{}] {}\n", timestamp(), text),
    }
}

fn open_append(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::fs(parent, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::fs(path, e))
}

/// Append a single event line without holding a sink open.
pub fn append_event(path: &Path, tag: &str, text: &str) -> Result<()> {
    let mut file = open_append(path)?;
    file.write_all(format_line(Some(tag), text).as_bytes())
        .map_err(|e| Error::fs(path, e))
}

/// Open `path` for appending and hand back a std file, e.g. for a child's
/// stdout.
pub fn open_for_child(path: &Path) -> Result<fs::File> {
    open_append(path)
}

/// Shared async writer for one server's log.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl LogSink {
    pub fn open(path: &Path) -> Result<Self> {
        let file = open_append(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(tokio::fs::File::from_std(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line.
    pub async fn write_line(&self, tag: Option<&str>, text: &str) -> Result<()> {
        let line = format_line(tag, text);
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::fs(&self.path, e))?;
        file.flush().await.map_err(|e| Error::fs(&self.path, e))
    }
}

/// The last `lines` lines of a log file. A missing file has none.
pub fn tail(path: &Path, lines: usize) -> Result<Vec<String>> {
    let content = match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::fs(path, e)),
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| l.to_string()).collect())
}
