//! Error types for the mcp-manager core library.

use std::path::PathBuf;
use thiserror::Error;

type Cause = Box<dyn std::error::Error + Send + Sync>;

/// Broad category an [`Error`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed, unreadable or unmigratable registry or client file.
    Config,
    /// A server record failed its invariants.
    Validation,
    /// Start/stop against the wrong process state, spawn or signal failure.
    Process,
    /// IO failure unrelated to parsing.
    FileSystem,
    /// Unknown sync target.
    Sync,
    /// Remote search failure.
    Http,
}

/// Core error type for mcp-manager operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Registry or client configuration could not be read, parsed or migrated.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    /// A server record is not well formed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Server is not registered.
    #[error("Server '{0}' not found")]
    ServerNotFound(String),

    /// Server already has a live handle.
    #[error("Server '{0}' is already running")]
    AlreadyRunning(String),

    /// Server has no handle to stop.
    #[error("Server '{0}' is not running")]
    NotRunning(String),

    /// Server did not report readiness in time.
    #[error("Server '{name}' did not become ready within {secs}s")]
    StartTimeout { name: String, secs: u64 },

    /// Spawning, signalling or connecting failed.
    #[error("Process error: {message}")]
    Process {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// IO operation failed.
    #[error("File system error at {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unknown sync target.
    #[error("Unknown sync target '{0}' (expected one of: cursor, claude-desktop, vscode)")]
    Sync(String),

    /// JSON serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing failed.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Build a config error with an optional underlying cause.
    pub fn config(message: impl Into<String>, source: Option<Cause>) -> Self {
        Self::Config {
            message: message.into(),
            source,
        }
    }

    /// Build a process error with an optional IO cause.
    pub fn process(message: impl Into<String>, source: Option<std::io::Error>) -> Self {
        Self::Process {
            message: message.into(),
            source,
        }
    }

    /// Wrap an IO error with the path it happened on.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            source,
        }
    }

    /// The category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } | Self::Json(_) | Self::Yaml(_) => ErrorKind::Config,
            Self::Validation(_) | Self::ServerNotFound(_) => ErrorKind::Validation,
            Self::AlreadyRunning(_)
            | Self::NotRunning(_)
            | Self::StartTimeout { .. }
            | Self::Process { .. } => ErrorKind::Process,
            Self::FileSystem { .. } => ErrorKind::FileSystem,
            Self::Sync(_) => ErrorKind::Sync,
            Self::Http(_) => ErrorKind::Http,
        }
    }
}

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;
