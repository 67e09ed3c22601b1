//! mcp-manager Core Library
//!
//! This crate provides the core functionality for managing MCP servers:
//! the versioned server registry, process lifecycle, status, and the
//! synchronization of the registry into MCP client config files.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod fsio;
pub mod logs;
pub mod migration;
pub mod paths;
pub mod process;
pub mod registry;
pub mod search;
pub mod server;
pub mod status;
pub mod sync;

// Re-exports for convenience
pub use config::{Config, Settings};
pub use error::{Error, ErrorKind, Result};
pub use paths::{Client, ConfigKey, ConfigPaths, PathMode};
pub use process::{LogCapture, ManagerOptions, Probe, ProcessHandle, ProcessManager};
pub use registry::{ConfigStore, GlobalConfig};
pub use search::{RegistrySearch, SearchResult};
pub use server::{ServerKind, ServerRecord, ServerSource};
pub use status::{ServerState, ServerStatus, StatusMonitor};
pub use sync::{SyncEngine, SyncPolicy, SyncReport};
