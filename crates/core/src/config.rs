//! Configuration management for mcp-manager.

use crate::paths::{ConfigPaths, PathMode};
use crate::sync::SyncPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable to override the data directory (~/.mcp-manager)
const HOME_ENV: &str = "MCP_MANAGER_HOME";
/// Environment variable selecting the environment mode ("development" sandboxes all paths)
const MODE_ENV: &str = "MCP_MANAGER_ENV";
/// Environment variable pointing development mode at a sandbox directory
const SANDBOX_ENV: &str = "MCP_MANAGER_SANDBOX";

/// Name of the optional settings file inside the data directory
pub const SETTINGS_FILE: &str = "settings.yaml";
/// Name of the project file listing servers a project needs
pub const PROJECT_FILE: &str = "mcp-manager.yaml";

/// Tunables read from `settings.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How `sync` treats client entries the registry doesn't know about
    pub sync_policy: SyncPolicy,
    /// TTL for cached registry/client reads
    pub cache_ttl_secs: u64,
    /// Substring a server prints once it is ready to serve
    pub ready_pattern: Option<String>,
    /// How long `start` waits for readiness (or a socket connection)
    pub ready_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL on stop
    pub kill_timeout_secs: u64,
    /// Upper bound for a single status check
    pub status_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::default(),
            cache_ttl_secs: 300,
            ready_pattern: None,
            ready_timeout_secs: 10,
            kill_timeout_secs: 5,
            status_timeout_ms: 2000,
        }
    }
}

impl Settings {
    /// Load settings from a YAML file, falling back to defaults if it is absent.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => Ok(Self::default()),
            Ok(content) => Ok(serde_yaml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::fs(path, e)),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

/// Configuration for mcp-manager operations.
pub struct Config {
    /// Directory holding the registry, settings, logs and process state
    pub data_dir: PathBuf,
    /// Whether all paths are redirected into a development sandbox
    pub development: bool,
    /// Resolver for registry and client file locations
    pub paths: ConfigPaths,
    /// Tunables from settings.yaml
    pub settings: Settings,
    /// Path to project config file (mcp-manager.yaml) if it exists
    pub project_config_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// Creates necessary directories if they don't exist.
    pub fn load() -> Result<Self> {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let development = std::env::var(MODE_ENV)
            .map(|v| v.eq_ignore_ascii_case("development"))
            .unwrap_or(false);

        let mode = if development {
            let sandbox = match std::env::var(SANDBOX_ENV) {
                Ok(dir) => PathBuf::from(dir),
                Err(_) => std::env::current_dir().map_err(|e| Error::fs(".", e))?,
            };
            PathMode::Development { sandbox }
        } else {
            // Data directory: ~/.mcp-manager
            let data_dir = std::env::var(HOME_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| home.join(".mcp-manager"));
            let config_dir = dirs::config_dir().unwrap_or_else(|| home.join(".config"));
            PathMode::User {
                home,
                config_dir,
                data_dir,
            }
        };

        Self::from_paths(ConfigPaths::new(mode))
    }

    /// Build configuration around an explicit resolver.
    pub fn from_paths(paths: ConfigPaths) -> Result<Self> {
        let development = matches!(paths.mode(), PathMode::Development { .. });
        let data_dir = paths
            .state_file()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        fs::create_dir_all(&data_dir).map_err(|e| Error::fs(&data_dir, e))?;
        let logs_dir = paths.logs_dir();
        fs::create_dir_all(&logs_dir).map_err(|e| Error::fs(&logs_dir, e))?;

        let settings = Settings::load(&data_dir.join(SETTINGS_FILE))?;

        // Look for project config file
        let project_config_path = Self::find_project_config();

        Ok(Self {
            data_dir,
            development,
            paths,
            settings,
            project_config_path,
        })
    }

    /// Find project config file (mcp-manager.yaml) by traversing up from cwd
    fn find_project_config() -> Option<PathBuf> {
        let cwd = std::env::current_dir().ok()?;

        let mut dir = cwd.as_path();
        loop {
            let config_path = dir.join(PROJECT_FILE);
            if config_path.exists() {
                return Some(config_path);
            }

            // Also check for .yml extension
            let config_path = dir.join("mcp-manager.yml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }

        None
    }
}
