//! Resolution of the registry and client config file locations.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// An MCP client application whose config file mirrors the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Client {
    Cursor,
    ClaudeDesktop,
    Vscode,
}

impl Client {
    pub const ALL: [Client; 3] = [Client::Cursor, Client::ClaudeDesktop, Client::Vscode];

    pub fn as_str(&self) -> &'static str {
        match self {
            Client::Cursor => "cursor",
            Client::ClaudeDesktop => "claude-desktop",
            Client::Vscode => "vscode",
        }
    }

    /// Whether the client accepts URL-based (remote) server entries.
    pub fn supports_remote(&self) -> bool {
        !matches!(self, Client::ClaudeDesktop)
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Client {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cursor" => Ok(Client::Cursor),
            "claude-desktop" | "claude" => Ok(Client::ClaudeDesktop),
            "vscode" | "cline" => Ok(Client::Vscode),
            _ => Err(Error::Sync(s.to_string())),
        }
    }
}

/// Logical config file the resolver knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigKey {
    Registry,
    Client(Client),
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigKey::Registry => f.write_str("registry"),
            ConfigKey::Client(client) => client.fmt(f),
        }
    }
}

impl From<Client> for ConfigKey {
    fn from(client: Client) -> Self {
        ConfigKey::Client(client)
    }
}

/// Where default paths are rooted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMode {
    /// Real user-profile locations.
    User {
        home: PathBuf,
        config_dir: PathBuf,
        data_dir: PathBuf,
    },
    /// Everything under `<sandbox>/dev-config/`.
    Development { sandbox: PathBuf },
}

/// Maps [`ConfigKey`]s to absolute paths, with per-instance overrides.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    mode: PathMode,
    overrides: HashMap<ConfigKey, PathBuf>,
}

impl ConfigPaths {
    pub fn new(mode: PathMode) -> Self {
        Self {
            mode,
            overrides: HashMap::new(),
        }
    }

    /// Development-mode resolver rooted at `sandbox`.
    pub fn sandboxed(sandbox: impl Into<PathBuf>) -> Self {
        Self::new(PathMode::Development {
            sandbox: sandbox.into(),
        })
    }

    pub fn mode(&self) -> &PathMode {
        &self.mode
    }

    /// Path for `key`, honoring any override.
    pub fn resolve(&self, key: impl Into<ConfigKey>) -> PathBuf {
        let key = key.into();
        self.overrides
            .get(&key)
            .cloned()
            .unwrap_or_else(|| self.default_path(key))
    }

    /// Redirect `key` to `path` for the lifetime of this resolver.
    pub fn set_override(&mut self, key: impl Into<ConfigKey>, path: impl Into<PathBuf>) -> Result<()> {
        let key = key.into();
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(Error::Validation(format!("Invalid path for {}", key)));
        }
        self.overrides.insert(key, path);
        Ok(())
    }

    pub fn reset(&mut self, key: impl Into<ConfigKey>) {
        self.overrides.remove(&key.into());
    }

    pub fn reset_all(&mut self) {
        self.overrides.clear();
    }

    /// Every known key with its resolved path.
    pub fn all(&self) -> Vec<(ConfigKey, PathBuf)> {
        std::iter::once(ConfigKey::Registry)
            .chain(Client::ALL.into_iter().map(ConfigKey::Client))
            .map(|key| (key, self.resolve(key)))
            .collect()
    }

    /// Directory holding per-server log files.
    pub fn logs_dir(&self) -> PathBuf {
        self.registry_dir().join("logs")
    }

    /// File tracking spawned processes across invocations.
    pub fn state_file(&self) -> PathBuf {
        self.registry_dir().join("state.json")
    }

    fn registry_dir(&self) -> PathBuf {
        let registry = self.resolve(ConfigKey::Registry);
        registry
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn default_path(&self, key: ConfigKey) -> PathBuf {
        match &self.mode {
            PathMode::Development { sandbox } => {
                let dir = sandbox.join("dev-config");
                match key {
                    ConfigKey::Registry => dir.join("mcp.json"),
                    ConfigKey::Client(Client::Cursor) => dir.join("cursor.json"),
                    ConfigKey::Client(Client::ClaudeDesktop) => dir.join("claude-desktop.json"),
                    ConfigKey::Client(Client::Vscode) => dir.join("vscode.json"),
                }
            }
            PathMode::User {
                home,
                config_dir,
                data_dir,
            } => match key {
                ConfigKey::Registry => data_dir.join("registry.json"),
                ConfigKey::Client(Client::Cursor) => home.join(".cursor").join("mcp.json"),
                ConfigKey::Client(Client::ClaudeDesktop) => config_dir
                    .join("Claude")
                    .join("claude_desktop_config.json"),
                ConfigKey::Client(Client::Vscode) => config_dir
                    .join("Code")
                    .join("User")
                    .join("globalStorage")
                    .join("saoudrizwan.claude-dev")
                    .join("settings")
                    .join("cline_mcp_settings.json"),
            },
        }
    }
}
