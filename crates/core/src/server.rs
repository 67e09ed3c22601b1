//! Server records: the launch definition of one managed MCP server.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Normalize a server name: trimmed and lowercased.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Derive a short server name from an npm package name.
///
/// `@modelcontextprotocol/server-github` and `mcp-github` both become `github`.
pub fn package_short_name(package: &str) -> String {
    let mut name = package.trim();
    for prefix in ["@modelcontextprotocol/server-", "@mcp/", "mcp-", "mcp/", "server-"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest;
        }
    }
    if name.starts_with('@') {
        name = name.rsplit('/').next().unwrap_or(name);
    }
    normalize_name(name)
}

/// Where a record was found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerSource {
    #[default]
    Registry,
    Client,
    Both,
}

impl ServerSource {
    fn is_registry(&self) -> bool {
        *self == ServerSource::Registry
    }
}

impl fmt::Display for ServerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerSource::Registry => "registry",
            ServerSource::Client => "client",
            ServerSource::Both => "both",
        })
    }
}

/// A server launched as a local command speaking over stdio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to run
    pub command: String,
    /// Arguments, in order
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// A server reached over a network socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    pub host: String,
    pub port: u16,
    /// Free-form options; `scheme` (default `ws`) and `path` shape the URL
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl SocketConfig {
    /// URL clients use to reach this endpoint.
    pub fn url(&self) -> String {
        let scheme = self.options.get("scheme").map(String::as_str).unwrap_or("ws");
        let path = self.options.get("path").map(String::as_str).unwrap_or("");
        let sep = if path.is_empty() || path.starts_with('/') { "" } else { "/" };
        format!("{}://{}:{}{}{}", scheme, self.host, self.port, sep, path)
    }

    /// Parse `scheme://host:port/path` back into a socket config.
    pub fn from_url(url: &str) -> Option<Self> {
        let (scheme, rest) = url.split_once("://")?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        let (host, port) = authority.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;

        let mut options = BTreeMap::new();
        if scheme != "ws" {
            options.insert("scheme".to_string(), scheme.to_string());
        }
        if !path.is_empty() && path != "/" {
            options.insert("path".to_string(), path.to_string());
        }
        Some(Self {
            host: host.to_string(),
            port,
            options,
        })
    }

    /// `host:port` for connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How a server is reached. The two shapes never mix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerKind {
    Command(CommandSpec),
    Socket(SocketConfig),
}

impl ServerKind {
    pub fn label(&self) -> &'static str {
        match self {
            ServerKind::Command(_) => "command",
            ServerKind::Socket(_) => "socket",
        }
    }
}

/// One managed server's launch definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Unique key; filled from the registry map key, never serialized
    #[serde(skip)]
    pub name: String,
    #[serde(flatten)]
    pub kind: ServerKind,
    #[serde(default, skip_serializing_if = "ServerSource::is_registry")]
    pub source: ServerSource,
}

impl ServerRecord {
    /// A command-kind record.
    pub fn command<I, S>(name: &str, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: normalize_name(name),
            kind: ServerKind::Command(CommandSpec {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: BTreeMap::new(),
            }),
            source: ServerSource::Registry,
        }
    }

    /// A socket-kind record.
    pub fn socket(name: &str, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: normalize_name(name),
            kind: ServerKind::Socket(SocketConfig {
                host: host.into(),
                port,
                options: BTreeMap::new(),
            }),
            source: ServerSource::Registry,
        }
    }

    /// Add an environment variable (command kind) or option (socket kind).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self.kind {
            ServerKind::Command(spec) => {
                spec.env.insert(key.into(), value.into());
            }
            ServerKind::Socket(socket) => {
                socket.options.insert(key.into(), value.into());
            }
        }
        self
    }

    /// Check the record's invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("server name must not be empty".into()));
        }
        if self.name != normalize_name(&self.name) {
            return Err(Error::Validation(format!(
                "server name '{}' must be lowercase without surrounding whitespace",
                self.name
            )));
        }
        if self.name.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(Error::Validation(format!(
                "server name '{}' must not contain whitespace or '/'",
                self.name
            )));
        }

        match &self.kind {
            ServerKind::Command(spec) => {
                if spec.command.trim().is_empty() {
                    return Err(Error::Validation(format!(
                        "server '{}' has an empty command",
                        self.name
                    )));
                }
                if let Some(key) = spec.env.keys().find(|k| k.is_empty() || k.contains('=')) {
                    return Err(Error::Validation(format!(
                        "server '{}' has an invalid environment variable name '{}'",
                        self.name, key
                    )));
                }
            }
            ServerKind::Socket(socket) => {
                if socket.host.trim().is_empty() {
                    return Err(Error::Validation(format!(
                        "server '{}' has an empty socket host",
                        self.name
                    )));
                }
                if socket.port == 0 {
                    return Err(Error::Validation(format!(
                        "server '{}' has socket port 0",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// One-line description of how the server is launched.
    pub fn launch_line(&self) -> String {
        match &self.kind {
            ServerKind::Command(spec) if spec.args.is_empty() => spec.command.clone(),
            ServerKind::Command(spec) => format!("{} {}", spec.command, spec.args.join(" ")),
            ServerKind::Socket(socket) => socket.url(),
        }
    }
}
