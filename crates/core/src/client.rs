//! Client config files (`mcpServers` maps) and the projection of registry
//! records into them.
//!
//! Client documents are handled as untyped JSON so that every key the
//! manager does not own survives a rewrite untouched and in order.

use crate::fsio::{read_json, write_json_atomic};
use crate::paths::Client;
use crate::server::{normalize_name, CommandSpec, ServerKind, ServerRecord, ServerSource, SocketConfig};
use crate::{Error, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level key all supported clients keep their servers under.
pub const SERVERS_KEY: &str = "mcpServers";

/// Entry keys written by the manager. Anything else in an entry is left alone.
const MANAGED_KEYS: [&str; 4] = ["command", "args", "env", "url"];

/// Outcome of writing one record into a client document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Updated,
    Unchanged,
    /// The client can't represent this kind of server.
    Skipped,
}

/// Render `record` the way `client` expects it, if the client supports it.
pub fn project(record: &ServerRecord, client: Client) -> Option<Map<String, Value>> {
    let mut entry = Map::new();
    match &record.kind {
        ServerKind::Command(spec) => {
            entry.insert("command".into(), Value::String(spec.command.clone()));
            entry.insert(
                "args".into(),
                Value::Array(spec.args.iter().cloned().map(Value::String).collect()),
            );
            if !spec.env.is_empty() {
                let env = spec
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                entry.insert("env".into(), Value::Object(env));
            }
        }
        ServerKind::Socket(socket) => {
            if !client.supports_remote() {
                return None;
            }
            entry.insert("url".into(), Value::String(socket.url()));
        }
    }
    Some(entry)
}

/// Best-effort reading of a client entry as a server record.
pub fn parse_entry(name: &str, entry: &Value) -> Option<ServerRecord> {
    let entry = entry.as_object()?;

    let kind = if let Some(command) = entry.get("command").and_then(Value::as_str) {
        let args = entry
            .get("args")
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .filter_map(|a| a.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let env = entry
            .get("env")
            .and_then(Value::as_object)
            .map(|env| {
                env.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();
        ServerKind::Command(CommandSpec {
            command: command.to_string(),
            args,
            env,
        })
    } else {
        let url = entry.get("url").and_then(Value::as_str)?;
        ServerKind::Socket(SocketConfig::from_url(url)?)
    };

    Some(ServerRecord {
        name: normalize_name(name),
        kind,
        source: ServerSource::Client,
    })
}

/// A client's config file as it exists on disk.
#[derive(Debug, Clone)]
pub struct ClientConfigSnapshot {
    client: Client,
    path: PathBuf,
    document: Map<String, Value>,
    existed: bool,
}

impl ClientConfigSnapshot {
    /// Read the client's file. A missing file is an empty document.
    pub fn load(client: Client, path: &Path) -> Result<Self> {
        let document = match read_json::<Value>(path) {
            Ok(None) => None,
            Ok(Some(Value::Object(document))) => Some(document),
            Ok(Some(_)) => {
                return Err(Error::config(
                    format!(
                        "{} config {} is not a JSON object",
                        client,
                        path.display()
                    ),
                    None,
                ))
            }
            Err(Error::Config { source, .. }) => {
                return Err(Error::config(
                    format!("Failed to read {} config {}", client, path.display()),
                    source,
                ))
            }
            Err(e) => return Err(e),
        };

        if let Some(servers) = document.as_ref().and_then(|d| d.get(SERVERS_KEY)) {
            if !servers.is_object() {
                return Err(Error::config(
                    format!(
                        "'{}' in {} config {} is not an object",
                        SERVERS_KEY,
                        client,
                        path.display()
                    ),
                    None,
                ));
            }
        }

        Ok(Self {
            client,
            path: path.to_path_buf(),
            existed: document.is_some(),
            document: document.unwrap_or_default(),
        })
    }

    pub fn client(&self) -> Client {
        self.client
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists_on_disk(&self) -> bool {
        self.existed
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    fn servers(&self) -> Option<&Map<String, Value>> {
        self.document.get(SERVERS_KEY).and_then(Value::as_object)
    }

    fn servers_mut(&mut self) -> &mut Map<String, Value> {
        let servers = self
            .document
            .entry(SERVERS_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if !servers.is_object() {
            *servers = Value::Object(Map::new());
        }
        match servers {
            Value::Object(map) => map,
            _ => unreachable!("servers entry was just made an object"),
        }
    }

    /// Entry keys, exactly as written in the file.
    pub fn server_names(&self) -> Vec<String> {
        self.servers()
            .map(|servers| servers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entry(&self, name: &str) -> Option<&Value> {
        self.servers()?.get(name)
    }

    /// Records for every entry the manager can understand.
    pub fn records(&self) -> Vec<ServerRecord> {
        let Some(servers) = self.servers() else {
            return Vec::new();
        };
        servers
            .iter()
            .filter_map(|(name, entry)| {
                let record = parse_entry(name, entry);
                if record.is_none() {
                    debug!("Ignoring unrecognized {} entry '{}'", self.client, name);
                }
                record
            })
            .collect()
    }

    /// Write `record` into the document, keeping unmanaged keys of an
    /// existing entry with the same (normalized) name.
    pub fn upsert(&mut self, record: &ServerRecord) -> Upsert {
        let Some(projected) = project(record, self.client) else {
            return Upsert::Skipped;
        };

        let existing_key = self
            .server_names()
            .into_iter()
            .find(|key| normalize_name(key) == record.name);

        let servers = self.servers_mut();
        let previous = existing_key.as_ref().and_then(|key| servers.get(key)).cloned();

        let mut entry = match &previous {
            Some(Value::Object(previous)) => previous.clone(),
            _ => Map::new(),
        };
        for key in MANAGED_KEYS {
            if !projected.contains_key(key) && entry.contains_key(key) {
                entry = without_key(entry, key);
            }
        }
        for (key, value) in projected {
            entry.insert(key, value);
        }
        let entry = Value::Object(entry);

        match (existing_key, previous) {
            (Some(key), Some(previous)) if key == record.name => {
                if previous == entry {
                    return Upsert::Unchanged;
                }
                servers.insert(key, entry);
                Upsert::Updated
            }
            (Some(key), _) => {
                // Same server under a differently-cased key: take over the name.
                let renamed = without_key(std::mem::take(servers), &key);
                *servers = renamed;
                servers.insert(record.name.clone(), entry);
                Upsert::Updated
            }
            (None, _) => {
                servers.insert(record.name.clone(), entry);
                Upsert::Added
            }
        }
    }

    /// Remove the entry stored under exactly `key`.
    pub fn remove(&mut self, key: &str) -> bool {
        let servers = self.servers_mut();
        if !servers.contains_key(key) {
            return false;
        }
        let remaining = without_key(std::mem::take(servers), key);
        *servers = remaining;
        true
    }

    /// Atomically write the document back to its path.
    pub fn save(&mut self) -> Result<()> {
        self.servers_mut();
        write_json_atomic(&self.path, &Value::Object(self.document.clone()))?;
        self.existed = true;
        Ok(())
    }
}

/// Remove `key` without disturbing the order of the remaining keys.
fn without_key(map: Map<String, Value>, key: &str) -> Map<String, Value> {
    map.into_iter().filter(|(k, _)| k != key).collect()
}
