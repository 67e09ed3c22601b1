//! Projection of the registry into client config files.

use crate::client::{ClientConfigSnapshot, Upsert};
use crate::paths::Client;
use crate::registry::ConfigStore;
use crate::server::normalize_name;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// What happens to client entries the registry doesn't know about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Keep them; registry entries win on name collisions.
    #[default]
    Merge,
    /// Drop them; the client ends up with exactly the registry's servers.
    Overwrite,
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncPolicy::Merge => "merge",
            SyncPolicy::Overwrite => "overwrite",
        })
    }
}

impl FromStr for SyncPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "merge" => Ok(SyncPolicy::Merge),
            "overwrite" => Ok(SyncPolicy::Overwrite),
            other => Err(Error::Validation(format!(
                "unknown sync policy '{}' (expected merge or overwrite)",
                other
            ))),
        }
    }
}

/// What a sync did to one client file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub client: Client,
    pub path: PathBuf,
    pub policy: SyncPolicy,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    /// Client-only entries dropped by the overwrite policy
    pub removed: Vec<String>,
    /// Client-only entries kept by the merge policy
    pub preserved: Vec<String>,
    /// Registry entries the client can't represent
    pub skipped: Vec<String>,
}

impl SyncReport {
    fn new(client: Client, path: PathBuf, policy: SyncPolicy) -> Self {
        Self {
            client,
            path,
            policy,
            added: Vec::new(),
            updated: Vec::new(),
            unchanged: Vec::new(),
            removed: Vec::new(),
            preserved: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Whether the client file had to be rewritten.
    pub fn changed(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

/// Writes registry servers into client files under a fixed policy.
pub struct SyncEngine<'a> {
    store: &'a ConfigStore,
    policy: SyncPolicy,
}

impl<'a> SyncEngine<'a> {
    pub fn new(store: &'a ConfigStore, policy: SyncPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    /// Sync a client given by name. Unknown names are a sync error.
    pub fn sync_named(&self, target: &str) -> Result<SyncReport> {
        let client: Client = target.parse()?;
        self.sync(client)
    }

    /// Sync one client.
    pub fn sync(&self, client: Client) -> Result<SyncReport> {
        let global = self.store.load_cached()?;
        let path = self.store.paths().resolve(client);
        let mut snapshot = ClientConfigSnapshot::load(client, &path)?;
        let mut report = SyncReport::new(client, path, self.policy);

        for record in global.servers.values() {
            let bucket = match snapshot.upsert(record) {
                Upsert::Added => &mut report.added,
                Upsert::Updated => &mut report.updated,
                Upsert::Unchanged => &mut report.unchanged,
                Upsert::Skipped => {
                    warn!(
                        "Skipping '{}' for {}: {} servers are not supported",
                        record.name,
                        client,
                        record.kind.label()
                    );
                    &mut report.skipped
                }
            };
            bucket.push(record.name.clone());
        }

        for key in snapshot.server_names() {
            if global.servers.contains_key(&normalize_name(&key)) {
                continue;
            }
            match self.policy {
                SyncPolicy::Merge => report.preserved.push(key),
                SyncPolicy::Overwrite => {
                    snapshot.remove(&key);
                    report.removed.push(key);
                }
            }
        }

        if report.changed() || !snapshot.exists_on_disk() {
            snapshot.save()?;
            self.store.invalidate_client(client);
            info!(
                "Synced {} ({} added, {} updated, {} removed)",
                client,
                report.added.len(),
                report.updated.len(),
                report.removed.len()
            );
        } else {
            info!("{} is already up to date", client);
        }
        Ok(report)
    }

    /// Delete the entries for `names` from a client, whatever the policy.
    /// Returns the keys that were removed.
    pub fn remove_from(&self, client: Client, names: &[String]) -> Result<Vec<String>> {
        let path = self.store.paths().resolve(client);
        let mut snapshot = ClientConfigSnapshot::load(client, &path)?;

        let targets: Vec<String> = names.iter().map(|n| normalize_name(n)).collect();
        let mut removed = Vec::new();
        for key in snapshot.server_names() {
            if targets.contains(&normalize_name(&key)) && snapshot.remove(&key) {
                removed.push(key);
            }
        }

        if !removed.is_empty() {
            snapshot.save()?;
            self.store.invalidate_client(client);
            info!("Removed {} from {}", removed.join(", "), client);
        }
        Ok(removed)
    }

    /// Sync every known client; one client's failure doesn't stop the rest.
    pub fn sync_all(&self) -> Vec<(Client, Result<SyncReport>)> {
        Client::ALL
            .into_iter()
            .map(|client| (client, self.sync(client)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::ConfigPaths;
    use crate::server::ServerRecord;
    use serde_json::{json, Value};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ConfigStore {
        ConfigStore::new(ConfigPaths::sandboxed(dir.path()), Duration::from_secs(300))
    }

    fn write(path: &Path, value: Value) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, value.to_string()).unwrap();
    }

    fn read(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    fn client_with_unmanaged_entry(store: &ConfigStore) -> PathBuf {
        let path = store.paths().resolve(Client::Cursor);
        write(
            &path,
            json!({"mcpServers": {"handmade": {"command": "node", "args": ["srv.js"]}}}),
        );
        path
    }

    #[test]
    fn test_merge_preserves_unmanaged_entry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let path = client_with_unmanaged_entry(&store);

        let report = SyncEngine::new(&store, SyncPolicy::Merge)
            .sync(Client::Cursor)
            .unwrap();

        assert_eq!(report.preserved, vec!["handmade"]);
        assert!(report.removed.is_empty());
        assert_eq!(
            read(&path)["mcpServers"]["handmade"],
            json!({"command": "node", "args": ["srv.js"]})
        );
    }

    #[test]
    fn test_overwrite_removes_unmanaged_entry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let path = client_with_unmanaged_entry(&store);

        let report = SyncEngine::new(&store, SyncPolicy::Overwrite)
            .sync(Client::Cursor)
            .unwrap();

        assert_eq!(report.removed, vec!["handmade"]);
        assert_eq!(read(&path), json!({"mcpServers": {}}));
    }

    #[test]
    fn test_sync_writes_registry_servers() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .register(ServerRecord::command("alpha", "echo", ["hi"]).with_env("K", "V"))
            .unwrap();
        store
            .register(ServerRecord::socket("remote", "localhost", 9000))
            .unwrap();

        let engine = SyncEngine::new(&store, SyncPolicy::Merge);
        let report = engine.sync(Client::Vscode).unwrap();
        assert_eq!(report.added, vec!["alpha", "remote"]);

        let written = read(&store.paths().resolve(Client::Vscode));
        assert_eq!(
            written["mcpServers"],
            json!({
                "alpha": {"command": "echo", "args": ["hi"], "env": {"K": "V"}},
                "remote": {"url": "ws://localhost:9000"}
            })
        );

        let again = engine.sync(Client::Vscode).unwrap();
        assert!(!again.changed());
        assert_eq!(again.unchanged, vec!["alpha", "remote"]);
    }

    #[test]
    fn test_claude_desktop_skips_socket_servers() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .register(ServerRecord::socket("remote", "localhost", 9000))
            .unwrap();

        let report = SyncEngine::new(&store, SyncPolicy::Merge)
            .sync(Client::ClaudeDesktop)
            .unwrap();
        assert_eq!(report.skipped, vec!["remote"]);
        assert_eq!(
            read(&store.paths().resolve(Client::ClaudeDesktop)),
            json!({"mcpServers": {}})
        );
    }

    #[test]
    fn test_unknown_target_is_sync_error() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let err = SyncEngine::new(&store, SyncPolicy::Merge)
            .sync_named("emacs")
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Sync);
        assert!(err.to_string().contains("emacs"));
    }

    #[test]
    fn test_sync_all_isolates_failures() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        write(&store.paths().resolve(Client::Cursor), json!("not an object"));

        let results = SyncEngine::new(&store, SyncPolicy::Merge).sync_all();
        assert_eq!(results.len(), 3);
        for (client, result) in results {
            match client {
                Client::Cursor => {
                    assert_eq!(result.unwrap_err().kind(), crate::ErrorKind::Config)
                }
                _ => assert!(result.is_ok()),
            }
        }
    }

    #[test]
    fn test_remove_from_deletes_only_named_entries() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let path = store.paths().resolve(Client::Cursor);
        write(
            &path,
            json!({"mcpServers": {"GitHub": {"command": "a"}, "keep": {"command": "b"}}}),
        );

        let engine = SyncEngine::new(&store, SyncPolicy::Merge);
        let removed = engine
            .remove_from(Client::Cursor, &["github".to_string()])
            .unwrap();
        assert_eq!(removed, vec!["GitHub"]);
        assert_eq!(read(&path), json!({"mcpServers": {"keep": {"command": "b"}}}));

        let missing = engine
            .remove_from(Client::ClaudeDesktop, &["github".to_string()])
            .unwrap();
        assert!(missing.is_empty());
        assert!(!store.paths().resolve(Client::ClaudeDesktop).exists());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("Overwrite".parse::<SyncPolicy>().unwrap(), SyncPolicy::Overwrite);
        assert_eq!(SyncPolicy::default(), SyncPolicy::Merge);
        assert!("sideways".parse::<SyncPolicy>().is_err());
    }
}
