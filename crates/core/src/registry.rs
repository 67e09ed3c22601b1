//! The versioned server registry: the single source of truth that clients
//! are synced from and the process manager launches from.

use crate::cache::ConfigCache;
use crate::client::ClientConfigSnapshot;
use crate::fsio::{read_json, write_json_atomic, FileLock};
use crate::migration::{self, CURRENT_VERSION};
use crate::paths::{Client, ConfigKey, ConfigPaths};
use crate::server::{normalize_name, ServerRecord, ServerSource};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// On-disk envelope: `{ "version": N, "data": { "servers": {...}, ... } }`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    data: Value,
}

/// The registry contents at the current schema version.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    pub version: u32,
    pub servers: BTreeMap<String, ServerRecord>,
    /// Keys of `data` other than `servers`, carried through untouched.
    pub extra: Map<String, Value>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            servers: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

impl GlobalConfig {
    /// Build a registry holding `records`.
    pub fn with_servers(records: impl IntoIterator<Item = ServerRecord>) -> Self {
        Self {
            servers: records
                .into_iter()
                .map(|record| (record.name.clone(), record))
                .collect(),
            ..Self::default()
        }
    }

    /// Check every record and that each map key matches its record's name.
    pub fn validate(&self) -> Result<()> {
        if self.version > CURRENT_VERSION {
            return Err(Error::config(
                format!(
                    "Registry version {} is newer than the latest supported version {}",
                    self.version, CURRENT_VERSION
                ),
                None,
            ));
        }
        for (key, record) in &self.servers {
            record.validate()?;
            if key != &record.name {
                return Err(Error::Validation(format!(
                    "registry key '{}' does not match server name '{}'",
                    key, record.name
                )));
            }
        }
        Ok(())
    }

    fn from_data(data: Value, path: &Path) -> Result<Self> {
        let mut data = match data {
            Value::Object(data) => data,
            Value::Null => Map::new(),
            _ => {
                return Err(Error::config(
                    format!("Registry data in {} is not an object", path.display()),
                    None,
                ))
            }
        };

        let mut servers = BTreeMap::new();
        if let Some(entries) = data.remove("servers") {
            let Value::Object(entries) = entries else {
                return Err(Error::config(
                    format!("'servers' in {} is not an object", path.display()),
                    None,
                ));
            };
            for (key, entry) in entries {
                let mut record: ServerRecord = serde_json::from_value(entry).map_err(|e| {
                    Error::config(
                        format!("Invalid server '{}' in {}", key, path.display()),
                        Some(Box::new(e)),
                    )
                })?;
                let name = normalize_name(&key);
                if name != key {
                    debug!("Normalized registry key '{}' to '{}'", key, name);
                }
                record.name = name.clone();
                record.validate().map_err(|e| {
                    Error::config(
                        format!("Invalid server '{}' in {}", key, path.display()),
                        Some(Box::new(e)),
                    )
                })?;
                if servers.insert(name.clone(), record).is_some() {
                    return Err(Error::config(
                        format!(
                            "Registry {} contains duplicate server name '{}' after normalization",
                            path.display(),
                            name
                        ),
                        None,
                    ));
                }
            }
        }

        Ok(Self {
            version: CURRENT_VERSION,
            servers,
            extra: data,
        })
    }

    fn to_file(&self) -> Result<RegistryFile> {
        let mut servers = Map::new();
        for (name, record) in &self.servers {
            servers.insert(name.clone(), serde_json::to_value(record)?);
        }

        let mut data = Map::new();
        data.insert("servers".to_string(), Value::Object(servers));
        for (key, value) in &self.extra {
            data.insert(key.clone(), value.clone());
        }

        Ok(RegistryFile {
            version: self.version,
            data: Value::Object(data),
        })
    }
}

/// Reads and writes the registry file, and caches registry and client reads.
pub struct ConfigStore {
    paths: ConfigPaths,
    registry_cache: ConfigCache<ConfigKey, GlobalConfig>,
    client_cache: ConfigCache<Client, Vec<ServerRecord>>,
}

impl ConfigStore {
    pub fn new(paths: ConfigPaths, cache_ttl: Duration) -> Self {
        Self {
            paths,
            registry_cache: ConfigCache::new(cache_ttl),
            client_cache: ConfigCache::new(cache_ttl),
        }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn registry_path(&self) -> PathBuf {
        self.paths.resolve(ConfigKey::Registry)
    }

    /// Read the registry from disk, migrating and persisting it if needed.
    ///
    /// A missing file is created empty at the current version.
    pub fn load(&self) -> Result<GlobalConfig> {
        let path = self.registry_path();
        let _lock = FileLock::acquire(&path)?;
        self.load_locked(&path)
    }

    /// Like [`load`](Self::load), served from the cache while fresh.
    pub fn load_cached(&self) -> Result<GlobalConfig> {
        let path = self.registry_path();
        self.registry_cache
            .get(&ConfigKey::Registry, &path, || self.load())
    }

    /// Validate and atomically replace the registry file.
    pub fn save(&self, config: &GlobalConfig) -> Result<()> {
        config.validate()?;
        let path = self.registry_path();
        {
            let _lock = FileLock::acquire(&path)?;
            Self::write_locked(&path, config)?;
        }
        self.registry_cache.invalidate(&ConfigKey::Registry);
        Ok(())
    }

    /// Read-modify-write the registry under the file lock.
    pub fn update<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut GlobalConfig) -> Result<T>,
    {
        let path = self.registry_path();
        let outcome = {
            let _lock = FileLock::acquire(&path)?;
            let mut config = self.load_locked(&path)?;
            let outcome = mutate(&mut config)?;
            config.validate()?;
            Self::write_locked(&path, &config)?;
            outcome
        };
        self.registry_cache.invalidate(&ConfigKey::Registry);
        Ok(outcome)
    }

    /// Insert or replace a server. Returns `true` if one was replaced.
    pub fn register(&self, mut record: ServerRecord) -> Result<bool> {
        record.source = ServerSource::Registry;
        record.validate()?;
        let name = record.name.clone();
        let replaced = self.update(move |config| {
            Ok(config.servers.insert(record.name.clone(), record).is_some())
        })?;
        info!(
            "{} server '{}'",
            if replaced { "Updated" } else { "Registered" },
            name
        );
        Ok(replaced)
    }

    /// Remove a server, returning its record.
    pub fn unregister(&self, name: &str) -> Result<ServerRecord> {
        let name = normalize_name(name);
        let record = self.update(|config| {
            config
                .servers
                .remove(&name)
                .ok_or_else(|| Error::ServerNotFound(name.clone()))
        })?;
        info!("Unregistered server '{}'", name);
        Ok(record)
    }

    pub fn get(&self, name: &str) -> Result<ServerRecord> {
        let name = normalize_name(name);
        self.load_cached()?
            .servers
            .remove(&name)
            .ok_or(Error::ServerNotFound(name))
    }

    /// Every registered server, ordered by name.
    pub fn list(&self) -> Result<Vec<ServerRecord>> {
        Ok(self.load_cached()?.servers.into_values().collect())
    }

    /// The servers currently configured in `client`'s file.
    pub fn client_records(&self, client: Client) -> Result<Vec<ServerRecord>> {
        let path = self.paths.resolve(client);
        self.client_cache.get(&client, &path, || {
            Ok(ClientConfigSnapshot::load(client, &path)?.records())
        })
    }

    /// Registry servers merged with `client`'s, each tagged with where it
    /// was found. Registry definitions win for names present in both.
    pub fn list_with_client(&self, client: Client) -> Result<Vec<ServerRecord>> {
        let mut merged: Vec<ServerRecord> = self.list()?;
        let client_records = self.client_records(client)?;

        for record in client_records {
            match merged.iter_mut().find(|r| r.name == record.name) {
                Some(existing) => existing.source = ServerSource::Both,
                None => merged.push(record),
            }
        }
        Ok(merged)
    }

    /// Forget cached reads of `client`'s file.
    pub fn invalidate_client(&self, client: Client) {
        self.client_cache.invalidate(&client);
    }

    fn load_locked(&self, path: &Path) -> Result<GlobalConfig> {
        let (file, existed) = match read_json::<RegistryFile>(path)? {
            Some(file) => (file, true),
            None => (RegistryFile::default(), false),
        };

        if file.version > CURRENT_VERSION {
            return Err(Error::config(
                format!(
                    "Registry {} has version {}, newer than the latest supported version {}",
                    path.display(),
                    file.version,
                    CURRENT_VERSION
                ),
                None,
            ));
        }

        let migrate = migration::needs_migration(file.version);
        let data = if migrate {
            migration::migrate(file.data, file.version)?
        } else {
            file.data
        };
        let config = GlobalConfig::from_data(data, path)?;

        if !existed || migrate {
            if existed {
                info!(
                    "Upgraded registry {} from version {} to {}",
                    path.display(),
                    file.version,
                    CURRENT_VERSION
                );
            } else {
                info!("Creating empty registry at {}", path.display());
            }
            Self::write_locked(path, &config)?;
        }

        debug!("Loaded {} servers from {}", config.servers.len(), path.display());
        Ok(config)
    }

    fn write_locked(path: &Path, config: &GlobalConfig) -> Result<()> {
        write_json_atomic(path, &config.to_file()?)
    }
}
