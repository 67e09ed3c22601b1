//! Read-through cache for expensive config reads.
//!
//! An entry is served only while it is younger than its TTL *and* the
//! backing file's modification time still matches the one observed when
//! the entry was loaded. Mutations never go through the cache; writers call
//! [`ConfigCache::invalidate`] after replacing the file.

use crate::fsio::modified_time;
use crate::Result;
use mini_moka::sync::Cache;
use std::hash::Hash;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Upper bound on cached entries; one per registry or client file.
const MAX_ENTRIES: u64 = 16;

/// TTL + mtime validated cache keyed by `K`.
///
/// Expiry is left to the in-memory cache; each entry also remembers the
/// backing file's modification time as observed before it was loaded.
pub struct ConfigCache<K, V> {
    ttl: Duration,
    entries: Cache<K, (V, Option<SystemTime>)>,
}

impl<K, V> ConfigCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(MAX_ENTRIES)
                .build(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached value for `key`, or run `loader` and cache its result.
    ///
    /// `backing` is the file whose modification time guards the entry. A
    /// failing loader leaves any previous entry untouched.
    pub fn get<F>(&self, key: &K, backing: &Path, loader: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let mtime = modified_time(backing);
        if let Some((data, seen)) = self.entries.get(key) {
            if seen == mtime {
                debug!("Cache hit for {:?}", key);
                return Ok(data);
            }
        }

        debug!("Cache miss for {:?}, loading {}", key, backing.display());
        let data = loader()?;
        // Keyed to the mtime seen before loading: a write racing the loader,
        // or one made by the loader itself, forces the next read to reload.
        self.entries.insert(key.clone(), (data.clone(), mtime));
        Ok(data)
    }

    /// Drop the entry for `key` unconditionally.
    pub fn invalidate(&self, key: &K) {
        if self.entries.contains_key(key) {
            debug!("Invalidated cache entry {:?}", key);
        }
        self.entries.invalidate(key);
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn counting_loader<'a>(calls: &'a Cell<u32>, value: &'a str) -> impl FnOnce() -> Result<String> + 'a {
        move || {
            calls.set(calls.get() + 1);
            Ok(value.to_string())
        }
    }

    #[test]
    fn test_two_reads_within_ttl_load_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, "{}").unwrap();

        let cache: ConfigCache<&str, String> = ConfigCache::new(Duration::from_secs(300));
        let calls = Cell::new(0);

        assert_eq!(cache.get(&"registry", &path, counting_loader(&calls, "a")).unwrap(), "a");
        assert_eq!(cache.get(&"registry", &path, counting_loader(&calls, "b")).unwrap(), "a");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_mtime_change_forces_reload_within_ttl() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, "{}").unwrap();

        let cache: ConfigCache<&str, String> = ConfigCache::new(Duration::from_secs(300));
        let calls = Cell::new(0);
        cache.get(&"registry", &path, counting_loader(&calls, "old")).unwrap();

        let touched = SystemTime::now() + Duration::from_secs(60);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(touched)
            .unwrap();

        assert_eq!(cache.get(&"registry", &path, counting_loader(&calls, "new")).unwrap(), "new");
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_expired_entry_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, "{}").unwrap();

        let cache: ConfigCache<&str, String> = ConfigCache::new(Duration::from_millis(50));
        let calls = Cell::new(0);
        cache.get(&"registry", &path, counting_loader(&calls, "a")).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(cache.get(&"registry", &path, counting_loader(&calls, "b")).unwrap(), "b");
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_write_during_load_forces_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, "{}").unwrap();

        let cache: ConfigCache<&str, String> = ConfigCache::new(Duration::from_secs(300));
        let racing_write = || {
            File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(SystemTime::now() + Duration::from_secs(60))
                .unwrap();
            Ok("stale".to_string())
        };
        cache.get(&"registry", &path, racing_write).unwrap();

        let calls = Cell::new(0);
        assert_eq!(cache.get(&"registry", &path, counting_loader(&calls, "fresh")).unwrap(), "fresh");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_invalidate_forces_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, "{}").unwrap();

        let cache: ConfigCache<&str, String> = ConfigCache::new(Duration::from_secs(300));
        let calls = Cell::new(0);
        cache.get(&"registry", &path, counting_loader(&calls, "a")).unwrap();
        cache.invalidate(&"registry");
        assert_eq!(cache.get(&"registry", &path, counting_loader(&calls, "b")).unwrap(), "b");
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_missing_backing_file_is_cached_until_it_appears() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cursor.json");

        let cache: ConfigCache<&str, String> = ConfigCache::new(Duration::from_secs(300));
        let calls = Cell::new(0);
        cache.get(&"cursor", &path, counting_loader(&calls, "empty")).unwrap();
        cache.get(&"cursor", &path, counting_loader(&calls, "empty")).unwrap();
        assert_eq!(calls.get(), 1);

        fs::write(&path, "{}").unwrap();
        cache.get(&"cursor", &path, counting_loader(&calls, "full")).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let cache: ConfigCache<&str, String> = ConfigCache::new(Duration::from_secs(300));

        let err = cache.get(&"registry", &path, || Err(crate::Error::Validation("boom".into())));
        assert!(err.is_err());

        let calls = Cell::new(0);
        cache.get(&"registry", &path, counting_loader(&calls, "ok")).unwrap();
        assert_eq!(calls.get(), 1);
    }
}
