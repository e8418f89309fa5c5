use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

/// Filesystem-backed JSON store for fetched API pages, keyed by namespace and
/// key. Any failure to read is a cache miss and any failure to write is
/// logged, so the cache can never fail a run.
pub(crate) struct CacheGateway {
    root: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl CacheGateway {
    /// Opens (and creates) the cache directory. When that fails the returned
    /// gateway is disabled and always misses.
    pub(crate) fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        match fs::create_dir_all(&dir) {
            Ok(()) => Self {
                root: Some(dir),
                write_lock: Mutex::new(()),
            },
            Err(err) => {
                warn!(dir = %dir.display(), %err, "cache directory unavailable, caching disabled");
                Self::disabled()
            }
        }
    }

    pub(crate) fn disabled() -> Self {
        Self {
            root: None,
            write_lock: Mutex::new(()),
        }
    }

    pub(crate) fn default_dir() -> Option<PathBuf> {
        ProjectDirs::from("org", "coinledger", "coinledger").map(|dirs| dirs.cache_dir().to_path_buf())
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    fn entry_path(&self, namespace: &str, key: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(namespace).join(format!("{key}.json")))
    }

    pub(crate) fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
        let path = self.entry_path(namespace, key)?;
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), %err, "error reading cache entry");
                return None;
            }
        };

        match serde_json::from_str(&json) {
            Ok(value) => {
                debug!(namespace, key, "cache hit");
                Some(value)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "corrupt cache entry, ignoring");
                None
            }
        }
    }

    /// Stores a value, returning whether it was written.
    pub(crate) fn put<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> bool {
        let Some(path) = self.entry_path(namespace, key) else {
            return false;
        };

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match write_atomically(&path, value) {
            Ok(()) => true,
            Err(err) => {
                warn!(path = %path.display(), "error writing cache entry: {:#}", err);
                false
            }
        }
    }

    /// Removes the entries `<prefix>-*` of a namespace other than `keep`.
    /// Returns how many were removed.
    pub(crate) fn remove_stale(&self, namespace: &str, prefix: &str, keep: &str) -> usize {
        let Some(dir) = self.root.as_ref().map(|root| root.join(namespace)) else {
            return 0;
        };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    warn!(dir = %dir.display(), %err, "error listing cache entries");
                }
                return 0;
            }
        };

        let stale_prefix = format!("{prefix}-");
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(key) = file_name.to_str().and_then(|name| name.strip_suffix(".json")) else {
                continue;
            };
            if key == keep || !key.starts_with(&stale_prefix) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(namespace, key, "removed stale cache entry");
                    removed += 1;
                }
                Err(err) => warn!(path = %entry.path().display(), %err, "error removing cache entry"),
            }
        }
        removed
    }
}

fn write_atomically<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().context("cache entry without parent directory")?;
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_string(value)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("renaming to {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Page {
        items: Vec<String>,
    }

    fn page() -> Page {
        Page { items: vec!["a".to_owned(), "b".to_owned()] }
    }

    #[test]
    fn test_miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheGateway::open(dir.path());

        assert_eq!(cache.get::<Page>("Exchange/deposits", "2021-Q1"), None);
        assert!(cache.put("Exchange/deposits", "2021-Q1", &page()));
        assert_eq!(cache.get::<Page>("Exchange/deposits", "2021-Q1"), Some(page()));
        assert!(dir.path().join("Exchange/deposits/2021-Q1.json").is_file());
        assert!(!dir.path().join("Exchange/deposits/2021-Q1.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheGateway::open(dir.path());
        fs::create_dir_all(dir.path().join("ns")).unwrap();
        fs::write(dir.path().join("ns/key.json"), "{\"items\": [1,").unwrap();

        assert_eq!(cache.get::<Page>("ns", "key"), None);

        // a later write replaces the corrupt entry
        assert!(cache.put("ns", "key", &page()));
        assert_eq!(cache.get::<Page>("ns", "key"), Some(page()));
    }

    #[test]
    fn test_disabled_cache_always_misses() {
        let cache = CacheGateway::disabled();
        assert!(!cache.is_enabled());
        assert!(!cache.put("ns", "key", &page()));
        assert_eq!(cache.get::<Page>("ns", "key"), None);
    }

    #[test]
    fn test_remove_stale_keeps_latest_and_closed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheGateway::open(dir.path());
        for key in ["2021-Q1-100", "2021-Q1-200", "2021-Q1", "2020-Q4"] {
            assert!(cache.put("ns", key, &page()));
        }

        assert_eq!(cache.remove_stale("ns", "2021-Q1", "2021-Q1-200"), 1);
        assert_eq!(cache.get::<Page>("ns", "2021-Q1-100"), None);
        assert_eq!(cache.get::<Page>("ns", "2021-Q1-200"), Some(page()));
        assert_eq!(cache.get::<Page>("ns", "2021-Q1"), Some(page()));
        assert_eq!(cache.get::<Page>("ns", "2020-Q4"), Some(page()));

        assert_eq!(cache.remove_stale("missing", "2021-Q1", "2021-Q1-200"), 0);
        assert_eq!(CacheGateway::disabled().remove_stale("ns", "2021-Q1", "x"), 0);
    }

    #[test]
    fn test_open_failure_disables_cache() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, "").unwrap();

        let cache = CacheGateway::open(file.join("cache"));
        assert!(!cache.is_enabled());
        assert_eq!(cache.get::<Page>("ns", "key"), None);
    }
}
