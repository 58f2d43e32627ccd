use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::secure::ct_str_eq;

/// Default ceiling on total cached artifact size.
/// Overridable via `NAAB_CACHE_LIMIT_BYTES`.
pub const DEFAULT_CACHE_LIMIT: u64 = 500 * 1024 * 1024;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Metadata {
    entries: IndexMap<String, MetaEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct MetaEntry {
    size: u64,
    last_used: u64,
}

/// Content-addressed persistent store of compiled polyglot artifacts.
///
/// Layout: `<root>/<lang>/<hash>/artifact` plus `<root>/<lang>/metadata.json`.
/// The metadata sidecar is guarded by an exclusive file lock, making the
/// cache safe to share across processes. Every failure path degrades to a
/// cache miss; the adapters then simply recompile.
#[derive(Debug)]
pub struct CodeCache {
    root: PathBuf,
    limit_bytes: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl CodeCache {
    pub fn new(root: PathBuf, limit_bytes: u64) -> Self {
        Self { root, limit_bytes }
    }

    /// `NAAB_CACHE_DIR`, falling back to `~/.naab/cache`.
    pub fn default_root() -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os("NAAB_CACHE_DIR") {
            return Some(PathBuf::from(dir));
        }
        home::home_dir().map(|home| home.join(".naab").join("cache"))
    }

    fn lang_dir(&self, lang: &str) -> PathBuf {
        self.root.join(lang)
    }

    /// Runs `f` with the language's metadata while holding the sidecar
    /// lock, then persists the (possibly mutated) table.
    fn with_metadata<T>(&self, lang: &str, f: impl FnOnce(&mut Metadata) -> T) -> Option<T> {
        let dir = self.lang_dir(lang);
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!(%err, "inline-code cache unavailable");
            return None;
        }
        let path = dir.join("metadata.json");
        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) => {
                warn!(%err, "cannot open cache metadata");
                return None;
            }
        };
        if let Err(err) = file.lock_exclusive() {
            warn!(%err, "cannot lock cache metadata");
            return None;
        }
        let result = self.with_locked(&mut file, f);
        if let Err(err) = fs2::FileExt::unlock(&file) {
            warn!(%err, "cannot unlock cache metadata");
        }
        result
    }

    fn with_locked<T>(&self, file: &mut File, f: impl FnOnce(&mut Metadata) -> T) -> Option<T> {
        let mut text = String::new();
        if file.read_to_string(&mut text).is_err() {
            return None;
        }
        let mut metadata: Metadata = if text.trim().is_empty() {
            Metadata::default()
        } else {
            match serde_json::from_str(&text) {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(%err, "corrupt cache metadata, resetting");
                    Metadata::default()
                }
            }
        };
        let result = f(&mut metadata);
        let serialized = match serde_json::to_string_pretty(&metadata) {
            Ok(serialized) => serialized,
            Err(_) => return None,
        };
        if file.set_len(0).is_err() || file.rewind().is_err() {
            return None;
        }
        if file.write_all(serialized.as_bytes()).is_err() {
            return None;
        }
        Some(result)
    }

    /// Returns the artifact path on a hit, refreshing its LRU stamp.
    /// Hash comparison against stored keys is constant-time.
    pub fn lookup(&self, lang: &str, hash: &str) -> Option<PathBuf> {
        let artifact = self.lang_dir(lang).join(hash).join("artifact");
        if !artifact.is_file() {
            return None;
        }
        self.with_metadata(lang, |metadata| {
            let key = metadata
                .entries
                .keys()
                .find(|k| ct_str_eq(k.as_str(), hash))
                .cloned()?;
            if let Some(entry) = metadata.entries.get_mut(&key) {
                entry.last_used = now_secs();
            }
            Some(())
        })??;
        Some(artifact)
    }

    /// Copies a freshly built artifact into the store and records it,
    /// evicting least-recently-used entries once the ceiling is exceeded.
    /// Returns the stored path, or `None` when anything fails.
    pub fn store(&self, lang: &str, hash: &str, built: &Path) -> Option<PathBuf> {
        let entry_dir = self.lang_dir(lang).join(hash);
        if let Err(err) = fs::create_dir_all(&entry_dir) {
            warn!(%err, "cannot create cache entry");
            return None;
        }
        let dest = entry_dir.join("artifact");
        let size = match fs::copy(built, &dest) {
            Ok(size) => size,
            Err(err) => {
                warn!(%err, "cannot store cache artifact");
                let _ = fs::remove_dir_all(&entry_dir);
                return None;
            }
        };
        let evicted = self.with_metadata(lang, |metadata| {
            metadata.entries.insert(
                hash.to_owned(),
                MetaEntry {
                    size,
                    last_used: now_secs(),
                },
            );
            let mut total: u64 = metadata.entries.values().map(|e| e.size).sum();
            let mut evicted = Vec::new();
            while total > self.limit_bytes && metadata.entries.len() > 1 {
                let Some(oldest) = metadata
                    .entries
                    .iter()
                    .filter(|(k, _)| k.as_str() != hash)
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                if let Some(entry) = metadata.entries.shift_remove(&oldest) {
                    total = total.saturating_sub(entry.size);
                }
                evicted.push(oldest);
            }
            evicted
        })?;
        for hash in evicted {
            debug!(lang, %hash, "evicting cached artifact");
            let _ = fs::remove_dir_all(self.lang_dir(lang).join(hash));
        }
        Some(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_limit(limit: u64) -> (tempfile::TempDir, CodeCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = CodeCache::new(dir.path().join("cache"), limit);
        (dir, cache)
    }

    fn fake_artifact(dir: &Path, name: &str, bytes: usize) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; bytes]).unwrap();
        path
    }

    #[test]
    fn miss_then_store_then_hit() {
        let (dir, cache) = cache_with_limit(DEFAULT_CACHE_LIMIT);
        assert!(cache.lookup("cpp", "abc123").is_none());
        let artifact = fake_artifact(dir.path(), "a.out", 64);
        let stored = cache.store("cpp", "abc123", &artifact).unwrap();
        assert!(stored.is_file());
        let hit = cache.lookup("cpp", "abc123").unwrap();
        assert_eq!(hit, stored);
    }

    #[test]
    fn lru_eviction_over_ceiling() {
        let (dir, cache) = cache_with_limit(150);
        let artifact = fake_artifact(dir.path(), "a.out", 100);
        cache.store("rust", "hash-old", &artifact).unwrap();
        // ensure a strictly older stamp
        cache
            .with_metadata("rust", |m| {
                m.entries.get_mut("hash-old").unwrap().last_used = 1;
            })
            .unwrap();
        cache.store("rust", "hash-new", &artifact).unwrap();
        assert!(cache.lookup("rust", "hash-old").is_none(), "oldest evicted");
        assert!(cache.lookup("rust", "hash-new").is_some());
    }

    #[test]
    fn store_failure_degrades_to_miss() {
        let (dir, cache) = cache_with_limit(DEFAULT_CACHE_LIMIT);
        let missing = dir.path().join("nonexistent");
        assert!(cache.store("go", "h", &missing).is_none());
        assert!(cache.lookup("go", "h").is_none());
    }

    #[test]
    fn languages_are_partitioned() {
        let (dir, cache) = cache_with_limit(DEFAULT_CACHE_LIMIT);
        let artifact = fake_artifact(dir.path(), "a.out", 10);
        cache.store("cpp", "shared-hash", &artifact).unwrap();
        assert!(cache.lookup("rust", "shared-hash").is_none());
    }
}
