//! Persistent key-scoped cache
//!
//! One binary file per cache key under `.taxgraph_cache/`. Caches are
//! loaded once at startup and written back at checkpoints (every N price
//! lookups, on shutdown, and before an error propagates). Missing or
//! unreadable files count as a cold start, not a failure.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default cache directory, relative to the working directory.
pub const CACHE_DIRECTORY: &str = ".taxgraph_cache";

/// Key-scoped binary blobs on disk, postcard-encoded.
#[derive(Debug, Clone)]
pub struct PersistentCache {
    base_dir: PathBuf,
}

impl Default for PersistentCache {
    fn default() -> Self {
        Self::new(CACHE_DIRECTORY)
    }
}

impl PersistentCache {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        PersistentCache {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.bin"))
    }

    /// Load the value stored under `key`. Returns `None` when the file is
    /// missing or cannot be decoded (a stale-format cache is rebuilt, not
    /// fatal).
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => {
                debug!("No cache file for key {key}");
                return None;
            }
        };
        match postcard::from_bytes(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Cache file {path:?} could not be decoded ({e}); starting cold");
                None
            }
        }
    }

    /// Serialize `value` under `key`, creating the cache directory on
    /// first use. Writes go to a sibling temp file first so a crash
    /// mid-write never truncates the previous checkpoint.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("Failed to create cache directory {:?}", self.base_dir))?;
        let bytes = postcard::to_stdvec(value).context("Failed to encode cache value")?;
        let path = self.path_for(key);
        let tmp_path = self.base_dir.join(format!("{key}.bin.tmp"));
        fs::write(&tmp_path, &bytes).with_context(|| format!("Failed to write {tmp_path:?}"))?;
        fs::rename(&tmp_path, &path).with_context(|| format!("Failed to move cache into place at {path:?}"))?;
        debug!("Saved {} bytes to cache key {key}", bytes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scratch_cache(name: &str) -> PersistentCache {
        let dir = std::env::temp_dir().join(format!("taxgraph-cache-test-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        PersistentCache::new(dir)
    }

    #[test]
    fn test_round_trip() {
        let cache = scratch_cache("round-trip");
        let mut value: HashMap<String, u64> = HashMap::new();
        value.insert("BTCUSD1".to_string(), 1_577_836_800);
        cache.save("pair-index", &value).unwrap();
        let loaded: HashMap<String, u64> = cache.load("pair-index").unwrap();
        assert_eq!(loaded, value);
        let _ = fs::remove_dir_all(cache.base_dir());
    }

    #[test]
    fn test_missing_key_is_none() {
        let cache = scratch_cache("missing");
        let loaded: Option<HashMap<String, u64>> = cache.load("never-written");
        assert!(loaded.is_none());
    }

    #[test]
    fn test_corrupt_file_is_none() {
        let cache = scratch_cache("corrupt");
        fs::create_dir_all(cache.base_dir()).unwrap();
        fs::write(cache.base_dir().join("garbled.bin"), b"\xff\xfe\x00garbage").unwrap();
        let loaded: Option<HashMap<String, u64>> = cache.load("garbled");
        assert!(loaded.is_none());
        let _ = fs::remove_dir_all(cache.base_dir());
    }
}
