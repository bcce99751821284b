//! Filesystem cache store.
//!
//! Entries are stored as `<cache_dir>/<fingerprint>.json`. Writes go to a
//! temporary file first and are renamed into place, so a crashed build never
//! leaves a truncated entry behind.

use super::CacheStore;
use kiln_core::error::{KilnError, Result};
use kiln_core::state::{BuildState, Fingerprint};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk cache record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    /// When the entry was written
    pub cached_at: chrono::DateTime<chrono::Utc>,
    pub state: BuildState,
}

/// Cache store backed by a directory of JSON files.
pub struct CacheFs {
    cache_dir: PathBuf,
}

impl CacheFs {
    /// Open (and create if needed) a cache directory.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            KilnError::CacheError(format!(
                "Failed to create cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_path(&self, key: &Fingerprint) -> PathBuf {
        self.cache_dir.join(format!("{}.json", key))
    }

    /// All readable entries, oldest first.
    pub fn list_entries(&self) -> Result<Vec<CacheEntry>> {
        let dir = std::fs::read_dir(&self.cache_dir).map_err(|e| {
            KilnError::CacheError(format!(
                "Failed to read cache directory {}: {}",
                self.cache_dir.display(),
                e
            ))
        })?;

        let mut entries = Vec::new();
        for item in dir.flatten() {
            let path = item.path();
            let is_entry = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(Fingerprint::from_hex)
                .is_some()
                && path.extension().is_some_and(|ext| ext == "json");
            if !is_entry {
                continue;
            }
            match read_entry(&path) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry"),
            }
        }
        entries.sort_by_key(|e| e.cached_at);
        Ok(entries)
    }
}

fn read_entry(path: &Path) -> Result<CacheEntry> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        KilnError::CacheError(format!("Failed to read cache entry {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        KilnError::CacheError(format!("Corrupt cache entry {}: {}", path.display(), e))
    })
}

impl CacheStore for CacheFs {
    fn get(&self, key: &Fingerprint) -> Result<Option<BuildState>> {
        let path = self.entry_path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let entry = read_entry(&path)?;
        tracing::debug!(fingerprint = %key, image = %entry.state.image_id, "Cache entry found");
        Ok(Some(entry.state))
    }

    fn put(&self, key: &Fingerprint, state: &BuildState) -> Result<()> {
        let entry = CacheEntry {
            fingerprint: key.to_string(),
            cached_at: chrono::Utc::now(),
            state: state.clone(),
        };
        let json = serde_json::to_string_pretty(&entry)?;

        let path = self.entry_path(key);
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| {
            KilnError::CacheError(format!(
                "Failed to write cache entry {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            KilnError::CacheError(format!(
                "Failed to rename {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::debug!(fingerprint = %key, image = %state.image_id, "Cached build state");
        Ok(())
    }

    fn del(&self, key: &Fingerprint) -> Result<()> {
        let path = self.entry_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(fingerprint = %key, "Removed cache entry");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KilnError::CacheError(format!(
                "Failed to remove cache entry {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::state::State;
    use tempfile::TempDir;

    fn state_with_image(image: &str) -> BuildState {
        let mut state = State::default();
        state.build.image_id = image.to_string();
        state.commit("RUN make");
        state.build
    }

    #[test]
    fn test_new_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("nested").join("cache");
        let cache = CacheFs::new(&dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(cache.cache_dir(), dir);
    }

    #[test]
    fn test_get_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheFs::new(tmp.path()).unwrap();
        let key = state_with_image("sha256:a").fingerprint().unwrap();
        assert!(cache.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_put_get_del() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheFs::new(tmp.path()).unwrap();
        let state = state_with_image("sha256:a");
        let key = state.fingerprint().unwrap();

        cache.put(&key, &state).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(state));

        cache.del(&key).unwrap();
        assert!(cache.get(&key).unwrap().is_none());
        // Deleting twice is fine
        cache.del(&key).unwrap();
    }

    #[test]
    fn test_put_overwrites() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheFs::new(tmp.path()).unwrap();
        let key = state_with_image("sha256:a").fingerprint().unwrap();

        cache.put(&key, &state_with_image("sha256:first")).unwrap();
        cache.put(&key, &state_with_image("sha256:second")).unwrap();

        let found = cache.get(&key).unwrap().unwrap();
        assert_eq!(found.image_id, "sha256:second");
        assert!(!tmp.path().join(format!("{}.json.tmp", key)).exists());
    }

    #[test]
    fn test_corrupt_entry_is_error() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheFs::new(tmp.path()).unwrap();
        let key = state_with_image("sha256:a").fingerprint().unwrap();
        std::fs::write(tmp.path().join(format!("{}.json", key)), "{not json").unwrap();
        assert!(matches!(cache.get(&key), Err(KilnError::CacheError(_))));
    }

    #[test]
    fn test_list_entries_skips_foreign_files() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheFs::new(tmp.path()).unwrap();
        for image in ["sha256:a", "sha256:b"] {
            let state = state_with_image(image);
            cache.put(&state.fingerprint().unwrap(), &state).unwrap();
        }
        std::fs::write(tmp.path().join("README.txt"), "hello").unwrap();

        let entries = cache.list_entries().unwrap();
        assert_eq!(entries.len(), 2);
    }
}
