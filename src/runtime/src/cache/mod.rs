//! Build cache.
//!
//! Maps a [`Fingerprint`] of the state before a commit to the state the
//! commit produced. [`CacheFs`] keeps one JSON file per entry on disk.

mod fs;

pub use fs::{CacheEntry, CacheFs};

use kiln_core::error::Result;
use kiln_core::state::{BuildState, Fingerprint};

/// Key/value store consulted by the cache probe.
pub trait CacheStore: Send + Sync {
    /// Look up a fingerprint. A missing entry is `Ok(None)`.
    fn get(&self, key: &Fingerprint) -> Result<Option<BuildState>>;

    /// Store (or overwrite) the state produced under `key`.
    fn put(&self, key: &Fingerprint, state: &BuildState) -> Result<()>;

    /// Remove an entry. Removing a missing entry is not an error.
    fn del(&self, key: &Fingerprint) -> Result<()>;
}
