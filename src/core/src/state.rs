//! Build state threaded through every plan step.
//!
//! A [`State`] is split into two parts. [`BuildState`] is the cacheable
//! result of a step and the only input to the cache [`Fingerprint`].
//! [`NoCache`] carries step-local bookkeeping (the live container, host
//! run configuration, the sticky cache-bust flag) that must never affect
//! cache lookups.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Version tag mixed into every fingerprint.
const FINGERPRINT_VERSION: &[u8] = b"kiln-state-v1\n";

/// Container configuration accumulated by the build.
///
/// Maps and sets are ordered so that serialization, and therefore the
/// fingerprint, is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub image: String,
    pub user: String,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub working_dir: String,
    pub labels: BTreeMap<String, String>,
    pub volumes: BTreeSet<String>,
    pub exposed_ports: BTreeSet<String>,
    pub on_build: Vec<String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub attach_stdin: bool,
    pub stdin_once: bool,
}

impl ContainerConfig {
    /// Look up an environment variable.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            (k == key).then_some(v)
        })
    }

    /// Set an environment variable, replacing an existing entry in place.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{}={}", key, value);
        let existing = self
            .env
            .iter()
            .position(|e| e.split_once('=').map(|(k, _)| k).unwrap_or(e) == key);
        match existing {
            Some(idx) => self.env[idx] = entry,
            None => self.env.push(entry),
        }
    }

    /// Environment as an ordered key/value map.
    pub fn env_map(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .map(|e| {
                let (k, v) = e.split_once('=').unwrap_or((e.as_str(), ""));
                (k.to_string(), v.to_string())
            })
            .collect()
    }
}

/// Host-level run configuration for the step's container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// `host:container` bind mounts
    pub binds: Vec<String>,
    /// Containers whose volumes are mounted
    pub volumes_from: Vec<String>,
}

/// Cacheable part of the state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildState {
    /// Container configuration of the image being built
    pub config: ContainerConfig,
    /// Last produced (or base) image id
    pub image_id: String,
    /// Image the current image was committed on top of
    pub parent_id: String,
    /// Container that performed the latest EXPORT
    pub exports_id: String,
    /// FROM scratch
    pub no_base_image: bool,
    /// Whether `image_id` was produced by this build rather than pulled
    pub produced_image: bool,
    /// Pending commit messages, turned into an image by the next COMMIT
    pub commits: Vec<String>,
}

impl BuildState {
    /// Compute the cache fingerprint of this state.
    ///
    /// `exports_id` is left out: it names the container that ran the last
    /// EXPORT, which is a product of that step rather than an input to it.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        let keyed = BuildState {
            exports_id: String::new(),
            ..self.clone()
        };
        let json = serde_json::to_vec(&keyed)?;
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_VERSION);
        hasher.update(&json);
        Ok(Fingerprint(hex::encode(hasher.finalize())))
    }
}

/// Step-local bookkeeping excluded from fingerprints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoCache {
    /// Container created by the current step and not yet committed
    pub container_id: Option<String>,
    /// Binds and volumes-from for containers created by this stage
    pub host_config: HostConfig,
    /// Sticky: an ancestor step could not be reused
    pub cache_busted: bool,
    /// CMD was set in the current stage
    pub cmd_set: bool,
}

/// The value threaded through the plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    pub build: BuildState,
    pub no_cache: NoCache,
    /// Raw instructions to splice in after the current step
    pub inject_commands: Vec<String>,
}

impl State {
    /// State restored from a cache entry, keeping this state's step-local part.
    pub fn with_cached(&self, cached: BuildState) -> State {
        State {
            build: cached,
            no_cache: self.no_cache.clone(),
            inject_commands: Vec::new(),
        }
    }

    pub fn fingerprint(&self) -> Result<Fingerprint> {
        self.build.fingerprint()
    }

    /// Record a pending commit message.
    pub fn commit(&mut self, message: impl Into<String>) {
        self.build.commits.push(message.into());
    }

    /// Drop pending commit messages.
    pub fn clean_commits(&mut self) {
        self.build.commits.clear();
    }

    /// Pending commit messages joined for the image comment.
    pub fn commits_message(&self) -> String {
        self.build.commits.join("; ")
    }

    pub fn has_image(&self) -> bool {
        !self.build.image_id.is_empty() || self.build.no_base_image
    }
}

/// Hex SHA-256 cache key of a [`BuildState`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accept an existing hex key, e.g. a cache file stem.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let valid = hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Fingerprint(hex.to_ascii_lowercase()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
