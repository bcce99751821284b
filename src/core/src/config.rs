use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Base image name meaning "start from an empty filesystem".
pub const NO_BASE_IMAGE: &str = "scratch";

/// Image used for volume containers created by MOUNT.
pub const MOUNT_VOLUME_IMAGE: &str = "grammarly/scratch:latest";

/// Image providing a static rsync binary for EXPORT/IMPORT.
pub const RSYNC_IMAGE: &str = "grammarly/rsync-static:1";

/// Volume path inside the exports container where EXPORT stages files.
pub const EXPORTS_PATH: &str = "/.kiln_exports";

/// Path of the rsync binary volume inside the rsync image.
pub const RSYNC_BIN_PATH: &str = "/opt/rsync/bin";

/// Default Kilnfile name looked up in the context directory.
pub const DEFAULT_KILNFILE: &str = "Kilnfile";

/// Registry credentials passed to pull and push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    /// Parse a `user:password` pair.
    pub fn parse(s: &str) -> Option<Self> {
        let (username, password) = s.split_once(':')?;
        if username.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Settings for a single build run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Build context directory (COPY/ADD sources, relative MOUNT paths)
    pub context_dir: PathBuf,

    /// Kilnfile name, used to derive the build identifier
    pub kilnfile_name: String,

    /// Explicit build identifier for provisioned container names
    pub id: Option<String>,

    /// Patterns from the context's `.dockerignore`
    pub dockerignore: Vec<String>,

    /// Directory where PUSH writes artifact descriptions
    pub artifacts_path: Option<PathBuf>,

    /// Always pull base images, even if present locally
    pub pull: bool,

    /// Remove intermediate images that were not tagged
    pub no_garbage: bool,

    /// Run ATTACH steps
    pub attach: bool,

    /// Relay container output at info level
    pub verbose: bool,

    /// Disable the cache entirely
    pub no_cache: bool,

    /// Ignore existing cache entries and overwrite them
    pub reload_cache: bool,

    /// Actually push images on PUSH
    pub push: bool,

    /// Registry credentials
    pub auth: Option<AuthConfig>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            context_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            kilnfile_name: DEFAULT_KILNFILE.to_string(),
            id: None,
            dockerignore: Vec::new(),
            artifacts_path: None,
            pull: false,
            no_garbage: false,
            attach: false,
            verbose: false,
            no_cache: false,
            reload_cache: false,
            push: false,
            auth: None,
        }
    }
}

impl BuildConfig {
    /// Stable identifier of this build.
    ///
    /// Provisioned volume and exports containers are named after it, so two
    /// runs of the same Kilnfile in the same context share them.
    pub fn identifier(&self) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("{}:{}", self.context_dir.display(), self.kilnfile_name),
        }
    }
}

/// Default on-disk cache location (`~/.kiln/cache`).
pub fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kiln")
        .join("cache")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_prefers_explicit_id() {
        let config = BuildConfig {
            id: Some("my-build".to_string()),
            ..Default::default()
        };
        assert_eq!(config.identifier(), "my-build");
    }

    #[test]
    fn test_identifier_from_context() {
        let config = BuildConfig {
            context_dir: PathBuf::from("/src/app"),
            kilnfile_name: "Kilnfile.dev".to_string(),
            ..Default::default()
        };
        assert_eq!(config.identifier(), "/src/app:Kilnfile.dev");
    }

    #[test]
    fn test_identifier_ignores_empty_id() {
        let config = BuildConfig {
            context_dir: PathBuf::from("/ctx"),
            id: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(config.identifier(), "/ctx:Kilnfile");
    }

    #[test]
    fn test_auth_parse() {
        let auth = AuthConfig::parse("bob:s3:cr3t").unwrap();
        assert_eq!(auth.username, "bob");
        assert_eq!(auth.password, "s3:cr3t");
        assert!(AuthConfig::parse("nopassword").is_none());
        assert!(AuthConfig::parse(":pw").is_none());
    }

    #[test]
    fn test_default_cache_dir() {
        let dir = default_cache_dir();
        assert!(dir.ends_with(".kiln/cache"));
    }
}
