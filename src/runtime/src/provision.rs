//! Auxiliary containers for MOUNT and EXPORT/IMPORT.
//!
//! Volume and exports containers are found by a deterministic name derived
//! from the build identifier, so every step and every later run of the same
//! build resolves to the same container.

use crate::engine::EngineClient;
use kiln_core::config::{EXPORTS_PATH, MOUNT_VOLUME_IMAGE, RSYNC_BIN_PATH, RSYNC_IMAGE};
use kiln_core::error::Result;
use kiln_core::state::ContainerConfig;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Hex characters of the key hash kept in container names.
const NAME_HASH_LEN: usize = 12;

/// Provisions volume and exports containers for one build.
pub struct Provisioner {
    client: Arc<dyn EngineClient>,
    identifier: String,
}

impl Provisioner {
    pub fn new(client: Arc<dyn EngineClient>, identifier: impl Into<String>) -> Self {
        Self {
            client,
            identifier: identifier.into(),
        }
    }

    /// Name of the volume container holding `path`.
    pub fn volume_container_name(&self, path: &str) -> String {
        format!(
            "kiln_mount_{}",
            name_hash(&format!("{}:{}", self.identifier, path))
        )
    }

    /// Name of this build's exports container.
    pub fn export_container_name(&self) -> String {
        format!("kiln_exports_{}", name_hash(&self.identifier))
    }

    /// Find or create the volume container for a MOUNT path.
    pub async fn ensure_volume_container(&self, path: &str) -> Result<String> {
        let mut config = ContainerConfig {
            image: MOUNT_VOLUME_IMAGE.to_string(),
            ..Default::default()
        };
        config.volumes.insert(path.to_string());

        let name = self.volume_container_name(path);
        self.client.ensure_container(&name, &config, path).await
    }

    /// Find or create the container that stages EXPORT output.
    pub async fn ensure_export_container(&self) -> Result<String> {
        let mut config = ContainerConfig {
            image: RSYNC_IMAGE.to_string(),
            ..Default::default()
        };
        config.volumes.insert(RSYNC_BIN_PATH.to_string());
        config.volumes.insert(EXPORTS_PATH.to_string());

        let name = self.export_container_name();
        self.client.ensure_container(&name, &config, "exports").await
    }
}

fn name_hash(key: &str) -> String {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    digest[..NAME_HASH_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EngineEvent, MemoryEngine};

    fn provisioner(engine: &Arc<MemoryEngine>, id: &str) -> Provisioner {
        Provisioner::new(engine.clone(), id)
    }

    #[test]
    fn test_names_are_deterministic() {
        let engine = Arc::new(MemoryEngine::new());
        let a = provisioner(&engine, "/ctx:Kilnfile");
        let b = provisioner(&engine, "/ctx:Kilnfile");
        assert_eq!(a.volume_container_name("/cache"), b.volume_container_name("/cache"));
        assert_eq!(a.export_container_name(), b.export_container_name());
        assert!(a.volume_container_name("/cache").starts_with("kiln_mount_"));
        assert_eq!(a.export_container_name().len(), "kiln_exports_".len() + 12);
    }

    #[test]
    fn test_names_differ_by_key() {
        let engine = Arc::new(MemoryEngine::new());
        let a = provisioner(&engine, "build-a");
        let b = provisioner(&engine, "build-b");
        assert_ne!(a.volume_container_name("/cache"), a.volume_container_name("/data"));
        assert_ne!(a.volume_container_name("/cache"), b.volume_container_name("/cache"));
        assert_ne!(a.export_container_name(), b.export_container_name());
    }

    #[tokio::test]
    async fn test_ensure_volume_container_is_idempotent() {
        let engine = Arc::new(MemoryEngine::new());
        engine.add_image(MOUNT_VOLUME_IMAGE, ContainerConfig::default());
        let p = provisioner(&engine, "build");

        let first = p.ensure_volume_container("/var/cache/apt").await.unwrap();
        let second = p.ensure_volume_container("/var/cache/apt").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.count(|e| matches!(e, EngineEvent::CreateNamed { .. })), 1);
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent_across_runs() {
        let engine = Arc::new(MemoryEngine::new());
        engine.add_image(RSYNC_IMAGE, ContainerConfig::default());

        let first = provisioner(&engine, "build")
            .ensure_export_container()
            .await
            .unwrap();
        let second = provisioner(&engine, "build")
            .ensure_export_container()
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.count(|e| matches!(e, EngineEvent::CreateNamed { .. })), 1);
    }

    #[tokio::test]
    async fn test_ensure_pulls_missing_image() {
        let engine = Arc::new(MemoryEngine::new());
        let p = provisioner(&engine, "build");

        let id = p.ensure_export_container().await.unwrap();
        assert!(engine.count(|e| matches!(e, EngineEvent::Pull(name) if name == RSYNC_IMAGE)) == 1);

        let container = engine.container(&id).unwrap();
        assert!(container.config.volumes.contains(EXPORTS_PATH));
        assert!(container.config.volumes.contains(RSYNC_BIN_PATH));
    }
}
