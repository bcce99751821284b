//! Container engine abstraction.
//!
//! The build engine talks to the container daemon only through
//! [`EngineClient`]. [`DockerClient`] implements it over the Docker Engine
//! API; tests use an in-memory engine.

mod docker;

pub use docker::DockerClient;

use async_trait::async_trait;
use kiln_core::error::{short_id, Result};
use kiln_core::state::{ContainerConfig, State};
use tokio::sync::oneshot;

/// Image metadata needed by the build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    /// Size of the image's own layer
    pub size: i64,
    /// Size including all parent layers
    pub virtual_size: i64,
    /// Container configuration baked into the image
    pub config: ContainerConfig,
}

/// Container metadata returned by inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
}

/// Narrow contract of the container engine used by the build.
///
/// Inspect-style calls return `Ok(None)` when the object does not exist;
/// every other failure is an error.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Inspect an image by name or id.
    async fn inspect_image(&self, name: &str) -> Result<Option<ImageInfo>>;

    /// Pull an image from its registry.
    async fn pull_image(&self, name: &str) -> Result<()>;

    /// Remove an image (forced).
    async fn remove_image(&self, id: &str) -> Result<()>;

    /// Tag an image under `name` (`repo[:tag]`).
    async fn tag_image(&self, id: &str, name: &str) -> Result<()>;

    /// Push `name` to its registry, returning the pushed digest.
    async fn push_image(&self, name: &str) -> Result<String>;

    /// Create a container for the state's image, config and host config.
    async fn create_container(&self, state: &State) -> Result<String>;

    /// Create a named container from a standalone config.
    async fn create_named_container(&self, name: &str, config: &ContainerConfig) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Block until the container exits, returning its status code.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    /// Attach to the container's streams.
    ///
    /// `ready` is fired once the connection is established; the future then
    /// keeps relaying output until the container's streams close.
    async fn attach_container(
        &self,
        id: &str,
        stdin: bool,
        ready: oneshot::Sender<()>,
    ) -> Result<()>;

    async fn resize_container_tty(&self, id: &str, width: u16, height: u16) -> Result<()>;

    /// Commit the state's live container into an image.
    async fn commit_container(&self, state: &State, message: &str) -> Result<ImageInfo>;

    /// Remove a container (forced, with its anonymous volumes).
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Extract a tar archive into the container at `path`.
    async fn upload_to_container(&self, id: &str, archive: Vec<u8>, path: &str) -> Result<()>;

    /// Inspect a container by name or id.
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>>;

    /// Make sure an image is present locally, pulling it if needed.
    async fn ensure_image(&self, name: &str) -> Result<()> {
        if self.inspect_image(name).await?.is_some() {
            return Ok(());
        }
        tracing::info!(image = name, "Pulling image");
        self.pull_image(name).await
    }

    /// Find a container by name, or create it from `config`.
    ///
    /// `purpose` is only used for logging.
    async fn ensure_container(
        &self,
        name: &str,
        config: &ContainerConfig,
        purpose: &str,
    ) -> Result<String> {
        if let Some(existing) = self.inspect_container(name).await? {
            tracing::debug!(
                container = short_id(&existing.id),
                name,
                purpose,
                "Reusing container"
            );
            return Ok(existing.id);
        }

        self.ensure_image(&config.image).await?;
        let id = self.create_named_container(name, config).await?;
        tracing::info!(container = short_id(&id), name, purpose, "Created container");
        Ok(id)
    }

    /// Translate a local path into the path the engine host sees.
    fn resolve_host_path(&self, path: &str) -> Result<String> {
        Ok(path.to_string())
    }
}
