//! Docker Engine API client.

use super::{ContainerInfo, EngineClient, ImageInfo};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, InspectContainerOptions, LogOutput,
    RemoveContainerOptions, ResizeContainerTtyOptions, StartContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{
    CommitContainerOptions, CreateImageOptions, ListImagesOptions, PushImageOptions,
    RemoveImageOptions, TagImageOptions,
};
use bollard::models::{Commit, HostConfig as DockerHostConfig, ImageSummary};
use bollard::Docker;
use futures::StreamExt;
use kiln_core::config::AuthConfig;
use kiln_core::error::{short_id, KilnError, Result};
use kiln_core::imagename::ImageName;
use kiln_core::state::{ContainerConfig, State};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

/// [`EngineClient`] backed by a Docker daemon.
pub struct DockerClient {
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

impl DockerClient {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect(auth: Option<&AuthConfig>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(engine_err)?;
        Ok(Self::with_docker(docker, auth))
    }

    pub fn with_docker(docker: Docker, auth: Option<&AuthConfig>) -> Self {
        let credentials = auth.map(|a| DockerCredentials {
            username: Some(a.username.clone()),
            password: Some(a.password.clone()),
            ..Default::default()
        });
        Self {
            docker,
            credentials,
        }
    }

    /// Look up the image committed from `container` by its commit label.
    async fn find_committed_image(&self, container: &str) -> Result<String> {
        let options = ListImagesOptions {
            all: true,
            filters: commit_filter(container),
            ..Default::default()
        };
        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(engine_err)?;
        pick_committed(&images, container).ok_or_else(|| {
            KilnError::EngineError(format!(
                "commit of container {} returned no image id",
                short_id(container)
            ))
        })
    }

    /// Check that the daemon answers before any build step runs.
    pub async fn ping(&self) -> Result<()> {
        match tokio::time::timeout(PING_TIMEOUT, self.docker.ping()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(KilnError::EngineError(format!(
                "Docker daemon is not reachable: {}",
                e
            ))),
            Err(_) => Err(KilnError::EngineError(format!(
                "Docker daemon did not answer within {}s",
                PING_TIMEOUT.as_secs()
            ))),
        }
    }

    /// Daemon version, for `kiln info`.
    pub async fn server_version(&self) -> Result<String> {
        let version = self.docker.version().await.map_err(engine_err)?;
        Ok(version.version.unwrap_or_default())
    }
}

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Label naming the container an image was committed from.
///
/// bollard decodes the `/commit` response into a type keyed on `ID` while the
/// daemon answers with `Id`, so the new image is found through this label.
const COMMIT_LABEL: &str = "kiln.commit.container";

fn committed_image_id(response: &Commit) -> Option<String> {
    response.id.clone().filter(|id| !id.is_empty())
}

fn commit_filter(container: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([(
        "label".to_string(),
        vec![format!("{}={}", COMMIT_LABEL, container)],
    )])
}

fn pick_committed(images: &[ImageSummary], container: &str) -> Option<String> {
    images
        .iter()
        .filter(|image| image.labels.get(COMMIT_LABEL).map(String::as_str) == Some(container))
        .max_by_key(|image| image.created)
        .map(|image| image.id.clone())
}

fn engine_err(err: DockerError) -> KilnError {
    KilnError::EngineError(err.to_string())
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn to_set(items: impl IntoIterator<Item = String>) -> Option<HashMap<String, HashMap<(), ()>>> {
    let map: HashMap<_, _> = items.into_iter().map(|k| (k, HashMap::new())).collect();
    (!map.is_empty()).then_some(map)
}

fn non_empty(v: &[String]) -> Option<Vec<String>> {
    (!v.is_empty()).then(|| v.to_vec())
}

fn non_empty_str(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Translate the build's container config into the API representation.
///
/// An empty entrypoint is sent as `[""]` so the image's entrypoint is
/// reset rather than inherited.
fn to_docker_config(
    config: &ContainerConfig,
    image: &str,
    host_config: Option<DockerHostConfig>,
) -> Config<String> {
    let entrypoint = if config.entrypoint.is_empty() {
        Some(vec![String::new()])
    } else {
        Some(config.entrypoint.clone())
    };

    Config {
        image: non_empty_str(image),
        user: non_empty_str(&config.user),
        env: non_empty(&config.env),
        cmd: non_empty(&config.cmd),
        entrypoint,
        working_dir: non_empty_str(&config.working_dir),
        labels: (!config.labels.is_empty())
            .then(|| config.labels.clone().into_iter().collect()),
        volumes: to_set(config.volumes.iter().cloned()),
        exposed_ports: to_set(config.exposed_ports.iter().cloned()),
        on_build: non_empty(&config.on_build),
        tty: Some(config.tty),
        open_stdin: Some(config.open_stdin),
        stdin_once: Some(config.stdin_once),
        attach_stdin: Some(config.attach_stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config,
        ..Default::default()
    }
}

fn from_docker_config(config: bollard::models::ContainerConfig) -> ContainerConfig {
    ContainerConfig {
        image: config.image.unwrap_or_default(),
        user: config.user.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        cmd: config.cmd.unwrap_or_default(),
        entrypoint: config
            .entrypoint
            .unwrap_or_default()
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect(),
        working_dir: config.working_dir.unwrap_or_default(),
        labels: config
            .labels
            .unwrap_or_default()
            .into_iter()
            .filter(|(key, _)| key != COMMIT_LABEL)
            .collect(),
        volumes: config.volumes.unwrap_or_default().into_keys().collect(),
        exposed_ports: config.exposed_ports.unwrap_or_default().into_keys().collect(),
        on_build: config.on_build.unwrap_or_default(),
        ..Default::default()
    }
}

#[async_trait]
impl EngineClient for DockerClient {
    async fn inspect_image(&self, name: &str) -> Result<Option<ImageInfo>> {
        match self.docker.inspect_image(name).await {
            Ok(image) => Ok(Some(ImageInfo {
                id: image.id.unwrap_or_default(),
                size: image.size.unwrap_or_default(),
                virtual_size: image.virtual_size.unwrap_or_default(),
                config: image.config.map(from_docker_config).unwrap_or_default(),
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(engine_err(e)),
        }
    }

    async fn pull_image(&self, name: &str) -> Result<()> {
        let image = ImageName::parse(name)?;
        let options = CreateImageOptions {
            from_image: image.repository(),
            tag: image
                .digest
                .clone()
                .unwrap_or_else(|| image.tag_or_latest().to_string()),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .create_image(Some(options), None, self.credentials.clone());
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(engine_err)?;
            if let Some(error) = info.error {
                return Err(KilnError::EngineError(format!(
                    "failed to pull {}: {}",
                    name, error
                )));
            }
            if let Some(status) = info.status {
                tracing::debug!(image = name, id = info.id.as_deref(), "{}", status);
            }
        }
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            noprune: false,
        };
        self.docker
            .remove_image(id, Some(options), None)
            .await
            .map_err(engine_err)?;
        tracing::info!(image = short_id(id), "Removed image");
        Ok(())
    }

    async fn tag_image(&self, id: &str, name: &str) -> Result<()> {
        let image = ImageName::parse(name)?;
        let options = TagImageOptions {
            repo: image.repository(),
            tag: image.tag_or_latest().to_string(),
        };
        self.docker
            .tag_image(id, Some(options))
            .await
            .map_err(engine_err)?;
        tracing::info!(image = short_id(id), "| Tag {}", image);
        Ok(())
    }

    async fn push_image(&self, name: &str) -> Result<String> {
        let image = ImageName::parse(name)?;
        let options = PushImageOptions {
            tag: image.tag_or_latest().to_string(),
        };

        let mut digest = String::new();
        let mut stream =
            self.docker
                .push_image(&image.repository(), Some(options), self.credentials.clone());
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(engine_err)?;
            if let Some(error) = info.error {
                return Err(KilnError::EngineError(format!(
                    "failed to push {}: {}",
                    name, error
                )));
            }
            if let Some(status) = info.status {
                if let Some(found) = extract_digest(&status) {
                    digest = found;
                }
                tracing::debug!(image = name, "{}", status);
            }
        }
        Ok(digest)
    }

    async fn create_container(&self, state: &State) -> Result<String> {
        let host_config = DockerHostConfig {
            binds: non_empty(&state.no_cache.host_config.binds),
            volumes_from: non_empty(&state.no_cache.host_config.volumes_from),
            ..Default::default()
        };
        let config = to_docker_config(
            &state.build.config,
            &state.build.image_id,
            Some(host_config),
        );
        tracing::debug!(config = ?config, "Create container");

        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(engine_err)?;

        if state.build.image_id.is_empty() {
            tracing::info!("| Created container {} (from scratch)", short_id(&response.id));
        } else {
            tracing::info!(
                "| Created container {} (image {})",
                short_id(&response.id),
                short_id(&state.build.image_id)
            );
        }
        Ok(response.id)
    }

    async fn create_named_container(&self, name: &str, config: &ContainerConfig) -> Result<String> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let config = to_docker_config(config, &config.image, None);
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(engine_err)?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(engine_err)
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        let mut status = 0;
        while let Some(result) = stream.next().await {
            match result {
                Ok(response) => status = response.status_code,
                // Non-zero exit codes are reported as an error by the client
                Err(DockerError::DockerContainerWaitError { code, .. }) => return Ok(code),
                Err(e) => return Err(engine_err(e)),
            }
        }
        Ok(status)
    }

    async fn attach_container(
        &self,
        id: &str,
        stdin: bool,
        ready: oneshot::Sender<()>,
    ) -> Result<()> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(stdin),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let mut attached = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(|e| KilnError::AttachError(e.to_string()))?;

        // Receiver gone means the coordinator already gave up on this run
        let _ = ready.send(());

        if stdin {
            let mut input = attached.input;
            tokio::spawn(async move {
                let mut local = tokio::io::stdin();
                let _ = tokio::io::copy(&mut local, &mut input).await;
            });

            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = attached.output.next().await {
                let chunk = chunk.map_err(|e| KilnError::AttachError(e.to_string()))?;
                stdout.write_all(&chunk.into_bytes()).await?;
                stdout.flush().await?;
            }
            return Ok(());
        }

        let container = short_id(id).to_string();
        while let Some(chunk) = attached.output.next().await {
            let chunk = chunk.map_err(|e| KilnError::AttachError(e.to_string()))?;
            let is_err = matches!(chunk, LogOutput::StdErr { .. });
            let bytes = chunk.into_bytes();
            for line in String::from_utf8_lossy(&bytes).lines() {
                if is_err {
                    tracing::warn!(container = %container, "{}", line);
                } else {
                    tracing::info!(container = %container, "{}", line);
                }
            }
        }
        Ok(())
    }

    async fn resize_container_tty(&self, id: &str, width: u16, height: u16) -> Result<()> {
        self.docker
            .resize_container_tty(id, ResizeContainerTtyOptions { width, height })
            .await
            .map_err(engine_err)
    }

    async fn commit_container(&self, state: &State, message: &str) -> Result<ImageInfo> {
        let container = state.no_cache.container_id.as_deref().ok_or_else(|| {
            KilnError::BuildError("commit requires a live container".to_string())
        })?;

        let options = CommitContainerOptions {
            container: container.to_string(),
            comment: message.to_string(),
            pause: true,
            ..Default::default()
        };
        let mut config = to_docker_config(&state.build.config, &state.build.image_id, None);
        config
            .labels
            .get_or_insert_with(HashMap::new)
            .insert(COMMIT_LABEL.to_string(), container.to_string());

        let response = self
            .docker
            .commit_container(options, config)
            .await
            .map_err(engine_err)?;

        let image_id = match committed_image_id(&response) {
            Some(id) => id,
            None => self.find_committed_image(container).await?,
        };

        let image = self.inspect_image(&image_id).await?.ok_or_else(|| {
            KilnError::EngineError(format!(
                "committed image {} disappeared",
                short_id(&image_id)
            ))
        })?;
        tracing::info!(
            "| Result image is {} (size: {})",
            short_id(&image.id),
            kiln_core::units::format_size(image.size)
        );
        Ok(image)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => {
                tracing::info!("| Removed container {}", short_id(id));
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(engine_err(e)),
        }
    }

    async fn upload_to_container(&self, id: &str, archive: Vec<u8>, path: &str) -> Result<()> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), archive.into())
            .await
            .map_err(engine_err)
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(container) => Ok(Some(ContainerInfo {
                id: container.id.unwrap_or_default(),
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(engine_err(e)),
        }
    }
}

/// Find `digest: sha256:<hex>` in a push status line.
fn extract_digest(status: &str) -> Option<String> {
    let rest = &status[status.find("digest:")? + "digest:".len()..];
    let rest = rest.trim_start();
    let hex: String = rest
        .strip_prefix("sha256:")?
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    (!hex.is_empty()).then(|| format!("sha256:{}", hex))
}
