//! In-memory engine and cache used by unit tests.

use crate::cache::CacheStore;
use crate::engine::{ContainerInfo, EngineClient, ImageInfo};
use async_trait::async_trait;
use kiln_core::error::{KilnError, Result};
use kiln_core::state::{BuildState, ContainerConfig, Fingerprint, HostConfig, State};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Everything the engine was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Pull(String),
    RemoveImage(String),
    Tag { id: String, name: String },
    Push(String),
    Create { id: String, image: String, cmd: Vec<String> },
    CreateNamed { id: String, name: String },
    Start(String),
    AttachReady { id: String, stdin: bool },
    Resize(String),
    Commit { container: String, image: String, message: String },
    RemoveContainer(String),
    Upload { id: String, path: String },
}

/// How attach behaves.
#[derive(Debug, Clone, Default)]
pub enum AttachMode {
    /// Connect immediately, stream until the container exits
    #[default]
    Ok,
    /// Wait before reporting readiness
    SlowReady(Duration),
    /// Fail without ever becoming ready
    FailBeforeReady(String),
    /// Become ready, then fail once the container has exited
    FailAfterExit(String),
    /// Become ready, then fail as soon as the signal is raised
    FailOnSignal(watch::Receiver<bool>, String),
}

#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub id: String,
    pub name: Option<String>,
    pub image: String,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub uploads: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
struct Inner {
    images: HashMap<String, ImageInfo>,
    names: HashMap<String, String>,
    containers: HashMap<String, MemoryContainer>,
    events: Vec<EngineEvent>,
    next_id: u64,
    exit_code: i64,
    block_wait: bool,
    attach_mode: AttachMode,
    pull_fails: bool,
}

/// Engine double that keeps images and containers in memory.
pub struct MemoryEngine {
    inner: Mutex<Inner>,
    exited: tokio::sync::watch::Sender<bool>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        let (exited, _) = tokio::sync::watch::channel(false);
        Self {
            inner: Mutex::new(Inner::default()),
            exited,
        }
    }

    /// Register an image under `name`, returning its id.
    pub fn add_image(&self, name: &str, config: ContainerConfig) -> String {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = format!("sha256:base{:04}", inner.next_id);
        inner.images.insert(
            id.clone(),
            ImageInfo {
                id: id.clone(),
                size: 1000,
                virtual_size: 1000,
                config,
            },
        );
        inner.names.insert(name.to_string(), id.clone());
        id
    }

    /// Forget an image, as if it was garbage collected.
    pub fn drop_image(&self, id: &str) {
        let mut inner = self.inner.lock();
        inner.images.remove(id);
        inner.names.retain(|_, v| v != id);
    }

    pub fn has_image(&self, id: &str) -> bool {
        self.inner.lock().images.contains_key(id)
    }

    pub fn set_exit_code(&self, code: i64) {
        self.inner.lock().exit_code = code;
    }

    /// Make `wait_container` block forever.
    pub fn block_wait(&self) {
        self.inner.lock().block_wait = true;
    }

    pub fn set_attach_mode(&self, mode: AttachMode) {
        self.inner.lock().attach_mode = mode;
    }

    pub fn fail_pulls(&self) {
        self.inner.lock().pull_fails = true;
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.inner.lock().events.clone()
    }

    pub fn count(&self, pred: impl Fn(&EngineEvent) -> bool) -> usize {
        self.inner.lock().events.iter().filter(|e| pred(e)).count()
    }

    pub fn container(&self, id: &str) -> Option<MemoryContainer> {
        self.inner.lock().containers.get(id).cloned()
    }

    pub fn live_containers(&self) -> usize {
        self.inner.lock().containers.len()
    }

    fn record(&self, event: EngineEvent) {
        self.inner.lock().events.push(event);
    }

    fn resolve_image(inner: &Inner, name: &str) -> Option<ImageInfo> {
        let id = inner.names.get(name).map(String::as_str).unwrap_or(name);
        inner.images.get(id).cloned()
    }

    fn new_container(
        &self,
        name: Option<&str>,
        image: &str,
        config: &ContainerConfig,
        host_config: HostConfig,
    ) -> String {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = format!("container{:04}", inner.next_id);
        inner.containers.insert(
            id.clone(),
            MemoryContainer {
                id: id.clone(),
                name: name.map(str::to_string),
                image: image.to_string(),
                config: config.clone(),
                host_config,
                uploads: Vec::new(),
            },
        );
        id
    }
}

#[async_trait]
impl EngineClient for MemoryEngine {
    async fn inspect_image(&self, name: &str) -> Result<Option<ImageInfo>> {
        Ok(Self::resolve_image(&self.inner.lock(), name))
    }

    async fn pull_image(&self, name: &str) -> Result<()> {
        self.record(EngineEvent::Pull(name.to_string()));
        if self.inner.lock().pull_fails {
            return Err(KilnError::EngineError(format!("pull of {} refused", name)));
        }
        if self.inner.lock().names.contains_key(name) {
            return Ok(());
        }
        self.add_image(name, ContainerConfig::default());
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        self.record(EngineEvent::RemoveImage(id.to_string()));
        self.drop_image(id);
        Ok(())
    }

    async fn tag_image(&self, id: &str, name: &str) -> Result<()> {
        self.record(EngineEvent::Tag {
            id: id.to_string(),
            name: name.to_string(),
        });
        self.inner.lock().names.insert(name.to_string(), id.to_string());
        Ok(())
    }

    async fn push_image(&self, name: &str) -> Result<String> {
        self.record(EngineEvent::Push(name.to_string()));
        Ok("sha256:feedface".to_string())
    }

    async fn create_container(&self, state: &State) -> Result<String> {
        let id = self.new_container(
            None,
            &state.build.image_id,
            &state.build.config,
            state.no_cache.host_config.clone(),
        );
        self.record(EngineEvent::Create {
            id: id.clone(),
            image: state.build.image_id.clone(),
            cmd: state.build.config.cmd.clone(),
        });
        Ok(id)
    }

    async fn create_named_container(&self, name: &str, config: &ContainerConfig) -> Result<String> {
        let id = self.new_container(Some(name), &config.image, config, HostConfig::default());
        self.record(EngineEvent::CreateNamed {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(EngineEvent::Start(id.to_string()));
        Ok(())
    }

    async fn wait_container(&self, _id: &str) -> Result<i64> {
        let (block, code) = {
            let inner = self.inner.lock();
            (inner.block_wait, inner.exit_code)
        };
        if block {
            std::future::pending::<()>().await;
        }
        self.exited.send_replace(true);
        Ok(code)
    }

    async fn attach_container(
        &self,
        id: &str,
        stdin: bool,
        ready: oneshot::Sender<()>,
    ) -> Result<()> {
        let mode = self.inner.lock().attach_mode.clone();
        match mode {
            AttachMode::FailBeforeReady(msg) => Err(KilnError::AttachError(msg)),
            AttachMode::FailOnSignal(mut signal, msg) => {
                self.record(EngineEvent::AttachReady {
                    id: id.to_string(),
                    stdin,
                });
                let _ = ready.send(());
                let _ = signal.wait_for(|raised| *raised).await;
                Err(KilnError::AttachError(msg))
            }
            AttachMode::Ok | AttachMode::SlowReady(_) | AttachMode::FailAfterExit(_) => {
                if let AttachMode::SlowReady(delay) = &mode {
                    tokio::time::sleep(*delay).await;
                }
                let mut exited = self.exited.subscribe();
                self.record(EngineEvent::AttachReady {
                    id: id.to_string(),
                    stdin,
                });
                let _ = ready.send(());

                let _ = exited.wait_for(|done| *done).await;
                match mode {
                    AttachMode::FailAfterExit(msg) => {
                        // Trailing stdin traffic surfaces shortly after the exit
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(KilnError::AttachError(msg))
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    async fn resize_container_tty(&self, id: &str, _width: u16, _height: u16) -> Result<()> {
        self.record(EngineEvent::Resize(id.to_string()));
        Ok(())
    }

    async fn commit_container(&self, state: &State, message: &str) -> Result<ImageInfo> {
        let container = state
            .no_cache
            .container_id
            .clone()
            .ok_or_else(|| KilnError::BuildError("no container to commit".to_string()))?;

        let mut inner = self.inner.lock();
        if !inner.containers.contains_key(&container) {
            return Err(KilnError::EngineError(format!("no such container {}", container)));
        }
        let parent_size = inner
            .images
            .get(&state.build.image_id)
            .map(|i| i.virtual_size)
            .unwrap_or(0);
        inner.next_id += 1;
        let image = ImageInfo {
            id: format!("sha256:img{:04}", inner.next_id),
            size: 100,
            virtual_size: parent_size + 100,
            config: state.build.config.clone(),
        };
        inner.images.insert(image.id.clone(), image.clone());
        inner.events.push(EngineEvent::Commit {
            container,
            image: image.id.clone(),
            message: message.to_string(),
        });
        Ok(image)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.record(EngineEvent::RemoveContainer(id.to_string()));
        self.inner.lock().containers.remove(id);
        Ok(())
    }

    async fn upload_to_container(&self, id: &str, archive: Vec<u8>, path: &str) -> Result<()> {
        self.record(EngineEvent::Upload {
            id: id.to_string(),
            path: path.to_string(),
        });
        let mut inner = self.inner.lock();
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| KilnError::EngineError(format!("no such container {}", id)))?;
        container.uploads.push((path.to_string(), archive));
        Ok(())
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let inner = self.inner.lock();
        let found = inner
            .containers
            .values()
            .find(|c| c.id == name || c.name.as_deref() == Some(name));
        Ok(found.map(|c| ContainerInfo { id: c.id.clone() }))
    }
}

/// Cache store that counts how often it is consulted.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<Fingerprint, BuildState>>,
    calls: Mutex<Vec<&'static str>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_of(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == op).count()
    }

    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &Fingerprint) -> Result<Option<BuildState>> {
        self.calls.lock().push("get");
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &Fingerprint, state: &BuildState) -> Result<()> {
        self.calls.lock().push("put");
        self.entries.lock().insert(key.clone(), state.clone());
        Ok(())
    }

    fn del(&self, key: &Fingerprint) -> Result<()> {
        self.calls.lock().push("del");
        self.entries.lock().remove(key);
        Ok(())
    }
}
