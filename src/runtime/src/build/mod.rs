//! Build execution.
//!
//! [`Build::run`] walks a [`Plan`] step by step. Every step receives the
//! current [`State`] and returns the next one; cacheable steps consult
//! [`Build::probe_cache`] before touching the engine. ONBUILD triggers
//! surfaced by a step are compiled into a sub-plan and spliced in right
//! after it.

pub mod artifacts;
pub mod commands;
pub mod context;
pub mod kilnfile;
pub mod plan;

pub use commands::new_command;
pub use kilnfile::{parse_onbuild_commands, Instruction, Kilnfile};
pub use plan::{Command, EnvReplaceable, Plan};

use crate::cache::CacheStore;
use crate::engine::{EngineClient, ImageInfo};
use crate::provision::Provisioner;
use crate::run::{InterruptSource, RunCoordinator};
use kiln_core::config::BuildConfig;
use kiln_core::error::{short_id, KilnError, Result};
use kiln_core::state::{BuildState, Fingerprint, State};
use kiln_core::units::format_size;
use std::sync::Arc;

/// One build run against one engine.
pub struct Build {
    config: BuildConfig,
    client: Arc<dyn EngineClient>,
    cache: Option<Arc<dyn CacheStore>>,
    runner: RunCoordinator,
    provisioner: Provisioner,
    state: State,
    produced_size: i64,
    virtual_size: i64,
    /// Containers that performed EXPORTs in this run, in order
    exports: Vec<String>,
}

impl Build {
    pub fn new(config: BuildConfig, client: Arc<dyn EngineClient>) -> Self {
        let provisioner = Provisioner::new(client.clone(), config.identifier());
        Self {
            runner: RunCoordinator::new(client.clone()),
            provisioner,
            client,
            config,
            cache: None,
            state: State::default(),
            produced_size: 0,
            virtual_size: 0,
            exports: Vec::new(),
        }
    }

    /// Enable the cache. Without a store every step runs.
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_interrupt(mut self, interrupt: InterruptSource) -> Self {
        self.runner = RunCoordinator::new(self.client.clone()).with_interrupt(interrupt);
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn EngineClient> {
        &self.client
    }

    pub fn runner(&self) -> &RunCoordinator {
        &self.runner
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// State after the last executed step.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Last image produced (or pulled) by the build.
    pub fn image_id(&self) -> &str {
        &self.state.build.image_id
    }

    /// Bytes added on top of the base image.
    pub fn produced_size(&self) -> i64 {
        self.produced_size
    }

    pub fn virtual_size(&self) -> i64 {
        self.virtual_size
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    /// Run every step of `plan`, starting from `initial`.
    ///
    /// The first failing step ends the run; images committed by earlier
    /// steps stay on the engine and in the cache.
    pub async fn run(&mut self, mut plan: Plan, initial: State) -> Result<State> {
        self.state = initial;

        // The plan grows while it runs, so walk it by index
        let mut index = 0;
        while index < plan.len() {
            let Some(command) = plan.get_mut(index) else {
                break;
            };

            if !command.should_run(self, &self.state)? {
                tracing::debug!(step = index + 1, "Skip {}", command);
                index += 1;
                continue;
            }

            if let Some(replaceable) = command.as_env_replaceable() {
                replaceable.replace_env(&self.state.build.config.env_map());
            }

            tracing::info!("Step {} : {}", index + 1, command);

            let current = self.state.clone();
            let mut next = command.execute(self, current).await?;

            if !next.inject_commands.is_empty() {
                let instructions = parse_onbuild_commands(&next.inject_commands)?;
                tracing::debug!(count = instructions.len(), "Injecting ONBUILD triggers");
                plan.splice_after(index, Plan::new(instructions, false));
                next.inject_commands.clear();
            }

            self.state = next;
            index += 1;
        }

        Ok(self.state.clone())
    }

    /// Look for a reusable result of `state`.
    ///
    /// Returns the cached state and `true` on a hit. On a miss the returned
    /// state is marked cache-busted, so no later step of this lineage probes
    /// again.
    pub async fn probe_cache(&mut self, mut state: State) -> Result<(State, bool)> {
        let cache = match &self.cache {
            Some(cache) if !state.no_cache.cache_busted => cache.clone(),
            _ => return Ok((state, false)),
        };

        let key = state.fingerprint()?;
        let Some(cached) = cache.get(&key)? else {
            state.no_cache.cache_busted = true;
            tracing::info!("| Not cached");
            return Ok((state, false));
        };

        if self.config.reload_cache {
            cache.del(&key)?;
            state.no_cache.cache_busted = true;
            tracing::info!("| Reload cache");
            return Ok((state, false));
        }

        let Some(image) = self.inspect_cached_image(&cached).await? else {
            tracing::debug!(key = %key, "Cached image is gone, dropping entry");
            cache.del(&key)?;
            state.no_cache.cache_busted = true;
            tracing::info!("| Not cached");
            return Ok((state, false));
        };

        tracing::info!(
            size = %format!("{} (+{})", format_size(image.virtual_size), format_size(image.size)),
            "| Cached! Take image {}",
            short_id(&cached.image_id)
        );

        self.produced_size += image.size;
        self.virtual_size = image.virtual_size;

        let mut hit = state.with_cached(cached);
        hit.clean_commits();
        Ok((hit, true))
    }

    async fn inspect_cached_image(&self, cached: &BuildState) -> Result<Option<ImageInfo>> {
        if cached.image_id.is_empty() {
            return Ok(None);
        }
        self.client.inspect_image(&cached.image_id).await
    }

    /// Record the result of a commit under the fingerprint it was built from.
    pub(crate) fn store_cache(&self, key: &Fingerprint, state: &BuildState) -> Result<()> {
        match &self.cache {
            Some(cache) => cache.put(key, state),
            None => Ok(()),
        }
    }

    /// Resolve a FROM image, pulling it when it is missing or `--pull` is set.
    pub(crate) async fn lookup_image(&self, name: &str) -> Result<ImageInfo> {
        if !self.config.pull {
            if let Some(image) = self.client.inspect_image(name).await? {
                return Ok(image);
            }
        }

        tracing::info!("| Pull image {}", name);
        self.client.pull_image(name).await?;

        self.client
            .inspect_image(name)
            .await?
            .ok_or_else(|| KilnError::BuildError(format!("FROM: image {} not found", name)))
    }

    /// A FROM starts size accounting over from the base image.
    pub(crate) fn reset_sizes(&mut self, virtual_size: i64) {
        self.produced_size = 0;
        self.virtual_size = virtual_size;
    }

    pub(crate) fn add_produced_image(&mut self, image: &ImageInfo) {
        self.produced_size += image.size;
        self.virtual_size = image.virtual_size;
    }

    /// Remember an exporter container, keeping the list free of duplicates.
    pub(crate) fn record_export(&mut self, id: &str) {
        if !id.is_empty() && !self.exports.iter().any(|e| e == id) {
            self.exports.push(id.to_string());
        }
    }
}
