//! Plan steps.
//!
//! One type per instruction plus the implicit [`CommitCommand`] and
//! [`CleanupCommand`] inserted by the plan compiler. Config-only steps just
//! edit the container config and record a commit message; steps that touch
//! the filesystem create a container and leave it in the state for the
//! following COMMIT.

use super::artifacts::Artifact;
use super::context::{self, resolve_path, IgnoreMatcher};
use super::kilnfile::{display_command, Instruction};
use super::plan::{expand_env, Command, EnvReplaceable};
use super::Build;
use async_trait::async_trait;
use kiln_core::config::{EXPORTS_PATH, NO_BASE_IMAGE, RSYNC_BIN_PATH};
use kiln_core::error::{short_id, KilnError, Result};
use kiln_core::imagename::ImageName;
use kiln_core::state::State;
use kiln_core::units::format_size;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Build the step for a parsed instruction.
pub fn new_command(instruction: Instruction) -> Box<dyn Command> {
    match instruction {
        Instruction::From { image } => Box::new(FromCommand { image }),
        Instruction::Maintainer { name } => Box::new(MaintainerCommand { name }),
        Instruction::Run { cmd } => Box::new(RunCommand { cmd }),
        Instruction::Attach { cmd } => Box::new(AttachCommand { cmd }),
        Instruction::Env { pairs } => Box::new(EnvCommand { pairs }),
        Instruction::Label { pairs } => Box::new(LabelCommand { pairs }),
        Instruction::Workdir { path } => Box::new(WorkdirCommand { path }),
        Instruction::User { user } => Box::new(UserCommand { user }),
        Instruction::Expose { ports } => Box::new(ExposeCommand { ports }),
        Instruction::Volume { paths } => Box::new(VolumeCommand { paths }),
        Instruction::Cmd { cmd } => Box::new(CmdCommand { cmd }),
        Instruction::Entrypoint { cmd } => Box::new(EntrypointCommand { cmd }),
        Instruction::Onbuild { trigger } => Box::new(OnbuildCommand { trigger }),
        Instruction::Copy { src, dest } => Box::new(CopyCommand {
            keyword: "COPY",
            src,
            dest,
        }),
        Instruction::Add { src, dest } => Box::new(CopyCommand {
            keyword: "ADD",
            src,
            dest,
        }),
        Instruction::Mount { specs } => Box::new(MountCommand { specs }),
        Instruction::Export { src, dest } => Box::new(ExportCommand { src, dest }),
        Instruction::Import { src, dest } => Box::new(ImportCommand { src, dest }),
        Instruction::Tag { name } => Box::new(TagCommand { name }),
        Instruction::Push { name } => Box::new(PushCommand { name }),
    }
}

fn require_image(state: &State, what: &str) -> Result<()> {
    if state.has_image() {
        Ok(())
    } else {
        Err(KilnError::BuildError(format!(
            "Please provide a source image with `FROM` prior to {}",
            what
        )))
    }
}

fn replace_all(values: &mut [String], env: &BTreeMap<String, String>) {
    for value in values.iter_mut() {
        *value = expand_env(value, env);
    }
}

fn join_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// FROM / MAINTAINER
// ---------------------------------------------------------------------------

pub struct FromCommand {
    image: String,
}

impl fmt::Display for FromCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FROM {}", self.image)
    }
}

#[async_trait]
impl Command for FromCommand {
    async fn execute(&self, build: &mut Build, mut state: State) -> Result<State> {
        if self.image == NO_BASE_IMAGE {
            state.build.no_base_image = true;
            return Ok(state);
        }

        let image = build.lookup_image(&self.image).await?;
        tracing::info!(
            size = %format_size(image.virtual_size),
            "| Image {}",
            short_id(&image.id)
        );

        state.build.image_id = image.id.clone();
        state.build.config = image.config;
        build.reset_sizes(image.virtual_size);

        if state.build.config.on_build.is_empty() {
            return Ok(state);
        }

        tracing::info!("| Found {} ONBUILD triggers", state.build.config.on_build.len());
        // Triggers run as part of this build and must not end up in the result
        state.inject_commands = std::mem::take(&mut state.build.config.on_build);
        Ok(state)
    }
}

pub struct MaintainerCommand {
    name: String,
}

impl fmt::Display for MaintainerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MAINTAINER {}", self.name)
    }
}

#[async_trait]
impl Command for MaintainerCommand {
    fn should_run(&self, _build: &Build, _state: &State) -> Result<bool> {
        Ok(false)
    }

    async fn execute(&self, _build: &mut Build, state: State) -> Result<State> {
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// RUN / ATTACH
// ---------------------------------------------------------------------------

pub struct RunCommand {
    cmd: Vec<String>,
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RUN {}", display_command(&self.cmd))
    }
}

#[async_trait]
impl Command for RunCommand {
    async fn execute(&self, build: &mut Build, mut state: State) -> Result<State> {
        require_image(&state, "RUN")?;

        state.commit(format!("RUN {:?}", self.cmd));
        let (mut state, hit) = build.probe_cache(state).await?;
        if hit {
            return Ok(state);
        }

        let orig_cmd = std::mem::replace(&mut state.build.config.cmd, self.cmd.clone());
        let orig_entrypoint = std::mem::take(&mut state.build.config.entrypoint);

        let client = build.client().clone();
        let id = client.create_container(&state).await?;
        state.no_cache.container_id = Some(id.clone());

        if let Err(e) = build.runner().run_container(&id, false).await {
            if !matches!(e, KilnError::Interrupted) {
                if let Err(remove_err) = client.remove_container(&id).await {
                    tracing::warn!(container = short_id(&id), error = %remove_err, "Failed to remove container");
                }
            }
            return Err(e);
        }

        // The command only applies to this container, not to the image
        state.build.config.cmd = orig_cmd;
        state.build.config.entrypoint = orig_entrypoint;
        Ok(state)
    }
}

pub struct AttachCommand {
    cmd: Vec<String>,
}

impl fmt::Display for AttachCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cmd.is_empty() {
            write!(f, "ATTACH")
        } else {
            write!(f, "ATTACH {}", display_command(&self.cmd))
        }
    }
}

#[async_trait]
impl Command for AttachCommand {
    fn should_run(&self, build: &Build, _state: &State) -> Result<bool> {
        if !build.config().attach {
            tracing::info!("Skip ATTACH; use --attach option to get inside");
        }
        Ok(build.config().attach)
    }

    async fn execute(&self, build: &mut Build, state: State) -> Result<State> {
        require_image(&state, "ATTACH")?;

        let mut interactive = state.clone();
        let config = &mut interactive.build.config;
        config.cmd = if !self.cmd.is_empty() {
            self.cmd.clone()
        } else if !config.cmd.is_empty() {
            config.cmd.clone()
        } else {
            vec!["/bin/sh".to_string()]
        };
        config.entrypoint.clear();
        config.tty = true;
        config.open_stdin = true;
        config.attach_stdin = true;
        config.stdin_once = true;

        let client = build.client().clone();
        let id = client.create_container(&interactive).await?;
        let result = build.runner().run_container(&id, true).await;

        if !matches!(result, Err(KilnError::Interrupted)) {
            if let Err(e) = client.remove_container(&id).await {
                tracing::warn!(container = short_id(&id), error = %e, "Failed to remove container");
            }
        }
        result?;

        // Nothing done inside an attached session is kept
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// Config-only instructions
// ---------------------------------------------------------------------------

pub struct EnvCommand {
    pairs: Vec<(String, String)>,
}

impl fmt::Display for EnvCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ENV {}", join_pairs(&self.pairs))
    }
}

impl EnvReplaceable for EnvCommand {
    fn replace_env(&mut self, env: &BTreeMap<String, String>) {
        for (_, value) in self.pairs.iter_mut() {
            *value = expand_env(value, env);
        }
    }
}

#[async_trait]
impl Command for EnvCommand {
    async fn execute(&self, _build: &mut Build, mut state: State) -> Result<State> {
        for (key, value) in &self.pairs {
            state.build.config.set_env(key, value);
        }
        state.commit(format!("ENV {}", join_pairs(&self.pairs)));
        Ok(state)
    }

    fn as_env_replaceable(&mut self) -> Option<&mut dyn EnvReplaceable> {
        Some(self)
    }
}

pub struct LabelCommand {
    pairs: Vec<(String, String)>,
}

impl fmt::Display for LabelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LABEL {}", join_pairs(&self.pairs))
    }
}

impl EnvReplaceable for LabelCommand {
    fn replace_env(&mut self, env: &BTreeMap<String, String>) {
        for (_, value) in self.pairs.iter_mut() {
            *value = expand_env(value, env);
        }
    }
}

#[async_trait]
impl Command for LabelCommand {
    async fn execute(&self, _build: &mut Build, mut state: State) -> Result<State> {
        for (key, value) in &self.pairs {
            state.build.config.labels.insert(key.clone(), value.clone());
        }
        state.commit(format!("LABEL {}", join_pairs(&self.pairs)));
        Ok(state)
    }

    fn as_env_replaceable(&mut self) -> Option<&mut dyn EnvReplaceable> {
        Some(self)
    }
}

pub struct WorkdirCommand {
    path: String,
}

impl fmt::Display for WorkdirCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WORKDIR {}", self.path)
    }
}

impl EnvReplaceable for WorkdirCommand {
    fn replace_env(&mut self, env: &BTreeMap<String, String>) {
        self.path = expand_env(&self.path, env);
    }
}

#[async_trait]
impl Command for WorkdirCommand {
    async fn execute(&self, _build: &mut Build, mut state: State) -> Result<State> {
        let workdir = resolve_path(&state.build.config.working_dir, &self.path);
        state.build.config.working_dir = workdir.clone();
        state.commit(format!("WORKDIR {}", workdir));
        Ok(state)
    }

    fn as_env_replaceable(&mut self) -> Option<&mut dyn EnvReplaceable> {
        Some(self)
    }
}

pub struct UserCommand {
    user: String,
}

impl fmt::Display for UserCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "USER {}", self.user)
    }
}

impl EnvReplaceable for UserCommand {
    fn replace_env(&mut self, env: &BTreeMap<String, String>) {
        self.user = expand_env(&self.user, env);
    }
}

#[async_trait]
impl Command for UserCommand {
    async fn execute(&self, _build: &mut Build, mut state: State) -> Result<State> {
        state.build.config.user = self.user.clone();
        state.commit(format!("USER {}", self.user));
        Ok(state)
    }

    fn as_env_replaceable(&mut self) -> Option<&mut dyn EnvReplaceable> {
        Some(self)
    }
}

pub struct ExposeCommand {
    ports: Vec<String>,
}

impl fmt::Display for ExposeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EXPOSE {}", self.ports.join(" "))
    }
}

impl EnvReplaceable for ExposeCommand {
    fn replace_env(&mut self, env: &BTreeMap<String, String>) {
        replace_all(&mut self.ports, env);
    }
}

#[async_trait]
impl Command for ExposeCommand {
    async fn execute(&self, _build: &mut Build, mut state: State) -> Result<State> {
        state
            .build
            .config
            .exposed_ports
            .extend(self.ports.iter().cloned());
        state.commit(format!("EXPOSE {:?}", self.ports));
        Ok(state)
    }

    fn as_env_replaceable(&mut self) -> Option<&mut dyn EnvReplaceable> {
        Some(self)
    }
}

pub struct VolumeCommand {
    paths: Vec<String>,
}

impl fmt::Display for VolumeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VOLUME {}", self.paths.join(" "))
    }
}

impl EnvReplaceable for VolumeCommand {
    fn replace_env(&mut self, env: &BTreeMap<String, String>) {
        replace_all(&mut self.paths, env);
    }
}

#[async_trait]
impl Command for VolumeCommand {
    async fn execute(&self, _build: &mut Build, mut state: State) -> Result<State> {
        state.build.config.volumes.extend(self.paths.iter().cloned());
        state.commit(format!("VOLUME {:?}", self.paths));
        Ok(state)
    }

    fn as_env_replaceable(&mut self) -> Option<&mut dyn EnvReplaceable> {
        Some(self)
    }
}

pub struct CmdCommand {
    cmd: Vec<String>,
}

impl fmt::Display for CmdCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CMD {}", display_command(&self.cmd))
    }
}

#[async_trait]
impl Command for CmdCommand {
    async fn execute(&self, _build: &mut Build, mut state: State) -> Result<State> {
        state.build.config.cmd = self.cmd.clone();
        state.no_cache.cmd_set = true;
        state.commit(format!("CMD {:?}", self.cmd));
        Ok(state)
    }
}

pub struct EntrypointCommand {
    cmd: Vec<String>,
}

impl fmt::Display for EntrypointCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ENTRYPOINT {}", display_command(&self.cmd))
    }
}

#[async_trait]
impl Command for EntrypointCommand {
    async fn execute(&self, _build: &mut Build, mut state: State) -> Result<State> {
        state.build.config.entrypoint = self.cmd.clone();
        // An inherited CMD would become arguments of the new entrypoint
        if !state.no_cache.cmd_set {
            state.build.config.cmd.clear();
        }
        state.commit(format!("ENTRYPOINT {:?}", self.cmd));
        Ok(state)
    }
}

pub struct OnbuildCommand {
    trigger: String,
}

impl fmt::Display for OnbuildCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ONBUILD {}", self.trigger)
    }
}

#[async_trait]
impl Command for OnbuildCommand {
    async fn execute(&self, _build: &mut Build, mut state: State) -> Result<State> {
        state.build.config.on_build.push(self.trigger.clone());
        state.commit(format!("ONBUILD {}", self.trigger));
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// COPY / ADD
// ---------------------------------------------------------------------------

pub struct CopyCommand {
    keyword: &'static str,
    src: Vec<String>,
    dest: String,
}

impl fmt::Display for CopyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.keyword, self.src.join(" "), self.dest)
    }
}

impl EnvReplaceable for CopyCommand {
    fn replace_env(&mut self, env: &BTreeMap<String, String>) {
        replace_all(&mut self.src, env);
        self.dest = expand_env(&self.dest, env);
    }
}

#[async_trait]
impl Command for CopyCommand {
    async fn execute(&self, build: &mut Build, mut state: State) -> Result<State> {
        require_image(&state, self.keyword)?;

        let ignore = IgnoreMatcher::new(&build.config().dockerignore)?;
        let entries = context::collect(
            &build.config().context_dir,
            &self.src,
            &self.dest,
            &state.build.config.working_dir,
            &ignore,
        )?;
        if entries.is_empty() {
            return Err(KilnError::BuildError(format!(
                "{}: no files to copy, all sources are excluded by .dockerignore",
                self.keyword
            )));
        }

        let checksum = context::checksum(&entries)?;
        let dest = resolve_path(&state.build.config.working_dir, &self.dest);
        state.commit(format!("{} {} to {}", self.keyword, checksum, dest));

        let (mut state, hit) = build.probe_cache(state).await?;
        if hit {
            return Ok(state);
        }

        let archive = context::make_archive(&entries)?;

        let orig_cmd = std::mem::replace(
            &mut state.build.config.cmd,
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("#(nop) {} {} in {}", self.keyword, self.src.join(" "), dest),
            ],
        );
        let orig_entrypoint = std::mem::take(&mut state.build.config.entrypoint);

        let client = build.client().clone();
        let id = client.create_container(&state).await?;
        state.no_cache.container_id = Some(id.clone());
        state.build.config.cmd = orig_cmd;
        state.build.config.entrypoint = orig_entrypoint;

        tracing::info!(
            size = %format_size(archive.len() as i64),
            "| Uploading {} file(s) to {}",
            entries.iter().filter(|e| !e.is_dir).count(),
            short_id(&id)
        );
        if let Err(e) = client.upload_to_container(&id, archive, "/").await {
            if let Err(remove_err) = client.remove_container(&id).await {
                tracing::warn!(container = short_id(&id), error = %remove_err, "Failed to remove container");
            }
            return Err(e);
        }

        Ok(state)
    }

    fn as_env_replaceable(&mut self) -> Option<&mut dyn EnvReplaceable> {
        Some(self)
    }
}

// ---------------------------------------------------------------------------
// MOUNT / EXPORT / IMPORT
// ---------------------------------------------------------------------------

pub struct MountCommand {
    specs: Vec<String>,
}

impl fmt::Display for MountCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MOUNT {}", self.specs.join(" "))
    }
}

impl EnvReplaceable for MountCommand {
    fn replace_env(&mut self, env: &BTreeMap<String, String>) {
        replace_all(&mut self.specs, env);
    }
}

fn expand_home(src: &str) -> String {
    match (src.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => format!("{}{}", home.display(), rest),
        _ => src.to_string(),
    }
}

#[async_trait]
impl Command for MountCommand {
    async fn execute(&self, build: &mut Build, mut state: State) -> Result<State> {
        let mut commit_ids = Vec::with_capacity(self.specs.len());

        for spec in &self.specs {
            match spec.split_once(':') {
                Some((src, dest)) => {
                    let mut src = expand_home(src);
                    if !Path::new(&src).is_absolute() {
                        src = build.config().context_dir.join(&src).display().to_string();
                    }
                    let src = build.client().resolve_host_path(&src)?;
                    state
                        .no_cache
                        .host_config
                        .binds
                        .push(format!("{}:{}", src, dest));
                    commit_ids.push(spec.clone());
                }
                None => {
                    let provisioner = build.provisioner();
                    let id = provisioner.ensure_volume_container(spec).await?;
                    tracing::info!(
                        "| Using container {} for {}",
                        provisioner.volume_container_name(spec),
                        spec
                    );
                    commit_ids.push(format!("{}:{}", provisioner.volume_container_name(spec), spec));
                    state.no_cache.host_config.volumes_from.push(id);
                }
            }
        }

        state.commit(format!("MOUNT {:?}", commit_ids));
        Ok(state)
    }

    fn as_env_replaceable(&mut self) -> Option<&mut dyn EnvReplaceable> {
        Some(self)
    }
}

fn rsync_command(verbose: bool, delete: bool) -> Vec<String> {
    let mut cmd = vec![format!("{}/rsync", RSYNC_BIN_PATH), "-a".to_string()];
    if delete {
        cmd.push("--delete-during".to_string());
    }
    if verbose {
        cmd.push("--verbose".to_string());
    }
    cmd
}

pub struct ExportCommand {
    src: Vec<String>,
    dest: String,
}

impl fmt::Display for ExportCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EXPORT {} {}", self.src.join(" "), self.dest)
    }
}

impl EnvReplaceable for ExportCommand {
    fn replace_env(&mut self, env: &BTreeMap<String, String>) {
        replace_all(&mut self.src, env);
        self.dest = expand_env(&self.dest, env);
    }
}

#[async_trait]
impl Command for ExportCommand {
    async fn execute(&self, build: &mut Build, mut state: State) -> Result<State> {
        require_image(&state, "EXPORT")?;

        let exports_container = build.provisioner().ensure_export_container().await?;
        tracing::info!(
            "| Using exports container {}",
            build.provisioner().export_container_name()
        );

        let dest = resolve_path(EXPORTS_PATH, self.dest.trim_start_matches('/'));
        state.commit(format!(
            "EXPORT {:?} to {}:{}",
            self.src,
            build.provisioner().export_container_name(),
            self.dest
        ));

        let (state, hit) = build.probe_cache(state).await?;
        if hit {
            build.record_export(&state.build.exports_id);
            return Ok(state);
        }

        let mut exporter = state.clone();
        let mut cmd = rsync_command(build.config().verbose, true);
        cmd.extend(self.src.iter().cloned());
        cmd.push(dest);
        exporter.no_cache.host_config.volumes_from = vec![exports_container];
        exporter.build.config.cmd = cmd;
        exporter.build.config.entrypoint.clear();

        let client = build.client().clone();
        let exporter_id = client.create_container(&exporter).await?;
        tracing::info!(
            "| Running in {}: {}",
            short_id(&exporter_id),
            exporter.build.config.cmd.join(" ")
        );
        let outcome = build.runner().run_container(&exporter_id, false).await;
        // The data lives in the exports container; the exporter's id only
        // identifies this export, so the container itself is not kept
        if !matches!(outcome, Err(KilnError::Interrupted)) {
            if let Err(e) = client.remove_container(&exporter_id).await {
                tracing::warn!(container = short_id(&exporter_id), error = %e, "Failed to remove container");
            }
        }
        outcome?;

        let mut state = state;
        state.build.exports_id = exporter_id.clone();
        build.record_export(&exporter_id);
        Ok(state)
    }

    fn as_env_replaceable(&mut self) -> Option<&mut dyn EnvReplaceable> {
        Some(self)
    }
}

pub struct ImportCommand {
    src: Vec<String>,
    dest: String,
}

impl fmt::Display for ImportCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IMPORT {} {}", self.src.join(" "), self.dest)
    }
}

impl EnvReplaceable for ImportCommand {
    fn replace_env(&mut self, env: &BTreeMap<String, String>) {
        replace_all(&mut self.src, env);
        self.dest = expand_env(&self.dest, env);
    }
}

#[async_trait]
impl Command for ImportCommand {
    async fn execute(&self, build: &mut Build, mut state: State) -> Result<State> {
        require_image(&state, "IMPORT")?;
        if build.exports().is_empty() {
            return Err(KilnError::BuildError(
                "You have to EXPORT something first in order to IMPORT".to_string(),
            ));
        }

        let exports_container = build.provisioner().ensure_export_container().await?;
        tracing::info!("| Import from {}", build.provisioner().export_container_name());

        let src: Vec<String> = self
            .src
            .iter()
            .map(|s| resolve_path(EXPORTS_PATH, s.trim_start_matches('/')))
            .collect();

        // Any change to an export of this run invalidates the import
        state.commit(format!(
            "IMPORT {:?} : {:?} {}",
            build.exports(),
            src,
            self.dest
        ));

        let (state, hit) = build.probe_cache(state).await?;
        if hit {
            return Ok(state);
        }

        let mut importer = state.clone();
        let mut cmd = rsync_command(build.config().verbose, false);
        cmd.extend(src);
        cmd.push(self.dest.clone());
        importer.no_cache.host_config.volumes_from = vec![exports_container];
        importer.build.config.cmd = cmd;
        importer.build.config.entrypoint.clear();

        let client = build.client().clone();
        let import_id = client.create_container(&importer).await?;
        tracing::info!(
            "| Running in {}: {}",
            short_id(&import_id),
            importer.build.config.cmd.join(" ")
        );
        if let Err(e) = build.runner().run_container(&import_id, false).await {
            if !matches!(e, KilnError::Interrupted) {
                if let Err(remove_err) = client.remove_container(&import_id).await {
                    tracing::warn!(container = short_id(&import_id), error = %remove_err, "Failed to remove container");
                }
            }
            return Err(e);
        }

        // Committed by the following COMMIT with the original config
        let mut state = state;
        state.no_cache.container_id = Some(import_id);
        Ok(state)
    }

    fn as_env_replaceable(&mut self) -> Option<&mut dyn EnvReplaceable> {
        Some(self)
    }
}

// ---------------------------------------------------------------------------
// TAG / PUSH
// ---------------------------------------------------------------------------

pub struct TagCommand {
    name: String,
}

impl fmt::Display for TagCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TAG {}", self.name)
    }
}

#[async_trait]
impl Command for TagCommand {
    async fn execute(&self, build: &mut Build, state: State) -> Result<State> {
        if state.build.image_id.is_empty() {
            return Err(KilnError::BuildError("Cannot TAG on empty image".to_string()));
        }
        build.client().tag_image(&state.build.image_id, &self.name).await?;
        tracing::info!("| Tag {} -> {}", short_id(&state.build.image_id), self.name);
        Ok(state)
    }
}

pub struct PushCommand {
    name: String,
}

impl fmt::Display for PushCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PUSH {}", self.name)
    }
}

#[async_trait]
impl Command for PushCommand {
    async fn execute(&self, build: &mut Build, state: State) -> Result<State> {
        if state.build.image_id.is_empty() {
            return Err(KilnError::BuildError("Cannot PUSH empty image".to_string()));
        }

        let image = ImageName::parse(&self.name)?;
        let client = build.client().clone();
        client.tag_image(&state.build.image_id, &self.name).await?;

        let pushed = build.config().push;
        let mut artifact = Artifact::new(&image, &state.build.image_id, pushed);

        if pushed {
            let digest = client.push_image(&self.name).await?;
            tracing::info!("| Pushed {} ({})", image, digest);
            artifact.set_digest(&image, &digest);
        } else {
            tracing::info!("| Don't push. Pass --push flag to actually push to the registry");
        }

        if let Some(dir) = &build.config().artifacts_path {
            let path = artifact.write(&image, dir)?;
            tracing::info!("| Saved artifact file {}", path.display());
        }

        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// Implicit steps
// ---------------------------------------------------------------------------

/// Turns pending commit messages into an image.
pub struct CommitCommand;

impl fmt::Display for CommitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "COMMIT")
    }
}

#[async_trait]
impl Command for CommitCommand {
    fn should_run(&self, _build: &Build, state: &State) -> Result<bool> {
        Ok(!state.build.commits.is_empty())
    }

    async fn execute(&self, build: &mut Build, mut state: State) -> Result<State> {
        let message = state.commits_message();
        if message.is_empty() {
            return Ok(state);
        }
        require_image(&state, "commit")?;

        let client = build.client().clone();

        if state.no_cache.container_id.is_none() {
            let (probed, hit) = build.probe_cache(state).await?;
            if hit {
                return Ok(probed);
            }
            state = probed;

            let orig_cmd = std::mem::replace(
                &mut state.build.config.cmd,
                vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    format!("#(nop) {}", message),
                ],
            );
            let id = client.create_container(&state).await?;
            state.no_cache.container_id = Some(id);
            state.build.config.cmd = orig_cmd;
        }

        let container = state.no_cache.container_id.clone().unwrap_or_default();
        // Keyed by what the step started from, so the next run finds it
        let key = state.fingerprint()?;

        let committed = client.commit_container(&state, &message).await;
        if let Err(e) = client.remove_container(&container).await {
            tracing::warn!(container = short_id(&container), error = %e, "Failed to remove container");
        }
        let image = committed?;

        state.no_cache.container_id = None;
        state.build.parent_id = std::mem::take(&mut state.build.image_id);
        state.build.image_id = image.id.clone();
        state.build.produced_image = true;

        build.store_cache(&key, &state.build)?;
        build.add_produced_image(&image);

        state.clean_commits();
        Ok(state)
    }
}

/// Ends a stage: drops untagged intermediate images with `--no-garbage`
/// and resets the state for the next FROM.
pub struct CleanupCommand {
    pub is_final: bool,
    pub tagged: bool,
}

impl fmt::Display for CleanupCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CLEANUP")
    }
}

#[async_trait]
impl Command for CleanupCommand {
    async fn execute(&self, build: &mut Build, state: State) -> Result<State> {
        let image_id = &state.build.image_id;
        if build.config().no_garbage && !self.tagged && !image_id.is_empty() && state.build.produced_image {
            tracing::info!("| Removing untagged image {}", short_id(image_id));
            build.client().remove_image(image_id).await?;
        }

        let mut clean = State::default();
        clean.build.exports_id = state.build.exports_id.clone();
        if self.is_final {
            clean.build.image_id = state.build.image_id.clone();
        } else {
            tracing::info!("====================================");
        }
        Ok(clean)
    }
}
