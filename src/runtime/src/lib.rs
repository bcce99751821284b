//! Kiln Runtime - build execution engine.
//!
//! This crate runs Kilnfile builds against a container engine: the plan
//! runner and its commands, the build cache, provisioning of auxiliary
//! containers and the attach/wait/interrupt protocol for build containers.

#![allow(clippy::result_large_err)]

pub mod build;
pub mod cache;
pub mod engine;
pub mod provision;
pub mod run;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types
pub use build::{Build, Command, EnvReplaceable, Instruction, Kilnfile, Plan};
pub use cache::{CacheEntry, CacheFs, CacheStore};
pub use engine::{ContainerInfo, DockerClient, EngineClient, ImageInfo};
pub use provision::Provisioner;
pub use run::{ctrl_c, InterruptSource, RunCoordinator};

/// Kiln Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
