//! Kiln Core - build state, configuration and errors
//!
//! Types shared by the kiln build engine and the command-line front end.

pub mod config;
pub mod error;
pub mod imagename;
pub mod state;
pub mod units;
pub mod vars;

// Re-export commonly used types
pub use config::{AuthConfig, BuildConfig};
pub use error::{KilnError, Result};
pub use imagename::ImageName;
pub use state::{BuildState, ContainerConfig, Fingerprint, HostConfig, NoCache, State};
pub use vars::Vars;

/// Kiln version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
