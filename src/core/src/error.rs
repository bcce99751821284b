use thiserror::Error;

/// Kiln error types
#[derive(Error, Debug)]
pub enum KilnError {
    /// Kilnfile could not be parsed
    #[error("Parse error at line {line}: {message}")]
    ParseError { line: usize, message: String },

    /// Plan could not be assembled (e.g. invalid ONBUILD trigger)
    #[error("Plan error: {0}")]
    PlanError(String),

    /// A build step failed its precondition or execution
    #[error("Build error: {0}")]
    BuildError(String),

    /// Container engine API failure
    #[error("Engine error: {0}")]
    EngineError(String),

    /// Cache store failure
    #[error("Cache error: {0}")]
    CacheError(String),

    /// A container finished with a non-zero status
    #[error("Container {} exited with code {code}", short_id(.id))]
    ContainerExit { id: String, code: i64 },

    /// Attaching to a container failed
    #[error("Attach error: {0}")]
    AttachError(String),

    /// The run was interrupted by the user
    #[error("Interrupted")]
    Interrupted,

    /// Variable substitution failed
    #[error("Template error: {0}")]
    TemplateError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for KilnError {
    fn from(err: serde_yaml::Error) -> Self {
        KilnError::SerializationError(err.to_string())
    }
}

/// Shorten an engine id to the 12 characters shown in logs.
pub fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Result type alias for Kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;
