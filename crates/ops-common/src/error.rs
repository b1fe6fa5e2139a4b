//! Error taxonomy shared by every AI-Ops component.

use thiserror::Error;

/// Result type alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds enumerated in the core's error handling design.
///
/// Every fallible operation in the pipeline returns one of these, never a
/// bare string or a panic. Component-level call sites decide whether a
/// variant is retried, logged-and-skipped, or surfaced to the caller.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("dependency unavailable: {0}")]
    Dependency(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("illegal state transition: {0}")]
    State(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Whether the failing operation is worth retrying without operator
    /// intervention (a dependency timeout, not a validation mistake).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Dependency(_) | Error::Io(_))
    }

    /// Coarse category used for log fields and component stats.
    pub fn category(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Validation(_) => "validation",
            Error::Dependency(_) => "dependency",
            Error::Io(_) => "io",
            Error::State(_) => "state",
            Error::Serialization(_) => "serialization",
            Error::Generic(_) => "generic",
        }
    }
}
