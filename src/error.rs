//! Error type shared by the directory, the backends and the watchers.

use std::sync::Arc;
use std::time::Duration;

/// Errors returned by registry and directory operations.
///
/// The type is `Clone` so that a single population result can be handed to every
/// caller waiting on the same name.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// The registry backend is not configured or could not be reached at setup.
    #[error("invalid backend: {0}")]
    InvalidBackend(String),

    /// The configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A static or registry-provided address is not `host:port`.
    #[error("invalid service address `{0}`")]
    InvalidAddress(String),

    /// The HTTP request to the registry failed.
    #[error("registry request failed: {0}")]
    Http(#[source] Arc<reqwest::Error>),

    /// The registry answered with a non-success status.
    #[error("registry returned {status} for {path}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Request path.
        path: String,
    },

    /// The registry response was missing data the protocol requires.
    #[error("malformed registry response: {0}")]
    Protocol(String),

    /// A blocking call exceeded its deadline.
    #[error("registry call timed out after {0:?}")]
    Timeout(Duration),

    /// The owning center is shutting down.
    #[error("operation cancelled")]
    Cancelled,

    /// The watcher was closed.
    #[error("watcher closed")]
    Closed,
}

impl Error {
    /// Returns `true` for failures a caller may retry later.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Status { .. } | Self::Protocol(_) | Self::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(Arc::new(err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for directory operations.
pub type Result<T> = std::result::Result<T, Error>;
