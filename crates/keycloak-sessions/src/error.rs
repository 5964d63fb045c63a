use keycloak_core::CoreError;
use thiserror::Error;

/// Errors of the session update pipeline.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested operation contradicts the cache content.
    #[error("Invalid state for '{key}': {message}")]
    InvalidState { key: String, message: String },

    /// Concurrent writers kept winning until retries ran out.
    #[error("Version conflict on '{key}' after {attempts} attempts")]
    VersionConflict { key: String, attempts: u32 },

    /// Local write kept, remote datacenters not confirmed.
    #[error("Cross-DC propagation of '{key}' (version {version}) failed: {message}")]
    Propagation {
        key: String,
        version: u64,
        message: String,
    },

    #[error(transparent)]
    Cache(#[from] CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionError {
    pub fn invalid_state(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidState {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Whether the local cache holds the change despite the error.
    pub fn is_locally_applied(&self) -> bool {
        matches!(self, Self::Propagation { .. })
    }
}
