use thiserror::Error;

/// Core error types for cluster operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cache '{cache}' error: {message}")]
    Cache { cache: String, message: String },

    #[error("Cluster messaging error: {0}")]
    Messaging(String),

    #[error("Task '{task_key}' failed: {message}")]
    Task { task_key: String, message: String },

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Listener '{listener}' failed: {message}")]
    Listener { listener: String, message: String },

    #[error("Unit of work failed: {0}")]
    Transaction(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a new Cache error
    pub fn cache(cache: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cache {
            cache: cache.into(),
            message: message.into(),
        }
    }

    /// Create a new Messaging error
    pub fn messaging(message: impl Into<String>) -> Self {
        Self::Messaging(message.into())
    }

    /// Create a new Task error
    pub fn task(task_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Task {
            task_key: task_key.into(),
            message: message.into(),
        }
    }

    /// Create a new Listener error
    pub fn listener(listener: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Listener {
            listener: listener.into(),
            message: message.into(),
        }
    }

    /// Create a new Transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction(message.into())
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Cache { .. } | Self::Messaging(_) | Self::Transaction(_)
        )
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::Topology(_) => ErrorCategory::Configuration,
            Self::Cache { .. } => ErrorCategory::Cache,
            Self::Messaging(_) => ErrorCategory::Messaging,
            Self::Task { .. } | Self::Listener { .. } | Self::Transaction(_) => {
                ErrorCategory::Execution
            }
            Self::JsonError(_) => ErrorCategory::Serialization,
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Cache,
    Messaging,
    Execution,
    Serialization,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Cache => write!(f, "cache"),
            Self::Messaging => write!(f, "messaging"),
            Self::Execution => write!(f, "execution"),
            Self::Serialization => write!(f, "serialization"),
        }
    }
}

/// Convenience result type for core operations
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_error() {
        let err = CoreError::cache("sessions", "backend unavailable");
        assert_eq!(
            err.to_string(),
            "Cache 'sessions' error: backend unavailable"
        );
        assert!(err.is_transient());
        assert_eq!(err.category(), ErrorCategory::Cache);
    }

    #[test]
    fn test_listener_error() {
        let err = CoreError::listener("realm-removed", "boom");
        assert_eq!(err.to_string(), "Listener 'realm-removed' failed: boom");
        assert!(!err.is_transient());
        assert_eq!(err.category(), ErrorCategory::Execution);
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err: serde_json::Error =
            serde_json::from_str::<serde_json::Value>("{ invalid json }").unwrap_err();
        let core_err: CoreError = json_err.into();

        assert!(matches!(core_err, CoreError::JsonError(_)));
        assert_eq!(core_err.category(), ErrorCategory::Serialization);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Messaging.to_string(), "messaging");
        assert_eq!(ErrorCategory::Configuration.to_string(), "configuration");
    }
}
