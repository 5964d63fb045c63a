use keycloak_config::ConfigError;
use keycloak_core::CoreError;
use keycloak_keys::FetchError;

/// Errors raised while building or running the cluster runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unknown {kind} provider '{tag}' (available: {available})")]
    UnknownProvider {
        kind: &'static str,
        tag: String,
        available: String,
    },

    #[error("Key locator setup failed: {0}")]
    KeyLocator(#[from] FetchError),

    #[error(transparent)]
    Core(#[from] CoreError),
}
