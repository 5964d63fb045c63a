//! # keycloak-config
//!
//! Configuration for the clustered session and key-replication runtime.
//!
//! Every section is a plain serde struct with documented defaults, so a
//! completely empty file (or no file at all) yields a runnable single-node
//! setup. Values are layered by [`loader::load_config`]:
//!
//! 1. Built-in defaults
//! 2. TOML file (if present)
//! 3. Environment variables, e.g. `KEYCLOAK__TOPOLOGY__SITE_NAME=site-a`
//!
//! # Example (TOML)
//!
//! ```toml
//! [logging]
//! level = "debug"
//!
//! [topology]
//! node_name = "node-1"
//! site_name = "site-a"
//! clustered = true
//!
//! [key_locator]
//! descriptor_url = "https://idp.example.com/realms/demo/protocol/saml/descriptor"
//! min_time_between_requests = "20s"
//! cache_ttl = "1day"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),

    /// The configuration sources could not be read or merged.
    #[error("Failed to load configuration: {0}")]
    Load(String),
}

/// Root configuration for a cluster node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Node and site identity.
    pub topology: TopologyConfig,
    /// Remote key descriptor fetching and caching.
    pub key_locator: KeyLocatorConfig,
    /// Session cache update pipeline.
    pub sessions: SessionsConfig,
    /// Cluster coordination and event delivery.
    pub cluster: CoordinationConfig,
}

impl ClusterConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a value is out of range or
    /// inconsistent with another value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(ConfigError::InvalidValue(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }

        if let Some(name) = &self.topology.node_name
            && name.trim().is_empty()
        {
            return Err(ConfigError::InvalidValue(
                "topology.node_name must not be blank when set".to_string(),
            ));
        }

        self.key_locator.validate()?;

        if self.sessions.max_replace_retries == 0 {
            return Err(ConfigError::InvalidValue(
                "sessions.max_replace_retries must be > 0".to_string(),
            ));
        }
        if self.sessions.sync_propagation_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "sessions.sync_propagation_timeout must be > 0".to_string(),
            ));
        }
        if self.cluster.task_latch_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "cluster.task_latch_timeout must be > 0".to_string(),
            ));
        }
        if self.cluster.cache_backend.trim().is_empty() {
            return Err(ConfigError::Missing("cluster.cache_backend".to_string()));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level filter, overridden by `RUST_LOG` when set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Node and site identity configuration.
///
/// Explicit values win over anything the environment provides. Leaving
/// `node_name` unset makes the node fall back to the transport address and,
/// failing that, to a generated name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Logical node name used for sticky routing and event origin.
    pub node_name: Option<String>,
    /// Datacenter (site) name. Only set in cross-DC deployments.
    pub site_name: Option<String>,
    /// Whether the node is expected to join a cluster.
    pub clustered: bool,
}

/// Remote key descriptor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyLocatorConfig {
    /// URL of the published key descriptor. No fetch happens when unset.
    pub descriptor_url: Option<String>,

    /// Minimum time between two descriptor requests triggered by cache misses.
    #[serde(with = "humantime_serde")]
    pub min_time_between_requests: Duration,

    /// Time after which the whole key cache is refreshed on next access.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// HTTP request timeout for descriptor fetches.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Maximum accepted descriptor size in bytes.
    pub max_response_size: usize,

    /// Allow plain HTTP descriptor URLs. Testing only.
    pub allow_http: bool,
}

impl Default for KeyLocatorConfig {
    fn default() -> Self {
        Self {
            descriptor_url: None,
            min_time_between_requests: Duration::from_secs(20),
            cache_ttl: Duration::from_secs(86400),
            request_timeout: Duration::from_secs(10),
            max_response_size: 1024 * 1024,
            allow_http: false,
        }
    }
}

impl KeyLocatorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(raw) = &self.descriptor_url {
            let parsed = url::Url::parse(raw).map_err(|e| {
                ConfigError::InvalidValue(format!("key_locator.descriptor_url: {e}"))
            })?;
            match parsed.scheme() {
                "https" => {}
                "http" if self.allow_http => {}
                other => {
                    return Err(ConfigError::InvalidValue(format!(
                        "key_locator.descriptor_url scheme '{other}' is not allowed"
                    )));
                }
            }
        }
        if self.cache_ttl < self.min_time_between_requests {
            return Err(ConfigError::InvalidValue(
                "key_locator.cache_ttl must be >= key_locator.min_time_between_requests"
                    .to_string(),
            ));
        }
        if self.max_response_size == 0 {
            return Err(ConfigError::InvalidValue(
                "key_locator.max_response_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Session update pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Upper bound a caller waits for a synchronous cross-DC acknowledgement.
    #[serde(with = "humantime_serde")]
    pub sync_propagation_timeout: Duration,

    /// Compare-and-swap attempts before a REPLACE gives up.
    pub max_replace_retries: u32,

    /// Interval of the expired-entry housekeeping sweep.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            sync_propagation_timeout: Duration::from_secs(5),
            max_replace_retries: 10,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Cluster coordination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// How long a waiter blocks for a task result handle.
    #[serde(with = "humantime_serde")]
    pub task_latch_timeout: Duration,

    /// Per-listener execution timeout for cluster events.
    #[serde(with = "humantime_serde")]
    pub listener_timeout: Duration,

    /// Capability tag of the cache backend to construct.
    pub cache_backend: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            task_latch_timeout: Duration::from_secs(10),
            listener_timeout: Duration::from_secs(30),
            cache_backend: "local".to_string(),
        }
    }
}

pub mod loader {
    use super::{ClusterConfig, ConfigError};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default file looked up when no path is given.
    pub const DEFAULT_CONFIG_FILE: &str = "keycloak.toml";

    /// Environment prefix for overrides, e.g. `KEYCLOAK__CLUSTER__CACHE_BACKEND`.
    pub const ENV_PREFIX: &str = "KEYCLOAK";

    /// Loads, merges and validates the configuration.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_config(path: Option<&str>) -> Result<ClusterConfig, ConfigError> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            tracing::debug!(path = %pathbuf.display(), "Adding configuration file source");
            builder = builder.add_source(File::from(pathbuf));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| ConfigError::Load(format!("config build error: {e}")))?;
        let merged: ClusterConfig = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::Load(format!("config deserialize error: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }
}
