//! Capability-tag registry for pluggable providers.
//!
//! Providers are registered under a tag (for example the cache backend
//! `"local"`) and resolved once while the runtime is built.

use std::collections::HashMap;
use std::sync::Arc;

use keycloak_config::ClusterConfig;

use crate::error::RuntimeError;

/// Builds a provider from the node configuration.
pub type ProviderFactory<T> = Arc<dyn Fn(&ClusterConfig) -> Result<T, RuntimeError> + Send + Sync>;

pub struct ProviderRegistry<T> {
    kind: &'static str,
    factories: HashMap<String, ProviderFactory<T>>,
}

impl<T> ProviderRegistry<T> {
    /// Creates an empty registry for providers of `kind` (used in errors).
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: HashMap::new(),
        }
    }

    /// Registers `factory` under `tag`, replacing any previous one.
    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn(&ClusterConfig) -> Result<T, RuntimeError> + Send + Sync + 'static,
    {
        let tag = tag.into();
        tracing::debug!(kind = self.kind, tag = %tag, "Registered provider");
        self.factories.insert(tag, Arc::new(factory));
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Sorted list of registered tags.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Builds the provider registered under `tag`.
    pub fn resolve(&self, tag: &str, config: &ClusterConfig) -> Result<T, RuntimeError> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| RuntimeError::UnknownProvider {
                kind: self.kind,
                tag: tag.to_string(),
                available: self.tags().join(", "),
            })?;
        factory(config)
    }
}

impl<T> std::fmt::Debug for ProviderRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kind", &self.kind)
            .field("tags", &self.tags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_registered_provider() {
        let mut registry = ProviderRegistry::<usize>::new("counter");
        registry.register("local", |config: &ClusterConfig| {
            Ok(config.sessions.max_replace_retries as usize)
        });
        assert!(registry.contains("local"));
        assert_eq!(registry.resolve("local", &ClusterConfig::default()).unwrap(), 10);
    }

    #[test]
    fn test_unknown_tag_lists_available() {
        let mut registry = ProviderRegistry::<()>::new("cache backend");
        registry.register("local", |_: &ClusterConfig| Ok(()));
        registry.register("embedded", |_: &ClusterConfig| Ok(()));

        let err = registry
            .resolve("remote", &ClusterConfig::default())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown cache backend provider 'remote' (available: embedded, local)"
        );
    }
}
