//! Distributed cache abstraction.
//!
//! Every cache exposes versioned entries: each successful write assigns a new
//! version, and [`DistributedCache::replace_if_version`] only succeeds when the
//! caller saw the latest one. That is the building block for at-most-one-writer
//! semantics per key.

mod memory;

pub use memory::InMemoryCache;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::topology::CacheTopology;

/// Kind of change applied to a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheOperation {
    Add,
    AddIfAbsent,
    Replace,
    Remove,
}

impl CacheOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::AddIfAbsent => "ADD_IF_ABSENT",
            Self::Replace => "REPLACE",
            Self::Remove => "REMOVE",
        }
    }
}

impl std::fmt::Display for CacheOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value together with the version the cache assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<V> {
    pub value: V,
    pub version: u64,
}

/// Result of a conditional replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Written; the entry now carries `version`.
    Replaced { version: u64 },
    /// No live entry under the key.
    Missing,
    /// Someone wrote in between; `current` is the version now stored.
    Conflict { current: u64 },
}

/// Shared handle to a cache of `V`.
pub type SharedCache<V> = Arc<dyn DistributedCache<V>>;

/// A named, versioned key-value cache that may span several nodes.
#[async_trait]
pub trait DistributedCache<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Cache name, used in logs and propagated change records.
    fn name(&self) -> &str;

    /// Live placement information for this cache.
    fn topology(&self) -> Arc<dyn CacheTopology>;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry<V>>>;

    /// Unconditional write. Returns the new version.
    async fn put(&self, key: &str, value: V, lifespan: Option<Duration>) -> Result<u64>;

    /// Writes only when no live entry exists.
    ///
    /// Returns the existing entry when the write did not happen.
    async fn put_if_absent(
        &self,
        key: &str,
        value: V,
        lifespan: Option<Duration>,
    ) -> Result<Option<CacheEntry<V>>>;

    /// Writes only when the stored version equals `expected_version`.
    async fn replace_if_version(
        &self,
        key: &str,
        expected_version: u64,
        value: V,
        lifespan: Option<Duration>,
    ) -> Result<ReplaceOutcome>;

    async fn remove(&self, key: &str) -> Result<Option<CacheEntry<V>>>;

    /// Snapshot of all live entries.
    async fn entries(&self) -> Result<Vec<(String, CacheEntry<V>)>>;

    async fn clear(&self) -> Result<()>;

    /// Drops expired entries. Returns how many were removed.
    fn purge_expired(&self) -> usize {
        0
    }
}
