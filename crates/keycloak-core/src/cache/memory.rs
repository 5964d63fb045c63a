//! DashMap-backed cache with per-entry lifespan.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::{CacheEntry, DistributedCache, ReplaceOutcome};
use crate::error::Result;
use crate::topology::{CacheTopology, LocalTopology};

#[derive(Clone, Debug)]
struct StoredEntry<V> {
    value: V,
    version: u64,
    stored_at: Instant,
    lifespan: Option<Duration>,
}

impl<V: Clone> StoredEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.lifespan
            .is_some_and(|ttl| now.saturating_duration_since(self.stored_at) > ttl)
    }

    fn to_entry(&self) -> CacheEntry<V> {
        CacheEntry {
            value: self.value.clone(),
            version: self.version,
        }
    }
}

/// In-process cache.
///
/// Several views created with [`InMemoryCache::view_with_topology`] share the
/// same storage and version counter, which is how a single process simulates
/// a cluster of nodes looking at one distributed cache.
pub struct InMemoryCache<V> {
    name: String,
    entries: Arc<DashMap<String, StoredEntry<V>>>,
    versions: Arc<AtomicU64>,
    topology: Arc<dyn CacheTopology>,
}

impl<V> InMemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a local-mode cache.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_topology(name, Arc::new(LocalTopology))
    }

    pub fn with_topology(name: impl Into<String>, topology: Arc<dyn CacheTopology>) -> Self {
        Self {
            name: name.into(),
            entries: Arc::new(DashMap::new()),
            versions: Arc::new(AtomicU64::new(0)),
            topology,
        }
    }

    /// Another node's view of the same storage.
    pub fn view_with_topology(&self, topology: Arc<dyn CacheTopology>) -> Self {
        Self {
            name: self.name.clone(),
            entries: Arc::clone(&self.entries),
            versions: Arc::clone(&self.versions),
            topology,
        }
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn stored(&self, value: V, lifespan: Option<Duration>) -> StoredEntry<V> {
        StoredEntry {
            value,
            version: self.next_version(),
            stored_at: Instant::now(),
            lifespan,
        }
    }

    fn evict_if_expired(&self, key: &str, now: Instant) {
        self.entries.remove_if(key, |_, e| e.is_expired(now));
    }
}

#[async_trait]
impl<V> DistributedCache<V> for InMemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn topology(&self) -> Arc<dyn CacheTopology> {
        Arc::clone(&self.topology)
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        let now = Instant::now();
        let found = self.entries.get(key).map(|e| {
            if e.is_expired(now) {
                None
            } else {
                Some(e.to_entry())
            }
        });
        match found {
            Some(Some(entry)) => Ok(Some(entry)),
            Some(None) => {
                self.evict_if_expired(key, now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: V, lifespan: Option<Duration>) -> Result<u64> {
        let entry = self.stored(value, lifespan);
        let version = entry.version;
        self.entries.insert(key.to_string(), entry);
        Ok(version)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: V,
        lifespan: Option<Duration>,
    ) -> Result<Option<CacheEntry<V>>> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(self.stored(value, lifespan));
                    Ok(None)
                } else {
                    Ok(Some(occupied.get().to_entry()))
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.stored(value, lifespan));
                Ok(None)
            }
        }
    }

    async fn replace_if_version(
        &self,
        key: &str,
        expected_version: u64,
        value: V,
        lifespan: Option<Duration>,
    ) -> Result<ReplaceOutcome> {
        let now = Instant::now();
        let mut expired = false;
        let outcome = match self.entries.get_mut(key) {
            None => ReplaceOutcome::Missing,
            Some(mut current) => {
                if current.is_expired(now) {
                    expired = true;
                    ReplaceOutcome::Missing
                } else if current.version != expected_version {
                    ReplaceOutcome::Conflict {
                        current: current.version,
                    }
                } else {
                    *current = self.stored(value, lifespan);
                    ReplaceOutcome::Replaced {
                        version: current.version,
                    }
                }
            }
        };
        if expired {
            self.evict_if_expired(key, now);
        }
        Ok(outcome)
    }

    async fn remove(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(_, e)| e.to_entry()))
    }

    async fn entries(&self) -> Result<Vec<(String, CacheEntry<V>)>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| (e.key().clone(), e.value().to_entry()))
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(cache = %self.name, removed, "Purged expired entries");
        }
        removed
    }
}

impl<V> std::fmt::Debug for InMemoryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("name", &self.name)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}
