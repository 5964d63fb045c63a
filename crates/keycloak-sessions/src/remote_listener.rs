//! Applies session changes received from other datacenters to the local cache.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keycloak_core::cache::{CacheOperation, ReplaceOutcome, SharedCache};
use keycloak_core::events::{
    ClusterEventEnvelope, ClusterEventPayload, ClusterListener, ListenerError, SessionChange,
};
use keycloak_core::TopologyInfo;
use tracing::{debug, trace, warn};

use crate::entities::SessionEntity;
use crate::retry::Backoff;
use crate::wrapper::SessionEntityWrapper;

/// Replace attempts before a remote change is dropped.
pub const MAX_REPLACE_RETRIES: u32 = 10;

/// What the listener did with one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// Another node owns the key.
    NotOwner,
    Created,
    Replaced,
    Removed,
    /// The local copy is at the same or a newer version.
    Stale,
    /// Local entry was already present (create) or absent (remove).
    Unchanged,
    GaveUp,
}

/// Listener for `SessionChanged` events of one session cache.
///
/// Only the primary owner of a key applies a change, unless the originating
/// write was retried.
pub struct RemoteStoreListener<E: SessionEntity> {
    name: String,
    cache: SharedCache<SessionEntityWrapper<E>>,
    topology: Arc<TopologyInfo>,
    max_retries: u32,
    lifespan: Option<Duration>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: SessionEntity> RemoteStoreListener<E> {
    pub fn new(cache: SharedCache<SessionEntityWrapper<E>>, topology: Arc<TopologyInfo>) -> Self {
        Self {
            name: format!("remote-store-{}", cache.name()),
            cache,
            topology,
            max_retries: MAX_REPLACE_RETRIES,
            lifespan: None,
            _entity: PhantomData,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_lifespan(mut self, lifespan: Option<Duration>) -> Self {
        self.lifespan = lifespan;
        self
    }

    fn should_update_local_cache(&self, change: &SessionChange) -> bool {
        let apply = change.command_retried
            || self
                .topology
                .is_primary_owner(self.cache.topology().as_ref(), &change.key);
        debug!(
            cache = %self.cache.name(),
            key = %change.key,
            operation = %change.operation,
            skip = !apply,
            "Received change from remote datacenter"
        );
        apply
    }

    /// Applies one change. Returns what happened to the local cache.
    pub async fn apply_change(&self, change: &SessionChange) -> Result<RemoteApply, ListenerError> {
        if !self.should_update_local_cache(change) {
            return Ok(RemoteApply::NotOwner);
        }

        match change.operation {
            CacheOperation::Remove => Ok(match self.cache.remove(&change.key).await? {
                Some(_) => RemoteApply::Removed,
                None => RemoteApply::Unchanged,
            }),
            CacheOperation::Add => {
                // a re-created entry continues the stored version
                let entity = self.decode(change)?;
                self.merge(change, entity, false).await
            }
            CacheOperation::AddIfAbsent => {
                let entity = self.decode(change)?;
                let wrapper = SessionEntityWrapper::with_version(entity, change.version);
                Ok(
                    match self
                        .cache
                        .put_if_absent(&change.key, wrapper, self.lifespan)
                        .await?
                    {
                        None => RemoteApply::Created,
                        Some(_) => RemoteApply::Unchanged,
                    },
                )
            }
            CacheOperation::Replace => {
                let entity = self.decode(change)?;
                self.merge(change, entity, true).await
            }
        }
    }

    /// Writes the remote entity when its version is newer than the local one.
    /// `keep_metadata` carries the local metadata over to the new value.
    async fn merge(
        &self,
        change: &SessionChange,
        entity: E,
        keep_metadata: bool,
    ) -> Result<RemoteApply, ListenerError> {
        let mut backoff = Backoff::default();
        for attempt in 1..=self.max_retries {
            let Some(local) = self.cache.get(&change.key).await? else {
                let wrapper = SessionEntityWrapper::with_version(entity.clone(), change.version);
                if self
                    .cache
                    .put_if_absent(&change.key, wrapper, self.lifespan)
                    .await?
                    .is_none()
                {
                    return Ok(RemoteApply::Created);
                }
                backoff.wait().await;
                continue;
            };

            if local.value.version >= change.version {
                trace!(
                    key = %change.key,
                    local = local.value.version,
                    remote = change.version,
                    "Ignoring stale remote change"
                );
                return Ok(RemoteApply::Stale);
            }

            let mut merged = SessionEntityWrapper::with_version(entity.clone(), change.version);
            if keep_metadata {
                merged.local_metadata = local.value.local_metadata.clone();
            }
            match self
                .cache
                .replace_if_version(&change.key, local.version, merged, self.lifespan)
                .await?
            {
                ReplaceOutcome::Replaced { .. } => return Ok(RemoteApply::Replaced),
                ReplaceOutcome::Missing | ReplaceOutcome::Conflict { .. } => {
                    debug!(key = %change.key, attempt, "Did not succeed in merging remote change, will try again");
                    backoff.wait().await;
                }
            }
        }

        warn!(
            cache = %self.cache.name(),
            key = %change.key,
            attempts = self.max_retries,
            "Dropping remote change after repeated conflicts"
        );
        Ok(RemoteApply::GaveUp)
    }

    fn decode(&self, change: &SessionChange) -> Result<E, ListenerError> {
        let value = change.entity.clone().ok_or_else(|| {
            ListenerError::Serialization(format!(
                "{} of '{}' carries no entity",
                change.operation, change.key
            ))
        })?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl<E: SessionEntity> ClusterListener for RemoteStoreListener<E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn event_received(&self, event: &ClusterEventEnvelope) -> Result<(), ListenerError> {
        if let ClusterEventPayload::SessionChanged(change) = &event.payload
            && change.cache_name == self.cache.name()
        {
            self.apply_change(change).await?;
        }
        Ok(())
    }
}
