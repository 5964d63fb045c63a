//! Session cache update pipeline.
//!
//! Every change goes through [`SessionCacheUpdatePipeline::apply`]:
//!
//! ```text
//! Pending ──▶ Applied ──▶ [Propagated] ──▶ Done
//! ```
//!
//! `Applied` means the local cache holds the change. `Propagated` is only
//! reached for synchronous cross-DC changes once the other datacenters
//! acknowledged them.

use std::sync::Arc;
use std::time::Duration;

use keycloak_config::SessionsConfig;
use keycloak_core::cache::{CacheOperation, ReplaceOutcome, SharedCache};
use keycloak_core::events::{CrossDcPropagator, SessionChange};
use keycloak_core::{CacheEntry, TopologyInfo};
use tracing::{debug, trace, warn};

use crate::entities::SessionEntity;
use crate::error::SessionError;
use crate::retry::Backoff;
use crate::task::{CrossDcMessageStatus, SessionUpdateTask};
use crate::wrapper::SessionEntityWrapper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Pending,
    Applied,
    Propagated,
    Done,
}

/// What [`SessionCacheUpdatePipeline::apply`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub operation: CacheOperation,
    /// `false` when the cache already matched the request (existing entry on
    /// add-if-absent, absent entry on remove).
    pub applied: bool,
    /// Entity version after the operation, if an entity exists.
    pub version: Option<u64>,
    pub cross_dc: CrossDcMessageStatus,
    /// States passed through, in order.
    pub states: Vec<UpdateState>,
}

impl UpdateOutcome {
    pub fn final_state(&self) -> UpdateState {
        self.states.last().copied().unwrap_or(UpdateState::Pending)
    }

    fn unchanged(operation: CacheOperation, version: Option<u64>) -> Self {
        Self {
            operation,
            applied: false,
            version,
            cross_dc: CrossDcMessageStatus::NotNeeded,
            states: vec![UpdateState::Pending, UpdateState::Done],
        }
    }
}

pub struct SessionCacheUpdatePipeline<E: SessionEntity> {
    cache: SharedCache<SessionEntityWrapper<E>>,
    topology: Arc<TopologyInfo>,
    propagator: Arc<dyn CrossDcPropagator>,
    sync_timeout: Duration,
    max_retries: u32,
    lifespan: Option<Duration>,
}

impl<E: SessionEntity> SessionCacheUpdatePipeline<E> {
    pub fn new(
        cache: SharedCache<SessionEntityWrapper<E>>,
        topology: Arc<TopologyInfo>,
        propagator: Arc<dyn CrossDcPropagator>,
        config: &SessionsConfig,
    ) -> Self {
        Self {
            cache,
            topology,
            propagator,
            sync_timeout: config.sync_propagation_timeout,
            max_retries: config.max_replace_retries.max(1),
            lifespan: None,
        }
    }

    /// Lifespan applied to every write.
    pub fn with_lifespan(mut self, lifespan: Option<Duration>) -> Self {
        self.lifespan = lifespan;
        self
    }

    pub fn cache(&self) -> &SharedCache<SessionEntityWrapper<E>> {
        &self.cache
    }

    pub fn topology(&self) -> &Arc<TopologyInfo> {
        &self.topology
    }

    pub async fn get(&self, key: &str) -> Result<Option<SessionEntityWrapper<E>>, SessionError> {
        Ok(self.cache.get(key).await?.map(|e| e.value))
    }

    /// Whether this node owns `key` in the session cache.
    pub fn is_owner(&self, key: &str) -> bool {
        self.topology
            .is_primary_owner(self.cache.topology().as_ref(), key)
    }

    /// Sticky-session route for `key`.
    pub fn route_for(&self, key: &str) -> Option<String> {
        self.topology
            .route_name_for(self.cache.topology().as_ref(), key)
    }

    /// Applies `task` to the entry under `key`.
    ///
    /// `seed` is the entity to create for add operations.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` for a replace on a missing entry or an
    ///   add without `seed`
    /// - `SessionError::VersionConflict` when every retry lost a race
    /// - `SessionError::Propagation` when a synchronous cross-DC change was
    ///   not acknowledged; the local write is kept
    pub async fn apply(
        &self,
        key: &str,
        task: &dyn SessionUpdateTask<E>,
        seed: Option<E>,
    ) -> Result<UpdateOutcome, SessionError> {
        let existing = self.cache.get(key).await?;
        let operation = task.operation(existing.as_ref().map(|e| &e.value));
        trace!(cache = %self.cache.name(), key, %operation, "Applying session update");

        let (written, retried) = match operation {
            CacheOperation::Add | CacheOperation::AddIfAbsent => {
                let Some(mut entity) = seed else {
                    return Err(SessionError::invalid_state(
                        key,
                        format!("{operation} requires an entity"),
                    ));
                };
                task.run_update(&mut entity);
                if operation == CacheOperation::Add {
                    self.overwrite_with_retries(key, existing, entity).await?
                } else {
                    let wrapper = SessionEntityWrapper::new(entity);
                    if let Some(current) = self
                        .cache
                        .put_if_absent(key, wrapper.clone(), self.lifespan)
                        .await?
                    {
                        debug!(key, version = current.value.version, "Entry already present");
                        return Ok(UpdateOutcome::unchanged(
                            operation,
                            Some(current.value.version),
                        ));
                    }
                    (wrapper, false)
                }
            }
            CacheOperation::Replace => {
                let Some(current) = existing else {
                    return Err(SessionError::invalid_state(
                        key,
                        "REPLACE requires an existing entry",
                    ));
                };
                self.replace_with_retries(key, current, task).await?
            }
            CacheOperation::Remove => match self.cache.remove(key).await? {
                Some(removed) => (removed.value, false),
                None => return Ok(UpdateOutcome::unchanged(operation, None)),
            },
        };

        let mut states = vec![UpdateState::Pending, UpdateState::Applied];
        let version = written.version;

        let mut cross_dc = task.cross_dc_status(&written);
        if cross_dc != CrossDcMessageStatus::NotNeeded && self.topology.my_site_name().is_none() {
            trace!(key, "No site configured, keeping change local");
            cross_dc = CrossDcMessageStatus::NotNeeded;
        }

        if cross_dc != CrossDcMessageStatus::NotNeeded {
            let change = SessionChange {
                cache_name: self.cache.name().to_string(),
                key: key.to_string(),
                operation,
                version,
                entity: match operation {
                    CacheOperation::Remove => None,
                    _ => Some(serde_json::to_value(&written.entity)?),
                },
                command_retried: retried,
            };
            let realm_id = written.realm_id().to_string();

            if cross_dc == CrossDcMessageStatus::Sync {
                self.propagate_sync(&realm_id, change).await?;
                states.push(UpdateState::Propagated);
            } else {
                let propagator = Arc::clone(&self.propagator);
                tokio::spawn(async move {
                    let key = change.key.clone();
                    if let Err(e) = propagator.propagate(&realm_id, change).await {
                        warn!(key = %key, error = %e, "Asynchronous cross-DC propagation failed");
                    }
                });
            }
        }

        states.push(UpdateState::Done);
        Ok(UpdateOutcome {
            operation,
            applied: true,
            version: match operation {
                CacheOperation::Remove => None,
                _ => Some(version),
            },
            cross_dc,
            states,
        })
    }

    /// Writes `entity` as a fresh entry. Over an existing entry the version
    /// continues from the stored one, so remote sites never see it go back.
    async fn overwrite_with_retries(
        &self,
        key: &str,
        mut current: Option<CacheEntry<SessionEntityWrapper<E>>>,
        entity: E,
    ) -> Result<(SessionEntityWrapper<E>, bool), SessionError> {
        let mut backoff = Backoff::default();
        for attempt in 1..=self.max_retries {
            let retried = attempt > 1;
            match current.take() {
                None => {
                    let wrapper = SessionEntityWrapper::new(entity.clone());
                    match self
                        .cache
                        .put_if_absent(key, wrapper.clone(), self.lifespan)
                        .await?
                    {
                        None => return Ok((wrapper, retried)),
                        Some(found) => current = Some(found),
                    }
                }
                Some(found) => {
                    let wrapper =
                        SessionEntityWrapper::with_version(entity.clone(), found.value.version + 1);
                    match self
                        .cache
                        .replace_if_version(key, found.version, wrapper.clone(), self.lifespan)
                        .await?
                    {
                        ReplaceOutcome::Replaced { .. } => return Ok((wrapper, retried)),
                        ReplaceOutcome::Missing => {}
                        ReplaceOutcome::Conflict { .. } => {
                            backoff.wait().await;
                            current = self.cache.get(key).await?;
                        }
                    }
                }
            }
            debug!(key, attempt, "ADD raced with another write, retrying");
        }
        warn!(key, attempts = self.max_retries, "Giving up on ADD");
        Err(SessionError::VersionConflict {
            key: key.to_string(),
            attempts: self.max_retries,
        })
    }

    async fn replace_with_retries(
        &self,
        key: &str,
        mut current: CacheEntry<SessionEntityWrapper<E>>,
        task: &dyn SessionUpdateTask<E>,
    ) -> Result<(SessionEntityWrapper<E>, bool), SessionError> {
        let mut backoff = Backoff::default();
        for attempt in 1..=self.max_retries {
            let mut entity = current.value.entity.clone();
            task.run_update(&mut entity);
            let next = current.value.next(entity);

            match self
                .cache
                .replace_if_version(key, current.version, next.clone(), self.lifespan)
                .await?
            {
                ReplaceOutcome::Replaced { .. } => return Ok((next, attempt > 1)),
                ReplaceOutcome::Missing => {
                    return Err(SessionError::invalid_state(
                        key,
                        "entry removed during REPLACE",
                    ));
                }
                ReplaceOutcome::Conflict { current: actual } => {
                    debug!(
                        key,
                        attempt,
                        expected = current.version,
                        actual,
                        "Concurrent write detected, retrying"
                    );
                    backoff.wait().await;
                    current = self.cache.get(key).await?.ok_or_else(|| {
                        SessionError::invalid_state(key, "entry removed during REPLACE")
                    })?;
                }
            }
        }
        warn!(key, attempts = self.max_retries, "Giving up on REPLACE");
        Err(SessionError::VersionConflict {
            key: key.to_string(),
            attempts: self.max_retries,
        })
    }

    async fn propagate_sync(&self, realm_id: &str, change: SessionChange) -> Result<(), SessionError> {
        let key = change.key.clone();
        let version = change.version;
        match tokio::time::timeout(self.sync_timeout, self.propagator.propagate(realm_id, change))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::Propagation {
                key,
                version,
                message: e.to_string(),
            }),
            Err(_) => Err(SessionError::Propagation {
                key,
                version,
                message: format!(
                    "no acknowledgement within {}ms",
                    self.sync_timeout.as_millis()
                ),
            }),
        }
    }
}

impl<E: SessionEntity> std::fmt::Debug for SessionCacheUpdatePipeline<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCacheUpdatePipeline")
            .field("cache", &self.cache.name())
            .field("sync_timeout", &self.sync_timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
