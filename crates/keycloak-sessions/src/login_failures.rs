//! Brute-force login failure tracking on top of the update pipeline.

use std::sync::Arc;

use keycloak_core::events::{ClusterEventBus, ClusterEventPayload, DcNotify};
use keycloak_core::SharedClock;
use tracing::debug;

use crate::entities::LoginFailureEntity;
use crate::error::SessionError;
use crate::pipeline::{SessionCacheUpdatePipeline, UpdateOutcome};
use crate::task::{LoginFailuresUpdateTask, UpdateTask};

pub struct LoginFailureProvider {
    pipeline: Arc<SessionCacheUpdatePipeline<LoginFailureEntity>>,
    bus: Arc<ClusterEventBus>,
    clock: SharedClock,
}

impl LoginFailureProvider {
    pub fn new(
        pipeline: Arc<SessionCacheUpdatePipeline<LoginFailureEntity>>,
        bus: Arc<ClusterEventBus>,
        clock: SharedClock,
    ) -> Self {
        Self {
            pipeline,
            bus,
            clock,
        }
    }

    pub async fn get(
        &self,
        realm_id: &str,
        user_id: &str,
    ) -> Result<Option<LoginFailureEntity>, SessionError> {
        let key = LoginFailureEntity::key_for(realm_id, user_id);
        Ok(self.pipeline.get(&key).await?.map(|w| w.entity))
    }

    /// Creates the record for a user unless one exists. Returns the stored record.
    pub async fn add(&self, realm_id: &str, user_id: &str) -> Result<LoginFailureEntity, SessionError> {
        let key = LoginFailureEntity::key_for(realm_id, user_id);
        self.pipeline
            .apply(
                &key,
                &UpdateTask::<LoginFailureEntity, _>::add_if_absent(),
                Some(LoginFailureEntity::new(realm_id, user_id)),
            )
            .await?;
        self.pipeline
            .get(&key)
            .await?
            .map(|w| w.entity)
            .ok_or_else(|| SessionError::invalid_state(key, "removed right after creation"))
    }

    /// Counts one failed login from `ip_address`.
    pub async fn record_failure(
        &self,
        realm_id: &str,
        user_id: &str,
        ip_address: Option<&str>,
    ) -> Result<UpdateOutcome, SessionError> {
        self.add(realm_id, user_id).await?;
        let now = self.clock.now_millis();
        let ip = ip_address.map(str::to_string);
        let task = LoginFailuresUpdateTask::new(move |entity: &mut LoginFailureEntity| {
            entity.increment_failures();
            entity.last_failure = now;
            entity.last_ip_failure = ip.clone();
        });
        self.pipeline
            .apply(&LoginFailureEntity::key_for(realm_id, user_id), &task, None)
            .await
    }

    /// Locks the user out until `not_before` (seconds since epoch).
    pub async fn lock_out(
        &self,
        realm_id: &str,
        user_id: &str,
        not_before: i64,
    ) -> Result<UpdateOutcome, SessionError> {
        let task = LoginFailuresUpdateTask::new(move |entity: &mut LoginFailureEntity| {
            entity.failed_login_not_before = not_before;
            entity.increment_temporary_lockouts();
        });
        self.pipeline
            .apply(&LoginFailureEntity::key_for(realm_id, user_id), &task, None)
            .await
    }

    pub async fn clear(&self, realm_id: &str, user_id: &str) -> Result<UpdateOutcome, SessionError> {
        let task = LoginFailuresUpdateTask::new(LoginFailureEntity::clear_failures);
        self.pipeline
            .apply(&LoginFailureEntity::key_for(realm_id, user_id), &task, None)
            .await
    }

    pub async fn remove(&self, realm_id: &str, user_id: &str) -> Result<UpdateOutcome, SessionError> {
        self.pipeline
            .apply(
                &LoginFailureEntity::key_for(realm_id, user_id),
                &UpdateTask::<LoginFailureEntity, _>::remove(),
                None,
            )
            .await
    }

    /// Removes every record of the realm on all nodes of all datacenters.
    pub async fn remove_all(&self, realm_id: &str) -> Result<(), SessionError> {
        let id = self
            .bus
            .publish(realm_id, ClusterEventPayload::RemoveAllLoginFailures, DcNotify::AllDcs)
            .await?;
        debug!(realm = %realm_id, event_id = %id, "Requested removal of all login failures");
        Ok(())
    }
}

impl std::fmt::Debug for LoginFailureProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginFailureProvider")
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}
