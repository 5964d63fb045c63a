//! Local cleanup on bulk removal events.
//!
//! Removal events travel to every datacenter through the event bus, so each
//! node only clears its own cache here and never propagates the removals.

use std::marker::PhantomData;

use async_trait::async_trait;
use keycloak_core::cache::SharedCache;
use keycloak_core::events::{
    ClusterEventEnvelope, ClusterEventPayload, ClusterEventType, ClusterListener, ListenerError,
};
use tracing::debug;

use crate::entities::{EntityKind, SessionEntity};
use crate::wrapper::SessionEntityWrapper;

/// Event types a cache of kind `kind` reacts to.
pub fn cleanup_event_types(kind: EntityKind) -> &'static [ClusterEventType] {
    match kind {
        EntityKind::UserSession | EntityKind::ClientSession => &[
            ClusterEventType::RemoveUserSession,
            ClusterEventType::RemoveAllUserSessions,
            ClusterEventType::RealmRemoved,
            ClusterEventType::ClientRemoved,
        ],
        EntityKind::AuthenticationSession => &[
            ClusterEventType::RealmRemoved,
            ClusterEventType::ClientRemoved,
        ],
        EntityKind::LoginFailure => &[
            ClusterEventType::RemoveAllLoginFailures,
            ClusterEventType::RealmRemoved,
        ],
    }
}

pub struct SessionEventListener<E: SessionEntity> {
    name: String,
    cache: SharedCache<SessionEntityWrapper<E>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: SessionEntity> SessionEventListener<E> {
    pub fn new(cache: SharedCache<SessionEntityWrapper<E>>) -> Self {
        Self {
            name: format!("cleanup-{}", cache.name()),
            cache,
            _entity: PhantomData,
        }
    }

    /// Removes every local entry matched by `event`. Returns the count.
    pub async fn remove_matching(&self, event: &ClusterEventEnvelope) -> Result<usize, ListenerError> {
        if !cleanup_event_types(E::KIND).contains(&event.event_type()) {
            return Ok(0);
        }
        let Some(realm_id) = event.realm_id.as_deref() else {
            return Ok(0);
        };

        let matches = |entity: &E| -> bool {
            if entity.realm_id() != realm_id {
                return false;
            }
            match &event.payload {
                ClusterEventPayload::RemoveUserSession { user_session_id } => {
                    entity.user_session_id() == Some(user_session_id.as_str())
                }
                ClusterEventPayload::ClientRemoved { client_id } => {
                    entity.client_id() == Some(client_id.as_str())
                }
                ClusterEventPayload::RemoveAllUserSessions
                | ClusterEventPayload::RealmRemoved
                | ClusterEventPayload::RemoveAllLoginFailures => true,
                ClusterEventPayload::SessionChanged(_)
                | ClusterEventPayload::TaskCompleted { .. } => false,
            }
        };

        let mut removed = 0;
        for (key, entry) in self.cache.entries().await? {
            if matches(&entry.value.entity) && self.cache.remove(&key).await?.is_some() {
                removed += 1;
            }
        }

        debug!(
            cache = %self.cache.name(),
            event = %event.event_key,
            realm = %realm_id,
            removed,
            "Removed local session entries"
        );
        Ok(removed)
    }
}

#[async_trait]
impl<E: SessionEntity> ClusterListener for SessionEventListener<E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn event_received(&self, event: &ClusterEventEnvelope) -> Result<(), ListenerError> {
        self.remove_matching(event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{AuthenticatedClientSessionEntity, LoginFailureEntity, UserSessionEntity};
    use keycloak_core::{DistributedCache, InMemoryCache};
    use std::sync::Arc;

    fn event(realm: &str, payload: ClusterEventPayload) -> ClusterEventEnvelope {
        ClusterEventEnvelope::new(Some(realm.to_string()), payload, None, None, false)
    }

    #[tokio::test]
    async fn test_remove_user_session_targets_client_sessions() {
        let cache = Arc::new(InMemoryCache::new("clientSessions"));
        let keep = AuthenticatedClientSessionEntity::new("realm-1", "app", "us-2", 1);
        let drop_a = AuthenticatedClientSessionEntity::new("realm-1", "app", "us-1", 1);
        let drop_b = AuthenticatedClientSessionEntity::new("realm-1", "admin", "us-1", 1);
        for entity in [keep.clone(), drop_a, drop_b] {
            cache
                .put(&entity.key(), SessionEntityWrapper::new(entity), None)
                .await
                .unwrap();
        }

        let listener = SessionEventListener::new(cache.clone() as SharedCache<_>);
        let removed = listener
            .remove_matching(&event(
                "realm-1",
                ClusterEventPayload::RemoveUserSession {
                    user_session_id: "us-1".into(),
                },
            ))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(cache.get(&keep.key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_realm_removed_spares_other_realms() {
        let cache = Arc::new(InMemoryCache::new("sessions"));
        for (id, realm) in [("a", "realm-1"), ("b", "realm-1"), ("c", "realm-2")] {
            let entity = UserSessionEntity::new(id, realm, "user", "alice", 1);
            cache
                .put(id, SessionEntityWrapper::new(entity), None)
                .await
                .unwrap();
        }

        let listener = SessionEventListener::new(cache.clone() as SharedCache<_>);
        listener
            .event_received(&event("realm-1", ClusterEventPayload::RealmRemoved))
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_login_failures_ignore_user_session_events() {
        let cache = Arc::new(InMemoryCache::new("loginFailures"));
        let entity = LoginFailureEntity::new("realm-1", "user");
        cache
            .put(&entity.key(), SessionEntityWrapper::new(entity), None)
            .await
            .unwrap();

        let listener = SessionEventListener::new(cache.clone() as SharedCache<_>);
        let removed = listener
            .remove_matching(&event("realm-1", ClusterEventPayload::RemoveAllUserSessions))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        let removed = listener
            .remove_matching(&event("realm-1", ClusterEventPayload::RemoveAllLoginFailures))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(cache.is_empty());
    }
}
