//! # keycloak-sessions
//!
//! Versioned session entities and the pipeline that writes them:
//!
//! - [`pipeline`]: local write with compare-and-swap retries, then cross-DC propagation
//! - [`remote_listener`]: applies changes arriving from other datacenters
//! - [`cleanup`]: local removal on bulk events (realm removed, logout all, ...)
//! - [`login_failures`]: brute-force counters built on the pipeline

pub mod cleanup;
pub mod entities;
pub mod error;
pub mod login_failures;
pub mod pipeline;
pub mod remote_listener;
pub mod retry;
pub mod task;
pub mod wrapper;

use std::sync::Arc;

use keycloak_core::TopologyInfo;
use keycloak_core::cache::SharedCache;
use keycloak_core::events::{ClusterEventBus, ClusterEventType};

pub use cleanup::SessionEventListener;
pub use entities::{
    AuthenticatedClientSessionEntity, AuthenticationSessionEntity, EntityKind, LoginFailureEntity,
    SessionEntity, UserSessionEntity, UserSessionState,
};
pub use error::SessionError;
pub use login_failures::LoginFailureProvider;
pub use pipeline::{SessionCacheUpdatePipeline, UpdateOutcome, UpdateState};
pub use remote_listener::{RemoteApply, RemoteStoreListener};
pub use task::{CrossDcMessageStatus, LoginFailuresUpdateTask, SessionUpdateTask, UpdateTask};
pub use wrapper::SessionEntityWrapper;

/// Subscribes the remote-change and cleanup listeners of one session cache.
pub async fn register_session_listeners<E: SessionEntity>(
    bus: &ClusterEventBus,
    cache: SharedCache<SessionEntityWrapper<E>>,
    topology: Arc<TopologyInfo>,
) {
    bus.subscribe(
        ClusterEventType::SessionChanged,
        Arc::new(RemoteStoreListener::new(cache.clone(), topology)),
    )
    .await;

    let cleanup = Arc::new(SessionEventListener::new(cache));
    for event_type in cleanup::cleanup_event_types(E::KIND) {
        bus.subscribe(*event_type, cleanup.clone()).await;
    }
}
