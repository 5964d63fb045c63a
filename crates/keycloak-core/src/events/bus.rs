//! Cluster event bus.
//!
//! Publishing hands an envelope to the [`ClusterMessenger`]; receiving nodes
//! call [`ClusterEventBus::dispatch`]. Dispatch runs the subscribed listeners
//! inside a unit of work and then, on the origin node only, forwards a
//! resend-eligible event once to the other datacenters.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::broadcaster::EventBroadcaster;
use super::listener::{ClusterListener, ListenerError, NoopUnitOfWork, UnitOfWork};
use super::messenger::ClusterMessenger;
use super::propagation::CrossDcPropagator;
use super::types::{
    ClusterEventEnvelope, ClusterEventPayload, ClusterEventType, DcNotify, SessionChange,
};
use crate::cluster::{ClusterTaskCoordinator, TaskCompletionNotifier};
use crate::error::{CoreError, Result};
use crate::topology::TopologyInfo;

/// Default timeout for a single listener call.
pub const DEFAULT_LISTENER_TIMEOUT: Duration = Duration::from_secs(30);

/// What happened while dispatching one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchOutcome {
    pub listeners_invoked: usize,
    pub resent: bool,
}

pub struct ClusterEventBus {
    topology: Arc<TopologyInfo>,
    messenger: Arc<dyn ClusterMessenger>,
    unit_of_work: Arc<dyn UnitOfWork>,
    listeners: RwLock<HashMap<ClusterEventType, Vec<Arc<dyn ClusterListener>>>>,
    broadcaster: EventBroadcaster,
    listener_timeout: Duration,
}

impl ClusterEventBus {
    pub fn new(topology: Arc<TopologyInfo>, messenger: Arc<dyn ClusterMessenger>) -> Self {
        Self {
            topology,
            messenger,
            unit_of_work: Arc::new(NoopUnitOfWork),
            listeners: RwLock::new(HashMap::new()),
            broadcaster: EventBroadcaster::new(),
            listener_timeout: DEFAULT_LISTENER_TIMEOUT,
        }
    }

    pub fn with_unit_of_work(mut self, unit_of_work: Arc<dyn UnitOfWork>) -> Self {
        self.unit_of_work = unit_of_work;
        self
    }

    pub fn with_listener_timeout(mut self, timeout: Duration) -> Self {
        self.listener_timeout = timeout;
        self
    }

    pub fn topology(&self) -> &Arc<TopologyInfo> {
        &self.topology
    }

    /// Local mirror of every successfully dispatched event.
    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    /// Registers `listener` for events of `event_type`.
    pub async fn subscribe(&self, event_type: ClusterEventType, listener: Arc<dyn ClusterListener>) {
        let name = listener.name().to_string();
        self.listeners
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push(listener);
        debug!(listener = %name, event = %event_type, "Registered cluster listener");
    }

    pub async fn listener_count(&self, event_type: ClusterEventType) -> usize {
        self.listeners
            .read()
            .await
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Publishes a realm-scoped event.
    ///
    /// With [`DcNotify::AllDcs`] on a node that belongs to a site, the event
    /// goes to the local datacenter marked resend-eligible, and this node
    /// forwards it to the other datacenters when it dispatches it.
    pub async fn publish(
        &self,
        realm_id: &str,
        payload: ClusterEventPayload,
        scope: DcNotify,
    ) -> Result<Uuid> {
        self.send(Some(realm_id.to_string()), payload, scope).await
    }

    /// Publishes a cluster-internal event that belongs to no realm.
    pub async fn publish_cluster(
        &self,
        payload: ClusterEventPayload,
        scope: DcNotify,
    ) -> Result<Uuid> {
        self.send(None, payload, scope).await
    }

    async fn send(
        &self,
        realm_id: Option<String>,
        payload: ClusterEventPayload,
        scope: DcNotify,
    ) -> Result<Uuid> {
        let site = self.topology.my_site_name().map(str::to_string);
        let (resend, target) = match scope {
            DcNotify::AllDcs if site.is_some() => (true, DcNotify::LocalDcOnly),
            other => (false, other),
        };
        let event = ClusterEventEnvelope::new(
            realm_id,
            payload,
            Some(self.topology.my_node_name().to_string()),
            site,
            resend,
        );
        debug!(
            event = %event.event_key,
            realm = ?event.realm_id,
            ?scope,
            resend,
            "Publishing cluster event"
        );
        self.messenger
            .notify(&event.event_key, &event, false, target)
            .await?;
        Ok(event.id)
    }

    /// Whether this node must forward `event` to the other datacenters.
    pub fn should_resend(&self, event: &ClusterEventEnvelope) -> bool {
        if !event.resend {
            return false;
        }
        match (&event.node_id, &event.site_id, self.topology.my_site_name()) {
            (Some(node), Some(site), Some(my_site)) => {
                node == self.topology.my_node_name() && site == my_site
            }
            _ => false,
        }
    }

    /// Handles an event received from the transport.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Listener` when a listener failed; the unit of work
    /// is rolled back and the event is not forwarded.
    pub async fn dispatch(&self, event: ClusterEventEnvelope) -> Result<DispatchOutcome> {
        let listeners = self
            .listeners
            .read()
            .await
            .get(&event.event_type())
            .cloned()
            .unwrap_or_default();

        let mut outcome = DispatchOutcome::default();

        if !listeners.is_empty() {
            let tx = self.unit_of_work.begin().await?;
            let mut failures = Vec::new();
            for listener in &listeners {
                outcome.listeners_invoked += 1;
                if let Err(message) = self.run_listener(listener.as_ref(), &event).await {
                    failures.push((listener.name().to_string(), message));
                }
            }

            if let Some((name, message)) = failures.into_iter().next() {
                if let Err(e) = tx.rollback().await {
                    error!(event = %event.event_key, error = %e, "Rollback failed");
                }
                return Err(CoreError::listener(name, message));
            }
            tx.commit().await?;
        }

        self.broadcaster.send(event.clone());

        if self.should_resend(&event) {
            debug!(
                event = %event.event_key,
                node = %self.topology.my_node_name(),
                "Forwarding event to other datacenters"
            );
            let copy = event.resent_copy();
            self.messenger
                .notify(&copy.event_key, &copy, true, DcNotify::AllButLocalDc)
                .await?;
            outcome.resent = true;
        }

        Ok(outcome)
    }

    async fn run_listener(
        &self,
        listener: &dyn ClusterListener,
        event: &ClusterEventEnvelope,
    ) -> std::result::Result<(), String> {
        let name = listener.name();
        let result = tokio::time::timeout(
            self.listener_timeout,
            AssertUnwindSafe(listener.event_received(event)).catch_unwind(),
        )
        .await;

        match result {
            Ok(Ok(Ok(()))) => {
                debug!(listener = %name, event = %event.event_key, "Listener executed successfully");
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                warn!(listener = %name, event = %event.event_key, error = %e, "Listener failed");
                Err(e.to_string())
            }
            Ok(Err(panic)) => {
                let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!(listener = %name, panic = %panic_msg, "Listener panicked!");
                Err(format!("panicked: {panic_msg}"))
            }
            Err(_) => {
                error!(
                    listener = %name,
                    timeout_secs = self.listener_timeout.as_secs(),
                    "Listener timed out"
                );
                Err("timed out".to_string())
            }
        }
    }
}

impl std::fmt::Debug for ClusterEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterEventBus")
            .field("node", &self.topology.my_node_name())
            .field("site", &self.topology.my_site_name())
            .field("listener_timeout", &self.listener_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CrossDcPropagator for ClusterEventBus {
    async fn propagate(&self, realm_id: &str, change: SessionChange) -> Result<()> {
        self.publish(
            realm_id,
            ClusterEventPayload::SessionChanged(change),
            DcNotify::AllButLocalDc,
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl TaskCompletionNotifier for ClusterEventBus {
    async fn task_completed(&self, task_key: &str, success: bool) -> Result<()> {
        self.publish_cluster(
            ClusterEventPayload::TaskCompleted {
                task_key: task_key.to_string(),
                success,
            },
            DcNotify::LocalDcOnly,
        )
        .await
        .map(|_| ())
    }
}

/// Forwards `TaskCompleted` events to the local coordinator.
pub struct TaskCompletionListener {
    coordinator: Arc<ClusterTaskCoordinator>,
}

impl TaskCompletionListener {
    pub fn new(coordinator: Arc<ClusterTaskCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl ClusterListener for TaskCompletionListener {
    fn name(&self) -> &str {
        "task-completion"
    }

    async fn event_received(
        &self,
        event: &ClusterEventEnvelope,
    ) -> std::result::Result<(), ListenerError> {
        if let ClusterEventPayload::TaskCompleted { task_key, success } = &event.payload {
            self.coordinator.on_task_completed(task_key, *success);
        }
        Ok(())
    }
}
