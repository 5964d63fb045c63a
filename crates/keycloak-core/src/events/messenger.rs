//! Transport seam for cluster notifications.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::bus::ClusterEventBus;
use super::types::{ClusterEventEnvelope, DcNotify};
use crate::error::Result;

/// Sends events to other cluster members.
#[async_trait]
pub trait ClusterMessenger: Send + Sync {
    /// Delivers `event` to every member reached by `scope`.
    ///
    /// With `ignore_sender` the sending node does not receive its own event.
    async fn notify(
        &self,
        event_key: &str,
        event: &ClusterEventEnvelope,
        ignore_sender: bool,
        scope: DcNotify,
    ) -> Result<()>;
}

/// One delivery made by [`InMemoryClusterNetwork`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: String,
    pub to: String,
    pub event_id: Uuid,
    pub event_key: String,
    pub resend: bool,
}

struct Member {
    node: String,
    site: Option<String>,
    bus: Weak<ClusterEventBus>,
}

/// In-process network connecting several event buses.
///
/// Deliveries happen inline: `notify` returns after every reached bus has
/// dispatched the event. Each delivery is recorded for inspection.
#[derive(Default)]
pub struct InMemoryClusterNetwork {
    members: RwLock<Vec<Member>>,
    deliveries: Mutex<Vec<Delivery>>,
}

impl InMemoryClusterNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Messenger for a node that will be attached under `node`/`site`.
    pub fn messenger(
        self: &Arc<Self>,
        node: impl Into<String>,
        site: Option<String>,
    ) -> Arc<NetworkMessenger> {
        Arc::new(NetworkMessenger {
            network: Arc::clone(self),
            node: node.into(),
            site,
        })
    }

    /// Makes `bus` reachable under its topology identity.
    pub async fn attach(&self, bus: &Arc<ClusterEventBus>) {
        let node = bus.topology().my_node_name().to_string();
        let site = bus.topology().my_site_name().map(str::to_string);
        let mut members = self.members.write().await;
        members.retain(|m| m.node != node);
        debug!(node = %node, site = ?site, "Attached node to in-memory network");
        members.push(Member {
            node,
            site,
            bus: Arc::downgrade(bus),
        });
    }

    pub async fn detach(&self, node: &str) {
        self.members.write().await.retain(|m| m.node != node);
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().await.clone()
    }

    pub async fn clear_deliveries(&self) {
        self.deliveries.lock().await.clear();
    }

    async fn deliver(
        &self,
        from: &str,
        from_site: Option<&str>,
        event: &ClusterEventEnvelope,
        ignore_sender: bool,
        scope: DcNotify,
    ) {
        let targets: Vec<(String, Weak<ClusterEventBus>)> = self
            .members
            .read()
            .await
            .iter()
            .filter(|m| !(ignore_sender && m.node == from))
            .filter(|m| scope.reaches(from_site, m.site.as_deref()))
            .map(|m| (m.node.clone(), m.bus.clone()))
            .collect();

        for (node, bus) in targets {
            let Some(bus) = bus.upgrade() else {
                trace!(node = %node, "Skipping dropped node");
                continue;
            };
            self.deliveries.lock().await.push(Delivery {
                from: from.to_string(),
                to: node.clone(),
                event_id: event.id,
                event_key: event.event_key.clone(),
                resend: event.resend,
            });
            if let Err(e) = bus.dispatch(event.clone()).await {
                warn!(node = %node, event = %event.event_key, error = %e, "Remote dispatch failed");
            }
        }
    }
}

impl std::fmt::Debug for InMemoryClusterNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryClusterNetwork").finish_non_exhaustive()
    }
}

/// A node's handle on an [`InMemoryClusterNetwork`].
pub struct NetworkMessenger {
    network: Arc<InMemoryClusterNetwork>,
    node: String,
    site: Option<String>,
}

#[async_trait]
impl ClusterMessenger for NetworkMessenger {
    async fn notify(
        &self,
        event_key: &str,
        event: &ClusterEventEnvelope,
        ignore_sender: bool,
        scope: DcNotify,
    ) -> Result<()> {
        trace!(
            from = %self.node,
            event = %event_key,
            ?scope,
            ignore_sender,
            "Sending cluster event"
        );
        self.network
            .deliver(&self.node, self.site.as_deref(), event, ignore_sender, scope)
            .await;
        Ok(())
    }
}
