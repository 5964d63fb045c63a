//! Local mirror of dispatched cluster events.
//!
//! Every event a node dispatches successfully is also broadcast on a tokio
//! broadcast channel so in-process observers (admin tooling, tests) can watch
//! cluster traffic without registering a transactional listener.

use tokio::sync::broadcast;

use super::types::ClusterEventEnvelope;

/// Events kept for a lagging receiver before the oldest are dropped.
const MIRROR_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<ClusterEventEnvelope>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::bounded(MIRROR_CAPACITY)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    /// Mirrors `event` to current receivers and returns how many got it.
    pub fn send(&self, event: ClusterEventEnvelope) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => 0,
        }
    }

    /// Receiver for events dispatched from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEventEnvelope> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventBroadcaster({} receivers)", self.receiver_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::ClusterEventPayload;

    fn event() -> ClusterEventEnvelope {
        ClusterEventEnvelope::new(
            Some("realm".into()),
            ClusterEventPayload::RemoveAllLoginFailures,
            None,
            None,
            false,
        )
    }

    #[tokio::test]
    async fn test_every_receiver_sees_the_event() {
        let mirror = EventBroadcaster::bounded(4);
        let mut first = mirror.subscribe();
        let mut second = mirror.subscribe();
        assert_eq!(mirror.receiver_count(), 2);

        let sent = event();
        assert_eq!(mirror.send(sent.clone()), 2);
        assert_eq!(first.recv().await.unwrap().id, sent.id);
        assert_eq!(second.recv().await.unwrap().id, sent.id);
    }

    #[test]
    fn test_nobody_listening() {
        assert_eq!(EventBroadcaster::default().send(event()), 0);
    }
}
