//! Cluster event system.
//!
//! This module provides the bus nodes use to tell each other about session
//! invalidations, realm and client removals, session cache changes for other
//! datacenters, and finished cluster tasks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  publish   ┌────────────────────┐  dispatch   ┌──────────────────┐
//! │  any caller  │ ─────────▶ │  ClusterMessenger  │ ──────────▶ │ ClusterEventBus  │
//! └──────────────┘            │  (DcNotify scope)  │             │  (every member)  │
//!                             └────────────────────┘             └────────┬─────────┘
//!                                       ▲                                 │
//!                                       │ origin node re-sends once       │ unit of work
//!                                       │ to ALL_BUT_LOCAL_DC             ▼
//!                                       └──────────────────────  ClusterListener(s)
//! ```

mod broadcaster;
mod bus;
mod listener;
mod messenger;
mod propagation;
mod types;

pub use broadcaster::EventBroadcaster;
pub use bus::{ClusterEventBus, DEFAULT_LISTENER_TIMEOUT, DispatchOutcome, TaskCompletionListener};
pub use listener::{ClusterListener, ListenerError, NoopUnitOfWork, Transaction, UnitOfWork};
pub use messenger::{ClusterMessenger, Delivery, InMemoryClusterNetwork, NetworkMessenger};
pub use propagation::{CrossDcPropagator, NoopPropagator};
pub use types::{
    ClusterEventEnvelope, ClusterEventPayload, ClusterEventType, DcNotify, SessionChange,
};
