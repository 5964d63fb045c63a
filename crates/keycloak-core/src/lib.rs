//! # keycloak-core
//!
//! Building blocks shared by every clustered component:
//!
//! - [`topology`]: node identity, key ownership and sticky-route names
//! - [`cache`]: versioned distributed cache abstraction and in-memory backend
//! - [`cluster`]: run-once-per-cluster task coordination
//! - [`events`]: cluster event bus with cross-datacenter re-send
//! - [`clock`]: wall-clock abstraction for deterministic tests

pub mod cache;
pub mod clock;
pub mod cluster;
pub mod error;
pub mod events;
pub mod topology;

pub use cache::{CacheEntry, CacheOperation, DistributedCache, InMemoryCache, ReplaceOutcome};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{CoreError, ErrorCategory, Result};
pub use topology::{CacheTopology, TopologyInfo, TransportIdentity};
