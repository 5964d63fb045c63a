//! # keycloak-server
//!
//! Process-level wiring of the cluster node: configuration loading, tracing
//! setup, provider selection and the housekeeping loop.

pub mod error;
pub mod observability;
pub mod registry;
pub mod runtime;

pub use error::RuntimeError;
pub use registry::{ProviderFactory, ProviderRegistry};
pub use runtime::{
    ClusterRuntime, HousekeepingReport, LOCAL_CACHE_BACKEND, PURGE_TASK_KEY, RuntimeBuilder,
    SessionCaches, WORK_CACHE,
};
