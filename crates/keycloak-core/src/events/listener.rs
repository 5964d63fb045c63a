//! Listener and unit-of-work traits for cluster events.
//!
//! Listeners run on the receiving node inside a unit of work:
//! - **Transactional**: committed when every listener succeeds, rolled back otherwise
//! - **Isolated**: a failing or panicking listener does not stop the others
//! - **Bounded**: each call is timeout-protected

use async_trait::async_trait;

use super::types::ClusterEventEnvelope;
use crate::error::Result;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Listener execution failed with a message.
    #[error("Listener execution failed: {0}")]
    Execution(String),

    /// Listener failed while touching a cache.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Listener could not decode the payload.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error with source.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ListenerError {
    pub fn execution(msg: impl Into<String>) -> Self {
        ListenerError::Execution(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        ListenerError::Cache(msg.into())
    }
}

impl From<crate::error::CoreError> for ListenerError {
    fn from(err: crate::error::CoreError) -> Self {
        ListenerError::Cache(err.to_string())
    }
}

impl From<serde_json::Error> for ListenerError {
    fn from(err: serde_json::Error) -> Self {
        ListenerError::Serialization(err.to_string())
    }
}

/// Handler for cluster events of the types it was subscribed to.
///
/// # Implementation Notes
///
/// - Handlers run sequentially for one event, inside one unit of work
/// - Returning an error rolls the unit of work back and suppresses the
///   cross-datacenter re-send of that event
#[async_trait]
pub trait ClusterListener: Send + Sync {
    /// Unique name for this listener (for logging).
    fn name(&self) -> &str;

    async fn event_received(&self, event: &ClusterEventEnvelope) -> Result<(), ListenerError>;
}

/// Transaction boundary around listener execution.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// An open unit of work.
///
/// After commit or rollback the transaction is consumed.
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Unit of work for listeners that only touch caches.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUnitOfWork;

struct NoopTransaction;

#[async_trait]
impl Transaction for NoopTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for NoopUnitOfWork {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(NoopTransaction))
    }
}
