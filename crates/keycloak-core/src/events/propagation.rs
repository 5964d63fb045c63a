use async_trait::async_trait;

use super::types::SessionChange;
use crate::error::Result;

/// Ships session cache changes to the other datacenters.
///
/// Returning `Ok` means the remote side accepted the change.
#[async_trait]
pub trait CrossDcPropagator: Send + Sync {
    async fn propagate(&self, realm_id: &str, change: SessionChange) -> Result<()>;
}

/// Propagator for single-datacenter deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPropagator;

#[async_trait]
impl CrossDcPropagator for NoopPropagator {
    async fn propagate(&self, _realm_id: &str, _change: SessionChange) -> Result<()> {
        Ok(())
    }
}
