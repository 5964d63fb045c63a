//! Cache-level topology: who is in the cluster and who owns which key.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque transport address of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Physical address reported when neither a logical name nor a physical
/// address is known for an owner.
pub const UNKNOWN_PHYSICAL_ADDRESS: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

/// Live view of a cache's placement.
///
/// Implementations are queried on every call, never cached by callers,
/// because membership can change between two lookups.
pub trait CacheTopology: Send + Sync + fmt::Debug {
    /// Whether the cache runs in a clustered mode at all.
    fn is_clustered(&self) -> bool;

    /// Whether keys are partitioned between members (a distribution manager
    /// exists). Replicated or local caches return `false`.
    fn is_distributed(&self) -> bool {
        self.is_clustered()
    }

    /// Address of this member. `None` in local mode.
    fn local_address(&self) -> Option<NodeAddress>;

    /// Primary owner of `key` under the current membership.
    fn primary_owner(&self, key: &str) -> Option<NodeAddress>;

    /// Logical name the transport knows for `address`.
    fn logical_name(&self, address: &NodeAddress) -> Option<String>;

    /// Physical socket address of `address`.
    fn physical_address(&self, address: &NodeAddress) -> Option<SocketAddr>;

    /// Current members.
    fn members(&self) -> Vec<NodeAddress>;
}

/// Topology of a non-clustered cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTopology;

impl CacheTopology for LocalTopology {
    fn is_clustered(&self) -> bool {
        false
    }

    fn local_address(&self) -> Option<NodeAddress> {
        None
    }

    fn primary_owner(&self, _key: &str) -> Option<NodeAddress> {
        None
    }

    fn logical_name(&self, _address: &NodeAddress) -> Option<String> {
        None
    }

    fn physical_address(&self, _address: &NodeAddress) -> Option<SocketAddr> {
        None
    }

    fn members(&self) -> Vec<NodeAddress> {
        Vec::new()
    }
}

/// A member as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    pub address: NodeAddress,
    pub logical_name: Option<String>,
    pub physical_address: Option<SocketAddr>,
}

impl ClusterMember {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: NodeAddress::new(address),
            logical_name: None,
            physical_address: None,
        }
    }

    pub fn with_logical_name(mut self, name: impl Into<String>) -> Self {
        self.logical_name = Some(name.into());
        self
    }

    pub fn with_physical_address(mut self, addr: SocketAddr) -> Self {
        self.physical_address = Some(addr);
        self
    }
}

/// Membership list shared by every node view of one simulated cluster.
///
/// Readers get a consistent snapshot; joins and leaves swap the whole list.
#[derive(Debug, Default)]
pub struct ClusterMembership {
    members: ArcSwap<Vec<ClusterMember>>,
}

impl ClusterMembership {
    pub fn new(members: Vec<ClusterMember>) -> Self {
        Self {
            members: ArcSwap::from_pointee(members),
        }
    }

    pub fn shared(members: Vec<ClusterMember>) -> Arc<Self> {
        Arc::new(Self::new(members))
    }

    pub fn snapshot(&self) -> Arc<Vec<ClusterMember>> {
        self.members.load_full()
    }

    /// Adds or replaces a member.
    pub fn join(&self, member: ClusterMember) {
        self.members.rcu(|current| {
            let mut next: Vec<ClusterMember> = current
                .iter()
                .filter(|m| m.address != member.address)
                .cloned()
                .collect();
            next.push(member.clone());
            next
        });
    }

    pub fn leave(&self, address: &NodeAddress) {
        self.members.rcu(|current| {
            current
                .iter()
                .filter(|m| &m.address != address)
                .cloned()
                .collect::<Vec<_>>()
        });
    }
}

/// Distributed topology with rendezvous-hash ownership.
///
/// Every view over the same [`ClusterMembership`] computes the same owner
/// for a key, regardless of which member asks.
#[derive(Debug, Clone)]
pub struct StaticClusterTopology {
    local: NodeAddress,
    membership: Arc<ClusterMembership>,
}

impl StaticClusterTopology {
    pub fn new(local: NodeAddress, membership: Arc<ClusterMembership>) -> Self {
        Self { local, membership }
    }

    /// View of the same cluster from another member.
    pub fn view_from(&self, local: NodeAddress) -> Self {
        Self {
            local,
            membership: Arc::clone(&self.membership),
        }
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    fn find(&self, address: &NodeAddress) -> Option<ClusterMember> {
        self.membership
            .snapshot()
            .iter()
            .find(|m| &m.address == address)
            .cloned()
    }
}

fn rendezvous_weight(key: &str, address: &NodeAddress) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update(address.as_str().as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

impl CacheTopology for StaticClusterTopology {
    fn is_clustered(&self) -> bool {
        true
    }

    fn local_address(&self) -> Option<NodeAddress> {
        Some(self.local.clone())
    }

    fn primary_owner(&self, key: &str) -> Option<NodeAddress> {
        self.membership
            .snapshot()
            .iter()
            .map(|m| (rendezvous_weight(key, &m.address), &m.address))
            .max()
            .map(|(_, address)| address.clone())
    }

    fn logical_name(&self, address: &NodeAddress) -> Option<String> {
        self.find(address).and_then(|m| m.logical_name)
    }

    fn physical_address(&self, address: &NodeAddress) -> Option<SocketAddr> {
        self.find(address).and_then(|m| m.physical_address)
    }

    fn members(&self) -> Vec<NodeAddress> {
        self.membership
            .snapshot()
            .iter()
            .map(|m| m.address.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> Arc<ClusterMembership> {
        ClusterMembership::shared(vec![
            ClusterMember::new("10.0.0.1:7800").with_logical_name("node-a"),
            ClusterMember::new("10.0.0.2:7800").with_logical_name("node-b"),
            ClusterMember::new("10.0.0.3:7800").with_logical_name("node-c"),
        ])
    }

    #[test]
    fn test_every_key_has_exactly_one_owner() {
        let membership = three_nodes();
        let views: Vec<StaticClusterTopology> = membership
            .snapshot()
            .iter()
            .map(|m| StaticClusterTopology::new(m.address.clone(), Arc::clone(&membership)))
            .collect();

        for i in 0..200 {
            let key = format!("session-{i}");
            let owners: Vec<_> = views.iter().map(|v| v.primary_owner(&key)).collect();
            assert!(owners.windows(2).all(|w| w[0] == w[1]), "views disagree on {key}");

            let self_owned = views
                .iter()
                .filter(|v| v.primary_owner(&key) == v.local_address())
                .count();
            assert_eq!(self_owned, 1);
        }
    }

    #[test]
    fn test_leave_moves_ownership_to_remaining_members() {
        let membership = three_nodes();
        let view = StaticClusterTopology::new(NodeAddress::new("10.0.0.1:7800"), membership);
        let leaving = NodeAddress::new("10.0.0.2:7800");

        view.membership().leave(&leaving);
        assert_eq!(view.members().len(), 2);
        for i in 0..50 {
            let owner = view.primary_owner(&format!("k{i}")).unwrap();
            assert_ne!(owner, leaving);
        }
        assert_eq!(view.logical_name(&leaving), None);
    }

    #[test]
    fn test_join_replaces_existing_member() {
        let membership = three_nodes();
        membership.join(ClusterMember::new("10.0.0.3:7800").with_logical_name("node-c2"));
        let snapshot = membership.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(
            snapshot
                .iter()
                .any(|m| m.logical_name.as_deref() == Some("node-c2"))
        );
    }

    #[test]
    fn test_local_topology() {
        let local = LocalTopology;
        assert!(!local.is_clustered());
        assert!(!local.is_distributed());
        assert_eq!(local.primary_owner("any"), None);
        assert!(local.members().is_empty());
    }
}
