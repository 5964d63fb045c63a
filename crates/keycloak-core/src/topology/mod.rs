//! Node identity and key ownership.
//!
//! [`TopologyInfo`] is resolved once at startup and never changes. Placement
//! questions (who owns a key, how to route to it) are answered against a live
//! [`CacheTopology`] on every call.

mod membership;

pub use membership::{
    CacheTopology, ClusterMember, ClusterMembership, LocalTopology, NodeAddress,
    StaticClusterTopology, UNKNOWN_PHYSICAL_ADDRESS,
};

use std::fmt;

use keycloak_config::TopologyConfig;
use rand::Rng;
use tracing::{debug, warn};

/// Prefix of generated node names.
pub const GENERATED_NODE_PREFIX: &str = "node_";

/// Environment variable consulted for the transport-provided node name.
pub const NODE_NAME_ENV: &str = "KC_NODE_NAME";

/// Environment variable consulted for the transport-provided site name.
pub const SITE_NAME_ENV: &str = "KC_SITE_NAME";

/// Identity the transport layer reports for this process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportIdentity {
    pub node_name: Option<String>,
    pub site_name: Option<String>,
}

impl TransportIdentity {
    /// Reads `KC_NODE_NAME`/`KC_SITE_NAME`, falling back to the host name for
    /// the node.
    pub fn from_env() -> Self {
        let node_name = std::env::var(NODE_NAME_ENV)
            .ok()
            .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()));
        let site_name = std::env::var(SITE_NAME_ENV).ok();
        Self {
            node_name,
            site_name,
        }
    }
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// This node's name and site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyInfo {
    my_node_name: String,
    my_site_name: Option<String>,
    is_generated_node_name: bool,
}

impl TopologyInfo {
    /// Resolves identity: explicit configuration first, then the transport,
    /// then a generated `node_<n>` name. `"localhost"` from the transport
    /// counts as absent.
    pub fn resolve(config: &TopologyConfig, transport: &TransportIdentity) -> Self {
        let configured = non_blank(config.node_name.as_ref());
        let from_transport = non_blank(transport.node_name.as_ref())
            .filter(|name| !name.eq_ignore_ascii_case("localhost"));

        let (my_node_name, is_generated_node_name) = match configured.or(from_transport) {
            Some(name) => (name, false),
            None => {
                let n = rand::thread_rng().gen_range(0..1_000_000);
                (format!("{GENERATED_NODE_PREFIX}{n}"), true)
            }
        };

        let my_site_name =
            non_blank(config.site_name.as_ref()).or_else(|| non_blank(transport.site_name.as_ref()));

        if is_generated_node_name && config.clustered {
            warn!(
                node = %my_node_name,
                "Node name was not configured and is generated. Sticky sessions will not work in a cluster"
            );
        }
        debug!(node = %my_node_name, site = ?my_site_name, "Resolved node identity");

        Self {
            my_node_name,
            my_site_name,
            is_generated_node_name,
        }
    }

    /// Identity with an explicit node name.
    pub fn named(node_name: impl Into<String>, site_name: Option<String>) -> Self {
        Self {
            my_node_name: node_name.into(),
            my_site_name: site_name,
            is_generated_node_name: false,
        }
    }

    pub fn my_node_name(&self) -> &str {
        &self.my_node_name
    }

    pub fn my_site_name(&self) -> Option<&str> {
        self.my_site_name.as_deref()
    }

    pub fn is_generated_node_name(&self) -> bool {
        self.is_generated_node_name
    }

    fn owner_address(cache: &dyn CacheTopology, key: &str) -> Option<NodeAddress> {
        if cache.is_distributed() {
            cache.primary_owner(key)
        } else {
            cache.local_address()
        }
    }

    /// Whether this node is the primary owner of `key` in `cache`.
    ///
    /// Always true for caches without key distribution.
    pub fn is_primary_owner(&self, cache: &dyn CacheTopology, key: &str) -> bool {
        Self::owner_address(cache, key) == cache.local_address()
    }

    /// Name to embed in a sticky-session route for `key`.
    ///
    /// `None` when the node name was generated, since other nodes could never
    /// route back to it.
    pub fn route_name_for(&self, cache: &dyn CacheTopology, key: &str) -> Option<String> {
        if self.is_generated_node_name {
            if cache.is_clustered() {
                warn!(
                    node = %self.my_node_name,
                    "Sticky route requested while the node name is generated. Configure topology.node_name"
                );
            }
            return None;
        }

        if !cache.is_clustered() {
            return Some(self.my_node_name.clone());
        }

        let Some(owner) = Self::owner_address(cache, key) else {
            return Some(self.my_node_name.clone());
        };

        if let Some(name) = cache.logical_name(&owner) {
            return Some(name);
        }

        let physical = cache
            .physical_address(&owner)
            .unwrap_or(UNKNOWN_PHYSICAL_ADDRESS);
        Some(format!("{}:{}", physical.ip(), physical.port()))
    }
}

impl fmt::Display for TopologyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node name: {}", self.my_node_name)?;
        if let Some(site) = &self.my_site_name {
            write!(f, ", Site name: {site}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn config(node: Option<&str>, site: Option<&str>, clustered: bool) -> TopologyConfig {
        TopologyConfig {
            node_name: node.map(str::to_string),
            site_name: site.map(str::to_string),
            clustered,
        }
    }

    #[test]
    fn test_config_wins_over_transport() {
        let transport = TransportIdentity {
            node_name: Some("host-7".to_string()),
            site_name: Some("site-t".to_string()),
        };
        let info = TopologyInfo::resolve(&config(Some("node-1"), Some("site-a"), true), &transport);
        assert_eq!(info.my_node_name(), "node-1");
        assert_eq!(info.my_site_name(), Some("site-a"));
        assert!(!info.is_generated_node_name());
    }

    #[test]
    fn test_transport_used_when_not_configured() {
        let transport = TransportIdentity {
            node_name: Some("host-7".to_string()),
            site_name: Some("site-t".to_string()),
        };
        let info = TopologyInfo::resolve(&config(None, None, true), &transport);
        assert_eq!(info.my_node_name(), "host-7");
        assert_eq!(info.my_site_name(), Some("site-t"));
    }

    #[test]
    fn test_localhost_counts_as_absent() {
        let transport = TransportIdentity {
            node_name: Some("localhost".to_string()),
            site_name: None,
        };
        let info = TopologyInfo::resolve(&config(None, None, false), &transport);
        assert!(info.is_generated_node_name());
        let suffix = info
            .my_node_name()
            .strip_prefix(GENERATED_NODE_PREFIX)
            .unwrap();
        assert!(suffix.parse::<u32>().unwrap() < 1_000_000);
        assert_eq!(info.my_site_name(), None);
    }

    #[test]
    fn test_generated_name_has_no_route() {
        let info = TopologyInfo::resolve(&config(None, None, true), &TransportIdentity::default());
        assert!(info.is_generated_node_name());
        assert_eq!(info.route_name_for(&LocalTopology, "k"), None);

        let membership = ClusterMembership::shared(vec![ClusterMember::new("a")]);
        let cluster = StaticClusterTopology::new(NodeAddress::new("a"), membership);
        assert_eq!(info.route_name_for(&cluster, "k"), None);
    }

    #[test]
    fn test_local_mode_routes_to_self_and_owns_everything() {
        let info = TopologyInfo::named("node-1", None);
        assert_eq!(info.route_name_for(&LocalTopology, "k").as_deref(), Some("node-1"));
        assert!(info.is_primary_owner(&LocalTopology, "k"));
    }

    #[test]
    fn test_route_prefers_logical_then_physical_then_placeholder() {
        let physical: SocketAddr = "10.1.1.1:7600".parse().unwrap();
        let membership = ClusterMembership::shared(vec![
            ClusterMember::new("only").with_logical_name("node-x"),
        ]);
        let view = StaticClusterTopology::new(NodeAddress::new("only"), Arc::clone(&membership));
        let info = TopologyInfo::named("node-x", None);
        assert_eq!(info.route_name_for(&view, "k").as_deref(), Some("node-x"));

        membership.join(ClusterMember::new("only").with_physical_address(physical));
        assert_eq!(info.route_name_for(&view, "k").as_deref(), Some("10.1.1.1:7600"));

        membership.join(ClusterMember::new("only"));
        assert_eq!(info.route_name_for(&view, "k").as_deref(), Some("0.0.0.0:0"));
    }

    #[test]
    fn test_ownership_exclusive_across_nodes() {
        let membership = ClusterMembership::shared(vec![
            ClusterMember::new("a").with_logical_name("node-a"),
            ClusterMember::new("b").with_logical_name("node-b"),
        ]);
        let a = StaticClusterTopology::new(NodeAddress::new("a"), Arc::clone(&membership));
        let b = a.view_from(NodeAddress::new("b"));
        let info_a = TopologyInfo::named("node-a", None);
        let info_b = TopologyInfo::named("node-b", None);

        for i in 0..100 {
            let key = format!("user-session-{i}");
            assert_ne!(
                info_a.is_primary_owner(&a, &key),
                info_b.is_primary_owner(&b, &key)
            );
            assert_eq!(info_a.route_name_for(&a, &key), info_b.route_name_for(&b, &key));
        }
    }

    #[test]
    fn test_display() {
        let info = TopologyInfo::named("node-1", Some("site-a".to_string()));
        assert_eq!(info.to_string(), "Node name: node-1, Site name: site-a");
    }
}
