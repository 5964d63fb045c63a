//! Two datacenters with two nodes each, wired through the in-memory network.

use std::sync::Arc;

use keycloak_config::SessionsConfig;
use keycloak_core::cache::SharedCache;
use keycloak_core::events::{ClusterEventBus, InMemoryClusterNetwork};
use keycloak_core::topology::{ClusterMember, ClusterMembership, NodeAddress, StaticClusterTopology};
use keycloak_core::{DistributedCache, InMemoryCache, ManualClock, TopologyInfo};
use keycloak_sessions::{
    CrossDcMessageStatus, LoginFailureEntity, LoginFailureProvider, SessionCacheUpdatePipeline,
    SessionEntityWrapper, UpdateState, UpdateTask, UserSessionEntity, register_session_listeners,
};

type Wrapped<E> = SessionEntityWrapper<E>;

struct Node {
    topology: Arc<TopologyInfo>,
    bus: Arc<ClusterEventBus>,
    login_failures: SharedCache<Wrapped<LoginFailureEntity>>,
    sessions: SharedCache<Wrapped<UserSessionEntity>>,
}

impl Node {
    fn login_failure_pipeline(&self) -> Arc<SessionCacheUpdatePipeline<LoginFailureEntity>> {
        Arc::new(SessionCacheUpdatePipeline::new(
            self.login_failures.clone(),
            self.topology.clone(),
            self.bus.clone(),
            &SessionsConfig::default(),
        ))
    }

    fn session_pipeline(&self) -> SessionCacheUpdatePipeline<UserSessionEntity> {
        SessionCacheUpdatePipeline::new(
            self.sessions.clone(),
            self.topology.clone(),
            self.bus.clone(),
            &SessionsConfig::default(),
        )
    }
}

struct Site {
    login_failures: InMemoryCache<Wrapped<LoginFailureEntity>>,
    sessions: InMemoryCache<Wrapped<UserSessionEntity>>,
    nodes: Vec<Node>,
}

async fn site(network: &Arc<InMemoryClusterNetwork>, site_name: &str, nodes: &[&str]) -> Site {
    let membership = ClusterMembership::shared(nodes.iter().map(|n| ClusterMember::new(*n)).collect());
    let login_failures = InMemoryCache::new("loginFailures");
    let sessions = InMemoryCache::new("sessions");

    let mut built = Vec::new();
    for node in nodes {
        let cache_topology = Arc::new(StaticClusterTopology::new(
            NodeAddress::new(*node),
            membership.clone(),
        ));
        let topology = Arc::new(TopologyInfo::named(*node, Some(site_name.to_string())));
        let bus = Arc::new(ClusterEventBus::new(
            topology.clone(),
            network.messenger(*node, Some(site_name.to_string())),
        ));
        network.attach(&bus).await;

        let lf: SharedCache<_> = Arc::new(login_failures.view_with_topology(cache_topology.clone()));
        let us: SharedCache<_> = Arc::new(sessions.view_with_topology(cache_topology));
        register_session_listeners(&bus, lf.clone(), topology.clone()).await;
        register_session_listeners(&bus, us.clone(), topology.clone()).await;

        built.push(Node {
            topology,
            bus,
            login_failures: lf,
            sessions: us,
        });
    }

    Site {
        login_failures,
        sessions,
        nodes: built,
    }
}

#[tokio::test]
async fn login_failure_replicates_to_other_site() {
    let network = InMemoryClusterNetwork::new();
    let site_a = site(&network, "site-a", &["a1", "a2"]).await;
    let site_b = site(&network, "site-b", &["b1", "b2"]).await;

    let a1 = &site_a.nodes[0];
    let provider = LoginFailureProvider::new(
        a1.login_failure_pipeline(),
        a1.bus.clone(),
        ManualClock::shared(1_700_000_000),
    );

    let outcome = provider
        .record_failure("realm-1", "alice", Some("10.0.0.7"))
        .await
        .unwrap();
    assert_eq!(outcome.cross_dc, CrossDcMessageStatus::Sync);
    assert_eq!(outcome.final_state(), UpdateState::Done);
    assert!(outcome.states.contains(&UpdateState::Propagated));

    let key = LoginFailureEntity::key_for("realm-1", "alice");
    let remote = site_b.login_failures.get(&key).await.unwrap().unwrap().value;
    assert_eq!(remote.version, 2);
    assert_eq!(remote.entity.num_failures, 1);
    assert_eq!(remote.entity.last_ip_failure.as_deref(), Some("10.0.0.7"));
    assert_eq!(remote.entity.last_failure, 1_700_000_000_000);
}

#[tokio::test]
async fn remove_all_login_failures_clears_every_site() {
    let network = InMemoryClusterNetwork::new();
    let site_a = site(&network, "site-a", &["a1", "a2"]).await;
    let site_b = site(&network, "site-b", &["b1", "b2"]).await;

    let a2 = &site_a.nodes[1];
    let provider = LoginFailureProvider::new(
        a2.login_failure_pipeline(),
        a2.bus.clone(),
        ManualClock::shared(0),
    );
    for user in ["alice", "bob"] {
        provider.record_failure("realm-1", user, None).await.unwrap();
    }
    provider.record_failure("realm-2", "carol", None).await.unwrap();
    assert_eq!(site_b.login_failures.len(), 3);

    provider.remove_all("realm-1").await.unwrap();

    assert_eq!(site_a.login_failures.len(), 1);
    assert_eq!(site_b.login_failures.len(), 1);
    assert!(
        site_b
            .login_failures
            .get(&LoginFailureEntity::key_for("realm-2", "carol"))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn user_session_lifecycle_across_sites() {
    let network = InMemoryClusterNetwork::new();
    let site_a = site(&network, "site-a", &["a1", "a2"]).await;
    let site_b = site(&network, "site-b", &["b1", "b2"]).await;

    let pipeline = site_a.nodes[0].session_pipeline();
    let session = UserSessionEntity::new("us-1", "realm-1", "user-1", "alice", 100);
    pipeline
        .apply("us-1", &UpdateTask::<UserSessionEntity, _>::add(), Some(session))
        .await
        .unwrap();
    pipeline
        .apply(
            "us-1",
            &UpdateTask::replace(|s: &mut UserSessionEntity| s.last_session_refresh = 500),
            None,
        )
        .await
        .unwrap();

    let remote = site_b.sessions.get("us-1").await.unwrap().unwrap().value;
    assert_eq!(remote.version, 2);
    assert_eq!(remote.entity.last_session_refresh, 500);

    let outcome = pipeline
        .apply("us-1", &UpdateTask::<UserSessionEntity, _>::remove(), None)
        .await
        .unwrap();
    assert!(outcome.applied);
    assert!(site_a.sessions.is_empty());
    assert!(site_b.sessions.is_empty());
}

#[tokio::test]
async fn recreated_session_stays_in_sync_across_sites() {
    let network = InMemoryClusterNetwork::new();
    let site_a = site(&network, "site-a", &["a1", "a2"]).await;
    let site_b = site(&network, "site-b", &["b1", "b2"]).await;

    let pipeline = site_a.nodes[0].session_pipeline();
    let add = UpdateTask::<UserSessionEntity, _>::add();
    let refresh =
        |at: i64| UpdateTask::replace(move |s: &mut UserSessionEntity| s.last_session_refresh = at);

    let alice = UserSessionEntity::new("us-1", "realm-1", "user-1", "alice", 100);
    pipeline.apply("us-1", &add, Some(alice)).await.unwrap();
    pipeline.apply("us-1", &refresh(200), None).await.unwrap();
    pipeline.apply("us-1", &refresh(300), None).await.unwrap();

    let bob = UserSessionEntity::new("us-1", "realm-1", "user-2", "bob", 400);
    let recreated = pipeline.apply("us-1", &add, Some(bob)).await.unwrap();
    assert_eq!(recreated.version, Some(4));
    pipeline.apply("us-1", &refresh(500), None).await.unwrap();

    let local = site_a.sessions.get("us-1").await.unwrap().unwrap().value;
    let remote = site_b.sessions.get("us-1").await.unwrap().unwrap().value;
    assert_eq!(local.version, 5);
    assert_eq!(remote.version, 5);
    assert_eq!(remote.entity.login_username, "bob");
    assert_eq!(remote.entity.last_session_refresh, 500);
}

#[tokio::test]
async fn one_owner_applies_each_remote_change() {
    let network = InMemoryClusterNetwork::new();
    let site_a = site(&network, "site-a", &["a1", "a2"]).await;
    let site_b = site(&network, "site-b", &["b1", "b2"]).await;

    let pipeline = site_a.nodes[0].session_pipeline();
    for i in 0..20 {
        let id = format!("us-{i}");
        let session = UserSessionEntity::new(id.as_str(), "realm-1", "user-1", "alice", 1);
        pipeline
            .apply(&id, &UpdateTask::<UserSessionEntity, _>::add(), Some(session))
            .await
            .unwrap();
    }
    assert_eq!(site_b.sessions.len(), 20);

    let owned_by = |node: &Node| {
        (0..20)
            .filter(|i| node.topology.is_primary_owner(node.sessions.topology().as_ref(), &format!("us-{i}")))
            .count()
    };
    assert_eq!(owned_by(&site_b.nodes[0]) + owned_by(&site_b.nodes[1]), 20);
}
