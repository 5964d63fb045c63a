//! Runtime wiring.
//!
//! [`RuntimeBuilder`] threads one [`ClusterConfig`] through every
//! constructor:
//!
//! ```text
//! ClusterConfig ─┬─▶ TopologyInfo ──┬─▶ ClusterEventBus ─▶ listeners
//!                │                  ├─▶ ClusterTaskCoordinator
//!                │                  └─▶ session pipelines + LoginFailureProvider
//!                ├─▶ cache backend (ProviderRegistry) ─▶ caches
//!                └─▶ RemoteKeyLocator
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keycloak_config::ClusterConfig;
use keycloak_core::cache::SharedCache;
use keycloak_core::cluster::{ClusterTaskCoordinator, TaskLock};
use keycloak_core::events::{
    ClusterEventBus, ClusterEventType, ClusterMessenger, InMemoryClusterNetwork,
    TaskCompletionListener,
};
use keycloak_core::topology::LocalTopology;
use keycloak_core::{
    CacheTopology, InMemoryCache, SharedClock, TopologyInfo, TransportIdentity,
    clock,
};
use keycloak_keys::{DescriptorSource, RemoteKeyLocator, duration_secs};
use keycloak_sessions::{
    AuthenticatedClientSessionEntity, AuthenticationSessionEntity, LoginFailureEntity,
    LoginFailureProvider, SessionCacheUpdatePipeline, SessionEntity, SessionEntityWrapper,
    UserSessionEntity, register_session_listeners,
};
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::registry::ProviderRegistry;

/// Cache backend tag available out of the box.
pub const LOCAL_CACHE_BACKEND: &str = "local";

/// Task key of the periodic expired-entry purge.
pub const PURGE_TASK_KEY: &str = "housekeeping::purge-expired";

/// Work cache holding cluster task locks.
pub const WORK_CACHE: &str = "work";

type Purge = Box<dyn Fn() -> usize + Send + Sync>;

fn purger<V>(cache: SharedCache<V>) -> Purge
where
    V: Clone + Send + Sync + 'static,
{
    Box::new(move || cache.purge_expired())
}

pub struct RuntimeBuilder {
    config: ClusterConfig,
    transport: Option<TransportIdentity>,
    cache_backends: ProviderRegistry<Arc<dyn CacheTopology>>,
    messenger: Option<Arc<dyn ClusterMessenger>>,
    key_source: Option<Arc<dyn DescriptorSource>>,
    clock: SharedClock,
}

impl RuntimeBuilder {
    pub fn new(config: ClusterConfig) -> Self {
        let mut cache_backends = ProviderRegistry::new("cache backend");
        cache_backends.register(LOCAL_CACHE_BACKEND, |_: &ClusterConfig| {
            Ok(Arc::new(LocalTopology) as Arc<dyn CacheTopology>)
        });
        Self {
            config,
            transport: None,
            cache_backends,
            messenger: None,
            key_source: None,
            clock: clock::system_clock(),
        }
    }

    /// Node and site names reported by the transport. Read from the
    /// environment when not set.
    pub fn with_transport(mut self, transport: TransportIdentity) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Registers a cache backend under `tag`, selectable with
    /// `cluster.cache_backend`.
    pub fn with_cache_backend<F>(mut self, tag: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ClusterConfig) -> Result<Arc<dyn CacheTopology>, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        self.cache_backends.register(tag, factory);
        self
    }

    /// Messenger used by the event bus. Defaults to a private in-process
    /// network that only reaches this node.
    pub fn with_messenger(mut self, messenger: Arc<dyn ClusterMessenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    /// Overrides the HTTP descriptor source built from `key_locator.descriptor_url`.
    pub fn with_key_source(mut self, source: Arc<dyn DescriptorSource>) -> Self {
        self.key_source = Some(source);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn build(self) -> Result<ClusterRuntime, RuntimeError> {
        let config = self.config;
        config.validate()?;

        let transport = self.transport.unwrap_or_else(TransportIdentity::from_env);
        let topology = Arc::new(TopologyInfo::resolve(&config.topology, &transport));
        info!(topology = %topology, "Resolved node topology");

        let cache_topology = self
            .cache_backends
            .resolve(&config.cluster.cache_backend, &config)?;
        debug!(
            backend = %config.cluster.cache_backend,
            clustered = cache_topology.is_clustered(),
            "Cache backend selected"
        );

        let mut local_network = None;
        let messenger: Arc<dyn ClusterMessenger> = match self.messenger {
            Some(messenger) => messenger,
            None => {
                let network = InMemoryClusterNetwork::new();
                let messenger = network.messenger(
                    topology.my_node_name(),
                    topology.my_site_name().map(str::to_string),
                );
                local_network = Some(network);
                messenger as Arc<dyn ClusterMessenger>
            }
        };

        let bus = Arc::new(
            ClusterEventBus::new(topology.clone(), messenger)
                .with_listener_timeout(config.cluster.listener_timeout),
        );
        if let Some(network) = &local_network {
            network.attach(&bus).await;
        }

        let work_cache: SharedCache<TaskLock> = Arc::new(InMemoryCache::with_topology(
            WORK_CACHE,
            cache_topology.clone(),
        ));
        let coordinator = Arc::new(
            ClusterTaskCoordinator::new(topology.my_node_name(), work_cache.clone())
                .with_latch_timeout(config.cluster.task_latch_timeout)
                .with_notifier(bus.clone()),
        );
        bus.subscribe(
            ClusterEventType::TaskCompleted,
            Arc::new(TaskCompletionListener::new(coordinator.clone())),
        )
        .await;

        let mut purgers = vec![purger(work_cache)];
        let sessions =
            SessionCaches::wire(&config, &topology, &bus, &cache_topology, &mut purgers).await;

        let login_failures = Arc::new(LoginFailureProvider::new(
            sessions.login_failures.clone(),
            bus.clone(),
            self.clock.clone(),
        ));

        let key_locator = match self.key_source {
            Some(source) => RemoteKeyLocator::new(
                Some(source),
                duration_secs(config.key_locator.min_time_between_requests),
                duration_secs(config.key_locator.cache_ttl),
                self.clock.clone(),
            ),
            None => RemoteKeyLocator::from_config(&config.key_locator, self.clock.clone())?,
        };
        info!(locator = %key_locator, "Key locator ready");

        Ok(ClusterRuntime {
            config,
            topology,
            bus,
            coordinator,
            sessions,
            login_failures,
            key_locator: Arc::new(key_locator),
            purgers,
        })
    }
}

/// Update pipelines of the session caches.
pub struct SessionCaches {
    pub user_sessions: Arc<SessionCacheUpdatePipeline<UserSessionEntity>>,
    pub client_sessions: Arc<SessionCacheUpdatePipeline<AuthenticatedClientSessionEntity>>,
    pub authentication_sessions: Arc<SessionCacheUpdatePipeline<AuthenticationSessionEntity>>,
    pub login_failures: Arc<SessionCacheUpdatePipeline<LoginFailureEntity>>,
}

impl SessionCaches {
    async fn wire(
        config: &ClusterConfig,
        topology: &Arc<TopologyInfo>,
        bus: &Arc<ClusterEventBus>,
        cache_topology: &Arc<dyn CacheTopology>,
        purgers: &mut Vec<Purge>,
    ) -> Self {
        Self {
            user_sessions: Self::pipeline(config, topology, bus, cache_topology, purgers).await,
            client_sessions: Self::pipeline(config, topology, bus, cache_topology, purgers).await,
            authentication_sessions: Self::pipeline(config, topology, bus, cache_topology, purgers)
                .await,
            login_failures: Self::pipeline(config, topology, bus, cache_topology, purgers).await,
        }
    }

    async fn pipeline<E: SessionEntity>(
        config: &ClusterConfig,
        topology: &Arc<TopologyInfo>,
        bus: &Arc<ClusterEventBus>,
        cache_topology: &Arc<dyn CacheTopology>,
        purgers: &mut Vec<Purge>,
    ) -> Arc<SessionCacheUpdatePipeline<E>> {
        let cache: SharedCache<SessionEntityWrapper<E>> = Arc::new(InMemoryCache::with_topology(
            E::KIND.cache_name(),
            cache_topology.clone(),
        ));
        register_session_listeners(bus, cache.clone(), topology.clone()).await;
        purgers.push(purger(cache.clone()));
        Arc::new(SessionCacheUpdatePipeline::new(
            cache,
            topology.clone(),
            bus.clone(),
            &config.sessions,
        ))
    }
}

/// Outcome of one housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    /// `false` when another node held the purge task.
    pub executed: bool,
    pub purged: usize,
    pub keys: usize,
}

/// A fully wired cluster node.
pub struct ClusterRuntime {
    config: ClusterConfig,
    topology: Arc<TopologyInfo>,
    bus: Arc<ClusterEventBus>,
    coordinator: Arc<ClusterTaskCoordinator>,
    sessions: SessionCaches,
    login_failures: Arc<LoginFailureProvider>,
    key_locator: Arc<RemoteKeyLocator>,
    purgers: Vec<Purge>,
}

impl ClusterRuntime {
    pub fn builder(config: ClusterConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<TopologyInfo> {
        &self.topology
    }

    pub fn bus(&self) -> &Arc<ClusterEventBus> {
        &self.bus
    }

    pub fn coordinator(&self) -> &Arc<ClusterTaskCoordinator> {
        &self.coordinator
    }

    pub fn sessions(&self) -> &SessionCaches {
        &self.sessions
    }

    pub fn login_failures(&self) -> &Arc<LoginFailureProvider> {
        &self.login_failures
    }

    pub fn key_locator(&self) -> &Arc<RemoteKeyLocator> {
        &self.key_locator
    }

    /// Purges expired cache entries, at most once per cleanup interval
    /// cluster-wide, and lets the key locator refresh when its TTL elapsed.
    pub async fn run_housekeeping(&self) -> Result<HousekeepingReport, RuntimeError> {
        let window = self.config.sessions.cleanup_interval;
        let outcome = self
            .coordinator
            .execute_if_not_executed(PURGE_TASK_KEY, window, || async {
                self.purgers.iter().map(|purge| purge()).sum::<usize>()
            })
            .await?;

        let keys = self.key_locator.iter_keys().await.len();
        let report = HousekeepingReport {
            executed: outcome.is_executed(),
            purged: outcome.into_result().unwrap_or_default(),
            keys,
        };
        debug!(?report, "Housekeeping finished");
        Ok(report)
    }

    /// Runs housekeeping every `sessions.cleanup_interval` until `shutdown`
    /// resolves.
    pub async fn run<S>(&self, shutdown: S) -> Result<(), RuntimeError>
    where
        S: Future<Output = ()>,
    {
        let period = self.config.sessions.cleanup_interval.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            node = %self.topology.my_node_name(),
            site = ?self.topology.my_site_name(),
            interval_secs = period.as_secs(),
            "Cluster runtime started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping housekeeping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_housekeeping().await {
                        warn!(error = %e, "Housekeeping failed");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ClusterRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRuntime")
            .field("topology", &self.topology)
            .field("bus", &self.bus)
            .field("key_locator", &self.key_locator)
            .finish_non_exhaustive()
    }
}
