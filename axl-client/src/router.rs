//! Topology tracking and node selection.
//!
//! [`EndpointRouter`] owns the published [`Topology`] snapshot. Two background
//! loops maintain it: the refresh loop asks one node (or a discovery endpoint)
//! to describe the cluster and swaps in the next generation, and the health
//! loop pings every node concurrently and updates per-node health in place.
//! Routing queries only read the snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axl_core::{ClusterMember, Endpoint};
use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::error::{ClientError, Result, RouteKind};
use crate::pool::NodeClientFactory;
use crate::topology::{HealthStatus, Node, Topology, TopologyUpdate};

/// Routing seam between the cluster facade and topology tracking
pub trait Router: Send + Sync {
    /// Start the router's background loops; each exits when `shutdown` fires
    fn spawn(self: Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>>;

    /// Any node, preferring healthy ones, never `exclude` unless it is the only one
    fn next_any(&self, exclude: Option<&Endpoint>) -> Result<Node>;

    /// The current leader
    fn next_leader(&self, exclude: Option<&Endpoint>) -> Result<Node>;

    /// The current topology snapshot
    fn snapshot(&self) -> Arc<Topology>;

    /// `(healthy nodes, healthy leaders)` in the current snapshot
    fn route_counts(&self) -> (usize, usize) {
        let topology = self.snapshot();
        (topology.healthy_count(), topology.healthy_leader_count())
    }

    fn has_routes(&self, min_healthy: usize, leader_min: usize) -> bool {
        let (healthy, leaders) = self.route_counts();
        healthy >= min_healthy && leaders >= leader_min
    }
}

/// Everything a router needs, handed to a [`RouterFactory`]
#[derive(Clone)]
pub struct RouterContext {
    pub seeds: Vec<Endpoint>,
    pub factory: Arc<NodeClientFactory>,
    pub config: RouterConfig,
}

/// Builds the router used by a cluster client
pub type RouterFactory = Arc<dyn Fn(RouterContext) -> Arc<dyn Router> + Send + Sync>;

/// Router loop timing and thresholds
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub refresh_interval: Duration,
    pub health_check_interval: Duration,
    /// Consecutive failed health checks before a node is unhealthy
    pub failure_threshold: u32,
    /// Consecutive omitting refreshes before a node is removed
    pub removal_threshold: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(4),
            health_check_interval: Duration::from_secs(5),
            failure_threshold: 3,
            removal_threshold: 3,
        }
    }
}

/// Default router: seeds for bootstrap, then self-discovery through live nodes
pub struct EndpointRouter {
    seeds: Vec<Endpoint>,
    factory: Arc<NodeClientFactory>,
    config: RouterConfig,
    topology: watch::Sender<Arc<Topology>>,
    seed_cursor: AtomicUsize,
}

impl EndpointRouter {
    pub fn new(ctx: RouterContext) -> Self {
        let (topology, _) = watch::channel(Arc::new(Topology::empty()));
        Self {
            seeds: ctx.seeds,
            factory: ctx.factory,
            config: ctx.config,
            topology,
            seed_cursor: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn seeds(&self) -> &[Endpoint] {
        &self.seeds
    }

    /// Watch topology swaps
    pub fn subscribe(&self) -> watch::Receiver<Arc<Topology>> {
        self.topology.subscribe()
    }

    /// Ask one node to describe the cluster and publish the next generation
    ///
    /// On any failure the published topology is left untouched.
    ///
    /// # Errors
    /// Returns the describe error, or [`ClientError::InvalidResponse`] for an
    /// empty member list.
    pub async fn refresh(&self) -> Result<u64> {
        let current = self.snapshot();
        let source = self.refresh_source(&current)?;

        let members = match self.describe(&source).await {
            Ok(members) => members,
            Err(e) => {
                // A node that cannot be reached counts as one failed check
                if counts_against_node(&e) {
                    if let Some(node) = current.get(&source) {
                        node.record_failure(self.config.failure_threshold);
                    }
                }
                return Err(e);
            },
        };

        if members.is_empty() {
            return Err(ClientError::InvalidResponse(format!(
                "{} described an empty cluster",
                source
            )));
        }

        let mut generation = 0;
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut demoted = Vec::new();
        self.topology.send_modify(|topology| {
            let TopologyUpdate {
                topology: next,
                added: a,
                removed: r,
                demoted: d,
            } = topology.merge(&members, self.config.removal_threshold);
            generation = next.generation();
            added = a;
            removed = r;
            demoted = d;
            *topology = Arc::new(next);
        });

        for endpoint in &demoted {
            warn!(
                target: "axl::router",
                endpoint = %endpoint,
                source = %source,
                "Multiple leaders described, demoting to replica"
            );
        }

        if added.is_empty() && removed.is_empty() {
            debug!(target: "axl::router", generation, source = %source, "Topology refreshed");
        } else {
            info!(
                target: "axl::router",
                generation,
                source = %source,
                added = added.len(),
                removed = removed.len(),
                "Topology changed"
            );
        }

        for endpoint in &removed {
            info!(target: "axl::router", endpoint = %endpoint, "Node removed from topology");
            self.factory.remove(endpoint).await;
        }

        if !added.is_empty() {
            // Probe new candidates now rather than on the next health tick
            let topology = self.snapshot();
            let candidates: Vec<&Node> = added.iter().filter_map(|ep| topology.get(ep)).collect();
            join_all(candidates.into_iter().map(|node| self.check_node(node))).await;
        }

        Ok(generation)
    }

    /// Ping every node in the current snapshot concurrently, then drop pools
    /// of nodes that are no longer tracked
    pub async fn check_health(&self) {
        let topology = self.snapshot();
        join_all(topology.nodes().iter().map(|node| self.check_node(node))).await;

        let current = self.snapshot();
        let swept = self
            .factory
            .retain(|ep| current.get(ep).is_some() || self.seeds.contains(ep))
            .await;
        if swept > 0 {
            debug!(target: "axl::router", swept, "Closed pools of untracked nodes");
        }

        trace!(
            target: "axl::router",
            generation = topology.generation(),
            healthy = topology.healthy_count(),
            nodes = topology.len(),
            "Health check cycle complete"
        );
    }

    async fn check_node(&self, node: &Node) {
        // Busy pools are skipped, not failed
        let result = match self.factory.create(node.endpoint()) {
            Ok(pool) => match pool.try_get().await {
                Ok(mut conn) => conn.ping().await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(latency) => {
                if let Some(previous) = node.record_success() {
                    info!(
                        target: "axl::router",
                        endpoint = %node.endpoint(),
                        previous = ?previous,
                        latency_us = latency.as_micros() as u64,
                        "Node healthy"
                    );
                }
            },
            Err(e) if !counts_against_node(&e) => {
                trace!(
                    target: "axl::router",
                    endpoint = %node.endpoint(),
                    error = %e,
                    "Health check skipped"
                );
            },
            Err(e) => {
                let (failures, transition) = node.record_failure(self.config.failure_threshold);
                match transition {
                    Some(previous) => warn!(
                        target: "axl::router",
                        endpoint = %node.endpoint(),
                        previous = ?previous,
                        failures,
                        error = %e,
                        "Node marked unhealthy"
                    ),
                    None => debug!(
                        target: "axl::router",
                        endpoint = %node.endpoint(),
                        failures,
                        error = %e,
                        "Health check failed"
                    ),
                }
            },
        }
    }

    /// A random healthy node, else the next discovery endpoint
    fn refresh_source(&self, topology: &Topology) -> Result<Endpoint> {
        let healthy: Vec<&Node> = topology.nodes().iter().filter(|n| n.is_healthy()).collect();
        if let Some(node) = healthy.choose(&mut rand::thread_rng()) {
            return Ok(node.endpoint().clone());
        }

        if self.seeds.is_empty() {
            return Err(ClientError::NoRoute(RouteKind::Any));
        }
        let idx = self.seed_cursor.fetch_add(1, Ordering::Relaxed) % self.seeds.len();
        Ok(self.seeds[idx].clone())
    }

    async fn describe(&self, endpoint: &Endpoint) -> Result<Vec<ClusterMember>> {
        let pool = self.factory.create(endpoint)?;
        let mut conn = pool.get().await?;
        conn.describe_cluster().await
    }

    fn select(&self, kind: RouteKind, exclude: Option<&Endpoint>) -> Result<Node> {
        let topology = self.snapshot();
        let eligible: Vec<&Node> = topology
            .nodes()
            .iter()
            .filter(|n| kind == RouteKind::Any || n.is_leader())
            .collect();
        pick(&eligible, exclude)
            .cloned()
            .ok_or(ClientError::NoRoute(kind))
    }

    async fn run_refresh_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.recv() => break,
            }

            tokio::select! {
                result = self.refresh() => {
                    if let Err(e) = result {
                        warn!(
                            target: "axl::router",
                            error = %e,
                            "Topology refresh failed"
                        );
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!(target: "axl::router", "Topology refresh loop shutting down");
    }

    async fn run_health_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.recv() => break,
            }

            tokio::select! {
                _ = self.check_health() => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        info!(target: "axl::router", "Health check loop shutting down");
    }
}

impl Router for EndpointRouter {
    fn spawn(self: Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        info!(
            target: "axl::router",
            seeds = self.seeds.len(),
            refresh_ms = self.config.refresh_interval.as_millis() as u64,
            health_ms = self.config.health_check_interval.as_millis() as u64,
            "Starting router loops"
        );
        vec![
            tokio::spawn(Arc::clone(&self).run_refresh_loop(shutdown.subscribe())),
            tokio::spawn(self.run_health_loop(shutdown.subscribe())),
        ]
    }

    fn next_any(&self, exclude: Option<&Endpoint>) -> Result<Node> {
        self.select(RouteKind::Any, exclude)
    }

    fn next_leader(&self, exclude: Option<&Endpoint>) -> Result<Node> {
        self.select(RouteKind::Leader, exclude)
    }

    fn snapshot(&self) -> Arc<Topology> {
        self.topology.borrow().clone()
    }
}

impl std::fmt::Debug for EndpointRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRouter")
            .field("seeds", &self.seeds)
            .field("config", &self.config)
            .field("generation", &self.snapshot().generation())
            .finish()
    }
}

/// Whether a failed call says the node itself is unreachable
fn counts_against_node(err: &ClientError) -> bool {
    !matches!(
        err,
        ClientError::Server(_) | ClientError::ClientClosed | ClientError::PoolExhausted(_)
    )
}

fn health_rank(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Unknown => 1,
        HealthStatus::Unhealthy => 2,
    }
}

/// Uniform random choice from the best health tier that has a node other than
/// `exclude`. The excluded node is only returned when nothing else qualifies.
fn pick<'a>(nodes: &[&'a Node], exclude: Option<&Endpoint>) -> Option<&'a Node> {
    let (excluded, candidates): (Vec<&Node>, Vec<&Node>) = nodes
        .iter()
        .copied()
        .partition(|n| Some(n.endpoint()) == exclude);

    let best = candidates.iter().map(|n| health_rank(n.status())).min();
    let Some(best) = best else {
        return excluded.first().copied();
    };

    let tier: Vec<&Node> = candidates
        .into_iter()
        .filter(|n| health_rank(n.status()) == best)
        .collect();
    tier.choose(&mut rand::thread_rng()).copied()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::node::SessionOptions;
    use crate::pool::PoolConfig;
    use crate::testing::FakeCluster;
    use axl_core::NodeRole;
    use std::collections::HashSet;

    fn ep(host: &str) -> Endpoint {
        Endpoint::new(host, 8111)
    }

    fn three_nodes() -> Vec<ClusterMember> {
        vec![
            ClusterMember::new("a", 8111, NodeRole::Leader),
            ClusterMember::new("b", 8111, NodeRole::Replica),
            ClusterMember::new("c", 8111, NodeRole::Replica),
        ]
    }

    fn router(cluster: &FakeCluster, seeds: Vec<Endpoint>) -> Arc<EndpointRouter> {
        router_with_pool(cluster, seeds, PoolConfig::default())
    }

    fn router_with_pool(
        cluster: &FakeCluster,
        seeds: Vec<Endpoint>,
        pool_config: PoolConfig,
    ) -> Arc<EndpointRouter> {
        let factory = Arc::new(NodeClientFactory::new(
            Arc::new(cluster.clone()),
            SessionOptions::default(),
            pool_config,
        ));
        Arc::new(EndpointRouter::new(RouterContext {
            seeds,
            factory,
            config: RouterConfig::default(),
        }))
    }

    #[tokio::test]
    async fn test_refresh_from_seed_probes_candidates() {
        let cluster = FakeCluster::new(three_nodes());
        let router = router(&cluster, vec![ep("seed")]);

        assert_eq!(router.refresh().await.unwrap(), 1);

        let topology = router.snapshot();
        assert_eq!(topology.len(), 3);
        assert_eq!(topology.healthy_count(), 3);
        assert_eq!(topology.leader().unwrap().endpoint(), &ep("a"));
        assert!(router.has_routes(3, 1));
    }

    #[tokio::test]
    async fn test_refresh_prefers_healthy_node_over_seeds() {
        let cluster = FakeCluster::new(three_nodes());
        let router = router(&cluster, vec![ep("seed")]);
        router.refresh().await.unwrap();

        cluster.set_down(&ep("seed"), true);
        assert_eq!(router.refresh().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_seeds_rotate_when_no_node_is_healthy() {
        let cluster = FakeCluster::new(three_nodes());
        let router = router(&cluster, vec![ep("s1"), ep("s2")]);
        cluster.set_down(&ep("s1"), true);

        assert!(router.refresh().await.is_err());
        assert_eq!(router.snapshot().generation(), 0);
        assert_eq!(router.refresh().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_topology() {
        let cluster = FakeCluster::new(three_nodes());
        let router = router(&cluster, vec![ep("seed")]);
        router.refresh().await.unwrap();

        cluster.set_describe_failing(true);
        assert!(matches!(router.refresh().await, Err(ClientError::Server(_))));
        let topology = router.snapshot();
        assert_eq!(topology.generation(), 1);
        assert_eq!(topology.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_member_list_is_rejected() {
        let cluster = FakeCluster::new(Vec::new());
        let router = router(&cluster, vec![ep("seed")]);

        assert!(matches!(
            router.refresh().await,
            Err(ClientError::InvalidResponse(_))
        ));
        assert_eq!(router.snapshot().generation(), 0);
    }

    #[tokio::test]
    async fn test_node_removed_after_omitting_refreshes() {
        let cluster = FakeCluster::new(three_nodes());
        let router = router(&cluster, vec![ep("seed")]);
        router.refresh().await.unwrap();
        let pool = router.factory.get(&ep("c")).unwrap();

        cluster.set_members(three_nodes()[..2].to_vec());
        router.refresh().await.unwrap();
        router.refresh().await.unwrap();
        assert!(router.snapshot().get(&ep("c")).is_some());
        assert!(!pool.is_closed());

        router.refresh().await.unwrap();
        assert!(router.snapshot().get(&ep("c")).is_none());
        assert!(pool.is_closed());
        assert!(router.factory.get(&ep("c")).is_none());
    }

    #[tokio::test]
    async fn test_unhealthy_after_threshold_and_recovery() {
        let cluster = FakeCluster::new(three_nodes());
        let router = router(&cluster, vec![ep("seed")]);
        router.refresh().await.unwrap();

        cluster.set_down(&ep("b"), true);
        router.check_health().await;
        router.check_health().await;
        assert!(router.snapshot().get(&ep("b")).unwrap().is_healthy());

        router.check_health().await;
        let b = router.snapshot().get(&ep("b")).unwrap().clone();
        assert_eq!(b.status(), HealthStatus::Unhealthy);
        assert_eq!(b.health().consecutive_failures, 3);

        for _ in 0..50 {
            assert_ne!(router.next_any(None).unwrap().endpoint(), &ep("b"));
        }

        cluster.set_down(&ep("b"), false);
        router.check_health().await;
        assert!(b.is_healthy());
        assert_eq!(b.health().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_busy_pool_does_not_fail_health_checks() {
        let cluster = FakeCluster::new(vec![ClusterMember::new("a", 8111, NodeRole::Leader)]);
        let router = router_with_pool(
            &cluster,
            vec![ep("seed")],
            PoolConfig::new()
                .with_max_connections(1)
                .with_acquire_timeout(Duration::from_millis(20)),
        );
        router.refresh().await.unwrap();
        let a = router.snapshot().get(&ep("a")).unwrap().clone();
        assert!(a.is_healthy());

        // Callers hold every connection to the node
        let held = router.factory.get(&ep("a")).unwrap().get().await.unwrap();
        assert!(matches!(
            router.refresh().await,
            Err(ClientError::PoolExhausted(_))
        ));
        for _ in 0..3 {
            router.check_health().await;
        }
        assert!(a.is_healthy());
        assert_eq!(a.health().consecutive_failures, 0);
        assert_eq!(
            router.next_leader(None).unwrap().status(),
            HealthStatus::Healthy
        );

        // A node that is really gone is still caught once a slot is free
        drop(held);
        cluster.set_down(&ep("a"), true);
        for _ in 0..3 {
            router.check_health().await;
        }
        assert_eq!(a.status(), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_health_cycle_drops_pools_of_removed_nodes() {
        let cluster = FakeCluster::new(three_nodes());
        let router = router(&cluster, vec![ep("seed")]);
        router.refresh().await.unwrap();

        cluster.set_members(three_nodes()[..2].to_vec());
        for _ in 0..3 {
            router.refresh().await.unwrap();
        }
        assert!(router.snapshot().get(&ep("c")).is_none());

        // A caller routing from an older snapshot recreates the pool
        let stale = router.factory.create(&ep("c")).unwrap();
        router.check_health().await;

        assert!(stale.is_closed());
        assert!(router.factory.get(&ep("c")).is_none());
        assert!(router.factory.get(&ep("a")).is_some());
        assert!(router.factory.get(&ep("seed")).is_some());
    }

    #[tokio::test]
    async fn test_next_any_excludes_previous_node() {
        let cluster = FakeCluster::new(three_nodes());
        let router = router(&cluster, vec![ep("seed")]);
        router.refresh().await.unwrap();

        let mut seen = HashSet::new();
        for _ in 0..100 {
            let node = router.next_any(Some(&ep("a"))).unwrap();
            assert_ne!(node.endpoint(), &ep("a"));
            seen.insert(node.endpoint().clone());
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_selection_fallbacks() {
        let cluster = FakeCluster::new(vec![ClusterMember::new("a", 8111, NodeRole::Leader)]);
        let router = router(&cluster, vec![ep("seed")]);

        assert!(matches!(
            router.next_any(None),
            Err(ClientError::NoRoute(RouteKind::Any))
        ));

        router.refresh().await.unwrap();
        // Only the excluded node is known: hand it back rather than fail
        assert_eq!(router.next_any(Some(&ep("a"))).unwrap().endpoint(), &ep("a"));
        assert_eq!(
            router.next_leader(Some(&ep("a"))).unwrap().endpoint(),
            &ep("a")
        );
    }

    #[tokio::test]
    async fn test_next_any_prefers_candidates_over_unhealthy() {
        let cluster = FakeCluster::new(three_nodes()[..2].to_vec());
        let router = router(&cluster, vec![ep("seed")]);
        router.refresh().await.unwrap();

        cluster.set_down(&ep("a"), true);
        cluster.set_down(&ep("b"), true);
        for _ in 0..3 {
            router.check_health().await;
        }
        assert_eq!(router.snapshot().healthy_count(), 0);

        // A new node appears but its probe fails once, so it stays a candidate
        cluster.set_members(three_nodes());
        cluster.set_down(&ep("c"), true);
        cluster.set_down(&ep("seed"), false);
        router.refresh().await.unwrap();
        let c = router.snapshot().get(&ep("c")).unwrap().clone();
        assert_eq!(c.status(), HealthStatus::Unknown);

        assert_eq!(router.next_any(None).unwrap().endpoint(), &ep("c"));
    }

    #[tokio::test]
    async fn test_next_leader_without_leader() {
        let cluster = FakeCluster::new(vec![
            ClusterMember::new("b", 8111, NodeRole::Replica),
            ClusterMember::new("c", 8111, NodeRole::Replica),
        ]);
        let router = router(&cluster, vec![ep("seed")]);
        router.refresh().await.unwrap();

        assert!(matches!(
            router.next_leader(None),
            Err(ClientError::NoRoute(RouteKind::Leader))
        ));
        assert!(router.next_any(None).is_ok());
    }

    #[tokio::test]
    async fn test_loops_stop_on_shutdown() {
        let cluster = FakeCluster::new(three_nodes());
        let router = router(&cluster, vec![ep("seed")]);
        let (tx, _) = broadcast::channel(1);
        let mut topology = router.subscribe();

        let handles = Arc::clone(&router).spawn(&tx);
        assert_eq!(handles.len(), 2);

        tokio::time::timeout(Duration::from_secs(2), topology.changed())
            .await
            .unwrap()
            .unwrap();

        tx.send(()).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_running_refresh() {
        let cluster = FakeCluster::new(three_nodes());
        cluster.set_latency(Duration::from_secs(30));
        let router = router(&cluster, vec![ep("seed")]);
        let (tx, _) = broadcast::channel(1);

        let handles = Arc::clone(&router).spawn(&tx);
        // The first refresh is now stuck in a slow describe
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cluster.describe_count(), 0);

        tx.send(()).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(router.snapshot().generation(), 0);
    }
}
