//! Per-node connection pooling.
//!
//! Each node gets one [`NodeConnectionPool`]: a bounded set of persistent
//! connections with an idle queue, handed out as RAII [`Connection`] handles.
//! [`NodeClientFactory`] owns the pools of every node the router knows about
//! and runs the idle-reap loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axl_core::{ClusterMember, Endpoint};
use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, broadcast};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::lock_unpoisoned;
use crate::node::{NodeClient, NodeConnector, SessionOptions};

/// Per-node pool limits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections (idle + in use) per node
    pub max_connections: usize,
    /// How long `get()` waits for a free slot
    pub acquire_timeout: Duration,
    /// Idle connections unused for longer than this are reaped
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total connections created
    pub connections_created: u64,
    /// Total connections closed or discarded
    pub connections_closed: u64,
    /// Current connections handed out to callers
    pub active_connections: u64,
    /// Current idle connections
    pub idle_connections: u64,
    /// Total acquire attempts
    pub acquire_attempts: u64,
    /// Successful acquires
    pub acquire_successes: u64,
    /// Failed acquires (timeout, connect failure, closed pool)
    pub acquire_failures: u64,
    /// Failed attempts to open a new connection
    pub connect_failures: u64,
    /// Connections closed by the idle reaper
    pub connections_reaped: u64,
}

impl PoolStats {
    /// Add another pool's counters into this one
    pub fn accumulate(&mut self, other: &PoolStats) {
        self.connections_created += other.connections_created;
        self.connections_closed += other.connections_closed;
        self.active_connections += other.active_connections;
        self.idle_connections += other.idle_connections;
        self.acquire_attempts += other.acquire_attempts;
        self.acquire_successes += other.acquire_successes;
        self.acquire_failures += other.acquire_failures;
        self.connect_failures += other.connect_failures;
        self.connections_reaped += other.connections_reaped;
    }
}

#[derive(Debug, Default)]
struct PoolMetrics {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU64,
    idle_connections: AtomicU64,
    acquire_attempts: AtomicU64,
    acquire_successes: AtomicU64,
    acquire_failures: AtomicU64,
    connect_failures: AtomicU64,
    connections_reaped: AtomicU64,
}

impl PoolMetrics {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            idle_connections: self.idle_connections.load(Ordering::Relaxed),
            acquire_attempts: self.acquire_attempts.load(Ordering::Relaxed),
            acquire_successes: self.acquire_successes.load(Ordering::Relaxed),
            acquire_failures: self.acquire_failures.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            connections_reaped: self.connections_reaped.load(Ordering::Relaxed),
        }
    }
}

struct PooledConnection {
    client: Box<dyn NodeClient>,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn new(client: Box<dyn NodeClient>) -> Self {
        let now = Instant::now();
        Self {
            client,
            created_at: now,
            last_used: now,
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Duration) -> bool {
        if idle_timeout.is_zero() {
            return false;
        }
        self.last_used.elapsed() > idle_timeout
    }
}

/// State shared between a pool and the connections it has handed out
struct PoolShared {
    endpoint: Endpoint,
    idle: Mutex<VecDeque<PooledConnection>>,
    metrics: PoolMetrics,
    closed: AtomicBool,
}

impl PoolShared {
    fn set_idle_len(&self, len: usize) {
        self.metrics
            .idle_connections
            .store(len as u64, Ordering::Relaxed);
    }

    async fn close_connections(&self, conns: impl IntoIterator<Item = PooledConnection>) {
        for conn in conns {
            self.metrics
                .connections_closed
                .fetch_add(1, Ordering::Relaxed);
            let age = conn.created_at.elapsed();
            if let Err(e) = conn.client.close().await {
                warn!(
                    target: "axl::pool",
                    endpoint = %self.endpoint,
                    age_ms = age.as_millis() as u64,
                    error = %e,
                    "Failed to close connection"
                );
            }
        }
    }
}

/// Bounded pool of connections to one node
pub struct NodeConnectionPool {
    shared: Arc<PoolShared>,
    connector: Arc<dyn NodeConnector>,
    options: SessionOptions,
    semaphore: Arc<Semaphore>,
    config: PoolConfig,
}

impl NodeConnectionPool {
    /// Create an empty pool; connections are opened on demand
    pub fn new(
        endpoint: Endpoint,
        connector: Arc<dyn NodeConnector>,
        options: SessionOptions,
        config: PoolConfig,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                endpoint,
                idle: Mutex::new(VecDeque::new()),
                metrics: PoolMetrics::default(),
                closed: AtomicBool::new(false),
            }),
            connector,
            options,
            semaphore: Arc::new(Semaphore::new(config.max_connections.max(1))),
            config,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of idle connections waiting for reuse
    pub fn idle_len(&self) -> usize {
        lock_unpoisoned(&self.shared.idle).len()
    }

    /// Get an idle connection or open a new one
    ///
    /// # Errors
    /// - [`ClientError::ClientClosed`] once the pool is closed
    /// - [`ClientError::PoolExhausted`] if no slot frees up within `acquire_timeout`
    /// - [`ClientError::ConnectFailure`] if a new connection cannot be opened
    pub async fn get(&self) -> Result<Connection> {
        if self.is_closed() {
            return Err(ClientError::ClientClosed);
        }

        let metrics = &self.shared.metrics;
        metrics.acquire_attempts.fetch_add(1, Ordering::Relaxed);

        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| {
            metrics.acquire_failures.fetch_add(1, Ordering::Relaxed);
            ClientError::PoolExhausted(self.endpoint().clone())
        })?
        .map_err(|_| {
            metrics.acquire_failures.fetch_add(1, Ordering::Relaxed);
            ClientError::ClientClosed
        })?;

        self.checkout(permit).await
    }

    /// Like [`NodeConnectionPool::get`] but fails at once when every slot is taken
    ///
    /// # Errors
    /// [`ClientError::PoolExhausted`] instead of waiting, otherwise as `get()`.
    pub async fn try_get(&self) -> Result<Connection> {
        if self.is_closed() {
            return Err(ClientError::ClientClosed);
        }

        let metrics = &self.shared.metrics;
        metrics.acquire_attempts.fetch_add(1, Ordering::Relaxed);

        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                metrics.acquire_failures.fetch_add(1, Ordering::Relaxed);
                return Err(ClientError::PoolExhausted(self.endpoint().clone()));
            },
            Err(TryAcquireError::Closed) => {
                metrics.acquire_failures.fetch_add(1, Ordering::Relaxed);
                return Err(ClientError::ClientClosed);
            },
        };

        self.checkout(permit).await
    }

    async fn checkout(&self, permit: OwnedSemaphorePermit) -> Result<Connection> {
        let metrics = &self.shared.metrics;

        // Most recently used first, so stale connections age out at the front
        let mut stale = Vec::new();
        let reused = {
            let mut idle = lock_unpoisoned(&self.shared.idle);
            let conn = loop {
                match idle.pop_back() {
                    Some(conn) if conn.is_idle_too_long(self.config.idle_timeout) => {
                        stale.push(conn);
                    },
                    other => break other,
                }
            };
            self.shared.set_idle_len(idle.len());
            conn
        };

        if !stale.is_empty() {
            self.shared.close_connections(stale).await;
        }

        let conn = match reused {
            Some(mut conn) => {
                conn.last_used = Instant::now();
                conn
            },
            None => match self.connector.connect(self.endpoint(), &self.options).await {
                Ok(client) => {
                    metrics.connections_created.fetch_add(1, Ordering::Relaxed);
                    debug!(target: "axl::pool", endpoint = %self.endpoint(), "Opened connection");
                    PooledConnection::new(client)
                },
                Err(e) => {
                    metrics.connect_failures.fetch_add(1, Ordering::Relaxed);
                    metrics.acquire_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(ClientError::connect_failure(self.endpoint(), e));
                },
            },
        };

        metrics.active_connections.fetch_add(1, Ordering::Relaxed);
        metrics.acquire_successes.fetch_add(1, Ordering::Relaxed);

        Ok(Connection {
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    /// Close idle connections unused for longer than `idle_timeout`
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let expired: VecDeque<PooledConnection> = {
            let mut idle = lock_unpoisoned(&self.shared.idle);
            let (expired, fresh): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut *idle)
                .into_iter()
                .partition(|c| c.is_idle_too_long(idle_timeout));
            *idle = fresh;
            self.shared.set_idle_len(idle.len());
            expired
        };

        let count = expired.len();
        if count > 0 {
            self.shared
                .metrics
                .connections_reaped
                .fetch_add(count as u64, Ordering::Relaxed);
            self.shared.close_connections(expired).await;
            debug!(target: "axl::pool", endpoint = %self.endpoint(), count, "Reaped idle connections");
        }
        count
    }

    /// Close the pool and every idle connection
    ///
    /// Connections currently handed out are discarded when they are dropped.
    /// Close errors are logged, never returned.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.semaphore.close();

        let idle: Vec<PooledConnection> = {
            let mut idle = lock_unpoisoned(&self.shared.idle);
            let drained = idle.drain(..).collect();
            self.shared.set_idle_len(0);
            drained
        };
        self.shared.close_connections(idle).await;

        debug!(target: "axl::pool", endpoint = %self.endpoint(), "Connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.metrics.snapshot()
    }
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool")
            .field("endpoint", self.endpoint())
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A pooled connection to one node
///
/// Returned to its pool's idle set when dropped (or on [`Connection::release`]).
/// A connection that failed at the transport level is discarded instead.
pub struct Connection {
    conn: Option<PooledConnection>,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    /// The node this connection talks to
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// False once the connection has been marked unhealthy
    pub fn is_usable(&self) -> bool {
        self.conn.is_some()
    }

    pub async fn request(&mut self, payload: Bytes) -> Result<Bytes> {
        let result = self.client()?.request(payload).await;
        self.observe(result)
    }

    pub async fn ping(&mut self) -> Result<Duration> {
        let result = self.client()?.ping().await;
        self.observe(result)
    }

    pub async fn describe_cluster(&mut self) -> Result<Vec<ClusterMember>> {
        let result = self.client()?.describe_cluster().await;
        self.observe(result)
    }

    /// Discard the connection instead of returning it to the pool
    pub fn mark_unhealthy(&mut self) {
        if self.conn.take().is_some() {
            self.shared
                .metrics
                .connections_closed
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Return the connection to its pool
    pub fn release(self) {
        drop(self);
    }

    fn client(&mut self) -> Result<&mut Box<dyn NodeClient>> {
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut conn.client),
            None => Err(ClientError::ConnectionClosed),
        }
    }

    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            // Node-level errors leave the stream usable
            if !matches!(e, ClientError::Server(_)) {
                self.mark_unhealthy();
            }
        }
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let metrics = &self.shared.metrics;
        metrics.active_connections.fetch_sub(1, Ordering::Relaxed);

        let Some(mut conn) = self.conn.take() else {
            return;
        };

        let mut idle = lock_unpoisoned(&self.shared.idle);
        if self.shared.closed.load(Ordering::Acquire) {
            metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        conn.last_used = Instant::now();
        idle.push_back(conn);
        self.shared.set_idle_len(idle.len());
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", self.endpoint())
            .field("usable", &self.is_usable())
            .finish()
    }
}

/// Builds and owns the connection pool of every known node
pub struct NodeClientFactory {
    connector: Arc<dyn NodeConnector>,
    options: SessionOptions,
    pool_config: PoolConfig,
    pools: Mutex<HashMap<Endpoint, Arc<NodeConnectionPool>>>,
    closed: AtomicBool,
}

impl NodeClientFactory {
    pub fn new(
        connector: Arc<dyn NodeConnector>,
        options: SessionOptions,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            connector,
            options,
            pool_config,
            pools: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Return the pool for `endpoint`, creating it if absent
    ///
    /// # Errors
    /// Returns [`ClientError::ClientClosed`] after [`NodeClientFactory::close_all`].
    pub fn create(&self, endpoint: &Endpoint) -> Result<Arc<NodeConnectionPool>> {
        let mut pools = lock_unpoisoned(&self.pools);
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ClientClosed);
        }

        let pool = pools.entry(endpoint.clone()).or_insert_with(|| {
            debug!(target: "axl::pool", endpoint = %endpoint, "Creating connection pool");
            Arc::new(NodeConnectionPool::new(
                endpoint.clone(),
                Arc::clone(&self.connector),
                self.options.clone(),
                self.pool_config.clone(),
            ))
        });
        Ok(Arc::clone(pool))
    }

    /// The existing pool for `endpoint`, if any
    pub fn get(&self, endpoint: &Endpoint) -> Option<Arc<NodeConnectionPool>> {
        lock_unpoisoned(&self.pools).get(endpoint).cloned()
    }

    pub fn pool_count(&self) -> usize {
        lock_unpoisoned(&self.pools).len()
    }

    /// Close and forget the pool of a node that left the cluster
    pub async fn remove(&self, endpoint: &Endpoint) -> bool {
        let pool = lock_unpoisoned(&self.pools).remove(endpoint);
        match pool {
            Some(pool) => {
                pool.close().await;
                true
            },
            None => false,
        }
    }

    /// Close and forget every pool whose endpoint `keep` rejects
    pub async fn retain<F>(&self, keep: F) -> usize
    where
        F: Fn(&Endpoint) -> bool,
    {
        let dropped: Vec<Arc<NodeConnectionPool>> = {
            let mut pools = lock_unpoisoned(&self.pools);
            let stale: Vec<Endpoint> = pools.keys().filter(|ep| !keep(ep)).cloned().collect();
            stale.iter().filter_map(|ep| pools.remove(ep)).collect()
        };

        for pool in &dropped {
            debug!(target: "axl::pool", endpoint = %pool.endpoint(), "Dropping untracked pool");
            pool.close().await;
        }
        dropped.len()
    }

    fn pools(&self) -> Vec<Arc<NodeConnectionPool>> {
        lock_unpoisoned(&self.pools).values().cloned().collect()
    }

    /// Reap idle connections in every pool
    pub async fn reap_idle(&self) -> usize {
        let mut reaped = 0;
        for pool in self.pools() {
            reaped += pool.reap_idle().await;
        }
        reaped
    }

    /// Close every pool. Idempotent.
    pub async fn close_all(&self) {
        let pools: Vec<Arc<NodeConnectionPool>> = {
            let mut pools = lock_unpoisoned(&self.pools);
            self.closed.store(true, Ordering::Release);
            pools.drain().map(|(_, pool)| pool).collect()
        };

        for pool in &pools {
            pool.close().await;
        }
        if !pools.is_empty() {
            debug!(target: "axl::pool", count = pools.len(), "Closed all connection pools");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Counters summed over every live pool
    pub fn stats(&self) -> PoolStats {
        let mut total = PoolStats::default();
        for pool in self.pools() {
            total.accumulate(&pool.stats());
        }
        total
    }

    /// Idle-reap loop, runs until shutdown is signalled
    pub async fn run_reap_loop(
        self: Arc<Self>,
        period: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!(
            target: "axl::pool",
            interval_ms = period.as_millis() as u64,
            "Idle reaper started"
        );

        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown_rx.recv() => break,
            }

            tokio::select! {
                reaped = self.reap_idle() => {
                    if reaped > 0 {
                        debug!(target: "axl::pool", reaped, "Idle reap cycle complete");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!(target: "axl::pool", "Idle reaper shutting down");
    }
}

impl std::fmt::Debug for NodeClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClientFactory")
            .field("options", &self.options)
            .field("pool_config", &self.pool_config)
            .field("pools", &self.pool_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;
    use axl_core::NodeRole;

    fn ep(host: &str) -> Endpoint {
        Endpoint::new(host, 8111)
    }

    fn pool(cluster: &FakeCluster, config: PoolConfig) -> NodeConnectionPool {
        NodeConnectionPool::new(
            ep("a"),
            Arc::new(cluster.clone()),
            SessionOptions::default(),
            config,
        )
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new()
            .with_max_connections(3)
            .with_acquire_timeout(Duration::from_millis(50))
            .with_idle_timeout(Duration::from_secs(1));
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.acquire_timeout, Duration::from_millis(50));
        assert_eq!(config.idle_timeout, Duration::from_secs(1));
        assert_eq!(PoolConfig::default().max_connections, 10);
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let cluster = FakeCluster::new(vec![ClusterMember::new("a", 8111, NodeRole::Leader)]);
        let pool = pool(&cluster, PoolConfig::default());

        let mut conn = pool.get().await.unwrap();
        conn.ping().await.unwrap();
        conn.release();
        assert_eq!(pool.idle_len(), 1);

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.idle_len(), 0);
        drop(conn);

        let stats = pool.stats();
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.acquire_successes, 2);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(cluster.connect_count(&ep("a")), 1);
    }

    #[tokio::test]
    async fn test_max_connections_bounds_acquire() {
        let cluster = FakeCluster::new(vec![ClusterMember::new("a", 8111, NodeRole::Leader)]);
        let pool = pool(
            &cluster,
            PoolConfig::new()
                .with_max_connections(1)
                .with_acquire_timeout(Duration::from_millis(20)),
        );

        let held = pool.get().await.unwrap();
        assert!(matches!(pool.get().await, Err(ClientError::PoolExhausted(_))));
        drop(held);
        assert!(pool.get().await.is_ok());
        assert_eq!(pool.stats().acquire_failures, 1);
    }

    #[tokio::test]
    async fn test_try_get_does_not_wait() {
        let cluster = FakeCluster::new(vec![ClusterMember::new("a", 8111, NodeRole::Leader)]);
        let pool = pool(
            &cluster,
            PoolConfig::new()
                .with_max_connections(1)
                .with_acquire_timeout(Duration::from_secs(30)),
        );

        let held = pool.get().await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(1), pool.try_get())
            .await
            .unwrap()
            .unwrap_err();
        match err {
            ClientError::PoolExhausted(endpoint) => assert_eq!(endpoint, ep("a")),
            other => panic!("unexpected {:?}", other),
        }

        drop(held);
        let conn = pool.try_get().await.unwrap();
        assert_eq!(conn.endpoint(), &ep("a"));
        assert_eq!(cluster.connect_count(&ep("a")), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces() {
        let cluster = FakeCluster::new(vec![ClusterMember::new("a", 8111, NodeRole::Leader)]);
        cluster.set_down(&ep("a"), true);
        let pool = pool(&cluster, PoolConfig::default());

        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectFailure { .. }));
        assert_eq!(pool.stats().connect_failures, 1);
    }

    #[tokio::test]
    async fn test_failed_connection_is_discarded() {
        let cluster = FakeCluster::new(vec![ClusterMember::new("a", 8111, NodeRole::Leader)]);
        let pool = pool(&cluster, PoolConfig::default());

        let mut conn = pool.get().await.unwrap();
        cluster.set_down(&ep("a"), true);
        assert!(conn.ping().await.is_err());
        assert!(!conn.is_usable());
        drop(conn);

        assert_eq!(pool.idle_len(), 0);
        assert_eq!(pool.stats().connections_closed, 1);
    }

    #[tokio::test]
    async fn test_server_error_keeps_connection() {
        let cluster = FakeCluster::new(vec![ClusterMember::new("a", 8111, NodeRole::Leader)]);
        let pool = pool(&cluster, PoolConfig::default());

        let mut conn = pool.get().await.unwrap();
        let err = conn.request(Bytes::from_static(b"fail")).await.unwrap_err();
        assert!(matches!(err, ClientError::Server(_)));
        assert!(conn.is_usable());
        drop(conn);
        assert_eq!(pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn test_reap_closes_old_idle_connections() {
        let cluster = FakeCluster::new(vec![ClusterMember::new("a", 8111, NodeRole::Leader)]);
        let pool = pool(
            &cluster,
            PoolConfig::new().with_idle_timeout(Duration::from_millis(20)),
        );

        let first = pool.get().await.unwrap();
        let second = pool.get().await.unwrap();
        drop(first);
        drop(second);
        assert_eq!(pool.idle_len(), 2);

        assert_eq!(pool.reap_idle().await, 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.reap_idle().await, 2);
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(pool.stats().connections_reaped, 2);
        assert_eq!(cluster.close_count(&ep("a")), 2);
    }

    #[tokio::test]
    async fn test_close_pool() {
        let cluster = FakeCluster::new(vec![ClusterMember::new("a", 8111, NodeRole::Leader)]);
        let pool = pool(&cluster, PoolConfig::default());

        let held = pool.get().await.unwrap();
        drop(pool.get().await.unwrap());

        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(cluster.close_count(&ep("a")), 1);
        assert!(matches!(pool.get().await, Err(ClientError::ClientClosed)));

        // Checked-out connections are discarded, not returned
        drop(held);
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn test_factory_pools_per_endpoint() {
        let cluster = FakeCluster::new(vec![
            ClusterMember::new("a", 8111, NodeRole::Leader),
            ClusterMember::new("b", 8111, NodeRole::Replica),
        ]);
        let factory = NodeClientFactory::new(
            Arc::new(cluster.clone()),
            SessionOptions::default(),
            PoolConfig::default(),
        );

        let a1 = factory.create(&ep("a")).unwrap();
        let a2 = factory.create(&ep("a")).unwrap();
        let b = factory.create(&ep("b")).unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(factory.pool_count(), 2);

        drop(a1.get().await.unwrap());
        drop(b.get().await.unwrap());
        assert_eq!(factory.stats().idle_connections, 2);

        assert!(factory.remove(&ep("b")).await);
        assert!(b.is_closed());
        assert!(factory.get(&ep("b")).is_none());

        let a = factory.create(&ep("a")).unwrap();
        let c = factory.create(&ep("c")).unwrap();
        assert_eq!(factory.retain(|endpoint| endpoint == &ep("a")).await, 1);
        assert!(c.is_closed());
        assert!(!a.is_closed());
        assert_eq!(factory.pool_count(), 1);

        factory.close_all().await;
        assert!(a1.is_closed());
        assert!(matches!(
            factory.create(&ep("a")),
            Err(ClientError::ClientClosed)
        ));
    }

    #[tokio::test]
    async fn test_reap_loop_stops_on_shutdown() {
        let cluster = FakeCluster::new(Vec::new());
        let factory = Arc::new(NodeClientFactory::new(
            Arc::new(cluster),
            SessionOptions::default(),
            PoolConfig::default(),
        ));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(Arc::clone(&factory).run_reap_loop(Duration::from_secs(60), rx));
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
