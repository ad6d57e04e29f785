//! Cluster client facade.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use axl_client::{ClusterClient, ClusterConfig};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClusterConfig::new("us-west-2", vec!["axl-a.internal:8111", "axl-b.internal"]);
//!     let client = ClusterClient::new(config)?;
//!     client.start(1, 1, Duration::from_secs(10)).await?;
//!
//!     let mut conn = client.write_client(None).await?;
//!     let reply = conn.request(Bytes::from_static(b"...")).await?;
//!     println!("{} bytes", reply.len());
//!     drop(conn);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axl_core::Endpoint;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::error::{ClientError, Result, RouteKind};
use crate::node::NodeConnector;
use crate::pool::{Connection, NodeClientFactory, PoolStats};
use crate::router::{EndpointRouter, Router, RouterContext, RouterFactory};
use crate::topology::{Node, Topology};
use crate::transport::TcpConnector;

/// Selections tried when a routed node's pool closes before checkout
const ROUTE_ATTEMPTS: usize = 3;

/// Builds a [`ClusterClient`], optionally with injected collaborators
pub struct ClusterClientBuilder {
    config: ClusterConfig,
    connector: Option<Arc<dyn NodeConnector>>,
    router_factory: Option<RouterFactory>,
}

impl ClusterClientBuilder {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            connector: None,
            router_factory: None,
        }
    }

    /// Replace the built-in TCP transport
    pub fn node_connector(mut self, connector: Arc<dyn NodeConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the default [`EndpointRouter`]
    pub fn router_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(RouterContext) -> Arc<dyn Router> + Send + Sync + 'static,
    {
        self.router_factory = Some(Arc::new(factory));
        self
    }

    /// Validate the configuration and wire the client. Nothing runs until
    /// [`ClusterClient::start`].
    ///
    /// # Errors
    /// Returns [`ClientError::Config`] for an invalid configuration.
    pub fn build(self) -> Result<ClusterClient> {
        let seeds = self.config.validate()?;

        let connector: Arc<dyn NodeConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TcpConnector),
        };
        let factory = Arc::new(NodeClientFactory::new(
            connector,
            self.config.session_options(),
            self.config.pool_config(),
        ));

        let ctx = RouterContext {
            seeds: seeds.clone(),
            factory: Arc::clone(&factory),
            config: self.config.router_config(),
        };
        let router: Arc<dyn Router> = match self.router_factory {
            Some(build_router) => build_router(ctx),
            None => Arc::new(EndpointRouter::new(ctx)),
        };

        let (shutdown_tx, _) = broadcast::channel(1);

        debug!(
            target: "axl::cluster",
            region = %self.config.region_name,
            seeds = seeds.len(),
            "Cluster client built"
        );

        Ok(ClusterClient {
            config: self.config,
            seeds,
            router,
            factory,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

/// Cluster-aware client handing out pooled connections to healthy nodes
pub struct ClusterClient {
    config: ClusterConfig,
    seeds: Vec<Endpoint>,
    router: Arc<dyn Router>,
    factory: Arc<NodeClientFactory>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    ready: AtomicBool,
    closed: AtomicBool,
}

impl ClusterClient {
    /// Client with the built-in TCP transport and default router
    pub fn new(config: ClusterConfig) -> Result<Self> {
        ClusterClientBuilder::new(config).build()
    }

    pub fn builder(config: ClusterConfig) -> ClusterClientBuilder {
        ClusterClientBuilder::new(config)
    }

    /// Start the background loops and wait until the cluster is routable
    ///
    /// Loops are spawned once per client. Calling again after a successful
    /// start returns immediately; calling again after a failed start waits
    /// again without spawning more loops.
    ///
    /// # Errors
    /// - [`ClientError::ClusterUnavailable`] if the routes did not appear in time
    /// - [`ClientError::ClientClosed`] if the client is or gets closed
    pub async fn start(&self, min_healthy: usize, leader_min: usize, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        {
            let mut tasks = self.tasks.lock().await;
            self.ensure_open()?;
            if !self.started.swap(true, Ordering::AcqRel) {
                tasks.extend(Arc::clone(&self.router).spawn(&self.shutdown_tx));
                tasks.push(tokio::spawn(Arc::clone(&self.factory).run_reap_loop(
                    self.config.idle_reap_interval,
                    self.shutdown_tx.subscribe(),
                )));
                info!(
                    target: "axl::cluster",
                    region = %self.config.region_name,
                    seeds = self.seeds.len(),
                    "Cluster client started"
                );
            }
        }

        self.wait_for_routes(min_healthy, leader_min, timeout).await?;
        self.ready.store(true, Ordering::Release);

        let (healthy, leaders) = self.router.route_counts();
        info!(target: "axl::cluster", healthy, leaders, "Cluster routes available");
        Ok(())
    }

    /// Stop every background loop, wait for them, then close all pools
    ///
    /// Idempotent. A concurrent caller returns once the first close finished.
    pub async fn close(&self) {
        let first = !self.closed.swap(true, Ordering::AcqRel);

        let mut tasks = self.tasks.lock().await;
        let _ = self.shutdown_tx.send(());
        for handle in tasks.drain(..) {
            if let Err(e) = handle.await {
                warn!(target: "axl::cluster", error = %e, "Background task failed");
            }
        }
        self.factory.close_all().await;

        if first {
            info!(target: "axl::cluster", "Cluster client closed");
        }
    }

    /// A connection to any healthy node, avoiding `prev`'s node when possible
    ///
    /// # Errors
    /// [`ClientError::NoRoute`] if no node qualifies, [`ClientError::ConnectFailure`]
    /// if the chosen node cannot be reached, [`ClientError::ClientClosed`] after close.
    pub async fn read_client(&self, prev: Option<&Connection>) -> Result<Connection> {
        self.route(RouteKind::Any, prev.map(Connection::endpoint)).await
    }

    /// A connection to the leader
    ///
    /// # Errors
    /// [`ClientError::NoRoute`] if no leader is currently known, otherwise as
    /// [`ClusterClient::read_client`].
    pub async fn write_client(&self, prev: Option<&Connection>) -> Result<Connection> {
        self.route(RouteKind::Leader, prev.map(Connection::endpoint)).await
    }

    /// Poll until `min_healthy` nodes are healthy and `leader_min` of them lead
    ///
    /// # Errors
    /// [`ClientError::ClusterUnavailable`] on timeout, [`ClientError::ClientClosed`]
    /// if the client is or gets closed.
    pub async fn wait_for_routes(
        &self,
        min_healthy: usize,
        leader_min: usize,
        timeout: Duration,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let started = Instant::now();

        loop {
            self.ensure_open()?;
            if self.router.has_routes(min_healthy, leader_min) {
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= timeout {
                let (healthy, leaders) = self.router.route_counts();
                return Err(ClientError::ClusterUnavailable {
                    min_healthy,
                    leader_min,
                    healthy,
                    leaders,
                    waited,
                });
            }

            let pause = self.config.route_poll_interval.min(timeout - waited);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown_rx.recv() => {
                    return Err(ClientError::ClientClosed);
                }
            }
        }
    }

    /// The current topology snapshot
    pub fn topology(&self) -> Arc<Topology> {
        self.router.snapshot()
    }

    /// Pool counters summed over every node
    pub fn pool_stats(&self) -> PoolStats {
        self.factory.stats()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Parsed discovery endpoints
    pub fn seeds(&self) -> &[Endpoint] {
        &self.seeds
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::ClientClosed);
        }
        Ok(())
    }

    async fn route(&self, kind: RouteKind, exclude: Option<&Endpoint>) -> Result<Connection> {
        for _ in 0..ROUTE_ATTEMPTS {
            self.ensure_open()?;
            let node = match kind {
                RouteKind::Any => self.router.next_any(exclude)?,
                RouteKind::Leader => self.router.next_leader(exclude)?,
            };
            match self.connect(&node).await {
                // The node left the topology and its pool closed after routing
                Err(ClientError::ClientClosed) if !self.is_closed() => {
                    debug!(
                        target: "axl::cluster",
                        endpoint = %node.endpoint(),
                        "Routed node retired, rerouting"
                    );
                },
                result => return result,
            }
        }
        Err(ClientError::NoRoute(kind))
    }

    async fn connect(&self, node: &Node) -> Result<Connection> {
        let pool = self.factory.create(node.endpoint())?;
        match pool.get().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                if matches!(e, ClientError::ConnectFailure { .. }) {
                    let (failures, _) = node.record_failure(self.config.failure_threshold);
                    debug!(
                        target: "axl::cluster",
                        endpoint = %node.endpoint(),
                        failures,
                        error = %e,
                        "Connect to routed node failed"
                    );
                }
                Err(e)
            },
        }
    }
}

impl Drop for ClusterClient {
    fn drop(&mut self) {
        // Without close() the loops are not awaited, only signalled
        let _ = self.shutdown_tx.send(());
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("config", &self.config)
            .field("seeds", &self.seeds)
            .field("generation", &self.topology().generation())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
