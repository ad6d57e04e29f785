#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod cluster;
mod config;
mod error;
mod node;
pub mod pool;
pub mod router;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod topology;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use cluster::{ClusterClient, ClusterClientBuilder};
pub use config::{ClusterConfig, ClusterSettings};
pub use error::{ClientError, Result, RouteKind};
pub use node::{NodeClient, NodeConnector, SessionOptions};
pub use pool::{Connection, NodeClientFactory, NodeConnectionPool, PoolConfig, PoolStats};
pub use router::{EndpointRouter, Router, RouterConfig, RouterContext, RouterFactory};
pub use topology::{HealthStatus, Node, NodeHealth, Topology};
pub use transport::{TcpConnector, TcpNodeClient};

pub use axl_core::{
    ClusterMember, Credentials, CredentialsProvider, DEFAULT_PORT, Endpoint, NodeRole,
    StaticCredentialsProvider,
};

/// User agent sent to nodes unless overridden
pub const DEFAULT_USER_AGENT: &str = concat!("axl-client/", env!("CARGO_PKG_VERSION"));

/// Lock a std mutex, taking the data even if a holder panicked
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
