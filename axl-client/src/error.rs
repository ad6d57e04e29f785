use std::time::Duration;

use axl_core::{AxlError, Endpoint};
use thiserror::Error;

/// Errors that can occur during client operations
#[derive(Error, Debug)]
pub enum ClientError {
    /// No node currently qualifies for the requested role
    #[error("No route to a {0} node")]
    NoRoute(RouteKind),

    /// `start()` did not observe the requested routes before its deadline
    #[error(
        "Cluster unavailable: wanted {min_healthy} healthy node(s) with {leader_min} leader(s), saw {healthy} healthy and {leaders} leader(s) after {waited:?}"
    )]
    ClusterUnavailable {
        min_healthy: usize,
        leader_min: usize,
        healthy: usize,
        leaders: usize,
        waited: Duration,
    },

    /// The client (or pool) has been closed
    #[error("Client closed")]
    ClientClosed,

    /// Opening a connection to a node failed
    #[error("Connection to {endpoint} failed: {source}")]
    ConnectFailure {
        endpoint: Endpoint,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Connection was closed by the node
    #[error("Connection closed by node")]
    ConnectionClosed,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Every connection to the node is checked out
    #[error("Connection pool for {0} exhausted")]
    PoolExhausted(Endpoint),

    /// I/O error during communication
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Codec, endpoint or credential error from the core crate
    #[error(transparent)]
    Core(#[from] AxlError),

    /// Received an unexpected or invalid response from the node
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The node answered with an error frame
    #[error("Node error: {0}")]
    Server(String),

    /// Invalid client configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Which kind of node a routing query was looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Any,
    Leader,
}

impl std::fmt::Display for RouteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "healthy"),
            Self::Leader => write!(f, "leader"),
        }
    }
}

impl ClientError {
    /// Wrap any per-node connection error as [`ClientError::ConnectFailure`]
    pub fn connect_failure(endpoint: &Endpoint, err: ClientError) -> Self {
        match err {
            Self::ConnectFailure { .. } | Self::ClientClosed => err,
            other => Self::ConnectFailure {
                endpoint: endpoint.clone(),
                source: Box::new(other),
            },
        }
    }

    /// Returns true if the caller may retry, possibly against another node
    pub fn is_retryable(&self) -> bool {
        match self {
            // Topology may converge on a later refresh
            Self::NoRoute(_) => true,
            // Connection-level failures: pick another node and retry
            Self::ConnectFailure { .. }
            | Self::ConnectionClosed
            | Self::Io(_)
            | Self::Timeout
            | Self::PoolExhausted(_) => true,
            // Non-retryable: ClientClosed, ClusterUnavailable, Core, InvalidResponse,
            // Server, Config
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
