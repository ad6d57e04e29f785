//! Node-facing collaborator interfaces.
//!
//! A [`NodeConnector`] opens [`NodeClient`] connections to a single node. The
//! built-in implementation is [`crate::transport::TcpConnector`]; tests inject
//! their own through [`crate::ClusterClientBuilder::node_connector`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axl_core::{ClusterMember, CredentialsProvider, Endpoint};
use bytes::Bytes;

use crate::error::Result;

/// One live connection to one node
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Send an opaque accelerator request and wait for its response
    async fn request(&mut self, payload: Bytes) -> Result<Bytes>;

    /// Lightweight liveness probe, returns round-trip latency
    async fn ping(&mut self) -> Result<Duration>;

    /// Ask the node for the current cluster membership and roles
    async fn describe_cluster(&mut self) -> Result<Vec<ClusterMember>>;

    /// Close the connection
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens connections to a node
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &SessionOptions,
    ) -> Result<Box<dyn NodeClient>>;
}

/// Per-connection session parameters, fixed when a pool is created
#[derive(Clone)]
pub struct SessionOptions {
    pub region: String,
    pub user_agent: String,
    pub credentials: Option<Arc<dyn CredentialsProvider>>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            region: String::new(),
            user_agent: crate::DEFAULT_USER_AGENT.to_string(),
            credentials: None,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("region", &self.region)
            .field("user_agent", &self.user_agent)
            .field("credentials", &self.credentials.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}
