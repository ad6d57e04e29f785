//! In-memory cluster for exercising the client without a network.
//!
//! [`FakeCluster`] implements [`NodeConnector`] and can be injected through
//! [`crate::ClusterClientBuilder::node_connector`]. Membership, node outages and
//! describe failures are controlled from the test while the client runs.
//!
//! Only built for tests and with the `testing` feature.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axl_core::{ClusterMember, Endpoint};
use bytes::Bytes;

use crate::error::{ClientError, Result};
use crate::lock_unpoisoned;
use crate::node::{NodeClient, NodeConnector, SessionOptions};

#[derive(Debug, Default)]
struct FakeState {
    members: Vec<ClusterMember>,
    down: HashSet<Endpoint>,
    describe_failing: bool,
    latency: Duration,
    connects: HashMap<Endpoint, usize>,
    closes: HashMap<Endpoint, usize>,
    describes: usize,
    last_options: Option<SessionOptions>,
}

/// Shared, controllable cluster state
#[derive(Debug, Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCluster {
    pub fn new(members: Vec<ClusterMember>) -> Self {
        let cluster = Self::default();
        cluster.set_members(members);
        cluster
    }

    /// Membership returned by every later describe-cluster call
    pub fn set_members(&self, members: Vec<ClusterMember>) {
        lock_unpoisoned(&self.state).members = members;
    }

    /// A down node refuses connections and fails calls on open ones
    pub fn set_down(&self, endpoint: &Endpoint, down: bool) {
        let mut state = lock_unpoisoned(&self.state);
        if down {
            state.down.insert(endpoint.clone());
        } else {
            state.down.remove(endpoint);
        }
    }

    /// Make describe-cluster fail on every node
    pub fn set_describe_failing(&self, failing: bool) {
        lock_unpoisoned(&self.state).describe_failing = failing;
    }

    /// Delay every ping and describe-cluster call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        lock_unpoisoned(&self.state).latency = latency;
    }

    pub fn connect_count(&self, endpoint: &Endpoint) -> usize {
        lock_unpoisoned(&self.state)
            .connects
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }

    pub fn close_count(&self, endpoint: &Endpoint) -> usize {
        lock_unpoisoned(&self.state)
            .closes
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }

    pub fn describe_count(&self) -> usize {
        lock_unpoisoned(&self.state).describes
    }

    /// Session options of the most recent connect
    pub fn last_options(&self) -> Option<SessionOptions> {
        lock_unpoisoned(&self.state).last_options.clone()
    }

    async fn delay(&self) {
        let latency = lock_unpoisoned(&self.state).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn is_down(&self, endpoint: &Endpoint) -> bool {
        lock_unpoisoned(&self.state).down.contains(endpoint)
    }
}

#[async_trait]
impl NodeConnector for FakeCluster {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &SessionOptions,
    ) -> Result<Box<dyn NodeClient>> {
        let mut state = lock_unpoisoned(&self.state);
        state.last_options = Some(options.clone());
        if state.down.contains(endpoint) {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} is down", endpoint),
            )));
        }
        *state.connects.entry(endpoint.clone()).or_default() += 1;

        Ok(Box::new(FakeNodeClient {
            endpoint: endpoint.clone(),
            cluster: self.clone(),
        }))
    }
}

struct FakeNodeClient {
    endpoint: Endpoint,
    cluster: FakeCluster,
}

impl FakeNodeClient {
    fn check_up(&self) -> Result<()> {
        if self.cluster.is_down(&self.endpoint) {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl NodeClient for FakeNodeClient {
    /// Echoes `"<endpoint>:<payload>"`; the payload `fail` yields a node error
    async fn request(&mut self, payload: Bytes) -> Result<Bytes> {
        self.check_up()?;
        if payload.as_ref() == b"fail" {
            return Err(ClientError::Server("ValidationException".to_string()));
        }
        let mut reply = format!("{}:", self.endpoint).into_bytes();
        reply.extend_from_slice(&payload);
        Ok(Bytes::from(reply))
    }

    async fn ping(&mut self) -> Result<Duration> {
        self.cluster.delay().await;
        self.check_up()?;
        Ok(Duration::from_micros(50))
    }

    async fn describe_cluster(&mut self) -> Result<Vec<ClusterMember>> {
        self.cluster.delay().await;
        self.check_up()?;
        let mut state = lock_unpoisoned(&self.cluster.state);
        state.describes += 1;
        if state.describe_failing {
            return Err(ClientError::Server("describe unavailable".to_string()));
        }
        Ok(state.members.clone())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut state = lock_unpoisoned(&self.cluster.state);
        *state.closes.entry(self.endpoint.clone()).or_default() += 1;
        Ok(())
    }
}
