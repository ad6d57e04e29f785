//! Cluster topology snapshots.
//!
//! A [`Topology`] is immutable once published. Node health lives behind a
//! per-node mutex shared between successive generations, so the health-check
//! loop can change eligibility without republishing the node set.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axl_core::{ClusterMember, Endpoint, NodeRole};

use crate::lock_unpoisoned;

/// Health of a node as seen by the health-check loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    /// Seen in a topology response but not yet checked (a candidate)
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Point-in-time copy of a node's health state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeHealth {
    pub status: HealthStatus,
    pub last_checked: Option<Instant>,
    pub consecutive_failures: u32,
}

impl NodeHealth {
    /// Record a passed check. Returns the previous status if it changed.
    fn record_success(&mut self) -> Option<HealthStatus> {
        let previous = self.status;
        self.status = HealthStatus::Healthy;
        self.consecutive_failures = 0;
        self.last_checked = Some(Instant::now());
        (previous != HealthStatus::Healthy).then_some(previous)
    }

    /// Record a failed check. Returns the previous status if it changed.
    fn record_failure(&mut self, failure_threshold: u32) -> Option<HealthStatus> {
        let previous = self.status;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_checked = Some(Instant::now());
        if self.consecutive_failures >= failure_threshold {
            self.status = HealthStatus::Unhealthy;
        }
        (previous != self.status).then_some(previous)
    }
}

/// One cluster member within a topology generation
#[derive(Debug, Clone)]
pub struct Node {
    endpoint: Endpoint,
    role: NodeRole,
    missed_refreshes: u32,
    health: Arc<Mutex<NodeHealth>>,
}

impl Node {
    /// A freshly discovered candidate
    pub fn new(endpoint: Endpoint, role: NodeRole) -> Self {
        Self {
            endpoint,
            role,
            missed_refreshes: 0,
            health: Arc::new(Mutex::new(NodeHealth::default())),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn host(&self) -> &str {
        &self.endpoint.host
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    /// Consecutive refreshes that omitted this node
    pub fn missed_refreshes(&self) -> u32 {
        self.missed_refreshes
    }

    pub fn health(&self) -> NodeHealth {
        *lock_unpoisoned(&self.health)
    }

    pub fn status(&self) -> HealthStatus {
        lock_unpoisoned(&self.health).status
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    pub(crate) fn record_success(&self) -> Option<HealthStatus> {
        lock_unpoisoned(&self.health).record_success()
    }

    /// Returns the new failure count and the previous status if it changed
    pub(crate) fn record_failure(&self, failure_threshold: u32) -> (u32, Option<HealthStatus>) {
        let mut health = lock_unpoisoned(&self.health);
        let transition = health.record_failure(failure_threshold);
        (health.consecutive_failures, transition)
    }
}

/// Result of merging a describe-cluster response into a topology
#[derive(Debug)]
pub struct TopologyUpdate {
    pub topology: Topology,
    /// Nodes seen for the first time
    pub added: Vec<Endpoint>,
    /// Nodes dropped after too many omitting refreshes
    pub removed: Vec<Endpoint>,
    /// Extra leaders demoted to replica
    pub demoted: Vec<Endpoint>,
}

/// Immutable, versioned view of cluster membership
#[derive(Debug, Clone, Default)]
pub struct Topology {
    generation: u64,
    nodes: Vec<Node>,
}

impl Topology {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.endpoint == endpoint)
    }

    pub fn leader(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.is_leader())
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_healthy()).count()
    }

    pub fn healthy_leader_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.is_leader() && n.is_healthy())
            .count()
    }

    /// Build the next generation from a describe-cluster response
    ///
    /// Persisting nodes keep their health state. Nodes missing from `members`
    /// stay (with an unknown role) until they have been missing for
    /// `removal_threshold` consecutive refreshes. Only the first leader in
    /// `members` keeps the leader role.
    pub fn merge(&self, members: &[ClusterMember], removal_threshold: u32) -> TopologyUpdate {
        let mut seen = HashSet::with_capacity(members.len());
        let mut nodes = Vec::with_capacity(members.len().max(self.nodes.len()));
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut demoted = Vec::new();
        let mut has_leader = false;

        for member in members {
            let endpoint = member.endpoint();
            if !seen.insert(endpoint.clone()) {
                continue;
            }

            let mut role = member.role;
            if role.is_leader() {
                if has_leader {
                    demoted.push(endpoint.clone());
                    role = NodeRole::Replica;
                } else {
                    has_leader = true;
                }
            }

            match self.get(&endpoint) {
                Some(prev) => nodes.push(Node {
                    endpoint,
                    role,
                    missed_refreshes: 0,
                    health: Arc::clone(&prev.health),
                }),
                None => {
                    added.push(endpoint.clone());
                    nodes.push(Node::new(endpoint, role));
                },
            }
        }

        for prev in &self.nodes {
            if seen.contains(&prev.endpoint) {
                continue;
            }

            let missed = prev.missed_refreshes.saturating_add(1);
            if missed >= removal_threshold.max(1) {
                removed.push(prev.endpoint.clone());
                continue;
            }

            nodes.push(Node {
                endpoint: prev.endpoint.clone(),
                role: NodeRole::Unknown,
                missed_refreshes: missed,
                health: Arc::clone(&prev.health),
            });
        }

        TopologyUpdate {
            topology: Topology {
                generation: self.generation + 1,
                nodes,
            },
            added,
            removed,
            demoted,
        }
    }
}
