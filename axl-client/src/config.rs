//! Cluster client configuration.
//!
//! [`ClusterConfig`] carries everything the client needs, including injected
//! capabilities such as the credentials provider. [`ClusterSettings`] is the
//! data-only subset that can be loaded from a `.toml` or `.json` file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axl_core::{CredentialsProvider, Endpoint, parse_endpoints};
use serde::{Deserialize, Serialize};

use crate::DEFAULT_USER_AGENT;
use crate::error::{ClientError, Result};
use crate::node::SessionOptions;
use crate::pool::PoolConfig;
use crate::router::RouterConfig;

/// Configuration for a [`crate::ClusterClient`]
#[derive(Clone)]
pub struct ClusterConfig {
    pub region_name: String,
    /// Seed endpoints, `"host"` or `"host:port"`
    pub discovery_endpoints: Vec<String>,
    pub credentials_provider: Option<Arc<dyn CredentialsProvider>>,
    pub user_agent: String,
    /// Appended to `user_agent`, separated by a space
    pub user_agent_extra: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub topology_refresh_interval: Duration,
    pub health_check_interval: Duration,
    /// Idle-reap period; also the idle age after which a connection is closed
    pub idle_reap_interval: Duration,
    pub failure_threshold: u32,
    pub removal_threshold: u32,
    pub max_connections_per_node: usize,
    pub acquire_timeout: Duration,
    /// Poll period of `wait_for_routes`
    pub route_poll_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            region_name: String::new(),
            discovery_endpoints: Vec::new(),
            credentials_provider: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            user_agent_extra: None,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            topology_refresh_interval: Duration::from_secs(4),
            health_check_interval: Duration::from_secs(5),
            idle_reap_interval: Duration::from_secs(30),
            failure_threshold: 3,
            removal_threshold: 3,
            max_connections_per_node: 10,
            acquire_timeout: Duration::from_secs(5),
            route_poll_interval: Duration::from_millis(100),
        }
    }
}

impl ClusterConfig {
    pub fn new<S: Into<String>>(region_name: impl Into<String>, discovery_endpoints: Vec<S>) -> Self {
        Self {
            region_name: region_name.into(),
            discovery_endpoints: discovery_endpoints.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_credentials_provider(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials_provider = Some(provider);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_user_agent_extra(mut self, extra: impl Into<String>) -> Self {
        self.user_agent_extra = Some(extra.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_topology_refresh_interval(mut self, interval: Duration) -> Self {
        self.topology_refresh_interval = interval;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_idle_reap_interval(mut self, interval: Duration) -> Self {
        self.idle_reap_interval = interval;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_removal_threshold(mut self, threshold: u32) -> Self {
        self.removal_threshold = threshold;
        self
    }

    pub fn with_max_connections_per_node(mut self, n: usize) -> Self {
        self.max_connections_per_node = n;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_route_poll_interval(mut self, interval: Duration) -> Self {
        self.route_poll_interval = interval;
        self
    }

    /// User agent sent to nodes, with `user_agent_extra` appended
    pub fn full_user_agent(&self) -> String {
        match self.user_agent_extra.as_deref().map(str::trim) {
            Some(extra) if !extra.is_empty() => format!("{} {}", self.user_agent, extra),
            _ => self.user_agent.clone(),
        }
    }

    /// Check the configuration and parse the discovery endpoints
    ///
    /// # Errors
    /// Returns [`ClientError::Config`] for an empty or unparseable seed list,
    /// a zero threshold or pool size, or a zero interval.
    pub fn validate(&self) -> Result<Vec<Endpoint>> {
        if self.discovery_endpoints.is_empty() {
            return Err(ClientError::Config(
                "at least one discovery endpoint is required".to_string(),
            ));
        }
        let seeds = parse_endpoints(&self.discovery_endpoints)
            .map_err(|e| ClientError::Config(e.to_string()))?;

        if self.failure_threshold == 0 || self.removal_threshold == 0 {
            return Err(ClientError::Config(
                "failure and removal thresholds must be at least 1".to_string(),
            ));
        }
        if self.max_connections_per_node == 0 {
            return Err(ClientError::Config(
                "max_connections_per_node must be at least 1".to_string(),
            ));
        }

        let intervals = [
            ("topology_refresh_interval", self.topology_refresh_interval),
            ("health_check_interval", self.health_check_interval),
            ("idle_reap_interval", self.idle_reap_interval),
            ("route_poll_interval", self.route_poll_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ClientError::Config(format!("{} must be non-zero", name)));
        }

        Ok(seeds)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            region: self.region_name.clone(),
            user_agent: self.full_user_agent(),
            credentials: self.credentials_provider.clone(),
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .with_max_connections(self.max_connections_per_node)
            .with_acquire_timeout(self.acquire_timeout)
            .with_idle_timeout(self.idle_reap_interval)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            refresh_interval: self.topology_refresh_interval,
            health_check_interval: self.health_check_interval,
            failure_threshold: self.failure_threshold,
            removal_threshold: self.removal_threshold,
        }
    }
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("region_name", &self.region_name)
            .field("discovery_endpoints", &self.discovery_endpoints)
            .field("credentials_provider", &self.credentials_provider.is_some())
            .field("user_agent", &self.full_user_agent())
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("topology_refresh_interval", &self.topology_refresh_interval)
            .field("health_check_interval", &self.health_check_interval)
            .field("idle_reap_interval", &self.idle_reap_interval)
            .field("failure_threshold", &self.failure_threshold)
            .field("removal_threshold", &self.removal_threshold)
            .field("max_connections_per_node", &self.max_connections_per_node)
            .finish_non_exhaustive()
    }
}

/// File-loadable settings; durations are in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub region_name: String,
    pub discovery_endpoints: Vec<String>,
    pub user_agent: Option<String>,
    pub user_agent_extra: Option<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub topology_refresh_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub idle_reap_interval_ms: u64,
    pub failure_threshold: u32,
    pub removal_threshold: u32,
    pub max_connections_per_node: usize,
    pub acquire_timeout_ms: u64,
    pub route_poll_interval_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        let defaults = ClusterConfig::default();
        Self {
            region_name: defaults.region_name,
            discovery_endpoints: defaults.discovery_endpoints,
            user_agent: None,
            user_agent_extra: None,
            connect_timeout_ms: millis(defaults.connect_timeout),
            read_timeout_ms: millis(defaults.read_timeout),
            topology_refresh_interval_ms: millis(defaults.topology_refresh_interval),
            health_check_interval_ms: millis(defaults.health_check_interval),
            idle_reap_interval_ms: millis(defaults.idle_reap_interval),
            failure_threshold: defaults.failure_threshold,
            removal_threshold: defaults.removal_threshold,
            max_connections_per_node: defaults.max_connections_per_node,
            acquire_timeout_ms: millis(defaults.acquire_timeout),
            route_poll_interval_ms: millis(defaults.route_poll_interval),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl ClusterSettings {
    /// Load settings from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| ClientError::Config(format!("TOML parse error: {}", e))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| ClientError::Config(format!("JSON parse error: {}", e))),
            _ => Err(ClientError::Config(format!(
                "Unknown config file extension: {}",
                ext
            ))),
        }
    }

    pub fn into_config(self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            region_name: self.region_name,
            discovery_endpoints: self.discovery_endpoints,
            credentials_provider: None,
            user_agent: self.user_agent.unwrap_or(defaults.user_agent),
            user_agent_extra: self.user_agent_extra,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            topology_refresh_interval: Duration::from_millis(self.topology_refresh_interval_ms),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            idle_reap_interval: Duration::from_millis(self.idle_reap_interval_ms),
            failure_threshold: self.failure_threshold,
            removal_threshold: self.removal_threshold,
            max_connections_per_node: self.max_connections_per_node,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            route_poll_interval: Duration::from_millis(self.route_poll_interval_ms),
        }
    }
}
