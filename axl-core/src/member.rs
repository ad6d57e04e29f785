use std::fmt;

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;

/// Role a node holds in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Leader,
    Replica,
    #[default]
    #[serde(other)]
    Unknown,
}

impl NodeRole {
    #[inline]
    #[must_use]
    pub fn is_leader(self) -> bool {
        self == Self::Leader
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Replica => write!(f, "replica"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One entry of a describe-cluster response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub role: NodeRole,
}

impl ClusterMember {
    pub fn new(host: impl Into<String>, port: u16, role: NodeRole) -> Self {
        Self {
            host: host.into(),
            port,
            role,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

/// Body of a describe-cluster response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescription {
    #[serde(default)]
    pub members: Vec<ClusterMember>,
}
