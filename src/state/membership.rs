//! Replica Set Membership
//!
//! Users, their replica sets, and the locally cached view of which
//! service provider id each peer endpoint is registered under.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::network::ServiceRegistry;

/// Role of a node for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Accepts the user's writes
    Primary,
    /// Replicates from the primary
    Secondary,
    /// Not in the user's replica set
    None,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "PRIMARY"),
            NodeRole::Secondary => write!(f, "SECONDARY"),
            NodeRole::None => write!(f, "NONE"),
        }
    }
}

/// Endpoints of a user's three replicas
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaSet {
    pub primary: String,
    pub secondary1: String,
    pub secondary2: String,
}

impl ReplicaSet {
    pub fn new(
        primary: impl Into<String>,
        secondary1: impl Into<String>,
        secondary2: impl Into<String>,
    ) -> Self {
        Self {
            primary: primary.into(),
            secondary1: secondary1.into(),
            secondary2: secondary2.into(),
        }
    }

    pub fn endpoints(&self) -> [&str; 3] {
        [&self.primary, &self.secondary1, &self.secondary2]
    }

    pub fn secondaries(&self) -> [&str; 2] {
        [&self.secondary1, &self.secondary2]
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.endpoints().contains(&endpoint)
    }

    pub fn role_of(&self, endpoint: &str) -> NodeRole {
        if self.primary == endpoint {
            NodeRole::Primary
        } else if self.secondary1 == endpoint || self.secondary2 == endpoint {
            NodeRole::Secondary
        } else {
            NodeRole::None
        }
    }
}

/// Registry ids of a user's three replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetSpIds {
    pub primary: u64,
    pub secondary1: u64,
    pub secondary2: u64,
}

/// A user whose replica set includes this node, as reported by discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUser {
    pub user_id: u64,
    pub wallet: String,
    pub primary: String,
    pub secondary1: String,
    pub secondary2: String,
    pub primary_sp_id: u64,
    pub secondary1_sp_id: u64,
    pub secondary2_sp_id: u64,
}

impl NodeUser {
    pub fn replica_set(&self) -> ReplicaSet {
        ReplicaSet::new(&self.primary, &self.secondary1, &self.secondary2)
    }

    pub fn sp_ids(&self) -> ReplicaSetSpIds {
        ReplicaSetSpIds {
            primary: self.primary_sp_id,
            secondary1: self.secondary1_sp_id,
            secondary2: self.secondary2_sp_id,
        }
    }

    /// Secondaries paired with the sp id discovery reported for them
    pub fn secondaries_with_sp_ids(&self) -> [(&str, u64); 2] {
        [
            (&self.secondary1, self.secondary1_sp_id),
            (&self.secondary2, self.secondary2_sp_id),
        ]
    }

    pub fn role_of(&self, endpoint: &str) -> NodeRole {
        self.replica_set().role_of(endpoint)
    }
}

/// A content node registered with the service registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    pub sp_id: u64,
    pub endpoint: String,
    /// Hex-encoded ed25519 verifying key of the node's delegate wallet
    pub delegate_public_key: String,
}

/// Read-through cache of peer endpoint to sp id.
///
/// The whole map is replaced at once so readers never see a partial refresh.
pub struct PeerSpIdCache {
    map: RwLock<Arc<HashMap<String, u64>>>,
    refreshed_at: RwLock<Option<Instant>>,
    ttl: Duration,
}

impl PeerSpIdCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            map: RwLock::new(Arc::new(HashMap::new())),
            refreshed_at: RwLock::new(None),
            ttl,
        }
    }

    /// Current map without refreshing
    pub async fn snapshot(&self) -> Arc<HashMap<String, u64>> {
        Arc::clone(&*self.map.read().await)
    }

    pub async fn sp_id_for(&self, endpoint: &str) -> Option<u64> {
        self.map.read().await.get(endpoint).copied()
    }

    pub async fn replace(&self, map: HashMap<String, u64>) {
        *self.map.write().await = Arc::new(map);
        *self.refreshed_at.write().await = Some(Instant::now());
    }

    pub async fn invalidate(&self) {
        *self.refreshed_at.write().await = None;
    }

    pub async fn is_stale(&self) -> bool {
        match *self.refreshed_at.read().await {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        }
    }

    /// Replace the map with the registry's current view. Returns the map size.
    pub async fn refresh(&self, registry: &dyn ServiceRegistry) -> Result<usize> {
        let nodes = registry.content_nodes().await?;
        let map: HashMap<String, u64> = nodes
            .into_iter()
            .map(|node| (node.endpoint, node.sp_id))
            .collect();
        let size = map.len();
        self.replace(map).await;
        tracing::debug!("Peer sp id map refreshed with {} nodes", size);
        Ok(size)
    }

    /// Current map, refreshing first if it expired
    pub async fn get_or_refresh(&self, registry: &dyn ServiceRegistry) -> Result<Arc<HashMap<String, u64>>> {
        if self.is_stale().await {
            self.refresh(registry).await?;
        }
        Ok(self.snapshot().await)
    }
}
