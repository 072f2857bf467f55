//! Network Module
//!
//! Seams to everything outside this node: peer content nodes, the service
//! registry, the discovery service and the blob store. Each trait has an
//! HTTP (or filesystem) implementation here.

mod blob;
mod client;
mod discovery;
mod registry;

pub use blob::{content_multihash, FsBlobStore};
pub use client::HttpPeerClient;
pub use discovery::HttpDiscovery;
pub use registry::HttpServiceRegistry;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::replication::protocol::{SyncRequest, SyncResponse, SyncStatus, WalletExport};
use crate::state::{ContentNode, NodeUser, ReplicaSet, ReplicaSetSpIds, UserClockStatus};

/// A user's replica set as seen by the registry
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WalletReplicaSet {
    pub user_id: u64,
    pub replica_set: ReplicaSet,
}

/// Source of truth for replica set membership
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn user_replica_set(&self, user_id: u64) -> Result<ReplicaSetSpIds>;

    /// None when the wallet has no registered user
    async fn replica_set_for_wallet(&self, wallet: &str) -> Result<Option<WalletReplicaSet>>;

    async fn content_nodes(&self) -> Result<Vec<ContentNode>>;

    /// Replace a replica set, failing if the registry no longer holds `old`
    async fn update_replica_set(&self, user_id: u64, new: ReplicaSetSpIds, old: ReplicaSetSpIds) -> Result<()>;
}

/// Calls to other content nodes
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn health_check(&self, endpoint: &str) -> Result<()>;

    async fn batch_clock_status(
        &self,
        endpoint: &str,
        wallets: &[String],
        include_files_hash: bool,
    ) -> Result<Vec<UserClockStatus>>;

    async fn clock_status(&self, endpoint: &str, wallet: &str) -> Result<u64>;

    async fn export(
        &self,
        endpoint: &str,
        wallet: &str,
        clock_range_min: u64,
        force_export: bool,
    ) -> Result<WalletExport>;

    async fn issue_sync(&self, endpoint: &str, request: &SyncRequest) -> Result<SyncResponse>;

    async fn sync_status(&self, endpoint: &str, sync_uuid: &str) -> Result<Option<SyncStatus>>;
}

/// Paged listing of the users a node serves
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn latest_user_id(&self) -> Result<u64>;

    /// Users with `user_id > prev_user_id` whose replica set includes `endpoint`, ordered by id
    async fn node_users(&self, endpoint: &str, prev_user_id: u64, max_users: usize) -> Result<Vec<NodeUser>>;
}

/// Content-addressed blob storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch a blob from the first gateway that has it and store it locally
    async fn fetch_and_save(&self, multihash: &str, gateways: &[String]) -> Result<()>;

    async fn contains(&self, multihash: &str) -> Result<bool>;

    async fn read(&self, multihash: &str) -> Result<Option<Vec<u8>>>;

    /// Store bytes, returning their multihash
    async fn save(&self, bytes: &[u8]) -> Result<String>;

    async fn delete(&self, multihashes: &[String]) -> Result<()>;
}

/// Outer deadline around a whole network operation
pub async fn with_deadline<T, F>(deadline: Duration, address: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
    }
}

/// Retry retryable errors with exponential backoff
pub async fn with_retry<T, F, Fut>(max_retries: u32, base_delay: Duration, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = base_delay * 2u32.saturating_pow(attempt);
                tracing::debug!("{} failed (attempt {}): {}, retrying in {:?}", what, attempt + 1, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read an error response body into a typed peer error
pub(crate) async fn peer_error(endpoint: &str, response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let message = match response.json::<serde_json::Value>().await {
        Ok(body) => body
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Err(_) => String::new(),
    };
    Error::Peer {
        endpoint: endpoint.to_string(),
        status,
        message,
    }
}
