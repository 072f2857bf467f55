//! Shared dependencies handed to every job processor and API handler.

use std::sync::Arc;
use std::time::Duration;

use crate::config::TriplicaConfig;
use crate::error::Result;
use crate::network::{BlobStore, Discovery, PeerClient, ServiceRegistry};
use crate::replication::SyncSigner;
use crate::state::{ClockLedger, EphemeralStore, PeerSpIdCache};
use crate::sync::{SecondarySyncHealthTracker, SyncRequestDeduplicator};

/// Dedup keys outlive any single sync by a wide margin
const SHARED_DEDUP_TTL: Duration = Duration::from_secs(6 * 60 * 60);

pub struct JobContext {
    pub config: TriplicaConfig,
    pub ledger: Arc<ClockLedger>,
    pub store: Arc<dyn EphemeralStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub registry: Arc<dyn ServiceRegistry>,
    pub peers: Arc<dyn PeerClient>,
    pub discovery: Arc<dyn Discovery>,
    pub signer: SyncSigner,
    pub dedup: SyncRequestDeduplicator,
    pub health: SecondarySyncHealthTracker,
    pub peer_sp_ids: PeerSpIdCache,
}

impl JobContext {
    pub fn new(
        config: TriplicaConfig,
        ledger: Arc<ClockLedger>,
        store: Arc<dyn EphemeralStore>,
        blobs: Arc<dyn BlobStore>,
        registry: Arc<dyn ServiceRegistry>,
        peers: Arc<dyn PeerClient>,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Self> {
        let signer = SyncSigner::from_hex(&config.node.delegate_private_key)?;
        let dedup = if config.sync.shared_dedup_store {
            SyncRequestDeduplicator::shared(Arc::clone(&store), SHARED_DEDUP_TTL)
        } else {
            SyncRequestDeduplicator::in_process()
        };
        let health = SecondarySyncHealthTracker::new(Arc::clone(&store), &config.sync);
        let peer_sp_ids = PeerSpIdCache::new(config.peer_sp_id_map_ttl());

        Ok(Self {
            config,
            ledger,
            store,
            blobs,
            registry,
            peers,
            discovery,
            signer,
            dedup,
            health,
            peer_sp_ids,
        })
    }

    /// This node's public endpoint
    pub fn self_endpoint(&self) -> &str {
        &self.config.node.endpoint
    }
}
