//! Sync request deduplication.
//!
//! At most one waiting sync exists per (sync type, wallet, secondary,
//! immediate). The key is released when the job moves from waiting to
//! active, so a sync enqueued while another runs is kept.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{SyncJob, SyncType};
use crate::error::Result;
use crate::state::EphemeralStore;

/// Backing storage for dedup keys
#[async_trait]
pub trait SyncDedupStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `job_id` unless the key is held. Returns the holder if it was.
    async fn claim(&self, key: &str, job_id: &str) -> Result<Option<String>>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// Dedup keys held in this process only
#[derive(Default)]
pub struct InProcessDedupStore {
    keys: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl SyncDedupStore for InProcessDedupStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.keys.read().await.get(key).cloned())
    }

    async fn claim(&self, key: &str, job_id: &str) -> Result<Option<String>> {
        let mut keys = self.keys.write().await;
        if let Some(existing) = keys.get(key) {
            return Ok(Some(existing.clone()));
        }
        keys.insert(key.to_string(), job_id.to_string());
        Ok(None)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.keys.write().await.remove(key);
        Ok(())
    }
}

/// Dedup keys shared through the ephemeral store
pub struct SharedDedupStore {
    store: Arc<dyn EphemeralStore>,
    /// Upper bound on how long an orphaned key can block new syncs
    ttl: Duration,
}

impl SharedDedupStore {
    pub fn new(store: Arc<dyn EphemeralStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn store_key(key: &str) -> String {
        format!("sync_dedup:{}", key)
    }
}

#[async_trait]
impl SyncDedupStore for SharedDedupStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.store.get(&Self::store_key(key)).await
    }

    async fn claim(&self, key: &str, job_id: &str) -> Result<Option<String>> {
        let store_key = Self::store_key(key);
        if self.store.set_nx_ex(&store_key, job_id, self.ttl).await? {
            return Ok(None);
        }
        // Fall back to our own id if the holder expired in between
        Ok(Some(
            self.store
                .get(&store_key)
                .await?
                .unwrap_or_else(|| job_id.to_string()),
        ))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.store.del(&Self::store_key(key)).await?;
        Ok(())
    }
}

/// Result of asking for a sync that may already be queued
#[derive(Debug, Clone, PartialEq)]
pub enum SyncReqOutcome {
    /// An equivalent sync is already waiting
    Duplicate { job_id: String },
    /// A new sync, already recorded, to be enqueued by the caller
    New(SyncJob),
}

pub struct SyncRequestDeduplicator {
    backend: Arc<dyn SyncDedupStore>,
}

impl SyncRequestDeduplicator {
    pub fn new(backend: Arc<dyn SyncDedupStore>) -> Self {
        Self { backend }
    }

    pub fn in_process() -> Self {
        Self::new(Arc::new(InProcessDedupStore::default()))
    }

    pub fn shared(store: Arc<dyn EphemeralStore>, ttl: Duration) -> Self {
        Self::new(Arc::new(SharedDedupStore::new(store, ttl)))
    }

    pub fn key(sync_type: SyncType, wallet: &str, secondary: &str, immediate: bool) -> String {
        format!("{}:{}:{}:{}", sync_type, wallet, secondary, immediate)
    }

    fn job_key(job: &SyncJob) -> String {
        Self::key(job.sync_type, &job.wallet, &job.secondary_endpoint, job.immediate)
    }

    pub async fn record_sync(&self, job: &SyncJob) -> Result<()> {
        self.backend.claim(&Self::job_key(job), &job.job_id).await?;
        Ok(())
    }

    pub async fn get_duplicate_sync_job_info(
        &self,
        sync_type: SyncType,
        wallet: &str,
        secondary: &str,
        immediate: bool,
    ) -> Result<Option<String>> {
        self.backend
            .get(&Self::key(sync_type, wallet, secondary, immediate))
            .await
    }

    pub async fn remove_sync(&self, sync_type: SyncType, wallet: &str, secondary: &str, immediate: bool) -> Result<()> {
        self.backend
            .remove(&Self::key(sync_type, wallet, secondary, immediate))
            .await
    }

    /// Release the key of a job that just became active
    pub async fn remove_job(&self, job: &SyncJob) -> Result<()> {
        self.backend.remove(&Self::job_key(job)).await
    }

    /// Return the waiting duplicate of `job`, or record `job` and return it
    pub async fn get_new_or_existing_sync_req(&self, job: SyncJob) -> Result<SyncReqOutcome> {
        match self.backend.claim(&Self::job_key(&job), &job.job_id).await? {
            Some(job_id) if job_id != job.job_id => Ok(SyncReqOutcome::Duplicate { job_id }),
            _ => Ok(SyncReqOutcome::New(job)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use crate::sync::SyncMode;

    fn job(sync_type: SyncType, secondary: &str) -> SyncJob {
        SyncJob::new(sync_type, SyncMode::SyncSecondaryFromPrimary, "0xabc", "http://cn1", secondary)
    }

    async fn exercise(dedup: SyncRequestDeduplicator) {
        let first = match dedup.get_new_or_existing_sync_req(job(SyncType::Recurring, "http://cn2")).await.unwrap() {
            SyncReqOutcome::New(job) => job,
            other => panic!("expected a new job, got {:?}", other),
        };

        // Same key while waiting: duplicate with the first job's id
        let second = dedup
            .get_new_or_existing_sync_req(job(SyncType::Recurring, "http://cn2"))
            .await
            .unwrap();
        assert_eq!(second, SyncReqOutcome::Duplicate { job_id: first.job_id.clone() });

        // Different key components are independent
        assert!(matches!(
            dedup.get_new_or_existing_sync_req(job(SyncType::Manual, "http://cn2")).await.unwrap(),
            SyncReqOutcome::New(_)
        ));
        assert!(matches!(
            dedup.get_new_or_existing_sync_req(job(SyncType::Recurring, "http://cn3")).await.unwrap(),
            SyncReqOutcome::New(_)
        ));
        assert!(matches!(
            dedup
                .get_new_or_existing_sync_req(job(SyncType::Recurring, "http://cn2").immediate(true))
                .await
                .unwrap(),
            SyncReqOutcome::New(_)
        ));

        // Once active, the key is free again
        dedup.remove_job(&first).await.unwrap();
        assert_eq!(
            dedup
                .get_duplicate_sync_job_info(SyncType::Recurring, "0xabc", "http://cn2", false)
                .await
                .unwrap(),
            None
        );
        assert!(matches!(
            dedup.get_new_or_existing_sync_req(job(SyncType::Recurring, "http://cn2")).await.unwrap(),
            SyncReqOutcome::New(_)
        ));
    }

    #[tokio::test]
    async fn test_in_process_dedup() {
        exercise(SyncRequestDeduplicator::in_process()).await;
    }

    #[tokio::test]
    async fn test_shared_dedup() {
        let store = Arc::new(MemoryStore::new());
        exercise(SyncRequestDeduplicator::shared(store, Duration::from_secs(60))).await;
    }

    #[tokio::test]
    async fn test_shared_dedup_is_visible_across_instances() {
        let store: Arc<dyn EphemeralStore> = Arc::new(MemoryStore::new());
        let a = SyncRequestDeduplicator::shared(Arc::clone(&store), Duration::from_secs(60));
        let b = SyncRequestDeduplicator::shared(store, Duration::from_secs(60));

        let j = job(SyncType::Manual, "http://cn2");
        a.record_sync(&j).await.unwrap();
        assert_eq!(
            b.get_duplicate_sync_job_info(SyncType::Manual, "0xabc", "http://cn2", false)
                .await
                .unwrap(),
            Some(j.job_id.clone())
        );
        b.remove_sync(SyncType::Manual, "0xabc", "http://cn2", false).await.unwrap();
        assert_eq!(
            a.get_duplicate_sync_job_info(SyncType::Manual, "0xabc", "http://cn2", false)
                .await
                .unwrap(),
            None
        );
    }
}
