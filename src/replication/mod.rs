//! Replication Module
//!
//! Moving ledger contents between the replicas of a user: the primary's
//! export, the secondary's import, the primary's reverse merge, and the
//! signed force-resync and force-wipe paths.

pub mod protocol;
mod auth;
mod export;
mod import;
mod merge;

pub use auth::{verify_force_sync, ForceAction, SyncSigner, FORCE_SYNC_SIGNATURE_MAX_AGE_SECS};
pub use export::export_wallet;
pub use import::{secondary_sync_from_primary, SecondarySyncParams, SyncOutcome};
pub use merge::primary_sync_from_secondary;
pub use protocol::{SyncResult, SyncStatus, WalletExport};

use std::time::Duration;

use crate::error::Result;
use crate::state::EphemeralStore;

/// Sync statuses stay queryable for two days
const SYNC_STATUS_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// Advisory per-wallet lock shared by imports, merges and wipes.
///
/// Acquisition never waits: a held lock means another sync is running.
pub struct WalletLock;

impl WalletLock {
    fn key(wallet: &str) -> String {
        format!("wallet_sync_lock:{}", wallet)
    }

    pub async fn acquire(store: &dyn EphemeralStore, wallet: &str, holder: &str, ttl: Duration) -> Result<bool> {
        store.set_nx_ex(&Self::key(wallet), holder, ttl).await
    }

    /// Release the lock if `holder` still owns it. A lock that expired and
    /// was taken by another sync is left alone.
    pub async fn release(store: &dyn EphemeralStore, wallet: &str, holder: &str) -> Result<bool> {
        store.del_if_eq(&Self::key(wallet), holder).await
    }

    pub async fn holder(store: &dyn EphemeralStore, wallet: &str) -> Result<Option<String>> {
        store.get(&Self::key(wallet)).await
    }
}

fn sync_status_key(sync_uuid: &str) -> String {
    format!("sync_status:{}", sync_uuid)
}

pub async fn record_sync_status(store: &dyn EphemeralStore, status: &SyncStatus) -> Result<()> {
    let value = serde_json::to_string(status)?;
    store
        .set_ex(&sync_status_key(&status.sync_uuid), &value, SYNC_STATUS_TTL)
        .await
}

pub async fn get_sync_status(store: &dyn EphemeralStore, sync_uuid: &str) -> Result<Option<SyncStatus>> {
    match store.get(&sync_status_key(sync_uuid)).await? {
        Some(value) => Ok(Some(serde_json::from_str(&value)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;

    #[tokio::test]
    async fn test_wallet_lock_fails_fast() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(WalletLock::acquire(&store, "0xabc", "sync-1", ttl).await.unwrap());
        assert!(!WalletLock::acquire(&store, "0xabc", "sync-2", ttl).await.unwrap());
        assert!(WalletLock::acquire(&store, "0xdef", "sync-3", ttl).await.unwrap());
        assert_eq!(WalletLock::holder(&store, "0xabc").await.unwrap(), Some("sync-1".into()));

        assert!(WalletLock::release(&store, "0xabc", "sync-1").await.unwrap());
        assert!(WalletLock::acquire(&store, "0xabc", "sync-2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_holder_keeps_hands_off_a_retaken_lock() {
        let store = MemoryStore::new();
        assert!(WalletLock::acquire(&store, "0xabc", "slow", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(WalletLock::acquire(&store, "0xabc", "fresh", Duration::from_secs(60)).await.unwrap());

        assert!(!WalletLock::release(&store, "0xabc", "slow").await.unwrap());
        assert_eq!(WalletLock::holder(&store, "0xabc").await.unwrap(), Some("fresh".into()));
        assert!(!WalletLock::acquire(&store, "0xabc", "other", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_status_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(get_sync_status(&store, "u-1").await.unwrap(), None);

        let status = SyncStatus {
            sync_uuid: "u-1".into(),
            wallet: "0xabc".into(),
            result: SyncResult::FailureImportNotContiguous,
            error: Some("gap".into()),
            updated_at: chrono::Utc::now(),
        };
        record_sync_status(&store, &status).await.unwrap();
        assert_eq!(get_sync_status(&store, "u-1").await.unwrap(), Some(status));
    }
}
