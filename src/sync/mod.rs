//! Sync Module
//!
//! Deciding whether a secondary needs a sync, deduplicating queued syncs,
//! tracking secondary health, and issuing and monitoring syncs.

pub mod coordinator;
mod dedup;
mod health;
mod mode;

pub use dedup::{InProcessDedupStore, SharedDedupStore, SyncDedupStore, SyncReqOutcome, SyncRequestDeduplicator};
pub use health::{SecondarySyncHealthTracker, SyncOutcomeCounts};
pub use mode::{compute_sync_mode, UserInfo};

use serde::{Deserialize, Serialize};

/// Who asked for a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Issued after a write on the primary
    Manual,
    /// Issued by the state monitor
    Recurring,
}

impl SyncType {
    pub const ALL: [SyncType; 2] = [SyncType::Manual, SyncType::Recurring];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Manual => "manual",
            SyncType::Recurring => "recurring",
        }
    }
}

impl std::fmt::Display for SyncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a sync between a primary and one secondary has to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    None,
    /// Secondary imports the primary's newer records
    SyncSecondaryFromPrimary,
    /// Primary pulls the secondary's unique records, then force-resyncs the secondary
    MergePrimaryAndSecondary,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::None => write!(f, "none"),
            SyncMode::SyncSecondaryFromPrimary => write!(f, "sync_secondary_from_primary"),
            SyncMode::MergePrimaryAndSecondary => write!(f, "merge_primary_and_secondary"),
        }
    }
}

/// A queued sync from a primary to one secondary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub job_id: String,
    pub sync_type: SyncType,
    pub sync_mode: SyncMode,
    pub wallet: String,
    pub primary_endpoint: String,
    pub secondary_endpoint: String,
    /// 1 for the first attempt of a chain
    pub attempt_number: u32,
    pub immediate: bool,
}

impl SyncJob {
    pub fn new(
        sync_type: SyncType,
        sync_mode: SyncMode,
        wallet: impl Into<String>,
        primary_endpoint: impl Into<String>,
        secondary_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            sync_type,
            sync_mode,
            wallet: wallet.into(),
            primary_endpoint: primary_endpoint.into(),
            secondary_endpoint: secondary_endpoint.into(),
            attempt_number: 1,
            immediate: false,
        }
    }

    pub fn with_attempt(mut self, attempt_number: u32) -> Self {
        self.attempt_number = attempt_number;
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }
}
