//! Replication Protocol
//!
//! Wire types exchanged between replicas over HTTP.

use serde::{Deserialize, Serialize};

use crate::state::{ClockRecord, DataRow, UserClockStatus};

// ========== Export ==========

/// Query of `GET /export`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportQuery {
    pub wallet: String,
    #[serde(default)]
    pub clock_range_min: u64,
    #[serde(default)]
    pub force_export: bool,
}

/// One page of a user's ledger served by `GET /export`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletExport {
    pub wallet: String,
    /// Highest clock included in this page
    pub clock: u64,
    /// The exporter's full clock for the user
    pub latest_clock: u64,
    /// Clock range the caller asked for
    #[serde(default)]
    pub requested_clock_range_min: u64,
    #[serde(default)]
    pub requested_clock_range_max: u64,
    pub clock_records: Vec<ClockRecord>,
    pub rows: Vec<DataRow>,
}

impl WalletExport {
    /// Whether this page reaches the exporter's latest clock
    pub fn is_last_page(&self) -> bool {
        self.clock >= self.latest_clock
    }
}

// ========== Sync ==========

/// Body of `POST /sync`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRequest {
    pub wallet: Vec<String>,
    /// Endpoint of the node the secondary should export from
    pub creator_node_endpoint: String,
    #[serde(default)]
    pub immediate: bool,
    #[serde(default)]
    pub force_resync: bool,
    #[serde(default)]
    pub force_wipe: bool,
    /// Unix seconds the force flags were signed at
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Hex ed25519 signature over the force flags
    #[serde(default)]
    pub signature: Option<String>,
    /// Status id chosen by the caller; only valid for a single wallet
    #[serde(default)]
    pub sync_uuid: Option<String>,
    /// Chain block the caller observed the write at
    #[serde(default)]
    pub block_number: Option<u64>,
}

/// One accepted wallet of a `POST /sync`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTicket {
    pub wallet: String,
    pub sync_uuid: String,
    /// Present when the sync ran immediately
    #[serde(default)]
    pub result: Option<SyncResult>,
}

/// Response of `POST /sync`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub syncs: Vec<SyncTicket>,
}

/// Outcome of one secondary-side sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncResult {
    Pending,
    Success,
    SuccessClocksAlreadyMatch,
    SuccessForceWipe,
    AbortSyncInProgress,
    AbortCurrentNodeIsNotUserPrimary,
    AbortCurrentNodeIsUserPrimary,
    AbortCurrentNodeIsNotUserSecondary,
    AbortForceWipeDisabled,
    FailureFetchingUserReplicaSet,
    FailureForceResyncCheck,
    FailureDeleteDbData,
    FailureExportWallet,
    FailureInconsistentClock,
    FailureImportNotContiguous,
    FailureImportNotConsistent,
    FailureSkipThresholdNotReached,
    FailureDbTransaction,
    FailureSyncSecondaryFromPrimary,
}

impl SyncResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncResult::Pending => "pending",
            SyncResult::Success => "success",
            SyncResult::SuccessClocksAlreadyMatch => "success_clocks_already_match",
            SyncResult::SuccessForceWipe => "success_force_wipe",
            SyncResult::AbortSyncInProgress => "abort_sync_in_progress",
            SyncResult::AbortCurrentNodeIsNotUserPrimary => "abort_current_node_is_not_user_primary",
            SyncResult::AbortCurrentNodeIsUserPrimary => "abort_current_node_is_user_primary",
            SyncResult::AbortCurrentNodeIsNotUserSecondary => "abort_current_node_is_not_user_secondary",
            SyncResult::AbortForceWipeDisabled => "abort_force_wipe_disabled",
            SyncResult::FailureFetchingUserReplicaSet => "failure_fetching_user_replica_set",
            SyncResult::FailureForceResyncCheck => "failure_force_resync_check",
            SyncResult::FailureDeleteDbData => "failure_delete_db_data",
            SyncResult::FailureExportWallet => "failure_export_wallet",
            SyncResult::FailureInconsistentClock => "failure_inconsistent_clock",
            SyncResult::FailureImportNotContiguous => "failure_import_not_contiguous",
            SyncResult::FailureImportNotConsistent => "failure_import_not_consistent",
            SyncResult::FailureSkipThresholdNotReached => "failure_skip_threshold_not_reached",
            SyncResult::FailureDbTransaction => "failure_db_transaction",
            SyncResult::FailureSyncSecondaryFromPrimary => "failure_sync_secondary_from_primary",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SyncResult::Success | SyncResult::SuccessClocksAlreadyMatch | SyncResult::SuccessForceWipe
        )
    }

    pub fn is_failure(&self) -> bool {
        self.as_str().starts_with("failure_")
    }
}

impl std::fmt::Display for SyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored status of a sync, served by `GET /sync_status/uuid/:id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub sync_uuid: String,
    pub wallet: String,
    pub result: SyncResult,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

// ========== Clock Status ==========

/// Body of `POST /users/batch_clock_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchClockStatusRequest {
    pub wallet_public_keys: Vec<String>,
    #[serde(default)]
    pub include_files_hash: bool,
}

/// Response of `POST /users/batch_clock_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchClockStatusResponse {
    pub users: Vec<UserClockStatus>,
}

/// Response of `GET /users/clock_status/:wallet`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockStatusResponse {
    pub wallet: String,
    pub clock: u64,
}

// ========== Health ==========

/// Response of `GET /health_check`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub healthy: bool,
    pub endpoint: String,
    pub sp_id: u64,
    pub version: String,
}
