//! Secondary-side sync from the user's primary.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use super::auth::{verify_force_sync, ForceAction};
use super::protocol::{SyncRequest, SyncResult, SyncStatus, WalletExport};
use super::{record_sync_status, WalletLock};
use crate::context::JobContext;
use crate::error::{Error, Result};
use crate::state::{DataRow, ImportBatch, NodeRole, ReplicaSet};

/// Blob failure counters reset a day after the last failed attempt
const FILE_FAILURE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// One wallet of an accepted `POST /sync`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondarySyncParams {
    pub wallet: String,
    /// Endpoint the caller claims is the user's primary
    pub primary_endpoint: String,
    #[serde(default)]
    pub force_resync: bool,
    #[serde(default)]
    pub force_wipe: bool,
    pub sync_uuid: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub signature: Option<String>,
    /// The full wallet list the signature covers
    #[serde(default)]
    pub signed_wallets: Vec<String>,
    #[serde(default)]
    pub block_number: Option<u64>,
}

impl SecondarySyncParams {
    pub fn new(wallet: impl Into<String>, primary_endpoint: impl Into<String>) -> Self {
        let wallet = wallet.into();
        Self {
            signed_wallets: vec![wallet.clone()],
            wallet,
            primary_endpoint: primary_endpoint.into(),
            force_resync: false,
            force_wipe: false,
            sync_uuid: uuid::Uuid::new_v4().to_string(),
            timestamp: None,
            signature: None,
            block_number: None,
        }
    }

    /// Split a `POST /sync` body into one sync per wallet.
    ///
    /// A caller-chosen `sync_uuid` is only accepted for a single wallet;
    /// otherwise each wallet gets a fresh id.
    pub fn from_request(request: &SyncRequest) -> Result<Vec<Self>> {
        if request.wallet.is_empty() {
            return Err(Error::InvalidInput("wallet list cannot be empty".into()));
        }
        if request.creator_node_endpoint.is_empty() {
            return Err(Error::InvalidInput("creator_node_endpoint is required".into()));
        }
        if request.sync_uuid.is_some() && request.wallet.len() > 1 {
            return Err(Error::InvalidInput("sync_uuid requires a single wallet".into()));
        }

        Ok(request
            .wallet
            .iter()
            .map(|wallet| Self {
                wallet: wallet.clone(),
                primary_endpoint: request.creator_node_endpoint.clone(),
                force_resync: request.force_resync,
                force_wipe: request.force_wipe,
                sync_uuid: request
                    .sync_uuid
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                timestamp: request.timestamp,
                signature: request.signature.clone(),
                signed_wallets: request.wallet.clone(),
                block_number: request.block_number,
            })
            .collect())
    }

    fn is_forced(&self) -> bool {
        self.force_resync || self.force_wipe
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub result: SyncResult,
    pub error: Option<String>,
}

impl SyncOutcome {
    fn ok(result: SyncResult) -> Self {
        Self { result, error: None }
    }

    fn fail(result: SyncResult, error: impl std::fmt::Display) -> Self {
        Self {
            result,
            error: Some(error.to_string()),
        }
    }
}

/// Bring this node's copy of a wallet up to the primary's.
///
/// Holds the wallet lock for the whole sync and records the final status
/// under `params.sync_uuid`.
pub async fn secondary_sync_from_primary(ctx: &JobContext, params: &SecondarySyncParams) -> SyncOutcome {
    let wallet = &params.wallet;
    let outcome = match WalletLock::acquire(
        ctx.store.as_ref(),
        wallet,
        &params.sync_uuid,
        ctx.config.wallet_lock_ttl(),
    )
    .await
    {
        Ok(true) => {
            let outcome = sync_locked(ctx, params).await;
            match WalletLock::release(ctx.store.as_ref(), wallet, &params.sync_uuid).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!("Sync lock of {} expired before sync {} finished", wallet, params.sync_uuid),
                Err(e) => tracing::warn!("Failed to release sync lock of {}: {}", wallet, e),
            }
            outcome
        }
        Ok(false) => SyncOutcome::fail(SyncResult::AbortSyncInProgress, "another sync holds the wallet lock"),
        Err(e) => SyncOutcome::fail(SyncResult::FailureSyncSecondaryFromPrimary, e),
    };

    if outcome.result.is_failure() {
        tracing::warn!(
            "Sync {} of {} from {}: {} ({})",
            params.sync_uuid,
            wallet,
            params.primary_endpoint,
            outcome.result,
            outcome.error.as_deref().unwrap_or("")
        );
    } else {
        tracing::info!(
            "Sync {} of {} from {}: {}",
            params.sync_uuid, wallet, params.primary_endpoint, outcome.result
        );
    }

    let status = SyncStatus {
        sync_uuid: params.sync_uuid.clone(),
        wallet: wallet.clone(),
        result: outcome.result,
        error: outcome.error.clone(),
        updated_at: Utc::now(),
    };
    if let Err(e) = record_sync_status(ctx.store.as_ref(), &status).await {
        tracing::warn!("Failed to record status of sync {}: {}", params.sync_uuid, e);
    }

    outcome
}

async fn sync_locked(ctx: &JobContext, params: &SecondarySyncParams) -> SyncOutcome {
    let wallet = &params.wallet;
    let self_endpoint = ctx.self_endpoint();
    if let Some(block) = params.block_number {
        tracing::debug!("Sync {} of {} requested at block {}", params.sync_uuid, wallet, block);
    }

    let replica_set = match ctx.registry.replica_set_for_wallet(wallet).await {
        Ok(Some(found)) => found.replica_set,
        Ok(None) => {
            return SyncOutcome::fail(
                SyncResult::FailureFetchingUserReplicaSet,
                format!("no replica set registered for {}", wallet),
            )
        }
        Err(e) => return SyncOutcome::fail(SyncResult::FailureFetchingUserReplicaSet, e),
    };

    if replica_set.primary != params.primary_endpoint {
        return SyncOutcome::fail(
            SyncResult::AbortCurrentNodeIsNotUserPrimary,
            format!(
                "{} is not the primary of {} ({} is)",
                params.primary_endpoint, wallet, replica_set.primary
            ),
        );
    }

    if params.is_forced() {
        if replica_set.primary == self_endpoint {
            return SyncOutcome::fail(
                SyncResult::AbortCurrentNodeIsUserPrimary,
                "refusing to wipe the primary's copy",
            );
        }
        if !ctx.config.sync.force_wipe_enabled {
            return SyncOutcome::fail(SyncResult::AbortForceWipeDisabled, "force wipes are disabled on this node");
        }
        if let Err(e) = check_force_authorization(ctx, params).await {
            return SyncOutcome::fail(SyncResult::FailureForceResyncCheck, e);
        }
        if let Err(e) = wipe_local_user(ctx, wallet).await {
            return SyncOutcome::fail(SyncResult::FailureDeleteDbData, e);
        }
        if params.force_wipe {
            return SyncOutcome::ok(SyncResult::SuccessForceWipe);
        }
    }

    if replica_set.role_of(self_endpoint) != NodeRole::Secondary {
        return SyncOutcome::fail(
            SyncResult::AbortCurrentNodeIsNotUserSecondary,
            format!("{} is not a secondary of {}", self_endpoint, wallet),
        );
    }

    match import_from_primary(ctx, wallet, &replica_set).await {
        Ok(result) => SyncOutcome::ok(result),
        Err((result, e)) => SyncOutcome::fail(result, e),
    }
}

async fn check_force_authorization(ctx: &JobContext, params: &SecondarySyncParams) -> Result<()> {
    let nodes = ctx.registry.content_nodes().await?;
    let primary = nodes
        .iter()
        .find(|n| n.endpoint == params.primary_endpoint)
        .ok_or_else(|| Error::NotFound(format!("content node {}", params.primary_endpoint)))?;

    if !params.signed_wallets.contains(&params.wallet) {
        return Err(Error::Signature(format!("signature does not cover {}", params.wallet)));
    }

    let action = if params.force_wipe {
        ForceAction::Wipe
    } else {
        ForceAction::Resync
    };
    verify_force_sync(
        &primary.delegate_public_key,
        action,
        &params.signed_wallets,
        params.timestamp,
        params.signature.as_deref(),
    )
}

/// Delete a user's rows, then the blobs no other row still references
pub(crate) async fn wipe_local_user(ctx: &JobContext, wallet: &str) -> Result<()> {
    let multihashes = ctx.ledger.wipe_user(wallet).await?;
    let mut orphaned = Vec::with_capacity(multihashes.len());
    for multihash in multihashes {
        if !ctx.ledger.references_blob(&multihash).await? {
            orphaned.push(multihash);
        }
    }
    ctx.blobs.delete(&orphaned).await?;
    tracing::info!("Wiped local data of {} ({} blobs removed)", wallet, orphaned.len());
    Ok(())
}

async fn import_from_primary(
    ctx: &JobContext,
    wallet: &str,
    replica_set: &ReplicaSet,
) -> std::result::Result<SyncResult, (SyncResult, Error)> {
    let local_clock = ctx
        .ledger
        .clock(wallet)
        .await
        .map_err(|e| (SyncResult::FailureSyncSecondaryFromPrimary, e))?;

    let export = match ctx.peers.export(&replica_set.primary, wallet, local_clock + 1, false).await {
        Ok(export) => export,
        Err(e) => {
            repair_local_clock(ctx, wallet).await;
            return Err((SyncResult::FailureExportWallet, e));
        }
    };

    if export.clock == local_clock {
        return Ok(SyncResult::SuccessClocksAlreadyMatch);
    }

    if let Err(e) = validate_export(wallet, local_clock, &export) {
        repair_local_clock(ctx, wallet).await;
        return Err((result_for(&e), e));
    }

    let gateways: Vec<String> = replica_set
        .endpoints()
        .iter()
        .filter(|e| **e != ctx.self_endpoint())
        .map(|e| e.to_string())
        .collect();
    let failed = fetch_missing_blobs(ctx, &export.rows, &gateways).await;

    let last_page = export.is_last_page();
    let WalletExport {
        clock,
        latest_clock,
        clock_records,
        mut rows,
        ..
    } = export;
    skip_unavailable_blobs(ctx, wallet, &mut rows, &failed)
        .await
        .map_err(|e| {
            let result = if matches!(e, Error::ThresholdExceeded(_)) {
                SyncResult::FailureSkipThresholdNotReached
            } else {
                SyncResult::FailureSyncSecondaryFromPrimary
            };
            (result, e)
        })?;

    let batch = ImportBatch {
        wallet: wallet.to_string(),
        expected_local_clock: local_clock,
        clock,
        clock_records,
        rows,
    };
    if let Err(e) = ctx.ledger.import_batch(&batch).await {
        repair_local_clock(ctx, wallet).await;
        return Err((SyncResult::FailureDbTransaction, e));
    }

    if !failed.is_empty() {
        reset_blob_failures(ctx, wallet).await;
    }
    if !last_page {
        tracing::debug!("Imported {} up to clock {} of {}, more pages remain", wallet, clock, latest_clock);
    }

    Ok(SyncResult::Success)
}

/// Point the user clock back at the highest local clock record
async fn repair_local_clock(ctx: &JobContext, wallet: &str) {
    match ctx.ledger.fix_inconsistent_user(wallet).await {
        Ok(updated) => tracing::debug!("Checked clock of {} after failed sync ({} rows updated)", wallet, updated),
        Err(e) => tracing::error!("Failed to repair clock of {} after failed sync: {}", wallet, e),
    }
}

fn blob_failure_key(wallet: &str) -> String {
    format!("sync_file_failures:{}", wallet)
}

/// Count a failed blob fetch for `wallet`, marking the affected rows skipped
/// once `skip_failed_files_threshold` attempts have failed.
///
/// Below the threshold the attempt fails with `ThresholdExceeded` and `rows`
/// is left untouched.
pub(crate) async fn skip_unavailable_blobs(
    ctx: &JobContext,
    wallet: &str,
    rows: &mut [DataRow],
    failed: &HashSet<String>,
) -> Result<()> {
    if failed.is_empty() {
        return Ok(());
    }

    let attempts = ctx.store.incr_ex(&blob_failure_key(wallet), FILE_FAILURE_TTL).await?;
    let threshold = ctx.config.sync.skip_failed_files_threshold;
    if attempts < threshold {
        return Err(Error::ThresholdExceeded(format!(
            "{} blobs unavailable, attempt {} of {} before skipping",
            failed.len(),
            attempts,
            threshold
        )));
    }

    tracing::warn!(
        "Skipping {} unavailable blobs of {} after {} attempts",
        failed.len(),
        wallet,
        attempts
    );
    mark_skipped(rows, failed);
    Ok(())
}

pub(crate) async fn reset_blob_failures(ctx: &JobContext, wallet: &str) {
    if let Err(e) = ctx.store.del(&blob_failure_key(wallet)).await {
        tracing::debug!("Failed to reset blob failure count of {}: {}", wallet, e);
    }
}

/// Reject exports that cannot be applied on top of `local_clock`
fn validate_export(wallet: &str, local_clock: u64, export: &WalletExport) -> Result<()> {
    let inconsistent = |reason: String| Error::ImportNotConsistent {
        wallet: wallet.to_string(),
        reason,
    };

    if export.wallet != wallet {
        return Err(inconsistent(format!("export is for {}", export.wallet)));
    }

    let max_record_clock = export.clock_records.last().map(|r| r.clock).unwrap_or(0);
    if export.clock < local_clock || max_record_clock != export.clock {
        return Err(Error::InconsistentClock {
            wallet: wallet.to_string(),
            clock: export.clock,
            max_record_clock,
        });
    }

    if let Some(first) = export.clock_records.first() {
        if first.clock != local_clock + 1 {
            return Err(Error::ImportNotContiguous {
                wallet: wallet.to_string(),
                local_clock,
                first_clock: first.clock,
            });
        }
    }

    if let Some(pair) = export
        .clock_records
        .windows(2)
        .find(|pair| pair[1].clock != pair[0].clock + 1)
    {
        return Err(inconsistent(format!(
            "clock records jump from {} to {}",
            pair[0].clock, pair[1].clock
        )));
    }
    if let Some(record) = export.clock_records.iter().find(|r| r.wallet != wallet) {
        return Err(inconsistent(format!("clock record {} belongs to {}", record.clock, record.wallet)));
    }

    let exported: HashSet<u64> = export.clock_records.iter().map(|r| r.clock).collect();
    if let Some(row) = export
        .rows
        .iter()
        .find(|r| r.wallet != wallet || !exported.contains(&r.clock))
    {
        return Err(inconsistent(format!(
            "row {} at clock {} is not covered by the exported clock records",
            row.row_uuid, row.clock
        )));
    }

    Ok(())
}

fn result_for(error: &Error) -> SyncResult {
    match error {
        Error::InconsistentClock { .. } => SyncResult::FailureInconsistentClock,
        Error::ImportNotContiguous { .. } => SyncResult::FailureImportNotContiguous,
        Error::ImportNotConsistent { .. } => SyncResult::FailureImportNotConsistent,
        _ => SyncResult::FailureSyncSecondaryFromPrimary,
    }
}

/// Fetch the blobs `rows` reference that are not stored locally.
///
/// Returns the multihashes no gateway could serve.
pub(crate) async fn fetch_missing_blobs(ctx: &JobContext, rows: &[DataRow], gateways: &[String]) -> HashSet<String> {
    let wanted: BTreeSet<String> = rows
        .iter()
        .filter(|r| !r.skipped)
        .filter_map(|r| r.multihash.clone())
        .collect();

    let gateways: Arc<[String]> = gateways.into();
    let results: Vec<(String, Result<()>)> = stream::iter(wanted)
        .map(|multihash| {
            let blobs = Arc::clone(&ctx.blobs);
            let gateways = Arc::clone(&gateways);
            async move {
                let result = match blobs.contains(&multihash).await {
                    Ok(true) => Ok(()),
                    _ => blobs.fetch_and_save(&multihash, &gateways).await,
                };
                (multihash, result)
            }
        })
        .buffer_unordered(ctx.config.sync.file_save_max_concurrency.max(1))
        .collect()
        .await;

    results
        .into_iter()
        .filter_map(|(multihash, result)| match result {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!("Failed to fetch blob {}: {}", multihash, e);
                Some(multihash)
            }
        })
        .collect()
}

fn mark_skipped(rows: &mut [DataRow], failed: &HashSet<String>) {
    for row in rows.iter_mut() {
        if row.multihash.as_ref().is_some_and(|m| failed.contains(m)) {
            row.skipped = true;
        }
    }
}
