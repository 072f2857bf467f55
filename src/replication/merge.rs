//! Primary-side reverse merge of rows only a secondary holds.

use super::import::{fetch_missing_blobs, reset_blob_failures, skip_unavailable_blobs};
use super::WalletLock;
use crate::context::JobContext;
use crate::error::{Error, Result};
use crate::state::{DataRow, NewRow};

/// Append every row the secondary holds and this primary lacks.
///
/// Rows are matched by `row_uuid` and appended after the local clock in the
/// secondary's clock order. Returns the number of rows appended.
pub async fn primary_sync_from_secondary(ctx: &JobContext, wallet: &str, secondary: &str) -> Result<usize> {
    let holder = format!("merge:{}", uuid::Uuid::new_v4());
    if !WalletLock::acquire(ctx.store.as_ref(), wallet, &holder, ctx.config.wallet_lock_ttl()).await? {
        return Err(Error::LockHeld(format!("sync lock of {}", wallet)));
    }

    let result = merge_locked(ctx, wallet, secondary).await;
    match WalletLock::release(ctx.store.as_ref(), wallet, &holder).await {
        Ok(true) => {}
        Ok(false) => tracing::warn!("Sync lock of {} expired before merge {} finished", wallet, holder),
        Err(e) => tracing::warn!("Failed to release sync lock of {}: {}", wallet, e),
    }
    result
}

async fn merge_locked(ctx: &JobContext, wallet: &str, secondary: &str) -> Result<usize> {
    let replica_set = ctx
        .registry
        .replica_set_for_wallet(wallet)
        .await?
        .ok_or_else(|| Error::NotFound(format!("replica set of {}", wallet)))?
        .replica_set;
    if replica_set.primary != ctx.self_endpoint() {
        return Err(Error::NotPrimary(wallet.to_string()));
    }

    let existing = ctx.ledger.row_uuids(wallet).await?;
    let mut missing: Vec<DataRow> = Vec::new();
    let mut clock_range_min = 1;
    loop {
        let page = ctx.peers.export(secondary, wallet, clock_range_min, true).await?;
        let Some(last_clock) = page.clock_records.last().map(|r| r.clock) else {
            break;
        };
        let latest_clock = page.latest_clock;
        missing.extend(page.rows.into_iter().filter(|r| !existing.contains(&r.row_uuid)));
        if last_clock >= latest_clock {
            break;
        }
        clock_range_min = last_clock + 1;
    }

    if missing.is_empty() {
        tracing::info!("Nothing to merge into {} from {}", wallet, secondary);
        return Ok(0);
    }
    missing.sort_by_key(|r| r.clock);

    let mut gateways = vec![secondary.to_string()];
    gateways.extend(
        replica_set
            .secondaries()
            .iter()
            .filter(|e| **e != secondary)
            .map(|e| e.to_string()),
    );
    let failed = fetch_missing_blobs(ctx, &missing, &gateways).await;
    skip_unavailable_blobs(ctx, wallet, &mut missing, &failed).await?;

    let appended = ctx
        .ledger
        .append_batch(wallet, missing.into_iter().map(NewRow::from).collect())
        .await?;
    tracing::info!(
        "Merged {} rows into {} from {} (clock now {})",
        appended.len(),
        wallet,
        secondary,
        appended.last().map(|r| r.clock).unwrap_or(0)
    );
    if !failed.is_empty() {
        reset_blob_failures(ctx, wallet).await;
    }
    Ok(appended.len())
}
