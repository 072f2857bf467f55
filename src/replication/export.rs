//! Primary-side export of a user's ledger.

use super::protocol::WalletExport;
use crate::error::{Error, Result};
use crate::state::ClockLedger;

/// Export clocks `[clock_range_min, clock_range_min + max_range - 1]` of a user.
///
/// The ledger must be consistent (user clock equals the highest clock
/// record, records contiguous) before anything is served. An inconsistent
/// ledger is repaired and the export refused, unless `force_export` is set,
/// in which case the inconsistency is only logged.
pub async fn export_wallet(
    ledger: &ClockLedger,
    wallet: &str,
    clock_range_min: u64,
    force_export: bool,
    max_range: u64,
) -> Result<WalletExport> {
    let max_range = max_range.max(1);
    let slice = ledger.export_slice(wallet, clock_range_min, max_range).await?;
    let local_clock = slice.local_clock.unwrap_or(0);
    let max_record_clock = slice.max_record_clock.unwrap_or(0);

    if local_clock != max_record_clock {
        reject_or_log(
            ledger,
            wallet,
            force_export,
            format!("user clock {} but highest clock record {}", local_clock, max_record_clock),
        )
        .await?;
    }

    let first_expected = clock_range_min.max(1);
    match slice.clock_records.first() {
        None if local_clock >= first_expected => {
            reject_or_log(
                ledger,
                wallet,
                force_export,
                format!("user clock {} but no clock records from {}", local_clock, first_expected),
            )
            .await?;
        }
        Some(first) if first.clock != first_expected => {
            reject_or_log(
                ledger,
                wallet,
                force_export,
                format!("first clock record {} where {} was expected", first.clock, first_expected),
            )
            .await?;
        }
        _ => {}
    }

    let gap = slice
        .clock_records
        .windows(2)
        .find(|pair| pair[1].clock != pair[0].clock + 1)
        .map(|pair| (pair[0].clock, pair[1].clock));
    if let Some((before, after)) = gap {
        reject_or_log(
            ledger,
            wallet,
            force_export,
            format!("clock records jump from {} to {}", before, after),
        )
        .await?;
    }

    let requested_max = clock_range_min.saturating_add(max_range - 1);
    let clock = local_clock.min(requested_max);

    tracing::debug!(
        "Exporting {} clocks {}..={} ({} records, user clock {})",
        wallet,
        clock_range_min,
        clock,
        slice.clock_records.len(),
        local_clock
    );

    Ok(WalletExport {
        wallet: wallet.to_string(),
        clock,
        latest_clock: local_clock,
        requested_clock_range_min: clock_range_min,
        requested_clock_range_max: requested_max,
        clock_records: slice.clock_records,
        rows: slice.rows,
    })
}

async fn reject_or_log(ledger: &ClockLedger, wallet: &str, force_export: bool, reason: String) -> Result<()> {
    if force_export {
        tracing::warn!("Forcing export of inconsistent ledger for {}: {}", wallet, reason);
        return Ok(());
    }

    tracing::error!("Refusing export of inconsistent ledger for {}: {}", wallet, reason);
    match ledger.fix_inconsistent_user(wallet).await {
        Ok(updated) => tracing::info!("Repaired clock of {} ({} rows updated)", wallet, updated),
        Err(e) => tracing::error!("Failed to repair clock of {}: {}", wallet, e),
    }

    Err(Error::ExportInconsistent {
        wallet: wallet.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NewRow;
    use tempfile::tempdir;

    async fn ledger_with(clock: u64) -> (ClockLedger, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let ledger = ClockLedger::open(dir.path()).unwrap();
        for n in 1..=clock {
            ledger
                .append("0xabc", NewRow::new("tracks", serde_json::json!({ "n": n })))
                .await
                .unwrap();
        }
        (ledger, dir)
    }

    #[tokio::test]
    async fn test_export_clamps_to_range() {
        let (ledger, _dir) = ledger_with(25).await;

        let page = export_wallet(&ledger, "0xabc", 1, false, 10).await.unwrap();
        assert_eq!(page.clock, 10);
        assert_eq!(page.latest_clock, 25);
        assert_eq!((page.requested_clock_range_min, page.requested_clock_range_max), (1, 10));
        assert_eq!(page.clock_records.len(), 10);
        assert!(!page.is_last_page());

        let last = export_wallet(&ledger, "0xabc", 21, false, 10).await.unwrap();
        assert_eq!(last.clock, 25);
        assert_eq!(last.clock_records.first().unwrap().clock, 21);
        assert!(last.is_last_page());
    }

    #[tokio::test]
    async fn test_export_past_end_reports_local_clock() {
        let (ledger, _dir) = ledger_with(8).await;
        let page = export_wallet(&ledger, "0xabc", 9, false, 10).await.unwrap();
        assert_eq!(page.clock, 8);
        assert!(page.clock_records.is_empty());

        let unknown = export_wallet(&ledger, "0xnew", 1, false, 10).await.unwrap();
        assert_eq!(unknown.clock, 0);
        assert!(unknown.rows.is_empty());
    }

    #[tokio::test]
    async fn test_inconsistent_export_is_refused_and_repaired() {
        let (ledger, dir) = ledger_with(3).await;
        {
            let conn = rusqlite::Connection::open(dir.path().join("ledger.db")).unwrap();
            conn.execute("UPDATE cnode_users SET clock = 7 WHERE wallet = '0xabc'", [])
                .unwrap();
        }

        let forced = export_wallet(&ledger, "0xabc", 1, true, 10).await.unwrap();
        assert_eq!(forced.latest_clock, 7);
        assert_eq!(forced.clock_records.len(), 3);

        let refused = export_wallet(&ledger, "0xabc", 1, false, 10).await;
        assert!(matches!(refused, Err(Error::ExportInconsistent { .. })));
        assert_eq!(ledger.clock("0xabc").await.unwrap(), 3);

        let page = export_wallet(&ledger, "0xabc", 1, false, 10).await.unwrap();
        assert_eq!(page.clock, 3);
    }
}
