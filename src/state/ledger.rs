//! Clock Ledger
//!
//! Persistent per-user write ledger backed by SQLite. Every write a user
//! makes on this node is stamped with the next value of that user's clock,
//! inside the same transaction that increments it.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// One clock value consumed by a write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockRecord {
    pub wallet: String,
    pub clock: u64,
    pub source_table: String,
    pub created_at: DateTime<Utc>,
}

/// A domain row stamped with the clock of the write that created it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    pub row_uuid: String,
    pub wallet: String,
    pub clock: u64,
    pub source_table: String,
    /// Content address of the blob this row references, if any
    pub multihash: Option<String>,
    pub payload: serde_json::Value,
    /// Set when the blob could not be fetched and the row was kept anyway
    #[serde(default)]
    pub skipped: bool,
}

/// A row about to be appended; the ledger assigns its clock
#[derive(Debug, Clone, Default)]
pub struct NewRow {
    pub row_uuid: Option<String>,
    pub source_table: String,
    pub multihash: Option<String>,
    pub payload: serde_json::Value,
    pub skipped: bool,
}

impl NewRow {
    pub fn new(source_table: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            source_table: source_table.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn with_multihash(mut self, multihash: impl Into<String>) -> Self {
        self.multihash = Some(multihash.into());
        self
    }
}

impl From<DataRow> for NewRow {
    fn from(row: DataRow) -> Self {
        Self {
            row_uuid: Some(row.row_uuid),
            source_table: row.source_table,
            multihash: row.multihash,
            payload: row.payload,
            skipped: row.skipped,
        }
    }
}

/// Clock value (and optionally files hash) of one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserClockStatus {
    pub wallet: String,
    pub clock: u64,
    #[serde(default)]
    pub files_hash: Option<String>,
}

/// Raw ledger contents for one clock range
#[derive(Debug, Clone, Default)]
pub struct LedgerSlice {
    /// Clock on the user row; None when the user has never written here
    pub local_clock: Option<u64>,
    /// Highest clock record over the whole ledger for this user
    pub max_record_clock: Option<u64>,
    pub clock_records: Vec<ClockRecord>,
    pub rows: Vec<DataRow>,
}

/// Rows received from a primary, applied in one transaction
#[derive(Debug, Clone)]
pub struct ImportBatch {
    pub wallet: String,
    /// Clock the importer validated against; the import aborts if it moved
    pub expected_local_clock: u64,
    /// User clock after the import
    pub clock: u64,
    pub clock_records: Vec<ClockRecord>,
    pub rows: Vec<DataRow>,
}

/// Per-user monotonic clock ledger backed by SQLite
pub struct ClockLedger {
    /// Database connection
    conn: Mutex<Connection>,
}

impl ClockLedger {
    /// Create or open the ledger database
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let conn = Connection::open(data_dir.join("ledger.db"))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS cnode_users (
                wallet TEXT PRIMARY KEY,
                clock INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS clock_records (
                wallet TEXT NOT NULL,
                clock INTEGER NOT NULL,
                source_table TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(wallet, clock)
            );

            CREATE TABLE IF NOT EXISTS data_rows (
                row_uuid TEXT PRIMARY KEY,
                wallet TEXT NOT NULL,
                clock INTEGER NOT NULL,
                source_table TEXT NOT NULL,
                multihash TEXT,
                payload TEXT NOT NULL,
                skipped INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_data_rows_wallet_clock
                ON data_rows(wallet, clock);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one row, consuming the user's next clock value
    pub async fn append(&self, wallet: &str, row: NewRow) -> Result<DataRow> {
        let mut written = self.append_batch(wallet, vec![row]).await?;
        written
            .pop()
            .ok_or_else(|| Error::Internal("append wrote no row".into()))
    }

    /// Append rows in order, each consuming the next clock value, in one transaction.
    ///
    /// The clock record's value is read back from the user row inside the
    /// transaction, so two writers can never observe the same clock.
    pub async fn append_batch(&self, wallet: &str, rows: Vec<NewRow>) -> Result<Vec<DataRow>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        tx.execute(
            r#"
            INSERT INTO cnode_users (wallet, clock, created_at, updated_at) VALUES (?1, 0, ?2, ?2)
            ON CONFLICT(wallet) DO NOTHING
            "#,
            params![wallet, now],
        )?;

        let mut written = Vec::with_capacity(rows.len());
        for row in rows {
            tx.execute(
                "UPDATE cnode_users SET clock = clock + 1, updated_at = ?2 WHERE wallet = ?1",
                params![wallet, now],
            )?;
            tx.execute(
                r#"
                INSERT INTO clock_records (wallet, clock, source_table, created_at)
                SELECT wallet, clock, ?2, ?3 FROM cnode_users WHERE wallet = ?1
                "#,
                params![wallet, &row.source_table, now],
            )?;
            let clock: i64 = tx.query_row(
                "SELECT clock FROM cnode_users WHERE wallet = ?1",
                params![wallet],
                |r| r.get(0),
            )?;

            let row_uuid = row
                .row_uuid
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            tx.execute(
                r#"
                INSERT INTO data_rows (row_uuid, wallet, clock, source_table, multihash, payload, skipped)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    &row_uuid,
                    wallet,
                    clock,
                    &row.source_table,
                    &row.multihash,
                    row.payload.to_string(),
                    row.skipped
                ],
            )?;

            written.push(DataRow {
                row_uuid,
                wallet: wallet.to_string(),
                clock: clock as u64,
                source_table: row.source_table,
                multihash: row.multihash,
                payload: row.payload,
                skipped: row.skipped,
            });
        }

        tx.commit()?;
        Ok(written)
    }

    /// Current clock of a user, None if the user has no ledger row
    pub async fn user_clock(&self, wallet: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock().await;
        query_clock(&conn, wallet)
    }

    /// Current clock of a user, 0 when absent
    pub async fn clock(&self, wallet: &str) -> Result<u64> {
        Ok(self.user_clock(wallet).await?.unwrap_or(0))
    }

    /// Clock values for many users; unknown users report clock 0
    pub async fn batch_clock_status(
        &self,
        wallets: &[String],
        include_files_hash: bool,
    ) -> Result<Vec<UserClockStatus>> {
        let conn = self.conn.lock().await;
        let mut statuses = Vec::with_capacity(wallets.len());
        for wallet in wallets {
            let clock = query_clock(&conn, wallet)?.unwrap_or(0);
            let files_hash = if include_files_hash {
                query_files_hash(&conn, wallet, None, None)?
            } else {
                None
            };
            statuses.push(UserClockStatus {
                wallet: wallet.clone(),
                clock,
                files_hash,
            });
        }
        Ok(statuses)
    }

    /// Hex SHA-1 over the multihashes of blob-bearing rows in the clock range,
    /// in clock order. None when the range holds no such rows.
    pub async fn files_hash(
        &self,
        wallet: &str,
        clock_min: Option<u64>,
        clock_max: Option<u64>,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        query_files_hash(&conn, wallet, clock_min, clock_max)
    }

    /// Clock records and rows in `[clock_min, clock_min + max_range - 1]`
    pub async fn export_slice(&self, wallet: &str, clock_min: u64, max_range: u64) -> Result<LedgerSlice> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let clock_max = clock_min.saturating_add(max_range.saturating_sub(1));

        let local_clock = query_clock(&tx, wallet)?;
        let max_record_clock: Option<i64> = tx.query_row(
            "SELECT MAX(clock) FROM clock_records WHERE wallet = ?1",
            params![wallet],
            |r| r.get(0),
        )?;

        let clock_records = {
            let mut stmt = tx.prepare(
                r#"
                SELECT wallet, clock, source_table, created_at FROM clock_records
                WHERE wallet = ?1 AND clock BETWEEN ?2 AND ?3
                ORDER BY clock
                "#,
            )?;
            let records = stmt
                .query_map(params![wallet, clock_min as i64, clock_max as i64], |r| {
                    Ok(ClockRecord {
                        wallet: r.get(0)?,
                        clock: r.get::<_, i64>(1)? as u64,
                        source_table: r.get(2)?,
                        created_at: r.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            records
        };

        let rows = {
            let mut stmt = tx.prepare(
                r#"
                SELECT row_uuid, wallet, clock, source_table, multihash, payload, skipped FROM data_rows
                WHERE wallet = ?1 AND clock BETWEEN ?2 AND ?3
                ORDER BY clock, row_uuid
                "#,
            )?;
            let rows = stmt
                .query_map(params![wallet, clock_min as i64, clock_max as i64], map_data_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        tx.commit()?;

        Ok(LedgerSlice {
            local_clock,
            max_record_clock: max_record_clock.map(|c| c as u64),
            clock_records,
            rows,
        })
    }

    /// Apply rows exported by the user's primary in one transaction
    pub async fn import_batch(&self, batch: &ImportBatch) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let current = query_clock(&tx, &batch.wallet)?.unwrap_or(0);
        if current != batch.expected_local_clock {
            return Err(Error::ImportNotContiguous {
                wallet: batch.wallet.clone(),
                local_clock: current,
                first_clock: batch.expected_local_clock + 1,
            });
        }

        tx.execute(
            r#"
            INSERT INTO cnode_users (wallet, clock, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(wallet) DO UPDATE SET clock = excluded.clock, updated_at = excluded.updated_at
            "#,
            params![&batch.wallet, batch.clock as i64, now],
        )?;

        for record in &batch.clock_records {
            tx.execute(
                "INSERT INTO clock_records (wallet, clock, source_table, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![&batch.wallet, record.clock as i64, &record.source_table, record.created_at],
            )?;
        }

        for row in &batch.rows {
            tx.execute(
                r#"
                INSERT INTO data_rows (row_uuid, wallet, clock, source_table, multihash, payload, skipped)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    &row.row_uuid,
                    &batch.wallet,
                    row.clock as i64,
                    &row.source_table,
                    &row.multihash,
                    row.payload.to_string(),
                    row.skipped
                ],
            )?;
        }

        let max_record_clock: Option<i64> = tx.query_row(
            "SELECT MAX(clock) FROM clock_records WHERE wallet = ?1",
            params![&batch.wallet],
            |r| r.get(0),
        )?;
        let max_record_clock = max_record_clock.unwrap_or(0) as u64;
        if max_record_clock != batch.clock {
            return Err(Error::InconsistentClock {
                wallet: batch.wallet.clone(),
                clock: batch.clock,
                max_record_clock,
            });
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete everything this node holds for a user.
    ///
    /// Returns the multihashes the deleted rows referenced.
    pub async fn wipe_user(&self, wallet: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let multihashes = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT multihash FROM data_rows WHERE wallet = ?1 AND multihash IS NOT NULL",
            )?;
            let hashes = stmt
                .query_map(params![wallet], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            hashes
        };

        tx.execute("DELETE FROM data_rows WHERE wallet = ?1", params![wallet])?;
        tx.execute("DELETE FROM clock_records WHERE wallet = ?1", params![wallet])?;
        tx.execute("DELETE FROM cnode_users WHERE wallet = ?1", params![wallet])?;
        tx.commit()?;

        Ok(multihashes)
    }

    /// Reset the user clock to the highest clock record. Returns rows updated.
    pub async fn fix_inconsistent_user(&self, wallet: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            r#"
            UPDATE cnode_users
            SET clock = COALESCE((SELECT MAX(clock) FROM clock_records WHERE wallet = ?1), 0),
                updated_at = ?2
            WHERE wallet = ?1
            "#,
            params![wallet, Utc::now()],
        )?;
        Ok(updated)
    }

    /// Row identities held for a user
    pub async fn row_uuids(&self, wallet: &str) -> Result<HashSet<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT row_uuid FROM data_rows WHERE wallet = ?1")?;
        let uuids = stmt
            .query_map(params![wallet], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(uuids)
    }

    /// Whether any row of any user references a blob
    pub async fn references_blob(&self, multihash: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM data_rows WHERE multihash = ?1 LIMIT 1",
                params![multihash],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn query_clock(conn: &Connection, wallet: &str) -> Result<Option<u64>> {
    let clock: Option<i64> = conn
        .query_row(
            "SELECT clock FROM cnode_users WHERE wallet = ?1",
            params![wallet],
            |r| r.get(0),
        )
        .optional()?;
    Ok(clock.map(|c| c as u64))
}

fn query_files_hash(
    conn: &Connection,
    wallet: &str,
    clock_min: Option<u64>,
    clock_max: Option<u64>,
) -> Result<Option<String>> {
    let min = clock_min.unwrap_or(0) as i64;
    let max = clock_max.map(|c| c as i64).unwrap_or(i64::MAX);

    let mut stmt = conn.prepare(
        r#"
        SELECT multihash FROM data_rows
        WHERE wallet = ?1 AND multihash IS NOT NULL AND clock BETWEEN ?2 AND ?3
        ORDER BY clock, row_uuid
        "#,
    )?;
    let mut rows = stmt.query(params![wallet, min, max])?;

    let mut hasher = Sha1::new();
    let mut any = false;
    while let Some(row) = rows.next()? {
        let multihash: String = row.get(0)?;
        hasher.update(multihash.as_bytes());
        any = true;
    }

    Ok(any.then(|| format!("{:x}", hasher.finalize())))
}

fn map_data_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<DataRow> {
    let payload: String = r.get(5)?;
    let payload = serde_json::from_str(&payload)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    Ok(DataRow {
        row_uuid: r.get(0)?,
        wallet: r.get(1)?,
        clock: r.get::<_, i64>(2)? as u64,
        source_table: r.get(3)?,
        multihash: r.get(4)?,
        payload,
        skipped: r.get(6)?,
    })
}
