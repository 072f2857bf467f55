//! Ephemeral Store
//!
//! Short-lived shared state: advisory locks, daily counters, sync statuses
//! and dedup keys. Everything written here carries a TTL.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::{Mutex, RwLock};

use crate::error::Result;

/// Key/value store with per-key expiry
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set only if the key is absent. Returns true when the key was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Increment a counter, creating it with `ttl` when absent
    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Returns true when a live key was removed
    async fn del(&self, key: &str) -> Result<bool>;

    /// Remove the key only while it still holds `value`
    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool>;

    /// Live entries whose key starts with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

/// In-process store for single-process deployments and tests
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        if let Some((_, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let next = match entries.get(key) {
            Some((value, expires)) if *expires > now => {
                let next = value.parse::<u64>().unwrap_or(0) + 1;
                (next, *expires)
            }
            _ => (1, now + ttl),
        };
        entries.insert(key.to_string(), (next.0.to_string(), next.1));
        Ok(next.0)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(key)
            .map(|(_, expires)| expires > Instant::now())
            .unwrap_or(false))
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let matches = matches!(
            entries.get(key),
            Some((current, expires)) if current == value && *expires > Instant::now()
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        let mut found: Vec<(String, String)> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, _))| (key.clone(), value.clone()))
            .collect();
        found.sort();
        Ok(found)
    }
}

/// SQLite-backed store shared by every process on one host
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the store database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS ephemeral (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ephemeral_expires ON ephemeral(expires_at);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Drop expired keys. Returns rows deleted.
    pub async fn purge_expired(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM ephemeral WHERE expires_at <= ?1", params![now_ms()])?;
        Ok(deleted)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(ttl.as_millis() as i64)
}

#[async_trait]
impl EphemeralStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM ephemeral WHERE key = ?1 AND expires_at > ?2",
                params![key, now_ms()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO ephemeral (key, value, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3
            "#,
            params![key, value, expiry_ms(ttl)],
        )?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM ephemeral WHERE key = ?1 AND expires_at <= ?2",
            params![key, now_ms()],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO ephemeral (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expiry_ms(ttl)],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM ephemeral WHERE key = ?1 AND expires_at <= ?2",
            params![key, now_ms()],
        )?;
        tx.execute(
            r#"
            INSERT INTO ephemeral (key, value, expires_at) VALUES (?1, '1', ?2)
            ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)
            "#,
            params![key, expiry_ms(ttl)],
        )?;
        let value: String = tx.query_row(
            "SELECT value FROM ephemeral WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )?;
        tx.commit()?;
        Ok(value.parse::<u64>().unwrap_or(0))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM ephemeral WHERE key = ?1 AND expires_at > ?2",
            params![key, now_ms()],
        )?;
        conn.execute("DELETE FROM ephemeral WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let deleted = tx.execute(
            "DELETE FROM ephemeral WHERE key = ?1 AND value = ?2 AND expires_at > ?3",
            params![key, value, now_ms()],
        )?;
        tx.commit()?;
        Ok(deleted == 1)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT key, value FROM ephemeral
            WHERE substr(key, 1, length(?1)) = ?1 AND expires_at > ?2
            ORDER BY key
            "#,
        )?;
        let found = stmt
            .query_map(params![prefix, now_ms()], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(found)
    }
}
