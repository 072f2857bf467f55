//! Secondary sync health.
//!
//! Daily (UTC) counters in the ephemeral store: sync outcomes per
//! (secondary, wallet, sync type) and typed sync errors per
//! (secondary, wallet, error kind). Counters expire after two days.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::SyncType;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::state::EphemeralStore;

const COUNTER_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// Successes and failures of syncs to one secondary for one wallet today
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcomeCounts {
    pub successes: u64,
    pub failures: u64,
}

impl SyncOutcomeCounts {
    /// Success percentage, 100 when nothing was attempted
    pub fn success_percent(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            100.0
        } else {
            self.successes as f64 * 100.0 / total as f64
        }
    }

    /// Enough failures and a success rate under the floor
    pub fn below_floor(&self, min_failures: u64, min_success_percent: f64) -> bool {
        self.failures >= min_failures && self.success_percent() < min_success_percent
    }
}

pub struct SecondarySyncHealthTracker {
    store: Arc<dyn EphemeralStore>,
    daily_failure_threshold: u64,
    max_errors_default: u64,
    max_errors_by_kind: HashMap<String, u64>,
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

fn outcome_key(day: &str, secondary: &str, wallet: &str, sync_type: SyncType, outcome: &str) -> String {
    format!("sync_outcome:{}:{}:{}:{}:{}", day, secondary, wallet, sync_type, outcome)
}

fn error_prefix(day: &str, secondary: &str, wallet: &str) -> String {
    format!("sync_error:{}:{}:{}:", day, secondary, wallet)
}

impl SecondarySyncHealthTracker {
    pub fn new(store: Arc<dyn EphemeralStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            daily_failure_threshold: config.secondary_user_sync_daily_failure_count_threshold,
            max_errors_default: config.max_sync_errors_per_kind,
            max_errors_by_kind: config.max_sync_errors_by_kind.clone(),
        }
    }

    pub async fn record_success(&self, secondary: &str, wallet: &str, sync_type: SyncType) -> Result<()> {
        let key = outcome_key(&today(), secondary, wallet, sync_type, "success");
        self.store.incr_ex(&key, COUNTER_TTL).await?;
        Ok(())
    }

    pub async fn record_failure(&self, secondary: &str, wallet: &str, sync_type: SyncType) -> Result<()> {
        let key = outcome_key(&today(), secondary, wallet, sync_type, "failure");
        let failures = self.store.incr_ex(&key, COUNTER_TTL).await?;
        tracing::debug!(
            "Recorded {} sync failure #{} for {} on {}",
            sync_type, failures, wallet, secondary
        );
        Ok(())
    }

    /// Count one typed sync error; returns today's count for that kind
    pub async fn record_error(&self, secondary: &str, wallet: &str, kind: &str) -> Result<u64> {
        let key = format!("{}{}", error_prefix(&today(), secondary, wallet), kind);
        self.store.incr_ex(&key, COUNTER_TTL).await
    }

    async fn read_counter(&self, key: &str) -> Result<u64> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Today's outcomes across both sync types
    pub async fn counts(&self, secondary: &str, wallet: &str) -> Result<SyncOutcomeCounts> {
        let day = today();
        let mut counts = SyncOutcomeCounts::default();
        for sync_type in SyncType::ALL {
            counts.successes += self
                .read_counter(&outcome_key(&day, secondary, wallet, sync_type, "success"))
                .await?;
            counts.failures += self
                .read_counter(&outcome_key(&day, secondary, wallet, sync_type, "failure"))
                .await?;
        }
        Ok(counts)
    }

    pub async fn daily_failure_count(&self, secondary: &str, wallet: &str, sync_type: SyncType) -> Result<u64> {
        self.read_counter(&outcome_key(&today(), secondary, wallet, sync_type, "failure"))
            .await
    }

    /// Whether syncs of this pair should stop for the rest of the day
    pub async fn has_met_daily_failure_threshold(
        &self,
        secondary: &str,
        wallet: &str,
        sync_type: SyncType,
    ) -> Result<bool> {
        Ok(self.daily_failure_count(secondary, wallet, sync_type).await? >= self.daily_failure_threshold)
    }

    fn max_errors_for(&self, kind: &str) -> u64 {
        self.max_errors_by_kind
            .get(kind)
            .copied()
            .unwrap_or(self.max_errors_default)
    }

    /// The first error kind whose daily count exceeds its ceiling, if any
    pub async fn exceeded_max_errors(&self, secondary: &str, wallet: &str) -> Result<Option<String>> {
        let prefix = error_prefix(&today(), secondary, wallet);
        for (key, value) in self.store.scan_prefix(&prefix).await? {
            let kind = &key[prefix.len()..];
            let count: u64 = value.parse().unwrap_or(0);
            if count > self.max_errors_for(kind) {
                return Ok(Some(kind.to_string()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;

    fn tracker(config: SyncConfig) -> SecondarySyncHealthTracker {
        SecondarySyncHealthTracker::new(Arc::new(MemoryStore::new()), &config)
    }

    #[test]
    fn test_success_percent() {
        assert_eq!(SyncOutcomeCounts::default().success_percent(), 100.0);
        let counts = SyncOutcomeCounts { successes: 1, failures: 3 };
        assert_eq!(counts.success_percent(), 25.0);
        assert!(counts.below_floor(3, 50.0));
        assert!(!counts.below_floor(4, 50.0));
        assert!(!counts.below_floor(3, 20.0));
    }

    #[tokio::test]
    async fn test_outcome_counts() {
        let health = tracker(SyncConfig::default());
        health.record_success("http://cn2", "0xabc", SyncType::Manual).await.unwrap();
        health.record_failure("http://cn2", "0xabc", SyncType::Recurring).await.unwrap();
        health.record_failure("http://cn2", "0xabc", SyncType::Recurring).await.unwrap();
        health.record_failure("http://cn3", "0xabc", SyncType::Recurring).await.unwrap();

        let counts = health.counts("http://cn2", "0xabc").await.unwrap();
        assert_eq!(counts, SyncOutcomeCounts { successes: 1, failures: 2 });
        assert_eq!(
            health.daily_failure_count("http://cn2", "0xabc", SyncType::Manual).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_daily_failure_threshold() {
        let config = SyncConfig {
            secondary_user_sync_daily_failure_count_threshold: 2,
            ..SyncConfig::default()
        };
        let health = tracker(config);
        for _ in 0..2 {
            assert!(!health
                .has_met_daily_failure_threshold("http://cn2", "0xabc", SyncType::Recurring)
                .await
                .unwrap());
            health.record_failure("http://cn2", "0xabc", SyncType::Recurring).await.unwrap();
        }
        assert!(health
            .has_met_daily_failure_threshold("http://cn2", "0xabc", SyncType::Recurring)
            .await
            .unwrap());
        assert!(!health
            .has_met_daily_failure_threshold("http://cn2", "0xabc", SyncType::Manual)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_max_errors_per_kind() {
        let mut config = SyncConfig {
            max_sync_errors_per_kind: 3,
            ..SyncConfig::default()
        };
        config
            .max_sync_errors_by_kind
            .insert("failure_import_not_contiguous".into(), 1);
        let health = tracker(config);

        health.record_error("http://cn2", "0xabc", "failure_export_wallet").await.unwrap();
        health.record_error("http://cn2", "0xabc", "failure_import_not_contiguous").await.unwrap();
        assert_eq!(health.exceeded_max_errors("http://cn2", "0xabc").await.unwrap(), None);

        let count = health
            .record_error("http://cn2", "0xabc", "failure_import_not_contiguous")
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            health.exceeded_max_errors("http://cn2", "0xabc").await.unwrap(),
            Some("failure_import_not_contiguous".to_string())
        );
        assert_eq!(health.exceeded_max_errors("http://cn3", "0xabc").await.unwrap(), None);
    }
}
