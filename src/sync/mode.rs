//! Sync mode resolution between a primary and one secondary.

use std::future::Future;

use serde::{Deserialize, Serialize};

use super::SyncMode;
use crate::error::{Error, Result};

/// Clock and files hash of one user on one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub clock: u64,
    /// None when the replica holds no blob-bearing rows
    pub files_hash: Option<String>,
}

impl UserInfo {
    pub fn new(clock: u64, files_hash: Option<&str>) -> Self {
        Self {
            clock,
            files_hash: files_hash.map(str::to_string),
        }
    }
}

/// Decide how to bring `secondary` in line with `primary`.
///
/// `primary_hash_for_range(clock)` returns the primary's files hash over
/// clocks `[0, clock]`; it is only consulted when the primary is ahead and the
/// secondary already holds files.
pub async fn compute_sync_mode<F, Fut>(
    primary: Option<&UserInfo>,
    secondary: Option<&UserInfo>,
    primary_hash_for_range: F,
) -> Result<SyncMode>
where
    F: FnOnce(u64) -> Fut,
    Fut: Future<Output = Result<Option<String>>>,
{
    let (primary, secondary) = match (primary, secondary) {
        (Some(p), Some(s)) => (p, s),
        _ => {
            return Err(Error::InvalidInput(
                "missing primary or secondary user info".into(),
            ))
        }
    };

    if primary.clock == secondary.clock {
        if primary.files_hash != secondary.files_hash {
            return Ok(SyncMode::MergePrimaryAndSecondary);
        }
        return Ok(SyncMode::None);
    }

    if primary.clock < secondary.clock {
        return Ok(SyncMode::MergePrimaryAndSecondary);
    }

    // Primary is ahead
    let Some(secondary_hash) = secondary.files_hash.as_deref() else {
        return Ok(SyncMode::SyncSecondaryFromPrimary);
    };

    let primary_prefix_hash = primary_hash_for_range(secondary.clock).await.map_err(|e| {
        Error::Internal(format!("failed to compute primary files hash for range: {}", e))
    })?;

    if primary_prefix_hash.as_deref() == Some(secondary_hash) {
        Ok(SyncMode::SyncSecondaryFromPrimary)
    } else {
        Ok(SyncMode::MergePrimaryAndSecondary)
    }
}
