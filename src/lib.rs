//! Triplica - Replica Set Consistency Engine
//!
//! Every user's data lives on three content nodes: one primary and two
//! secondaries. Triplica runs on each node and keeps those copies
//! converged.
//!
//! # Architecture
//!
//! A per-node clock ledger orders every write for a user. Primaries
//! periodically compare their clock with each secondary and issue syncs;
//! secondaries pull the missing clock range from the primary and import it.
//! A state monitor pages through the users a node serves, and a
//! reconciler replaces replicas that stay unhealthy.
//!
//! # Features
//!
//! - Per-wallet clock ledger with range export and verified import
//! - Sync mode resolution from clocks and files hashes
//! - Deduplicated manual and recurring sync requests
//! - Daily per-secondary sync health counters
//! - Replica set reconfiguration with registry compare-and-set
//! - Named job queues with bounded concurrency and history
//! - HTTP API for peers and operators

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod monitor;
pub mod network;
pub mod queue;
pub mod reconcile;
pub mod replication;
pub mod state;
pub mod sync;

#[cfg(test)]
mod testkit;

pub use config::TriplicaConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::TriplicaConfig;
    pub use crate::context::JobContext;
    pub use crate::error::{Error, Result};
    pub use crate::queue::{Job, JobPayload, JobPipeline};
    pub use crate::state::{ClockLedger, ReplicaSet};
    pub use crate::sync::{compute_sync_mode, SyncRequestDeduplicator};
}
