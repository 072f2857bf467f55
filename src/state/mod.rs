//! State Management Module
//!
//! Persistent per-user clock ledger, the shared ephemeral store, and
//! replica set membership.

mod ledger;
mod membership;
mod store;

pub use ledger::{ClockLedger, ClockRecord, DataRow, ImportBatch, LedgerSlice, NewRow, UserClockStatus};
pub use membership::{ContentNode, NodeRole, NodeUser, PeerSpIdCache, ReplicaSet, ReplicaSetSpIds};
pub use store::{EphemeralStore, MemoryStore, SqliteStore};
