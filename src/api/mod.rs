//! HTTP API Module
//!
//! Serves the replication protocol to peers plus a handful of operator
//! routes for writes, merges and manual reconfiguration.

mod http;

pub use http::{AppState, HttpServer};
