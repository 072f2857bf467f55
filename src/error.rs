//! Triplica Error Types

use thiserror::Error;

/// Result type alias for Triplica operations
pub type Result<T> = std::result::Result<T, Error>;

/// Triplica error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Ledger errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Inconsistent clock for {wallet}: user clock {clock}, max record clock {max_record_clock}")]
    InconsistentClock {
        wallet: String,
        clock: u64,
        max_record_clock: u64,
    },

    #[error("Import not contiguous for {wallet}: local clock {local_clock}, first imported clock {first_clock}")]
    ImportNotContiguous {
        wallet: String,
        local_clock: u64,
        first_clock: u64,
    },

    #[error("Import not consistent for {wallet}: {reason}")]
    ImportNotConsistent { wallet: String, reason: String },

    #[error("Export inconsistent for {wallet}: {reason}")]
    ExportInconsistent { wallet: String, reason: String },

    // Topology errors
    #[error("Not primary for {0}")]
    NotPrimary(String),

    #[error("Not secondary for {0}")]
    NotSecondary(String),

    #[error("Replica set changed: {0}")]
    ReplicaSetChanged(String),

    #[error("Not enough healthy nodes: {0}")]
    InsufficientHealthyNodes(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Peer {endpoint} returned {status}: {message}")]
    Peer {
        endpoint: String,
        status: u16,
        message: String,
    },

    // Resource errors
    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Threshold exceeded: {0}")]
    ThresholdExceeded(String),

    #[error("Lock held: {0}")]
    LockHeld(String),

    // Request errors
    #[error("Refused: {0}")]
    Refused(String),

    #[error("Invalid signature: {0}")]
    Signature(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectionTimeout(_) | Error::ConnectionFailed { .. } | Error::Network(_) => true,
            Error::Peer { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::InconsistentClock { .. } => "INCONSISTENT_CLOCK",
            Error::ImportNotContiguous { .. } => "IMPORT_NOT_CONTIGUOUS",
            Error::ImportNotConsistent { .. } => "IMPORT_NOT_CONSISTENT",
            Error::ExportInconsistent { .. } => "EXPORT_INCONSISTENT",
            Error::NotPrimary(_) => "NOT_PRIMARY",
            Error::NotSecondary(_) => "NOT_SECONDARY",
            Error::ReplicaSetChanged(_) => "REPLICA_SET_CHANGED",
            Error::InsufficientHealthyNodes(_) => "INSUFFICIENT_HEALTHY_NODES",
            Error::Network(_) | Error::ConnectionFailed { .. } => "NETWORK_ERROR",
            Error::ConnectionTimeout(_) => "TIMEOUT",
            Error::Peer { .. } => "PEER_ERROR",
            Error::QueueFull(_) => "QUEUE_FULL",
            Error::ThresholdExceeded(_) => "THRESHOLD_EXCEEDED",
            Error::LockHeld(_) => "LOCK_HELD",
            Error::Refused(_) => "REFUSED",
            Error::Signature(_) => "INVALID_SIGNATURE",
            Error::InvalidInput(_) | Error::Serialization(_) => "INVALID_INPUT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Io(_) | Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status code for API responses
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidInput(_) | Error::Serialization(_) => 400,
            Error::Signature(_) => 401,
            Error::Refused(_) => 403,
            Error::NotFound(_) => 404,
            Error::NotPrimary(_)
            | Error::NotSecondary(_)
            | Error::ReplicaSetChanged(_)
            | Error::LockHeld(_) => 409,
            Error::ThresholdExceeded(_) => 429,
            Error::Network(_)
            | Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout(_)
            | Error::Peer { .. } => 502,
            Error::QueueFull(_) | Error::InsufficientHealthyNodes(_) => 503,
            _ => 500,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(format!("SQLite error: {}", e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let address = e
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        if e.is_timeout() {
            Error::ConnectionTimeout(address)
        } else if e.is_connect() {
            Error::ConnectionFailed {
                address,
                reason: e.to_string(),
            }
        } else if let Some(status) = e.status() {
            Error::Peer {
                endpoint: address,
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            Error::Network(e.to_string())
        }
    }
}
