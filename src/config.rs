//! Triplica Configuration
//!
//! This module provides configuration structures for a Triplica
//! content node.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main Triplica configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriplicaConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Service registry gateway
    pub registry: RegistryConfig,

    /// Discovery service used to page users
    pub discovery: DiscoveryConfig,

    /// Replication and sync tuning
    #[serde(default)]
    pub sync: SyncConfig,

    /// State monitoring cadence
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Replica set reconfiguration
    #[serde(default)]
    pub reconfig: ReconfigConfig,

    /// Job queue sizing
    #[serde(default)]
    pub queues: QueuesConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Public endpoint of this node, as registered on chain
    pub endpoint: String,

    /// Service provider id of this node
    pub sp_id: u64,

    /// Hex-encoded ed25519 delegate private key (32 bytes)
    pub delegate_private_key: String,

    /// Data directory for the ledger, ephemeral store and blobs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Enables development-only routes
    #[serde(default)]
    pub dev_mode: bool,
}

/// Service registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the registry gateway
    pub url: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_registry_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Discovery service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Base URL of the discovery node
    pub url: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_discovery_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Hard deadline for a whole discovery call in milliseconds
    #[serde(default = "default_discovery_deadline_ms")]
    pub hard_deadline_ms: u64,

    /// Retries for retryable discovery errors
    #[serde(default = "default_peer_request_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential retry backoff in milliseconds
    #[serde(default = "default_peer_request_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

/// Replication and sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Largest clock range served by a single export
    #[serde(default = "default_max_export_clock_value_range")]
    pub max_export_clock_value_range: u64,

    /// Concurrent blob fetches during an import
    #[serde(default = "default_file_save_max_concurrency")]
    pub file_save_max_concurrency: usize,

    /// Failed import attempts before missing blobs are skipped
    #[serde(default = "default_skip_failed_files_threshold")]
    pub skip_failed_files_threshold: u64,

    /// Allow forceResync and forceWipe to delete local user data
    #[serde(default = "default_true")]
    pub force_wipe_enabled: bool,

    /// Serve `POST /merge_primary_and_secondary`
    #[serde(default)]
    pub merge_primary_and_secondary_enabled: bool,

    /// Per-wallet sync lock lifetime in milliseconds
    #[serde(default = "default_wallet_lock_ttl_ms")]
    pub wallet_lock_ttl_ms: u64,

    /// Delay between secondary progress checks in milliseconds
    #[serde(default = "default_sync_monitoring_retry_delay_ms")]
    pub sync_monitoring_retry_delay_ms: u64,

    /// How long a manual sync is monitored in milliseconds
    #[serde(default = "default_max_manual_sync_monitoring_duration_ms")]
    pub max_manual_sync_monitoring_duration_ms: u64,

    /// How long a recurring sync is monitored in milliseconds
    #[serde(default = "default_max_recurring_sync_monitoring_duration_ms")]
    pub max_recurring_sync_monitoring_duration_ms: u64,

    /// Attempts per manual sync chain
    #[serde(default = "default_max_sync_attempts")]
    pub max_manual_sync_attempts: u32,

    /// Attempts per recurring sync chain
    #[serde(default = "default_max_sync_attempts")]
    pub max_recurring_sync_attempts: u32,

    /// Minimum daily success rate (percent) before a secondary is skipped
    #[serde(default = "default_min_success_percent")]
    pub minimum_secondary_user_sync_success_percent: f64,

    /// Failures required before success rate is considered
    #[serde(default = "default_min_failed_before_reconfig")]
    pub minimum_failed_sync_requests_before_reconfig: u64,

    /// Daily failures per (secondary, wallet, sync type) before syncs stop
    #[serde(default = "default_daily_failure_count_threshold")]
    pub secondary_user_sync_daily_failure_count_threshold: u64,

    /// Default daily ceiling per typed sync error
    #[serde(default = "default_max_errors_per_kind")]
    pub max_sync_errors_per_kind: u64,

    /// Per error kind overrides of the daily ceiling
    #[serde(default)]
    pub max_sync_errors_by_kind: HashMap<String, u64>,

    /// Back the sync deduplicator with the shared ephemeral store
    #[serde(default)]
    pub shared_dedup_store: bool,

    /// Peer request timeout in milliseconds
    #[serde(default = "default_peer_request_timeout_ms")]
    pub peer_request_timeout_ms: u64,

    /// Export request timeout in milliseconds
    #[serde(default = "default_export_request_timeout_ms")]
    pub export_request_timeout_ms: u64,

    /// Health check timeout in milliseconds
    #[serde(default = "default_peer_health_check_timeout_ms")]
    pub peer_health_check_timeout_ms: u64,

    /// Retries for retryable peer errors
    #[serde(default = "default_peer_request_max_retries")]
    pub peer_request_max_retries: u32,

    /// Base delay for exponential retry backoff in milliseconds
    #[serde(default = "default_peer_request_retry_base_delay_ms")]
    pub peer_request_retry_base_delay_ms: u64,
}

/// State monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Users fetched per monitoring pass
    #[serde(default = "default_users_per_page")]
    pub users_per_page: usize,

    /// Wallets per batch clock status request
    #[serde(default = "default_batch_clock_status_batch_size")]
    pub batch_clock_status_batch_size: usize,

    /// Concurrent peer health checks
    #[serde(default = "default_health_check_concurrency")]
    pub health_check_concurrency: usize,

    /// Delay between monitoring passes in milliseconds
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Lifetime of the peer endpoint to sp id map in milliseconds
    #[serde(default = "default_peer_sp_id_map_ttl_ms")]
    pub peer_sp_id_map_ttl_ms: u64,

    /// Refresh cadence of the peer endpoint to sp id map in milliseconds
    #[serde(default = "default_peer_sp_id_map_refresh_ms")]
    pub peer_sp_id_map_refresh_ms: u64,
}

/// Which reconfigurations are allowed to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconfigMode {
    Disabled,
    OneSecondary,
    MultipleSecondaries,
    PrimaryAndOrSecondaries,
    EntireReplicaSet,
}

impl std::fmt::Display for ReconfigMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconfigMode::Disabled => write!(f, "disabled"),
            ReconfigMode::OneSecondary => write!(f, "one_secondary"),
            ReconfigMode::MultipleSecondaries => write!(f, "multiple_secondaries"),
            ReconfigMode::PrimaryAndOrSecondaries => write!(f, "primary_and_or_secondaries"),
            ReconfigMode::EntireReplicaSet => write!(f, "entire_replica_set"),
        }
    }
}

/// Replica set reconfiguration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigConfig {
    /// Highest reconfig type allowed to execute
    #[serde(default = "default_reconfig_mode")]
    pub mode: ReconfigMode,

    /// Candidate health checks when selecting replacement nodes
    #[serde(default = "default_max_select_attempts")]
    pub max_select_new_replica_set_attempts: usize,

    /// How long a primary must stay unhealthy before secondaries replace it
    #[serde(default = "default_primary_unhealthy_grace_period_ms")]
    pub primary_unhealthy_grace_period_ms: u64,

    /// Only select replacement nodes from this list when non-empty
    #[serde(default)]
    pub node_whitelist: Vec<String>,
}

/// Per-queue sizing
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Concurrent workers
    pub concurrency: usize,

    /// Waiting jobs allowed before enqueues are skipped
    pub max_waiting: usize,

    /// Completed job records kept for inspection
    pub retained_history: usize,
}

impl QueueSettings {
    pub const fn new(concurrency: usize, max_waiting: usize, retained_history: usize) -> Self {
        Self {
            concurrency,
            max_waiting,
            retained_history,
        }
    }
}

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesConfig {
    #[serde(default = "default_singleton_queue")]
    pub monitor_state: QueueSettings,

    #[serde(default = "default_singleton_queue")]
    pub find_sync_requests: QueueSettings,

    #[serde(default = "default_singleton_queue")]
    pub find_replica_set_updates: QueueSettings,

    #[serde(default = "default_manual_sync_queue")]
    pub manual_sync: QueueSettings,

    #[serde(default = "default_recurring_sync_queue")]
    pub recurring_sync: QueueSettings,

    #[serde(default = "default_update_replica_set_queue")]
    pub update_replica_set: QueueSettings,

    #[serde(default = "default_singleton_queue")]
    pub fetch_peer_sp_id_map: QueueSettings,

    #[serde(default = "default_secondary_sync_queue")]
    pub secondary_sync: QueueSettings,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/triplica")
}

fn default_registry_timeout_ms() -> u64 {
    10_000
}

fn default_discovery_timeout_ms() -> u64 {
    10_000
}

fn default_discovery_deadline_ms() -> u64 {
    30_000
}

fn default_max_export_clock_value_range() -> u64 {
    10_000
}

fn default_file_save_max_concurrency() -> usize {
    10
}

fn default_skip_failed_files_threshold() -> u64 {
    3
}

fn default_true() -> bool {
    true
}

fn default_wallet_lock_ttl_ms() -> u64 {
    10 * 60 * 1000
}

fn default_sync_monitoring_retry_delay_ms() -> u64 {
    15_000
}

fn default_max_manual_sync_monitoring_duration_ms() -> u64 {
    6 * 60 * 1000
}

fn default_max_recurring_sync_monitoring_duration_ms() -> u64 {
    60 * 1000
}

fn default_max_sync_attempts() -> u32 {
    2
}

fn default_min_success_percent() -> f64 {
    50.0
}

fn default_min_failed_before_reconfig() -> u64 {
    5
}

fn default_daily_failure_count_threshold() -> u64 {
    20
}

fn default_max_errors_per_kind() -> u64 {
    10
}

fn default_peer_request_timeout_ms() -> u64 {
    10_000
}

fn default_export_request_timeout_ms() -> u64 {
    60_000
}

fn default_peer_health_check_timeout_ms() -> u64 {
    2_000
}

fn default_peer_request_max_retries() -> u32 {
    2
}

fn default_peer_request_retry_base_delay_ms() -> u64 {
    500
}

fn default_users_per_page() -> usize {
    1_000
}

fn default_batch_clock_status_batch_size() -> usize {
    500
}

fn default_health_check_concurrency() -> usize {
    10
}

fn default_monitor_interval_ms() -> u64 {
    5_000
}

fn default_peer_sp_id_map_ttl_ms() -> u64 {
    10 * 60 * 1000
}

fn default_peer_sp_id_map_refresh_ms() -> u64 {
    60 * 1000
}

fn default_reconfig_mode() -> ReconfigMode {
    ReconfigMode::PrimaryAndOrSecondaries
}

fn default_max_select_attempts() -> usize {
    5
}

fn default_primary_unhealthy_grace_period_ms() -> u64 {
    60 * 60 * 1000
}

fn default_singleton_queue() -> QueueSettings {
    QueueSettings::new(1, 10, 50)
}

fn default_manual_sync_queue() -> QueueSettings {
    QueueSettings::new(15, 10_000, 200)
}

fn default_recurring_sync_queue() -> QueueSettings {
    QueueSettings::new(5, 10_000, 200)
}

fn default_update_replica_set_queue() -> QueueSettings {
    QueueSettings::new(3, 10_000, 100)
}

fn default_secondary_sync_queue() -> QueueSettings {
    QueueSettings::new(50, 10_000, 200)
}

fn default_api_address() -> String {
    "0.0.0.0:4000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_export_clock_value_range: default_max_export_clock_value_range(),
            file_save_max_concurrency: default_file_save_max_concurrency(),
            skip_failed_files_threshold: default_skip_failed_files_threshold(),
            force_wipe_enabled: true,
            merge_primary_and_secondary_enabled: false,
            wallet_lock_ttl_ms: default_wallet_lock_ttl_ms(),
            sync_monitoring_retry_delay_ms: default_sync_monitoring_retry_delay_ms(),
            max_manual_sync_monitoring_duration_ms: default_max_manual_sync_monitoring_duration_ms(),
            max_recurring_sync_monitoring_duration_ms: default_max_recurring_sync_monitoring_duration_ms(),
            max_manual_sync_attempts: default_max_sync_attempts(),
            max_recurring_sync_attempts: default_max_sync_attempts(),
            minimum_secondary_user_sync_success_percent: default_min_success_percent(),
            minimum_failed_sync_requests_before_reconfig: default_min_failed_before_reconfig(),
            secondary_user_sync_daily_failure_count_threshold: default_daily_failure_count_threshold(),
            max_sync_errors_per_kind: default_max_errors_per_kind(),
            max_sync_errors_by_kind: HashMap::new(),
            shared_dedup_store: false,
            peer_request_timeout_ms: default_peer_request_timeout_ms(),
            export_request_timeout_ms: default_export_request_timeout_ms(),
            peer_health_check_timeout_ms: default_peer_health_check_timeout_ms(),
            peer_request_max_retries: default_peer_request_max_retries(),
            peer_request_retry_base_delay_ms: default_peer_request_retry_base_delay_ms(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            users_per_page: default_users_per_page(),
            batch_clock_status_batch_size: default_batch_clock_status_batch_size(),
            health_check_concurrency: default_health_check_concurrency(),
            monitor_interval_ms: default_monitor_interval_ms(),
            peer_sp_id_map_ttl_ms: default_peer_sp_id_map_ttl_ms(),
            peer_sp_id_map_refresh_ms: default_peer_sp_id_map_refresh_ms(),
        }
    }
}

impl Default for ReconfigConfig {
    fn default() -> Self {
        Self {
            mode: default_reconfig_mode(),
            max_select_new_replica_set_attempts: default_max_select_attempts(),
            primary_unhealthy_grace_period_ms: default_primary_unhealthy_grace_period_ms(),
            node_whitelist: Vec::new(),
        }
    }
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            monitor_state: default_singleton_queue(),
            find_sync_requests: default_singleton_queue(),
            find_replica_set_updates: default_singleton_queue(),
            manual_sync: default_manual_sync_queue(),
            recurring_sync: default_recurring_sync_queue(),
            update_replica_set: default_update_replica_set_queue(),
            fetch_peer_sp_id_map: default_singleton_queue(),
            secondary_sync: default_secondary_sync_queue(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl TriplicaConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: TriplicaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.endpoint.is_empty() {
            return Err(crate::Error::Config("node.endpoint cannot be empty".into()));
        }

        if self.node.sp_id == 0 {
            return Err(crate::Error::Config("node.sp_id must be non-zero".into()));
        }

        match hex::decode(&self.node.delegate_private_key) {
            Ok(bytes) if bytes.len() == 32 => {}
            _ => {
                return Err(crate::Error::Config(
                    "node.delegate_private_key must be 32 hex-encoded bytes".into(),
                ))
            }
        }

        if self.registry.url.is_empty() {
            return Err(crate::Error::Config("registry.url cannot be empty".into()));
        }

        if self.discovery.url.is_empty() {
            return Err(crate::Error::Config("discovery.url cannot be empty".into()));
        }

        if self.sync.max_export_clock_value_range == 0 {
            return Err(crate::Error::Config(
                "sync.max_export_clock_value_range must be at least 1".into(),
            ));
        }

        if self.monitor.batch_clock_status_batch_size == 0 {
            return Err(crate::Error::Config(
                "monitor.batch_clock_status_batch_size must be at least 1".into(),
            ));
        }

        if !(0.0..=100.0).contains(&self.sync.minimum_secondary_user_sync_success_percent) {
            return Err(crate::Error::Config(
                "sync.minimum_secondary_user_sync_success_percent must be within 0..=100".into(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be pretty or json, got {}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Directory holding content-addressed blobs
    pub fn blob_dir(&self) -> PathBuf {
        self.node.data_dir.join("blobs")
    }

    /// Path of the shared ephemeral store
    pub fn ephemeral_store_path(&self) -> PathBuf {
        self.node.data_dir.join("ephemeral.db")
    }

    pub fn sync_monitoring_retry_delay(&self) -> Duration {
        Duration::from_millis(self.sync.sync_monitoring_retry_delay_ms)
    }

    pub fn wallet_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.sync.wallet_lock_ttl_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.monitor_interval_ms)
    }

    pub fn peer_sp_id_map_ttl(&self) -> Duration {
        Duration::from_millis(self.monitor.peer_sp_id_map_ttl_ms)
    }

    pub fn peer_sp_id_map_refresh(&self) -> Duration {
        Duration::from_millis(self.monitor.peer_sp_id_map_refresh_ms)
    }

    pub fn primary_unhealthy_grace_period(&self) -> Duration {
        Duration::from_millis(self.reconfig.primary_unhealthy_grace_period_ms)
    }

    pub fn discovery_hard_deadline(&self) -> Duration {
        Duration::from_millis(self.discovery.hard_deadline_ms)
    }
}
