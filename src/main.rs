//! Triplica - Replica Set Consistency Engine
//!
//! Runs on a content node and keeps each user's three replicas converged.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use triplica::api::HttpServer;
use triplica::config::TriplicaConfig;
use triplica::context::JobContext;
use triplica::error::{Error, Result};
use triplica::network::{FsBlobStore, HttpDiscovery, HttpPeerClient, HttpServiceRegistry};
use triplica::queue::JobPipeline;
use triplica::replication::SyncSigner;
use triplica::state::{ClockLedger, SqliteStore};

/// Triplica - Replica Set Consistency Engine
#[derive(Parser)]
#[command(name = "triplica")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "triplica.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start,

    /// Show a node's health and queue status
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:4000")]
        address: String,
    },

    /// Show a user's clock on a node
    ClockStatus {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:4000")]
        address: String,

        /// Wallet to look up
        wallet: String,
    },

    /// Ask a secondary to sync a wallet from its primary
    Sync {
        /// Secondary address
        #[arg(short, long, default_value = "localhost:4000")]
        address: String,

        /// Wallet to sync
        wallet: String,

        /// Endpoint of the primary to export from
        #[arg(long)]
        primary: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "triplica.toml")]
        output: PathBuf,

        /// Public endpoint of this node
        #[arg(long, default_value = "http://localhost:4000")]
        endpoint: String,

        /// Service provider id of this node
        #[arg(long, default_value_t = 1)]
        sp_id: u64,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = cli.log_level;

    match cli.command {
        Commands::Start => {
            let config = TriplicaConfig::from_file(&cli.config)?;
            let level = log_level.unwrap_or_else(|| config.logging.level.clone());
            init_logging(&level, &config.logging.format);
            run_start(config).await
        }
        Commands::Status { address } => {
            init_cli_logging(log_level);
            run_status(address).await
        }
        Commands::ClockStatus { address, wallet } => {
            init_cli_logging(log_level);
            run_clock_status(address, wallet).await
        }
        Commands::Sync { address, wallet, primary } => {
            init_cli_logging(log_level);
            run_sync(address, wallet, primary).await
        }
        Commands::Init { output, endpoint, sp_id } => run_init(output, endpoint, sp_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

fn init_cli_logging(level: Option<String>) {
    init_logging(level.as_deref().unwrap_or("warn"), "pretty");
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the node
async fn run_start(config: TriplicaConfig) -> Result<()> {
    tracing::info!("Starting Triplica node {} (sp id {})", config.node.endpoint, config.node.sp_id);
    tracing::info!("Data directory: {:?}", config.data_dir());

    let ledger = Arc::new(ClockLedger::open(config.data_dir())?);
    let store = Arc::new(SqliteStore::open(&config.ephemeral_store_path())?);
    let blobs = Arc::new(FsBlobStore::new(&config.blob_dir())?);
    let registry = Arc::new(HttpServiceRegistry::new(&config.registry)?);
    let peers = Arc::new(HttpPeerClient::new(&config.sync)?);
    let discovery = Arc::new(HttpDiscovery::new(&config.discovery)?);

    let api_config = config.api.clone();
    let ctx = Arc::new(JobContext::new(
        config,
        ledger,
        store.clone(),
        blobs,
        registry,
        peers,
        discovery,
    )?);
    tracing::info!("Delegate public key: {}", ctx.signer.public_key_hex());

    let pipeline = JobPipeline::new(ctx);
    pipeline.start().await;

    let cancel = CancellationToken::new();

    // Purge expired ephemeral keys
    let purge_cancel = cancel.clone();
    let purge_store = Arc::clone(&store);
    let purge_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = purge_cancel.cancelled() => break,
                _ = interval.tick() => match purge_store.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("Purged {} expired ephemeral keys", n),
                    Err(e) => tracing::warn!("Failed to purge ephemeral keys: {}", e),
                },
            }
        }
    });

    let server = HttpServer::new(api_config, Arc::clone(&pipeline));
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.start(server_cancel).await {
            tracing::error!("HTTP API failed: {}", e);
        }
    });

    tracing::info!("Triplica node started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    cancel.cancel();
    pipeline.stop().await;
    let _ = server_handle.await;
    let _ = purge_handle.await;

    tracing::info!("Triplica node stopped");
    Ok(())
}

/// Print a JSON response body
async fn print_json(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if status.is_success() {
        Ok(())
    } else {
        Err(Error::Network(format!("request failed with {}", status)))
    }
}

/// Check node status
async fn run_status(address: String) -> Result<()> {
    let health = reqwest::get(format!("http://{}/health_check", address)).await?;
    println!("Health:");
    print_json(health).await?;

    let queues = reqwest::get(format!("http://{}/queues", address)).await?;
    println!("Queues:");
    print_json(queues).await
}

/// Look up a user's clock
async fn run_clock_status(address: String, wallet: String) -> Result<()> {
    let url = format!("http://{}/users/clock_status/{}", address, wallet);
    match reqwest::get(&url).await {
        Ok(response) => print_json(response).await,
        Err(e) => {
            eprintln!("Failed to get clock status: {}", e);
            Err(e.into())
        }
    }
}

/// Request a sync
async fn run_sync(address: String, wallet: String, primary: String) -> Result<()> {
    let url = format!("http://{}/sync", address);
    let body = serde_json::json!({
        "wallet": [wallet],
        "creator_node_endpoint": primary,
    });

    let response = reqwest::Client::new().post(&url).json(&body).send().await?;
    print_json(response).await
}

/// Initialize configuration file
fn run_init(output: PathBuf, endpoint: String, sp_id: u64) -> Result<()> {
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    let key_hex = hex::encode(key.to_bytes());

    let config_content = format!(r#"# Triplica Configuration
# Generated configuration file

[node]
endpoint = "{endpoint}"
sp_id = {sp_id}
delegate_private_key = "{key_hex}"
data_dir = "/var/lib/triplica"
dev_mode = false

[registry]
url = "http://localhost:8545"
request_timeout_ms = 10000

[discovery]
url = "http://localhost:5000"
request_timeout_ms = 10000
hard_deadline_ms = 30000
max_retries = 3

[sync]
max_export_clock_value_range = 10000
force_wipe_enabled = true
merge_primary_and_secondary_enabled = false
shared_dedup_store = false

[monitor]
users_per_page = 500
monitor_interval_ms = 60000

[reconfig]
mode = "primary_and_or_secondaries"
max_select_new_replica_set_attempts = 5
node_whitelist = []

[api]
bind_address = "0.0.0.0:4000"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration written to {:?}", output);
    println!("Delegate public key: {}", hex::encode(key.verifying_key().to_bytes()));
    println!("Edit the [registry] and [discovery] URLs before starting.");
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match TriplicaConfig::from_file(&config_path) {
        Ok(_) => {
            println!("✓ Configuration is valid");
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = TriplicaConfig::from_file(&config_path)?;
    let signer = SyncSigner::from_hex(&config.node.delegate_private_key)?;

    println!("Triplica Node Information");
    println!("=========================");
    println!();
    println!("Node:");
    println!("  Endpoint: {}", config.node.endpoint);
    println!("  SP ID: {}", config.node.sp_id);
    println!("  Delegate Public Key: {}", signer.public_key_hex());
    println!("  Data Dir: {:?}", config.data_dir());
    println!("  Dev Mode: {}", config.node.dev_mode);
    println!();
    println!("Registry: {}", config.registry.url);
    println!("Discovery: {}", config.discovery.url);
    println!();
    println!("Sync:");
    println!("  Max Export Range: {}", config.sync.max_export_clock_value_range);
    println!("  Force Wipe Enabled: {}", config.sync.force_wipe_enabled);
    println!("  Merge Endpoint Enabled: {}", config.sync.merge_primary_and_secondary_enabled);
    println!("  Shared Dedup Store: {}", config.sync.shared_dedup_store);
    println!();
    println!("Reconfig:");
    println!("  Mode: {}", config.reconfig.mode);
    println!("  Whitelist: {:?}", config.reconfig.node_whitelist);
    println!();
    println!("API:");
    println!("  Bind Address: {}", config.api.bind_address);

    Ok(())
}
