//! HTTP API Server
//!
//! Replica-to-replica routes (export, sync, clock status, blobs) plus the
//! primary's write route and operator routes.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, Json},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::ApiConfig;
use crate::context::JobContext;
use crate::error::{Error, Result};
use crate::queue::{Job, JobPayload, JobPipeline, QueueStatus};
use crate::replication::protocol::{
    BatchClockStatusRequest, BatchClockStatusResponse, ClockStatusResponse, ExportQuery,
    HealthCheckResponse, SyncRequest, SyncResponse, SyncTicket,
};
use crate::replication::{
    export_wallet, get_sync_status, primary_sync_from_secondary, record_sync_status,
    secondary_sync_from_primary, ForceAction, SecondarySyncParams, SyncResult, SyncStatus,
};
use crate::state::{DataRow, NewRow, NodeRole, ReplicaSetSpIds};
use crate::sync::{SyncJob, SyncMode, SyncReqOutcome, SyncType};

/// Shared application state
pub struct AppState {
    pub ctx: Arc<JobContext>,
    pub pipeline: Arc<JobPipeline>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, pipeline: Arc<JobPipeline>) -> Self {
        let state = Arc::new(AppState {
            ctx: Arc::clone(pipeline.context()),
            pipeline,
        });
        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            // Replication
            .route("/export", get(handle_export))
            .route("/sync", post(handle_sync))
            .route("/sync_status/uuid/:sync_uuid", get(handle_sync_status))
            .route("/users/batch_clock_status", post(handle_batch_clock_status))
            .route("/users/clock_status/:wallet", get(handle_clock_status))
            .route("/blobs/:multihash", get(handle_blob))
            // Writes
            .route("/users/:wallet/records", post(handle_append_record))
            // Operator routes
            .route("/merge_primary_and_secondary", post(handle_merge))
            .route("/manually_update_replica_set", post(handle_manual_update))
            .route("/health_check", get(handle_health_check))
            .route("/queues", get(handle_queues))
            .layer(TraceLayer::new_for_http());

        let router = if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        };
        router.with_state(Arc::clone(&self.state))
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Body of `POST /merge_primary_and_secondary`
#[derive(Debug, Deserialize, Serialize)]
pub struct MergeRequest {
    pub wallet: String,
    /// The secondary to merge from
    pub endpoint: String,
    /// Wipe the secondary after the merge instead of resyncing it
    #[serde(default)]
    pub force_wipe: bool,
}

#[derive(Debug, Serialize)]
pub struct MergeResponse {
    pub wallet: String,
    pub merged_rows: usize,
    pub syncs: Vec<SyncTicket>,
}

/// Body of `POST /manually_update_replica_set`
#[derive(Debug, Deserialize, Serialize)]
pub struct ManualUpdateRequest {
    pub user_id: u64,
    pub primary: u64,
    pub secondary1: u64,
    pub secondary2: u64,
}

#[derive(Debug, Serialize)]
pub struct ManualUpdateResponse {
    pub user_id: u64,
    pub old: ReplicaSetSpIds,
    pub new: ReplicaSetSpIds,
}

/// Body of `POST /users/:wallet/records`
#[derive(Debug, Deserialize, Serialize)]
pub struct AppendRecordRequest {
    pub source_table: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Hex-encoded blob the row references
    #[serde(default)]
    pub blob_hex: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AppendRecordResponse {
    pub row: DataRow,
    pub syncs_issued: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============ Helpers ============

fn error_response(error: &Error) -> Response {
    let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!("Request failed: {}", error);
    } else {
        tracing::debug!("Request rejected: {}", error);
    }
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: error.code().to_string(),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => error_response(&e),
    }
}

// ============ Handlers ============

async fn handle_export(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExportQuery>,
) -> Response {
    let ctx = &state.ctx;
    respond(
        export_wallet(
            &ctx.ledger,
            &query.wallet,
            query.clock_range_min,
            query.force_export,
            ctx.config.sync.max_export_clock_value_range,
        )
        .await,
    )
}

async fn handle_sync(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncRequest>,
) -> Response {
    respond(accept_sync(&state, &req).await)
}

/// Run immediate syncs inline; queue the rest with a pending status
async fn accept_sync(state: &AppState, req: &SyncRequest) -> Result<SyncResponse> {
    let ctx = &state.ctx;
    let mut syncs = Vec::with_capacity(req.wallet.len());

    for params in SecondarySyncParams::from_request(req)? {
        if req.immediate {
            let outcome = secondary_sync_from_primary(ctx, &params).await;
            syncs.push(SyncTicket {
                wallet: params.wallet,
                sync_uuid: params.sync_uuid,
                result: Some(outcome.result),
            });
            continue;
        }

        let mut status = SyncStatus {
            sync_uuid: params.sync_uuid.clone(),
            wallet: params.wallet.clone(),
            result: SyncResult::Pending,
            error: None,
            updated_at: Utc::now(),
        };
        record_sync_status(ctx.store.as_ref(), &status).await?;

        // Wipes jump ahead of queued syncs
        let job = Job::new(JobPayload::SecondarySync(params.clone()));
        let job = if params.force_wipe { job.lifo() } else { job };
        if !state.pipeline.enqueue(job).await {
            status.result = SyncResult::FailureSyncSecondaryFromPrimary;
            status.error = Some("secondary sync queue is full".into());
            status.updated_at = Utc::now();
            record_sync_status(ctx.store.as_ref(), &status).await?;
            return Err(Error::QueueFull(format!("secondary sync of {}", params.wallet)));
        }

        syncs.push(SyncTicket {
            wallet: params.wallet,
            sync_uuid: params.sync_uuid,
            result: None,
        });
    }

    Ok(SyncResponse { syncs })
}

async fn handle_sync_status(
    State(state): State<Arc<AppState>>,
    Path(sync_uuid): Path<String>,
) -> Response {
    let status = get_sync_status(state.ctx.store.as_ref(), &sync_uuid)
        .await
        .and_then(|status| status.ok_or_else(|| Error::NotFound(format!("sync {}", sync_uuid))));
    respond(status)
}

async fn handle_batch_clock_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchClockStatusRequest>,
) -> Response {
    let users = state
        .ctx
        .ledger
        .batch_clock_status(&req.wallet_public_keys, req.include_files_hash)
        .await;
    respond(users.map(|users| BatchClockStatusResponse { users }))
}

async fn handle_clock_status(
    State(state): State<Arc<AppState>>,
    Path(wallet): Path<String>,
) -> Response {
    let clock = state.ctx.ledger.clock(&wallet).await;
    respond(clock.map(|clock| ClockStatusResponse { wallet, clock }))
}

async fn handle_blob(
    State(state): State<Arc<AppState>>,
    Path(multihash): Path<String>,
) -> Response {
    match state.ctx.blobs.read(&multihash).await {
        Ok(Some(bytes)) => ([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response(),
        Ok(None) => error_response(&Error::NotFound(format!("blob {}", multihash))),
        Err(e) => error_response(&e),
    }
}

async fn handle_append_record(
    State(state): State<Arc<AppState>>,
    Path(wallet): Path<String>,
    Json(req): Json<AppendRecordRequest>,
) -> Response {
    respond(append_record(&state, &wallet, req).await)
}

/// Append one write on the primary, then issue manual syncs to both secondaries
async fn append_record(state: &AppState, wallet: &str, req: AppendRecordRequest) -> Result<AppendRecordResponse> {
    let ctx = &state.ctx;
    let replica_set = ctx
        .registry
        .replica_set_for_wallet(wallet)
        .await?
        .ok_or_else(|| Error::NotFound(format!("replica set of {}", wallet)))?
        .replica_set;
    if replica_set.role_of(ctx.self_endpoint()) != NodeRole::Primary {
        return Err(Error::NotPrimary(wallet.to_string()));
    }

    let mut row = NewRow::new(req.source_table, req.payload);
    if let Some(blob_hex) = req.blob_hex {
        let bytes = hex::decode(&blob_hex).map_err(|e| Error::InvalidInput(format!("blob_hex: {}", e)))?;
        row = row.with_multihash(ctx.blobs.save(&bytes).await?);
    }
    let row = ctx.ledger.append(wallet, row).await?;
    tracing::debug!("Appended {} row {} to {} at clock {}", row.source_table, row.row_uuid, wallet, row.clock);

    let mut syncs_issued = 0;
    for secondary in replica_set.secondaries() {
        if secondary.is_empty() {
            continue;
        }
        let job = SyncJob::new(
            SyncType::Manual,
            SyncMode::SyncSecondaryFromPrimary,
            wallet,
            ctx.self_endpoint(),
            secondary,
        );
        match ctx.dedup.get_new_or_existing_sync_req(job).await? {
            SyncReqOutcome::New(job) => {
                if state.pipeline.enqueue(Job::new(JobPayload::IssueSync(job))).await {
                    syncs_issued += 1;
                }
            }
            SyncReqOutcome::Duplicate { job_id } => {
                tracing::debug!("Manual sync of {} to {} already queued as {}", wallet, secondary, job_id)
            }
        }
    }

    Ok(AppendRecordResponse { row, syncs_issued })
}

async fn handle_merge(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MergeRequest>,
) -> Response {
    respond(merge_primary_and_secondary(&state.ctx, req).await)
}

/// Pull a secondary's unique rows, then force-resync (or wipe) it
async fn merge_primary_and_secondary(ctx: &JobContext, req: MergeRequest) -> Result<MergeResponse> {
    if !ctx.config.sync.merge_primary_and_secondary_enabled {
        return Err(Error::Refused("merge_primary_and_secondary is disabled on this node".into()));
    }
    let merged_rows = primary_sync_from_secondary(ctx, &req.wallet, &req.endpoint).await?;

    let wallets = vec![req.wallet.clone()];
    let action = if req.force_wipe {
        ForceAction::Wipe
    } else {
        ForceAction::Resync
    };
    let (timestamp, signature) = ctx.signer.sign(action, &wallets);
    let request = SyncRequest {
        wallet: wallets,
        creator_node_endpoint: ctx.self_endpoint().to_string(),
        immediate: false,
        force_resync: !req.force_wipe,
        force_wipe: req.force_wipe,
        timestamp: Some(timestamp),
        signature: Some(signature),
        sync_uuid: None,
        block_number: None,
    };
    let response = ctx.peers.issue_sync(&req.endpoint, &request).await?;
    tracing::info!(
        "Merged {} rows of {} from {} and issued {:?}",
        merged_rows, req.wallet, req.endpoint, action
    );

    Ok(MergeResponse {
        wallet: req.wallet,
        merged_rows,
        syncs: response.syncs,
    })
}

async fn handle_manual_update(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ManualUpdateRequest>,
) -> Response {
    respond(manually_update_replica_set(&state.ctx, req).await)
}

async fn manually_update_replica_set(ctx: &JobContext, req: ManualUpdateRequest) -> Result<ManualUpdateResponse> {
    if !ctx.config.node.dev_mode {
        return Err(Error::Refused("manual replica set updates require dev_mode".into()));
    }
    let old = ctx.registry.user_replica_set(req.user_id).await?;
    let new = ReplicaSetSpIds {
        primary: req.primary,
        secondary1: req.secondary1,
        secondary2: req.secondary2,
    };
    ctx.registry.update_replica_set(req.user_id, new, old).await?;
    tracing::warn!("Replica set of user {} manually changed from {:?} to {:?}", req.user_id, old, new);
    Ok(ManualUpdateResponse {
        user_id: req.user_id,
        old,
        new,
    })
}

async fn handle_health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthCheckResponse {
        healthy: true,
        endpoint: state.ctx.self_endpoint().to_string(),
        sp_id: state.ctx.config.node.sp_id,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_queues(State(state): State<Arc<AppState>>) -> Json<Vec<QueueStatus>> {
    Json(state.pipeline.status().await)
}
