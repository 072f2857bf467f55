//! Dispatch of job payloads to their processors.

use serde_json::json;

use super::{Job, JobOutput, JobPayload};
use crate::context::JobContext;
use crate::error::Result;
use crate::replication::{secondary_sync_from_primary, SecondarySyncParams};
use crate::sync::coordinator;
use crate::{monitor, reconcile};

pub(crate) async fn process(ctx: &JobContext, payload: JobPayload) -> Result<JobOutput> {
    match payload {
        JobPayload::MonitorState(input) => monitor::monitor_state(ctx, input).await,
        JobPayload::FindSyncRequests(snapshot) => coordinator::find_sync_requests(ctx, &snapshot).await,
        JobPayload::FindReplicaSetUpdates(snapshot) => reconcile::find_replica_set_updates(ctx, &snapshot).await,
        JobPayload::IssueSync(job) => coordinator::issue_sync_request(ctx, job).await,
        JobPayload::UpdateReplicaSet(job) => reconcile::update_replica_set(ctx, job).await,
        JobPayload::FetchPeerSpIdMap => fetch_peer_sp_id_map(ctx).await,
        JobPayload::SecondarySync(params) => secondary_sync(ctx, params).await,
    }
}

/// Refresh the peer sp id map and schedule the next refresh.
///
/// The next refresh is scheduled even when this one fails.
async fn fetch_peer_sp_id_map(ctx: &JobContext) -> Result<JobOutput> {
    let result = match ctx.peer_sp_ids.refresh(ctx.registry.as_ref()).await {
        Ok(nodes) => json!({ "nodes": nodes }),
        Err(e) => {
            tracing::warn!("Failed to refresh peer sp id map: {}", e);
            json!({ "error": e.to_string() })
        }
    };

    let next = Job::new(JobPayload::FetchPeerSpIdMap).delayed(ctx.config.peer_sp_id_map_refresh());
    Ok(JobOutput::new(result).with_job(next))
}

async fn secondary_sync(ctx: &JobContext, params: SecondarySyncParams) -> Result<JobOutput> {
    let outcome = secondary_sync_from_primary(ctx, &params).await;
    Ok(JobOutput::new(json!({
        "wallet": params.wallet,
        "sync_uuid": params.sync_uuid,
        "result": outcome.result,
        "error": outcome.error,
    })))
}
