//! Sync Coordinator
//!
//! Primary-side processors: find the syncs this node owes its users'
//! secondaries, then issue each one and watch the secondary catch up.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use super::{compute_sync_mode, SyncJob, SyncMode, SyncReqOutcome, SyncType};
use crate::context::JobContext;
use crate::error::Result;
use crate::monitor::MonitorSnapshot;
use crate::queue::{Job, JobOutput, JobPayload};
use crate::replication::protocol::{SyncRequest, SyncResult};
use crate::replication::{primary_sync_from_secondary, ForceAction};

/// Queue recurring syncs for every secondary that has fallen out of line.
///
/// Works from a monitor snapshot; a secondary is skipped if it is unhealthy,
/// its registered sp id does not match, or its sync success rate is below
/// the floor (those cases are left to the reconciler).
pub async fn find_sync_requests(ctx: &JobContext, snapshot: &MonitorSnapshot) -> Result<JobOutput> {
    let self_endpoint = ctx.self_endpoint();
    let sync_config = &ctx.config.sync;
    let mut output = JobOutput::default();
    let mut issued = 0usize;
    let mut duplicates = 0usize;
    let mut skipped = 0usize;
    let mut errors = Vec::new();

    let primary_statuses = snapshot.clock_statuses.get(self_endpoint);

    for user in snapshot.users.iter().filter(|u| u.primary == self_endpoint) {
        for (secondary, sp_id) in user.secondaries_with_sp_ids() {
            if secondary.is_empty() || secondary == self_endpoint {
                continue;
            }
            if snapshot.unhealthy_peers.contains(secondary) {
                tracing::debug!("Not syncing {} to unhealthy secondary {}", user.wallet, secondary);
                skipped += 1;
                continue;
            }

            let registered = ctx.peer_sp_ids.sp_id_for(secondary).await;
            if registered != Some(sp_id) {
                tracing::warn!(
                    "Not syncing {} to {}: replica set lists sp id {} but the registry maps it to {:?}",
                    user.wallet, secondary, sp_id, registered
                );
                skipped += 1;
                continue;
            }

            let counts = snapshot.success_rate(&user.wallet, secondary);
            if counts.below_floor(
                sync_config.minimum_failed_sync_requests_before_reconfig,
                sync_config.minimum_secondary_user_sync_success_percent,
            ) {
                tracing::info!(
                    "Not syncing {} to {}: success rate {:.1}% over {} failures",
                    user.wallet,
                    secondary,
                    counts.success_percent(),
                    counts.failures
                );
                skipped += 1;
                continue;
            }

            let primary_info = primary_statuses.and_then(|m| m.get(&user.wallet));
            let secondary_info = snapshot.user_info(secondary, &user.wallet);
            let mode = match compute_sync_mode(primary_info, secondary_info, |clock| {
                ctx.ledger.files_hash(&user.wallet, None, Some(clock))
            })
            .await
            {
                Ok(mode) => mode,
                Err(e) => {
                    errors.push(format!("{} on {}: {}", user.wallet, secondary, e));
                    continue;
                }
            };
            if mode == SyncMode::None {
                continue;
            }

            let job = SyncJob::new(SyncType::Recurring, mode, &user.wallet, self_endpoint, secondary);
            match ctx.dedup.get_new_or_existing_sync_req(job).await {
                Ok(SyncReqOutcome::New(job)) => {
                    output.enqueue(Job::new(JobPayload::IssueSync(job)));
                    issued += 1;
                }
                Ok(SyncReqOutcome::Duplicate { job_id }) => {
                    tracing::debug!("Recurring sync of {} to {} already queued as {}", user.wallet, secondary, job_id);
                    duplicates += 1;
                }
                Err(e) => errors.push(format!("{} on {}: {}", user.wallet, secondary, e)),
            }
        }
    }

    if !errors.is_empty() {
        tracing::warn!("find_sync_requests hit {} errors: {}", errors.len(), errors.join("; "));
    }
    tracing::info!(
        "Found {} sync requests ({} duplicates, {} skipped) across {} users",
        issued,
        duplicates,
        skipped,
        snapshot.users.len()
    );

    output.result = json!({
        "sync_requests": issued,
        "duplicates": duplicates,
        "skipped": skipped,
        "errors": errors,
    });
    Ok(output)
}

/// How a monitored sync ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMonitoringOutcome {
    SuccessSecondaryCaughtUp,
    SuccessSecondaryPartiallyCaughtUp,
    FailureSecondaryFailedToProgress,
}

/// Why another sync was queued after this one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdditionalSyncReason {
    None,
    SecondaryProgressedTooSlow,
    SecondaryFailedToProgress,
}

struct SyncProgress {
    initial_secondary_clock: u64,
    final_secondary_clock: u64,
    primary_clock: u64,
    secondary_result: Option<SyncResult>,
}

impl SyncProgress {
    fn outcome(&self) -> (SyncMonitoringOutcome, AdditionalSyncReason) {
        if self.final_secondary_clock >= self.primary_clock {
            (SyncMonitoringOutcome::SuccessSecondaryCaughtUp, AdditionalSyncReason::None)
        } else if self.final_secondary_clock > self.initial_secondary_clock {
            (
                SyncMonitoringOutcome::SuccessSecondaryPartiallyCaughtUp,
                AdditionalSyncReason::SecondaryProgressedTooSlow,
            )
        } else {
            (
                SyncMonitoringOutcome::FailureSecondaryFailedToProgress,
                AdditionalSyncReason::SecondaryFailedToProgress,
            )
        }
    }
    /// Mode of the sync queued when this one left the secondary behind.
    ///
    /// After a merge, only a resync that rebuilt part of the secondary
    /// without reporting a failure hands over to the forward sync; anything
    /// else runs the merge and resync again.
    fn follow_up_mode(&self, mode: SyncMode) -> SyncMode {
        let rebuilt = self.final_secondary_clock > 0 && !self.secondary_result.is_some_and(|r| r.is_failure());
        if mode == SyncMode::MergePrimaryAndSecondary && !rebuilt {
            mode
        } else {
            SyncMode::SyncSecondaryFromPrimary
        }
    }
}

fn max_attempts(ctx: &JobContext, sync_type: SyncType) -> u32 {
    match sync_type {
        SyncType::Manual => ctx.config.sync.max_manual_sync_attempts,
        SyncType::Recurring => ctx.config.sync.max_recurring_sync_attempts,
    }
}

fn max_monitoring_duration(ctx: &JobContext, sync_type: SyncType) -> Duration {
    let ms = match sync_type {
        SyncType::Manual => ctx.config.sync.max_manual_sync_monitoring_duration_ms,
        SyncType::Recurring => ctx.config.sync.max_recurring_sync_monitoring_duration_ms,
    };
    Duration::from_millis(ms)
}

/// Issue one sync to a secondary and monitor it.
///
/// A merge-mode job first pulls the secondary's unique rows onto this
/// primary and then force-resyncs the secondary; a failed merge queues
/// nothing. A secondary left behind gets another sync of the same type
/// until the attempt ceiling.
pub async fn issue_sync_request(ctx: &JobContext, job: SyncJob) -> Result<JobOutput> {
    if let Err(e) = ctx.dedup.remove_job(&job).await {
        tracing::warn!("Failed to release dedup key of sync {}: {}", job.job_id, e);
    }

    let label = format!(
        "({})({}) {} on {}",
        job.sync_type, job.sync_mode, job.wallet, job.secondary_endpoint
    );

    if job.sync_mode == SyncMode::None {
        return Ok(JobOutput::new(json!({ "wallet": job.wallet, "skipped": "sync mode is none" })));
    }

    if ctx
        .health
        .has_met_daily_failure_threshold(&job.secondary_endpoint, &job.wallet, job.sync_type)
        .await?
    {
        let message = format!(
            "{} || Secondary has already met SecondaryUserSyncDailyFailureCountThreshold ({}). \
             Will not issue further sync requests today.",
            label, ctx.config.sync.secondary_user_sync_daily_failure_count_threshold
        );
        tracing::error!("{}", message);
        return Ok(JobOutput::new(json!({ "error": message })));
    }

    let started = Instant::now();
    let merging = job.sync_mode == SyncMode::MergePrimaryAndSecondary;
    let mut merged_rows = None;
    if merging {
        // A failed merge is left to the next monitoring cycle to re-evaluate
        match primary_sync_from_secondary(ctx, &job.wallet, &job.secondary_endpoint).await {
            Ok(merged) => {
                tracing::info!("{} || merged {} rows before resync", label, merged);
                merged_rows = Some(merged);
            }
            Err(e) => {
                tracing::error!("{} || merge failed: {}", label, e);
                record_outcome(ctx, &job, false).await;
                return Ok(JobOutput::new(json!({
                    "wallet": job.wallet,
                    "secondary": job.secondary_endpoint,
                    "sync_mode": job.sync_mode,
                    "error": e.to_string(),
                    "reason_for_additional_sync": AdditionalSyncReason::None,
                })));
            }
        }
    }

    let progress = match issue_and_monitor(ctx, &job, merging).await {
        Ok(progress) => progress,
        Err(e) => {
            tracing::error!("{} || sync failed: {}", label, e);
            record_outcome(ctx, &job, false).await;
            let mut output = JobOutput::new(json!({
                "wallet": job.wallet,
                "secondary": job.secondary_endpoint,
                "merged_rows": merged_rows,
                "error": e.to_string(),
                "reason_for_additional_sync": AdditionalSyncReason::SecondaryFailedToProgress,
            }));
            enqueue_additional_sync(ctx, &job, job.sync_mode, &mut output).await;
            return Ok(output);
        }
    };

    let (outcome, reason) = progress.outcome();
    record_outcome(ctx, &job, outcome != SyncMonitoringOutcome::FailureSecondaryFailedToProgress).await;

    tracing::info!(
        "{} || {:?} (secondary clock {} -> {}, primary clock {}) in {:?}",
        label,
        outcome,
        progress.initial_secondary_clock,
        progress.final_secondary_clock,
        progress.primary_clock,
        started.elapsed()
    );

    let mut output = JobOutput::new(json!({
        "wallet": job.wallet,
        "secondary": job.secondary_endpoint,
        "sync_type": job.sync_type,
        "sync_mode": job.sync_mode,
        "attempt_number": job.attempt_number,
        "merged_rows": merged_rows,
        "outcome": outcome,
        "reason_for_additional_sync": reason,
        "secondary_result": progress.secondary_result,
        "primary_clock": progress.primary_clock,
        "initial_secondary_clock": progress.initial_secondary_clock,
        "final_secondary_clock": progress.final_secondary_clock,
        "monitoring_duration_ms": started.elapsed().as_millis() as u64,
    }));
    if reason != AdditionalSyncReason::None {
        enqueue_additional_sync(ctx, &job, progress.follow_up_mode(job.sync_mode), &mut output).await;
    }
    Ok(output)
}

/// Issue the sync to the secondary and poll until it catches up or the
/// monitoring window closes. `force_resync` carries a signed resync.
async fn issue_and_monitor(ctx: &JobContext, job: &SyncJob, force_resync: bool) -> Result<SyncProgress> {
    let wallet = &job.wallet;
    let secondary = &job.secondary_endpoint;
    let mut request = SyncRequest {
        wallet: vec![wallet.clone()],
        creator_node_endpoint: job.primary_endpoint.clone(),
        immediate: job.immediate,
        ..Default::default()
    };

    if force_resync {
        let (timestamp, signature) = ctx.signer.sign(ForceAction::Resync, &request.wallet);
        request.force_resync = true;
        request.timestamp = Some(timestamp);
        request.signature = Some(signature);
    }

    let primary_clock = if job.primary_endpoint == ctx.self_endpoint() {
        ctx.ledger.clock(wallet).await?
    } else {
        ctx.peers.clock_status(&job.primary_endpoint, wallet).await?
    };
    // A forced resync starts the secondary over from nothing
    let initial_secondary_clock = if request.force_resync {
        0
    } else {
        ctx.peers.clock_status(secondary, wallet).await?
    };

    let sync_uuid = uuid::Uuid::new_v4().to_string();
    request.sync_uuid = Some(sync_uuid.clone());
    ctx.peers.issue_sync(secondary, &request).await?;

    let deadline = Instant::now() + max_monitoring_duration(ctx, job.sync_type);
    let retry_delay = ctx.config.sync_monitoring_retry_delay();
    let mut secondary_clock = initial_secondary_clock;
    let mut secondary_result = None;

    while secondary_clock < primary_clock && Instant::now() < deadline {
        tokio::time::sleep(retry_delay).await;

        let status = match ctx.peers.sync_status(secondary, &sync_uuid).await {
            Ok(status) => status.filter(|s| s.result != SyncResult::Pending),
            Err(e) => {
                tracing::debug!("Sync status of {} on {} unavailable: {}", sync_uuid, secondary, e);
                None
            }
        };
        match ctx.peers.clock_status(secondary, wallet).await {
            Ok(clock) => secondary_clock = clock,
            Err(e) => tracing::debug!("Clock of {} on {} unavailable: {}", wallet, secondary, e),
        }

        if let Some(status) = status {
            secondary_result = Some(status.result);
            if status.result.is_failure() {
                let count = ctx
                    .health
                    .record_error(secondary, wallet, status.result.as_str())
                    .await?;
                tracing::warn!(
                    "Secondary {} reported {} for {} ({} today): {}",
                    secondary,
                    status.result,
                    wallet,
                    count,
                    status.error.as_deref().unwrap_or("")
                );
            }
            break;
        }
    }

    Ok(SyncProgress {
        initial_secondary_clock,
        final_secondary_clock: secondary_clock,
        primary_clock,
        secondary_result,
    })
}

async fn record_outcome(ctx: &JobContext, job: &SyncJob, success: bool) {
    let recorded = if success {
        ctx.health
            .record_success(&job.secondary_endpoint, &job.wallet, job.sync_type)
            .await
    } else {
        ctx.health
            .record_failure(&job.secondary_endpoint, &job.wallet, job.sync_type)
            .await
    };
    if let Err(e) = recorded {
        tracing::warn!("Failed to record sync outcome of {}: {}", job.wallet, e);
    }
}

async fn enqueue_additional_sync(ctx: &JobContext, job: &SyncJob, mode: SyncMode, output: &mut JobOutput) {
    if job.attempt_number >= max_attempts(ctx, job.sync_type) {
        tracing::info!(
            "Not retrying sync of {} to {} after {} attempts",
            job.wallet, job.secondary_endpoint, job.attempt_number
        );
        return;
    }

    let next = SyncJob::new(
        job.sync_type,
        mode,
        &job.wallet,
        &job.primary_endpoint,
        &job.secondary_endpoint,
    )
    .with_attempt(job.attempt_number + 1);

    match ctx.dedup.get_new_or_existing_sync_req(next).await {
        Ok(SyncReqOutcome::New(next)) => output.enqueue(Job::new(JobPayload::IssueSync(next))),
        Ok(SyncReqOutcome::Duplicate { job_id }) => {
            tracing::debug!("Additional sync of {} already queued as {}", job.wallet, job_id)
        }
        Err(e) => tracing::warn!("Failed to queue additional sync of {}: {}", job.wallet, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueName;
    use crate::testkit::{endpoint, TestCluster};

    const WALLET: &str = "0xabc";

    fn issued(output: &JobOutput) -> Vec<&SyncJob> {
        output
            .jobs(QueueName::RecurringSync)
            .iter()
            .chain(output.jobs(QueueName::ManualSync))
            .filter_map(|job| match &job.payload {
                JobPayload::IssueSync(sync) => Some(sync),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_primary_ahead_syncs_secondary_to_caught_up() {
        let cluster = TestCluster::new().await;
        cluster.add_user(1, WALLET, [1, 2, 3]).await;
        cluster.write_rows(1, WALLET, 12).await;
        cluster.copy_ledger(1, 2, WALLET, 8).await;

        let primary = cluster.node(1);
        primary.peer_sp_ids.refresh(cluster.registry.as_ref()).await.unwrap();
        let snapshot = cluster.snapshot(1).await;

        let found = find_sync_requests(&primary, &snapshot).await.unwrap();
        let jobs = issued(&found);
        let to_cn2: Vec<_> = jobs.iter().filter(|j| j.secondary_endpoint == endpoint(2)).collect();
        assert_eq!(to_cn2.len(), 1);
        assert_eq!(to_cn2[0].sync_mode, SyncMode::SyncSecondaryFromPrimary);

        let output = issue_sync_request(&primary, (*to_cn2[0]).clone()).await.unwrap();
        assert_eq!(output.result["outcome"], "success_secondary_caught_up");
        assert_eq!(output.result["reason_for_additional_sync"], "none");
        assert_eq!(output.job_count(), 0);
        assert_eq!(cluster.node(2).ledger.clock(WALLET).await.unwrap(), 12);

        let counts = primary.health.counts(&endpoint(2), WALLET).await.unwrap();
        assert_eq!(counts.successes, 1);
    }

    #[tokio::test]
    async fn test_secondary_ahead_merges_before_resync() {
        let cluster = TestCluster::new().await;
        cluster.add_user(1, WALLET, [1, 2, 3]).await;
        cluster.write_rows(1, WALLET, 5).await;
        cluster.copy_ledger(1, 2, WALLET, 5).await;
        cluster.write_rows(2, WALLET, 4).await;
        assert_eq!(cluster.node(2).ledger.clock(WALLET).await.unwrap(), 9);

        let primary = cluster.node(1);
        primary.peer_sp_ids.refresh(cluster.registry.as_ref()).await.unwrap();
        let snapshot = cluster.snapshot(1).await;

        let found = find_sync_requests(&primary, &snapshot).await.unwrap();
        let job = issued(&found)
            .into_iter()
            .find(|j| j.secondary_endpoint == endpoint(2))
            .cloned()
            .unwrap();
        assert_eq!(job.sync_mode, SyncMode::MergePrimaryAndSecondary);

        let output = issue_sync_request(&primary, job).await.unwrap();
        assert_eq!(output.result["outcome"], "success_secondary_caught_up");

        // The primary took the secondary's four unique rows, then the
        // secondary was rebuilt from the primary
        assert_eq!(primary.ledger.clock(WALLET).await.unwrap(), 9);
        let primary_rows = primary.ledger.row_uuids(WALLET).await.unwrap();
        let secondary_rows = cluster.node(2).ledger.row_uuids(WALLET).await.unwrap();
        assert_eq!(primary_rows, secondary_rows);
        assert_eq!(cluster.node(2).ledger.clock(WALLET).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_unhealthy_and_low_success_secondaries_are_skipped() {
        let cluster = TestCluster::new().await;
        cluster.add_user(1, WALLET, [1, 2, 3]).await;
        cluster.write_rows(1, WALLET, 3).await;

        let primary = cluster.node(1);
        primary.peer_sp_ids.refresh(cluster.registry.as_ref()).await.unwrap();
        for _ in 0..primary.config.sync.minimum_failed_sync_requests_before_reconfig {
            primary
                .health
                .record_failure(&endpoint(3), WALLET, SyncType::Recurring)
                .await
                .unwrap();
        }

        let mut snapshot = cluster.snapshot(1).await;
        snapshot.unhealthy_peers.insert(endpoint(2));
        let found = find_sync_requests(&primary, &snapshot).await.unwrap();
        assert!(issued(&found).is_empty());
        assert_eq!(found.result["skipped"], 2);
    }

    #[tokio::test]
    async fn test_duplicate_recurring_sync_is_not_requeued() {
        let cluster = TestCluster::new().await;
        cluster.add_user(1, WALLET, [1, 2, 3]).await;
        cluster.write_rows(1, WALLET, 3).await;

        let primary = cluster.node(1);
        primary.peer_sp_ids.refresh(cluster.registry.as_ref()).await.unwrap();
        let snapshot = cluster.snapshot(1).await;

        let first = find_sync_requests(&primary, &snapshot).await.unwrap();
        assert_eq!(issued(&first).len(), 2);
        let second = find_sync_requests(&primary, &snapshot).await.unwrap();
        assert!(issued(&second).is_empty());
        assert_eq!(second.result["duplicates"], 2);
    }

    #[tokio::test]
    async fn test_daily_failure_threshold_stops_syncs() {
        let cluster = TestCluster::with_config(|config| {
            config.sync.secondary_user_sync_daily_failure_count_threshold = 1;
        })
        .await;
        cluster.add_user(1, WALLET, [1, 2, 3]).await;
        let primary = cluster.node(1);
        primary
            .health
            .record_failure(&endpoint(2), WALLET, SyncType::Manual)
            .await
            .unwrap();

        let job = SyncJob::new(SyncType::Manual, SyncMode::SyncSecondaryFromPrimary, WALLET, endpoint(1), endpoint(2));
        let output = issue_sync_request(&primary, job).await.unwrap();
        let error = output.result["error"].as_str().unwrap();
        assert!(error.contains("SecondaryUserSyncDailyFailureCountThreshold"));
        assert_eq!(cluster.network.calls_to(&endpoint(2), "issue_sync").await, 0);
    }

    #[tokio::test]
    async fn test_stuck_secondary_gets_additional_sync() {
        let cluster = TestCluster::new().await;
        cluster.add_user(1, WALLET, [1, 2, 3]).await;
        cluster.write_rows(1, WALLET, 4).await;
        // The secondary is down: the sync never lands
        cluster.network.set_down(&endpoint(2), true).await;

        let primary = cluster.node(1);
        let job = SyncJob::new(SyncType::Manual, SyncMode::SyncSecondaryFromPrimary, WALLET, endpoint(1), endpoint(2));
        let output = issue_sync_request(&primary, job).await.unwrap();
        assert_eq!(output.result["reason_for_additional_sync"], "secondary_failed_to_progress");

        let retries = issued(&output);
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].attempt_number, 2);
        assert_eq!(retries[0].sync_type, SyncType::Manual);
        assert_eq!(primary.health.counts(&endpoint(2), WALLET).await.unwrap().failures, 1);

        // The ceiling stops the chain
        let last = issue_sync_request(&primary, retries[0].clone()).await.unwrap();
        assert_eq!(last.job_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_merge_queues_no_forward_sync() {
        let cluster = TestCluster::new().await;
        cluster.add_user(1, WALLET, [1, 2, 3]).await;
        cluster.write_rows(1, WALLET, 5).await;
        cluster.copy_ledger(1, 2, WALLET, 5).await;
        cluster.write_rows(2, WALLET, 3).await;

        let primary = cluster.node(1);
        let ttl = Duration::from_secs(60);
        assert!(crate::replication::WalletLock::acquire(primary.store.as_ref(), WALLET, "import", ttl)
            .await
            .unwrap());

        let job = SyncJob::new(
            SyncType::Recurring,
            SyncMode::MergePrimaryAndSecondary,
            WALLET,
            &endpoint(1),
            &endpoint(2),
        );
        let output = issue_sync_request(&primary, job).await.unwrap();
        assert!(output.result["error"].as_str().unwrap().contains("sync lock"));
        assert_eq!(output.result["reason_for_additional_sync"], "none");
        assert!(issued(&output).is_empty());

        // Nothing reached the secondary: its unique rows are intact
        assert_eq!(cluster.network.calls_to(&endpoint(2), "issue_sync").await, 0);
        assert_eq!(cluster.node(2).ledger.clock(WALLET).await.unwrap(), 8);
        assert_eq!(primary.ledger.clock(WALLET).await.unwrap(), 5);
    }

    #[test]
    fn test_follow_up_after_merge_keeps_merging_until_resync_lands() {
        let progress = |final_secondary_clock, secondary_result| SyncProgress {
            initial_secondary_clock: 0,
            final_secondary_clock,
            primary_clock: 10,
            secondary_result,
        };
        let merge = SyncMode::MergePrimaryAndSecondary;
        let forward = SyncMode::SyncSecondaryFromPrimary;

        assert_eq!(progress(0, None).follow_up_mode(merge), merge);
        assert_eq!(progress(4, Some(SyncResult::FailureForceResyncCheck)).follow_up_mode(merge), merge);
        assert_eq!(progress(4, Some(SyncResult::Success)).follow_up_mode(merge), forward);
        assert_eq!(progress(4, None).follow_up_mode(merge), forward);
        assert_eq!(progress(0, None).follow_up_mode(forward), forward);
    }
}
