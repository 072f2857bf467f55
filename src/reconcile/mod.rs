//! Replica Set Reconciler
//!
//! Detects unhealthy members of the replica sets this node belongs to,
//! picks replacements, and commits new replica sets to the registry.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::ReconfigMode;
use crate::context::JobContext;
use crate::error::{Error, Result};
use crate::monitor::MonitorSnapshot;
use crate::queue::{Job, JobOutput, JobPayload};
use crate::state::{NodeRole, NodeUser, ReplicaSet, ReplicaSetSpIds};
use crate::sync::{SyncJob, SyncMode, SyncReqOutcome, SyncType};

/// A replica set flagged for replacement of its unhealthy members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateReplicaSetJob {
    pub wallet: String,
    pub user_id: u64,
    pub replica_set: ReplicaSet,
    /// Sp ids as observed; the commit is skipped if the registry moved on
    pub sp_ids: ReplicaSetSpIds,
    pub unhealthy_replicas: BTreeSet<String>,
    /// The user's clock on each replica that answered
    pub replica_clocks: HashMap<String, u64>,
}

/// Outcome of [`determine_new_replica_set`]
#[derive(Debug, Clone, PartialEq)]
pub struct ReconfigDecision {
    pub new_replica_set: Option<ReplicaSet>,
    pub reconfig_type: Option<ReconfigMode>,
    /// Whether the configured reconfig mode allows this change
    pub issue_reconfig: bool,
}

impl ReconfigDecision {
    fn none() -> Self {
        Self {
            new_replica_set: None,
            reconfig_type: None,
            issue_reconfig: false,
        }
    }
}

fn reconfig_enabled(configured: ReconfigMode, needed: ReconfigMode) -> bool {
    configured != ReconfigMode::Disabled && needed <= configured
}

fn primary_unhealthy_key(primary: &str) -> String {
    format!("primary_unhealthy_since:{}", primary)
}

/// Flag replica sets with unhealthy members.
///
/// As primary, a secondary counts as unhealthy when it failed its health
/// check, its sp id no longer matches, too many of its syncs failed today or
/// one error kind passed its ceiling. As secondary, the primary counts as
/// unhealthy once it has failed health checks for the whole grace period.
pub async fn find_replica_set_updates(ctx: &JobContext, snapshot: &MonitorSnapshot) -> Result<JobOutput> {
    let self_endpoint = ctx.self_endpoint();
    let mut output = JobOutput::default();
    let mut flagged = Vec::new();

    for user in &snapshot.users {
        let mut unhealthy = BTreeSet::new();
        match user.role_of(self_endpoint) {
            NodeRole::Primary => {
                for (secondary, sp_id) in user.secondaries_with_sp_ids() {
                    if let Some(reason) = secondary_unhealthy_reason(ctx, snapshot, user, secondary, sp_id).await? {
                        tracing::info!("Secondary {} of {} is unhealthy: {}", secondary, user.wallet, reason);
                        unhealthy.insert(secondary.to_string());
                    }
                }
            }
            NodeRole::Secondary => {
                if primary_is_unhealthy(ctx, snapshot, user).await? {
                    tracing::info!("Primary {} of {} is unhealthy", user.primary, user.wallet);
                    unhealthy.insert(user.primary.clone());
                }
            }
            NodeRole::None => continue,
        }

        if unhealthy.is_empty() {
            continue;
        }

        let replica_set = user.replica_set();
        let replica_clocks = replica_set
            .endpoints()
            .iter()
            .filter_map(|e| snapshot.user_info(e, &user.wallet).map(|info| (e.to_string(), info.clock)))
            .collect();
        flagged.push(json!({ "wallet": user.wallet, "unhealthy_replicas": unhealthy }));
        output.enqueue(Job::new(JobPayload::UpdateReplicaSet(UpdateReplicaSetJob {
            wallet: user.wallet.clone(),
            user_id: user.user_id,
            replica_set,
            sp_ids: user.sp_ids(),
            unhealthy_replicas: unhealthy,
            replica_clocks,
        })));
    }

    tracing::info!(
        "Found {} replica sets to update across {} users",
        flagged.len(),
        snapshot.users.len()
    );
    output.result = json!({ "updates": flagged });
    Ok(output)
}

async fn secondary_unhealthy_reason(
    ctx: &JobContext,
    snapshot: &MonitorSnapshot,
    user: &NodeUser,
    secondary: &str,
    sp_id: u64,
) -> Result<Option<String>> {
    if secondary.is_empty() {
        return Ok(None);
    }
    if snapshot.unhealthy_peers.contains(secondary) {
        return Ok(Some("failed health check".into()));
    }

    let registered = ctx.peer_sp_ids.sp_id_for(secondary).await;
    if registered != Some(sp_id) {
        return Ok(Some(format!("sp id {} registered as {:?}", sp_id, registered)));
    }

    let sync_config = &ctx.config.sync;
    let counts = snapshot.success_rate(&user.wallet, secondary);
    if counts.below_floor(
        sync_config.minimum_failed_sync_requests_before_reconfig,
        sync_config.minimum_secondary_user_sync_success_percent,
    ) {
        return Ok(Some(format!(
            "sync success rate {:.1}% with {} failures",
            counts.success_percent(),
            counts.failures
        )));
    }

    if let Some(kind) = ctx.health.exceeded_max_errors(secondary, &user.wallet).await? {
        return Ok(Some(format!("too many {} errors today", kind)));
    }
    Ok(None)
}

/// Track how long the primary has been failing and report it past the grace period
async fn primary_is_unhealthy(ctx: &JobContext, snapshot: &MonitorSnapshot, user: &NodeUser) -> Result<bool> {
    let key = primary_unhealthy_key(&user.primary);
    if !snapshot.unhealthy_peers.contains(&user.primary) {
        ctx.store.del(&key).await?;
        return Ok(false);
    }

    let grace = ctx.config.primary_unhealthy_grace_period();
    let now_ms = Utc::now().timestamp_millis();
    let ttl = (grace * 2).max(Duration::from_secs(60));
    ctx.store.set_nx_ex(&key, &now_ms.to_string(), ttl).await?;
    let since_ms = ctx
        .store
        .get(&key)
        .await?
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(now_ms);

    let unhealthy_for = Duration::from_millis((now_ms - since_ms).max(0) as u64);
    if unhealthy_for < grace {
        tracing::debug!(
            "Primary {} unhealthy for {:?}, within grace period of {:?}",
            user.primary, unhealthy_for, grace
        );
        return Ok(false);
    }
    Ok(true)
}

/// Pick a new replica set for a flagged user.
///
/// One or two unhealthy members are replaced by fresh nodes. With all three
/// unhealthy there is nothing left to sync from, so no replacement is
/// chosen and no candidate node is contacted.
pub async fn determine_new_replica_set(ctx: &JobContext, job: &UpdateReplicaSetJob) -> Result<ReconfigDecision> {
    let current = &job.replica_set;
    let unhealthy: BTreeSet<&str> = current
        .endpoints()
        .into_iter()
        .filter(|e| job.unhealthy_replicas.contains(*e))
        .collect();

    match unhealthy.len() {
        0 => return Ok(ReconfigDecision::none()),
        3 => {
            tracing::warn!("Every replica of {} is unhealthy, not reconfiguring", job.wallet);
            return Ok(ReconfigDecision::none());
        }
        _ => {}
    }

    let fresh = select_random_replica_set_nodes(ctx, &job.wallet, current, &job.unhealthy_replicas, unhealthy.len()).await?;
    let (new_replica_set, reconfig_type) = if unhealthy.len() == 1 {
        replace_one(current, &job.unhealthy_replicas, &job.replica_clocks, &fresh[0])
    } else {
        replace_two(current, &job.unhealthy_replicas, &fresh[0], &fresh[1])
    };

    Ok(ReconfigDecision {
        issue_reconfig: reconfig_enabled(ctx.config.reconfig.mode, reconfig_type),
        new_replica_set: Some(new_replica_set),
        reconfig_type: Some(reconfig_type),
    })
}

fn replace_one(
    current: &ReplicaSet,
    unhealthy: &BTreeSet<String>,
    clocks: &HashMap<String, u64>,
    fresh: &str,
) -> (ReplicaSet, ReconfigMode) {
    if unhealthy.contains(&current.primary) {
        let clock = |e: &str| clocks.get(e).copied().unwrap_or(0);
        let (new_primary, other) = if clock(&current.secondary1) >= clock(&current.secondary2) {
            (&current.secondary1, &current.secondary2)
        } else {
            (&current.secondary2, &current.secondary1)
        };
        return (
            ReplicaSet::new(new_primary.as_str(), other.as_str(), fresh),
            ReconfigMode::PrimaryAndOrSecondaries,
        );
    }

    let healthy_secondary = if unhealthy.contains(&current.secondary1) {
        &current.secondary2
    } else {
        &current.secondary1
    };
    (
        ReplicaSet::new(current.primary.as_str(), healthy_secondary.as_str(), fresh),
        ReconfigMode::OneSecondary,
    )
}

fn replace_two(current: &ReplicaSet, unhealthy: &BTreeSet<String>, first: &str, second: &str) -> (ReplicaSet, ReconfigMode) {
    if unhealthy.contains(&current.primary) {
        let healthy_secondary = if unhealthy.contains(&current.secondary1) {
            &current.secondary2
        } else {
            &current.secondary1
        };
        return (
            ReplicaSet::new(healthy_secondary.as_str(), first, second),
            ReconfigMode::PrimaryAndOrSecondaries,
        );
    }
    (
        ReplicaSet::new(current.primary.as_str(), first, second),
        ReconfigMode::MultipleSecondaries,
    )
}

/// Choose `count` nodes outside the current replica set that answer a clock check for `wallet`.
///
/// Candidates come from the registered peers, filtered by the whitelist if
/// one is configured, and each is checked at most once. A candidate already
/// holding data for the wallet is logged and still taken.
pub async fn select_random_replica_set_nodes(
    ctx: &JobContext,
    wallet: &str,
    current: &ReplicaSet,
    unhealthy: &BTreeSet<String>,
    count: usize,
) -> Result<Vec<String>> {
    let known = ctx.peer_sp_ids.get_or_refresh(ctx.registry.as_ref()).await?;
    let whitelist = &ctx.config.reconfig.node_whitelist;
    let mut pool: Vec<String> = known
        .keys()
        .filter(|e| !current.contains(e) && !unhealthy.contains(*e))
        .filter(|e| whitelist.is_empty() || whitelist.contains(*e))
        .cloned()
        .collect();
    pool.sort();
    pool.shuffle(&mut rand::thread_rng());

    let max_attempts = ctx.config.reconfig.max_select_new_replica_set_attempts;
    let mut selected = Vec::with_capacity(count);
    let mut attempts = 0;
    for candidate in pool {
        if selected.len() >= count || attempts >= max_attempts {
            break;
        }
        attempts += 1;
        match ctx.peers.clock_status(&candidate, wallet).await {
            Ok(0) => selected.push(candidate),
            Ok(clock) => {
                tracing::warn!("Candidate {} already holds {} at clock {}, selecting anyway", candidate, wallet, clock);
                selected.push(candidate);
            }
            Err(e) => tracing::warn!("Candidate {} failed its clock check: {}", candidate, e),
        }
    }

    if selected.len() < count {
        return Err(Error::InsufficientHealthyNodes(format!(
            "{}: found {} of {} replacement nodes after {} attempts",
            wallet,
            selected.len(),
            count,
            attempts
        )));
    }
    Ok(selected)
}

/// Commit a new replica set and queue syncs to its secondaries
pub async fn update_replica_set(ctx: &JobContext, job: UpdateReplicaSetJob) -> Result<JobOutput> {
    let decision = determine_new_replica_set(ctx, &job).await?;
    let old = &job.replica_set;
    let Some(new) = decision.new_replica_set else {
        return Ok(JobOutput::new(json!({
            "wallet": job.wallet,
            "issued_reconfig": false,
            "unhealthy_replicas": job.unhealthy_replicas,
        })));
    };
    let reconfig_type = decision.reconfig_type.map(|t| t.to_string());

    if !decision.issue_reconfig {
        tracing::info!(
            "Reconfig [DISABLED] for {}: [{}] -> [{}] ({:?})",
            job.wallet,
            old.endpoints().join(","),
            new.endpoints().join(","),
            reconfig_type
        );
        return Ok(JobOutput::new(json!({
            "wallet": job.wallet,
            "issued_reconfig": false,
            "reconfig_type": reconfig_type,
            "new_replica_set": new,
        })));
    }

    let known = ctx.peer_sp_ids.snapshot().await;
    let sp_id = |endpoint: &str| {
        known.get(endpoint).copied().ok_or_else(|| {
            Error::NotFound(format!("sp id of {} in new replica set of {}", endpoint, job.wallet))
        })
    };
    let new_sp_ids = ReplicaSetSpIds {
        primary: sp_id(&new.primary)?,
        secondary1: sp_id(&new.secondary1)?,
        secondary2: sp_id(&new.secondary2)?,
    };

    let registered = ctx.registry.user_replica_set(job.user_id).await?;
    if registered != job.sp_ids {
        tracing::info!(
            "Replica set of {} changed since it was observed ({:?} -> {:?}), skipping reconfig",
            job.wallet, job.sp_ids, registered
        );
        return Ok(JobOutput::new(json!({
            "wallet": job.wallet,
            "issued_reconfig": false,
            "reason": "replica set changed since it was observed",
        })));
    }

    ctx.registry
        .update_replica_set(job.user_id, new_sp_ids, job.sp_ids)
        .await?;
    tracing::info!(
        "Reconfig [SUCCESS] for {}: [{}] -> [{}] ({:?})",
        job.wallet,
        old.endpoints().join(","),
        new.endpoints().join(","),
        reconfig_type
    );

    let mut output = JobOutput::new(json!({
        "wallet": job.wallet,
        "issued_reconfig": true,
        "reconfig_type": reconfig_type,
        "new_replica_set": new,
    }));
    for secondary in new.secondaries() {
        let sync = SyncJob::new(
            SyncType::Recurring,
            SyncMode::SyncSecondaryFromPrimary,
            &job.wallet,
            &new.primary,
            secondary,
        );
        match ctx.dedup.get_new_or_existing_sync_req(sync).await? {
            SyncReqOutcome::New(sync) => output.enqueue(Job::new(JobPayload::IssueSync(sync))),
            SyncReqOutcome::Duplicate { job_id } => {
                tracing::warn!("Reconfig of {} found a queued sync to {} ({})", job.wallet, secondary, job_id)
            }
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueName;
    use crate::testkit::{endpoint, TestCluster};

    const WALLET: &str = "0xabc";

    fn set(p: usize, s1: usize, s2: usize) -> ReplicaSet {
        ReplicaSet::new(endpoint(p), endpoint(s1), endpoint(s2))
    }

    fn unhealthy(nodes: &[usize]) -> BTreeSet<String> {
        nodes.iter().map(|n| endpoint(*n)).collect()
    }

    fn job(nodes: [usize; 3], bad: &[usize]) -> UpdateReplicaSetJob {
        UpdateReplicaSetJob {
            wallet: WALLET.into(),
            user_id: 1,
            replica_set: set(nodes[0], nodes[1], nodes[2]),
            sp_ids: ReplicaSetSpIds {
                primary: nodes[0] as u64,
                secondary1: nodes[1] as u64,
                secondary2: nodes[2] as u64,
            },
            unhealthy_replicas: unhealthy(bad),
            replica_clocks: HashMap::new(),
        }
    }

    #[test]
    fn test_replace_one_secondary() {
        let (new, kind) = replace_one(&set(1, 2, 3), &unhealthy(&[2]), &HashMap::new(), &endpoint(4));
        assert_eq!(new, set(1, 3, 4));
        assert_eq!(kind, ReconfigMode::OneSecondary);
    }

    #[test]
    fn test_unhealthy_primary_promotes_higher_clock_secondary() {
        let clocks = HashMap::from([(endpoint(2), 3), (endpoint(3), 7)]);
        let (new, kind) = replace_one(&set(1, 2, 3), &unhealthy(&[1]), &clocks, &endpoint(4));
        assert_eq!(new, set(3, 2, 4));
        assert_eq!(kind, ReconfigMode::PrimaryAndOrSecondaries);
    }

    #[test]
    fn test_replace_two() {
        let (new, kind) = replace_two(&set(1, 2, 3), &unhealthy(&[2, 3]), &endpoint(4), &endpoint(5));
        assert_eq!(new, set(1, 4, 5));
        assert_eq!(kind, ReconfigMode::MultipleSecondaries);

        let (new, kind) = replace_two(&set(1, 2, 3), &unhealthy(&[1, 3]), &endpoint(4), &endpoint(5));
        assert_eq!(new, set(2, 4, 5));
        assert_eq!(kind, ReconfigMode::PrimaryAndOrSecondaries);
    }

    #[test]
    fn test_reconfig_mode_ladder() {
        assert!(!reconfig_enabled(ReconfigMode::Disabled, ReconfigMode::OneSecondary));
        assert!(reconfig_enabled(ReconfigMode::OneSecondary, ReconfigMode::OneSecondary));
        assert!(!reconfig_enabled(ReconfigMode::OneSecondary, ReconfigMode::MultipleSecondaries));
        assert!(reconfig_enabled(ReconfigMode::EntireReplicaSet, ReconfigMode::PrimaryAndOrSecondaries));
    }

    #[tokio::test]
    async fn test_entire_replica_set_unhealthy_is_refused_without_probing() {
        let cluster = TestCluster::with_nodes(5, |_| {}).await;
        let node = cluster.node(1);

        let decision = determine_new_replica_set(&node, &job([1, 2, 3], &[1, 2, 3])).await.unwrap();
        assert_eq!(decision, ReconfigDecision::none());
        for n in 1..=5 {
            assert_eq!(cluster.network.calls_to(&endpoint(n), "clock_status").await, 0);
        }
    }

    #[tokio::test]
    async fn test_unreachable_candidates_are_skipped() {
        let cluster = TestCluster::with_nodes(5, |_| {}).await;
        cluster.write_rows(4, WALLET, 2).await;
        cluster.network.set_down(&endpoint(5), true).await;
        let node = cluster.node(1);

        // cn4 already holds data but still qualifies
        for _ in 0..5 {
            let fresh = select_random_replica_set_nodes(&node, WALLET, &set(1, 2, 3), &unhealthy(&[3]), 1)
                .await
                .unwrap();
            assert_eq!(fresh, vec![endpoint(4)]);
        }

        let err = select_random_replica_set_nodes(&node, WALLET, &set(1, 2, 3), &unhealthy(&[2, 3]), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientHealthyNodes(_)));
    }

    #[tokio::test]
    async fn test_whitelist_limits_candidates() {
        let cluster = TestCluster::with_nodes(5, |config| {
            config.reconfig.node_whitelist = vec![endpoint(4)];
        })
        .await;
        let node = cluster.node(1);
        let fresh = select_random_replica_set_nodes(&node, WALLET, &set(1, 2, 3), &unhealthy(&[3]), 1)
            .await
            .unwrap();
        assert_eq!(fresh, vec![endpoint(4)]);
    }

    #[tokio::test]
    async fn test_update_commits_and_queues_syncs() {
        let cluster = TestCluster::with_nodes(4, |_| {}).await;
        cluster.add_user(1, WALLET, [1, 2, 3]).await;
        let node = cluster.node(1);

        let output = update_replica_set(&node, job([1, 2, 3], &[3])).await.unwrap();
        assert_eq!(output.result["issued_reconfig"], true);
        assert_eq!(output.result["reconfig_type"], "one_secondary");

        let registered = cluster.registry.replica_set_of(WALLET).await.unwrap();
        assert_eq!(registered.replica_set, set(1, 2, 4));
        assert_eq!(cluster.registry.update_count().await, 1);

        let syncs: Vec<_> = output
            .jobs(QueueName::RecurringSync)
            .iter()
            .filter_map(|j| match &j.payload {
                JobPayload::IssueSync(sync) => Some((sync.primary_endpoint.clone(), sync.secondary_endpoint.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(syncs, vec![(endpoint(1), endpoint(2)), (endpoint(1), endpoint(4))]);
    }

    #[tokio::test]
    async fn test_replacing_two_secondaries_needs_two_fresh_nodes() {
        let cluster = TestCluster::with_nodes(4, |_| {}).await;
        cluster.add_user(1, WALLET, [1, 2, 3]).await;
        let output = update_replica_set(&cluster.node(1), job([1, 2, 3], &[2, 3])).await;
        assert!(matches!(output, Err(Error::InsufficientHealthyNodes(_))));
    }

    #[tokio::test]
    async fn test_reconfig_beyond_mode_only_logs() {
        let cluster = TestCluster::with_nodes(5, |config| {
            config.reconfig.mode = ReconfigMode::OneSecondary;
        })
        .await;
        cluster.add_user(1, WALLET, [1, 2, 3]).await;
        let output = update_replica_set(&cluster.node(1), job([1, 2, 3], &[2, 3])).await.unwrap();
        assert_eq!(output.result["issued_reconfig"], false);
        assert_eq!(output.result["reconfig_type"], "multiple_secondaries");
        assert_eq!(output.job_count(), 0);
        assert_eq!(cluster.registry.update_count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_observation_is_not_committed() {
        let cluster = TestCluster::with_nodes(5, |_| {}).await;
        // The registry moved the user to cn5 after the monitor looked
        cluster.add_user(1, WALLET, [1, 2, 5]).await;
        let output = update_replica_set(&cluster.node(1), job([1, 2, 3], &[3])).await.unwrap();
        assert_eq!(output.result["issued_reconfig"], false);
        assert_eq!(output.job_count(), 0);
        assert_eq!(cluster.registry.update_count().await, 0);
    }

    #[tokio::test]
    async fn test_find_updates_as_primary_and_secondary() {
        let cluster = TestCluster::new().await;
        let user = cluster.add_user(1, WALLET, [1, 2, 3]).await;
        cluster.network.set_down(&endpoint(3), true).await;

        let primary = cluster.node(1);
        primary.peer_sp_ids.refresh(cluster.registry.as_ref()).await.unwrap();
        let snapshot = crate::monitor::build_snapshot(&primary, vec![user.clone()]).await.unwrap();
        let output = find_replica_set_updates(&primary, &snapshot).await.unwrap();
        let jobs = output.jobs(QueueName::UpdateReplicaSet);
        assert_eq!(jobs.len(), 1);
        match &jobs[0].payload {
            JobPayload::UpdateReplicaSet(update) => assert_eq!(update.unhealthy_replicas, unhealthy(&[3])),
            other => panic!("unexpected payload {:?}", other),
        }

        // A secondary waits out the grace period before flagging the primary
        cluster.network.set_down(&endpoint(3), false).await;
        cluster.network.set_down(&endpoint(1), true).await;
        let secondary = cluster.node(2);
        secondary.peer_sp_ids.refresh(cluster.registry.as_ref()).await.unwrap();
        let snapshot = crate::monitor::build_snapshot(&secondary, vec![user]).await.unwrap();
        let output = find_replica_set_updates(&secondary, &snapshot).await.unwrap();
        assert_eq!(output.job_count(), 0);
    }

    #[tokio::test]
    async fn test_primary_flagged_after_grace_period() {
        let cluster = TestCluster::with_config(|config| {
            config.reconfig.primary_unhealthy_grace_period_ms = 0;
        })
        .await;
        let user = cluster.add_user(1, WALLET, [1, 2, 3]).await;
        cluster.network.set_down(&endpoint(1), true).await;

        let secondary = cluster.node(2);
        secondary.peer_sp_ids.refresh(cluster.registry.as_ref()).await.unwrap();
        let snapshot = crate::monitor::build_snapshot(&secondary, vec![user]).await.unwrap();
        let output = find_replica_set_updates(&secondary, &snapshot).await.unwrap();
        assert_eq!(output.jobs(QueueName::UpdateReplicaSet).len(), 1);
    }
}
