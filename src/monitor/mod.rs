//! State Monitor
//!
//! Walks the users this node serves one page at a time, collects their
//! clocks on every replica and the health of the peers involved, and hands
//! the snapshot to the sync and reconfiguration finders.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::context::JobContext;
use crate::error::Result;
use crate::queue::{Job, JobOutput, JobPayload};
use crate::state::{NodeRole, NodeUser};
use crate::sync::{SyncOutcomeCounts, UserInfo};

/// Cursor of the monitor-state job chain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorStateInput {
    /// None starts from a random user id
    pub last_processed_user_id: Option<u64>,
}

/// Everything the finders need about one page of users
#[derive(Debug, Clone, Default)]
pub struct MonitorSnapshot {
    pub users: Vec<NodeUser>,
    pub unhealthy_peers: HashSet<String>,
    /// replica endpoint -> wallet -> user info on that replica
    pub clock_statuses: HashMap<String, HashMap<String, UserInfo>>,
    /// wallet -> secondary -> today's sync outcomes to that secondary
    pub success_rates: HashMap<String, HashMap<String, SyncOutcomeCounts>>,
}

impl MonitorSnapshot {
    pub fn user_info(&self, replica: &str, wallet: &str) -> Option<&UserInfo> {
        self.clock_statuses.get(replica).and_then(|m| m.get(wallet))
    }

    pub fn success_rate(&self, wallet: &str, secondary: &str) -> SyncOutcomeCounts {
        self.success_rates
            .get(wallet)
            .and_then(|m| m.get(secondary))
            .copied()
            .unwrap_or_default()
    }
}

/// Process one page of users and schedule the next page.
///
/// Any failure while collecting the page requeues the same cursor.
pub async fn monitor_state(ctx: &JobContext, input: MonitorStateInput) -> Result<JobOutput> {
    let cursor = match input.last_processed_user_id {
        Some(cursor) => cursor,
        None => random_start(ctx).await,
    };
    let interval = ctx.config.monitor_interval();

    let users = match ctx
        .discovery
        .node_users(ctx.self_endpoint(), cursor, ctx.config.monitor.users_per_page)
        .await
    {
        Ok(users) => users,
        Err(e) => {
            tracing::warn!("Failed to fetch users after {}: {}", cursor, e);
            return Ok(retry_at(cursor, interval, e));
        }
    };

    if ctx.peer_sp_ids.is_stale().await {
        if let Err(e) = ctx.peer_sp_ids.refresh(ctx.registry.as_ref()).await {
            tracing::warn!("Failed to refresh peer sp id map: {}", e);
        }
    }

    let snapshot = match build_snapshot(ctx, users).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!("Failed to collect state for users after {}: {}", cursor, e);
            return Ok(retry_at(cursor, interval, e));
        }
    };

    // An empty page means the end of the user list
    let next_cursor = snapshot.users.last().map(|u| u.user_id).unwrap_or(0);
    tracing::info!(
        "Monitored {} users after {} ({} unhealthy peers), next cursor {}",
        snapshot.users.len(),
        cursor,
        snapshot.unhealthy_peers.len(),
        next_cursor
    );

    let mut output = JobOutput::new(json!({
        "last_processed_user_id": cursor,
        "next_user_id": next_cursor,
        "users": snapshot.users.len(),
        "unhealthy_peers": snapshot.unhealthy_peers.iter().collect::<BTreeSet<_>>(),
    }));
    if !snapshot.users.is_empty() {
        let snapshot = Arc::new(snapshot);
        output.enqueue(Job::new(JobPayload::FindSyncRequests(Arc::clone(&snapshot))));
        output.enqueue(Job::new(JobPayload::FindReplicaSetUpdates(snapshot)));
    }
    output.enqueue(next_page(next_cursor, interval));
    Ok(output)
}

async fn random_start(ctx: &JobContext) -> u64 {
    match ctx.discovery.latest_user_id().await {
        Ok(latest) => rand::thread_rng().gen_range(0..=latest),
        Err(e) => {
            tracing::warn!("Failed to fetch latest user id, starting from 0: {}", e);
            0
        }
    }
}

fn next_page(cursor: u64, delay: std::time::Duration) -> Job {
    Job::new(JobPayload::MonitorState(MonitorStateInput {
        last_processed_user_id: Some(cursor),
    }))
    .delayed(delay)
}

fn retry_at(cursor: u64, delay: std::time::Duration, error: crate::Error) -> JobOutput {
    JobOutput::new(json!({
        "last_processed_user_id": cursor,
        "error": error.to_string(),
    }))
    .with_job(next_page(cursor, delay))
}

/// Collect peer health, clock statuses and sync success rates for `users`
pub async fn build_snapshot(ctx: &JobContext, users: Vec<NodeUser>) -> Result<MonitorSnapshot> {
    let self_endpoint = ctx.self_endpoint();

    let peers: BTreeSet<String> = users
        .iter()
        .flat_map(|u| [&u.primary, &u.secondary1, &u.secondary2])
        .filter(|e| !e.is_empty() && e.as_str() != self_endpoint)
        .cloned()
        .collect();

    let health: Vec<(String, Result<()>)> = stream::iter(peers)
        .map(|peer| {
            let client = Arc::clone(&ctx.peers);
            async move {
                let result = client.health_check(&peer).await;
                (peer, result)
            }
        })
        .buffer_unordered(ctx.config.monitor.health_check_concurrency.max(1))
        .collect()
        .await;
    let mut unhealthy_peers: HashSet<String> = health
        .into_iter()
        .filter_map(|(peer, result)| match result {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!("Peer {} failed its health check: {}", peer, e);
                Some(peer)
            }
        })
        .collect();

    let mut wallets_by_replica: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for user in &users {
        for endpoint in [&user.primary, &user.secondary1, &user.secondary2] {
            if !endpoint.is_empty() {
                wallets_by_replica
                    .entry(endpoint.as_str())
                    .or_default()
                    .push(user.wallet.clone());
            }
        }
    }

    let batch_size = ctx.config.monitor.batch_clock_status_batch_size.max(1);
    let mut clock_statuses: HashMap<String, HashMap<String, UserInfo>> = HashMap::new();
    for (replica, wallets) in wallets_by_replica {
        let statuses = if replica == self_endpoint {
            ctx.ledger.batch_clock_status(&wallets, true).await?
        } else if unhealthy_peers.contains(replica) {
            continue;
        } else {
            let mut statuses = Vec::with_capacity(wallets.len());
            let mut failed = false;
            for chunk in wallets.chunks(batch_size) {
                match ctx.peers.batch_clock_status(replica, chunk, true).await {
                    Ok(batch) => statuses.extend(batch),
                    Err(e) => {
                        tracing::warn!("Batch clock status from {} failed, marking unhealthy: {}", replica, e);
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                unhealthy_peers.insert(replica.to_string());
                continue;
            }
            statuses
        };

        clock_statuses.insert(
            replica.to_string(),
            statuses
                .into_iter()
                .map(|s| (s.wallet, UserInfo::new(s.clock, s.files_hash.as_deref())))
                .collect(),
        );
    }

    let mut success_rates: HashMap<String, HashMap<String, SyncOutcomeCounts>> = HashMap::new();
    for user in users.iter().filter(|u| u.role_of(self_endpoint) == NodeRole::Primary) {
        for secondary in [&user.secondary1, &user.secondary2] {
            if secondary.is_empty() {
                continue;
            }
            let counts = ctx.health.counts(secondary, &user.wallet).await?;
            success_rates
                .entry(user.wallet.clone())
                .or_default()
                .insert(secondary.clone(), counts);
        }
    }

    Ok(MonitorSnapshot {
        users,
        unhealthy_peers,
        clock_statuses,
        success_rates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueName;
    use crate::sync::SyncType;
    use crate::testkit::{endpoint, TestCluster};

    fn next_cursor(output: &JobOutput) -> Option<u64> {
        match &output.jobs(QueueName::MonitorState)[0].payload {
            JobPayload::MonitorState(input) => input.last_processed_user_id,
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cursor_advances_then_wraps() {
        let cluster = TestCluster::with_config(|config| config.monitor.users_per_page = 2).await;
        for (id, wallet) in [(3, "0xa"), (5, "0xb"), (9, "0xc")] {
            cluster.add_user(id, wallet, [1, 2, 3]).await;
        }
        let node = cluster.node(1);

        let first = monitor_state(&node, MonitorStateInput { last_processed_user_id: Some(0) })
            .await
            .unwrap();
        assert_eq!(next_cursor(&first), Some(5));
        assert_eq!(first.jobs(QueueName::FindSyncRequests).len(), 1);
        assert_eq!(first.jobs(QueueName::FindReplicaSetUpdates).len(), 1);
        assert!(first.jobs(QueueName::MonitorState)[0].delay.is_some());

        let second = monitor_state(&node, MonitorStateInput { last_processed_user_id: Some(5) })
            .await
            .unwrap();
        assert_eq!(next_cursor(&second), Some(9));

        let end = monitor_state(&node, MonitorStateInput { last_processed_user_id: Some(9) })
            .await
            .unwrap();
        assert_eq!(next_cursor(&end), Some(0));
        assert!(end.jobs(QueueName::FindSyncRequests).is_empty());
    }

    #[tokio::test]
    async fn test_random_start_is_within_user_ids() {
        let cluster = TestCluster::new().await;
        cluster.add_user(40, "0xa", [1, 2, 3]).await;
        let output = monitor_state(&cluster.node(1), MonitorStateInput::default())
            .await
            .unwrap();
        let start = output.result["last_processed_user_id"].as_u64().unwrap();
        assert!(start <= 40);
    }

    #[tokio::test]
    async fn test_discovery_failure_requeues_same_cursor() {
        let cluster = TestCluster::new().await;
        cluster.discovery.set_failing(true);
        let output = monitor_state(&cluster.node(1), MonitorStateInput { last_processed_user_id: Some(17) })
            .await
            .unwrap();
        assert_eq!(next_cursor(&output), Some(17));
        assert!(output.result["error"].is_string());
        assert_eq!(output.job_count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_collects_clocks_health_and_success_rates() {
        let cluster = TestCluster::new().await;
        let user = cluster.add_user(1, "0xa", [1, 2, 3]).await;
        cluster.write_rows(1, "0xa", 4).await;
        cluster.copy_ledger(1, 2, "0xa", 2).await;
        cluster.network.set_down(&endpoint(3), true).await;

        let node = cluster.node(1);
        node.health.record_success(&endpoint(2), "0xa", SyncType::Recurring).await.unwrap();

        let snapshot = build_snapshot(&node, vec![user]).await.unwrap();
        assert_eq!(snapshot.unhealthy_peers, HashSet::from([endpoint(3)]));
        assert_eq!(snapshot.user_info(&endpoint(1), "0xa").unwrap().clock, 4);
        assert_eq!(snapshot.user_info(&endpoint(2), "0xa").unwrap().clock, 2);
        assert!(snapshot.user_info(&endpoint(3), "0xa").is_none());
        assert_eq!(snapshot.success_rate("0xa", &endpoint(2)).successes, 1);
        assert_eq!(snapshot.success_rate("0xa", &endpoint(3)), SyncOutcomeCounts::default());
    }
}
