//! Job Queue Module
//!
//! Named in-process queues with per-queue workers. Every job is processed by
//! a stateless function taking the shared [`JobContext`](crate::context::JobContext)
//! and returns a result plus the jobs to enqueue next.

mod pipeline;
mod processors;

pub use pipeline::{JobPipeline, JobRecord, QueueStatus};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{QueueSettings, QueuesConfig};
use crate::monitor::{MonitorSnapshot, MonitorStateInput};
use crate::reconcile::UpdateReplicaSetJob;
use crate::replication::SecondarySyncParams;
use crate::sync::{SyncJob, SyncType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    MonitorState,
    FindSyncRequests,
    FindReplicaSetUpdates,
    ManualSync,
    RecurringSync,
    UpdateReplicaSet,
    FetchPeerSpIdMap,
    SecondarySync,
}

impl QueueName {
    pub const ALL: [QueueName; 8] = [
        QueueName::MonitorState,
        QueueName::FindSyncRequests,
        QueueName::FindReplicaSetUpdates,
        QueueName::ManualSync,
        QueueName::RecurringSync,
        QueueName::UpdateReplicaSet,
        QueueName::FetchPeerSpIdMap,
        QueueName::SecondarySync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::MonitorState => "monitor-state",
            QueueName::FindSyncRequests => "find-sync-requests",
            QueueName::FindReplicaSetUpdates => "find-replica-set-updates",
            QueueName::ManualSync => "manual-sync",
            QueueName::RecurringSync => "recurring-sync",
            QueueName::UpdateReplicaSet => "update-replica-set",
            QueueName::FetchPeerSpIdMap => "fetch-peer-sp-id-map",
            QueueName::SecondarySync => "secondary-sync",
        }
    }

    /// Queue that runs syncs of the given type
    pub fn for_sync_type(sync_type: SyncType) -> Self {
        match sync_type {
            SyncType::Manual => QueueName::ManualSync,
            SyncType::Recurring => QueueName::RecurringSync,
        }
    }

    pub fn settings(&self, config: &QueuesConfig) -> QueueSettings {
        match self {
            QueueName::MonitorState => config.monitor_state,
            QueueName::FindSyncRequests => config.find_sync_requests,
            QueueName::FindReplicaSetUpdates => config.find_replica_set_updates,
            QueueName::ManualSync => config.manual_sync,
            QueueName::RecurringSync => config.recurring_sync,
            QueueName::UpdateReplicaSet => config.update_replica_set,
            QueueName::FetchPeerSpIdMap => config.fetch_peer_sp_id_map,
            QueueName::SecondarySync => config.secondary_sync,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input of one job; the variant decides the queue
#[derive(Debug, Clone)]
pub enum JobPayload {
    MonitorState(MonitorStateInput),
    FindSyncRequests(Arc<MonitorSnapshot>),
    FindReplicaSetUpdates(Arc<MonitorSnapshot>),
    IssueSync(SyncJob),
    UpdateReplicaSet(UpdateReplicaSetJob),
    FetchPeerSpIdMap,
    SecondarySync(SecondarySyncParams),
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::MonitorState(_) => QueueName::MonitorState,
            JobPayload::FindSyncRequests(_) => QueueName::FindSyncRequests,
            JobPayload::FindReplicaSetUpdates(_) => QueueName::FindReplicaSetUpdates,
            JobPayload::IssueSync(job) => QueueName::for_sync_type(job.sync_type),
            JobPayload::UpdateReplicaSet(_) => QueueName::UpdateReplicaSet,
            JobPayload::FetchPeerSpIdMap => QueueName::FetchPeerSpIdMap,
            JobPayload::SecondarySync(_) => QueueName::SecondarySync,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub payload: JobPayload,
    /// Wait this long before the job becomes visible to workers
    pub delay: Option<Duration>,
    /// Jump ahead of waiting jobs
    pub lifo: bool,
}

impl Job {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            delay: None,
            lifo: false,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn lifo(mut self) -> Self {
        self.lifo = true;
        self
    }

    pub fn queue(&self) -> QueueName {
        self.payload.queue()
    }
}

/// What a processor hands back to the pipeline
#[derive(Debug, Default)]
pub struct JobOutput {
    pub result: serde_json::Value,
    pub jobs_to_enqueue: BTreeMap<QueueName, Vec<Job>>,
}

impl JobOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            jobs_to_enqueue: BTreeMap::new(),
        }
    }

    pub fn enqueue(&mut self, job: Job) {
        self.jobs_to_enqueue.entry(job.queue()).or_default().push(job);
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.enqueue(job);
        self
    }

    /// Jobs bound for one queue
    pub fn jobs(&self, queue: QueueName) -> &[Job] {
        self.jobs_to_enqueue
            .get(&queue)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn job_count(&self) -> usize {
        self.jobs_to_enqueue.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncMode;

    #[test]
    fn test_queue_names() {
        assert_eq!(QueueName::FetchPeerSpIdMap.as_str(), "fetch-peer-sp-id-map");
        assert_eq!(
            serde_json::to_value(QueueName::FindReplicaSetUpdates).unwrap(),
            "find-replica-set-updates"
        );
    }

    #[test]
    fn test_output_groups_jobs_by_queue() {
        let recurring = SyncJob::new(SyncType::Recurring, SyncMode::SyncSecondaryFromPrimary, "0xabc", "a", "b");
        let manual = SyncJob::new(SyncType::Manual, SyncMode::SyncSecondaryFromPrimary, "0xabc", "a", "c");

        let output = JobOutput::default()
            .with_job(Job::new(JobPayload::IssueSync(recurring)))
            .with_job(Job::new(JobPayload::IssueSync(manual)))
            .with_job(Job::new(JobPayload::FetchPeerSpIdMap).delayed(Duration::from_secs(1)));

        assert_eq!(output.job_count(), 3);
        assert_eq!(output.jobs(QueueName::RecurringSync).len(), 1);
        assert_eq!(output.jobs(QueueName::ManualSync).len(), 1);
        assert_eq!(output.jobs(QueueName::FetchPeerSpIdMap)[0].delay, Some(Duration::from_secs(1)));
        assert!(output.jobs(QueueName::UpdateReplicaSet).is_empty());
    }
}
