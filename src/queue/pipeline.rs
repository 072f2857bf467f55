//! Job Pipeline
//!
//! One in-memory queue per [`QueueName`] drained by a fixed number of worker
//! tasks. Processor errors and panics are converted into `{ "error": .. }`
//! results; a finished job's follow-up jobs are enqueued on completion.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{processors, Job, JobPayload, QueueName};
use crate::config::QueueSettings;
use crate::context::JobContext;
use crate::monitor::MonitorStateInput;

/// A finished job, kept in the queue's history
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub queue: QueueName,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: bool,
    pub result: serde_json::Value,
}

/// Point-in-time view of one queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub name: QueueName,
    pub concurrency: usize,
    pub waiting: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub history: Vec<JobRecord>,
}

struct QueueState {
    name: QueueName,
    settings: QueueSettings,
    waiting: Mutex<VecDeque<Job>>,
    notify: Notify,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    history: Mutex<VecDeque<JobRecord>>,
}

impl QueueState {
    fn new(name: QueueName, settings: QueueSettings) -> Self {
        Self {
            name,
            settings,
            waiting: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Make a job visible to workers, handing it back if the queue is at its ceiling
    async fn push(&self, job: Job) -> std::result::Result<(), Job> {
        {
            let mut waiting = self.waiting.lock().await;
            if waiting.len() >= self.settings.max_waiting {
                return Err(job);
            }
            if job.lifo {
                waiting.push_front(job);
            } else {
                waiting.push_back(job);
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn next(&self) -> Job {
        loop {
            if let Some(job) = self.waiting.lock().await.pop_front() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    async fn record(&self, record: JobRecord) {
        if record.succeeded {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut history = self.history.lock().await;
        history.push_back(record);
        while history.len() > self.settings.retained_history {
            history.pop_front();
        }
    }
}

pub struct JobPipeline {
    ctx: Arc<JobContext>,
    queues: HashMap<QueueName, Arc<QueueState>>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobPipeline {
    pub fn new(ctx: Arc<JobContext>) -> Arc<Self> {
        let queues = QueueName::ALL
            .into_iter()
            .map(|name| {
                let settings = name.settings(&ctx.config.queues);
                (name, Arc::new(QueueState::new(name, settings)))
            })
            .collect();

        Arc::new(Self {
            ctx,
            queues,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &Arc<JobContext> {
        &self.ctx
    }

    /// Spawn workers and seed the self-rescheduling jobs
    pub async fn start(self: &Arc<Self>) {
        self.start_workers().await;
        self.enqueue(Job::new(JobPayload::MonitorState(MonitorStateInput::default())))
            .await;
        self.enqueue(Job::new(JobPayload::FetchPeerSpIdMap)).await;
        tracing::info!("Job pipeline started with {} queues", self.queues.len());
    }

    pub async fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        for name in QueueName::ALL {
            let queue = Arc::clone(&self.queues[&name]);
            for _ in 0..queue.settings.concurrency.max(1) {
                let pipeline = Arc::clone(self);
                let queue = Arc::clone(&queue);
                workers.push(tokio::spawn(async move { pipeline.run_worker(queue).await }));
            }
        }
    }

    /// Stop all workers. Running jobs are dropped at their next await point.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Worker task failed: {}", e);
            }
        }
        tracing::info!("Job pipeline stopped");
    }

    /// Enqueue a job on the queue its payload belongs to.
    ///
    /// Returns false if the queue is full; the job is then dropped.
    pub async fn enqueue(&self, job: Job) -> bool {
        let queue = Arc::clone(&self.queues[&job.queue()]);

        if let Some(delay) = job.delay {
            let cancel = self.cancel.clone();
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        if let Err(job) = queue.push(job).await {
                            reject(&ctx, queue.name, job).await;
                        }
                    }
                }
            });
            return true;
        }

        match queue.push(job).await {
            Ok(()) => true,
            Err(job) => {
                reject(&self.ctx, queue.name, job).await;
                false
            }
        }
    }

    async fn run_worker(self: Arc<Self>, queue: Arc<QueueState>) {
        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = queue.next() => job,
            };
            self.run_job(&queue, job).await;
        }
    }

    async fn run_job(&self, queue: &QueueState, job: Job) {
        let started_at = Utc::now();
        let id = job.id;
        queue.active.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Job {} started on {}", id, queue.name);

        let outcome = AssertUnwindSafe(processors::process(&self.ctx, job.payload))
            .catch_unwind()
            .await;
        queue.active.fetch_sub(1, Ordering::Relaxed);

        let (succeeded, output) = match outcome {
            Ok(Ok(output)) => (true, output),
            Ok(Err(e)) => {
                tracing::error!("Job {} on {} failed: {}", id, queue.name, e);
                (false, super::JobOutput::new(json!({ "error": e.to_string() })))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("Job {} on {} panicked: {}", id, queue.name, message);
                (false, super::JobOutput::new(json!({ "error": format!("job panicked: {}", message) })))
            }
        };

        queue
            .record(JobRecord {
                id: id.clone(),
                queue: queue.name,
                started_at,
                finished_at: Utc::now(),
                succeeded,
                result: output.result,
            })
            .await;

        for job in output.jobs_to_enqueue.into_values().flatten() {
            self.enqueue(job).await;
        }
        tracing::debug!("Job {} finished on {}", id, queue.name);
    }

    pub async fn status(&self) -> Vec<QueueStatus> {
        let mut statuses = Vec::with_capacity(self.queues.len());
        for name in QueueName::ALL {
            let queue = &self.queues[&name];
            statuses.push(QueueStatus {
                name,
                concurrency: queue.settings.concurrency,
                waiting: queue.waiting.lock().await.len(),
                active: queue.active.load(Ordering::Relaxed),
                completed: queue.completed.load(Ordering::Relaxed),
                failed: queue.failed.load(Ordering::Relaxed),
                history: queue.history.lock().await.iter().cloned().collect(),
            });
        }
        statuses
    }

    /// Ids of the jobs waiting on a queue, next job first
    pub async fn waiting_ids(&self, name: QueueName) -> Vec<String> {
        self.queues[&name]
            .waiting
            .lock()
            .await
            .iter()
            .map(|job| job.id.clone())
            .collect()
    }
}

/// Drop a job the queue had no room for
async fn reject(ctx: &JobContext, queue: QueueName, job: Job) {
    tracing::warn!("Queue {} is full, skipping job {}", queue, job.id);
    if let JobPayload::IssueSync(sync) = &job.payload {
        if let Err(e) = ctx.dedup.remove_job(sync).await {
            tracing::warn!("Failed to release dedup key of skipped sync {}: {}", sync.job_id, e);
        }
    }
}
