//! Single-worker job queue with capped exponential backoff and dead-lettering

use super::backoff::compute_backoff;
use super::job::{AsyncJob, JobContext, JobError, JobHandler, JobStats, JobStatus};
use super::store::JobStore;
use crate::config::QueueConfig;
use crate::error::{RebalanceError, Result};
use crate::telemetry::{EventSink, RunEvent};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub default_max_attempts: u32,
    pub base_backoff: Duration,
    pub max_jobs: usize,
    pub dismissed_retention: chrono::Duration,
}

impl From<&QueueConfig> for QueueSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            default_max_attempts: config.default_max_attempts,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_jobs: config.max_jobs,
            dismissed_retention: chrono::Duration::seconds(config.dismissed_retention_secs),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

pub struct JobQueue {
    settings: QueueSettings,
    jobs: Mutex<Vec<AsyncJob>>,
    handler: Arc<dyn JobHandler>,
    /// Held while jobs execute: one job at a time, process-wide
    run_lock: Mutex<()>,
    wake: Notify,
    /// Set while `run_worker` is consuming
    worker_active: AtomicBool,
    /// Set while an on-demand drain task is alive
    draining: AtomicBool,
    store: Option<JobStore>,
    sink: Option<Arc<dyn EventSink>>,
}

impl JobQueue {
    pub fn new(settings: QueueSettings, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            settings,
            jobs: Mutex::new(Vec::new()),
            handler,
            run_lock: Mutex::new(()),
            wake: Notify::new(),
            worker_active: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            store: None,
            sink: None,
        }
    }

    /// Queue backed by a snapshot file, restoring whatever it holds
    pub async fn open(
        settings: QueueSettings,
        handler: Arc<dyn JobHandler>,
        store: JobStore,
    ) -> Result<Self> {
        let restored = store.load().await?;
        if !restored.is_empty() {
            info!(path = %store.path().display(), jobs = restored.len(), "Restored job queue");
        }
        let mut queue = Self::new(settings, handler);
        queue.jobs = Mutex::new(restored);
        queue.store = Some(store);
        Ok(queue)
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Append a job and wake the worker
    pub async fn enqueue(&self, payload: Value, max_attempts: Option<u32>) -> Result<AsyncJob> {
        let max_attempts = max_attempts.unwrap_or(self.settings.default_max_attempts);
        let job = AsyncJob::new(format!("job-{}", Uuid::new_v4()), payload, max_attempts);

        {
            let mut jobs = self.jobs.lock().await;
            if jobs.len() >= self.settings.max_jobs {
                match jobs.iter().position(|j| j.status.is_evictable()) {
                    Some(idx) => {
                        let evicted = jobs.remove(idx);
                        debug!(job_id = %evicted.job_id, status = %evicted.status, "Evicted finished job");
                    }
                    None => {
                        return Err(RebalanceError::QueueFull {
                            capacity: self.settings.max_jobs,
                        })
                    }
                }
            }
            jobs.push(job.clone());
            self.persist(&jobs).await;
        }

        info!(job_id = %job.job_id, max_attempts = job.max_attempts, "Job enqueued");
        self.wake.notify_one();
        Ok(job)
    }

    pub async fn get(&self, job_id: &str) -> Result<AsyncJob> {
        self.jobs
            .lock()
            .await
            .iter()
            .find(|j| j.job_id == job_id)
            .cloned()
            .ok_or_else(|| RebalanceError::JobNotFound(job_id.to_string()))
    }

    pub async fn list(&self, status: Option<JobStatus>) -> Vec<AsyncJob> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> JobStats {
        let jobs = self.jobs.lock().await;
        let mut stats = JobStats {
            total: jobs.len(),
            ..Default::default()
        };
        for job in jobs.iter() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Done => stats.done += 1,
                JobStatus::DeadLetter => stats.dead_letter += 1,
                JobStatus::Dismissed => stats.dismissed += 1,
            }
        }
        stats
    }

    /// Make sure someone consumes the queue: wake the worker loop if one is
    /// running, otherwise spawn a drain task that exits once nothing is queued.
    /// Must be called from within a tokio runtime.
    pub fn trigger(self: &Arc<Self>) {
        if self.worker_active.load(Ordering::Acquire) {
            self.wake.notify_one();
            return;
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.drain_until_idle().await;
        });
    }

    pub fn worker_active(&self) -> bool {
        self.worker_active.load(Ordering::Acquire)
    }

    async fn drain_until_idle(&self) {
        debug!("Queue drain started");
        loop {
            self.process_due().await;
            if let Some(wait) = self.next_wake_delay().await {
                tokio::time::sleep(wait).await;
                continue;
            }
            if self.has_queued().await {
                continue;
            }

            self.draining.store(false, Ordering::Release);
            // An enqueue may have landed between the check and the store
            if !self.has_queued().await
                || self
                    .draining
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                break;
            }
        }
        debug!("Queue drain finished");
    }

    async fn has_queued(&self) -> bool {
        self.jobs
            .lock()
            .await
            .iter()
            .any(|j| j.status == JobStatus::Queued)
    }

    /// Run every due job, one at a time, until none is due. Returns how many
    /// attempts were made.
    pub async fn process_due(&self) -> usize {
        let _running = self.run_lock.lock().await;
        let mut processed = 0;

        while let Some(ctx) = self.claim_next().await {
            debug!(job_id = %ctx.job_id, attempt = ctx.attempt, "Executing job");
            let outcome = self.handler.handle(&ctx).await;
            self.complete(&ctx, outcome).await;
            processed += 1;
        }

        processed
    }

    /// Long-lived consumer. Sleeps until a job is enqueued, the earliest
    /// backoff expires, or `shutdown` flips to true.
    pub async fn run_worker(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Job worker started");
        self.worker_active.store(true, Ordering::Release);
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.process_due().await;
            self.purge_dismissed(self.settings.dismissed_retention).await;

            let wait = self.next_wake_delay().await;
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.worker_active.store(false, Ordering::Release);
        info!("Job worker stopped");
    }

    /// Manually re-queue one dead-lettered job
    pub async fn retry(&self, job_id: &str) -> Result<AsyncJob> {
        let job = self
            .mutate(job_id, |job| {
                if job.status != JobStatus::DeadLetter {
                    return Err(invalid_state(job, "dead-letter"));
                }
                job.requeue(Utc::now());
                Ok(job.clone())
            })
            .await?;
        info!(job_id, "Dead-lettered job re-queued");
        self.wake.notify_one();
        Ok(job)
    }

    /// Re-queue every dead-lettered job whose stored error is still retryable
    pub async fn retry_all_retryable(&self) -> Vec<String> {
        let requeued: Vec<String> = {
            let mut jobs = self.jobs.lock().await;
            let now = Utc::now();
            let ids: Vec<String> = jobs
                .iter_mut()
                .filter(|j| j.status == JobStatus::DeadLetter)
                .filter(|j| j.error.as_ref().map_or(false, JobError::is_retryable))
                .map(|j| {
                    j.requeue(now);
                    j.job_id.clone()
                })
                .collect();
            if !ids.is_empty() {
                self.persist(&jobs).await;
            }
            ids
        };

        if !requeued.is_empty() {
            info!(count = requeued.len(), "Re-queued retryable dead-lettered jobs");
            self.wake.notify_one();
        }
        requeued
    }

    /// Take a job out of the active set, keeping it for audit
    pub async fn dismiss(&self, job_id: &str) -> Result<AsyncJob> {
        self.mutate(job_id, |job| {
            match job.status {
                JobStatus::Running => return Err(invalid_state(job, "not running")),
                JobStatus::Dismissed => return Ok(job.clone()),
                _ => {}
            }
            let now = Utc::now();
            job.status = JobStatus::Dismissed;
            job.dismissed_at = Some(now);
            job.next_attempt_at = None;
            job.updated_at = now;
            Ok(job.clone())
        })
        .await
    }

    /// Drop dismissed jobs older than `retention`
    pub async fn purge_dismissed(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|j| {
            !(j.status == JobStatus::Dismissed
                && j.dismissed_at.unwrap_or(j.updated_at) < cutoff)
        });
        let purged = before - jobs.len();
        if purged > 0 {
            info!(purged, "Purged dismissed jobs");
            self.persist(&jobs).await;
        }
        purged
    }

    async fn claim_next(&self) -> Option<JobContext> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let job = jobs.iter_mut().find(|j| j.is_due(now))?;

        job.status = JobStatus::Running;
        job.attempt_count += 1;
        job.next_attempt_at = None;
        job.updated_at = now;
        let ctx = JobContext {
            job_id: job.job_id.clone(),
            attempt: job.attempt_count,
            payload: job.payload.clone(),
        };
        self.emit_transition(&ctx.job_id, JobStatus::Queued, JobStatus::Running, ctx.attempt, None);
        self.persist(&jobs).await;
        Some(ctx)
    }

    async fn complete(&self, ctx: &JobContext, outcome: std::result::Result<Value, JobError>) {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.iter_mut().find(|j| j.job_id == ctx.job_id) else {
            error!(job_id = %ctx.job_id, "Running job vanished from the queue");
            return;
        };
        let now = Utc::now();
        job.updated_at = now;

        let error_message = match outcome {
            Ok(result) => {
                job.status = JobStatus::Done;
                job.result = Some(result);
                job.error = None;
                job.next_attempt_at = None;
                info!(job_id = %job.job_id, attempt = job.attempt_count, "Job done");
                None
            }
            Err(err) => {
                job.last_error_at = Some(now);
                let message = err.to_string();
                if err.is_retryable() && job.attempts_left() {
                    let delay = compute_backoff(job.attempt_count, self.settings.base_backoff);
                    job.status = JobStatus::Queued;
                    job.next_attempt_at = Some(now + to_chrono(delay));
                    warn!(
                        job_id = %job.job_id,
                        attempt = job.attempt_count,
                        max_attempts = job.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Job failed, retrying after backoff"
                    );
                } else {
                    job.status = JobStatus::DeadLetter;
                    job.next_attempt_at = None;
                    error!(
                        job_id = %job.job_id,
                        attempt = job.attempt_count,
                        retryable = err.is_retryable(),
                        error = %message,
                        "Job dead-lettered"
                    );
                }
                job.error = Some(err);
                Some(message)
            }
        };

        let (job_id, status, attempt) = (job.job_id.clone(), job.status, job.attempt_count);
        self.emit_transition(&job_id, JobStatus::Running, status, attempt, error_message);
        self.persist(&jobs).await;
    }

    async fn next_wake_delay(&self) -> Option<Duration> {
        let jobs = self.jobs.lock().await;
        let earliest: DateTime<Utc> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Queued)
            .filter_map(|j| j.next_attempt_at)
            .min()?;
        Some((earliest - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    async fn mutate<T>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut AsyncJob) -> Result<T>,
    ) -> Result<T> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.job_id == job_id)
            .ok_or_else(|| RebalanceError::JobNotFound(job_id.to_string()))?;
        let out = f(job)?;
        self.persist(&jobs).await;
        Ok(out)
    }

    async fn persist(&self, jobs: &[AsyncJob]) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(jobs).await {
                warn!(path = %store.path().display(), error = %e, "Failed to persist job queue");
            }
        }
    }

    fn emit_transition(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        attempt: u32,
        error: Option<String>,
    ) {
        if let Some(sink) = &self.sink {
            sink.record(&RunEvent::JobTransition {
                job_id: job_id.to_string(),
                from,
                to,
                attempt,
                error,
            });
        }
    }
}

fn invalid_state(job: &AsyncJob, expected: &str) -> RebalanceError {
    RebalanceError::InvalidJobState {
        job_id: job.job_id.clone(),
        status: job.status.to_string(),
        expected: expected.to_string(),
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
}
