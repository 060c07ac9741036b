//! Public producer API: enqueue, cancel, retry, batch operations, pause and
//! resume, statistics, cleanup and event subscription. Constructed once and
//! passed to worker pools; there is no module-level state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::events::{EventPublisher, QueueEvent, QueueEventKind};
use super::job::{now_ms, Job, JobOptions, JobState};
use super::lifecycle::{LifecycleStore, StateCounts};
use super::scheduler::SchedulerStore;
use crate::config::QueueConfig;
use crate::gateway::{Gateway, KeyCodec};
use crate::resilience::retry::{BackoffSpec, CustomBackoffFn, RetryPolicy};
use crate::utils::errors::{QueueError, QueueResult};
use crate::utils::monitoring::Metrics;

/// Per-queue runtime state shared between the manager and its worker pool.
pub struct QueueRuntime {
    pub config: QueueConfig,
    paused: AtomicBool,
    processing: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    processing_ms_total: AtomicU64,
    last_activity_ms: AtomicI64,
    started_at: Instant,
}

impl QueueRuntime {
    fn new(config: QueueConfig) -> Self {
        Self {
            config,
            paused: AtomicBool::new(false),
            processing: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            processing_ms_total: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn processing_count(&self) -> usize {
        self.processing.load(Ordering::Relaxed)
    }

    pub fn begin_processing(&self) {
        self.processing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_processing(&self) {
        self.processing.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn record_outcome(&self, success: bool, elapsed_ms: u64) {
        if success {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.processing_ms_total
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        self.touch();
    }

    pub fn avg_processing_ms(&self) -> f64 {
        let total = self.processed.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.processing_ms_total.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        let failed = self.failed.load(Ordering::Relaxed);
        let total = self.processed.load(Ordering::Relaxed) + failed;
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }

    fn throughput_per_minute(&self) -> f64 {
        let minutes = self.started_at.elapsed().as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            0.0
        } else {
            self.processed.load(Ordering::Relaxed) as f64 / minutes
        }
    }
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub counts: StateCounts,
    pub processing: usize,
    pub paused: bool,
    /// Active jobs whose claim is older than the stalled interval.
    pub stalled: u64,
    pub avg_processing_ms: f64,
    pub error_rate: f64,
    pub throughput_per_minute: f64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Per-item failure inside a batch operation.
#[derive(Debug)]
pub struct BatchItemError {
    pub index: usize,
    pub error: QueueError,
}

#[derive(Debug, Default)]
pub struct BatchResult<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<BatchItemError>,
}

/// A job description inside `batch_add`.
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
    pub opts: Option<JobOptions>,
}

pub struct QueueManager {
    gateway: Arc<dyn Gateway>,
    codec: KeyCodec,
    scheduler: SchedulerStore,
    lifecycle: LifecycleStore,
    publisher: EventPublisher,
    queues: RwLock<HashMap<String, Arc<QueueRuntime>>>,
    backoffs: RwLock<HashMap<String, Arc<CustomBackoffFn>>>,
    metrics: Arc<Metrics>,
}

impl QueueManager {
    pub fn new(gateway: Arc<dyn Gateway>, key_prefix: &str, metrics: Arc<Metrics>) -> Arc<Self> {
        let codec = KeyCodec::new(key_prefix);
        Arc::new(Self {
            scheduler: SchedulerStore::new(gateway.clone(), codec.clone()),
            lifecycle: LifecycleStore::new(gateway.clone(), codec.clone()),
            publisher: EventPublisher::new(gateway.clone(), codec.clone()),
            queues: RwLock::new(HashMap::new()),
            backoffs: RwLock::new(HashMap::new()),
            gateway,
            codec,
            metrics,
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Registers a queue. The persisted pause flag survives restarts.
    pub async fn register_queue(&self, config: QueueConfig) -> QueueResult<()> {
        config.validate()?;
        let name = config.name.clone();
        let runtime = Arc::new(QueueRuntime::new(config));

        let paused = self
            .gateway
            .hget(&self.codec.queue_config(&name), "paused")
            .await?
            .map(|flag| flag == "1")
            .unwrap_or(false);
        runtime.paused.store(paused, Ordering::Relaxed);

        info!("registered queue {} (paused={})", name, paused);
        self.queues.write().await.insert(name, runtime);
        Ok(())
    }

    /// Registers a named custom backoff function referenced by
    /// `BackoffSpec::Custom`.
    pub async fn register_backoff(&self, name: &str, f: Arc<CustomBackoffFn>) {
        self.backoffs.write().await.insert(name.to_string(), f);
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.queues.read().await.keys().cloned().collect()
    }

    pub async fn queue(&self, name: &str) -> QueueResult<Arc<QueueRuntime>> {
        self.queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    async fn validate_opts(&self, opts: &JobOptions) -> QueueResult<()> {
        opts.validate()?;
        if let BackoffSpec::Custom { name } = &opts.backoff {
            if !self.backoffs.read().await.contains_key(name) {
                return Err(QueueError::validation(format!(
                    "custom backoff '{}' is not registered",
                    name
                )));
            }
        }
        Ok(())
    }

    fn default_opts(config: &QueueConfig) -> JobOptions {
        JobOptions {
            priority: config.default_priority,
            max_attempts: config.max_attempts(),
            backoff: config.backoff.clone(),
            dead_letter_queue: config.dead_letter_queue.clone(),
            ..Default::default()
        }
    }

    fn build_job(
        &self,
        runtime: &QueueRuntime,
        queue: &str,
        job_type: &str,
        payload: Value,
        opts: Option<JobOptions>,
    ) -> Job {
        let opts = opts.unwrap_or_else(|| Self::default_opts(&runtime.config));
        Job::new(queue, job_type, payload, opts)
    }

    /// Accepts a job; the record write and zset insertion are atomic, so a
    /// worker never sees one without the other.
    #[instrument(skip(self, payload, opts))]
    pub async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        payload: Value,
        opts: Option<JobOptions>,
    ) -> QueueResult<String> {
        let runtime = self.queue(queue).await?;
        let job = self.build_job(&runtime, queue, job_type, payload, opts);
        self.validate_opts(&job.opts).await?;

        self.lifecycle.create(&job).await?;
        self.metrics.jobs_enqueued.with_label_values(&[queue]).inc();
        runtime.touch();

        self.publisher
            .publish(QueueEvent::job(
                QueueEventKind::JobAdded,
                queue,
                &job.id,
                json!({ "jobType": job.job_type, "priority": job.opts.priority,
                        "delayMs": job.opts.delay_ms }),
            ))
            .await;
        debug!("enqueued {} on {} (state {})", job.id, queue, job.state);
        Ok(job.id)
    }

    /// Removes the job from every state set and the record hash. Safe from
    /// any state; returns whether a removal occurred.
    pub async fn cancel(&self, queue: &str, job_id: &str) -> QueueResult<bool> {
        self.queue(queue).await?;
        self.lifecycle.cancel(queue, job_id).await
    }

    /// Moves a failed job back to waiting with attempts reset. A no-op
    /// returning `false` for jobs that are not failed.
    pub async fn retry(&self, queue: &str, job_id: &str) -> QueueResult<bool> {
        self.queue(queue).await?;
        match self.lifecycle.reset_for_retry(queue, job_id).await? {
            Some(_) => {
                self.publisher
                    .publish(QueueEvent::job(
                        QueueEventKind::JobRetry,
                        queue,
                        job_id,
                        json!({ "manual": true }),
                    ))
                    .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pipelined bulk enqueue; validation failures are reported per item and
    /// do not abort the rest.
    pub async fn batch_add(&self, queue: &str, items: Vec<NewJob>) -> QueueResult<BatchResult<String>> {
        let runtime = self.queue(queue).await?;
        let mut result = BatchResult::default();
        let mut jobs = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            let job = self.build_job(&runtime, queue, &item.job_type, item.payload, item.opts);
            match self.validate_opts(&job.opts).await {
                Ok(()) => jobs.push(job),
                Err(error) => result.failed.push(BatchItemError { index, error }),
            }
        }

        if !jobs.is_empty() {
            self.lifecycle.create_batch(&jobs).await?;
            self.metrics
                .jobs_enqueued
                .with_label_values(&[queue])
                .inc_by(jobs.len() as u64);
            runtime.touch();
            result.succeeded = jobs.iter().map(|j| j.id.clone()).collect();
        }

        self.publisher
            .publish(QueueEvent::queue(
                QueueEventKind::BatchAdded,
                queue,
                json!({ "count": result.succeeded.len(), "rejected": result.failed.len() }),
            ))
            .await;
        Ok(result)
    }

    pub async fn batch_remove(
        &self,
        queue: &str,
        job_ids: &[String],
    ) -> QueueResult<BatchResult<String>> {
        self.queue(queue).await?;
        let mut result = BatchResult::default();
        for (index, id) in job_ids.iter().enumerate() {
            match self.lifecycle.cancel(queue, id).await {
                Ok(true) => result.succeeded.push(id.clone()),
                Ok(false) => result.failed.push(BatchItemError {
                    index,
                    error: QueueError::JobNotFound(id.clone()),
                }),
                Err(error) => result.failed.push(BatchItemError { index, error }),
            }
        }
        self.publisher
            .publish(QueueEvent::queue(
                QueueEventKind::BatchRemoved,
                queue,
                json!({ "count": result.succeeded.len() }),
            ))
            .await;
        Ok(result)
    }

    pub async fn batch_retry(
        &self,
        queue: &str,
        job_ids: &[String],
    ) -> QueueResult<BatchResult<String>> {
        self.queue(queue).await?;
        let mut result = BatchResult::default();
        for (index, id) in job_ids.iter().enumerate() {
            match self.lifecycle.reset_for_retry(queue, id).await {
                Ok(Some(_)) => result.succeeded.push(id.clone()),
                Ok(None) => result.failed.push(BatchItemError {
                    index,
                    error: QueueError::Conflict(format!("job {} is not failed", id)),
                }),
                Err(error) => result.failed.push(BatchItemError { index, error }),
            }
        }
        self.publisher
            .publish(QueueEvent::queue(
                QueueEventKind::BatchRetried,
                queue,
                json!({ "count": result.succeeded.len() }),
            ))
            .await;
        Ok(result)
    }

    /// Suspends worker polling without touching job records.
    pub async fn pause(&self, queue: &str) -> QueueResult<()> {
        let runtime = self.queue(queue).await?;
        runtime.paused.store(true, Ordering::Relaxed);
        self.gateway
            .hset(&self.codec.queue_config(queue), "paused", "1")
            .await?;
        self.publisher
            .publish(QueueEvent::queue(QueueEventKind::QueuePaused, queue, Value::Null))
            .await;
        info!("queue {} paused", queue);
        Ok(())
    }

    pub async fn resume(&self, queue: &str) -> QueueResult<()> {
        let runtime = self.queue(queue).await?;
        runtime.paused.store(false, Ordering::Relaxed);
        self.gateway
            .hset(&self.codec.queue_config(queue), "paused", "0")
            .await?;
        self.publisher
            .publish(QueueEvent::queue(QueueEventKind::QueueResumed, queue, Value::Null))
            .await;
        info!("queue {} resumed", queue);
        Ok(())
    }

    /// Live counts via ZCARD plus in-process aggregates.
    pub async fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        let runtime = self.queue(queue).await?;
        let counts = self.lifecycle.counts(queue).await?;
        self.metrics
            .queue_depth
            .with_label_values(&[queue])
            .set(counts.waiting as i64);

        let cutoff = now_ms() - runtime.config.stalled_interval_ms as i64;
        let stalled = self.lifecycle.stalled_candidates(queue, cutoff).await?.len() as u64;

        let last_activity_ms = runtime.last_activity_ms.load(Ordering::Relaxed);
        Ok(QueueStats {
            name: queue.to_string(),
            counts,
            processing: runtime.processing_count(),
            paused: runtime.is_paused(),
            stalled,
            avg_processing_ms: runtime.avg_processing_ms(),
            error_rate: runtime.error_rate(),
            throughput_per_minute: runtime.throughput_per_minute(),
            last_activity: (last_activity_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_activity_ms).single())
                .flatten(),
        })
    }

    /// Time-based cleanup of retained completed jobs; score ranges only.
    pub async fn clean_completed(
        &self,
        queue: &str,
        older_than_ms: i64,
        batch: usize,
    ) -> QueueResult<u64> {
        self.queue(queue).await?;
        let removed = self
            .lifecycle
            .clean_finished(queue, JobState::Completed, older_than_ms, batch)
            .await?;
        self.publisher
            .publish(QueueEvent::queue(
                QueueEventKind::BatchCleaned,
                queue,
                json!({ "count": removed, "state": "completed" }),
            ))
            .await;
        Ok(removed)
    }

    pub async fn clean_failed(
        &self,
        queue: &str,
        older_than_ms: i64,
        batch: usize,
    ) -> QueueResult<u64> {
        self.queue(queue).await?;
        let removed = self
            .lifecycle
            .clean_finished(queue, JobState::Failed, older_than_ms, batch)
            .await?;
        self.publisher
            .publish(QueueEvent::queue(
                QueueEventKind::BatchCleaned,
                queue,
                json!({ "count": removed, "state": "failed" }),
            ))
            .await;
        Ok(removed)
    }

    /// Removes every key of the queue atomically, then publishes a single
    /// cleaned event so subscribers never observe a partial snapshot.
    pub async fn drain(&self, queue: &str) -> QueueResult<()> {
        self.queue(queue).await?;
        warn!("draining queue {}", queue);
        self.lifecycle.drain(queue).await?;
        self.publisher
            .publish(QueueEvent::queue(
                QueueEventKind::BatchCleaned,
                queue,
                json!({ "drained": true }),
            ))
            .await;
        Ok(())
    }

    pub async fn subscribe_events(
        &self,
        queue: &str,
    ) -> QueueResult<tokio::sync::mpsc::Receiver<QueueEvent>> {
        self.queue(queue).await?;
        self.publisher.subscribe(queue).await
    }

    pub async fn job(&self, queue: &str, job_id: &str) -> QueueResult<Option<Job>> {
        self.queue(queue).await?;
        self.lifecycle.load(queue, job_id).await
    }

    pub async fn dead_letter_count(&self, dlq: &str) -> QueueResult<u64> {
        self.gateway.zcard(&self.codec.dead_letter(dlq)).await
    }

    // ---- worker-facing operations -------------------------------------

    /// Claims the most urgent waiting job and activates it. `None` when the
    /// set is empty, the claim race was lost, or a cancel raced the claim.
    pub async fn claim_next(&self, queue: &str) -> QueueResult<Option<Job>> {
        let Some(job_id) = self.scheduler.claim_one(queue).await? else {
            return Ok(None);
        };
        let Some(job) = self.lifecycle.activate(queue, &job_id, now_ms()).await? else {
            return Ok(None);
        };
        self.publisher
            .publish(QueueEvent::job(
                QueueEventKind::JobActive,
                queue,
                &job.id,
                json!({ "attemptsMade": job.attempts_made }),
            ))
            .await;
        Ok(Some(job))
    }

    async fn retry_policy_for(&self, spec: &BackoffSpec) -> RetryPolicy {
        let policy = RetryPolicy::new(spec.clone());
        if let BackoffSpec::Custom { name } = spec {
            if let Some(custom) = self.backoffs.read().await.get(name) {
                return policy.with_custom(custom.clone());
            }
        }
        policy
    }

    /// Applies the retry/DLQ state machine after a processor outcome.
    pub async fn settle(
        &self,
        runtime: &QueueRuntime,
        mut job: Job,
        outcome: Result<Value, QueueError>,
        elapsed_ms: u64,
    ) -> QueueResult<()> {
        let queue = job.queue.clone();
        match outcome {
            Ok(value) => {
                self.lifecycle
                    .complete(&mut job, value, runtime.config.remove_on_complete_count)
                    .await?;
                runtime.record_outcome(true, elapsed_ms);
                self.metrics
                    .jobs_completed
                    .with_label_values(&[&queue])
                    .inc();
                self.metrics
                    .processing_seconds
                    .with_label_values(&[&queue])
                    .observe(elapsed_ms as f64 / 1000.0);
                self.publisher
                    .publish(QueueEvent::job(
                        QueueEventKind::JobCompleted,
                        &queue,
                        &job.id,
                        json!({ "durationMs": elapsed_ms, "attemptsMade": job.attempts_made }),
                    ))
                    .await;
            }
            Err(error) => {
                runtime.record_outcome(false, elapsed_ms);
                let message = error.to_string();
                if job.attempts_made < job.opts.max_attempts {
                    let policy = self.retry_policy_for(&job.opts.backoff).await;
                    let delay = policy.next_delay(job.attempts_made);
                    let not_before = now_ms() + delay.as_millis() as i64;
                    self.lifecycle
                        .retry_later(&mut job, not_before, message.clone())
                        .await?;
                    self.metrics.jobs_retried.with_label_values(&[&queue]).inc();
                    self.publisher
                        .publish(QueueEvent::job(
                            QueueEventKind::JobRetry,
                            &queue,
                            &job.id,
                            json!({ "attemptsMade": job.attempts_made,
                                    "delayMs": delay.as_millis() as u64,
                                    "error": message }),
                        ))
                        .await;
                } else {
                    self.lifecycle
                        .fail(&mut job, message.clone(), runtime.config.remove_on_fail_count)
                        .await?;
                    self.metrics.jobs_failed.with_label_values(&[&queue]).inc();
                    self.publisher
                        .publish(QueueEvent::job(
                            QueueEventKind::JobFailed,
                            &queue,
                            &job.id,
                            json!({ "attemptsMade": job.attempts_made, "error": message,
                                    "deadLetterQueue": job.opts.dead_letter_queue }),
                        ))
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Moves due delayed jobs into waiting; run by the promotion task.
    pub async fn promote_due(&self, queue: &str) -> QueueResult<Vec<String>> {
        let promoted = self.lifecycle.promote_due(queue, now_ms(), 128).await?;
        for id in &promoted {
            self.publisher
                .publish(QueueEvent::job(
                    QueueEventKind::JobAdded,
                    queue,
                    id,
                    json!({ "promoted": true }),
                ))
                .await;
        }
        Ok(promoted)
    }

    /// Re-enqueues overdue active jobs; jobs past `max_stalled_count` fail
    /// permanently. Returns the number of recovered jobs.
    pub async fn recover_stalled(&self, queue: &str) -> QueueResult<u64> {
        let runtime = self.queue(queue).await?;
        let cutoff = now_ms() - runtime.config.stalled_interval_ms as i64;
        let candidates = self.lifecycle.stalled_candidates(queue, cutoff).await?;
        let mut recovered = 0u64;

        for id in candidates {
            let Some(mut job) = self.lifecycle.load(queue, &id).await? else {
                continue;
            };
            if job.stalled_count >= runtime.config.max_stalled_count {
                warn!("job {} stalled beyond limit, failing permanently", id);
                let message = "stalled beyond max_stalled_count".to_string();
                self.lifecycle
                    .fail(&mut job, message.clone(), runtime.config.remove_on_fail_count)
                    .await?;
                self.metrics.jobs_failed.with_label_values(&[queue]).inc();
                self.publisher
                    .publish(QueueEvent::job(
                        QueueEventKind::JobFailed,
                        queue,
                        &id,
                        json!({ "error": message, "stalled": true,
                                "stalledCount": job.stalled_count }),
                    ))
                    .await;
            } else {
                self.lifecycle.requeue_stalled(&mut job).await?;
                self.metrics.jobs_stalled.with_label_values(&[queue]).inc();
                self.publisher
                    .publish(QueueEvent::job(
                        QueueEventKind::JobRetry,
                        queue,
                        &id,
                        json!({ "stalled": true, "stalledCount": job.stalled_count }),
                    ))
                    .await;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
