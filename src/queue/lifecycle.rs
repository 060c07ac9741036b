//! Job record storage and the state-transition primitives.
//!
//! Every transition executes as one atomic pipeline (record write plus zset
//! moves), so an observer going through the public API sees a job in exactly
//! one state. Event publication happens a layer up and is best-effort.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::job::{now_ms, Job, JobEnvelope, JobState};
use super::scheduler::priority_score;
use crate::gateway::{Gateway, KeyCodec, Op};
use crate::utils::errors::QueueResult;

/// Counts per state, the basis of queue statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StateCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.delayed + self.completed + self.failed
    }
}

pub struct LifecycleStore {
    gateway: Arc<dyn Gateway>,
    codec: KeyCodec,
}

impl LifecycleStore {
    pub fn new(gateway: Arc<dyn Gateway>, codec: KeyCodec) -> Self {
        Self { gateway, codec }
    }

    fn state_key(&self, queue: &str, state: JobState) -> String {
        match state {
            JobState::Waiting => self.codec.waiting(queue),
            JobState::Active => self.codec.active(queue),
            JobState::Delayed => self.codec.delayed(queue),
            JobState::Completed => self.codec.completed(queue),
            JobState::Failed => self.codec.failed(queue),
        }
    }

    fn record_ops(&self, job: &Job) -> QueueResult<Vec<Op>> {
        Ok(vec![
            Op::HSet {
                key: self.codec.jobs(&job.queue),
                field: job.id.clone(),
                value: job.to_json()?,
            },
            Op::HSet {
                key: self.codec.state_meta(&job.queue, job.state.as_str()),
                field: job.id.clone(),
                value: JobEnvelope::of(job).to_json()?,
            },
        ])
    }

    fn meta_del(&self, queue: &str, state: JobState, id: &str) -> Op {
        Op::HDel {
            key: self.codec.state_meta(queue, state.as_str()),
            field: id.to_string(),
        }
    }

    /// (none) -> waiting | delayed.
    pub async fn create(&self, job: &Job) -> QueueResult<()> {
        let mut ops = self.record_ops(job)?;
        match job.state {
            JobState::Delayed => ops.push(Op::ZAdd {
                key: self.codec.delayed(&job.queue),
                member: job.id.clone(),
                score: job.not_before() as f64,
            }),
            _ => ops.push(Op::ZAdd {
                key: self.codec.waiting(&job.queue),
                member: job.id.clone(),
                score: priority_score(job.opts.priority, job.created_at),
            }),
        }
        self.gateway.pipeline(ops).await
    }

    /// Batch creation as a single pipeline.
    pub async fn create_batch(&self, jobs: &[Job]) -> QueueResult<()> {
        let mut ops = Vec::with_capacity(jobs.len() * 3);
        for job in jobs {
            ops.extend(self.record_ops(job)?);
            match job.state {
                JobState::Delayed => ops.push(Op::ZAdd {
                    key: self.codec.delayed(&job.queue),
                    member: job.id.clone(),
                    score: job.not_before() as f64,
                }),
                _ => ops.push(Op::ZAdd {
                    key: self.codec.waiting(&job.queue),
                    member: job.id.clone(),
                    score: priority_score(job.opts.priority, job.created_at),
                }),
            }
        }
        self.gateway.pipeline(ops).await
    }

    pub async fn load(&self, queue: &str, id: &str) -> QueueResult<Option<Job>> {
        match self.gateway.hget(&self.codec.jobs(queue), id).await? {
            Some(raw) => Ok(Some(Job::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    /// delayed -> waiting for every member whose not-before has passed.
    /// Returns the promoted ids.
    pub async fn promote_due(
        &self,
        queue: &str,
        now: i64,
        limit: usize,
    ) -> QueueResult<Vec<String>> {
        let due = self
            .gateway
            .zrange_by_score(&self.codec.delayed(queue), f64::NEG_INFINITY, now as f64, limit)
            .await?;

        let mut promoted = Vec::new();
        for (id, _) in due {
            let Some(mut job) = self.load(queue, &id).await? else {
                // Orphan member without a record; drop it.
                self.gateway
                    .zrem(&self.codec.delayed(queue), &[id.clone()])
                    .await?;
                continue;
            };
            job.state = JobState::Waiting;
            let mut ops = vec![
                Op::ZRem {
                    key: self.codec.delayed(queue),
                    member: id.clone(),
                },
                Op::ZAdd {
                    key: self.codec.waiting(queue),
                    member: id.clone(),
                    score: priority_score(job.opts.priority, job.created_at),
                },
                self.meta_del(queue, JobState::Delayed, &id),
            ];
            ops.extend(self.record_ops(&job)?);
            self.gateway.pipeline(ops).await?;
            promoted.push(id);
        }
        if !promoted.is_empty() {
            debug!("promoted {} delayed jobs on {}", promoted.len(), queue);
        }
        Ok(promoted)
    }

    /// waiting -> active after a successful claim. Returns `None` when the
    /// record vanished between claim and activation (cancel won the race).
    pub async fn activate(&self, queue: &str, id: &str, now: i64) -> QueueResult<Option<Job>> {
        let Some(mut job) = self.load(queue, id).await? else {
            debug!("claimed job {} has no record, treating as cancelled", id);
            return Ok(None);
        };
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.processed_on = Some(now);

        let mut ops = vec![
            Op::ZAdd {
                key: self.codec.active(queue),
                member: id.to_string(),
                score: now as f64,
            },
            self.meta_del(queue, JobState::Waiting, id),
        ];
        ops.extend(self.record_ops(&job)?);
        self.gateway.pipeline(ops).await?;
        Ok(Some(job))
    }

    /// active -> completed.
    pub async fn complete(
        &self,
        job: &mut Job,
        return_value: serde_json::Value,
        keep: u64,
    ) -> QueueResult<()> {
        let queue = job.queue.clone();
        let finished = now_ms();
        job.state = JobState::Completed;
        job.finished_on = Some(finished);
        job.return_value = Some(return_value);

        let mut ops = vec![
            Op::ZRem {
                key: self.codec.active(&queue),
                member: job.id.clone(),
            },
            self.meta_del(&queue, JobState::Active, &job.id),
        ];
        if job.opts.remove_on_complete {
            ops.push(Op::HDel {
                key: self.codec.jobs(&queue),
                field: job.id.clone(),
            });
        } else {
            ops.push(Op::ZAdd {
                key: self.codec.completed(&queue),
                member: job.id.clone(),
                score: finished as f64,
            });
            ops.extend(self.record_ops(job)?);
        }
        self.gateway.pipeline(ops).await?;

        if !job.opts.remove_on_complete {
            self.trim_retained(&queue, JobState::Completed, keep).await?;
        }
        Ok(())
    }

    /// active -> delayed for another attempt after backoff.
    pub async fn retry_later(
        &self,
        job: &mut Job,
        not_before: i64,
        error: String,
    ) -> QueueResult<()> {
        let queue = job.queue.clone();
        job.state = JobState::Delayed;
        job.scheduled_at = Some(not_before);
        job.last_error = Some(error);

        let mut ops = vec![
            Op::ZRem {
                key: self.codec.active(&queue),
                member: job.id.clone(),
            },
            Op::ZAdd {
                key: self.codec.delayed(&queue),
                member: job.id.clone(),
                score: not_before as f64,
            },
            self.meta_del(&queue, JobState::Active, &job.id),
        ];
        ops.extend(self.record_ops(job)?);
        self.gateway.pipeline(ops).await
    }

    /// active -> failed, with optional dead-letter insertion.
    pub async fn fail(&self, job: &mut Job, error: String, keep: u64) -> QueueResult<()> {
        let queue = job.queue.clone();
        let failed_at = now_ms();
        job.state = JobState::Failed;
        job.failed_at = Some(failed_at);
        job.last_error = Some(error);

        let mut ops = vec![
            Op::ZRem {
                key: self.codec.active(&queue),
                member: job.id.clone(),
            },
            self.meta_del(&queue, JobState::Active, &job.id),
        ];
        if let Some(dlq) = &job.opts.dead_letter_queue {
            ops.push(Op::ZAdd {
                key: self.codec.dead_letter(dlq),
                member: job.id.clone(),
                score: failed_at as f64,
            });
        }
        if job.opts.remove_on_fail {
            ops.push(Op::HDel {
                key: self.codec.jobs(&queue),
                field: job.id.clone(),
            });
        } else {
            ops.push(Op::ZAdd {
                key: self.codec.failed(&queue),
                member: job.id.clone(),
                score: failed_at as f64,
            });
            ops.extend(self.record_ops(job)?);
        }
        self.gateway.pipeline(ops).await?;

        if !job.opts.remove_on_fail {
            self.trim_retained(&queue, JobState::Failed, keep).await?;
        }
        Ok(())
    }

    /// active -> waiting via stalled recovery.
    pub async fn requeue_stalled(&self, job: &mut Job) -> QueueResult<()> {
        let queue = job.queue.clone();
        job.state = JobState::Waiting;
        job.stalled_count += 1;

        let mut ops = vec![
            Op::ZRem {
                key: self.codec.active(&queue),
                member: job.id.clone(),
            },
            Op::ZAdd {
                key: self.codec.waiting(&queue),
                member: job.id.clone(),
                score: priority_score(job.opts.priority, job.created_at),
            },
            self.meta_del(&queue, JobState::Active, &job.id),
        ];
        ops.extend(self.record_ops(job)?);
        self.gateway.pipeline(ops).await
    }

    /// Active members claimed at or before the cutoff.
    pub async fn stalled_candidates(&self, queue: &str, cutoff_ms: i64) -> QueueResult<Vec<String>> {
        let overdue = self
            .gateway
            .zrange_by_score(&self.codec.active(queue), f64::NEG_INFINITY, cutoff_ms as f64, 0)
            .await?;
        Ok(overdue.into_iter().map(|(id, _)| id).collect())
    }

    /// Removes a job from every state set and the record hash. Safe from any
    /// state; returns whether anything was removed.
    pub async fn cancel(&self, queue: &str, id: &str) -> QueueResult<bool> {
        let Some(job) = self.load(queue, id).await? else {
            return Ok(false);
        };

        let mut ops = Vec::new();
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Delayed,
            JobState::Completed,
            JobState::Failed,
        ] {
            ops.push(Op::ZRem {
                key: self.state_key(queue, state),
                member: id.to_string(),
            });
            ops.push(self.meta_del(queue, state, id));
        }
        if let Some(dlq) = &job.opts.dead_letter_queue {
            ops.push(Op::ZRem {
                key: self.codec.dead_letter(dlq),
                member: id.to_string(),
            });
        }
        ops.push(Op::HDel {
            key: self.codec.jobs(queue),
            field: id.to_string(),
        });
        self.gateway.pipeline(ops).await?;
        Ok(true)
    }

    /// failed -> waiting with attempts and failure fields reset. Returns the
    /// refreshed job, or `None` when the job is absent or not failed.
    pub async fn reset_for_retry(&self, queue: &str, id: &str) -> QueueResult<Option<Job>> {
        let Some(mut job) = self.load(queue, id).await? else {
            return Ok(None);
        };
        if job.state != JobState::Failed {
            return Ok(None);
        }
        job.state = JobState::Waiting;
        job.attempts_made = 0;
        job.stalled_count = 0;
        job.last_error = None;
        job.failed_at = None;
        job.finished_on = None;
        job.processed_on = None;

        let mut ops = vec![
            Op::ZRem {
                key: self.codec.failed(queue),
                member: id.to_string(),
            },
            Op::ZAdd {
                key: self.codec.waiting(queue),
                member: id.to_string(),
                score: priority_score(job.opts.priority, job.created_at),
            },
            self.meta_del(queue, JobState::Failed, id),
        ];
        if let Some(dlq) = &job.opts.dead_letter_queue {
            ops.push(Op::ZRem {
                key: self.codec.dead_letter(dlq),
                member: id.to_string(),
            });
        }
        ops.extend(self.record_ops(&job)?);
        self.gateway.pipeline(ops).await?;
        Ok(Some(job))
    }

    /// Time-based cleanup of a retained terminal set; score ranges only,
    /// never key scans. Returns the number of records removed.
    pub async fn clean_finished(
        &self,
        queue: &str,
        state: JobState,
        older_than_ms: i64,
        batch: usize,
    ) -> QueueResult<u64> {
        let key = self.state_key(queue, state);
        let cutoff = now_ms() - older_than_ms;
        let expired = self
            .gateway
            .zrange_by_score(&key, f64::NEG_INFINITY, cutoff as f64, batch)
            .await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut ops = Vec::with_capacity(expired.len() * 3);
        for (id, _) in &expired {
            ops.push(Op::ZRem {
                key: key.clone(),
                member: id.clone(),
            });
            ops.push(Op::HDel {
                key: self.codec.jobs(queue),
                field: id.clone(),
            });
            ops.push(self.meta_del(queue, state, id));
        }
        self.gateway.pipeline(ops).await?;
        Ok(expired.len() as u64)
    }

    /// Removes every key of the queue in one atomic pipeline.
    pub async fn drain(&self, queue: &str) -> QueueResult<()> {
        let mut ops: Vec<Op> = [
            self.codec.waiting(queue),
            self.codec.active(queue),
            self.codec.delayed(queue),
            self.codec.completed(queue),
            self.codec.failed(queue),
            self.codec.jobs(queue),
        ]
        .into_iter()
        .map(|key| Op::Del { key })
        .collect();
        for state in ["waiting", "active", "delayed", "completed", "failed"] {
            ops.push(Op::Del {
                key: self.codec.state_meta(queue, state),
            });
        }
        self.gateway.pipeline(ops).await
    }

    pub async fn counts(&self, queue: &str) -> QueueResult<StateCounts> {
        Ok(StateCounts {
            waiting: self.gateway.zcard(&self.codec.waiting(queue)).await?,
            active: self.gateway.zcard(&self.codec.active(queue)).await?,
            delayed: self.gateway.zcard(&self.codec.delayed(queue)).await?,
            completed: self.gateway.zcard(&self.codec.completed(queue)).await?,
            failed: self.gateway.zcard(&self.codec.failed(queue)).await?,
        })
    }

    /// Count-based retention trim: keep the newest `keep` members of a
    /// terminal set, destroying records of the overflow.
    async fn trim_retained(&self, queue: &str, state: JobState, keep: u64) -> QueueResult<()> {
        let key = self.state_key(queue, state);
        let count = self.gateway.zcard(&key).await?;
        if count <= keep {
            return Ok(());
        }
        let overflow = (count - keep) as isize;
        let oldest = self.gateway.zrange(&key, 0, overflow - 1).await?;

        let mut ops = Vec::with_capacity(oldest.len() * 3);
        for (id, _) in &oldest {
            ops.push(Op::ZRem {
                key: key.clone(),
                member: id.clone(),
            });
            ops.push(Op::HDel {
                key: self.codec.jobs(queue),
                field: id.clone(),
            });
            ops.push(self.meta_del(queue, state, id));
        }
        debug!(
            "trimmed {} {} jobs from {} (retention {})",
            oldest.len(),
            state,
            queue,
            keep
        );
        self.gateway.pipeline(ops).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use crate::queue::job::JobOptions;
    use serde_json::json;

    fn store() -> (LifecycleStore, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new());
        let codec = KeyCodec::new("llmchat:queue");
        (
            LifecycleStore::new(gateway.clone(), codec),
            gateway,
        )
    }

    fn job(opts: JobOptions) -> Job {
        Job::new("chat", "completion", json!({"prompt": "hi"}), opts)
    }

    #[tokio::test]
    async fn create_and_load_round_trip() {
        let (store, gateway) = store();
        let j = job(JobOptions::default());
        store.create(&j).await.unwrap();

        let loaded = store.load("chat", &j.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Waiting);
        assert_eq!(
            gateway.zcard("llmchat:queue:chat:waiting").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn activate_bumps_attempts_and_moves_sets() {
        let (store, gateway) = store();
        let j = job(JobOptions::default());
        store.create(&j).await.unwrap();

        let active = store.activate("chat", &j.id, now_ms()).await.unwrap().unwrap();
        assert_eq!(active.state, JobState::Active);
        assert_eq!(active.attempts_made, 1);
        assert!(active.processed_on.is_some());
        assert_eq!(gateway.zcard("llmchat:queue:chat:active").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn complete_retains_then_trims() {
        let (store, gateway) = store();
        for _ in 0..3 {
            let j = job(JobOptions::default());
            store.create(&j).await.unwrap();
            let mut active = store.activate("chat", &j.id, now_ms()).await.unwrap().unwrap();
            store.complete(&mut active, json!("ok"), 2).await.unwrap();
        }
        // Retention keeps only the newest two completed records.
        assert_eq!(
            gateway.zcard("llmchat:queue:chat:completed").await.unwrap(),
            2
        );
        assert_eq!(gateway.hlen("llmchat:queue:chat:jobs").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fail_inserts_into_dead_letter() {
        let (store, gateway) = store();
        let j = job(JobOptions {
            dead_letter_queue: Some("dlq".into()),
            ..Default::default()
        });
        store.create(&j).await.unwrap();
        let mut active = store.activate("chat", &j.id, now_ms()).await.unwrap().unwrap();
        store
            .fail(&mut active, "provider down".into(), 10)
            .await
            .unwrap();

        assert_eq!(gateway.zcard("llmchat:queue:chat:failed").await.unwrap(), 1);
        assert_eq!(gateway.zcard("llmchat:queue:dlq:dlq").await.unwrap(), 1);
        let stored = store.load("chat", &j.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("provider down"));
    }

    #[tokio::test]
    async fn cancel_removes_from_everywhere() {
        let (store, gateway) = store();
        let j = job(JobOptions::default());
        store.create(&j).await.unwrap();

        assert!(store.cancel("chat", &j.id).await.unwrap());
        assert!(!store.cancel("chat", &j.id).await.unwrap());
        assert_eq!(
            gateway.zcard("llmchat:queue:chat:waiting").await.unwrap(),
            0
        );
        assert!(store.load("chat", &j.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn promote_moves_due_jobs_only() {
        let (store, _) = store();
        let j = job(JobOptions {
            delay_ms: 60_000,
            ..Default::default()
        });
        store.create(&j).await.unwrap();

        let promoted = store.promote_due("chat", now_ms(), 100).await.unwrap();
        assert!(promoted.is_empty());

        let promoted = store
            .promote_due("chat", now_ms() + 61_000, 100)
            .await
            .unwrap();
        assert_eq!(promoted, vec![j.id.clone()]);
        let refreshed = store.load("chat", &j.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn reset_for_retry_requires_failed_state() {
        let (store, _) = store();
        let j = job(JobOptions::default());
        store.create(&j).await.unwrap();

        // Waiting job: no-op.
        assert!(store.reset_for_retry("chat", &j.id).await.unwrap().is_none());

        let mut active = store.activate("chat", &j.id, now_ms()).await.unwrap().unwrap();
        store.fail(&mut active, "boom".into(), 10).await.unwrap();

        let reset = store.reset_for_retry("chat", &j.id).await.unwrap().unwrap();
        assert_eq!(reset.state, JobState::Waiting);
        assert_eq!(reset.attempts_made, 0);
        assert!(reset.last_error.is_none());
    }

    #[tokio::test]
    async fn stalled_requeue_increments_counter() {
        let (store, _) = store();
        let j = job(JobOptions::default());
        store.create(&j).await.unwrap();
        let mut active = store.activate("chat", &j.id, 1000).await.unwrap().unwrap();

        let candidates = store.stalled_candidates("chat", 2000).await.unwrap();
        assert_eq!(candidates, vec![j.id.clone()]);

        store.requeue_stalled(&mut active).await.unwrap();
        let refreshed = store.load("chat", &j.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, JobState::Waiting);
        assert_eq!(refreshed.stalled_count, 1);
    }

    #[tokio::test]
    async fn drain_clears_all_queue_keys() {
        let (store, gateway) = store();
        let j = job(JobOptions::default());
        store.create(&j).await.unwrap();

        store.drain("chat").await.unwrap();
        let counts = store.counts("chat").await.unwrap();
        assert_eq!(counts.total(), 0);
        assert_eq!(gateway.hlen("llmchat:queue:chat:jobs").await.unwrap(), 0);
    }
}
