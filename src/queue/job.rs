use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::MAX_PRIORITY;
use crate::resilience::retry::BackoffSpec;
use crate::utils::errors::{QueueError, QueueResult};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A job is in exactly one of these states at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling options attached at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// 0 is the most urgent, 20 the least.
    pub priority: u8,
    pub max_attempts: u32,
    pub backoff: BackoffSpec,
    pub delay_ms: u64,
    /// Drop the record immediately on completion instead of retaining it.
    pub remove_on_complete: bool,
    /// Same for permanent failure.
    pub remove_on_fail: bool,
    pub dead_letter_queue: Option<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 10,
            max_attempts: 3,
            backoff: BackoffSpec::default(),
            delay_ms: 0,
            remove_on_complete: false,
            remove_on_fail: false,
            dead_letter_queue: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

impl JobOptions {
    pub fn validate(&self) -> QueueResult<()> {
        if self.priority > MAX_PRIORITY {
            return Err(QueueError::validation(format!(
                "priority {} exceeds {}",
                self.priority, MAX_PRIORITY
            )));
        }
        if self.max_attempts == 0 {
            return Err(QueueError::validation("max_attempts must be >= 1"));
        }
        self.backoff.validate()
    }
}

/// The persisted job record, serialized into the `jobs` hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub opts: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    pub stalled_count: u32,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_on: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_on: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
}

impl Job {
    pub fn new(queue: &str, job_type: &str, payload: Value, opts: JobOptions) -> Self {
        let created_at = now_ms();
        let delayed = opts.delay_ms > 0;
        Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            job_type: job_type.to_string(),
            scheduled_at: delayed.then(|| created_at + opts.delay_ms as i64),
            state: if delayed {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            payload,
            opts,
            attempts_made: 0,
            stalled_count: 0,
            created_at,
            processed_on: None,
            finished_on: None,
            failed_at: None,
            last_error: None,
            return_value: None,
        }
    }

    /// Epoch-ms before which a delayed job must not run.
    pub fn not_before(&self) -> i64 {
        self.scheduled_at
            .unwrap_or(self.created_at + self.opts.delay_ms as i64)
    }

    pub fn to_json(&self) -> QueueResult<String> {
        serde_json::to_string(self).map_err(QueueError::from)
    }

    pub fn from_json(raw: &str) -> QueueResult<Self> {
        serde_json::from_str(raw).map_err(QueueError::from)
    }
}

/// Lightweight per-state envelope kept in `<queue>:<state>:meta`, small
/// enough for dashboards to scan without loading full records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    pub job_type: String,
    pub priority: u8,
    pub state: JobState,
    pub attempts_made: u32,
    pub updated_at: i64,
}

impl JobEnvelope {
    pub fn of(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            job_type: job.job_type.clone(),
            priority: job.opts.priority,
            state: job.state,
            attempts_made: job.attempts_made,
            updated_at: now_ms(),
        }
    }

    pub fn to_json(&self) -> QueueResult<String> {
        serde_json::to_string(self).map_err(QueueError::from)
    }
}
