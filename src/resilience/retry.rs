use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::utils::errors::{QueueError, QueueResult};

/// Caller-provided pure backoff function, registered by name on the manager.
pub type CustomBackoffFn = dyn Fn(u32) -> Duration + Send + Sync;

/// Backoff schedule carried in job options. `attempt` starts at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffSpec {
    Fixed { base_ms: u64 },
    Linear { base_ms: u64 },
    Exponential { base_ms: u64, factor: f64, cap_ms: u64 },
    Custom { name: String },
}

impl Default for BackoffSpec {
    fn default() -> Self {
        BackoffSpec::Exponential {
            base_ms: 1000,
            factor: 2.0,
            cap_ms: 30_000,
        }
    }
}

impl BackoffSpec {
    pub fn validate(&self) -> QueueResult<()> {
        match self {
            BackoffSpec::Fixed { base_ms } | BackoffSpec::Linear { base_ms } => {
                if *base_ms == 0 {
                    return Err(QueueError::validation("backoff base must be positive"));
                }
            }
            BackoffSpec::Exponential {
                base_ms,
                factor,
                cap_ms,
            } => {
                if *base_ms == 0 {
                    return Err(QueueError::validation("backoff base must be positive"));
                }
                if *factor < 1.0 {
                    return Err(QueueError::validation("backoff factor must be >= 1"));
                }
                if *cap_ms < *base_ms {
                    return Err(QueueError::validation("backoff cap must be >= base"));
                }
            }
            BackoffSpec::Custom { name } => {
                if name.is_empty() {
                    return Err(QueueError::validation("custom backoff name is empty"));
                }
            }
        }
        Ok(())
    }
}

/// Computes retry delays with bounded jitter to avoid thundering herds.
#[derive(Clone)]
pub struct RetryPolicy {
    spec: BackoffSpec,
    jitter: f64,
    custom: Option<Arc<CustomBackoffFn>>,
}

impl RetryPolicy {
    pub fn new(spec: BackoffSpec) -> Self {
        Self {
            spec,
            jitter: 0.2,
            custom: None,
        }
    }

    /// Jitter fraction applied symmetrically; 0.0 disables it.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_custom(mut self, custom: Arc<CustomBackoffFn>) -> Self {
        self.custom = Some(custom);
        self
    }

    /// Delay before the given attempt, `attempt >= 1`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match &self.spec {
            BackoffSpec::Fixed { base_ms } => Duration::from_millis(*base_ms),
            BackoffSpec::Linear { base_ms } => {
                Duration::from_millis(base_ms.saturating_mul(attempt as u64))
            }
            BackoffSpec::Exponential {
                base_ms,
                factor,
                cap_ms,
            } => {
                let exp = (*base_ms as f64) * factor.powi(attempt as i32 - 1);
                Duration::from_millis((exp as u64).min(*cap_ms))
            }
            BackoffSpec::Custom { .. } => match &self.custom {
                Some(f) => f(attempt),
                // Unregistered custom functions are rejected at enqueue; a
                // second guard here keeps the worker loop alive regardless.
                None => Duration::from_millis(1000),
            },
        };
        self.add_jitter(raw)
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        let factor = rng.gen_range(-self.jitter..=self.jitter);
        let jittered = delay.as_millis() as f64 * (1.0 + factor);
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}
