use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::utils::errors::{QueueError, QueueResult};

/// Circuit breaker configuration, one per outbound target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// Per-call timeout; a timer win counts as a failure.
    pub timeout_ms: u64,
    /// How long the breaker stays open before the first probe.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 10_000,
            reset_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> QueueResult<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(QueueError::validation(
                "breaker thresholds must be positive",
            ));
        }
        if self.timeout_ms == 0 || self.reset_timeout_ms == 0 {
            return Err(QueueError::validation("breaker timeouts must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    total_requests: u64,
    total_failures: u64,
    total_timeouts: u64,
    open_count: u64,
    avg_latency_ms: f64,
    last_state_change: DateTime<Utc>,
}

/// Read-only metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub target: String,
    pub state: CircuitState,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_timeouts: u64,
    pub open_count: u64,
    pub avg_latency_ms: f64,
    pub last_state_change: DateTime<Utc>,
}

/// Per-target CLOSED/OPEN/HALF_OPEN state machine.
///
/// While open, calls fail fast with `CircuitOpen`. Once `reset_timeout`
/// elapses the first call is always permitted and probes the target.
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                total_requests: 0,
                total_failures: 0,
                total_timeouts: 0,
                open_count: 0,
                avg_latency_ms: 0.0,
                last_state_change: Utc::now(),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Runs `op` under the breaker, racing it against the per-call timeout.
    #[instrument(skip(self, op), fields(target = %self.target))]
    pub async fn call<T, F, Fut>(&self, op: F) -> QueueResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        self.admit().await?;

        let per_call = Duration::from_millis(self.config.timeout_ms);
        let started = Instant::now();
        match timeout(per_call, op()).await {
            Ok(Ok(value)) => {
                self.record_success(started.elapsed()).await;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure(started.elapsed(), false).await;
                Err(err)
            }
            Err(_) => {
                self.record_failure(per_call, true).await;
                Err(QueueError::Timeout(per_call))
            }
        }
    }

    /// Fails fast while open; transitions to half-open once the reset
    /// timeout has elapsed so the caller's request becomes the probe.
    async fn admit(&self) -> QueueResult<()> {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let reset = Duration::from_millis(self.config.reset_timeout_ms);
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= reset {
                    debug!("breaker {} half-open, probing", self.target);
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.last_state_change = Utc::now();
                    Ok(())
                } else {
                    Err(QueueError::CircuitOpen(self.target.clone()))
                }
            }
        }
    }

    async fn record_success(&self, latency: Duration) {
        let mut inner = self.inner.write().await;
        inner.total_requests += 1;
        inner.consecutive_failures = 0;
        Self::fold_latency(&mut inner, latency);

        if inner.state == CircuitState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                debug!(
                    "breaker {} closed after {} probe successes",
                    self.target, inner.consecutive_successes
                );
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                inner.last_state_change = Utc::now();
            }
        }
    }

    async fn record_failure(&self, latency: Duration, timed_out: bool) {
        let mut inner = self.inner.write().await;
        inner.total_requests += 1;
        inner.total_failures += 1;
        if timed_out {
            inner.total_timeouts += 1;
        }
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        Self::fold_latency(&mut inner, latency);

        let trip = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            warn!(
                "breaker {} opened after {} consecutive failures",
                self.target, inner.consecutive_failures
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.open_count += 1;
            inner.last_state_change = Utc::now();
        }
    }

    fn fold_latency(inner: &mut BreakerInner, latency: Duration) {
        let ms = latency.as_millis() as f64;
        if inner.total_requests <= 1 {
            inner.avg_latency_ms = ms;
        } else {
            inner.avg_latency_ms = 0.9 * inner.avg_latency_ms + 0.1 * ms;
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.read().await;
        CircuitBreakerStats {
            target: self.target.clone(),
            state: inner.state,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            total_timeouts: inner.total_timeouts,
            open_count: inner.open_count,
            avg_latency_ms: inner.avg_latency_ms,
            last_state_change: inner.last_state_change,
        }
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.opened_at = None;
        inner.last_state_change = Utc::now();
    }
}

/// Hands out one shared breaker per outbound target.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(target) {
                return breaker.clone();
            }
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(target, self.default_config.clone()))
            })
            .clone()
    }

    pub async fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers = self.breakers.read().await;
        let mut out = Vec::with_capacity(breakers.len());
        for breaker in breakers.values() {
            out.push(breaker.stats().await);
        }
        out
    }
}
