//! Hit-rate driven TTL adaptation. A rolling window of hit/miss outcomes
//! nudges the effective TTL up when the namespace is hot and down when
//! entries go stale unused, bounded by `[min, max]` and rate-limited by
//! `adjust_interval_ms`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::utils::errors::{QueueError, QueueResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AdaptiveTtlConfig {
    pub initial_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub step_ms: u64,
    pub sample_size: usize,
    pub adjust_interval_ms: u64,
    /// Hit-rate above which the TTL steps up.
    pub high_watermark: f64,
    /// Hit-rate below which the TTL steps down.
    pub low_watermark: f64,
}

impl Default for AdaptiveTtlConfig {
    fn default() -> Self {
        Self {
            initial_ms: 60_000,
            min_ms: 5_000,
            max_ms: 600_000,
            step_ms: 15_000,
            sample_size: 100,
            adjust_interval_ms: 10_000,
            high_watermark: 0.8,
            low_watermark: 0.3,
        }
    }
}

impl AdaptiveTtlConfig {
    pub fn validate(&self) -> QueueResult<()> {
        if self.min_ms == 0 || self.min_ms > self.max_ms {
            return Err(QueueError::validation(
                "adaptive ttl bounds must satisfy 0 < min <= max",
            ));
        }
        if self.initial_ms < self.min_ms || self.initial_ms > self.max_ms {
            return Err(QueueError::validation("initial ttl outside [min, max]"));
        }
        if self.sample_size == 0 {
            return Err(QueueError::validation("sample size must be positive"));
        }
        if !(0.0..=1.0).contains(&self.low_watermark)
            || !(0.0..=1.0).contains(&self.high_watermark)
            || self.low_watermark >= self.high_watermark
        {
            return Err(QueueError::validation(
                "watermarks must satisfy 0 <= low < high <= 1",
            ));
        }
        Ok(())
    }
}

struct ControllerInner {
    window: VecDeque<bool>,
    current_ttl_ms: u64,
    last_adjust: Instant,
    adjustments: u64,
}

pub struct AdaptiveTtlController {
    config: AdaptiveTtlConfig,
    inner: Mutex<ControllerInner>,
}

impl AdaptiveTtlController {
    pub fn new(config: AdaptiveTtlConfig) -> Self {
        let current_ttl_ms = config.initial_ms;
        Self {
            config,
            inner: Mutex::new(ControllerInner {
                window: VecDeque::new(),
                current_ttl_ms,
                last_adjust: Instant::now(),
                adjustments: 0,
            }),
        }
    }

    /// Records one lookup outcome and possibly adjusts the TTL.
    pub fn record(&self, hit: bool) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.window.push_back(hit);
        while inner.window.len() > self.config.sample_size {
            inner.window.pop_front();
        }
        self.maybe_adjust(&mut inner);
    }

    fn maybe_adjust(&self, inner: &mut ControllerInner) {
        if inner.window.len() < self.config.sample_size {
            return;
        }
        if inner.last_adjust.elapsed() < Duration::from_millis(self.config.adjust_interval_ms) {
            return;
        }

        let hits = inner.window.iter().filter(|h| **h).count();
        let rate = hits as f64 / inner.window.len() as f64;
        let before = inner.current_ttl_ms;

        if rate > self.config.high_watermark {
            inner.current_ttl_ms =
                (inner.current_ttl_ms + self.config.step_ms).min(self.config.max_ms);
        } else if rate < self.config.low_watermark {
            inner.current_ttl_ms = inner
                .current_ttl_ms
                .saturating_sub(self.config.step_ms)
                .max(self.config.min_ms);
        }

        if inner.current_ttl_ms != before {
            inner.adjustments += 1;
            debug!(
                "adaptive ttl {} -> {}ms (hit rate {:.2})",
                before, inner.current_ttl_ms, rate
            );
        }
        inner.last_adjust = Instant::now();
    }

    pub fn current_ttl(&self) -> Duration {
        let ttl_ms = self
            .inner
            .lock()
            .map(|inner| inner.current_ttl_ms)
            .unwrap_or(self.config.initial_ms);
        Duration::from_millis(ttl_ms)
    }

    pub fn adjustment_count(&self) -> u64 {
        self.inner.lock().map(|inner| inner.adjustments).unwrap_or(0)
    }
}
