//! Prometheus metrics for the queue core. One registry owns every counter,
//! histogram and gauge; the health server exports it in text format.

use std::sync::Arc;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::utils::errors::{QueueError, QueueResult};

pub struct Metrics {
    registry: Registry,

    pub jobs_enqueued: IntCounterVec,
    pub jobs_completed: IntCounterVec,
    pub jobs_failed: IntCounterVec,
    pub jobs_retried: IntCounterVec,
    pub jobs_stalled: IntCounterVec,
    pub processing_seconds: HistogramVec,
    pub active_workers: IntGaugeVec,
    pub queue_depth: IntGaugeVec,

    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_sets: IntCounter,
    pub cache_deletes: IntCounter,
    pub cache_evictions: IntCounter,

    pub breaker_opens: IntCounterVec,
    pub rate_limited: IntCounter,
}

impl Metrics {
    pub fn new() -> QueueResult<Arc<Self>> {
        let registry = Registry::new();

        let jobs_enqueued = IntCounterVec::new(
            Opts::new("llmchat_jobs_enqueued_total", "Jobs accepted for processing"),
            &["queue"],
        )
        .map_err(|e| QueueError::internal(e.to_string()))?;
        let jobs_completed = IntCounterVec::new(
            Opts::new("llmchat_jobs_completed_total", "Jobs finished successfully"),
            &["queue"],
        )
        .map_err(|e| QueueError::internal(e.to_string()))?;
        let jobs_failed = IntCounterVec::new(
            Opts::new("llmchat_jobs_failed_total", "Jobs failed permanently"),
            &["queue"],
        )
        .map_err(|e| QueueError::internal(e.to_string()))?;
        let jobs_retried = IntCounterVec::new(
            Opts::new("llmchat_jobs_retried_total", "Jobs rescheduled for retry"),
            &["queue"],
        )
        .map_err(|e| QueueError::internal(e.to_string()))?;
        let jobs_stalled = IntCounterVec::new(
            Opts::new("llmchat_jobs_stalled_total", "Jobs recovered as stalled"),
            &["queue"],
        )
        .map_err(|e| QueueError::internal(e.to_string()))?;
        let processing_seconds = HistogramVec::new(
            HistogramOpts::new(
                "llmchat_job_processing_seconds",
                "Wall time spent in the processor",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
            &["queue"],
        )
        .map_err(|e| QueueError::internal(e.to_string()))?;
        let active_workers = IntGaugeVec::new(
            Opts::new("llmchat_active_workers", "Workers currently processing"),
            &["queue"],
        )
        .map_err(|e| QueueError::internal(e.to_string()))?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("llmchat_queue_depth", "Jobs waiting to be claimed"),
            &["queue"],
        )
        .map_err(|e| QueueError::internal(e.to_string()))?;

        let cache_hits = IntCounter::new("llmchat_cache_hits_total", "Cache hits across tiers")
            .map_err(|e| QueueError::internal(e.to_string()))?;
        let cache_misses = IntCounter::new("llmchat_cache_misses_total", "Cache misses")
            .map_err(|e| QueueError::internal(e.to_string()))?;
        let cache_sets = IntCounter::new("llmchat_cache_sets_total", "Cache writes")
            .map_err(|e| QueueError::internal(e.to_string()))?;
        let cache_deletes = IntCounter::new("llmchat_cache_deletes_total", "Cache removals")
            .map_err(|e| QueueError::internal(e.to_string()))?;
        let cache_evictions = IntCounter::new("llmchat_cache_evictions_total", "L1 evictions")
            .map_err(|e| QueueError::internal(e.to_string()))?;

        let breaker_opens = IntCounterVec::new(
            Opts::new("llmchat_breaker_opens_total", "Circuit breaker open transitions"),
            &["target"],
        )
        .map_err(|e| QueueError::internal(e.to_string()))?;
        let rate_limited = IntCounter::new("llmchat_rate_limited_total", "Requests throttled")
            .map_err(|e| QueueError::internal(e.to_string()))?;

        for collector in [
            Box::new(jobs_enqueued.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(jobs_completed.clone()),
            Box::new(jobs_failed.clone()),
            Box::new(jobs_retried.clone()),
            Box::new(jobs_stalled.clone()),
            Box::new(processing_seconds.clone()),
            Box::new(active_workers.clone()),
            Box::new(queue_depth.clone()),
            Box::new(cache_hits.clone()),
            Box::new(cache_misses.clone()),
            Box::new(cache_sets.clone()),
            Box::new(cache_deletes.clone()),
            Box::new(cache_evictions.clone()),
            Box::new(breaker_opens.clone()),
            Box::new(rate_limited.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| QueueError::internal(e.to_string()))?;
        }

        Ok(Arc::new(Self {
            registry,
            jobs_enqueued,
            jobs_completed,
            jobs_failed,
            jobs_retried,
            jobs_stalled,
            processing_seconds,
            active_workers,
            queue_depth,
            cache_hits,
            cache_misses,
            cache_sets,
            cache_deletes,
            cache_evictions,
            breaker_opens,
            rate_limited,
        }))
    }

    /// Prometheus text exposition of every registered metric.
    pub fn export(&self) -> QueueResult<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| QueueError::internal(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| QueueError::internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_export() {
        let metrics = Metrics::new().unwrap();
        metrics.jobs_enqueued.with_label_values(&["chat"]).inc();
        metrics.cache_hits.inc();
        metrics
            .processing_seconds
            .with_label_values(&["chat"])
            .observe(0.2);

        let text = metrics.export().unwrap();
        assert!(text.contains("llmchat_jobs_enqueued_total"));
        assert!(text.contains("llmchat_cache_hits_total 1"));
        assert!(text.contains("llmchat_job_processing_seconds"));
    }

    #[test]
    fn registry_accepts_all_collectors_once() {
        // Two independent instances must not clash; each owns its registry.
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.rate_limited.inc();
        assert!(b.export().unwrap().contains("llmchat_rate_limited_total 0"));
    }
}
