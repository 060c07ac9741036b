//! Health aggregation and the HTTP surface for probes and metrics.
//!
//! The checker observes the queue manager through its public statistics; the
//! observed components know nothing about the monitor.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::Filter;

use crate::gateway::Gateway;
use crate::queue::manager::QueueManager;
use crate::queue::lifecycle::StateCounts;
use crate::utils::errors::QueueResult;
use crate::utils::monitoring::Metrics;

/// Thresholds a healthy queue must stay under.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthPolicy {
    pub max_queue_size: u64,
    pub max_avg_processing_ms: f64,
    pub max_error_rate: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_avg_processing_ms: 60_000.0,
            max_error_rate: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RedisHealth {
    pub connected: bool,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub healthy: bool,
    pub counts: StateCounts,
    pub processing: usize,
    pub paused: bool,
    pub stalled: u64,
    pub avg_processing_ms: f64,
    pub error_rate: f64,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: HashMap<String, bool>,
    pub queues: HashMap<String, QueueHealth>,
    pub redis: RedisHealth,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct HealthChecker {
    manager: Arc<QueueManager>,
    gateway: Arc<dyn Gateway>,
    policy: HealthPolicy,
}

impl HealthChecker {
    pub fn new(manager: Arc<QueueManager>, gateway: Arc<dyn Gateway>, policy: HealthPolicy) -> Self {
        Self {
            manager,
            gateway,
            policy,
        }
    }

    pub async fn check(&self) -> HealthReport {
        let mut components = HashMap::new();
        let mut queues = HashMap::new();
        let mut issues = Vec::new();

        let redis = match self.gateway.ping().await {
            Ok(latency) => RedisHealth {
                connected: true,
                latency_ms: Some(latency.as_millis() as u64),
            },
            Err(e) => {
                issues.push(format!("redis unreachable: {}", e));
                RedisHealth {
                    connected: false,
                    latency_ms: None,
                }
            }
        };
        components.insert("redis".to_string(), redis.connected);

        for name in self.manager.queue_names().await {
            let mut queue_issues = Vec::new();

            let config_valid = match self.manager.queue(&name).await {
                Ok(runtime) => match runtime.config.validate() {
                    Ok(()) => true,
                    Err(e) => {
                        queue_issues.push(format!("invalid config: {}", e));
                        false
                    }
                },
                Err(_) => false,
            };

            match self.manager.stats(&name).await {
                Ok(stats) => {
                    if stats.counts.waiting > self.policy.max_queue_size {
                        queue_issues.push(format!(
                            "backlog {} exceeds cap {}",
                            stats.counts.waiting, self.policy.max_queue_size
                        ));
                    }
                    if stats.avg_processing_ms > self.policy.max_avg_processing_ms {
                        queue_issues.push(format!(
                            "avg processing {:.0}ms exceeds cap {:.0}ms",
                            stats.avg_processing_ms, self.policy.max_avg_processing_ms
                        ));
                    }
                    if stats.error_rate > self.policy.max_error_rate {
                        queue_issues.push(format!(
                            "error rate {:.2} exceeds cap {:.2}",
                            stats.error_rate, self.policy.max_error_rate
                        ));
                    }

                    if stats.stalled > 0 {
                        queue_issues.push(format!("{} stalled jobs awaiting recovery", stats.stalled));
                    }

                    let healthy = config_valid && queue_issues.is_empty();
                    components.insert(format!("queue:{}", name), healthy);
                    issues.extend(queue_issues.iter().map(|i| format!("{}: {}", name, i)));
                    queues.insert(
                        name.clone(),
                        QueueHealth {
                            healthy,
                            counts: stats.counts,
                            processing: stats.processing,
                            paused: stats.paused,
                            stalled: stats.stalled,
                            avg_processing_ms: stats.avg_processing_ms,
                            error_rate: stats.error_rate,
                            issues: queue_issues,
                        },
                    );
                }
                Err(e) => {
                    components.insert(format!("queue:{}", name), false);
                    issues.push(format!("{}: stats unavailable: {}", name, e));
                }
            }
        }

        let healthy = components.values().all(|ok| *ok);
        if !healthy {
            warn!("health check degraded: {:?}", issues);
        }
        HealthReport {
            healthy,
            components,
            queues,
            redis,
            issues,
            timestamp: Utc::now(),
        }
    }
}

/// Serves `/health`, `/ready` and `/metrics`.
pub struct HealthServer {
    checker: Arc<HealthChecker>,
    metrics: Arc<Metrics>,
    port: u16,
}

impl HealthServer {
    pub fn new(checker: Arc<HealthChecker>, metrics: Arc<Metrics>, port: u16) -> Self {
        Self {
            checker,
            metrics,
            port,
        }
    }

    pub async fn start(self) -> QueueResult<()> {
        info!("starting health server on port {}", self.port);

        let checker = self.checker.clone();
        let health = warp::path("health")
            .and(warp::get())
            .and_then(move || {
                let checker = checker.clone();
                async move {
                    let report = checker.check().await;
                    let status = if report.healthy {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, warp::Rejection>(warp::reply::with_status(
                        warp::reply::json(&report),
                        status,
                    ))
                }
            });

        let ready = warp::path("ready")
            .and(warp::get())
            .map(|| warp::reply::with_status("OK", StatusCode::OK));

        let metrics = self.metrics.clone();
        let metrics_route = warp::path("metrics")
            .and(warp::get())
            .and_then(move || {
                let metrics = metrics.clone();
                async move {
                    match metrics.export() {
                        Ok(text) => {
                            Ok::<_, warp::Rejection>(warp::reply::with_status(text, StatusCode::OK))
                        }
                        Err(e) => {
                            warn!("metrics export failed: {}", e);
                            Ok(warp::reply::with_status(
                                String::new(),
                                StatusCode::INTERNAL_SERVER_ERROR,
                            ))
                        }
                    }
                }
            });

        let routes = health.or(ready).or(metrics_route);
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::gateway::MemoryGateway;

    async fn checker(policy: HealthPolicy) -> (Arc<QueueManager>, HealthChecker) {
        let gateway: Arc<MemoryGateway> = Arc::new(MemoryGateway::new());
        let manager = QueueManager::new(gateway.clone(), "llmchat:queue", Metrics::new().unwrap());
        manager
            .register_queue(QueueConfig::named("chat"))
            .await
            .unwrap();
        let checker = HealthChecker::new(manager.clone(), gateway, policy);
        (manager, checker)
    }

    #[tokio::test]
    async fn empty_system_is_healthy() {
        let (_, checker) = checker(HealthPolicy::default()).await;
        let report = checker.check().await;
        assert!(report.healthy);
        assert!(report.redis.connected);
        assert_eq!(report.components.get("queue:chat"), Some(&true));
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn backlog_over_cap_degrades_queue() {
        let (manager, checker) = checker(HealthPolicy {
            max_queue_size: 2,
            ..Default::default()
        })
        .await;
        for _ in 0..5 {
            manager
                .enqueue("chat", "completion", serde_json::Value::Null, None)
                .await
                .unwrap();
        }

        let report = checker.check().await;
        assert!(!report.healthy);
        assert_eq!(report.components.get("queue:chat"), Some(&false));
        assert!(!report.queues["chat"].healthy);
        assert!(report.issues.iter().any(|i| i.contains("backlog")));
    }

    #[tokio::test]
    async fn stalled_jobs_surface_in_the_report() {
        let gateway: Arc<MemoryGateway> = Arc::new(MemoryGateway::new());
        let manager = QueueManager::new(gateway.clone(), "llmchat:queue", Metrics::new().unwrap());
        manager
            .register_queue(QueueConfig {
                stalled_interval_ms: 50,
                ..QueueConfig::named("chat")
            })
            .await
            .unwrap();
        let checker = HealthChecker::new(manager.clone(), gateway, HealthPolicy::default());

        // A claimed job whose worker never settles it goes stalled.
        manager
            .enqueue("chat", "completion", serde_json::Value::Null, None)
            .await
            .unwrap();
        manager.claim_next("chat").await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        let report = checker.check().await;
        assert_eq!(report.queues["chat"].stalled, 1);
        assert!(!report.queues["chat"].healthy);
        assert!(report.issues.iter().any(|i| i.contains("stalled")));
    }

    #[tokio::test]
    async fn report_serializes_to_json() {
        let (_, checker) = checker(HealthPolicy::default()).await;
        let report = checker.check().await;
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["healthy"], true);
        assert!(json["redis"]["connected"].as_bool().unwrap());
        assert!(json["queues"]["chat"]["counts"]["waiting"].is_u64());
    }
}
