//! End-to-end scenarios against the in-memory gateway: priority ordering,
//! delay promotion, retry backoff, dead-lettering, claim exclusivity,
//! stalled recovery and breaker behavior.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use llmchat_queue::queue::{ProcessContext, Processor, WorkerPool};
use llmchat_queue::{
    BackoffSpec, CircuitBreaker, CircuitBreakerConfig, Job, JobOptions, JobState, MemoryGateway,
    Metrics, QueueConfig, QueueError, QueueEventKind, QueueManager,
};

async fn test_manager(config: QueueConfig) -> Arc<QueueManager> {
    let manager = QueueManager::new(
        Arc::new(MemoryGateway::new()),
        "llmchat:queue",
        Metrics::new().unwrap(),
    );
    manager.register_queue(config).await.unwrap();
    manager
}

fn fast_queue(name: &str) -> QueueConfig {
    QueueConfig {
        concurrency: 1,
        poll_interval_ms: 10,
        promote_interval_ms: 20,
        ..QueueConfig::named(name)
    }
}

struct OrderRecorder {
    order: Mutex<Vec<String>>,
}

#[async_trait]
impl Processor for OrderRecorder {
    async fn process(&self, job: &Job, _ctx: &ProcessContext) -> Result<Value, QueueError> {
        self.order.lock().await.push(job.id.clone());
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn s1_priority_ordering_with_fifo_ties() -> Result<()> {
    let manager = test_manager(fast_queue("chat")).await;

    let opts = |priority| JobOptions {
        priority,
        ..Default::default()
    };
    let j1 = manager
        .enqueue("chat", "completion", json!(1), Some(opts(5)))
        .await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let j2 = manager
        .enqueue("chat", "completion", json!(2), Some(opts(10)))
        .await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let j3 = manager
        .enqueue("chat", "completion", json!(3), Some(opts(5)))
        .await?;

    let processor = Arc::new(OrderRecorder {
        order: Mutex::new(Vec::new()),
    });
    let pool = WorkerPool::new(manager.clone(), "chat", processor.clone());
    pool.start().await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    pool.shutdown(Duration::from_millis(500)).await;

    let order = processor.order.lock().await.clone();
    assert_eq!(order, vec![j2, j1, j3]);
    Ok(())
}

#[tokio::test]
async fn s2_delayed_job_is_promoted_then_claimed() -> Result<()> {
    let manager = test_manager(fast_queue("chat")).await;
    let processor = Arc::new(OrderRecorder {
        order: Mutex::new(Vec::new()),
    });
    let pool = WorkerPool::new(manager.clone(), "chat", processor.clone());
    pool.start().await?;

    manager
        .enqueue(
            "chat",
            "completion",
            Value::Null,
            Some(JobOptions {
                delay_ms: 200,
                ..Default::default()
            }),
        )
        .await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = manager.stats("chat").await?;
    assert_eq!(stats.counts.waiting, 0, "job visible before its delay");
    assert_eq!(stats.counts.delayed + stats.counts.active + stats.counts.completed, 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    pool.shutdown(Duration::from_millis(500)).await;

    let stats = manager.stats("chat").await?;
    assert_eq!(stats.counts.completed, 1);
    assert_eq!(processor.order.lock().await.len(), 1);
    Ok(())
}

struct FlakyProcessor {
    failures_left: AtomicU32,
    attempt_times: Mutex<Vec<Instant>>,
}

#[async_trait]
impl Processor for FlakyProcessor {
    async fn process(&self, _job: &Job, _ctx: &ProcessContext) -> Result<Value, QueueError> {
        self.attempt_times.lock().await.push(Instant::now());
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            Err(QueueError::backend("provider 500"))
        } else {
            Ok(json!("finally"))
        }
    }
}

#[tokio::test]
async fn s3_retry_with_exponential_backoff_then_success() -> Result<()> {
    let manager = test_manager(fast_queue("chat")).await;
    let processor = Arc::new(FlakyProcessor {
        failures_left: AtomicU32::new(2),
        attempt_times: Mutex::new(Vec::new()),
    });
    let pool = WorkerPool::new(manager.clone(), "chat", processor.clone());
    pool.start().await?;

    let id = manager
        .enqueue(
            "chat",
            "completion",
            Value::Null,
            Some(JobOptions {
                max_attempts: 3,
                backoff: BackoffSpec::Exponential {
                    base_ms: 100,
                    factor: 2.0,
                    cap_ms: 1000,
                },
                ..Default::default()
            }),
        )
        .await?;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    pool.shutdown(Duration::from_millis(500)).await;

    let record = manager.job("chat", &id).await?.unwrap();
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.attempts_made, 3);
    assert_eq!(record.return_value, Some(json!("finally")));

    let times = processor.attempt_times.lock().await.clone();
    assert_eq!(times.len(), 3);
    // Delays follow ~100ms then ~200ms with +-20% jitter, plus promotion
    // granularity on top.
    let gap1 = times[1].duration_since(times[0]);
    let gap2 = times[2].duration_since(times[1]);
    assert!(gap1 >= Duration::from_millis(70), "gap1 was {:?}", gap1);
    assert!(gap1 <= Duration::from_millis(350), "gap1 was {:?}", gap1);
    assert!(gap2 >= Duration::from_millis(140), "gap2 was {:?}", gap2);
    assert!(gap2 <= Duration::from_millis(550), "gap2 was {:?}", gap2);
    Ok(())
}

struct AlwaysFails;

#[async_trait]
impl Processor for AlwaysFails {
    async fn process(&self, _job: &Job, _ctx: &ProcessContext) -> Result<Value, QueueError> {
        Err(QueueError::backend("permanently broken"))
    }
}

#[tokio::test]
async fn s4_exhausted_retries_land_in_dead_letter_queue() -> Result<()> {
    let manager = test_manager(fast_queue("chat")).await;
    let pool = WorkerPool::new(manager.clone(), "chat", Arc::new(AlwaysFails));
    pool.start().await?;

    let id = manager
        .enqueue(
            "chat",
            "completion",
            Value::Null,
            Some(JobOptions {
                max_attempts: 2,
                backoff: BackoffSpec::Fixed { base_ms: 30 },
                dead_letter_queue: Some("dlq".into()),
                ..Default::default()
            }),
        )
        .await?;

    tokio::time::sleep(Duration::from_millis(600)).await;
    pool.shutdown(Duration::from_millis(500)).await;

    let record = manager.job("chat", &id).await?.unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempts_made, 2);
    assert_eq!(record.last_error.as_deref(), Some("backend error: permanently broken"));
    assert_eq!(manager.dead_letter_count("dlq").await?, 1);
    Ok(())
}

#[tokio::test]
async fn parallel_workers_claim_each_job_exactly_once() -> Result<()> {
    let manager = test_manager(QueueConfig {
        concurrency: 8,
        ..fast_queue("chat")
    })
    .await;

    const JOBS: usize = 50;
    for _ in 0..JOBS {
        manager
            .enqueue("chat", "completion", Value::Null, None)
            .await?;
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match manager.claim_next("chat").await.unwrap() {
                    Some(job) => claimed.push(job.id),
                    None => {
                        if manager.stats("chat").await.unwrap().counts.waiting == 0 {
                            break;
                        }
                    }
                }
            }
            claimed
        }));
    }

    let mut all: Vec<String> = Vec::new();
    for handle in handles {
        all.extend(handle.await?);
    }
    assert_eq!(all.len(), JOBS, "total claims must equal jobs");
    all.sort();
    all.dedup();
    assert_eq!(all.len(), JOBS, "no job may be claimed twice");
    Ok(())
}

#[tokio::test]
async fn stalled_jobs_are_recovered_then_fail_permanently() -> Result<()> {
    let manager = test_manager(QueueConfig {
        stalled_interval_ms: 80,
        max_stalled_count: 1,
        ..fast_queue("chat")
    })
    .await;

    let id = manager
        .enqueue("chat", "completion", Value::Null, None)
        .await?;

    // Simulate a worker that claimed and died.
    let job = manager.claim_next("chat").await?.unwrap();
    assert_eq!(job.id, id);
    assert_eq!(manager.stats("chat").await?.stalled, 0);
    tokio::time::sleep(Duration::from_millis(120)).await;

    // The overdue claim shows up in the stats before recovery runs.
    assert_eq!(manager.stats("chat").await?.stalled, 1);

    let recovered = manager.recover_stalled("chat").await?;
    assert_eq!(recovered, 1);
    assert_eq!(manager.stats("chat").await?.stalled, 0);
    let record = manager.job("chat", &id).await?.unwrap();
    assert_eq!(record.state, JobState::Waiting);
    assert_eq!(record.stalled_count, 1);

    // Second death exceeds max_stalled_count: permanent failure.
    manager.claim_next("chat").await?.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    let recovered = manager.recover_stalled("chat").await?;
    assert_eq!(recovered, 0);
    let record = manager.job("chat", &id).await?.unwrap();
    assert_eq!(record.state, JobState::Failed);
    Ok(())
}

#[tokio::test]
async fn lifecycle_events_reach_subscribers() -> Result<()> {
    let manager = test_manager(fast_queue("chat")).await;
    let mut events = manager.subscribe_events("chat").await?;

    manager
        .enqueue("chat", "completion", Value::Null, None)
        .await?;
    manager.pause("chat").await?;
    manager.resume("chat").await?;

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await?
            .expect("event stream closed early");
        kinds.push(event.kind);
    }
    assert_eq!(
        kinds,
        vec![
            QueueEventKind::JobAdded,
            QueueEventKind::QueuePaused,
            QueueEventKind::QueueResumed
        ]
    );
    Ok(())
}

#[tokio::test]
async fn s5_circuit_breaker_opens_probes_and_closes() -> Result<()> {
    let breaker = CircuitBreaker::new(
        "llm-provider",
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_ms: 1000,
            reset_timeout_ms: 500,
        },
    );

    for _ in 0..3 {
        let _ = breaker
            .call(|| async { Err::<(), _>(QueueError::backend("down")) })
            .await;
    }

    // Fourth call fails fast without invoking the operation.
    let invoked = Arc::new(AtomicU32::new(0));
    let marker = invoked.clone();
    let err = breaker
        .call(move || async move {
            marker.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::CircuitOpen(_)));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(550)).await;

    // One probe is permitted; success_threshold successes close the breaker.
    breaker.call(|| async { Ok::<_, QueueError>(()) }).await?;
    breaker.call(|| async { Ok::<_, QueueError>(()) }).await?;
    assert_eq!(
        breaker.state().await,
        llmchat_queue::resilience::CircuitState::Closed
    );
    Ok(())
}

#[tokio::test]
async fn clean_completed_uses_score_ranges() -> Result<()> {
    let manager = test_manager(fast_queue("chat")).await;
    let runtime = manager.queue("chat").await?;

    for _ in 0..3 {
        manager
            .enqueue("chat", "completion", Value::Null, None)
            .await?;
        let job = manager.claim_next("chat").await?.unwrap();
        manager.settle(&runtime, job, Ok(Value::Null), 1).await?;
    }
    assert_eq!(manager.stats("chat").await?.counts.completed, 3);

    // Nothing is old enough yet.
    assert_eq!(manager.clean_completed("chat", 60_000, 100).await?, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let removed = manager.clean_completed("chat", 10, 100).await?;
    assert_eq!(removed, 3);
    assert_eq!(manager.stats("chat").await?.counts.completed, 0);
    Ok(())
}
