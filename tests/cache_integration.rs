//! Cache scenarios: single-flight coalescing, tag invalidation across
//! tiers, and adaptive TTL reacting to hit rates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};

use llmchat_queue::cache::{
    AdaptiveTtlConfig, AdaptiveTtlController, CacheConfig, SetOptions, TieredCache,
};
use llmchat_queue::{KeyCodec, MemoryGateway};

fn build_cache(config: CacheConfig) -> Arc<TieredCache> {
    Arc::new(
        TieredCache::new(
            config,
            Arc::new(MemoryGateway::new()),
            KeyCodec::new("llmchat:queue"),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn s6_single_flight_then_tag_invalidation() -> Result<()> {
    let cache = build_cache(CacheConfig {
        avalanche_jitter: 0.0,
        ..Default::default()
    });
    let loader_calls = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let cache = cache.clone();
        let loader_calls = loader_calls.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_set(
                    "k",
                    || async move {
                        loader_calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(json!({"model": "glm-4", "tokens": 512}))
                    },
                    SetOptions::with_tags(&["t"]),
                )
                .await
                .unwrap()
        }));
    }

    let mut values = Vec::new();
    for handle in handles {
        values.push(handle.await?);
    }
    assert_eq!(loader_calls.load(Ordering::SeqCst), 1, "loader ran once");
    assert!(values.iter().all(|v| v == &values[0]), "all callers share it");

    let invalidated = cache.invalidate_by_tag("t").await?;
    assert_eq!(invalidated, 1);
    assert_eq!(cache.get("k").await?, None);
    Ok(())
}

#[tokio::test]
async fn invalidation_leaves_unrelated_tags_alone() -> Result<()> {
    let cache = build_cache(CacheConfig {
        avalanche_jitter: 0.0,
        ..Default::default()
    });
    cache
        .set("a", json!(1), SetOptions::with_tags(&["users", "hot"]))
        .await?;
    cache
        .set("b", json!(2), SetOptions::with_tags(&["users"]))
        .await?;
    cache
        .set("c", json!(3), SetOptions::with_tags(&["sessions"]))
        .await?;

    assert_eq!(cache.invalidate_by_tag("users").await?, 2);
    assert_eq!(cache.get("a").await?, None);
    assert_eq!(cache.get("b").await?, None);
    assert_eq!(cache.get("c").await?, Some(json!(3)));
    Ok(())
}

#[tokio::test]
async fn sequential_misses_after_guard_expiry_reload() -> Result<()> {
    let cache = build_cache(CacheConfig {
        null_guard_ttl_ms: 40,
        avalanche_jitter: 0.0,
        ..Default::default()
    });
    let loader_calls = Arc::new(AtomicU64::new(0));

    for _ in 0..2 {
        let loader_calls = loader_calls.clone();
        let value = cache
            .get_or_set(
                "missing",
                || async move {
                    loader_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                },
                SetOptions::default(),
            )
            .await?;
        assert_eq!(value, Value::Null);
    }
    assert_eq!(loader_calls.load(Ordering::SeqCst), 1);

    // After the guard window the loader is consulted again.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let loader_calls_after = loader_calls.clone();
    cache
        .get_or_set(
            "missing",
            || async move {
                loader_calls_after.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            },
            SetOptions::default(),
        )
        .await?;
    assert_eq!(loader_calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn adaptive_ttl_reacts_to_hit_rate() -> Result<()> {
    let controller = Arc::new(AdaptiveTtlController::new(AdaptiveTtlConfig {
        initial_ms: 1000,
        min_ms: 500,
        max_ms: 4000,
        step_ms: 500,
        sample_size: 20,
        adjust_interval_ms: 0,
        high_watermark: 0.8,
        low_watermark: 0.3,
    }));
    let cache = Arc::new(
        TieredCache::new(
            CacheConfig {
                avalanche_jitter: 0.0,
                ..Default::default()
            },
            Arc::new(MemoryGateway::new()),
            KeyCodec::new("llmchat:queue"),
        )
        .unwrap()
        .with_adaptive_ttl(controller.clone()),
    );

    cache.set("hot", json!(1), SetOptions::default()).await?;
    for _ in 0..40 {
        assert!(cache.get("hot").await?.is_some());
    }
    assert!(controller.current_ttl() > Duration::from_millis(1000));

    for i in 0..60 {
        let _ = cache.get(&format!("cold-{}", i)).await?;
    }
    assert!(controller.current_ttl() < Duration::from_millis(4000));
    Ok(())
}

#[tokio::test]
async fn loader_errors_propagate_and_next_caller_retries() -> Result<()> {
    let cache = build_cache(CacheConfig {
        avalanche_jitter: 0.0,
        ..Default::default()
    });

    let err = cache
        .get_or_set(
            "fragile",
            || async { Err(llmchat_queue::QueueError::backend("upstream down")) },
            SetOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, llmchat_queue::QueueError::Backend(_)));

    // The failure was not cached; the next caller gets a fresh attempt.
    let value = cache
        .get_or_set(
            "fragile",
            || async { Ok(json!("recovered")) },
            SetOptions::default(),
        )
        .await?;
    assert_eq!(value, json!("recovered"));
    Ok(())
}
