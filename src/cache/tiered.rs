//! Two-tier adaptive cache: a bounded in-process L1 in front of Redis L2,
//! with tag-based invalidation, single-flight fills, lazy expiry plus a
//! periodic sweeper, and guards against penetration and synchronized expiry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::adaptive_ttl::AdaptiveTtlController;
use super::compress::CompressionCodec;
use crate::gateway::{Gateway, KeyCodec};
use crate::utils::errors::{QueueError, QueueResult};
use crate::utils::monitoring::Metrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub default_ttl_ms: u64,
    pub max_l1_entries: usize,
    pub max_l1_bytes: usize,
    pub compression_threshold_bytes: usize,
    pub compression_level: u32,
    pub tags_enabled: bool,
    pub sweep_interval_ms: u64,
    /// Null results are cached this long to absorb penetration; 0 disables.
    pub null_guard_ttl_ms: u64,
    /// Fractional TTL spread so entries written together do not expire
    /// together; 0 disables.
    pub avalanche_jitter: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 60_000,
            max_l1_entries: 1000,
            max_l1_bytes: 16 * 1024 * 1024,
            compression_threshold_bytes: 4096,
            compression_level: 6,
            tags_enabled: true,
            sweep_interval_ms: 60_000,
            null_guard_ttl_ms: 5_000,
            avalanche_jitter: 0.1,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> QueueResult<()> {
        if self.default_ttl_ms == 0 {
            return Err(QueueError::validation("cache default ttl must be positive"));
        }
        if self.max_l1_entries == 0 || self.max_l1_bytes == 0 {
            return Err(QueueError::validation("cache L1 bounds must be positive"));
        }
        if !(0.0..1.0).contains(&self.avalanche_jitter) {
            return Err(QueueError::validation("avalanche jitter must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Which tier(s) a set writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheLevel {
    L1,
    L2,
    #[default]
    Both,
}

impl CacheLevel {
    fn includes_l1(&self) -> bool {
        matches!(self, CacheLevel::L1 | CacheLevel::Both)
    }

    fn includes_l2(&self) -> bool {
        matches!(self, CacheLevel::L2 | CacheLevel::Both)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub level: CacheLevel,
}

impl SetOptions {
    pub fn with_tags(tags: &[&str]) -> Self {
        Self {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct L1Entry {
    value: Value,
    size: usize,
    created_at: Instant,
    ttl: Duration,
    hit_count: u64,
    last_access: Instant,
    tags: Vec<String>,
}

impl L1Entry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }

    /// Composite eviction score: colder and larger entries score higher and
    /// go first; frequent hits push the score down.
    fn eviction_score(&self, now: Instant) -> f64 {
        let idle = now.duration_since(self.last_access).as_secs_f64() + 0.001;
        idle * (self.size as f64 + 1.0) / (self.hit_count as f64 + 1.0)
    }
}

#[derive(Default)]
struct L1State {
    entries: HashMap<String, L1Entry>,
    bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expired: u64,
    pub entries: usize,
    pub bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct TieredCache {
    config: CacheConfig,
    gateway: Arc<dyn Gateway>,
    codec: KeyCodec,
    compression: CompressionCodec,
    l1: RwLock<L1State>,
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    stats: RwLock<CacheStats>,
    ttl_controller: Option<Arc<AdaptiveTtlController>>,
    metrics: Option<Arc<Metrics>>,
}

impl TieredCache {
    pub fn new(config: CacheConfig, gateway: Arc<dyn Gateway>, codec: KeyCodec) -> QueueResult<Self> {
        config.validate()?;
        let compression = CompressionCodec::new(
            config.compression_threshold_bytes,
            config.compression_level,
        );
        Ok(Self {
            config,
            gateway,
            codec,
            compression,
            l1: RwLock::new(L1State::default()),
            flights: Mutex::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            ttl_controller: None,
            metrics: None,
        })
    }

    pub fn with_adaptive_ttl(mut self, controller: Arc<AdaptiveTtlController>) -> Self {
        self.ttl_controller = Some(controller);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawns the periodic expired-entry sweeper.
    pub fn start_sweeper(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        let every = Duration::from_millis(self.config.sweep_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let swept = cache.sweep().await;
                if swept > 0 {
                    info!("cache sweeper removed {} expired entries", swept);
                }
            }
        });
    }

    fn record_lookup(&self, hit: bool) {
        if let Some(controller) = &self.ttl_controller {
            controller.record(hit);
        }
        if let Some(metrics) = &self.metrics {
            if hit {
                metrics.cache_hits.inc();
            } else {
                metrics.cache_misses.inc();
            }
        }
    }

    fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        let base = requested
            .or_else(|| self.ttl_controller.as_ref().map(|c| c.current_ttl()))
            .unwrap_or_else(|| Duration::from_millis(self.config.default_ttl_ms));
        if self.config.avalanche_jitter == 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(0.0..self.config.avalanche_jitter);
        base + Duration::from_millis((base.as_millis() as f64 * spread) as u64)
    }

    /// L1 first, then L2 with an L1 fill on hit. Expired entries are removed
    /// lazily here.
    pub async fn get(&self, key: &str) -> QueueResult<Option<Value>> {
        {
            let mut l1 = self.l1.write().await;
            match l1.entries.get_mut(key) {
                Some(entry) if entry.is_expired() => {
                    let size = entry.size;
                    l1.entries.remove(key);
                    l1.bytes = l1.bytes.saturating_sub(size);
                    self.stats.write().await.expired += 1;
                }
                Some(entry) => {
                    entry.hit_count += 1;
                    entry.last_access = Instant::now();
                    let value = entry.value.clone();
                    drop(l1);
                    let mut stats = self.stats.write().await;
                    stats.hits += 1;
                    stats.l1_hits += 1;
                    drop(stats);
                    self.record_lookup(true);
                    return Ok(Some(value));
                }
                None => {}
            }
        }

        match self.gateway.get_bytes(&self.codec.cache_entry(key)).await? {
            Some(stored) => {
                let raw = self.compression.decode(&stored)?;
                let value: Value = serde_json::from_slice(&raw)?;
                self.fill_l1(key, value.clone(), raw.len(), Vec::new(), None)
                    .await;
                let mut stats = self.stats.write().await;
                stats.hits += 1;
                stats.l2_hits += 1;
                drop(stats);
                self.record_lookup(true);
                Ok(Some(value))
            }
            None => {
                self.stats.write().await.misses += 1;
                self.record_lookup(false);
                Ok(None)
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value, opts: SetOptions) -> QueueResult<()> {
        let serialized = serde_json::to_vec(&value)?;
        let ttl = self.effective_ttl(opts.ttl);

        if opts.level.includes_l1() {
            self.fill_l1(key, value, serialized.len(), opts.tags.clone(), Some(ttl))
                .await;
        }
        if opts.level.includes_l2() {
            let encoded = self.compression.encode(&serialized)?;
            self.gateway
                .set_bytes(&self.codec.cache_entry(key), &encoded, Some(ttl))
                .await?;
        }
        if self.config.tags_enabled {
            for tag in &opts.tags {
                self.gateway.sadd(&self.codec.cache_tag(tag), key).await?;
            }
        }

        let mut stats = self.stats.write().await;
        stats.sets += 1;
        drop(stats);
        if let Some(metrics) = &self.metrics {
            metrics.cache_sets.inc();
        }
        Ok(())
    }

    async fn fill_l1(
        &self,
        key: &str,
        value: Value,
        size: usize,
        tags: Vec<String>,
        ttl: Option<Duration>,
    ) {
        let ttl = ttl.unwrap_or_else(|| Duration::from_millis(self.config.default_ttl_ms));
        let now = Instant::now();
        let entry = L1Entry {
            value,
            size,
            created_at: now,
            ttl,
            hit_count: 0,
            last_access: now,
            tags,
        };

        let mut l1 = self.l1.write().await;
        if let Some(old) = l1.entries.insert(key.to_string(), entry) {
            l1.bytes = l1.bytes.saturating_sub(old.size);
        }
        l1.bytes += size;
        let evicted = self.evict_over_budget(&mut l1);
        drop(l1);

        if evicted > 0 {
            let mut stats = self.stats.write().await;
            stats.evictions += evicted;
            drop(stats);
            if let Some(metrics) = &self.metrics {
                metrics.cache_evictions.inc_by(evicted);
            }
        }
    }

    /// Evicts by composite score until both the entry and byte budgets hold.
    fn evict_over_budget(&self, l1: &mut L1State) -> u64 {
        let mut evicted = 0u64;
        let now = Instant::now();
        while l1.entries.len() > self.config.max_l1_entries || l1.bytes > self.config.max_l1_bytes {
            let victim = l1
                .entries
                .iter()
                .max_by(|a, b| {
                    a.1.eviction_score(now)
                        .partial_cmp(&b.1.eviction_score(now))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else {
                break;
            };
            if let Some(entry) = l1.entries.remove(&victim) {
                l1.bytes = l1.bytes.saturating_sub(entry.size);
                debug!("evicted {} from L1 (score-based)", victim);
                evicted += 1;
            }
        }
        evicted
    }

    pub async fn remove(&self, key: &str) -> QueueResult<bool> {
        let mut l1 = self.l1.write().await;
        let had_l1 = match l1.entries.remove(key) {
            Some(entry) => {
                l1.bytes = l1.bytes.saturating_sub(entry.size);
                true
            }
            None => false,
        };
        drop(l1);

        let deleted = self
            .gateway
            .del(&[self.codec.cache_entry(key)])
            .await?;

        let mut stats = self.stats.write().await;
        stats.deletes += 1;
        drop(stats);
        if let Some(metrics) = &self.metrics {
            metrics.cache_deletes.inc();
        }
        Ok(had_l1 || deleted > 0)
    }

    /// Removes every key carrying the tag from both tiers and drops the tag
    /// itself from the index. Returns the number of keys invalidated.
    pub async fn invalidate_by_tag(&self, tag: &str) -> QueueResult<u64> {
        let tag_key = self.codec.cache_tag(tag);
        let mut keys = self.gateway.smembers(&tag_key).await?;

        // Entries that only ever lived in L1 are found by their own tag list.
        {
            let l1 = self.l1.read().await;
            for (key, entry) in l1.entries.iter() {
                if entry.tags.iter().any(|t| t == tag) && !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }

        let mut l1 = self.l1.write().await;
        for key in &keys {
            if let Some(entry) = l1.entries.remove(key) {
                l1.bytes = l1.bytes.saturating_sub(entry.size);
            }
        }
        drop(l1);

        let mut to_delete: Vec<String> =
            keys.iter().map(|k| self.codec.cache_entry(k)).collect();
        to_delete.push(tag_key);
        self.gateway.del(&to_delete).await?;

        let count = keys.len() as u64;
        let mut stats = self.stats.write().await;
        stats.deletes += count;
        drop(stats);
        debug!("invalidated {} keys for tag {}", count, tag);
        Ok(count)
    }

    /// Single-flight fill: concurrent misses for one key coalesce into one
    /// loader invocation whose result everyone shares.
    pub async fn get_or_set<F, Fut>(
        &self,
        key: &str,
        loader: F,
        opts: SetOptions,
    ) -> QueueResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = QueueResult<Value>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        let flight = {
            let mut flights = self.flights.lock().await;
            flights
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;

        // Whoever held the flight before us may have filled the cache.
        if let Some(value) = self.get(key).await? {
            drop(_guard);
            self.cleanup_flight(key, &flight).await;
            return Ok(value);
        }

        let result = loader().await;
        let outcome = match result {
            Ok(value) => {
                if value.is_null() && self.config.null_guard_ttl_ms > 0 {
                    // Penetration guard: remember the absence briefly.
                    let guard_opts = SetOptions {
                        ttl: Some(Duration::from_millis(self.config.null_guard_ttl_ms)),
                        level: CacheLevel::L1,
                        tags: opts.tags,
                    };
                    self.set(key, Value::Null, guard_opts).await?;
                } else {
                    self.set(key, value.clone(), opts).await?;
                }
                Ok(value)
            }
            Err(e) => {
                warn!("cache loader for {} failed: {}", key, e);
                Err(e)
            }
        };

        drop(_guard);
        self.cleanup_flight(key, &flight).await;
        outcome
    }

    async fn cleanup_flight(&self, key: &str, flight: &Arc<Mutex<()>>) {
        let mut flights = self.flights.lock().await;
        // Two strong references mean nobody else is waiting: ours and the map's.
        if Arc::strong_count(flight) <= 2 {
            flights.remove(key);
        }
    }

    /// Removes expired L1 entries; called by the periodic sweeper.
    pub async fn sweep(&self) -> u64 {
        let mut l1 = self.l1.write().await;
        let before = l1.entries.len();
        let mut freed = 0usize;
        l1.entries.retain(|_, entry| {
            if entry.is_expired() {
                freed += entry.size;
                false
            } else {
                true
            }
        });
        let swept = (before - l1.entries.len()) as u64;
        l1.bytes = l1.bytes.saturating_sub(freed);
        drop(l1);

        if swept > 0 {
            self.stats.write().await.expired += swept;
        }
        swept
    }

    pub async fn stats(&self) -> CacheStats {
        let mut snapshot = self.stats.read().await.clone();
        let l1 = self.l1.read().await;
        snapshot.entries = l1.entries.len();
        snapshot.bytes = l1.bytes;
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use serde_json::json;

    fn cache_with(config: CacheConfig) -> Arc<TieredCache> {
        Arc::new(
            TieredCache::new(
                config,
                Arc::new(MemoryGateway::new()),
                KeyCodec::new("llmchat:queue"),
            )
            .unwrap(),
        )
    }

    fn cache() -> Arc<TieredCache> {
        cache_with(CacheConfig {
            avalanche_jitter: 0.0,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn set_get_round_trip_and_stats() {
        let cache = cache();
        cache
            .set("k", json!({"answer": 42}), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(
            cache.get("k").await.unwrap(),
            Some(json!({"answer": 42}))
        );
        let stats = cache.stats().await;
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.hit_rate(), 1.0);
    }

    #[tokio::test]
    async fn l2_hit_fills_l1() {
        let cache = cache();
        cache
            .set(
                "k",
                json!("warm"),
                SetOptions {
                    level: CacheLevel::L2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // First read comes from L2 and fills L1.
        assert_eq!(cache.get("k").await.unwrap(), Some(json!("warm")));
        assert_eq!(cache.stats().await.l2_hits, 1);

        // Second read is an L1 hit.
        assert_eq!(cache.get("k").await.unwrap(), Some(json!("warm")));
        assert_eq!(cache.stats().await.l1_hits, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_never_returned() {
        let cache = cache();
        cache
            .set(
                "k",
                json!(1),
                SetOptions {
                    ttl: Some(Duration::from_millis(30)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entry_budget_evicts_cold_large_entries_first() {
        let cache = cache_with(CacheConfig {
            max_l1_entries: 2,
            avalanche_jitter: 0.0,
            ..Default::default()
        });
        cache
            .set("hot", json!("a"), SetOptions {
                level: CacheLevel::L1,
                ..Default::default()
            })
            .await
            .unwrap();
        // Make "hot" popular.
        for _ in 0..5 {
            cache.get("hot").await.unwrap();
        }
        cache
            .set("cold", json!("a much larger value taking more bytes"), SetOptions {
                level: CacheLevel::L1,
                ..Default::default()
            })
            .await
            .unwrap();
        cache
            .set("new", json!("b"), SetOptions {
                level: CacheLevel::L1,
                ..Default::default()
            })
            .await
            .unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 1);
        // The popular entry survives.
        assert!(cache.get("hot").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalidate_by_tag_clears_both_tiers() {
        let cache = cache();
        cache
            .set("a", json!(1), SetOptions::with_tags(&["session"]))
            .await
            .unwrap();
        cache
            .set("b", json!(2), SetOptions::with_tags(&["session"]))
            .await
            .unwrap();
        cache
            .set("c", json!(3), SetOptions::with_tags(&["other"]))
            .await
            .unwrap();

        let invalidated = cache.invalidate_by_tag("session").await.unwrap();
        assert_eq!(invalidated, 2);
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("c").await.unwrap().is_some());

        // The tag itself is gone: a second invalidation finds nothing.
        assert_eq!(cache.invalidate_by_tag("session").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn single_flight_invokes_loader_once() {
        let cache = cache();
        let calls = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_set(
                        "shared",
                        || async move {
                            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(json!("expensive"))
                        },
                        SetOptions::default(),
                    )
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), json!("expensive"));
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn null_guard_absorbs_repeated_absent_lookups() {
        let cache = cache();
        let calls = Arc::new(std::sync::atomic::AtomicU64::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let value = cache
                .get_or_set(
                    "absent",
                    || async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(Value::Null)
                    },
                    SetOptions::default(),
                )
                .await
                .unwrap();
            assert_eq!(value, Value::Null);
        }
        // The null marker served the later lookups.
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn large_values_survive_the_compressed_path() {
        let cache = cache_with(CacheConfig {
            compression_threshold_bytes: 64,
            avalanche_jitter: 0.0,
            ..Default::default()
        });
        let big = json!({"text": "repetition breeds compression ".repeat(200)});
        cache
            .set(
                "big",
                big.clone(),
                SetOptions {
                    level: CacheLevel::L2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(cache.get("big").await.unwrap(), Some(big));
    }

    #[tokio::test]
    async fn sweeper_removes_expired_entries() {
        let cache = cache();
        cache
            .set(
                "gone",
                json!(1),
                SetOptions {
                    ttl: Some(Duration::from_millis(20)),
                    level: CacheLevel::L1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let cache = cache();
        cache.set("k", json!(1), SetOptions::default()).await.unwrap();
        assert!(cache.remove("k").await.unwrap());
        assert!(!cache.remove("k").await.unwrap());
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
