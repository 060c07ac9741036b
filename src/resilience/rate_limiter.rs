use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::utils::errors::{QueueError, QueueResult};

/// Token bucket parameters, applied per caller-defined key
/// (agent id, user id, ip, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimiterConfig {
    /// Bucket size in tokens.
    pub capacity: u32,
    /// Refill rate in tokens per second.
    pub refill_per_second: f64,
    /// Prefix for limiter keys on the Redis backend.
    pub key_prefix: String,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            refill_per_second: 30.0,
            key_prefix: "llmchat:queue:ratelimit".to_string(),
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> QueueResult<()> {
        if self.capacity == 0 {
            return Err(QueueError::validation("rate limiter capacity must be > 0"));
        }
        if self.refill_per_second <= 0.0 {
            return Err(QueueError::validation("refill rate must be positive"));
        }
        Ok(())
    }
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    RetryAfter(Duration),
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allow)
    }
}

/// Counters exposed for telemetry.
#[derive(Debug, Clone, Default)]
pub struct RateLimiterMetrics {
    pub allowed: u64,
    pub throttled: u64,
    pub throttled_by_key: HashMap<String, u64>,
}

/// Storage backend for bucket state.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn try_acquire(
        &self,
        key: &str,
        tokens: u32,
        capacity: u32,
        refill_per_second: f64,
    ) -> QueueResult<RateDecision>;
}

/// In-memory backend for tests and single-process deployments.
pub struct MemoryRateLimitBackend {
    buckets: RwLock<HashMap<String, (f64, Instant)>>,
}

impl MemoryRateLimitBackend {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRateLimitBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitBackend for MemoryRateLimitBackend {
    async fn try_acquire(
        &self,
        key: &str,
        tokens: u32,
        capacity: u32,
        refill_per_second: f64,
    ) -> QueueResult<RateDecision> {
        let mut buckets = self.buckets.write().await;
        let now = Instant::now();
        let entry = buckets
            .entry(key.to_string())
            .or_insert((capacity as f64, now));

        let elapsed = now.duration_since(entry.1).as_secs_f64();
        let refilled = (entry.0 + elapsed * refill_per_second).min(capacity as f64);
        let wanted = tokens as f64;

        if refilled >= wanted {
            *entry = (refilled - wanted, now);
            debug!("rate limit allow for {} ({:.2} tokens left)", key, entry.0);
            Ok(RateDecision::Allow)
        } else {
            *entry = (refilled, now);
            let wait = (wanted - refilled) / refill_per_second;
            Ok(RateDecision::RetryAfter(Duration::from_millis(
                (wait * 1000.0).ceil() as u64,
            )))
        }
    }
}

/// Redis-backed token bucket; the bucket update is a single Lua script so
/// parallel callers across instances stay consistent.
pub struct RedisRateLimitBackend {
    connection: ConnectionManager,
    script: redis::Script,
}

const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_per_sec = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now_ms = tonumber(ARGV[4])

local bucket = redis.call('HMGET', key, 'tokens', 'last_refill_ms')
local tokens = tonumber(bucket[1])
local last_refill = tonumber(bucket[2])
if tokens == nil then tokens = capacity end
if last_refill == nil then last_refill = now_ms end

local elapsed = math.max(0, now_ms - last_refill)
tokens = math.min(capacity, tokens + (elapsed / 1000.0) * refill_per_sec)

local allowed = 0
local retry_after_ms = 0
if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
else
    retry_after_ms = math.ceil(((requested - tokens) / refill_per_sec) * 1000)
end

redis.call('HMSET', key, 'tokens', tokens, 'last_refill_ms', now_ms)
redis.call('PEXPIRE', key, 3600000)
return {allowed, retry_after_ms}
"#;

impl RedisRateLimitBackend {
    pub async fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::backend(format!("invalid redis url: {}", e)))?;
        let connection = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| QueueError::backend(format!("redis connect failed: {}", e)))?;
        Ok(Self {
            connection,
            script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }
}

#[async_trait]
impl RateLimitBackend for RedisRateLimitBackend {
    #[instrument(skip(self))]
    async fn try_acquire(
        &self,
        key: &str,
        tokens: u32,
        capacity: u32,
        refill_per_second: f64,
    ) -> QueueResult<RateDecision> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| QueueError::internal(format!("clock error: {}", e)))?
            .as_millis() as u64;

        let mut conn = self.connection.clone();
        let (allowed, retry_after_ms): (i64, i64) = self
            .script
            .key(key)
            .arg(capacity)
            .arg(refill_per_second)
            .arg(tokens)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::from)?;

        if allowed == 1 {
            Ok(RateDecision::Allow)
        } else {
            Ok(RateDecision::RetryAfter(Duration::from_millis(
                retry_after_ms.max(1) as u64,
            )))
        }
    }
}

/// Per-key token bucket limiter. The bucket is the canonical enforcement
/// path; see [`SlidingWindow`] for accounting-only counts.
pub struct RateLimiter {
    config: RateLimiterConfig,
    backend: Arc<dyn RateLimitBackend>,
    metrics: RwLock<RateLimiterMetrics>,
}

impl RateLimiter {
    pub fn new_in_memory(config: RateLimiterConfig) -> Self {
        Self {
            config,
            backend: Arc::new(MemoryRateLimitBackend::new()),
            metrics: RwLock::new(RateLimiterMetrics::default()),
        }
    }

    pub async fn new_with_redis(config: RateLimiterConfig, redis_url: &str) -> QueueResult<Self> {
        let backend = Arc::new(RedisRateLimitBackend::new(redis_url).await?);
        Ok(Self {
            config,
            backend,
            metrics: RwLock::new(RateLimiterMetrics::default()),
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub async fn acquire(&self, key: &str) -> QueueResult<RateDecision> {
        self.acquire_n(key, 1).await
    }

    #[instrument(skip(self))]
    pub async fn acquire_n(&self, key: &str, tokens: u32) -> QueueResult<RateDecision> {
        let namespaced = format!("{}:{}", self.config.key_prefix, key);
        let decision = self
            .backend
            .try_acquire(
                &namespaced,
                tokens,
                self.config.capacity,
                self.config.refill_per_second,
            )
            .await?;

        let mut metrics = self.metrics.write().await;
        match decision {
            RateDecision::Allow => metrics.allowed += 1,
            RateDecision::RetryAfter(wait) => {
                metrics.throttled += 1;
                *metrics
                    .throttled_by_key
                    .entry(key.to_string())
                    .or_insert(0) += 1;
                warn!("rate limited key {} for {:?}", key, wait);
            }
        }
        Ok(decision)
    }

    /// Acquire that maps a denial to `ResourceExhausted` for callers that
    /// want an error instead of a decision.
    pub async fn check(&self, key: &str) -> QueueResult<()> {
        match self.acquire(key).await? {
            RateDecision::Allow => Ok(()),
            RateDecision::RetryAfter(wait) => Err(QueueError::ResourceExhausted(format!(
                "rate limit on {} (retry in {}ms)",
                key,
                wait.as_millis()
            ))),
        }
    }

    pub async fn metrics(&self) -> RateLimiterMetrics {
        self.metrics.read().await.clone()
    }
}

/// Accounting-only sliding window; never consulted to admit or reject work.
pub struct SlidingWindow {
    window: Duration,
    events: RwLock<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: RwLock::new(HashMap::new()),
        }
    }

    pub async fn observe(&self, key: &str) {
        let mut events = self.events.write().await;
        let deque = events.entry(key.to_string()).or_default();
        let now = Instant::now();
        deque.push_back(now);
        while let Some(front) = deque.front() {
            if now.duration_since(*front) > self.window {
                deque.pop_front();
            } else {
                break;
            }
        }
    }

    pub async fn count(&self, key: &str) -> u64 {
        let mut events = self.events.write().await;
        let now = Instant::now();
        match events.get_mut(key) {
            Some(deque) => {
                while let Some(front) = deque.front() {
                    if now.duration_since(*front) > self.window {
                        deque.pop_front();
                    } else {
                        break;
                    }
                }
                deque.len() as u64
            }
            None => 0,
        }
    }
}
