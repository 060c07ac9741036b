//! Redis access layer: namespaced key layout plus the command surface the
//! stores consume. Everything the core reads or writes goes through the
//! [`Gateway`] trait so tests can substitute the in-memory backend.

pub mod memory_backend;
pub mod redis_backend;

pub use memory_backend::MemoryGateway;
pub use redis_backend::RedisGateway;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::utils::errors::QueueResult;

/// Builds every Redis key the core touches. Key shapes live here and
/// nowhere else.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches(':').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn queue_key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, suffix)
    }

    /// Sorted set of ready jobs, scored by priority score.
    pub fn waiting(&self, queue: &str) -> String {
        self.queue_key(queue, "waiting")
    }

    /// Sorted set of claimed jobs, scored by claim timestamp.
    pub fn active(&self, queue: &str) -> String {
        self.queue_key(queue, "active")
    }

    /// Sorted set of delayed jobs, scored by not-before epoch-ms.
    pub fn delayed(&self, queue: &str) -> String {
        self.queue_key(queue, "delayed")
    }

    /// Bounded sorted set of retained completed jobs, scored by finish time.
    pub fn completed(&self, queue: &str) -> String {
        self.queue_key(queue, "completed")
    }

    /// Bounded sorted set of retained failed jobs, scored by failure time.
    pub fn failed(&self, queue: &str) -> String {
        self.queue_key(queue, "failed")
    }

    /// Hash of job id to serialized job record.
    pub fn jobs(&self, queue: &str) -> String {
        self.queue_key(queue, "jobs")
    }

    /// Hash of job id to lightweight envelope, one per state.
    pub fn state_meta(&self, queue: &str, state: &str) -> String {
        self.queue_key(queue, &format!("{}:meta", state))
    }

    /// Hash carrying the pause flag and dynamic config.
    pub fn queue_config(&self, queue: &str) -> String {
        self.queue_key(queue, "config")
    }

    /// Pub/sub channel for lifecycle events.
    pub fn events_channel(&self, queue: &str) -> String {
        self.queue_key(queue, "events")
    }

    /// Sorted set receiving jobs that exhausted retries.
    pub fn dead_letter(&self, name: &str) -> String {
        format!("{}:{}:dlq", self.prefix, name)
    }

    pub fn cache_entry(&self, key: &str) -> String {
        format!("{}:cache:entry:{}", self.prefix, key)
    }

    pub fn cache_tag(&self, tag: &str) -> String {
        format!("{}:cache:tag:{}", self.prefix, tag)
    }
}

/// One mutation inside an atomic pipeline.
#[derive(Debug, Clone)]
pub enum Op {
    ZAdd { key: String, member: String, score: f64 },
    ZRem { key: String, member: String },
    ZRemRangeByScore { key: String, min: f64, max: f64 },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    Del { key: String },
}

/// Command surface of the storage backend.
///
/// Scores are f64 to match Redis sorted-set semantics. `pipeline` executes
/// its operations atomically: MULTI/EXEC against Redis, a single lock on the
/// in-memory backend, so subscribers and concurrent readers never observe a
/// partial transition.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> QueueResult<()>;

    /// Returns the number of members actually removed. A claim loop treats
    /// zero as losing the race.
    async fn zrem(&self, key: &str, members: &[String]) -> QueueResult<u64>;

    async fn zcard(&self, key: &str) -> QueueResult<u64>;

    async fn zscore(&self, key: &str, member: &str) -> QueueResult<Option<f64>>;

    /// Ascending range by rank, inclusive, with scores. `stop == -1` means
    /// the end of the set.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> QueueResult<Vec<(String, f64)>>;

    /// Ascending range by score, inclusive on both ends, at most `limit`
    /// members (`0` means no limit).
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> QueueResult<Vec<(String, f64)>>;

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> QueueResult<u64>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> QueueResult<()>;

    async fn hget(&self, key: &str, field: &str) -> QueueResult<Option<String>>;

    async fn hdel(&self, key: &str, fields: &[String]) -> QueueResult<u64>;

    async fn hlen(&self, key: &str) -> QueueResult<u64>;

    /// Plain value with optional TTL, used by the cache L2 tier.
    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> QueueResult<()>;

    async fn get_bytes(&self, key: &str) -> QueueResult<Option<Vec<u8>>>;

    async fn sadd(&self, key: &str, member: &str) -> QueueResult<()>;

    async fn srem(&self, key: &str, member: &str) -> QueueResult<u64>;

    async fn smembers(&self, key: &str) -> QueueResult<Vec<String>>;

    async fn del(&self, keys: &[String]) -> QueueResult<u64>;

    async fn pipeline(&self, ops: Vec<Op>) -> QueueResult<()>;

    async fn publish(&self, channel: &str, payload: &str) -> QueueResult<()>;

    /// Subscription as a pull-based stream; dropping the receiver cancels it.
    async fn subscribe(&self, channel: &str) -> QueueResult<mpsc::Receiver<String>>;

    /// Round-trip latency probe used by health checks.
    async fn ping(&self) -> QueueResult<Duration>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> KeyCodec {
        KeyCodec::new("llmchat:queue")
    }

    #[test]
    fn queue_state_keys() {
        let c = codec();
        assert_eq!(c.waiting("chat"), "llmchat:queue:chat:waiting");
        assert_eq!(c.active("chat"), "llmchat:queue:chat:active");
        assert_eq!(c.delayed("chat"), "llmchat:queue:chat:delayed");
        assert_eq!(c.completed("chat"), "llmchat:queue:chat:completed");
        assert_eq!(c.failed("chat"), "llmchat:queue:chat:failed");
    }

    #[test]
    fn record_and_meta_keys() {
        let c = codec();
        assert_eq!(c.jobs("chat"), "llmchat:queue:chat:jobs");
        assert_eq!(c.state_meta("chat", "waiting"), "llmchat:queue:chat:waiting:meta");
        assert_eq!(c.state_meta("chat", "failed"), "llmchat:queue:chat:failed:meta");
        assert_eq!(c.queue_config("chat"), "llmchat:queue:chat:config");
    }

    #[test]
    fn events_and_dead_letter_keys() {
        let c = codec();
        assert_eq!(c.events_channel("chat"), "llmchat:queue:chat:events");
        assert_eq!(c.dead_letter("dlq"), "llmchat:queue:dlq:dlq");
    }

    #[test]
    fn cache_keys() {
        let c = codec();
        assert_eq!(c.cache_entry("user:42"), "llmchat:queue:cache:entry:user:42");
        assert_eq!(c.cache_tag("session"), "llmchat:queue:cache:tag:session");
    }

    #[test]
    fn trailing_colon_is_normalized() {
        let c = KeyCodec::new("llmchat:queue:");
        assert_eq!(c.waiting("q"), "llmchat:queue:q:waiting");
        assert_eq!(c.prefix(), "llmchat:queue");
    }
}
