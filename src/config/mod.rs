use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::adaptive_ttl::AdaptiveTtlConfig;
use crate::cache::tiered::CacheConfig;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::rate_limiter::RateLimiterConfig;
use crate::resilience::retry::BackoffSpec;
use crate::utils::errors::{QueueError, QueueResult};
use crate::utils::health::HealthPolicy;

pub const MAX_PRIORITY: u8 = 20;

/// Top-level configuration record. Unknown fields are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoreConfig {
    pub redis: RedisConfig,
    pub queues: Vec<QueueConfig>,
    pub cache: CacheConfig,
    pub adaptive_ttl: AdaptiveTtlConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub health: HealthPolicy,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub db: i64,
    pub key_prefix: String,
    pub pool_min: usize,
    pub pool_max: usize,
    pub acquire_timeout_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            key_prefix: "llmchat:queue".to_string(),
            pool_min: 1,
            pool_max: 16,
            acquire_timeout_ms: 5000,
            command_timeout_ms: 5000,
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.host.is_empty() {
            return Err(QueueError::validation("redis host is empty"));
        }
        if self.key_prefix.is_empty() {
            return Err(QueueError::validation("redis key prefix is empty"));
        }
        if self.pool_max == 0 || self.pool_min > self.pool_max {
            return Err(QueueError::validation(
                "redis pool bounds must satisfy 0 < pool_min <= pool_max",
            ));
        }
        if self.acquire_timeout_ms == 0 || self.command_timeout_ms == 0 {
            return Err(QueueError::validation("redis timeouts must be positive"));
        }
        Ok(())
    }
}

/// Per-queue configuration (§6 recognized options).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueueConfig {
    pub name: String,
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff: BackoffSpec,
    pub stalled_interval_ms: u64,
    pub max_stalled_count: u32,
    pub default_priority: u8,
    pub remove_on_complete_count: u64,
    pub remove_on_fail_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_queue: Option<String>,
    /// Worker tick between claim attempts.
    pub poll_interval_ms: u64,
    /// Cadence of the delayed-promotion task.
    pub promote_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            concurrency: 4,
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff: BackoffSpec::default(),
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
            default_priority: 10,
            remove_on_complete_count: 100,
            remove_on_fail_count: 500,
            dead_letter_queue: None,
            poll_interval_ms: 100,
            promote_interval_ms: 1000,
        }
    }
}

impl QueueConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Attempts a job may make by default: the first run plus retries.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.name.is_empty() {
            return Err(QueueError::validation("queue name is empty"));
        }
        if self.concurrency == 0 {
            return Err(QueueError::validation("queue concurrency must be >= 1"));
        }
        if self.default_priority > MAX_PRIORITY {
            return Err(QueueError::validation(format!(
                "default priority {} exceeds {}",
                self.default_priority, MAX_PRIORITY
            )));
        }
        if self.stalled_interval_ms == 0 {
            return Err(QueueError::validation("stalled interval must be positive"));
        }
        if self.poll_interval_ms == 0 || self.promote_interval_ms == 0 {
            return Err(QueueError::validation("worker intervals must be positive"));
        }
        self.backoff.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MonitoringConfig {
    pub health_check_port: u16,
    pub enable_metrics_server: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check_port: 8080,
            enable_metrics_server: true,
        }
    }
}

impl CoreConfig {
    /// Loads from a TOML file when present, otherwise starts from defaults.
    /// Environment variables override the Redis section either way.
    pub fn load(path: &Path) -> QueueResult<Self> {
        let mut config = if path.exists() {
            info!("loading configuration from {}", path.display());
            let content = fs::read_to_string(path)
                .map_err(|e| QueueError::validation(format!("cannot read config: {}", e)))?;
            toml::from_str(&content)
                .map_err(|e| QueueError::validation(format!("cannot parse config: {}", e)))?
        } else {
            warn!("config file {} not found, using defaults", path.display());
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    fn load_from_env(&mut self) {
        if let Ok(host) = std::env::var("LLMCHAT_REDIS_HOST") {
            self.redis.host = host;
        }
        if let Ok(port) = std::env::var("LLMCHAT_REDIS_PORT") {
            if let Ok(port) = port.parse() {
                self.redis.port = port;
            }
        }
        if let Ok(password) = std::env::var("LLMCHAT_REDIS_PASSWORD") {
            if !password.is_empty() {
                self.redis.password = Some(password);
            }
        }
        if let Ok(db) = std::env::var("LLMCHAT_REDIS_DB") {
            if let Ok(db) = db.parse() {
                self.redis.db = db;
            }
        }
        if let Ok(prefix) = std::env::var("LLMCHAT_KEY_PREFIX") {
            if !prefix.is_empty() {
                self.redis.key_prefix = prefix;
            }
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        self.redis.validate()?;
        self.cache.validate()?;
        self.adaptive_ttl.validate()?;
        self.circuit_breaker.validate()?;
        self.rate_limiter.validate()?;
        for queue in &self.queues {
            queue.validate()?;
        }
        Ok(())
    }
}
