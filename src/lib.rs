pub mod cache;
pub mod config;
pub mod gateway;
pub mod queue;
pub mod resilience;
pub mod utils;

pub use cache::{AdaptiveTtlConfig, AdaptiveTtlController, CacheConfig, SetOptions, TieredCache};
pub use config::{CoreConfig, QueueConfig, RedisConfig, MAX_PRIORITY};
pub use gateway::{Gateway, KeyCodec, MemoryGateway, RedisGateway};
pub use queue::{
    Job, JobOptions, JobState, Middleware, NewJob, ProcessContext, Processor, QueueEvent,
    QueueEventKind, QueueManager, QueueStats, WorkerPool,
};
pub use resilience::{
    BackoffSpec, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, RateDecision,
    RateLimiter, RateLimiterConfig, RetryPolicy, SlidingWindow,
};
pub use utils::errors::{QueueError, QueueResult};
pub use utils::{setup_logging, HealthChecker, HealthPolicy, HealthServer, Metrics};
