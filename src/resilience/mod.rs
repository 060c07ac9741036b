//! Protection for outbound calls: circuit breakers, rate limiting and retry
//! backoff. Invoked by user processors and by the queue's own operations.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
};
pub use rate_limiter::{
    MemoryRateLimitBackend, RateDecision, RateLimitBackend, RateLimiter, RateLimiterConfig,
    RateLimiterMetrics, RedisRateLimitBackend, SlidingWindow,
};
pub use retry::{BackoffSpec, CustomBackoffFn, RetryPolicy};
