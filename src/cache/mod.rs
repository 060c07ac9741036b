//! Adaptive caching for outbound provider calls: a bounded in-process tier
//! in front of Redis, tag invalidation, single-flight fills and hit-rate
//! driven TTLs.

pub mod adaptive_ttl;
pub mod compress;
pub mod tiered;

pub use adaptive_ttl::{AdaptiveTtlConfig, AdaptiveTtlController};
pub use compress::{CompressionCodec, CompressionMetrics};
pub use tiered::{CacheConfig, CacheLevel, CacheStats, SetOptions, TieredCache};
