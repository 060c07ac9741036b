pub mod errors;
pub mod health;
pub mod logger;
pub mod monitoring;

pub use errors::{QueueError, QueueResult};
pub use health::{HealthChecker, HealthPolicy, HealthReport, HealthServer};
pub use logger::setup_logging;
pub use monitoring::Metrics;
