//! The queue subsystem: job records, priority/delay scheduling, lifecycle
//! transitions, the producer-facing manager and the worker pool.

pub mod events;
pub mod job;
pub mod lifecycle;
pub mod manager;
pub mod scheduler;
pub mod worker;

pub use events::{EventPublisher, QueueEvent, QueueEventKind};
pub use job::{Job, JobEnvelope, JobOptions, JobState};
pub use lifecycle::{LifecycleStore, StateCounts};
pub use manager::{BatchItemError, BatchResult, NewJob, QueueManager, QueueRuntime, QueueStats};
pub use scheduler::{priority_score, SchedulerStore, PRIORITY_WEIGHT};
pub use worker::{Middleware, ProcessContext, Processor, WorkerPool};
