//! Bounded worker pool per queue: a claim loop per logical worker, a
//! delayed-promotion task and a stalled-recovery task, all coordinated
//! through shared Redis state so multiple instances cooperate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};

use super::job::Job;
use super::manager::{QueueManager, QueueRuntime};
use crate::utils::errors::{QueueError, QueueResult};

/// Handed to processors; the shutdown signal must be observed at I/O
/// boundaries.
#[derive(Clone)]
pub struct ProcessContext {
    shutdown: watch::Receiver<bool>,
}

impl ProcessContext {
    fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves when shutdown is signalled; race long I/O against this.
    pub async fn cancelled(&self) {
        let mut shutdown = self.shutdown.clone();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}

/// User-supplied job handler.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, job: &Job, ctx: &ProcessContext) -> Result<Value, QueueError>;
}

/// Hooks around the processor. A `before_process` error short-circuits to
/// the failure path; `after_process` always runs.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn before_process(&self, _job: &Job) -> QueueResult<()> {
        Ok(())
    }

    async fn after_process(&self, _job: &Job, _outcome: &Result<Value, QueueError>) {}
}

pub struct WorkerPool {
    manager: Arc<QueueManager>,
    queue: String,
    processor: Arc<dyn Processor>,
    middleware: Vec<Arc<dyn Middleware>>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl WorkerPool {
    pub fn new(manager: Arc<QueueManager>, queue: &str, processor: Arc<dyn Processor>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            manager,
            queue: queue.to_string(),
            processor,
            middleware: Vec::new(),
            shutdown,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Spawns `concurrency` workers plus the promotion and stalled tasks.
    pub async fn start(&self) -> QueueResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("worker pool for {} already running", self.queue);
            return Ok(());
        }
        let runtime = self.manager.queue(&self.queue).await?;
        let concurrency = runtime.config.concurrency;
        info!("starting {} workers for {}", concurrency, self.queue);

        let mut handles = self.handles.lock().await;
        for worker_id in 0..concurrency {
            handles.push(tokio::spawn(Self::worker_loop(
                worker_id,
                self.manager.clone(),
                runtime.clone(),
                self.queue.clone(),
                self.processor.clone(),
                self.middleware.clone(),
                self.shutdown.subscribe(),
            )));
        }
        handles.push(tokio::spawn(Self::promoter_loop(
            self.manager.clone(),
            self.queue.clone(),
            Duration::from_millis(runtime.config.promote_interval_ms),
            self.shutdown.subscribe(),
        )));
        handles.push(tokio::spawn(Self::stalled_loop(
            self.manager.clone(),
            self.queue.clone(),
            Duration::from_millis(runtime.config.stalled_interval_ms),
            self.shutdown.subscribe(),
        )));
        Ok(())
    }

    async fn worker_loop(
        worker_id: usize,
        manager: Arc<QueueManager>,
        runtime: Arc<QueueRuntime>,
        queue: String,
        processor: Arc<dyn Processor>,
        middleware: Vec<Arc<dyn Middleware>>,
        shutdown: watch::Receiver<bool>,
    ) {
        debug!("worker {} for {} started", worker_id, queue);
        let tick = Duration::from_millis(runtime.config.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                break;
            }
            if runtime.is_paused() || runtime.processing_count() >= runtime.config.concurrency {
                sleep(tick).await;
                continue;
            }

            let job = match manager.claim_next(&queue).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    sleep(tick).await;
                    continue;
                }
                Err(e) if e.is_retryable() => {
                    warn!("worker {} claim failed on {}: {}", worker_id, queue, e);
                    sleep(tick).await;
                    continue;
                }
                Err(e) => {
                    error!("worker {} stopping on {}: {}", worker_id, queue, e);
                    break;
                }
            };

            runtime.begin_processing();
            manager
                .metrics()
                .active_workers
                .with_label_values(&[&queue])
                .inc();

            let ctx = ProcessContext::new(shutdown.clone());
            let started = Instant::now();

            let mut short_circuit = None;
            for mw in &middleware {
                if let Err(e) = mw.before_process(&job).await {
                    short_circuit = Some(e);
                    break;
                }
            }
            let outcome = match short_circuit {
                Some(e) => Err(e),
                None => processor.process(&job, &ctx).await,
            };
            for mw in &middleware {
                mw.after_process(&job, &outcome).await;
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            if let Err(e) = manager.settle(&runtime, job, outcome, elapsed_ms).await {
                // The job stays in `active` and will be recovered as stalled.
                error!("worker {} failed to settle job on {}: {}", worker_id, queue, e);
            }

            manager
                .metrics()
                .active_workers
                .with_label_values(&[&queue])
                .dec();
            runtime.end_processing();
        }
        debug!("worker {} for {} stopped", worker_id, queue);
    }

    async fn promoter_loop(
        manager: Arc<QueueManager>,
        queue: String,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = manager.promote_due(&queue).await {
                        warn!("delayed promotion failed on {}: {}", queue, e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn stalled_loop(
        manager: Arc<QueueManager>,
        queue: String,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(every);
        // The first tick fires immediately; skip it so fresh claims are not
        // mistaken for stalled jobs.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match manager.recover_stalled(&queue).await {
                        Ok(0) => {}
                        Ok(n) => info!("recovered {} stalled jobs on {}", n, queue),
                        Err(e) => warn!("stalled recovery failed on {}: {}", queue, e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Graceful shutdown: workers stop claiming immediately, in-flight
    /// processors get `drain` to finish, anything unfinished stays in
    /// `active` for the next instance's stalled recovery.
    pub async fn shutdown(&self, drain: Duration) {
        info!("shutting down worker pool for {}", self.queue);
        self.shutdown.send_replace(true);

        let mut handles = self.handles.lock().await;
        let deadline = Instant::now() + drain;
        for handle in handles.drain(..) {
            let abort = handle.abort_handle();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, handle).await.is_err() {
                warn!("drain window elapsed for {}, leaving job in active", self.queue);
                abort.abort();
            }
        }
        // Reset the signal so a later start() spawns live workers.
        self.shutdown.send_replace(false);
        self.started.store(false, Ordering::SeqCst);
    }
}
