//! Worker pool draining the delayed queue.
//!
//! Each worker runs as an independent async task. It claims the earliest due
//! job, hands it to the notification processor and settles the job according
//! to the outcome:
//!
//! - `Sent` / `Skipped`: acknowledged
//! - `Failed`: rescheduled with exponential backoff, dead-lettered once
//!   `max_attempts` is reached
//!
//! Claims that outlive the visibility timeout (crashed worker) are put back
//! on the queue when a worker goes idle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::ProcessError;
use crate::metrics::MetricsCollector;
use crate::notify::{NotificationProcessor, ProcessOutcome};

use super::job::{Job, JobResult, JobStatus};
use super::queue::{DelayedTaskQueue, QueueError};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How often to poll for due jobs when nothing is due.
    pub poll_interval: Duration,
    /// Base delay before a failed job is retried.
    pub retry_delay: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl From<&QueueConfig> for WorkerPoolConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            num_workers: config.num_workers,
            poll_interval: config.poll_interval,
            retry_delay: config.retry_delay,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    pub active_workers: usize,
    pub jobs_sent: u64,
    pub jobs_skipped: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Total number of settled attempts.
    pub fn total_processed(&self) -> u64 {
        self.jobs_sent + self.jobs_skipped + self.jobs_retried + self.jobs_dead_lettered
    }

    /// Percentage of attempts that did not fail.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        ((self.jobs_sent + self.jobs_skipped) as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_sent: AtomicU64,
    jobs_skipped: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_sent: AtomicU64::new(0),
            jobs_skipped: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_dead_lettered: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, status: JobStatus, duration: Duration) {
        let counter = match status {
            JobStatus::Sent => &self.jobs_sent,
            JobStatus::Skipped => &self.jobs_skipped,
            JobStatus::Retrying => &self.jobs_retried,
            JobStatus::DeadLettered => &self.jobs_dead_lettered,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let sent = self.jobs_sent.load(Ordering::SeqCst);
        let skipped = self.jobs_skipped.load(Ordering::SeqCst);
        let retried = self.jobs_retried.load(Ordering::SeqCst);
        let dead_lettered = self.jobs_dead_lettered.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = sent + skipped + retried + dead_lettered;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_sent: sent,
            jobs_skipped: skipped,
            jobs_retried: retried,
            jobs_dead_lettered: dead_lettered,
            average_job_duration: average_duration,
        }
    }
}

/// Claims, processes and settles jobs. Shared by every worker of a pool.
struct JobHandler {
    queue: Arc<dyn DelayedTaskQueue>,
    processor: Arc<NotificationProcessor>,
    clock: Arc<dyn Clock>,
    retry_delay: chrono::Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl JobHandler {
    /// Handles the earliest due job, if any.
    async fn handle_next(&self, worker_id: &str) -> Result<Option<JobResult>, QueueError> {
        let Some(job) = self.queue.dequeue_due(self.clock.now()).await? else {
            return Ok(None);
        };
        self.handle(worker_id, job).await.map(Some)
    }

    async fn handle(&self, worker_id: &str, mut job: Job) -> Result<JobResult, QueueError> {
        let started = Instant::now();

        info!(
            worker_id = worker_id,
            job_id = %job.id,
            person_id = job.payload.person_id,
            attempt = job.attempts,
            "Processing job"
        );

        self.stats.increment_active();
        let outcome = self.processor.process(&job).await;
        self.stats.decrement_active();

        let (status, detail) = match outcome {
            Ok(ProcessOutcome::Sent { .. }) => {
                self.queue.ack(&job).await?;
                (JobStatus::Sent, None)
            }
            Ok(ProcessOutcome::Skipped(reason)) => {
                self.queue.ack(&job).await?;
                (JobStatus::Skipped, Some(reason.to_string()))
            }
            Ok(ProcessOutcome::Failed(e)) => {
                let message = e.to_string();
                let status = self.retry_or_dead_letter(worker_id, &mut job, &message).await?;
                (status, Some(message))
            }
            Err(e @ ProcessError::UnsupportedTaskType(_)) => {
                let message = e.to_string();
                error!(worker_id = worker_id, job_id = %job.id, error = %message, "Job cannot be processed");
                self.queue
                    .dead_letter(job.clone(), &message, self.clock.now())
                    .await?;
                (JobStatus::DeadLettered, Some(message))
            }
            Err(e) => {
                let message = e.to_string();
                let status = self.retry_or_dead_letter(worker_id, &mut job, &message).await?;
                (status, Some(message))
            }
        };

        let duration = started.elapsed();
        self.stats.record(status, duration);

        Ok(JobResult::new(
            &job,
            worker_id,
            status,
            detail,
            self.clock.now(),
            duration.as_millis() as u64,
        ))
    }

    async fn retry_or_dead_letter(
        &self,
        worker_id: &str,
        job: &mut Job,
        message: &str,
    ) -> Result<JobStatus, QueueError> {
        job.last_error = Some(message.to_string());
        let now = self.clock.now();

        if job.should_retry() {
            let not_before = now + job.retry_delay(self.retry_delay);
            warn!(
                worker_id = worker_id,
                job_id = %job.id,
                error = message,
                remaining_attempts = job.remaining_attempts(),
                retry_at = %not_before,
                "Job failed, scheduling retry"
            );
            self.queue.retry_later(job.clone(), not_before).await?;
            Ok(JobStatus::Retrying)
        } else {
            error!(
                worker_id = worker_id,
                job_id = %job.id,
                error = message,
                attempts = job.attempts,
                "Job failed, moving to dead letter queue"
            );
            self.queue.dead_letter(job.clone(), message, now).await?;
            Ok(JobStatus::DeadLettered)
        }
    }

    async fn recover_expired(&self) {
        match self.queue.recover_expired(self.clock.now()).await {
            Ok(0) => {}
            Ok(recovered) => {
                info!(recovered = recovered, "Recovered expired job claims");
            }
            Err(e) => {
                warn!(error = %e, "Failed to recover expired job claims");
            }
        }
    }

    async fn refresh_queue_depth(&self) {
        if let Ok(stats) = self.queue.stats(self.clock.now()).await {
            self.metrics.update_queue_depth(&stats);
        }
    }
}

/// Worker pool that manages multiple workers processing jobs from a queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    handler: Arc<JobHandler>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn DelayedTaskQueue>,
        processor: Arc<NotificationProcessor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let stats = Arc::new(SharedPoolStats::new());
        let retry_delay = chrono::Duration::from_std(config.retry_delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let handler = Arc::new(JobHandler {
            queue,
            processor,
            clock,
            retry_delay,
            stats: Arc::clone(&stats),
            metrics: MetricsCollector::new(),
        });

        Self {
            config,
            handler,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats,
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        self.handler.recover_expired().await;

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                handler: Arc::clone(&self.handler),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
            };

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Signals every worker to stop and waits for in-flight jobs.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Processes every job that is due now on the calling task, without
    /// spawning workers. Returns the result of each attempt.
    pub async fn drain_due(&self) -> Result<Vec<JobResult>, PoolError> {
        self.handler.recover_expired().await;

        let mut results = Vec::new();
        while let Some(result) = self.handler.handle_next("inline").await? {
            results.push(result);
        }

        debug!(processed = results.len(), "Drained due jobs");
        Ok(results)
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker that processes jobs from the queue.
struct Worker {
    id: String,
    handler: Arc<JobHandler>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
}

impl Worker {
    /// Polls for due jobs until a shutdown signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");
        self.handler.metrics.inc_active_workers();

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.handler.handle_next(&self.id).await {
                Ok(Some(result)) => {
                    debug!(worker_id = %self.id, job_id = %result.job_id, status = %result.status, "Job settled");
                }
                Ok(None) => {
                    self.handler.recover_expired().await;
                    self.handler.refresh_queue_depth().await;
                    if self.idle().await {
                        info!(worker_id = %self.id, "Worker received shutdown signal");
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Queue operation failed");
                    if self.idle().await {
                        break;
                    }
                }
            }
        }

        self.handler.metrics.dec_active_workers();
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Sleeps for one poll interval. Returns `true` if shutdown was signalled
    /// in the meantime.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => false,
            _ = self.shutdown_rx.recv() => true,
        }
    }
}
