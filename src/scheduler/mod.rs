//! Delayed delivery: scheduling, the delayed task queue and the workers
//! draining it.
//!
//! - **BirthdayScheduler**: computes a person's next delivery instant and
//!   enqueues an idempotent job for it
//! - **DelayedTaskQueue**: durable delayed queue (Redis, or in-memory for
//!   tests) with visibility timeouts and at-least-once delivery
//! - **WorkerPool**: workers that claim due jobs and hand them to the
//!   notification processor
//! - **Reconciler**: re-schedules every stored person after a queue outage
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────┐   enqueue    ┌──────────────┐
//!   │  Scheduler   ├─────────────►│    Redis     │
//!   │ (register /  │              │ delayed zset │
//!   │  reconcile)  │              └──────┬───────┘
//!   └──────────────┘                     │ due
//!         ┌──────────────────────────────┼───────────────┐
//!         ▼                              ▼               ▼
//!    ┌─────────┐                    ┌─────────┐     ┌─────────┐
//!    │ Worker 1│                    │ Worker 2│     │ Worker N│
//!    └────┬────┘                    └────┬────┘     └────┬────┘
//!         └──────────► NotificationProcessor ◄───────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use birthday_courier::scheduler::{BirthdayScheduler, RedisDelayedQueue, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let queue = Arc::new(
//!     RedisDelayedQueue::connect("redis://localhost:6379", "birthdayQueue", Duration::from_secs(300)).await?,
//! );
//! let scheduler = BirthdayScheduler::new(queue.clone(), clock.clone());
//! scheduler.schedule(&person).await?;
//!
//! let mut pool = WorkerPool::new(WorkerPoolConfig::new(4), queue, processor, clock);
//! pool.start().await?;
//! ```

pub mod birthday;
pub mod job;
pub mod memory;
pub mod queue;
pub mod reconcile;
pub mod worker_pool;

pub use birthday::{idempotency_key, BirthdayScheduler, Scheduled, ScheduledDelivery};
pub use job::{
    DeadLetterEntry, Job, JobPayload, JobResult, JobStatus, BIRTHDAY_TASK_TYPE,
    DEFAULT_MAX_ATTEMPTS,
};
pub use memory::InMemoryDelayedQueue;
pub use queue::{DelayedTaskQueue, EnqueueOutcome, QueueError, QueueStats, RedisDelayedQueue};
pub use reconcile::{ReconcileReport, Reconciler};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
