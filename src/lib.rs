//! Steward: In-Process Task Queue and Cron Scheduler
//!
//! Runs deferred and recurring work inside your application, without an external
//! broker. Two engines share one work abstraction:
//!
//! - [`TaskQueue`]: a FIFO buffer of work items drained on demand. One failing item
//!   never stops the batch; failures are routed to error handlers.
//! - [`Scheduler`]: a set of jobs with cron-like recurrence rules. Each call to
//!   [`Scheduler::run_at`] evaluates every job against the given instant and runs the
//!   due ones, guarding each with a keyed mutex to prevent overlapping runs.
//!
//! # Features
//!
//! - Work items from async closures, sync closures or handler types resolved per
//!   execution through a pluggable [`ScopeFactory`] (see [`ServiceRegistry`]).
//! - Recurrence shorthands (`every_minute`, `hourly_at`, `daily_at`, `weekly_on`,
//!   `monthly_on_last_day`, ...) and raw 5-field cron expressions, composed with AND.
//! - Guard predicates (`when`) and fixed-offset evaluation (`zoned`).
//! - Pluggable [`JobMutex`] (default [`InMemoryMutex`] with lease expiry).
//! - Optional lifecycle events through a pluggable [`EventDispatcher`] (see [`EventBus`]).
//! - Panics inside work items are caught and reported as [`WorkError::Panicked`].
//! - Configurable scheduler failure handling via [`FailurePolicy`].
//! - Built-in metrics (queryable snapshots).
//! - Optional background [`Host`] driving both engines, with graceful and forced shutdown.
//! - Optional task-local [`ExecutionContext`] (requires the `work_context` feature).
//! - Optional seconds-aware cron expressions (requires the `cron_schedule` feature).
//! - Optional Serde support for public data types (requires the `serde` feature).
//!
//! # Usage
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use chrono::{TimeZone, Utc};
//! use steward::{Scheduler, TaskQueue};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // --- Queue ---
//! let queue = TaskQueue::new();
//! let failures = Arc::new(AtomicUsize::new(0));
//! let failures_clone = failures.clone();
//! queue.on_error(move |failure| {
//!   eprintln!("task {} failed: {}", failure.task_id, failure.error);
//!   failures_clone.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! queue.enqueue_sync(|| Ok(()));
//! queue.enqueue_sync(|| Err("disk full".into()));
//! let report = queue.drain().await?;
//! assert_eq!((report.succeeded, report.failed), (1, 1));
//! assert_eq!(failures.load(Ordering::SeqCst), 1);
//!
//! // --- Scheduler ---
//! let scheduler = Scheduler::new();
//! let runs = Arc::new(AtomicUsize::new(0));
//! let runs_clone = runs.clone();
//! scheduler
//!   .schedule_fn(move || {
//!     let runs = runs_clone.clone();
//!     async move {
//!       runs.fetch_add(1, Ordering::SeqCst);
//!       Ok(())
//!     }
//!   })
//!   .daily_at(9, 30)?
//!   .weekday();
//!
//! // Tuesday 2024-01-02 09:30 UTC
//! scheduler.run_at(Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap()).await?;
//! // Saturday: not a weekday
//! scheduler.run_at(Utc.with_ymd_and_hms(2024, 1, 6, 9, 30, 0).unwrap()).await?;
//! assert_eq!(runs.load(Ordering::SeqCst), 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! - [`QueueBuilder`]: `scope_factory`, `dispatcher`.
//! - [`SchedulerBuilder`]: `mutex`, `scope_factory`, `dispatcher`, `lock_timeout`
//!   (default one day), `failure_policy` (default `Propagate`).
//! - [`HostBuilder`]: `scheduler`, `queue`, `poll_interval`, `queue_interval`,
//!   `consume_queue_on_shutdown`.
//!
//! # Failure handling
//!
//! The queue is a fault-isolating boundary: `drain` only returns an error when the
//! event dispatcher fails. The scheduler is a timing authority: with the default
//! [`FailurePolicy::Propagate`] a tick in which some job failed still runs every due
//! job and releases every mutex key, then returns [`SchedulerError::JobsFailed`].
//!
//! # Observability
//!
//! - [`TaskQueue::metrics_snapshot`] and [`Scheduler::metrics_snapshot`].
//! - [`Scheduler::jobs`] lists [`JobSummary`] values; [`Scheduler::due_jobs`] evaluates
//!   rules without running anything.
//! - Integrate with the `tracing` crate for detailed logs (`queue_task` and
//!   `scheduled_job` spans).

// --- Feature-gated Documentation ---

// This empty module attaches the documentation block below only when
// the `work_context` feature is enabled during doc generation.
#[cfg(all(doc, feature = "work_context"))]
pub mod work_context_docs {
  //! # Accessing the Execution Context (`work_context` feature)
  //!
  //! When the `work_context` feature is enabled, a running work item can find out
  //! which engine started it using Tokio's task-local context.
  //!
  //! 1.  **`try_get_execution_context() -> Option<ExecutionContext>`**: Returns `None`
  //!     outside a queue drain or scheduler tick.
  //! 2.  **`execution_context!() -> ExecutionContext`**: **Panics** outside a drain or tick.
  //!
  //! ```no_run
  //! use steward::{try_get_execution_context, work::context::ExecutionOrigin, TaskQueue};
  //!
  //! let queue = TaskQueue::new();
  //! queue.enqueue_fn(|| async {
  //!   if let Some(ctx) = try_get_execution_context() {
  //!     if let ExecutionOrigin::Queue { task_id } = ctx.origin {
  //!       println!("running queued task {task_id} (execution {})", ctx.execution_id);
  //!     }
  //!   }
  //!   Ok(())
  //! });
  //! ```
}

// Declare modules within the crate
pub mod error;
pub mod event;
pub mod host;
mod macros;
pub mod metrics;
pub mod mutex;
pub mod queue;
pub mod recurrence;
pub mod resolve;
pub mod scheduler;
pub mod work;

// --- Public Re-exports ---

// Engines
pub use queue::{DrainReport, QueueBuilder, TaskQueue};
pub use scheduler::{
  FailurePolicy, JobId, JobSummary, ScheduleBuilder, Scheduler, SchedulerBuilder, TickReport,
};
pub use host::{Host, HostBuilder, ShutdownMode};

// Error types
pub use error::{
  BoxError, BuildError, JobFailure, QueueError, RecurrenceError, SchedulerError, ShutdownError,
  TaskFailure, WorkError,
};

// Work related types
pub use work::{
  BoxedWorkFn, Invocable, InvocableWithPayload, TaskId, TypeToken, WorkFuture, WorkItem, WorkResult,
};
// Conditionally export context items
#[cfg(feature = "work_context")]
pub use work::context::{try_get_execution_context, ExecutionContext, ExecutionOrigin};

// Capabilities
pub use event::{EventBus, EventDispatcher, JobOutcome, LifecycleEvent};
pub use mutex::{InMemoryMutex, JobMutex};
pub use resolve::{Instance, ResolutionScope, ScopeFactory, ServiceRegistry};

// Recurrence
pub use recurrence::{CronExpression, Field, RecurrenceRule};

// Metrics related types
pub use metrics::{QueueMetricsSnapshot, SchedulerMetricsSnapshot};

// Handler implementations need `#[async_trait]`.
pub use async_trait::async_trait;
