use crate::scheduler::{JobId, TickReport};
use crate::work::TaskId;

use std::time::Duration;

use thiserror::Error;

/// Opaque failure type returned by user code (work items, resolvers, dispatchers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while configuring a `TaskQueue`, `Scheduler` or `Host` via their builders.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Mutex lock timeout (`lock_timeout`) must be greater than zero")]
  ZeroLockTimeout,
  #[error("Interval `{name}` must be greater than zero (got {value:?})")]
  ZeroInterval { name: &'static str, value: Duration },
  #[error("Host requires at least a scheduler or a queue to drive")]
  NothingToHost,
}

/// The failure captured from a single execution attempt of a work item.
///
/// This is the value routed to queue error handlers and scheduler error handlers.
/// It is always a recoverable value: panics are converted into `Panicked`.
#[derive(Error, Debug)]
pub enum WorkError {
  #[error("work item failed: {0}")]
  Failed(BoxError),
  #[error("work item panicked: {0}")]
  Panicked(String),
  #[error("failed to resolve handler `{type_name}`: {cause}")]
  Resolution {
    type_name: &'static str,
    cause: BoxError,
  },
}

impl WorkError {
  /// Returns `true` if this failure came from a panic inside the work item.
  pub fn is_panic(&self) -> bool {
    matches!(self, WorkError::Panicked(_))
  }

  /// Returns `true` if the handler instance could not be created.
  pub fn is_resolution(&self) -> bool {
    matches!(self, WorkError::Resolution { .. })
  }

  /// The error returned by user code or the resolution capability, if any.
  ///
  /// The message is already part of this error's `Display`, so it is not
  /// exposed again through `Error::source`.
  pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
    match self {
      WorkError::Failed(cause) | WorkError::Resolution { cause, .. } => Some(cause.as_ref()),
      WorkError::Panicked(_) => None,
    }
  }
}

/// Errors returned from `TaskQueue::drain`.
///
/// Work item failures never appear here; they are routed to the handlers
/// registered via `TaskQueue::on_error` (or dropped if there are none).
#[derive(Error, Debug)]
pub enum QueueError {
  #[error("Event dispatcher failed while publishing a queue lifecycle event: {0}")]
  Dispatch(BoxError),
}

/// A failed scheduled job, as reported by a tick.
#[derive(Debug)]
pub struct JobFailure {
  pub job_id: JobId,
  pub description: String,
  pub error: WorkError,
}

/// Errors returned from `Scheduler::run_at`.
#[derive(Error, Debug)]
pub enum SchedulerError {
  #[error("{} scheduled job(s) failed during tick {}", failures.len(), report.tick)]
  JobsFailed {
    report: TickReport,
    failures: Vec<JobFailure>,
  },
  #[error("Event dispatcher failed while publishing a scheduler lifecycle event: {0}")]
  Dispatch(BoxError),
}

impl SchedulerError {
  /// The failures carried by a `JobsFailed` error, empty otherwise.
  pub fn failures(&self) -> &[JobFailure] {
    match self {
      SchedulerError::JobsFailed { failures, .. } => failures,
      SchedulerError::Dispatch(_) => &[],
    }
  }
}

/// Errors raised while building a recurrence rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecurrenceError {
  #[error("Invalid cron expression '{expression}': expected 5 fields, got {count}")]
  InvalidFieldCount { expression: String, count: usize },
  #[error("Invalid {field} field '{part}': {reason}")]
  InvalidField {
    field: &'static str,
    part: String,
    reason: String,
  },
  #[error("Value {value} is out of range [{min}, {max}] for {field}")]
  OutOfRange {
    field: &'static str,
    value: u32,
    min: u32,
    max: u32,
  },
  #[cfg(feature = "cron_schedule")]
  #[error("Invalid extended cron expression '{expression}': {reason}")]
  InvalidExtended { expression: String, reason: String },
}

/// Errors related to the host shutdown process (`shutdown_graceful`, `shutdown_force`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (host loops already gone).")]
  SignalFailed,
  #[error("Timed out waiting for host loops to complete shutdown.")]
  Timeout,
  #[error("A host loop panicked during the shutdown process.")]
  TaskPanic,
  #[error("Shutdown already in progress or completed.")]
  AlreadyShuttingDown,
}

/// Failure routed to queue error handlers, identifying the task it came from.
#[derive(Debug)]
pub struct TaskFailure {
  pub task_id: TaskId,
  pub description: String,
  pub error: WorkError,
}
