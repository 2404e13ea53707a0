use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::TaskId;
use crate::scheduler::JobId;

/// Where the current execution was started from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionOrigin {
  /// Drained from a `TaskQueue`.
  Queue { task_id: TaskId },
  /// Run by a `Scheduler` tick.
  Scheduler { job_id: JobId, tick: DateTime<Utc> },
}

/// Contextual information available to a running work item via task-locals.
/// Accessible within work item code using `try_get_execution_context()`
/// or the `execution_context!()` macro when the `work_context` feature is enabled.
#[derive(Clone, Copy, Debug)]
pub struct ExecutionContext {
  /// Unique ID of this execution attempt.
  pub execution_id: Uuid,
  pub origin: ExecutionOrigin,
}

impl ExecutionContext {
  pub(crate) fn for_task(task_id: TaskId) -> Self {
    Self {
      execution_id: Uuid::new_v4(),
      origin: ExecutionOrigin::Queue { task_id },
    }
  }

  pub(crate) fn for_job(job_id: JobId, tick: DateTime<Utc>) -> Self {
    Self {
      execution_id: Uuid::new_v4(),
      origin: ExecutionOrigin::Scheduler { job_id, tick },
    }
  }
}

tokio::task_local! {
    /// Provides access to the current `ExecutionContext` within a work item's execution scope.
    /// Set by the queue drain and the scheduler tick if the `work_context` feature is enabled.
    pub static CURRENT_EXECUTION_CONTEXT: ExecutionContext;
}

/// Attempts to retrieve the `ExecutionContext` of the running work item.
///
/// Returns `None` when called outside a queue drain or scheduler tick.
pub fn try_get_execution_context() -> Option<ExecutionContext> {
  CURRENT_EXECUTION_CONTEXT.try_with(|ctx| *ctx).ok()
}

/// Retrieves the current `ExecutionContext`, panicking if called outside a
/// queue drain or scheduler tick.
///
/// # Panics
/// Panics if the `CURRENT_EXECUTION_CONTEXT` task local has not been set.
#[macro_export]
macro_rules! execution_context {
  () => {
    $crate::work::context::CURRENT_EXECUTION_CONTEXT.with(|ctx| *ctx)
  };
}
