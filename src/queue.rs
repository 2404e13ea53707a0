//! In-process FIFO task queue with per-item failure isolation.

use crate::error::{QueueError, TaskFailure, WorkError};
use crate::event::{publish_optional, EventDispatcher, LifecycleEvent};
use crate::metrics::{QueueMetrics, QueueMetricsSnapshot};
use crate::resolve::ScopeFactory;
use crate::work::{Invocable, InvocableWithPayload, TaskId, WorkItem, WorkResult};

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

type ErrorHandler = Arc<dyn Fn(&TaskFailure) + Send + Sync + 'static>;

struct QueuedTask {
  id: TaskId,
  work: WorkItem,
}

/// Outcome counts of a single [`TaskQueue::drain`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DrainReport {
  /// Number of items taken from the queue at drain start.
  pub attempted: usize,
  pub succeeded: usize,
  pub failed: usize,
}

/// Builder for a [`TaskQueue`].
///
/// Both capabilities are optional. Without a scope factory, type-token items fail
/// with a resolution error (routed to error handlers like any other failure).
/// Without a dispatcher, lifecycle events are not published.
#[derive(Default)]
pub struct QueueBuilder {
  scope_factory: Option<Arc<dyn ScopeFactory>>,
  dispatcher: Option<Arc<dyn EventDispatcher>>,
}

impl QueueBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the capability used to resolve type-token work items.
  pub fn scope_factory(mut self, factory: Arc<dyn ScopeFactory>) -> Self {
    self.scope_factory = Some(factory);
    self
  }

  /// Sets the dispatcher that receives queue lifecycle events.
  pub fn dispatcher(mut self, dispatcher: Arc<dyn EventDispatcher>) -> Self {
    self.dispatcher = Some(dispatcher);
    self
  }

  pub fn build(self) -> TaskQueue {
    TaskQueue {
      pending: Mutex::new(VecDeque::new()),
      error_handlers: RwLock::new(Vec::new()),
      scope_factory: self.scope_factory,
      dispatcher: self.dispatcher,
      metrics: QueueMetrics::new(),
    }
  }
}

/// A FIFO buffer of work items, executed on demand by [`drain`](TaskQueue::drain).
///
/// All methods take `&self`; share the queue with an `Arc`. Enqueueing is allowed
/// while a drain is running; such items wait for the next drain.
pub struct TaskQueue {
  pending: Mutex<VecDeque<QueuedTask>>,
  error_handlers: RwLock<Vec<ErrorHandler>>,
  scope_factory: Option<Arc<dyn ScopeFactory>>,
  dispatcher: Option<Arc<dyn EventDispatcher>>,
  metrics: QueueMetrics,
}

impl fmt::Debug for TaskQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskQueue")
      .field("pending", &self.len())
      .field("error_handlers", &self.error_handlers.read().len())
      .field("has_scope_factory", &self.scope_factory.is_some())
      .field("has_dispatcher", &self.dispatcher.is_some())
      .finish()
  }
}

impl Default for TaskQueue {
  fn default() -> Self {
    Self::new()
  }
}

impl TaskQueue {
  /// A queue with no scope factory and no dispatcher.
  pub fn new() -> Self {
    QueueBuilder::new().build()
  }

  pub fn builder() -> QueueBuilder {
    QueueBuilder::new()
  }

  // --- Enqueueing ---

  /// Appends a work item to the tail of the queue.
  pub fn enqueue(&self, work: WorkItem) -> TaskId {
    let id = Uuid::new_v4();
    trace!(task_id = %id, description = work.description(), "Enqueueing work item.");
    self.pending.lock().push_back(QueuedTask { id, work });
    self.metrics.tasks_enqueued.fetch_add(1, AtomicOrdering::Relaxed);
    self
      .metrics
      .tasks_waiting_current
      .fetch_add(1, AtomicOrdering::Relaxed);
    id
  }

  /// Enqueues an async closure.
  pub fn enqueue_fn<F, Fut>(&self, f: F) -> TaskId
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
  {
    self.enqueue(WorkItem::from_fn(f))
  }

  /// Enqueues a synchronous closure.
  pub fn enqueue_sync<F>(&self, f: F) -> TaskId
  where
    F: Fn() -> WorkResult + Send + Sync + 'static,
  {
    self.enqueue(WorkItem::from_sync(f))
  }

  /// Enqueues a handler type resolved at execution time.
  pub fn enqueue_invocable<T: Invocable>(&self) -> TaskId {
    self.enqueue(WorkItem::invocable::<T>())
  }

  /// Enqueues a handler type that receives `payload` before it is invoked.
  pub fn enqueue_invocable_with_payload<T: InvocableWithPayload>(&self, payload: T::Payload) -> TaskId {
    self.enqueue(WorkItem::invocable_with_payload::<T>(payload))
  }

  /// Registers a handler called once per failed item, in registration order.
  ///
  /// With no handler registered, failures are dropped after being logged.
  pub fn on_error<F>(&self, handler: F) -> &Self
  where
    F: Fn(&TaskFailure) + Send + Sync + 'static,
  {
    self.error_handlers.write().push(Arc::new(handler));
    self
  }

  // --- Introspection ---

  /// Number of items waiting for the next drain.
  pub fn len(&self) -> usize {
    self.pending.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.lock().is_empty()
  }

  pub fn metrics_snapshot(&self) -> QueueMetricsSnapshot {
    self.metrics.snapshot()
  }

  // --- Draining ---

  /// Executes every item present when the call starts, sequentially and in FIFO order.
  ///
  /// Item failures (errors, panics, resolution failures) are routed to the error
  /// handlers and never returned. The only error is a dispatcher failure.
  ///
  /// # Errors
  ///
  /// Returns [`QueueError::Dispatch`] if publishing a lifecycle event fails. When the
  /// start event fails, the batch is put back at the front of the queue untouched.
  pub async fn drain(&self) -> Result<DrainReport, QueueError> {
    let batch: Vec<QueuedTask> = self.pending.lock().drain(..).collect();
    if batch.is_empty() {
      trace!("Drain called on an empty queue.");
      return Ok(DrainReport::default());
    }
    let batch_size = batch.len();
    self.move_gauge(batch_size, true);

    if let Err(e) = publish_optional(
      self.dispatcher.as_ref(),
      LifecycleEvent::QueueConsumptionStarted,
    )
    .await
    {
      error!(error = %e, batch_size, "Dispatcher failed at drain start; restoring batch.");
      self.restore(batch);
      return Err(QueueError::Dispatch(e));
    }

    info!(batch_size, "Draining task queue.");
    self.metrics.drains_total.fetch_add(1, AtomicOrdering::Relaxed);

    let mut report = DrainReport {
      attempted: batch_size,
      ..DrainReport::default()
    };
    for task in batch {
      let span = info_span!(
        "queue_task",
        task_id = %task.id,
        description = task.work.description()
      );
      let started = Instant::now();
      let result = self.execute_task(&task).instrument(span).await;
      let duration = started.elapsed();

      self.metrics.task_execution_duration.record(duration);
      self
        .metrics
        .tasks_running_current
        .fetch_sub(1, AtomicOrdering::Relaxed);

      match result {
        Ok(()) => {
          report.succeeded += 1;
          self.metrics.tasks_succeeded.fetch_add(1, AtomicOrdering::Relaxed);
          debug!(task_id = %task.id, duration_ms = duration.as_millis() as u64, "Task succeeded.");
        }
        Err(error) => {
          report.failed += 1;
          self.metrics.tasks_failed.fetch_add(1, AtomicOrdering::Relaxed);
          if error.is_panic() {
            self.metrics.tasks_panicked.fetch_add(1, AtomicOrdering::Relaxed);
          }
          warn!(task_id = %task.id, error = %error, "Task failed.");
          self.notify_error_handlers(TaskFailure {
            task_id: task.id,
            description: task.work.description().to_string(),
            error,
          });
        }
      }
    }

    info!(
      attempted = report.attempted,
      succeeded = report.succeeded,
      failed = report.failed,
      "Drain finished."
    );

    publish_optional(
      self.dispatcher.as_ref(),
      LifecycleEvent::QueueConsumptionEnded {
        attempted: report.attempted,
        failed: report.failed,
      },
    )
    .await
    .map_err(|e| {
      error!(error = %e, "Dispatcher failed at drain end.");
      QueueError::Dispatch(e)
    })?;

    Ok(report)
  }

  async fn execute_task(&self, task: &QueuedTask) -> Result<(), WorkError> {
    let execution = task.work.execute(self.scope_factory.as_deref());
    run_in_context(task.id, execution).await
  }

  fn notify_error_handlers(&self, failure: TaskFailure) {
    let handlers: Vec<ErrorHandler> = self.error_handlers.read().clone();
    if handlers.is_empty() {
      trace!(task_id = %failure.task_id, "No error handler registered; dropping failure.");
      return;
    }
    for handler in handlers {
      if std::panic::catch_unwind(AssertUnwindSafe(|| handler(&failure))).is_err() {
        error!(task_id = %failure.task_id, "Queue error handler panicked.");
      }
    }
  }

  /// Puts an untouched batch back in front of anything enqueued meanwhile.
  fn restore(&self, batch: Vec<QueuedTask>) {
    let restored = batch.len();
    {
      let mut pending = self.pending.lock();
      for task in batch.into_iter().rev() {
        pending.push_front(task);
      }
    }
    self.move_gauge(restored, false);
  }

  /// Moves `count` items between the waiting and running gauges.
  fn move_gauge(&self, count: usize, to_running: bool) {
    let (from, to) = if to_running {
      (&self.metrics.tasks_waiting_current, &self.metrics.tasks_running_current)
    } else {
      (&self.metrics.tasks_running_current, &self.metrics.tasks_waiting_current)
    };
    from.fetch_sub(count, AtomicOrdering::Relaxed);
    to.fetch_add(count, AtomicOrdering::Relaxed);
  }
}

#[cfg(feature = "work_context")]
async fn run_in_context<F>(task_id: TaskId, execution: F) -> Result<(), WorkError>
where
  F: Future<Output = Result<(), WorkError>>,
{
  use crate::work::context::{ExecutionContext, CURRENT_EXECUTION_CONTEXT};

  CURRENT_EXECUTION_CONTEXT
    .scope(ExecutionContext::for_task(task_id), execution)
    .await
}

#[cfg(not(feature = "work_context"))]
async fn run_in_context<F>(_task_id: TaskId, execution: F) -> Result<(), WorkError>
where
  F: Future<Output = Result<(), WorkError>>,
{
  execution.await
}
