use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without detailed percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Gets the total sum of durations recorded (in microseconds).
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

fn mean_micros(count: usize, sum_micros: usize) -> Option<f64> {
  if count == 0 {
    None
  } else {
    Some(sum_micros as f64 / count as f64)
  }
}

// --- Queue Metrics ---

/// Counters for a `TaskQueue`. Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
  /// Total number of work items enqueued.
  pub tasks_enqueued: Arc<AtomicUsize>,
  pub tasks_succeeded: Arc<AtomicUsize>,
  /// Total number of work items that failed (including panics and resolution failures).
  pub tasks_failed: Arc<AtomicUsize>,
  /// Subset of `tasks_failed` that panicked.
  pub tasks_panicked: Arc<AtomicUsize>,
  /// Total number of drains that executed at least one item.
  pub drains_total: Arc<AtomicUsize>,

  // --- Gauges ---
  /// Items waiting for the next drain.
  pub tasks_waiting_current: Arc<AtomicUsize>,
  /// Items taken by a drain and not yet finished.
  pub tasks_running_current: Arc<AtomicUsize>,

  pub task_execution_duration: Arc<SimpleHistogram>,
}

impl QueueMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a snapshot of the current metric values.
  pub fn snapshot(&self) -> QueueMetricsSnapshot {
    let order = Ordering::Relaxed;

    QueueMetricsSnapshot {
      tasks_enqueued: self.tasks_enqueued.load(order),
      tasks_succeeded: self.tasks_succeeded.load(order),
      tasks_failed: self.tasks_failed.load(order),
      tasks_panicked: self.tasks_panicked.load(order),
      drains_total: self.drains_total.load(order),
      tasks_waiting_current: self.tasks_waiting_current.load(order),
      tasks_running_current: self.tasks_running_current.load(order),
      task_execution_duration_count: self.task_execution_duration.get_count(),
      task_execution_duration_sum_micros: self.task_execution_duration.get_sum_micros(),
    }
  }
}

/// A snapshot of a queue's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueueMetricsSnapshot {
  pub tasks_enqueued: usize,
  pub tasks_succeeded: usize,
  pub tasks_failed: usize,
  pub tasks_panicked: usize,
  pub drains_total: usize,
  pub tasks_waiting_current: usize,
  pub tasks_running_current: usize,
  pub task_execution_duration_count: usize,
  pub task_execution_duration_sum_micros: usize,
}

impl QueueMetricsSnapshot {
  /// Mean task execution duration, `None` if nothing has run yet.
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    mean_micros(
      self.task_execution_duration_count,
      self.task_execution_duration_sum_micros,
    )
    .map(|micros| Duration::from_micros(micros as u64))
  }
}

// --- Scheduler Metrics ---

/// Counters for a `Scheduler`. Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
  /// Total number of `run_at` calls.
  pub ticks_total: Arc<AtomicUsize>,
  pub jobs_registered: Arc<AtomicUsize>,
  /// Total number of (job, tick) matches.
  pub jobs_matched: Arc<AtomicUsize>,
  pub jobs_succeeded: Arc<AtomicUsize>,
  pub jobs_failed: Arc<AtomicUsize>,
  /// Matches skipped because the job's mutex was held.
  pub jobs_skipped_overlap: Arc<AtomicUsize>,

  pub job_execution_duration: Arc<SimpleHistogram>,
}

impl SchedulerMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a snapshot of the current metric values.
  pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
    let order = Ordering::Relaxed;

    SchedulerMetricsSnapshot {
      ticks_total: self.ticks_total.load(order),
      jobs_registered: self.jobs_registered.load(order),
      jobs_matched: self.jobs_matched.load(order),
      jobs_succeeded: self.jobs_succeeded.load(order),
      jobs_failed: self.jobs_failed.load(order),
      jobs_skipped_overlap: self.jobs_skipped_overlap.load(order),
      job_execution_duration_count: self.job_execution_duration.get_count(),
      job_execution_duration_sum_micros: self.job_execution_duration.get_sum_micros(),
    }
  }
}

/// A snapshot of a scheduler's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SchedulerMetricsSnapshot {
  pub ticks_total: usize,
  pub jobs_registered: usize,
  pub jobs_matched: usize,
  pub jobs_succeeded: usize,
  pub jobs_failed: usize,
  pub jobs_skipped_overlap: usize,
  pub job_execution_duration_count: usize,
  pub job_execution_duration_sum_micros: usize,
}

impl SchedulerMetricsSnapshot {
  /// Mean job execution duration, `None` if nothing has run yet.
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    mean_micros(
      self.job_execution_duration_count,
      self.job_execution_duration_sum_micros,
    )
    .map(|micros| Duration::from_micros(micros as u64))
  }
}
