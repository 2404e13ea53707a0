//! Recurring job scheduler.
//!
//! The scheduler is purely reactive: it never reads the clock. Callers (or the
//! [`Host`](crate::host::Host) driver) call [`Scheduler::run_at`] with the instant to
//! evaluate, which keeps matching deterministic and testable.

use crate::error::{BuildError, JobFailure, RecurrenceError, SchedulerError, WorkError};
use crate::event::{publish_optional, EventDispatcher, JobOutcome, LifecycleEvent};
use crate::metrics::{SchedulerMetrics, SchedulerMetricsSnapshot};
use crate::mutex::{HeldKey, InMemoryMutex, JobMutex};
use crate::recurrence::{truncate_to_minute, CronExpression, Field, RecurrenceRule};
use crate::resolve::ScopeFactory;
use crate::work::{Invocable, WorkItem, WorkResult};

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, Utc, Weekday};
use parking_lot::RwLock;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Sequence number identifying a scheduled job within one scheduler.
pub type JobId = u64;

/// Default lease for a job's mutex key: one day.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1440 * 60);

type JobErrorHandler = Arc<dyn Fn(&JobFailure) + Send + Sync + 'static>;

/// What `run_at` does with job failures once the tick has finished.
///
/// Failures never stop the tick: every matched job is attempted and every
/// acquired mutex key is released either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailurePolicy {
  /// Return [`SchedulerError::JobsFailed`] carrying every failure of the tick.
  #[default]
  Propagate,
  /// Return `Ok` with the failures counted in the [`TickReport`]. Error handlers
  /// registered with [`Scheduler::on_error`] still see each failure.
  Isolate,
}

/// Summary of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TickReport {
  /// The evaluated instant, truncated to the minute.
  pub tick: DateTime<Utc>,
  pub matched: usize,
  pub succeeded: usize,
  pub failed: usize,
  /// Matched jobs skipped because their mutex key was held.
  pub skipped: usize,
}

impl TickReport {
  fn empty(tick: DateTime<Utc>) -> Self {
    Self {
      tick,
      matched: 0,
      succeeded: 0,
      failed: 0,
      skipped: 0,
    }
  }
}

/// Read-only view of a registered job.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobSummary {
  pub id: JobId,
  pub description: String,
  pub mutex_key: String,
  pub prevent_overlapping: bool,
  /// `false` while no time constraint has been attached (the job never runs).
  pub is_scheduled: bool,
  /// The 5-field expression the constraints reduce to, if any.
  pub expression: Option<String>,
}

// --- Scheduled Job ---

#[derive(Clone)]
struct JobSettings {
  rule: RecurrenceRule,
  mutex_key: String,
  prevent_overlapping: bool,
}

struct ScheduledJob {
  id: JobId,
  work: WorkItem,
  settings: RwLock<JobSettings>,
}

impl ScheduledJob {
  fn summary(&self) -> JobSummary {
    let settings = self.settings.read();
    JobSummary {
      id: self.id,
      description: self.work.description().to_string(),
      mutex_key: settings.mutex_key.clone(),
      prevent_overlapping: settings.prevent_overlapping,
      is_scheduled: settings.rule.is_constrained(),
      expression: settings.rule.expression().map(ToString::to_string),
    }
  }
}

/// A matched job, with the overlap settings captured at match time.
struct DueJob {
  job: Arc<ScheduledJob>,
  mutex_key: String,
  prevent_overlapping: bool,
}

// --- Schedule Builder ---

/// Fluent handle returned by [`Scheduler::schedule`].
///
/// Every call narrows the job's recurrence rule. A job stays inert until the first
/// time constraint is attached, and constraints combine with AND: `daily().monday()`
/// runs at 00:00 on Mondays only. Methods taking numeric arguments validate them
/// and return [`RecurrenceError`] when out of range.
///
/// The builder edits the registered job in place, so dropping it early simply
/// leaves the job with the constraints applied so far.
pub struct ScheduleBuilder {
  job: Arc<ScheduledJob>,
}

impl fmt::Debug for ScheduleBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ScheduleBuilder")
      .field("job_id", &self.job.id)
      .finish()
  }
}

impl ScheduleBuilder {
  /// The id of the job being configured.
  pub fn id(&self) -> JobId {
    self.job.id
  }

  fn update(self, f: impl FnOnce(&mut JobSettings)) -> Self {
    f(&mut *self.job.settings.write());
    self
  }

  fn constrain(self, expression: CronExpression) -> Self {
    self.update(|settings| {
      settings.rule.constrain(expression);
    })
  }

  fn every_n_minutes(self, step: u32) -> Self {
    self.constrain(CronExpression::minute_steps(step))
  }

  fn daily_at_midnight() -> CronExpression {
    CronExpression {
      minute: Field::single(0),
      hour: Field::single(0),
      ..CronExpression::every_minute()
    }
  }

  // --- Recurrence shorthands ---

  pub fn every_minute(self) -> Self {
    self.constrain(CronExpression::every_minute())
  }

  pub fn every_five_minutes(self) -> Self {
    self.every_n_minutes(5)
  }

  pub fn every_ten_minutes(self) -> Self {
    self.every_n_minutes(10)
  }

  pub fn every_fifteen_minutes(self) -> Self {
    self.every_n_minutes(15)
  }

  pub fn every_thirty_minutes(self) -> Self {
    self.every_n_minutes(30)
  }

  /// At minute 0 of every hour.
  pub fn hourly(self) -> Self {
    self.constrain(CronExpression {
      minute: Field::single(0),
      ..CronExpression::every_minute()
    })
  }

  pub fn hourly_at(self, minute: u32) -> Result<Self, RecurrenceError> {
    Ok(self.constrain(CronExpression::hourly_at(minute)?))
  }

  /// At 00:00 every day.
  pub fn daily(self) -> Self {
    self.constrain(Self::daily_at_midnight())
  }

  pub fn daily_at_hour(self, hour: u32) -> Result<Self, RecurrenceError> {
    self.daily_at(hour, 0)
  }

  pub fn daily_at(self, hour: u32, minute: u32) -> Result<Self, RecurrenceError> {
    Ok(self.constrain(CronExpression::daily_at(hour, minute)?))
  }

  /// At 00:00 every Sunday.
  pub fn weekly(self) -> Self {
    self.constrain(CronExpression {
      day_of_week: Field::single(Weekday::Sun.num_days_from_sunday()),
      ..Self::daily_at_midnight()
    })
  }

  pub fn weekly_on(self, weekday: Weekday, hour: u32, minute: u32) -> Result<Self, RecurrenceError> {
    Ok(self.constrain(CronExpression::weekly_on(weekday, hour, minute)?))
  }

  /// At 00:00 on the first day of every month.
  pub fn monthly(self) -> Self {
    self.constrain(CronExpression {
      day_of_month: Field::single(1),
      ..Self::daily_at_midnight()
    })
  }

  /// At 00:00 on `day` of every month. Months without that day are skipped.
  pub fn monthly_on(self, day: u32) -> Result<Self, RecurrenceError> {
    Ok(self.constrain(CronExpression::monthly_on(day)?))
  }

  /// At 00:00 on the last day of every month.
  pub fn monthly_on_last_day(self) -> Self {
    self.constrain(Self::daily_at_midnight()).update(|settings| {
      settings.rule.require_last_day_of_month();
    })
  }

  /// Raw 5-field cron expression (`minute hour day-of-month month day-of-week`).
  pub fn cron(self, expression: &str) -> Result<Self, RecurrenceError> {
    Ok(self.constrain(CronExpression::parse(expression)?))
  }

  /// Seconds-aware 6/7-field expression evaluated by the `cron` crate at second 0
  /// of the tick minute.
  #[cfg(feature = "cron_schedule")]
  pub fn cron_extended(self, expression: &str) -> Result<Self, RecurrenceError> {
    {
      let mut settings = self.job.settings.write();
      settings.rule.constrain_extended(expression)?;
    }
    Ok(self)
  }

  // --- Restrictions ---

  /// Restricts matches to `hour:minute`.
  pub fn at(self, hour: u32, minute: u32) -> Result<Self, RecurrenceError> {
    self.daily_at(hour, minute)
  }

  /// Monday to Friday.
  pub fn weekday(self) -> Self {
    self.constrain(CronExpression::on_weekdays(&[
      Weekday::Mon,
      Weekday::Tue,
      Weekday::Wed,
      Weekday::Thu,
      Weekday::Fri,
    ]))
  }

  /// Saturday and Sunday.
  pub fn weekend(self) -> Self {
    self.constrain(CronExpression::on_weekdays(&[Weekday::Sat, Weekday::Sun]))
  }

  pub fn on(self, weekday: Weekday) -> Self {
    self.constrain(CronExpression::on_weekdays(&[weekday]))
  }

  pub fn monday(self) -> Self {
    self.on(Weekday::Mon)
  }

  pub fn tuesday(self) -> Self {
    self.on(Weekday::Tue)
  }

  pub fn wednesday(self) -> Self {
    self.on(Weekday::Wed)
  }

  pub fn thursday(self) -> Self {
    self.on(Weekday::Thu)
  }

  pub fn friday(self) -> Self {
    self.on(Weekday::Fri)
  }

  pub fn saturday(self) -> Self {
    self.on(Weekday::Sat)
  }

  pub fn sunday(self) -> Self {
    self.on(Weekday::Sun)
  }

  /// Adds a guard predicate over the tick instant. Guards only narrow an
  /// already scheduled job; on their own they do not make it due.
  pub fn when<F>(self, predicate: F) -> Self
  where
    F: Fn(&DateTime<Utc>) -> bool + Send + Sync + 'static,
  {
    self.update(|settings| {
      settings.rule.add_guard(Arc::new(predicate));
    })
  }

  /// Evaluates time components in a fixed UTC offset instead of UTC.
  pub fn zoned(self, offset: FixedOffset) -> Self {
    self.update(|settings| {
      settings.rule.set_offset(offset);
    })
  }

  // --- Overlap ---

  /// Guards executions with an explicit mutex key, shared with any other job
  /// using the same key.
  pub fn prevent_overlapping(self, key: impl Into<String>) -> Self {
    let key = key.into();
    self.update(|settings| {
      settings.mutex_key = key;
      settings.prevent_overlapping = true;
    })
  }

  /// Disables the mutex guard for this job.
  pub fn allow_overlapping(self) -> Self {
    self.update(|settings| settings.prevent_overlapping = false)
  }
}

// --- Scheduler Builder ---

/// Builder for configuring a [`Scheduler`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use steward::{FailurePolicy, Scheduler};
///
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = Scheduler::builder()
///   .lock_timeout(Duration::from_secs(600))
///   .failure_policy(FailurePolicy::Isolate)
///   .build()?;
/// # let _ = scheduler;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder {
  mutex: Option<Arc<dyn JobMutex>>,
  scope_factory: Option<Arc<dyn ScopeFactory>>,
  dispatcher: Option<Arc<dyn EventDispatcher>>,
  lock_timeout: Duration,
  failure_policy: FailurePolicy,
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      mutex: None,
      scope_factory: None,
      dispatcher: None,
      lock_timeout: DEFAULT_LOCK_TIMEOUT,
      failure_policy: FailurePolicy::default(),
    }
  }
}

impl SchedulerBuilder {
  /// Creates a new builder with default settings.
  /// - `mutex`: a fresh `InMemoryMutex`.
  /// - `lock_timeout`: one day.
  /// - `failure_policy`: `Propagate`.
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the mutex used to prevent overlapping runs. Share one instance between
  /// schedulers to prevent overlap across them.
  pub fn mutex(mut self, mutex: Arc<dyn JobMutex>) -> Self {
    self.mutex = Some(mutex);
    self
  }

  pub fn scope_factory(mut self, factory: Arc<dyn ScopeFactory>) -> Self {
    self.scope_factory = Some(factory);
    self
  }

  pub fn dispatcher(mut self, dispatcher: Arc<dyn EventDispatcher>) -> Self {
    self.dispatcher = Some(dispatcher);
    self
  }

  /// Sets the lease requested when acquiring a job's mutex key.
  pub fn lock_timeout(mut self, timeout: Duration) -> Self {
    self.lock_timeout = timeout;
    self
  }

  pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
    self.failure_policy = policy;
    self
  }

  /// Builds the scheduler.
  ///
  /// # Errors
  ///
  /// Returns `Err(BuildError::ZeroLockTimeout)` if `lock_timeout` is zero.
  pub fn build(self) -> Result<Scheduler, BuildError> {
    if self.lock_timeout.is_zero() {
      return Err(BuildError::ZeroLockTimeout);
    }
    Ok(Scheduler::assemble(self))
  }
}

// --- Scheduler ---

/// Owns the registered jobs and evaluates them on each tick.
pub struct Scheduler {
  jobs: RwLock<Vec<Arc<ScheduledJob>>>,
  next_id: AtomicU64,
  mutex: Arc<dyn JobMutex>,
  scope_factory: Option<Arc<dyn ScopeFactory>>,
  dispatcher: Option<Arc<dyn EventDispatcher>>,
  lock_timeout: Duration,
  failure_policy: FailurePolicy,
  error_handlers: RwLock<Vec<JobErrorHandler>>,
  metrics: SchedulerMetrics,
}

impl fmt::Debug for Scheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Scheduler")
      .field("jobs", &self.jobs.read().len())
      .field("lock_timeout", &self.lock_timeout)
      .field("failure_policy", &self.failure_policy)
      .field("has_scope_factory", &self.scope_factory.is_some())
      .field("has_dispatcher", &self.dispatcher.is_some())
      .finish()
  }
}

impl Default for Scheduler {
  fn default() -> Self {
    Self::new()
  }
}

impl Scheduler {
  /// A scheduler with an in-memory mutex and default settings.
  pub fn new() -> Self {
    Self::assemble(SchedulerBuilder::new())
  }

  fn assemble(builder: SchedulerBuilder) -> Self {
    let mutex = builder
      .mutex
      .unwrap_or_else(|| Arc::new(InMemoryMutex::new()) as Arc<dyn JobMutex>);
    Scheduler {
      jobs: RwLock::new(Vec::new()),
      next_id: AtomicU64::new(1),
      mutex,
      scope_factory: builder.scope_factory,
      dispatcher: builder.dispatcher,
      lock_timeout: builder.lock_timeout,
      failure_policy: builder.failure_policy,
      error_handlers: RwLock::new(Vec::new()),
      metrics: SchedulerMetrics::new(),
    }
  }

  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  // --- Registration ---

  /// Registers a job and returns the handle used to attach its recurrence.
  ///
  /// The job is inert until a time constraint is attached.
  pub fn schedule(&self, work: WorkItem) -> ScheduleBuilder {
    let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
    let job = Arc::new(ScheduledJob {
      id,
      settings: RwLock::new(JobSettings {
        rule: RecurrenceRule::new(),
        mutex_key: format!("job-{id}"),
        prevent_overlapping: true,
      }),
      work,
    });
    debug!(job_id = id, description = job.work.description(), "Registered scheduled job.");
    self.jobs.write().push(job.clone());
    self.metrics.jobs_registered.fetch_add(1, AtomicOrdering::Relaxed);
    ScheduleBuilder { job }
  }

  /// Registers an async closure.
  pub fn schedule_fn<F, Fut>(&self, f: F) -> ScheduleBuilder
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
  {
    self.schedule(WorkItem::from_fn(f))
  }

  /// Registers a handler type resolved for every run.
  pub fn schedule_invocable<T: Invocable>(&self) -> ScheduleBuilder {
    self.schedule(WorkItem::invocable::<T>())
  }

  /// Registers a handler observing every job failure, whatever the [`FailurePolicy`].
  pub fn on_error<F>(&self, handler: F) -> &Self
  where
    F: Fn(&JobFailure) + Send + Sync + 'static,
  {
    self.error_handlers.write().push(Arc::new(handler));
    self
  }

  // --- Introspection ---

  /// Ids of the jobs due at `instant`, in registration order. Pure: nothing runs.
  pub fn due_jobs(&self, instant: DateTime<Utc>) -> Vec<JobId> {
    self
      .matching_jobs(truncate_to_minute(instant))
      .iter()
      .map(|due| due.job.id)
      .collect()
  }

  pub fn jobs(&self) -> Vec<JobSummary> {
    self.jobs.read().iter().map(|job| job.summary()).collect()
  }

  pub fn metrics_snapshot(&self) -> SchedulerMetricsSnapshot {
    self.metrics.snapshot()
  }

  fn matching_jobs(&self, tick: DateTime<Utc>) -> Vec<DueJob> {
    let jobs: Vec<Arc<ScheduledJob>> = self.jobs.read().clone();
    jobs
      .into_iter()
      .filter_map(|job| {
        let (mutex_key, prevent_overlapping) = {
          let settings = job.settings.read();
          if !settings.rule.is_due(tick) {
            return None;
          }
          (settings.mutex_key.clone(), settings.prevent_overlapping)
        };
        Some(DueJob {
          job,
          mutex_key,
          prevent_overlapping,
        })
      })
      .collect()
  }

  // --- Tick ---

  /// Evaluates every job against `instant` (truncated to the minute) and runs the
  /// due ones sequentially in registration order.
  ///
  /// A `ScheduledJobStarted` event is published for each due job before any of
  /// them runs, and a `ScheduledJobEnded` event for each after all of them ran.
  ///
  /// # Errors
  ///
  /// - [`SchedulerError::Dispatch`]: publishing an event failed. This takes
  ///   precedence over job failures.
  /// - [`SchedulerError::JobsFailed`]: at least one job failed and the policy is
  ///   [`FailurePolicy::Propagate`]. Every due job was still attempted.
  pub async fn run_at(&self, instant: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
    let tick = truncate_to_minute(instant);
    self.metrics.ticks_total.fetch_add(1, AtomicOrdering::Relaxed);

    let due = self.matching_jobs(tick);
    let mut report = TickReport::empty(tick);
    if due.is_empty() {
      trace!(%tick, "No scheduled jobs due.");
      return Ok(report);
    }
    report.matched = due.len();
    self
      .metrics
      .jobs_matched
      .fetch_add(due.len(), AtomicOrdering::Relaxed);
    info!(%tick, matched = due.len(), "Running due scheduled jobs.");

    for due_job in &due {
      self
        .publish(LifecycleEvent::ScheduledJobStarted {
          job_id: due_job.job.id,
          mutex_key: due_job.mutex_key.clone(),
          description: due_job.job.work.description().to_string(),
          tick,
        })
        .await?;
    }

    let mut outcomes = Vec::with_capacity(due.len());
    let mut failures = Vec::new();
    for due_job in &due {
      let (outcome, error) = self.run_job(due_job, tick).await;
      match &outcome {
        JobOutcome::Succeeded { .. } => report.succeeded += 1,
        JobOutcome::Failed { .. } => report.failed += 1,
        JobOutcome::SkippedOverlap => report.skipped += 1,
      }
      if let Some(error) = error {
        let failure = JobFailure {
          job_id: due_job.job.id,
          description: due_job.job.work.description().to_string(),
          error,
        };
        self.notify_error_handlers(&failure);
        failures.push(failure);
      }
      outcomes.push((due_job.job.id, outcome));
    }

    for (job_id, outcome) in outcomes {
      self
        .publish(LifecycleEvent::ScheduledJobEnded {
          job_id,
          outcome,
          tick,
        })
        .await?;
    }

    info!(
      %tick,
      succeeded = report.succeeded,
      failed = report.failed,
      skipped = report.skipped,
      "Tick finished."
    );

    if !failures.is_empty() && self.failure_policy == FailurePolicy::Propagate {
      error!(%tick, failed = failures.len(), "Propagating scheduled job failures.");
      return Err(SchedulerError::JobsFailed { report, failures });
    }
    Ok(report)
  }

  /// Runs one due job under its mutex key. The key is released whatever the outcome.
  async fn run_job(&self, due: &DueJob, tick: DateTime<Utc>) -> (JobOutcome, Option<WorkError>) {
    let job = &due.job;
    let held = if due.prevent_overlapping {
      match HeldKey::acquire(&self.mutex, &due.mutex_key, self.lock_timeout).await {
        Some(held) => Some(held),
        None => {
          debug!(job_id = job.id, mutex_key = %due.mutex_key, "Mutex key held; skipping job this tick.");
          self
            .metrics
            .jobs_skipped_overlap
            .fetch_add(1, AtomicOrdering::Relaxed);
          return (JobOutcome::SkippedOverlap, None);
        }
      }
    } else {
      None
    };

    let span = info_span!(
      "scheduled_job",
      job_id = job.id,
      mutex_key = %due.mutex_key,
      description = job.work.description()
    );
    let started = Instant::now();
    let execution = job.work.execute(self.scope_factory.as_deref());
    let result = run_in_context(job.id, tick, execution).instrument(span).await;
    let duration = started.elapsed();

    if let Some(held) = held {
      held.release().await;
    }
    self.metrics.job_execution_duration.record(duration);

    match result {
      Ok(()) => {
        self.metrics.jobs_succeeded.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(job_id = job.id, duration_ms = duration.as_millis() as u64, "Scheduled job succeeded.");
        (JobOutcome::Succeeded { duration }, None)
      }
      Err(error) => {
        self.metrics.jobs_failed.fetch_add(1, AtomicOrdering::Relaxed);
        warn!(job_id = job.id, error = %error, "Scheduled job failed.");
        let outcome = JobOutcome::Failed {
          duration,
          error: error.to_string(),
        };
        (outcome, Some(error))
      }
    }
  }

  async fn publish(&self, event: LifecycleEvent) -> Result<(), SchedulerError> {
    publish_optional(self.dispatcher.as_ref(), event)
      .await
      .map_err(|e| {
        error!(error = %e, "Dispatcher failed while publishing a scheduler event.");
        SchedulerError::Dispatch(e)
      })
  }

  fn notify_error_handlers(&self, failure: &JobFailure) {
    let handlers: Vec<JobErrorHandler> = self.error_handlers.read().clone();
    for handler in handlers {
      if std::panic::catch_unwind(AssertUnwindSafe(|| handler(failure))).is_err() {
        error!(job_id = failure.job_id, "Scheduler error handler panicked.");
      }
    }
  }
}

#[cfg(feature = "work_context")]
async fn run_in_context<F>(job_id: JobId, tick: DateTime<Utc>, execution: F) -> Result<(), WorkError>
where
  F: Future<Output = Result<(), WorkError>>,
{
  use crate::work::context::{ExecutionContext, CURRENT_EXECUTION_CONTEXT};

  CURRENT_EXECUTION_CONTEXT
    .scope(ExecutionContext::for_job(job_id, tick), execution)
    .await
}

#[cfg(not(feature = "work_context"))]
async fn run_in_context<F>(_job_id: JobId, _tick: DateTime<Utc>, execution: F) -> Result<(), WorkError>
where
  F: Future<Output = Result<(), WorkError>>,
{
  execution.await
}
