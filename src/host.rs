//! Optional background driver for a [`Scheduler`] and a [`TaskQueue`].
//!
//! The engines themselves never read the clock or spawn tasks. `Host` spawns one
//! loop per engine: the scheduler loop polls the wall clock and calls `run_at`
//! once per new minute, the queue loop calls `drain` on a fixed interval.

use crate::error::{BuildError, ShutdownError};
use crate::queue::TaskQueue;
use crate::recurrence::truncate_to_minute;
use crate::scheduler::Scheduler;

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_QUEUE_INTERVAL: Duration = Duration::from_secs(30);

/// Defines the mode for shutting down the host loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Let the current iteration finish, then stop. The queue is drained one last
  /// time if `consume_queue_on_shutdown` is set.
  Graceful,
  /// Abort the loops, interrupting any running tick or drain at its next await point.
  Force,
}

/// Builder for a [`Host`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use steward::{Host, Scheduler, TaskQueue};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = Arc::new(Scheduler::new());
/// let queue = Arc::new(TaskQueue::new());
///
/// let host = Host::builder()
///   .scheduler(scheduler.clone())
///   .queue(queue.clone())
///   .queue_interval(Duration::from_secs(5))
///   .start()?;
///
/// // ... application runs ...
///
/// host.shutdown_graceful(Some(Duration::from_secs(10))).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct HostBuilder {
  scheduler: Option<Arc<Scheduler>>,
  queue: Option<Arc<TaskQueue>>,
  poll_interval: Duration,
  queue_interval: Duration,
  consume_queue_on_shutdown: bool,
}

impl Default for HostBuilder {
  fn default() -> Self {
    Self {
      scheduler: None,
      queue: None,
      poll_interval: DEFAULT_POLL_INTERVAL,
      queue_interval: DEFAULT_QUEUE_INTERVAL,
      consume_queue_on_shutdown: true,
    }
  }
}

impl HostBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
    self.scheduler = Some(scheduler);
    self
  }

  pub fn queue(mut self, queue: Arc<TaskQueue>) -> Self {
    self.queue = Some(queue);
    self
  }

  /// How often the scheduler loop looks at the clock. Ticks still happen at most
  /// once per minute.
  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  /// How often the queue loop drains the queue.
  pub fn queue_interval(mut self, interval: Duration) -> Self {
    self.queue_interval = interval;
    self
  }

  /// Whether a graceful shutdown drains the queue one last time. Defaults to `true`.
  pub fn consume_queue_on_shutdown(mut self, consume: bool) -> Self {
    self.consume_queue_on_shutdown = consume;
    self
  }

  /// Spawns the background loops. Must be called from within a Tokio runtime.
  ///
  /// # Errors
  ///
  /// - `BuildError::NothingToHost` if neither a scheduler nor a queue was given.
  /// - `BuildError::ZeroInterval` if an interval is zero.
  pub fn start(self) -> Result<Host, BuildError> {
    if self.scheduler.is_none() && self.queue.is_none() {
      return Err(BuildError::NothingToHost);
    }
    for (name, value) in [
      ("poll_interval", self.poll_interval),
      ("queue_interval", self.queue_interval),
    ] {
      if value.is_zero() {
        return Err(BuildError::ZeroInterval { name, value });
      }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);
    let mut handles = Vec::with_capacity(2);

    if let Some(scheduler) = self.scheduler {
      info!(poll_interval = ?self.poll_interval, "Starting scheduler loop.");
      handles.push((
        "scheduler",
        tokio::spawn(scheduler_loop(scheduler, self.poll_interval, shutdown_rx.clone())),
      ));
    }
    if let Some(queue) = self.queue {
      info!(queue_interval = ?self.queue_interval, "Starting queue loop.");
      handles.push((
        "queue",
        tokio::spawn(queue_loop(
          queue,
          self.queue_interval,
          self.consume_queue_on_shutdown,
          shutdown_rx,
        )),
      ));
    }

    Ok(Host {
      shutdown_tx,
      shutting_down: AtomicBool::new(false),
      handles: Mutex::new(handles),
    })
  }
}

/// Handle to the running background loops.
///
/// Dropping the handle without calling a shutdown method leaves the loops
/// running until the runtime shuts down.
#[derive(Debug)]
pub struct Host {
  shutdown_tx: watch::Sender<Option<ShutdownMode>>,
  shutting_down: AtomicBool,
  handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Host {
  pub fn builder() -> HostBuilder {
    HostBuilder::new()
  }

  /// `true` once a shutdown has been requested.
  pub fn is_shutting_down(&self) -> bool {
    self.shutting_down.load(AtomicOrdering::Acquire)
  }

  /// Initiates a graceful shutdown and waits for the loops to exit.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::AlreadyShuttingDown`]: a shutdown was already requested.
  /// - [`ShutdownError::SignalFailed`]: the loops are already gone.
  /// - [`ShutdownError::Timeout`]: waiting exceeded `timeout`.
  /// - [`ShutdownError::TaskPanic`]: a loop panicked.
  pub async fn shutdown_graceful(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    self.begin_shutdown()?;
    info!("Initiating graceful host shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Graceful))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  /// Initiates a forced shutdown: the loops are aborted and awaited.
  ///
  /// # Errors
  ///
  /// Same as [`shutdown_graceful`](Host::shutdown_graceful).
  pub async fn shutdown_force(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    self.begin_shutdown()?;
    info!("Initiating forced host shutdown...");
    // Receivers may already be gone if a loop exited; aborting still applies.
    let _ = self.shutdown_tx.send(Some(ShutdownMode::Force));
    for (name, handle) in self.handles.lock().await.iter() {
      debug!(loop_name = *name, "Aborting host loop.");
      handle.abort();
    }
    self.await_shutdown(timeout).await
  }

  fn begin_shutdown(&self) -> Result<(), ShutdownError> {
    if self.shutting_down.swap(true, AtomicOrdering::AcqRel) {
      warn!("Shutdown requested while already shutting down.");
      return Err(ShutdownError::AlreadyShuttingDown);
    }
    Ok(())
  }

  async fn await_shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let handles = std::mem::take(&mut *self.handles.lock().await);
    if handles.is_empty() {
      warn!("No host loops found to await during shutdown.");
      return Ok(());
    }

    let joins = handles.into_iter().map(|(name, handle)| async move {
      match handle.await {
        Ok(()) => {
          debug!(loop_name = name, "Host loop joined.");
          Ok(())
        }
        Err(e) if e.is_cancelled() => {
          debug!(loop_name = name, "Host loop aborted.");
          Ok(())
        }
        Err(e) => {
          error!(loop_name = name, "Host loop panicked: {:?}", e);
          Err(ShutdownError::TaskPanic)
        }
      }
    });
    let join_all_fut = try_join_all(joins);

    let result = match timeout {
      Some(timeout) => match tokio::time::timeout(timeout, join_all_fut).await {
        Ok(joined) => joined.map(|_| ()),
        Err(_) => {
          error!("Host shutdown timed out after {:?}", timeout);
          Err(ShutdownError::Timeout)
        }
      },
      None => join_all_fut.await.map(|_| ()),
    };

    if result.is_ok() {
      info!("All host loops joined successfully.");
    }
    result
  }
}

// --- Loops ---

fn shutdown_requested(rx: &watch::Receiver<Option<ShutdownMode>>) -> Option<ShutdownMode> {
  *rx.borrow()
}

async fn scheduler_loop(
  scheduler: Arc<Scheduler>,
  poll_interval: Duration,
  mut shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
) {
  let mut interval = tokio::time::interval(poll_interval);
  interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
  let mut last_tick: Option<DateTime<Utc>> = None;

  loop {
    tokio::select! {
      biased;
      changed = shutdown_rx.changed() => {
        if changed.is_err() || shutdown_requested(&shutdown_rx).is_some() {
          break;
        }
      }
      _ = interval.tick() => {
        let minute = truncate_to_minute(Utc::now());
        if last_tick == Some(minute) {
          continue;
        }
        last_tick = Some(minute);
        match scheduler.run_at(minute).await {
          Ok(report) => debug!(tick = %report.tick, matched = report.matched, "Scheduler tick completed."),
          Err(e) => error!(tick = %minute, error = %e, "Scheduler tick returned an error."),
        }
      }
    }
  }
  info!("Scheduler loop stopped.");
}

async fn queue_loop(
  queue: Arc<TaskQueue>,
  queue_interval: Duration,
  consume_on_shutdown: bool,
  mut shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
) {
  let mut interval = tokio::time::interval(queue_interval);
  interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
  // The first tick completes immediately; skip it so drains start one interval in.
  interval.tick().await;

  loop {
    tokio::select! {
      biased;
      changed = shutdown_rx.changed() => {
        if changed.is_err() || shutdown_requested(&shutdown_rx).is_some() {
          break;
        }
      }
      _ = interval.tick() => drain_once(&queue).await,
    }
  }

  if consume_on_shutdown && shutdown_requested(&shutdown_rx) == Some(ShutdownMode::Graceful) {
    info!(pending = queue.len(), "Draining queue before shutdown.");
    drain_once(&queue).await;
  }
  info!("Queue loop stopped.");
}

async fn drain_once(queue: &TaskQueue) {
  match queue.drain().await {
    Ok(report) if report.attempted > 0 => debug!(
      attempted = report.attempted,
      failed = report.failed,
      "Queue drain completed."
    ),
    Ok(_) => {}
    Err(e) => error!(error = %e, "Queue drain returned an error."),
  }
}
