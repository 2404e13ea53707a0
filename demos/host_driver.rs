//! demos/host_driver.rs
//!
//! Runs a scheduler and a task queue in the background with `Host`, then shuts
//! down gracefully so the queue is drained one last time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use steward::{work_fn, FailurePolicy, Host, Scheduler, TaskQueue};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,steward=info,host_driver=debug")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  // --- Engines ---
  let scheduler = Arc::new(
    Scheduler::builder()
      .failure_policy(FailurePolicy::Isolate)
      .build()?,
  );
  let queue = Arc::new(TaskQueue::new());
  queue.on_error(|failure| {
    warn!(task_id = %failure.task_id, error = %failure.error, "Queued task failed");
  });

  // --- Recurring job that feeds the queue ---
  let ticks = Arc::new(AtomicUsize::new(0));
  let ticks_clone = ticks.clone();
  let queue_clone = queue.clone();
  scheduler
    .schedule(work_fn! {
      {
        let ticks = ticks_clone.clone();
        let queue = queue_clone.clone();
      }
      {
        let tick = ticks.fetch_add(1, Ordering::SeqCst) + 1;
        info!(tick, "Scheduled job enqueueing follow-up work");
        queue.enqueue_sync(move || {
          info!(tick, "Follow-up work running");
          Ok(())
        });
        Ok(())
      }
    })
    .every_minute()
    .prevent_overlapping("feeder");

  // --- Start Host ---
  let host = Host::builder()
    .scheduler(scheduler.clone())
    .queue(queue.clone())
    .queue_interval(StdDuration::from_secs(2))
    .start()?;
  info!("Host started.");

  tokio::time::sleep(StdDuration::from_secs(5)).await;

  info!(pending = queue.len(), "Requesting graceful shutdown...");
  host.shutdown_graceful(Some(StdDuration::from_secs(10))).await?;
  info!(
    scheduler = ?scheduler.metrics_snapshot(),
    queue = ?queue.metrics_snapshot(),
    "Host stopped."
  );
  Ok(())
}
