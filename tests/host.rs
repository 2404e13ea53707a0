mod common;
use crate::common::{setup_tracing, work_counter};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use steward::{BuildError, Host, Scheduler, ShutdownError, TaskQueue};

#[tokio::test]
async fn test_builder_validation() {
  setup_tracing();
  assert!(matches!(
    Host::builder().start(),
    Err(BuildError::NothingToHost)
  ));
  assert!(matches!(
    Host::builder()
      .queue(Arc::new(TaskQueue::new()))
      .queue_interval(StdDuration::ZERO)
      .start(),
    Err(BuildError::ZeroInterval {
      name: "queue_interval",
      ..
    })
  ));
}

#[tokio::test]
async fn test_queue_loop_drains_periodically() {
  setup_tracing();
  let queue = Arc::new(TaskQueue::new());
  let runs = Arc::new(AtomicUsize::new(0));
  let host = Host::builder()
    .queue(queue.clone())
    .queue_interval(StdDuration::from_millis(20))
    .start()
    .unwrap();

  queue.enqueue(work_counter(runs.clone()));
  queue.enqueue(work_counter(runs.clone()));
  tokio::time::sleep(StdDuration::from_millis(200)).await;

  assert_eq!(runs.load(Ordering::SeqCst), 2);
  assert!(queue.is_empty());
  host
    .shutdown_graceful(Some(StdDuration::from_secs(5)))
    .await
    .unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_drains_remaining_items() -> anyhow::Result<()> {
  setup_tracing();
  let queue = Arc::new(TaskQueue::new());
  let runs = Arc::new(AtomicUsize::new(0));
  let host = Host::builder()
    .queue(queue.clone())
    .queue_interval(StdDuration::from_secs(3600))
    .start()?;

  queue.enqueue(work_counter(runs.clone()));
  queue.enqueue(work_counter(runs.clone()));
  host
    .shutdown_graceful(Some(StdDuration::from_secs(5)))
    .await?;

  assert_eq!(runs.load(Ordering::SeqCst), 2);
  assert!(queue.is_empty());
  assert!(host.is_shutting_down());
  Ok(())
}

#[tokio::test]
async fn test_forced_shutdown_leaves_queue_untouched() {
  setup_tracing();
  let queue = Arc::new(TaskQueue::new());
  let runs = Arc::new(AtomicUsize::new(0));
  let host = Host::builder()
    .queue(queue.clone())
    .queue_interval(StdDuration::from_secs(3600))
    .start()
    .unwrap();

  queue.enqueue(work_counter(runs.clone()));
  host
    .shutdown_force(Some(StdDuration::from_secs(5)))
    .await
    .unwrap();

  assert_eq!(runs.load(Ordering::SeqCst), 0);
  assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn test_second_shutdown_is_rejected() {
  setup_tracing();
  let host = Host::builder()
    .queue(Arc::new(TaskQueue::new()))
    .start()
    .unwrap();

  host.shutdown_graceful(None).await.unwrap();
  assert_eq!(
    host.shutdown_force(None).await,
    Err(ShutdownError::AlreadyShuttingDown)
  );
  assert_eq!(
    host.shutdown_graceful(None).await,
    Err(ShutdownError::AlreadyShuttingDown)
  );
}

#[tokio::test]
async fn test_scheduler_loop_ticks_once_per_minute() {
  setup_tracing();
  let scheduler = Arc::new(Scheduler::new());
  let runs = Arc::new(AtomicUsize::new(0));
  scheduler.schedule(work_counter(runs.clone())).every_minute();

  let host = Host::builder()
    .scheduler(scheduler.clone())
    .poll_interval(StdDuration::from_millis(10))
    .start()
    .unwrap();
  tokio::time::sleep(StdDuration::from_millis(250)).await;
  host
    .shutdown_graceful(Some(StdDuration::from_secs(5)))
    .await
    .unwrap();

  // Many polls, but at most one tick per wall-clock minute (two if a minute boundary was crossed).
  let runs = runs.load(Ordering::SeqCst);
  assert!((1..=2).contains(&runs), "unexpected run count {runs}");
  assert_eq!(scheduler.metrics_snapshot().ticks_total, runs);
}
