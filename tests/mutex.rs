mod common;
use crate::common::setup_tracing;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use steward::{InMemoryMutex, JobMutex};

#[tokio::test]
async fn test_key_is_exclusive_until_released() {
  setup_tracing();
  let mutex = InMemoryMutex::new();
  let timeout = StdDuration::from_secs(60);

  assert!(mutex.try_acquire("report", timeout).await);
  assert!(mutex.is_locked("report"));
  assert!(!mutex.try_acquire("report", timeout).await, "not reentrant");
  // Keys are independent.
  assert!(mutex.try_acquire("cleanup", timeout).await);

  mutex.release("report").await;
  assert!(!mutex.is_locked("report"));
  assert!(mutex.try_acquire("report", timeout).await);
}

#[tokio::test]
async fn test_releasing_unknown_key_is_noop() {
  setup_tracing();
  let mutex = InMemoryMutex::new();
  mutex.release("never-acquired").await;
  assert!(!mutex.is_locked("never-acquired"));
}

#[tokio::test(start_paused = true)]
async fn test_expired_lease_can_be_taken_over() {
  setup_tracing();
  let mutex = InMemoryMutex::new();
  let lease = StdDuration::from_secs(5 * 60);

  assert!(mutex.try_acquire("stuck-job", lease).await);

  tokio::time::advance(StdDuration::from_secs(4 * 60)).await;
  assert!(!mutex.try_acquire("stuck-job", lease).await);

  tokio::time::advance(StdDuration::from_secs(61)).await;
  assert!(!mutex.is_locked("stuck-job"));
  assert!(mutex.try_acquire("stuck-job", lease).await);
  assert!(mutex.is_locked("stuck-job"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_has_single_winner() {
  setup_tracing();
  let mutex = Arc::new(InMemoryMutex::new());

  let attempts = (0..16).map(|_| {
    let mutex = mutex.clone();
    tokio::spawn(async move { mutex.try_acquire("contended", StdDuration::from_secs(60)).await })
  });
  let results = futures::future::join_all(attempts).await;

  let winners = results
    .into_iter()
    .map(|joined| joined.expect("acquire task panicked"))
    .filter(|acquired| *acquired)
    .count();
  assert_eq!(winners, 1);
}
