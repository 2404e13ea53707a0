//! tests/common.rs
//! Shared helper functions for integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use steward::{
  async_trait, BoxError, EventDispatcher, Invocable, InvocableWithPayload, LifecycleEvent,
  WorkItem, WorkResult,
};
use tracing_subscriber::fmt::TestWriter;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// Builds a UTC instant at minute resolution.
pub fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
  Utc
    .with_ymd_and_hms(year, month, day, hour, minute, 0)
    .single()
    .expect("valid test timestamp")
}

// Work item that increments a counter and succeeds.
pub fn work_counter(counter: Arc<AtomicUsize>) -> WorkItem {
  WorkItem::from_fn(move || {
    let ctr = counter.clone();
    async move {
      let count = ctr.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!("Counter work executing (Count: {})", count);
      Ok(())
    }
  })
}

// Work item that increments a counter, optionally sleeps, then succeeds.
pub fn work_sleep_counter(counter: Arc<AtomicUsize>, delay: StdDuration) -> WorkItem {
  WorkItem::from_fn(move || {
    let ctr = counter.clone();
    async move {
      tokio::time::sleep(delay).await;
      ctr.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  })
}

// Work item that returns an error.
pub fn work_failing(message: &'static str) -> WorkItem {
  WorkItem::from_fn(move || async move {
    tracing::debug!("Failing work executing...");
    Err::<(), BoxError>(message.into())
  })
}

// Work item that panics after an await point.
pub fn work_panic() -> WorkItem {
  WorkItem::from_fn(|| async {
    tracing::debug!("Panic work executing...");
    tokio::task::yield_now().await;
    panic!("Work forced panic!");
    // Unreachable, but needed for type check
    #[allow(unreachable_code)]
    Ok(())
  })
}

// Work item that appends its label to a shared log.
pub fn work_recording(log: Arc<Mutex<Vec<String>>>, label: &'static str) -> WorkItem {
  WorkItem::from_sync(move || {
    log.lock().push(label.to_string());
    Ok(())
  })
  .with_description(label)
}

// --- Dispatchers ---

/// Records every published event; can be switched to fail.
#[derive(Default)]
pub struct RecordingDispatcher {
  events: Mutex<Vec<LifecycleEvent>>,
  fail: AtomicBool,
}

impl RecordingDispatcher {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn failing() -> Arc<Self> {
    let dispatcher = Self::default();
    dispatcher.fail.store(true, Ordering::SeqCst);
    Arc::new(dispatcher)
  }

  pub fn set_failing(&self, fail: bool) {
    self.fail.store(fail, Ordering::SeqCst);
  }

  pub fn events(&self) -> Vec<LifecycleEvent> {
    self.events.lock().clone()
  }
}

#[async_trait]
impl EventDispatcher for RecordingDispatcher {
  async fn publish(&self, event: LifecycleEvent) -> Result<(), BoxError> {
    if self.fail.load(Ordering::SeqCst) {
      return Err("subscriber exploded".into());
    }
    self.events.lock().push(event);
    Ok(())
  }
}

// --- Handlers ---

/// Resolved handler counting its invocations through a shared counter.
pub struct CountingHandler {
  pub runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Invocable for CountingHandler {
  async fn invoke(&self) -> WorkResult {
    self.runs.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

/// Resolved handler that always fails.
pub struct FailingHandler;

#[async_trait]
impl Invocable for FailingHandler {
  async fn invoke(&self) -> WorkResult {
    Err("handler refused".into())
  }
}

/// Resolved handler that records the payload it was given.
pub struct GreetingHandler {
  pub greeted: Arc<Mutex<Vec<String>>>,
  pub name: Option<String>,
}

#[async_trait]
impl Invocable for GreetingHandler {
  async fn invoke(&self) -> WorkResult {
    let name = self.name.clone().ok_or("payload missing")?;
    self.greeted.lock().push(format!("hello {name}"));
    Ok(())
  }
}

impl InvocableWithPayload for GreetingHandler {
  type Payload = String;

  fn set_payload(&mut self, payload: String) {
    self.name = Some(payload);
  }
}
