mod common;
use crate::common::{
  setup_tracing, work_counter, work_failing, work_panic, work_recording, CountingHandler,
  FailingHandler, GreetingHandler, RecordingDispatcher,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use steward::{
  EventBus, LifecycleEvent, QueueError, ServiceRegistry, TaskQueue, WorkError, WorkItem,
};

// Queue with an error handler counting failures.
fn queue_with_error_counter() -> (TaskQueue, Arc<AtomicUsize>) {
  let queue = TaskQueue::new();
  let errors = Arc::new(AtomicUsize::new(0));
  let errors_clone = errors.clone();
  queue.on_error(move |failure| {
    tracing::debug!(task_id = %failure.task_id, error = %failure.error, "Error handler called");
    errors_clone.fetch_add(1, Ordering::SeqCst);
  });
  (queue, errors)
}

#[tokio::test]
async fn test_failures_are_isolated_across_drains() {
  setup_tracing();
  let (queue, errors) = queue_with_error_counter();
  let successes = Arc::new(AtomicUsize::new(0));

  queue.enqueue(work_counter(successes.clone()));
  queue.enqueue(work_counter(successes.clone()));
  queue.enqueue(work_failing("boom"));
  queue.enqueue(work_counter(successes.clone()));

  let report = queue.drain().await.expect("drain failed");
  assert_eq!(report.attempted, 4);
  assert_eq!(report.succeeded, 3);
  assert_eq!(report.failed, 1);
  assert_eq!(errors.load(Ordering::SeqCst), 1);
  assert_eq!(successes.load(Ordering::SeqCst), 3);
  assert!(queue.is_empty());

  queue.enqueue(work_counter(successes.clone()));
  queue.enqueue(work_failing("boom again"));
  queue.drain().await.expect("second drain failed");
  assert_eq!(errors.load(Ordering::SeqCst), 2);
  assert_eq!(successes.load(Ordering::SeqCst), 4);

  // Queued after the second drain, never drained.
  queue.enqueue(work_counter(successes.clone()));
  queue.enqueue(work_failing("never runs"));
  assert_eq!(queue.len(), 2);
  assert_eq!(errors.load(Ordering::SeqCst), 2);
  assert_eq!(successes.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_failures_without_handler_are_swallowed() {
  setup_tracing();
  let queue = TaskQueue::new();
  let successes = Arc::new(AtomicUsize::new(0));

  queue.enqueue(work_failing("nobody listens"));
  queue.enqueue(work_counter(successes.clone()));

  let report = queue.drain().await.expect("drain must not fail");
  assert_eq!(report.failed, 1);
  assert_eq!(successes.load(Ordering::SeqCst), 1);
  assert!(queue.is_empty());
}

#[tokio::test]
async fn test_every_error_handler_is_called_in_order() {
  setup_tracing();
  let queue = TaskQueue::new();
  let calls = Arc::new(Mutex::new(Vec::new()));
  for name in ["first", "second"] {
    let calls = calls.clone();
    queue.on_error(move |failure| {
      calls.lock().push(format!("{name}:{}", failure.description));
    });
  }

  queue.enqueue(work_failing("boom").with_description("flaky"));
  queue.drain().await.unwrap();

  assert_eq!(*calls.lock(), vec!["first:flaky", "second:flaky"]);
}

#[tokio::test]
async fn test_drain_on_empty_queue_is_noop() {
  setup_tracing();
  let dispatcher = RecordingDispatcher::new();
  let queue = TaskQueue::builder().dispatcher(dispatcher.clone()).build();
  let errors = Arc::new(AtomicUsize::new(0));
  let errors_clone = errors.clone();
  queue.on_error(move |_| {
    errors_clone.fetch_add(1, Ordering::SeqCst);
  });

  let first = queue.drain().await.unwrap();
  let second = queue.drain().await.unwrap();

  assert_eq!(first.attempted, 0);
  assert_eq!(second.attempted, 0);
  assert_eq!(errors.load(Ordering::SeqCst), 0);
  assert!(dispatcher.events().is_empty());
  assert_eq!(queue.metrics_snapshot().drains_total, 0);
}

#[tokio::test]
async fn test_items_run_in_fifo_order() {
  setup_tracing();
  let queue = TaskQueue::new();
  let log = Arc::new(Mutex::new(Vec::new()));
  for label in ["a", "b", "c", "d"] {
    queue.enqueue(work_recording(log.clone(), label));
  }

  queue.drain().await.unwrap();
  assert_eq!(*log.lock(), vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_items_enqueued_during_drain_wait_for_next_drain() {
  setup_tracing();
  let queue = Arc::new(TaskQueue::new());
  let inner_runs = Arc::new(AtomicUsize::new(0));

  let queue_clone = queue.clone();
  let inner_clone = inner_runs.clone();
  queue.enqueue(WorkItem::from_sync(move || {
    queue_clone.enqueue(work_counter(inner_clone.clone()));
    Ok(())
  }));

  let report = queue.drain().await.unwrap();
  assert_eq!(report.attempted, 1);
  assert_eq!(inner_runs.load(Ordering::SeqCst), 0);
  assert_eq!(queue.len(), 1);

  let report = queue.drain().await.unwrap();
  assert_eq!(report.attempted, 1);
  assert_eq!(inner_runs.load(Ordering::SeqCst), 1);
  assert!(queue.is_empty());
}

#[tokio::test]
async fn test_panic_is_routed_to_error_handler() {
  setup_tracing();
  let queue = TaskQueue::new();
  let panics = Arc::new(AtomicUsize::new(0));
  let panics_clone = panics.clone();
  queue.on_error(move |failure| {
    if failure.error.is_panic() {
      assert!(failure.error.to_string().contains("Work forced panic!"));
      panics_clone.fetch_add(1, Ordering::SeqCst);
    }
  });
  let successes = Arc::new(AtomicUsize::new(0));

  queue.enqueue(work_panic());
  queue.enqueue(work_counter(successes.clone()));
  let report = queue.drain().await.unwrap();

  assert_eq!(report.failed, 1);
  assert_eq!(panics.load(Ordering::SeqCst), 1);
  assert_eq!(successes.load(Ordering::SeqCst), 1);

  let metrics = queue.metrics_snapshot();
  assert_eq!(metrics.tasks_panicked, 1);
  assert_eq!(metrics.tasks_failed, 1);
  assert_eq!(metrics.tasks_succeeded, 1);
}

#[tokio::test]
async fn test_dispatcher_receives_consumption_events() {
  setup_tracing();
  let dispatcher = RecordingDispatcher::new();
  let queue = TaskQueue::builder().dispatcher(dispatcher.clone()).build();

  queue.enqueue(work_counter(Arc::new(AtomicUsize::new(0))));
  queue.enqueue(work_failing("boom"));
  queue.drain().await.unwrap();

  assert_eq!(
    dispatcher.events(),
    vec![
      LifecycleEvent::QueueConsumptionStarted,
      LifecycleEvent::QueueConsumptionEnded {
        attempted: 2,
        failed: 1
      },
    ]
  );
}

#[tokio::test]
async fn test_dispatcher_failure_propagates_and_keeps_batch() {
  setup_tracing();
  let dispatcher = RecordingDispatcher::failing();
  let queue = TaskQueue::builder().dispatcher(dispatcher.clone()).build();
  let runs = Arc::new(AtomicUsize::new(0));

  queue.enqueue(work_counter(runs.clone()));
  queue.enqueue(work_counter(runs.clone()));

  let result = queue.drain().await;
  assert!(matches!(result, Err(QueueError::Dispatch(_))));
  assert_eq!(runs.load(Ordering::SeqCst), 0);
  assert_eq!(queue.len(), 2, "batch must be restored");

  dispatcher.set_failing(false);
  let report = queue.drain().await.unwrap();
  assert_eq!(report.succeeded, 2);
  assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invocable_is_resolved_per_execution() {
  setup_tracing();
  let registry = ServiceRegistry::new();
  let runs = Arc::new(AtomicUsize::new(0));
  let constructed = Arc::new(AtomicUsize::new(0));
  {
    let runs = runs.clone();
    let constructed = constructed.clone();
    registry.register(move || {
      constructed.fetch_add(1, Ordering::SeqCst);
      CountingHandler { runs: runs.clone() }
    });
  }
  let queue = TaskQueue::builder()
    .scope_factory(Arc::new(registry.clone()))
    .build();

  queue.enqueue_invocable::<CountingHandler>();
  queue.enqueue_invocable::<CountingHandler>();
  queue.drain().await.unwrap();
  queue.drain().await.unwrap();

  assert_eq!(runs.load(Ordering::SeqCst), 2);
  assert_eq!(constructed.load(Ordering::SeqCst), 2);
  assert_eq!(registry.scopes_created(), 2);
  assert_eq!(registry.scopes_disposed(), 2);
}

#[tokio::test]
async fn test_invocable_with_payload_receives_payload() {
  setup_tracing();
  let registry = ServiceRegistry::new();
  let greeted = Arc::new(Mutex::new(Vec::new()));
  {
    let greeted = greeted.clone();
    registry.register(move || GreetingHandler {
      greeted: greeted.clone(),
      name: None,
    });
  }
  let queue = TaskQueue::builder()
    .scope_factory(Arc::new(registry))
    .build();

  queue.enqueue_invocable_with_payload::<GreetingHandler>("ada".to_string());
  queue.enqueue_invocable_with_payload::<GreetingHandler>("grace".to_string());
  let report = queue.drain().await.unwrap();

  assert_eq!(report.succeeded, 2);
  assert_eq!(*greeted.lock(), vec!["hello ada", "hello grace"]);
}

#[tokio::test]
async fn test_resolution_failures_are_routed_to_handlers() {
  setup_tracing();
  let registry = ServiceRegistry::new();
  registry.register(|| FailingHandler);
  let queue = TaskQueue::builder()
    .scope_factory(Arc::new(registry.clone()))
    .build();
  let failures = Arc::new(Mutex::new(Vec::new()));
  let failures_clone = failures.clone();
  queue.on_error(move |failure| {
    failures_clone
      .lock()
      .push((failure.error.is_resolution(), failure.error.to_string()));
  });

  // Registered, fails while running.
  queue.enqueue_invocable::<FailingHandler>();
  // Never registered.
  queue.enqueue_invocable::<CountingHandler>();
  let report = queue.drain().await.unwrap();

  assert_eq!(report.failed, 2);
  let failures = failures.lock();
  assert!(!failures[0].0);
  assert!(failures[0].1.contains("handler refused"));
  assert!(failures[1].0);
  assert!(failures[1].1.contains("CountingHandler"));
  // Scopes are disposed even when resolution fails.
  assert_eq!(registry.scopes_created(), 2);
  assert_eq!(registry.scopes_disposed(), 2);
}

#[tokio::test]
async fn test_no_dispatcher_and_no_resolver_never_fail_drain() {
  setup_tracing();
  let (queue, errors) = queue_with_error_counter();

  queue.enqueue_invocable::<CountingHandler>();
  queue.enqueue_sync(|| Ok(()));
  let report = queue.drain().await.expect("drain must succeed without capabilities");

  assert_eq!(report.succeeded, 1);
  assert_eq!(report.failed, 1);
  assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_work_fn_macro_builds_queueable_items() {
  setup_tracing();
  let queue = TaskQueue::new();
  let counter = Arc::new(AtomicUsize::new(0));
  let counter_clone = counter.clone();

  queue.enqueue(steward::work_fn! {
    {
      let counter = counter_clone.clone();
    }
    {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  });
  queue.enqueue(steward::work_fn! {
    {
      let _value: u32 = "not a number".parse()?;
      Ok(())
    }
  });

  let report = queue.drain().await.unwrap();
  assert_eq!(report.succeeded, 1);
  assert_eq!(report.failed, 1);
  assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_metrics_track_waiting_and_totals() {
  setup_tracing();
  let queue = TaskQueue::new();
  let runs = Arc::new(AtomicUsize::new(0));
  queue.enqueue(work_counter(runs.clone()));
  queue.enqueue(work_counter(runs.clone()));

  let before = queue.metrics_snapshot();
  assert_eq!(before.tasks_enqueued, 2);
  assert_eq!(before.tasks_waiting_current, 2);
  assert_eq!(before.tasks_running_current, 0);

  queue.drain().await.unwrap();
  let after = queue.metrics_snapshot();
  assert_eq!(after.tasks_waiting_current, 0);
  assert_eq!(after.tasks_running_current, 0);
  assert_eq!(after.tasks_succeeded, 2);
  assert_eq!(after.drains_total, 1);
  assert_eq!(after.task_execution_duration_count, 2);
}

#[tokio::test]
async fn test_event_bus_calls_every_listener_and_reports_first_failure() {
  setup_tracing();
  let bus = EventBus::new();
  let seen = Arc::new(AtomicUsize::new(0));
  let (seen_a, seen_b) = (seen.clone(), seen.clone());
  bus
    .subscribe(move |_event: &LifecycleEvent| {
      seen_a.fetch_add(1, Ordering::SeqCst);
      Err("first listener refused".into())
    })
    .subscribe(move |_event: &LifecycleEvent| {
      seen_b.fetch_add(1, Ordering::SeqCst);
      Err("second listener refused".into())
    });
  assert_eq!(bus.listener_count(), 2);

  let queue = TaskQueue::builder().dispatcher(Arc::new(bus)).build();
  let runs = Arc::new(AtomicUsize::new(0));
  queue.enqueue(work_counter(runs.clone()));

  match queue.drain().await {
    Err(QueueError::Dispatch(e)) => assert_eq!(e.to_string(), "first listener refused"),
    other => panic!("expected dispatch error, got {other:?}"),
  }
  // Both listeners saw the start event; the batch went back untouched.
  assert_eq!(seen.load(Ordering::SeqCst), 2);
  assert_eq!(runs.load(Ordering::SeqCst), 0);
  assert_eq!(queue.len(), 1);
}

// Renders an error and its whole `source()` chain, as error reporters do.
fn render_chain(error: &dyn std::error::Error) -> String {
  let mut rendered = error.to_string();
  let mut current = error.source();
  while let Some(cause) = current {
    rendered.push_str(&format!(" <- {cause}"));
    current = cause.source();
  }
  rendered
}

#[test]
fn test_failure_messages_appear_once_in_error_chain() {
  setup_tracing();
  let failed = WorkError::Failed("disk full".into());
  assert_eq!(render_chain(&failed), "work item failed: disk full");
  assert_eq!(failed.cause().map(|c| c.to_string()).as_deref(), Some("disk full"));

  let resolution = WorkError::Resolution {
    type_name: "Mailer",
    cause: "not registered".into(),
  };
  assert_eq!(
    render_chain(&resolution),
    "failed to resolve handler `Mailer`: not registered"
  );
  assert!(resolution.is_resolution());

  let panicked = WorkError::Panicked("boom".to_string());
  assert!(panicked.cause().is_none());

  let dispatch = QueueError::Dispatch("listener refused".into());
  assert_eq!(render_chain(&dispatch).matches("listener refused").count(), 1);
}
