//! demos/invocable_jobs.rs
//!
//! Handler types resolved per execution through a `ServiceRegistry`, driven by
//! explicit timestamps instead of the wall clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use steward::{
  async_trait, EventBus, Invocable, InvocableWithPayload, LifecycleEvent, Scheduler,
  ServiceRegistry, TaskQueue, WorkResult,
};
use tracing::info;

struct SendInvoice {
  sent: Arc<AtomicUsize>,
  customer: Option<String>,
}

#[async_trait]
impl Invocable for SendInvoice {
  async fn invoke(&self) -> WorkResult {
    let customer = self.customer.as_deref().ok_or("no customer set")?;
    let total = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
    info!(customer, total, "Invoice sent");
    Ok(())
  }
}

impl InvocableWithPayload for SendInvoice {
  type Payload = String;

  fn set_payload(&mut self, customer: String) {
    self.customer = Some(customer);
  }
}

struct PurgeSessions;

#[async_trait]
impl Invocable for PurgeSessions {
  async fn invoke(&self) -> WorkResult {
    info!("Purging expired sessions");
    Ok(())
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,steward=debug,invocable_jobs=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  // --- Capabilities ---
  let sent = Arc::new(AtomicUsize::new(0));
  let registry = ServiceRegistry::new();
  {
    let sent = sent.clone();
    registry
      .register(move || SendInvoice {
        sent: sent.clone(),
        customer: None,
      })
      .register(|| PurgeSessions);
  }

  let events = EventBus::new();
  events.subscribe(|event: &LifecycleEvent| {
    info!(?event, "Lifecycle event");
    Ok(())
  });

  // --- Queue ---
  let queue = TaskQueue::builder()
    .scope_factory(Arc::new(registry.clone()))
    .dispatcher(Arc::new(events.clone()))
    .build();
  queue.enqueue_invocable_with_payload::<SendInvoice>("acme".to_string());
  queue.enqueue_invocable_with_payload::<SendInvoice>("globex".to_string());
  let report = queue.drain().await?;
  info!(?report, "Queue drained");

  // --- Scheduler ---
  let scheduler = Scheduler::builder()
    .scope_factory(Arc::new(registry.clone()))
    .dispatcher(Arc::new(events))
    .build()?;
  scheduler
    .schedule_invocable::<PurgeSessions>()
    .daily_at(3, 0)?
    .weekend();

  // Saturday 2024-01-06 03:00 UTC, then Monday at the same time.
  for instant in [
    Utc.with_ymd_and_hms(2024, 1, 6, 3, 0, 0).single(),
    Utc.with_ymd_and_hms(2024, 1, 8, 3, 0, 0).single(),
  ]
  .into_iter()
  .flatten()
  {
    let report = scheduler.run_at(instant).await?;
    info!(?report, "Tick evaluated");
  }

  info!(
    invoices = sent.load(Ordering::SeqCst),
    scopes_created = registry.scopes_created(),
    scopes_disposed = registry.scopes_disposed(),
    "Done."
  );
  Ok(())
}
