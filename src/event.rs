//! Lifecycle events and the dispatcher capability used to publish them.
//!
//! Both engines take an optional `Arc<dyn EventDispatcher>`. When none is
//! configured publication is skipped entirely. When one is configured and it
//! fails, the failure is returned to the caller of `drain` / `run_at`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::error::BoxError;
use crate::scheduler::JobId;

/// How a matched scheduled job ended within a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum JobOutcome {
  Succeeded { duration: Duration },
  Failed { duration: Duration, error: String },
  /// The job's mutex was held elsewhere; it did not run this tick.
  SkippedOverlap,
}

/// Events emitted by the queue and the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LifecycleEvent {
  /// A drain is about to execute its batch.
  QueueConsumptionStarted,
  /// A drain finished its batch.
  QueueConsumptionEnded { attempted: usize, failed: usize },
  /// A scheduled job matched the tick and is about to be executed.
  ScheduledJobStarted {
    job_id: JobId,
    mutex_key: String,
    description: String,
    tick: DateTime<Utc>,
  },
  /// A matched job has been handled for this tick.
  ScheduledJobEnded {
    job_id: JobId,
    outcome: JobOutcome,
    tick: DateTime<Utc>,
  },
}

/// Publish capability consumed by the engines.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
  async fn publish(&self, event: LifecycleEvent) -> Result<(), BoxError>;
}

/// Publishes through an optional dispatcher; absent means no-op.
pub(crate) async fn publish_optional(
  dispatcher: Option<&Arc<dyn EventDispatcher>>,
  event: LifecycleEvent,
) -> Result<(), BoxError> {
  match dispatcher {
    Some(dispatcher) => {
      trace!(?event, "Publishing lifecycle event.");
      dispatcher.publish(event).await
    }
    None => Ok(()),
  }
}

type Listener = Arc<dyn Fn(&LifecycleEvent) -> Result<(), BoxError> + Send + Sync + 'static>;

/// In-process [`EventDispatcher`] with an ordered list of listeners.
///
/// Every listener sees every event, even when an earlier listener fails.
/// The first failure is returned to the publisher afterwards.
#[derive(Clone, Default)]
pub struct EventBus {
  listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds a listener. Listeners are called in subscription order.
  pub fn subscribe<F>(&self, listener: F) -> &Self
  where
    F: Fn(&LifecycleEvent) -> Result<(), BoxError> + Send + Sync + 'static,
  {
    self.listeners.write().push(Arc::new(listener));
    self
  }

  pub fn listener_count(&self) -> usize {
    self.listeners.read().len()
  }
}

#[async_trait]
impl EventDispatcher for EventBus {
  async fn publish(&self, event: LifecycleEvent) -> Result<(), BoxError> {
    let listeners: Vec<Listener> = self.listeners.read().clone();
    let mut first_error = None;
    for (index, listener) in listeners.iter().enumerate() {
      if let Err(e) = listener(&event) {
        warn!(listener = index, error = %e, "Event listener failed.");
        if first_error.is_none() {
          first_error = Some(e);
        }
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}
