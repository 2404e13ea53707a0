//! Keyed, non-reentrant advisory locks used to prevent overlapping job runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Pluggable lock capability. Implementations may be process-local or backed by
/// a shared store; the scheduler only relies on this contract.
#[async_trait]
pub trait JobMutex: Send + Sync {
  /// Attempts to take `key` without waiting. A holder's claim lasts at most
  /// `timeout`; after that the key may be taken over.
  async fn try_acquire(&self, key: &str, timeout: Duration) -> bool;

  /// Releases `key`. Releasing a key that is not held is a no-op.
  async fn release(&self, key: &str);
}

/// Process-local [`JobMutex`] with lease expiry.
#[derive(Debug, Default)]
pub struct InMemoryMutex {
  // key -> lease deadline
  leases: Mutex<HashMap<String, Instant>>,
}

impl InMemoryMutex {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns `true` if `key` is currently held by an unexpired lease.
  pub fn is_locked(&self, key: &str) -> bool {
    self
      .leases
      .lock()
      .get(key)
      .is_some_and(|deadline| *deadline > Instant::now())
  }
}

#[async_trait]
impl JobMutex for InMemoryMutex {
  async fn try_acquire(&self, key: &str, timeout: Duration) -> bool {
    let now = Instant::now();
    let mut leases = self.leases.lock();
    match leases.get(key).copied() {
      Some(deadline) if deadline > now => {
        trace!(key, "Mutex key already held.");
        return false;
      }
      Some(_) => debug!(key, "Taking over expired mutex lease."),
      None => {}
    }
    leases.insert(key.to_string(), lease_deadline(now, timeout));
    true
  }

  async fn release(&self, key: &str) {
    self.leases.lock().remove(key);
  }
}

fn lease_deadline(now: Instant, timeout: Duration) -> Instant {
  // Clamp absurd timeouts instead of overflowing the clock.
  now
    .checked_add(timeout)
    .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

/// A key acquired through a [`JobMutex`].
///
/// Dropping it without calling [`HeldKey::release`] (for example when the
/// future running the job is cancelled) releases the key on a spawned task.
pub(crate) struct HeldKey {
  mutex: Arc<dyn JobMutex>,
  key: String,
  runtime: Option<Handle>,
  released: bool,
}

impl HeldKey {
  /// Returns `None` if the key is held by someone else.
  pub(crate) async fn acquire(mutex: &Arc<dyn JobMutex>, key: &str, timeout: Duration) -> Option<Self> {
    if !mutex.try_acquire(key, timeout).await {
      return None;
    }
    Some(Self {
      mutex: mutex.clone(),
      key: key.to_string(),
      runtime: Handle::try_current().ok(),
      released: false,
    })
  }

  pub(crate) async fn release(mut self) {
    self.mutex.release(&self.key).await;
    self.released = true;
  }
}

impl Drop for HeldKey {
  fn drop(&mut self) {
    if self.released {
      return;
    }
    let Some(runtime) = self.runtime.take() else {
      warn!(key = %self.key, "No runtime to release mutex key; it stays held until its lease expires.");
      return;
    };
    debug!(key = %self.key, "Releasing mutex key after an interrupted run.");
    let mutex = self.mutex.clone();
    let key = std::mem::take(&mut self.key);
    runtime.spawn(async move {
      mutex.release(&key).await;
    });
  }
}
