#[cfg(feature = "work_context")]
pub mod context;

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::trace;
use uuid::Uuid;

use crate::error::{BoxError, WorkError};
use crate::resolve::{Instance, ScopeFactory};

// --- Public Type Aliases ---

/// Type alias for the unique identifier of a queued task.
/// Uses UUID v4.
pub type TaskId = Uuid;

/// Outcome of a single work item execution. `Err` values are routed to error handlers.
pub type WorkResult = Result<(), BoxError>;

/// The boxed future a work item produces for one execution.
pub type WorkFuture = Pin<Box<dyn Future<Output = WorkResult> + Send + 'static>>;

/// The function type that inline work items execute.
///
/// The function must be `Send + Sync + 'static` and return a `Future`
/// that resolves to a [`WorkResult`].
/// - `Ok(())` indicates success.
/// - `Err(e)` indicates failure; `e` is handed to the registered error handlers.
/// Panics within the function (or while building its future) are caught and
/// surfaced as [`WorkError::Panicked`].
pub type BoxedWorkFn = Box<dyn Fn() -> WorkFuture + Send + Sync + 'static>;

type ResolvedRunFn = Box<dyn Fn(Instance) -> Result<WorkFuture, BoxError> + Send + Sync + 'static>;

// --- Handler Traits ---

/// A handler type that is resolved fresh for every execution and then invoked.
///
/// Register a factory for the type with a [`ScopeFactory`] (e.g. `ServiceRegistry`)
/// and queue or schedule it with `WorkItem::invocable::<T>()`.
#[async_trait]
pub trait Invocable: Send + Sync + 'static {
  async fn invoke(&self) -> WorkResult;
}

/// An [`Invocable`] that receives a payload before it is invoked.
pub trait InvocableWithPayload: Invocable {
  type Payload: Clone + Send + Sync + 'static;

  fn set_payload(&mut self, payload: Self::Payload);
}

/// Names a resolvable handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeToken {
  id: TypeId,
  name: &'static str,
}

impl TypeToken {
  pub fn of<T: 'static>() -> Self {
    Self {
      id: TypeId::of::<T>(),
      name: std::any::type_name::<T>(),
    }
  }

  pub fn id(&self) -> TypeId {
    self.id
  }

  pub fn name(&self) -> &'static str {
    self.name
  }
}

impl fmt::Display for TypeToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name)
  }
}

// --- Work Item ---

enum WorkKind {
  Inline(BoxedWorkFn),
  Resolved { token: TypeToken, run: ResolvedRunFn },
}

/// A unit of executable logic held by a `TaskQueue` or a scheduled job.
///
/// Either an inline closure or a type token naming a handler that is resolved
/// (inside its own scope) for every execution.
pub struct WorkItem {
  kind: WorkKind,
  description: String,
  attributes: BTreeMap<String, String>,
}

// Manual implementation of Debug since the closures can't be printed.
impl fmt::Debug for WorkItem {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kind = match &self.kind {
      WorkKind::Inline(_) => "Inline(<Fn>)".to_string(),
      WorkKind::Resolved { token, .. } => format!("Resolved({})", token),
    };
    f.debug_struct("WorkItem")
      .field("kind", &kind)
      .field("description", &self.description)
      .field("attributes", &self.attributes)
      .finish()
  }
}

impl WorkItem {
  /// Wraps an already boxed work function.
  pub fn from_boxed(exec_fn: BoxedWorkFn) -> Self {
    Self {
      kind: WorkKind::Inline(exec_fn),
      description: "inline".to_string(),
      attributes: BTreeMap::new(),
    }
  }

  /// Creates a work item from an async closure.
  pub fn from_fn<F, Fut>(f: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
  {
    Self::from_boxed(Box::new(move || Box::pin(f()) as WorkFuture))
  }

  /// Creates a work item from a synchronous closure. The closure runs on the
  /// executing task; keep it short or hand off to your own async work.
  pub fn from_sync<F>(f: F) -> Self
  where
    F: Fn() -> WorkResult + Send + Sync + 'static,
  {
    Self::from_boxed(Box::new(move || {
      let result = f();
      Box::pin(futures::future::ready(result)) as WorkFuture
    }))
  }

  /// Creates a work item that resolves a fresh `T` for every execution.
  pub fn invocable<T: Invocable>() -> Self {
    let token = TypeToken::of::<T>();
    let run: ResolvedRunFn = Box::new(move |instance: Instance| {
      let handler = downcast_instance::<T>(instance)?;
      Ok(Box::pin(async move { handler.invoke().await }) as WorkFuture)
    });
    Self::resolved(token, run)
  }

  /// Creates a work item that resolves a fresh `T`, hands it a clone of
  /// `payload`, then invokes it.
  pub fn invocable_with_payload<T: InvocableWithPayload>(payload: T::Payload) -> Self {
    let token = TypeToken::of::<T>();
    let run: ResolvedRunFn = Box::new(move |instance: Instance| {
      let mut handler = downcast_instance::<T>(instance)?;
      handler.set_payload(payload.clone());
      Ok(Box::pin(async move { handler.invoke().await }) as WorkFuture)
    });
    Self::resolved(token, run)
  }

  fn resolved(token: TypeToken, run: ResolvedRunFn) -> Self {
    Self {
      kind: WorkKind::Resolved { token, run },
      description: token.name().to_string(),
      attributes: BTreeMap::new(),
    }
  }

  /// Sets a human readable description used in logs, events and summaries.
  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  /// Attaches a diagnostic key/value pair.
  pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.attributes.insert(key.into(), value.into());
    self
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn attributes(&self) -> &BTreeMap<String, String> {
    &self.attributes
  }

  /// The handler type this item resolves, `None` for inline closures.
  pub fn type_token(&self) -> Option<TypeToken> {
    match &self.kind {
      WorkKind::Inline(_) => None,
      WorkKind::Resolved { token, .. } => Some(*token),
    }
  }

  /// Runs one execution attempt inside the fault boundary.
  ///
  /// Type-token items get a scope created, the instance resolved and invoked,
  /// and the scope disposed, whatever the outcome.
  pub(crate) async fn execute(
    &self,
    scope_factory: Option<&dyn ScopeFactory>,
  ) -> Result<(), WorkError> {
    match &self.kind {
      WorkKind::Inline(exec_fn) => {
        let future = build_future(|| Ok(exec_fn()))?;
        run_guarded(future).await
      }
      WorkKind::Resolved { token, run } => {
        let factory = scope_factory.ok_or_else(|| WorkError::Resolution {
          type_name: token.name(),
          cause: "no scope factory configured".into(),
        })?;
        let mut scope = factory.create_scope().map_err(|cause| WorkError::Resolution {
          type_name: token.name(),
          cause,
        })?;
        trace!(handler = token.name(), "Created resolution scope.");

        let prepared = build_future(|| {
          scope
            .resolve(*token)
            .and_then(|instance| run(instance))
            .map_err(|cause| WorkError::Resolution {
              type_name: token.name(),
              cause,
            })
        });
        let result = match prepared {
          Ok(future) => run_guarded(future).await,
          Err(e) => Err(e),
        };

        scope.dispose();
        trace!(handler = token.name(), "Disposed resolution scope.");
        result
      }
    }
  }
}

fn downcast_instance<T: 'static>(instance: Instance) -> Result<Box<T>, BoxError> {
  instance.downcast::<T>().map_err(|_| {
    format!(
      "resolved instance is not of type `{}`",
      std::any::type_name::<T>()
    )
    .into()
  })
}

/// Calls a future-producing closure, converting a synchronous panic into a `WorkError`.
fn build_future<F>(f: F) -> Result<WorkFuture, WorkError>
where
  F: FnOnce() -> Result<WorkFuture, WorkError>,
{
  match std::panic::catch_unwind(AssertUnwindSafe(f)) {
    Ok(result) => result,
    Err(payload) => Err(WorkError::Panicked(panic_message(payload))),
  }
}

/// Awaits a work future, converting both `Err` results and panics into `WorkError`.
async fn run_guarded(future: WorkFuture) -> Result<(), WorkError> {
  match AssertUnwindSafe(future).catch_unwind().await {
    Ok(Ok(())) => Ok(()),
    Ok(Err(e)) => Err(WorkError::Failed(e)),
    Err(payload) => Err(WorkError::Panicked(panic_message(payload))),
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}
