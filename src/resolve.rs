//! Resolution capability: creating a fresh handler instance per execution.
//!
//! The engines never construct handler types themselves. For every execution of a
//! type-token work item they ask a [`ScopeFactory`] for a new [`ResolutionScope`],
//! resolve one instance from it, invoke that instance, and dispose the scope.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::BoxError;
use crate::work::TypeToken;

/// A type-erased handler instance produced by a [`ResolutionScope`].
pub type Instance = Box<dyn Any + Send>;

type InstanceFactory = Arc<dyn Fn() -> Result<Instance, BoxError> + Send + Sync + 'static>;

/// Creates a resolution scope for each execution.
pub trait ScopeFactory: Send + Sync {
  fn create_scope(&self) -> Result<Box<dyn ResolutionScope>, BoxError>;
}

/// A per-execution scope that can resolve handler instances.
pub trait ResolutionScope: Send {
  fn resolve(&mut self, token: TypeToken) -> Result<Instance, BoxError>;

  /// Tears the scope down. Called exactly once, after the resolved instance is dropped.
  fn dispose(self: Box<Self>) {}
}

/// In-memory [`ScopeFactory`] keyed by handler type.
///
/// ```
/// use steward::{ServiceRegistry, work::{Invocable, WorkResult}};
///
/// struct Cleanup;
///
/// #[async_trait::async_trait]
/// impl Invocable for Cleanup {
///   async fn invoke(&self) -> WorkResult {
///     Ok(())
///   }
/// }
///
/// let registry = ServiceRegistry::new();
/// registry.register(|| Cleanup);
/// ```
#[derive(Clone, Default)]
pub struct ServiceRegistry {
  inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
  factories: RwLock<HashMap<TypeId, InstanceFactory>>,
  scopes_created: AtomicUsize,
  scopes_disposed: AtomicUsize,
}

impl ServiceRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a factory producing a fresh `T` for every resolution.
  pub fn register<T, F>(&self, factory: F) -> &Self
  where
    T: Send + 'static,
    F: Fn() -> T + Send + Sync + 'static,
  {
    self.register_fallible(move || Ok(factory()))
  }

  /// Registers a factory that may fail; failures surface as resolution errors.
  pub fn register_fallible<T, F>(&self, factory: F) -> &Self
  where
    T: Send + 'static,
    F: Fn() -> Result<T, BoxError> + Send + Sync + 'static,
  {
    let erased: InstanceFactory = Arc::new(move || factory().map(|t| Box::new(t) as Instance));
    self.inner.factories.write().insert(TypeId::of::<T>(), erased);
    debug!(handler = std::any::type_name::<T>(), "Registered handler factory.");
    self
  }

  pub fn is_registered(&self, token: TypeToken) -> bool {
    self.inner.factories.read().contains_key(&token.id())
  }

  /// Total number of scopes handed out so far.
  pub fn scopes_created(&self) -> usize {
    self.inner.scopes_created.load(Ordering::SeqCst)
  }

  /// Total number of scopes disposed so far.
  pub fn scopes_disposed(&self) -> usize {
    self.inner.scopes_disposed.load(Ordering::SeqCst)
  }
}

impl ScopeFactory for ServiceRegistry {
  fn create_scope(&self) -> Result<Box<dyn ResolutionScope>, BoxError> {
    self.inner.scopes_created.fetch_add(1, Ordering::SeqCst);
    Ok(Box::new(RegistryScope {
      registry: self.inner.clone(),
    }))
  }
}

struct RegistryScope {
  registry: Arc<RegistryInner>,
}

impl ResolutionScope for RegistryScope {
  fn resolve(&mut self, token: TypeToken) -> Result<Instance, BoxError> {
    // Clone the factory out so the read lock is not held while user code runs.
    let factory = self
      .registry
      .factories
      .read()
      .get(&token.id())
      .cloned()
      .ok_or_else(|| format!("no factory registered for `{}`", token.name()))?;
    factory()
  }

  fn dispose(self: Box<Self>) {
    self.registry.scopes_disposed.fetch_add(1, Ordering::SeqCst);
  }
}
