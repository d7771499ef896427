//! Scope: resolver, memoization cache and lifecycle manager
//!
//! A scope resolves executors on demand, caching each node the first time it
//! is visited. The cached entry is a shared future inserted before the
//! provider starts, so concurrent resolves of one executor share a single
//! provider invocation.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{try_join_all, BoxFuture, Shared};
use futures::FutureExt;
use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::instrument::{
    global_pipeline, CallContext, Instrument, Pipeline, Services, TracingInstrument,
};
use crate::core::config::ScopeConfig;
use crate::core::errors::{Result, ScopeError};
use crate::executor::executor::{downcast_value, erase_value};
use crate::executor::{
    combine, AnyExecutor, AnyValue, Arity, AsExecutor, Combined, Executor, ExecutorId,
    ExecutorInfo, ProviderCtx, Slot,
};

/// Memoized resolution of one executor, shared by every caller
pub type Resolution = Shared<BoxFuture<'static, Result<Slot>>>;

type HookPredicate = Arc<dyn Fn(&ExecutorInfo) -> bool + Send + Sync>;
type HookTransform = Arc<dyn Fn(AnyValue) -> Slot + Send + Sync>;

struct ResolveHook {
    predicate: HookPredicate,
    transform: HookTransform,
}

enum Defer {
    Sync(Box<dyn FnOnce() + Send>),
    Async(Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>),
}

struct StoreEntry {
    generation: u64,
    resolution: Resolution,
}

struct ScopeInner {
    config: ScopeConfig,
    store: DashMap<ExecutorId, StoreEntry>,
    generation: AtomicU64,
    defers: Mutex<Vec<Defer>>,
    hooks: RwLock<Vec<ResolveHook>>,
    parents: Vec<Scope>,
    pipeline: RwLock<Pipeline>,
}

/// Resolver and cache for executors.
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("label", &self.inner.config.label)
            .field("cached", &self.inner.store.len())
            .field("parents", &self.inner.parents.len())
            .finish()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref DEFAULT_SCOPE: Scope = Scope::from_parts(
        ScopeConfig::default().with_label("default"),
        Vec::new()
    );
}

/// Process-wide default scope
pub fn default_scope() -> Scope {
    DEFAULT_SCOPE.clone()
}

/// Scope that falls back to `parents`, in order, before computing locally
pub fn create_scope(parents: &[Scope]) -> Scope {
    Scope::from_parts(ScopeConfig::default(), parents.to_vec())
}

impl Scope {
    pub fn new() -> Self {
        Self::from_parts(ScopeConfig::default(), Vec::new())
    }

    pub fn with_config(config: ScopeConfig, parents: Vec<Scope>) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, parents))
    }

    fn from_parts(config: ScopeConfig, parents: Vec<Scope>) -> Self {
        let mut pipeline = Pipeline::new();
        if config.trace_resolutions {
            pipeline.push(Arc::new(TracingInstrument));
        }
        debug!(
            "Creating scope '{}' with {} parent(s)",
            config.label,
            parents.len()
        );
        Self {
            inner: Arc::new(ScopeInner {
                config,
                store: DashMap::new(),
                generation: AtomicU64::new(0),
                defers: Mutex::new(Vec::new()),
                hooks: RwLock::new(Vec::new()),
                parents,
                pipeline: RwLock::new(pipeline),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.config.label
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.inner.config
    }

    pub fn parents(&self) -> &[Scope] {
        &self.inner.parents
    }

    /// Whether two handles point at the same scope
    pub fn same_scope(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Cached resolution, checking the local store first and then each parent
    fn lookup(&self, id: ExecutorId) -> Option<Resolution> {
        if let Some(entry) = self.inner.store.get(&id) {
            return Some(entry.resolution.clone());
        }
        self.inner.parents.iter().find_map(|parent| parent.lookup(id))
    }

    /// Whether this scope or any parent holds the executor
    pub fn has(&self, executor: &impl AsExecutor) -> bool {
        self.lookup(executor.as_executor().id()).is_some()
    }

    /// Number of locally cached executors
    pub fn cached_count(&self) -> usize {
        self.inner.store.len()
    }

    /// Shared resolution for an executor.
    ///
    /// Two calls for the same executor return the same shared future until
    /// the entry is removed.
    pub fn resolve_shared(&self, executor: &impl AsExecutor) -> Resolution {
        let executor = executor.as_executor();
        if let Some(resolution) = self.lookup(executor.id()) {
            return resolution;
        }
        match self.inner.store.entry(executor.id()) {
            Entry::Occupied(entry) => entry.get().resolution.clone(),
            Entry::Vacant(entry) => {
                let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
                let resolution = self.start(executor.clone(), generation);
                entry.insert(StoreEntry {
                    generation,
                    resolution: resolution.clone(),
                });
                resolution
            }
        }
    }

    fn start(&self, executor: AnyExecutor, generation: u64) -> Resolution {
        let scope = self.clone();
        async move {
            let id = executor.id();
            trace!("Resolving {} in scope '{}'", id, scope.label());

            let outcome = scope.compute(&executor).await;
            let outcome = outcome.map(|slot| scope.apply_hooks(&executor.info(), slot));

            match &outcome {
                Ok(None) => {
                    trace!("{} resolved to nothing, not caching", id);
                    scope.evict(id, generation);
                }
                Ok(Some(_)) => trace!("{} resolved", id),
                Err(e) => {
                    debug!("{} failed: {}", id, e);
                    if !scope.inner.config.cache_failures {
                        scope.evict(id, generation);
                    }
                }
            }
            outcome
        }
        .boxed()
        .shared()
    }

    async fn compute(&self, executor: &AnyExecutor) -> Result<Slot> {
        let input = match executor.input() {
            Some(child) => self.resolve_shared(child).await?,
            None => None,
        };
        if executor.arity() == Arity::Unary && input.is_none() {
            return Err(ScopeError::MissingInput {
                executor: executor.id(),
            });
        }

        let ctx = ProviderCtx {
            scope: self.clone(),
            executor: executor.id(),
            input,
        };
        let call = executor.invoke(ctx);
        let call_ctx = CallContext::executor(executor.info(), self.label());
        self.pipeline_snapshot().run(&call_ctx, call).await
    }

    fn pipeline_snapshot(&self) -> Pipeline {
        let mut pipeline = global_pipeline();
        pipeline.extend(&self.inner.pipeline.read());
        pipeline
    }

    fn apply_hooks(&self, info: &ExecutorInfo, slot: Slot) -> Slot {
        let value = slot?;
        let transform = {
            let hooks = self.inner.hooks.read();
            hooks
                .iter()
                .find(|hook| (hook.predicate)(info))
                .map(|hook| hook.transform.clone())
        };
        match transform {
            Some(transform) => {
                trace!("Resolution hook applied to {}", info.id);
                transform(value)
            }
            None => Some(value),
        }
    }

    /// Remove an entry only if it is still the one created at `generation`
    fn evict(&self, id: ExecutorId, generation: u64) {
        self.inner
            .store
            .remove_if(&id, |_, entry| entry.generation == generation);
    }

    /// Resolve to the erased slot
    pub async fn resolve_any(&self, executor: &AnyExecutor) -> Result<Slot> {
        self.resolve_shared(executor).await
    }

    /// Resolve a typed executor. A provider that produced nothing is an error.
    pub async fn resolve<V: Send + Sync + 'static>(&self, executor: &Executor<V>) -> Result<Arc<V>> {
        self.resolve_optional(executor)
            .await?
            .ok_or(ScopeError::Absent {
                executor: executor.id(),
            })
    }

    /// Resolve a typed executor whose provider may produce nothing
    pub async fn resolve_optional<V: Send + Sync + 'static>(
        &self,
        executor: &Executor<V>,
    ) -> Result<Option<Arc<V>>> {
        let slot = self.resolve_shared(executor).await?;
        slot.map(|value| downcast_value::<V>(value, Some(executor.id())))
            .transpose()
    }

    /// Resolve a named mapping by combining it implicitly
    pub async fn resolve_named<I, S>(&self, entries: I) -> Result<Arc<Combined>>
    where
        I: IntoIterator<Item = (S, AnyExecutor)>,
        S: Into<String>,
    {
        let combined = combine(entries);
        self.resolve(&combined).await
    }

    /// Resolve a sequence of executors, preserving order
    pub async fn resolve_all<V: Send + Sync + 'static>(
        &self,
        executors: &[Executor<V>],
    ) -> Result<Vec<Arc<V>>> {
        try_join_all(executors.iter().map(|e| self.resolve(e))).await
    }

    /// Resolve without ever panicking.
    ///
    /// A panicking provider is reported as `ScopeError::Panicked` and its entry
    /// is dropped so the next resolve starts over.
    pub async fn safe_resolve<V: Send + Sync + 'static>(&self, executor: &Executor<V>) -> Result<Arc<V>> {
        let resolution = self.resolve_shared(executor);
        match AssertUnwindSafe(resolution.clone()).catch_unwind().await {
            Ok(Ok(Some(value))) => downcast_value::<V>(value, Some(executor.id())),
            Ok(Ok(None)) => Err(ScopeError::Absent {
                executor: executor.id(),
            }),
            Ok(Err(e)) => Err(e),
            Err(payload) => {
                warn!("Provider of {} panicked", executor.id());
                self.inner.store.remove_if(&executor.id(), |_, entry| {
                    Shared::ptr_eq(&entry.resolution, &resolution)
                });
                Err(ScopeError::from_panic(payload))
            }
        }
    }

    /// Resolve `dependency`, then run `runner` with it.
    ///
    /// Dependency failures come back as `ScopeError::Dependency`, runner
    /// failures as `ScopeError::Runner`.
    pub async fn safe_run<D, A, R, F, Fut>(&self, dependency: &Executor<D>, runner: F, args: A) -> Result<R>
    where
        D: Send + Sync + 'static,
        F: FnOnce(Arc<D>, A) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let value = self
            .safe_resolve(dependency)
            .await
            .map_err(ScopeError::dependency)?;
        match AssertUnwindSafe(async move { runner(value, args).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(ScopeError::runner(e)),
            Err(payload) => Err(ScopeError::from_panic(payload)),
        }
    }

    /// Value of an executor that has already resolved successfully
    pub fn get<V: Send + Sync + 'static>(&self, executor: &Executor<V>) -> Option<Arc<V>> {
        let resolution = self.lookup(executor.id())?;
        match resolution.peek() {
            Some(Ok(Some(value))) => value.clone().downcast::<V>().ok(),
            _ => None,
        }
    }

    /// Store a ready value for an executor, replacing any local entry
    pub fn set<V: Send + Sync + 'static>(&self, executor: &Executor<V>, value: V) {
        self.set_shared(executor, Arc::new(value));
    }

    pub fn set_shared<V: Send + Sync + 'static>(&self, executor: &Executor<V>, value: Arc<V>) {
        let value: AnyValue = value;
        let resolution = futures::future::ready(Ok(Some(value))).boxed().shared();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.store.insert(
            executor.id(),
            StoreEntry {
                generation,
                resolution,
            },
        );
        trace!("{} set in scope '{}'", executor.id(), self.label());
    }

    /// Drop the local entry; the next resolve recomputes. Parents are untouched.
    pub fn remove(&self, executor: &impl AsExecutor) -> bool {
        self.inner
            .store
            .remove(&executor.as_executor().id())
            .is_some()
    }

    /// Register a teardown callback, run in registration order on dispose
    pub fn add_defer<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.defers.lock().push(Defer::Sync(Box::new(f)));
    }

    /// Register an async teardown callback
    pub fn add_async_defer<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .defers
            .lock()
            .push(Defer::Async(Box::new(move || f().boxed())));
    }

    pub fn defer_count(&self) -> usize {
        self.inner.defers.lock().len()
    }

    /// Register a resolution hook. The first hook whose predicate matches
    /// transforms the value; returning `None` marks it absent.
    pub fn add_on_resolve<P, T>(&self, predicate: P, transform: T)
    where
        P: Fn(&ExecutorInfo) -> bool + Send + Sync + 'static,
        T: Fn(AnyValue) -> Slot + Send + Sync + 'static,
    {
        self.inner.hooks.write().push(ResolveHook {
            predicate: Arc::new(predicate),
            transform: Arc::new(transform),
        });
    }

    /// Typed resolution hook for one executor
    pub fn on_resolve<V, T>(&self, executor: &Executor<V>, transform: T)
    where
        V: Send + Sync + 'static,
        T: Fn(Arc<V>) -> Option<Arc<V>> + Send + Sync + 'static,
    {
        let id = executor.id();
        self.add_on_resolve(
            move |info: &ExecutorInfo| info.id == id,
            move |value: AnyValue| match value.clone().downcast::<V>() {
                Ok(typed) => transform(typed).map(|v| v as AnyValue),
                Err(_) => Some(value),
            },
        );
    }

    /// Replace an executor's resolved value in this scope
    pub fn mock<V: Send + Sync + 'static>(&self, executor: &Executor<V>, value: V) {
        let replacement: AnyValue = erase_value(value);
        let id = executor.id();
        self.add_on_resolve(
            move |info: &ExecutorInfo| info.id == id,
            move |_| Some(replacement.clone()),
        );
    }

    /// Install an instrument for calls made by this scope
    pub fn set_instrument(&self, instrument: Arc<dyn Instrument>) {
        debug!(
            "Installing instrument {} on scope '{}'",
            instrument.name(),
            self.label()
        );
        self.inner.pipeline.write().push(instrument);
    }

    /// Instrument a services map with the global and scope instruments,
    /// down to the configured `service_depth`
    pub fn wrap_services(&self, services: &Services) -> Services {
        self.pipeline_snapshot()
            .wrap_services_in(services, self.inner.config.service_depth, self.label())
    }

    /// Run every defer in registration order, then clear store, defers and hooks.
    ///
    /// Defers registered while disposing run in the same pass. The scope can be
    /// used again afterwards; every previous value must be treated as stale.
    pub async fn dispose(&self) {
        let mut ran = 0usize;
        loop {
            let defers = std::mem::take(&mut *self.inner.defers.lock());
            if defers.is_empty() {
                break;
            }
            for defer in defers {
                ran += 1;
                match defer {
                    Defer::Sync(f) => f(),
                    Defer::Async(f) => f().await,
                }
            }
        }
        self.inner.store.clear();
        self.inner.hooks.write().clear();
        debug!("Disposed scope '{}' ({} defer(s) run)", self.label(), ran);
    }
}
