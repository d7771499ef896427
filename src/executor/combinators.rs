//! Executor combinators
//!
//! Pure constructors: none of these resolve anything, they only describe how
//! values are wired together.

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::executor::{
    downcast_value, erase_value, AnyExecutor, AnyValue, Arity, ErasedProvider, Executor,
    ExecutorBuilder, ExecutorKind, ProviderCtx, Slot,
};
use crate::core::errors::{Result, ScopeError};

/// Executor holding a ready value
pub fn value<V: Send + Sync + 'static>(v: V) -> Executor<V> {
    let shared: AnyValue = erase_value(v);
    let provider: ErasedProvider =
        Arc::new(move |_ctx: ProviderCtx| futures::future::ready(Ok(Some(shared.clone()))).boxed());
    ExecutorBuilder::new()
        .raw_provider(Arity::Nullary, provider)
        .build_checked()
}

/// Executor computed by a synchronous provider
pub fn provide<V, F>(f: F) -> Executor<V>
where
    V: Send + Sync + 'static,
    F: Fn() -> anyhow::Result<V> + Send + Sync + 'static,
{
    ExecutorBuilder::new().provider(f).build_checked()
}

/// Executor computed by an async provider
pub fn provide_async<V, F, Fut>(f: F) -> Executor<V>
where
    V: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
{
    ExecutorBuilder::new().provider_async(f).build_checked()
}

/// Executor whose provider may produce nothing. Absent results are never cached.
pub fn provide_optional<V, F>(f: F) -> Executor<V>
where
    V: Send + Sync + 'static,
    F: Fn() -> anyhow::Result<Option<V>> + Send + Sync + 'static,
{
    let provider: ErasedProvider = Arc::new(move |ctx: ProviderCtx| {
        let outcome = f()
            .map(|v| v.map(erase_value))
            .map_err(|e| ScopeError::provider(ctx.executor, e));
        futures::future::ready(outcome).boxed()
    });
    ExecutorBuilder::new()
        .raw_provider(Arity::Nullary, provider)
        .build_checked()
}

/// Executor derived from one dependency
pub fn derive<D, V, F>(dependency: &Executor<D>, f: F) -> Executor<V>
where
    D: Send + Sync + 'static,
    V: Send + Sync + 'static,
    F: Fn(Arc<D>) -> anyhow::Result<V> + Send + Sync + 'static,
{
    ExecutorBuilder::new()
        .input(dependency.as_any())
        .unary(f)
        .build_checked()
}

/// Async variant of [`derive`]
pub fn derive_async<D, V, F, Fut>(dependency: &Executor<D>, f: F) -> Executor<V>
where
    D: Send + Sync + 'static,
    V: Send + Sync + 'static,
    F: Fn(Arc<D>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
{
    ExecutorBuilder::new()
        .input(dependency.as_any())
        .unary_async(f)
        .build_checked()
}

/// Infallible transformation of a source executor
pub fn map<D, V, F>(source: &Executor<D>, transform: F) -> Executor<V>
where
    D: Send + Sync + 'static,
    V: Send + Sync + 'static,
    F: Fn(&D) -> V + Send + Sync + 'static,
{
    derive(source, move |d: Arc<D>| Ok(transform(&d)))
}

/// Transformation where the transform itself is resolved from an executor.
///
/// Source and transform are resolved together before applying.
pub fn map_with<D, V, T>(source: &Executor<D>, transform: &Executor<T>) -> Executor<V>
where
    D: Send + Sync + 'static,
    V: Send + Sync + 'static,
    T: Fn(&D) -> V + Send + Sync + 'static,
{
    ExecutorBuilder::new()
        .named_input([("source", source.erase()), ("transform", transform.erase())])
        .unary(|combined: Arc<Combined>| {
            let source = combined.get::<D>("source")?;
            let transform = combined.get::<T>("transform")?;
            Ok(transform(&source))
        })
        .build_checked()
}

/// Resolved values of a named combination, in declaration order
#[derive(Clone)]
pub struct Combined {
    values: Vec<(String, Slot)>,
}

impl Combined {
    /// Typed access to a named value
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        let slot = self
            .values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, slot)| slot.clone())
            .ok_or_else(|| ScopeError::shape(format!("no combined entry named '{}'", name)))?;
        let value = slot.ok_or_else(|| ScopeError::shape(format!("entry '{}' resolved to no value", name)))?;
        downcast_value::<T>(value, None)
    }

    /// Access a named value that may be absent
    pub fn get_optional<T: Send + Sync + 'static>(&self, name: &str) -> Result<Option<Arc<T>>> {
        match self.values.iter().find(|(n, _)| n == name) {
            Some((_, Some(value))) => downcast_value::<T>(value.clone(), None).map(Some),
            Some((_, None)) => Ok(None),
            None => Err(ScopeError::shape(format!("no combined entry named '{}'", name))),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.values.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Combined {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Combined").field("names", &self.names()).finish()
    }
}

fn combined_provider(entries: Vec<(String, AnyExecutor)>) -> ErasedProvider {
    Arc::new(move |ctx: ProviderCtx| {
        let entries = entries.clone();
        let scope = ctx.scope;
        async move {
            let resolutions = entries.iter().map(|(_, child)| scope.resolve_shared(child));
            let slots = try_join_all(resolutions).await?;
            let values = entries
                .into_iter()
                .map(|(name, _)| name)
                .zip(slots)
                .collect();
            Ok(Some(erase_value(Combined { values })))
        }
        .boxed()
    })
}

/// Combine named executors into one executor of [`Combined`].
///
/// Every child resolves through the same scope, so a child shared by several
/// combinations still runs once.
pub fn combine<I, S>(entries: I) -> Executor<Combined>
where
    I: IntoIterator<Item = (S, AnyExecutor)>,
    S: Into<String>,
{
    let entries: Vec<(String, AnyExecutor)> =
        entries.into_iter().map(|(n, e)| (n.into(), e)).collect();
    let mut builder = ExecutorBuilder::new().kind(ExecutorKind::Derived);
    for (_, child) in &entries {
        builder = builder.dependency(child);
    }
    builder
        .named(entries.clone())
        .raw_provider(Arity::Nullary, combined_provider(entries))
        .build_checked()
}

impl Executor<Combined> {
    /// The named executors this combination was built from
    pub fn separate(&self) -> Vec<(String, AnyExecutor)> {
        self.as_any().named().map(<[_]>::to_vec).unwrap_or_default()
    }
}

/// Group executors of one type, preserving order
pub fn group<V: Send + Sync + 'static>(executors: &[Executor<V>]) -> Executor<Vec<Arc<V>>> {
    let entries: Vec<(String, AnyExecutor)> = executors
        .iter()
        .enumerate()
        .map(|(i, e)| (i.to_string(), e.erase()))
        .collect();
    let count = entries.len();
    ExecutorBuilder::new()
        .named_input(entries)
        .unary(move |combined: Arc<Combined>| {
            (0..count)
                .map(|i| combined.get::<V>(&i.to_string()).map_err(anyhow::Error::new))
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .build_checked()
}

/// Callable with its dependency already applied
pub struct Factory<A, R> {
    f: Arc<dyn Fn(A) -> R + Send + Sync>,
}

impl<A, R> Clone for Factory<A, R> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<A, R> Factory<A, R> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    pub fn call(&self, args: A) -> R {
        (self.f)(args)
    }
}

/// Async callable with its dependency already applied
pub struct AsyncFactory<A, R> {
    f: Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>,
}

impl<A, R> Clone for AsyncFactory<A, R> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<A, R> AsyncFactory<A, R> {
    pub fn call(&self, args: A) -> BoxFuture<'static, anyhow::Result<R>> {
        (self.f)(args)
    }
}

/// Partially apply a resolved dependency to a function
pub fn factory<D, A, R, F>(dependency: &Executor<D>, f: F) -> Executor<Factory<A, R>>
where
    D: Send + Sync + 'static,
    A: 'static,
    R: 'static,
    F: Fn(&D, A) -> R + Send + Sync + 'static,
{
    let f = Arc::new(f);
    derive(dependency, move |dep: Arc<D>| {
        let f = f.clone();
        Ok(Factory::new(move |args: A| f(&dep, args)))
    })
}

/// Async variant of [`factory`]
pub fn factorize<D, A, R, F, Fut>(dependency: &Executor<D>, f: F) -> Executor<AsyncFactory<A, R>>
where
    D: Send + Sync + 'static,
    A: Send + 'static,
    R: Send + 'static,
    F: Fn(Arc<D>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    let f = Arc::new(f);
    derive(dependency, move |dep: Arc<D>| {
        let f = f.clone();
        Ok(AsyncFactory {
            f: Arc::new(move |args: A| f(dep.clone(), args).boxed()),
        })
    })
}

/// Rebuild an executor with some of its named inputs replaced or added.
///
/// Fails with a shape error when the executor's input is not a named mapping.
pub fn defaults<V, I, S>(executor: &Executor<V>, overrides: I) -> Result<Executor<V>>
where
    V: Send + Sync + 'static,
    I: IntoIterator<Item = (S, AnyExecutor)>,
    S: Into<String>,
{
    let raw = executor.as_any();
    let named = raw
        .input()
        .and_then(|input| input.named())
        .ok_or_else(|| ScopeError::shape(format!("{} has no named input to default", raw.id())))?;

    let mut entries: Vec<(String, AnyExecutor)> = named.to_vec();
    for (name, replacement) in overrides {
        let name = name.into();
        match entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = replacement,
            None => entries.push((name, replacement)),
        }
    }

    let mut builder = ExecutorBuilder::<V>::new()
        .named_input(entries)
        .raw_provider(raw.arity(), raw.provider().clone());
    if let Some(label) = raw.label() {
        builder = builder.label(format!("{} (defaults)", label));
    }
    builder.build()
}
