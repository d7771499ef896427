//! Executor descriptors
//!
//! An executor is an immutable description of deferred work: a provider, an
//! optional input executor and a process-unique identity. Executors carry no
//! state of their own; every resolved value lives in a [`Scope`].

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize, Serializer};
use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::errors::{Result, ScopeError};
use crate::executor::registry;
use crate::scope::Scope;

/// Type-erased resolved value, shared by reference with every caller.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Outcome of a provider: a value, or `None` when the provider produced nothing.
pub type Slot = Option<AnyValue>;

/// Future returned by an erased provider.
pub type ProviderFuture = BoxFuture<'static, Result<Slot>>;

/// Erased provider function.
pub type ErasedProvider = Arc<dyn Fn(ProviderCtx) -> ProviderFuture + Send + Sync>;

/// Global counter for executor identities
static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique executor identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutorId(pub u64);

impl ExecutorId {
    fn next() -> Self {
        ExecutorId(NEXT_EXECUTOR_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor#{}", self.0)
    }
}

/// Whether an executor is a root-like source or derived from other executors.
///
/// Only instrumentation filters look at this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutorKind {
    Source,
    Derived,
}

/// Number of inputs a provider consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arity {
    Nullary,
    Unary,
}

/// Debug description of an executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub id: ExecutorId,
    pub label: Option<String>,
    pub kind: ExecutorKind,
    pub value_type: String,
}

impl ExecutorInfo {
    /// Label if set, otherwise the identity
    pub fn display_name(&self) -> String {
        match &self.label {
            Some(label) => format!("{} ({})", label, self.id),
            None => self.id.to_string(),
        }
    }
}

/// Context handed to an erased provider
pub struct ProviderCtx {
    /// Scope performing the resolution
    pub scope: Scope,
    /// Executor being resolved
    pub executor: ExecutorId,
    /// Resolved input, if the executor declares one
    pub input: Option<AnyValue>,
}

impl ProviderCtx {
    /// Downcast the resolved input
    pub fn input_as<D: Send + Sync + 'static>(&self) -> Result<Arc<D>> {
        let value = self
            .input
            .clone()
            .ok_or(ScopeError::MissingInput {
                executor: self.executor,
            })?;
        downcast_value::<D>(value, Some(self.executor))
    }
}

pub(crate) struct ExecutorInner {
    id: ExecutorId,
    label: Option<String>,
    kind: ExecutorKind,
    arity: Arity,
    type_id: TypeId,
    value_type: &'static str,
    input: Option<AnyExecutor>,
    dependencies: Vec<AnyExecutor>,
    named: Option<Vec<(String, AnyExecutor)>>,
    provider: ErasedProvider,
}

/// Type-erased executor handle. Cloning keeps identity.
#[derive(Clone)]
pub struct AnyExecutor {
    pub(crate) inner: Arc<ExecutorInner>,
}

impl AnyExecutor {
    pub fn id(&self) -> ExecutorId {
        self.inner.id
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    pub fn kind(&self) -> ExecutorKind {
        self.inner.kind
    }

    pub fn arity(&self) -> Arity {
        self.inner.arity
    }

    /// Input executor resolved before the provider runs
    pub fn input(&self) -> Option<&AnyExecutor> {
        self.inner.input.as_ref()
    }

    /// Executors this one depends on, for introspection
    pub fn dependencies(&self) -> &[AnyExecutor] {
        &self.inner.dependencies
    }

    /// Named mapping this executor was combined from, if any
    pub fn named(&self) -> Option<&[(String, AnyExecutor)]> {
        self.inner.named.as_deref()
    }

    pub fn value_type(&self) -> &'static str {
        self.inner.value_type
    }

    pub fn info(&self) -> ExecutorInfo {
        ExecutorInfo {
            id: self.id(),
            label: self.label().map(str::to_string),
            kind: self.kind(),
            value_type: self.inner.value_type.to_string(),
        }
    }

    /// Whether values produced by this executor are of type `V`
    pub fn is<V: 'static>(&self) -> bool {
        self.inner.type_id == TypeId::of::<V>()
    }

    /// Recover the typed handle
    pub fn typed<V: Send + Sync + 'static>(&self) -> Result<Executor<V>> {
        if !self.is::<V>() {
            return Err(ScopeError::type_mismatch::<V>(Some(self.id())));
        }
        Ok(Executor {
            raw: self.clone(),
            _marker: PhantomData,
        })
    }

    pub(crate) fn provider(&self) -> &ErasedProvider {
        &self.inner.provider
    }

    pub(crate) fn invoke(&self, ctx: ProviderCtx) -> ProviderFuture {
        (self.inner.provider)(ctx)
    }
}

impl fmt::Debug for AnyExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyExecutor")
            .field("id", &self.id())
            .field("label", &self.label())
            .field("kind", &self.kind())
            .field("value_type", &self.inner.value_type)
            .finish()
    }
}

impl PartialEq for AnyExecutor {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for AnyExecutor {}

impl Hash for AnyExecutor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}

/// Executors serialize by identity so they can serve as family keys.
impl Serialize for AnyExecutor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.id().to_string())
    }
}

/// Typed executor handle producing values of type `V`
pub struct Executor<V> {
    raw: AnyExecutor,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for Executor<V> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> fmt::Debug for Executor<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Executor").field(&self.raw).finish()
    }
}

impl<V> PartialEq for Executor<V> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<V> Eq for Executor<V> {}

impl<V> Hash for Executor<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state)
    }
}

impl<V> Serialize for Executor<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<V: Send + Sync + 'static> Executor<V> {
    pub fn id(&self) -> ExecutorId {
        self.raw.id()
    }

    pub fn kind(&self) -> ExecutorKind {
        self.raw.kind()
    }

    pub fn info(&self) -> ExecutorInfo {
        self.raw.info()
    }

    pub fn dependencies(&self) -> &[AnyExecutor] {
        self.raw.dependencies()
    }

    pub fn erase(&self) -> AnyExecutor {
        self.raw.clone()
    }

    pub fn as_any(&self) -> &AnyExecutor {
        &self.raw
    }
}

impl<V> From<&Executor<V>> for AnyExecutor {
    fn from(executor: &Executor<V>) -> Self {
        executor.raw.clone()
    }
}

/// Anything that can be resolved by a scope
pub trait AsExecutor {
    fn as_executor(&self) -> &AnyExecutor;
}

impl AsExecutor for AnyExecutor {
    fn as_executor(&self) -> &AnyExecutor {
        self
    }
}

impl<V> AsExecutor for Executor<V> {
    fn as_executor(&self) -> &AnyExecutor {
        &self.raw
    }
}

pub(crate) fn downcast_value<V: Send + Sync + 'static>(
    value: AnyValue,
    executor: Option<ExecutorId>,
) -> Result<Arc<V>> {
    value
        .downcast::<V>()
        .map_err(|_| ScopeError::type_mismatch::<V>(executor))
}

pub(crate) fn erase_value<V: Send + Sync + 'static>(value: V) -> AnyValue {
    Arc::new(value)
}

/// Builder for executors.
///
/// Arity is checked in [`ExecutorBuilder::build`]: a provider that consumes an
/// input must be given one.
pub struct ExecutorBuilder<V> {
    label: Option<String>,
    kind: ExecutorKind,
    input: Option<AnyExecutor>,
    dependencies: Vec<AnyExecutor>,
    named: Option<Vec<(String, AnyExecutor)>>,
    provider: Option<(Arity, ErasedProvider)>,
    _marker: PhantomData<fn() -> V>,
}

impl<V: Send + Sync + 'static> Default for ExecutorBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + Sync + 'static> ExecutorBuilder<V> {
    pub fn new() -> Self {
        Self {
            label: None,
            kind: ExecutorKind::Source,
            input: None,
            dependencies: Vec::new(),
            named: None,
            provider: None,
            _marker: PhantomData,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn kind(mut self, kind: ExecutorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Single input executor. Also recorded as a dependency.
    pub fn input(mut self, input: &AnyExecutor) -> Self {
        self.kind = ExecutorKind::Derived;
        self.dependencies.push(input.clone());
        self.input = Some(input.clone());
        self
    }

    /// Named input mapping, normalized into one combined executor
    pub fn named_input<I, S>(self, entries: I) -> Self
    where
        I: IntoIterator<Item = (S, AnyExecutor)>,
        S: Into<String>,
    {
        let combined = super::combinators::combine(entries);
        self.input(combined.as_any())
    }

    /// Extra introspection-only dependency
    pub fn dependency(mut self, dependency: &AnyExecutor) -> Self {
        self.dependencies.push(dependency.clone());
        self
    }

    pub(crate) fn named(mut self, named: Vec<(String, AnyExecutor)>) -> Self {
        self.named = Some(named);
        self
    }

    /// Provider without input
    pub fn provider<F>(mut self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<V> + Send + Sync + 'static,
    {
        let provider: ErasedProvider = Arc::new(move |ctx: ProviderCtx| {
            let outcome = f()
                .map(|v| Some(erase_value(v)))
                .map_err(|e| ScopeError::provider(ctx.executor, e));
            futures::future::ready(outcome).boxed()
        });
        self.provider = Some((Arity::Nullary, provider));
        self
    }

    /// Async provider without input
    pub fn provider_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let provider: ErasedProvider = Arc::new(move |ctx: ProviderCtx| {
            let fut = f();
            async move {
                fut.await
                    .map(|v| Some(erase_value(v)))
                    .map_err(|e| ScopeError::provider(ctx.executor, e))
            }
            .boxed()
        });
        self.provider = Some((Arity::Nullary, provider));
        self
    }

    /// Provider consuming the resolved input
    pub fn unary<D, F>(mut self, f: F) -> Self
    where
        D: Send + Sync + 'static,
        F: Fn(Arc<D>) -> anyhow::Result<V> + Send + Sync + 'static,
    {
        let provider: ErasedProvider = Arc::new(move |ctx: ProviderCtx| {
            let outcome = ctx.input_as::<D>().and_then(|input| {
                f(input)
                    .map(|v| Some(erase_value(v)))
                    .map_err(|e| ScopeError::provider(ctx.executor, e))
            });
            futures::future::ready(outcome).boxed()
        });
        self.provider = Some((Arity::Unary, provider));
        self
    }

    /// Async provider consuming the resolved input
    pub fn unary_async<D, F, Fut>(mut self, f: F) -> Self
    where
        D: Send + Sync + 'static,
        F: Fn(Arc<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let provider: ErasedProvider = Arc::new(move |ctx: ProviderCtx| {
            let input = match ctx.input_as::<D>() {
                Ok(input) => input,
                Err(e) => return futures::future::ready(Err(e)).boxed(),
            };
            let fut = f(input);
            let executor = ctx.executor;
            async move {
                fut.await
                    .map(|v| Some(erase_value(v)))
                    .map_err(|e| ScopeError::provider(executor, e))
            }
            .boxed()
        });
        self.provider = Some((Arity::Unary, provider));
        self
    }

    /// Erased provider with an explicit arity
    pub fn raw_provider(mut self, arity: Arity, provider: ErasedProvider) -> Self {
        self.provider = Some((arity, provider));
        self
    }

    pub fn build(self) -> Result<Executor<V>> {
        let (arity, provider) = self
            .provider
            .ok_or_else(|| ScopeError::arity("executor has no provider"))?;
        if arity == Arity::Unary && self.input.is_none() {
            return Err(ScopeError::arity(
                "provider consumes an input but no input executor was declared",
            ));
        }

        let label = self.label;
        let raw = AnyExecutor {
            inner: Arc::new(ExecutorInner {
                id: ExecutorId::next(),
                label,
                kind: self.kind,
                arity,
                type_id: TypeId::of::<V>(),
                value_type: type_name::<V>(),
                input: self.input,
                dependencies: self.dependencies,
                named: self.named,
                provider,
            }),
        };
        registry::record(&raw);
        Ok(Executor {
            raw,
            _marker: PhantomData,
        })
    }

    /// Build an executor whose shape is valid by construction
    pub(crate) fn build_checked(self) -> Executor<V> {
        match self.build() {
            Ok(executor) => executor,
            Err(e) => unreachable!("executor shape validated by constructor: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_unique() {
        let a = ExecutorBuilder::<i32>::new().provider(|| Ok(1)).build().unwrap();
        let b = ExecutorBuilder::<i32>::new().provider(|| Ok(1)).build().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
        assert_eq!(a.erase(), a.clone().erase());
    }

    #[test]
    fn test_unary_without_input_is_rejected() {
        let result = ExecutorBuilder::<i32>::new().unary(|x: Arc<i32>| Ok(*x)).build();
        assert!(matches!(result, Err(ScopeError::Arity { .. })));
    }

    #[test]
    fn test_missing_provider_is_rejected() {
        let result = ExecutorBuilder::<i32>::new().build();
        assert!(matches!(result, Err(ScopeError::Arity { .. })));
    }

    #[test]
    fn test_typed_roundtrip() {
        let a = ExecutorBuilder::<String>::new()
            .provider(|| Ok("x".to_string()))
            .label("name")
            .build()
            .unwrap();
        let erased = a.erase();
        assert!(erased.is::<String>());
        assert!(erased.typed::<String>().is_ok());
        assert!(matches!(
            erased.typed::<i32>(),
            Err(ScopeError::TypeMismatch { .. })
        ));
        assert_eq!(erased.label(), Some("name"));
        assert_eq!(serde_json::to_string(&erased).unwrap(), format!("\"{}\"", a.id()));
    }
}
