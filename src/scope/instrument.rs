//! Instrumentation pipeline
//!
//! Instruments wrap every provider call. They are kept in an ordered list and
//! applied left to right; each one sees what the previous one produced.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::Instrument as _;
use tracing::{debug, trace, warn};

use crate::core::errors::{Result, ScopeError};
use crate::executor::{AnyValue, ExecutorInfo, ExecutorKind, Slot};

/// A provider call that has not run yet
pub type PendingCall = BoxFuture<'static, Result<Slot>>;

/// What is being called
#[derive(Debug, Clone)]
pub enum CallTarget {
    Executor(ExecutorInfo),
    Service { path: String },
}

/// Context passed to every instrument callback
#[derive(Debug, Clone)]
pub struct CallContext {
    pub target: CallTarget,
    pub scope: String,
}

impl CallContext {
    pub fn executor(info: ExecutorInfo, scope: impl Into<String>) -> Self {
        Self {
            target: CallTarget::Executor(info),
            scope: scope.into(),
        }
    }

    pub fn service(path: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            target: CallTarget::Service { path: path.into() },
            scope: scope.into(),
        }
    }

    pub fn name(&self) -> String {
        match &self.target {
            CallTarget::Executor(info) => info.display_name(),
            CallTarget::Service { path } => path.clone(),
        }
    }

    pub fn executor_info(&self) -> Option<&ExecutorInfo> {
        match &self.target {
            CallTarget::Executor(info) => Some(info),
            CallTarget::Service { .. } => None,
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self.target, CallTarget::Service { .. })
    }

    pub fn is_source(&self) -> bool {
        matches!(
            self.executor_info(),
            Some(ExecutorInfo {
                kind: ExecutorKind::Source,
                ..
            })
        )
    }
}

/// Interceptor around provider calls
#[async_trait]
pub trait Instrument: Send + Sync {
    fn name(&self) -> &str;

    /// Calls this instrument should see
    fn applies_to(&self, _ctx: &CallContext) -> bool {
        true
    }

    /// Wrap or replace the call about to run
    fn on_execute(&self, _ctx: &CallContext, call: PendingCall) -> PendingCall {
        call
    }

    /// Replace the settled value
    fn on_result(&self, _ctx: &CallContext, value: Slot) -> Slot {
        value
    }

    /// Recover from a failure by returning a replacement value
    async fn on_error(&self, _ctx: &CallContext, error: ScopeError) -> Result<Slot> {
        Err(error)
    }
}

/// Ordered list of instruments
#[derive(Clone, Default)]
pub struct Pipeline {
    instruments: Vec<Arc<dyn Instrument>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.instruments.iter().map(|i| i.name()).collect();
        f.debug_struct("Pipeline").field("instruments", &names).finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, instrument: Arc<dyn Instrument>) -> Self {
        self.push(instrument);
        self
    }

    pub fn push(&mut self, instrument: Arc<dyn Instrument>) {
        self.instruments.push(instrument);
    }

    /// Append every instrument of `other` after ours
    pub fn extend(&mut self, other: &Pipeline) {
        self.instruments.extend(other.instruments.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn clear(&mut self) {
        self.instruments.clear();
    }

    /// Run a call through every applicable instrument
    pub async fn run(&self, ctx: &CallContext, call: PendingCall) -> Result<Slot> {
        let active: Vec<&Arc<dyn Instrument>> = self
            .instruments
            .iter()
            .filter(|i| i.applies_to(ctx))
            .collect();
        if active.is_empty() {
            return call.await;
        }

        let mut call = call;
        for instrument in &active {
            call = instrument.on_execute(ctx, call);
        }

        match call.await {
            Ok(mut slot) => {
                for instrument in &active {
                    slot = instrument.on_result(ctx, slot);
                }
                Ok(slot)
            }
            Err(mut error) => {
                for instrument in &active {
                    match instrument.on_error(ctx, error).await {
                        Ok(slot) => {
                            debug!("{} recovered {}", instrument.name(), ctx.name());
                            return Ok(slot);
                        }
                        Err(e) => error = e,
                    }
                }
                Err(error)
            }
        }
    }

    /// Instrument a services map up to `max_depth` levels of nesting.
    ///
    /// Top-level functions are depth 1; deeper functions are left as they are.
    pub fn wrap_services(&self, services: &Services, max_depth: usize) -> Services {
        self.wrap_services_in(services, max_depth, "services")
    }

    pub(crate) fn wrap_services_in(&self, services: &Services, max_depth: usize, scope: &str) -> Services {
        self.wrap_level(services, "", 1, max_depth, scope)
    }

    fn wrap_level(
        &self,
        services: &Services,
        prefix: &str,
        depth: usize,
        max_depth: usize,
        scope: &str,
    ) -> Services {
        let mut wrapped = Services::new();
        for (name, service) in &services.entries {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}.{}", prefix, name)
            };
            let entry = match service {
                Service::Function(f) if depth <= max_depth => {
                    Service::Function(self.wrap_function(path, f.clone(), scope))
                }
                Service::Group(group) if depth < max_depth => {
                    Service::Group(self.wrap_level(group, &path, depth + 1, max_depth, scope))
                }
                other => other.clone(),
            };
            wrapped.entries.insert(name.clone(), entry);
        }
        wrapped
    }

    fn wrap_function(&self, path: String, f: ServiceFn, scope: &str) -> ServiceFn {
        let pipeline = self.clone();
        let scope = scope.to_string();
        Arc::new(move |args: Value| {
            let f = f.clone();
            let pipeline = pipeline.clone();
            let ctx = CallContext::service(path.clone(), scope.clone());
            async move {
                let call: PendingCall = async move {
                    f(args)
                        .await
                        .map(|v| Some(Arc::new(v) as AnyValue))
                        .map_err(ScopeError::runner)
                }
                .boxed();
                let slot = pipeline.run(&ctx, call).await.map_err(anyhow::Error::new)?;
                match slot {
                    None => Ok(Value::Null),
                    Some(value) => value
                        .downcast::<Value>()
                        .map(|v| (*v).clone())
                        .map_err(|_| anyhow::Error::new(ScopeError::type_mismatch::<Value>(None))),
                }
            }
            .boxed()
        })
    }
}

/// Async service function over JSON arguments
pub type ServiceFn = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Entry of a services map
#[derive(Clone)]
pub enum Service {
    Function(ServiceFn),
    Group(Services),
}

/// Nested map of named service functions
#[derive(Clone, Default)]
pub struct Services {
    entries: BTreeMap<String, Service>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let f: ServiceFn = Arc::new(move |args| f(args).boxed());
        self.entries.insert(name.into(), Service::Function(f));
        self
    }

    pub fn group(mut self, name: impl Into<String>, group: Services) -> Self {
        self.entries.insert(name.into(), Service::Group(group));
        self
    }

    /// Find a service by dotted path
    pub fn get(&self, path: &str) -> Option<&Service> {
        let mut parts = path.split('.');
        let mut current = self.entries.get(parts.next()?)?;
        for part in parts {
            match current {
                Service::Group(group) => current = group.entries.get(part)?,
                Service::Function(_) => return None,
            }
        }
        Some(current)
    }

    /// Call a service function by dotted path
    pub async fn call(&self, path: &str, args: Value) -> anyhow::Result<Value> {
        match self.get(path) {
            Some(Service::Function(f)) => f(args).await,
            Some(Service::Group(_)) => Err(anyhow::anyhow!("'{}' is a group, not a function", path)),
            None => Err(anyhow::anyhow!("no service at '{}'", path)),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

type ExecuteFn = Arc<dyn Fn(&CallContext, PendingCall) -> PendingCall + Send + Sync>;
type ResultFn = Arc<dyn Fn(&CallContext, Slot) -> Slot + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&CallContext, ScopeError) -> Result<Slot> + Send + Sync>;
type FilterFn = Arc<dyn Fn(&CallContext) -> bool + Send + Sync>;

/// Instrument assembled from closures
#[derive(Clone)]
pub struct HookInstrument {
    name: String,
    filter: Option<FilterFn>,
    execute: Option<ExecuteFn>,
    result: Option<ResultFn>,
    error: Option<ErrorFn>,
}

impl HookInstrument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: None,
            execute: None,
            result: None,
            error: None,
        }
    }

    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallContext) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(f));
        self
    }

    pub fn on_execute<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallContext, PendingCall) -> PendingCall + Send + Sync + 'static,
    {
        self.execute = Some(Arc::new(f));
        self
    }

    pub fn on_result<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallContext, Slot) -> Slot + Send + Sync + 'static,
    {
        self.result = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallContext, ScopeError) -> Result<Slot> + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn into_arc(self) -> Arc<dyn Instrument> {
        Arc::new(self)
    }
}

#[async_trait]
impl Instrument for HookInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self, ctx: &CallContext) -> bool {
        self.filter.as_ref().map_or(true, |f| f(ctx))
    }

    fn on_execute(&self, ctx: &CallContext, call: PendingCall) -> PendingCall {
        match &self.execute {
            Some(f) => f(ctx, call),
            None => call,
        }
    }

    fn on_result(&self, ctx: &CallContext, value: Slot) -> Slot {
        match &self.result {
            Some(f) => f(ctx, value),
            None => value,
        }
    }

    async fn on_error(&self, ctx: &CallContext, error: ScopeError) -> Result<Slot> {
        match &self.error {
            Some(f) => f(ctx, error),
            None => Err(error),
        }
    }
}

/// Logs every call and wraps it in a `tracing` span
pub struct TracingInstrument;

#[async_trait]
impl Instrument for TracingInstrument {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_execute(&self, ctx: &CallContext, call: PendingCall) -> PendingCall {
        let span = tracing::debug_span!("provider", call = %ctx.name(), scope = %ctx.scope);
        call.instrument(span).boxed()
    }

    fn on_result(&self, ctx: &CallContext, value: Slot) -> Slot {
        trace!("{} settled (has value: {})", ctx.name(), value.is_some());
        value
    }

    async fn on_error(&self, ctx: &CallContext, error: ScopeError) -> Result<Slot> {
        warn!("{} failed: {}", ctx.name(), error);
        Err(error)
    }
}

lazy_static! {
    static ref GLOBAL_PIPELINE: RwLock<Pipeline> = RwLock::new(Pipeline::new());
}

/// Install a process-wide instrument, applied before scope instruments
pub fn set_instrument(instrument: Arc<dyn Instrument>) {
    debug!("Installing global instrument {}", instrument.name());
    GLOBAL_PIPELINE.write().push(instrument);
}

/// Install a process-wide instrument built from the current pipeline
pub fn set_instrument_with<F>(factory: F)
where
    F: FnOnce(&Pipeline) -> Arc<dyn Instrument>,
{
    let mut pipeline = GLOBAL_PIPELINE.write();
    let instrument = factory(&pipeline);
    debug!("Installing global instrument {}", instrument.name());
    pipeline.push(instrument);
}

/// Remove every process-wide instrument
pub fn clear_instruments() {
    GLOBAL_PIPELINE.write().clear();
}

/// Snapshot of the process-wide pipeline
pub fn global_pipeline() -> Pipeline {
    GLOBAL_PIPELINE.read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> CallContext {
        CallContext::service("test.call", "unit")
    }

    #[tokio::test]
    async fn test_results_compose_left_to_right() {
        let pipeline = Pipeline::new()
            .with(
                HookInstrument::new("double")
                    .on_result(|_, slot| {
                        slot.and_then(|v| v.downcast_ref::<i32>().map(|n| Arc::new(n * 2) as AnyValue))
                    })
                    .into_arc(),
            )
            .with(
                HookInstrument::new("inc")
                    .on_result(|_, slot| {
                        slot.and_then(|v| v.downcast_ref::<i32>().map(|n| Arc::new(n + 1) as AnyValue))
                    })
                    .into_arc(),
            );
        let call: PendingCall = async { Ok(Some(Arc::new(5i32) as AnyValue)) }.boxed();
        let slot = pipeline.run(&ctx(), call).await.unwrap().unwrap();
        assert_eq!(*slot.downcast::<i32>().unwrap(), 11);
    }

    #[tokio::test]
    async fn test_error_recovery() {
        let pipeline = Pipeline::new().with(
            HookInstrument::new("recover")
                .on_error(|_, _| Ok(Some(Arc::new(0i32) as AnyValue)))
                .into_arc(),
        );
        let call: PendingCall = async { Err(ScopeError::shape("broken")) }.boxed();
        let slot = pipeline.run(&ctx(), call).await.unwrap().unwrap();
        assert_eq!(*slot.downcast::<i32>().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_filter_skips_instrument() {
        let pipeline = Pipeline::new().with(
            HookInstrument::new("never")
                .filter(|_| false)
                .on_result(|_, _| None)
                .into_arc(),
        );
        let call: PendingCall = async { Ok(Some(Arc::new(1i32) as AnyValue)) }.boxed();
        assert!(pipeline.run(&ctx(), call).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wrap_services_respects_depth() {
        let services = Services::new()
            .function("top", |args: Value| async move { Ok(args) })
            .group(
                "inner",
                Services::new().function("deep", |args: Value| async move { Ok(args) }),
            );
        let pipeline = Pipeline::new().with(
            HookInstrument::new("tag")
                .on_result(|_, _| Some(Arc::new(json!("tagged")) as AnyValue))
                .into_arc(),
        );

        let shallow = pipeline.wrap_services(&services, 1);
        assert_eq!(shallow.call("top", json!(1)).await.unwrap(), json!("tagged"));
        assert_eq!(shallow.call("inner.deep", json!(1)).await.unwrap(), json!(1));

        let deep = pipeline.wrap_services(&services, 2);
        assert_eq!(deep.call("inner.deep", json!(1)).await.unwrap(), json!("tagged"));
    }

    #[tokio::test]
    async fn test_services_call_errors() {
        let services = Services::new().group("g", Services::new());
        assert!(services.call("g", json!(null)).await.is_err());
        assert!(services.call("missing", json!(null)).await.is_err());
    }
}
