//! Executors that produce streams tied to the resolving scope.
//!
//! Every stream created here registers its teardown as a scope defer, so
//! disposing the scope tears down streams nobody unsubscribed from.

use futures::FutureExt;
use std::sync::Arc;
use tracing::trace;

use super::observable::{pull_observable, push_observable, Cleanup, Observable, Publisher, Sink};
use crate::executor::executor::erase_value;
use crate::executor::{Arity, ErasedProvider, Executor, ExecutorBuilder, ProviderCtx};
use crate::scope::Scope;

/// Push stream together with its publisher
pub struct Subject<T> {
    pub observable: Observable<T>,
    pub publisher: Publisher<T>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            observable: self.observable.clone(),
            publisher: self.publisher.clone(),
        }
    }
}

fn bind(scope: &Scope, teardown: Cleanup) {
    trace!("Binding stream teardown to scope '{}'", scope.label());
    scope.add_defer(move || teardown.run());
}

/// Executor resolving to a fresh push stream per scope
pub fn provide_observable<T>(initial: Option<T>) -> Executor<Subject<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let provider: ErasedProvider = Arc::new(move |ctx: ProviderCtx| {
        let (observable, publisher) = push_observable(initial.clone());
        bind(&ctx.scope, observable.teardown());
        let subject = Subject {
            observable,
            publisher,
        };
        futures::future::ready(Ok(Some(erase_value(subject)))).boxed()
    });
    ExecutorBuilder::new()
        .raw_provider(Arity::Nullary, provider)
        .build_checked()
}

/// Executor resolving to a cold stream whose producer receives `dependency`
pub fn derive_observable<D, T, F>(dependency: &Executor<D>, producer: F) -> Executor<Observable<T>>
where
    D: Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: Fn(Arc<D>, Sink<T>) -> Cleanup + Send + Sync + 'static,
{
    let producer = Arc::new(producer);
    let provider: ErasedProvider = Arc::new(move |ctx: ProviderCtx| {
        let outcome = ctx.input_as::<D>().map(|input| {
            let producer = producer.clone();
            let observable = pull_observable(move |sink: Sink<T>| producer(input.clone(), sink));
            bind(&ctx.scope, observable.teardown());
            Some(erase_value(observable))
        });
        futures::future::ready(outcome).boxed()
    });
    ExecutorBuilder::new()
        .input(dependency.as_any())
        .raw_provider(Arity::Unary, provider)
        .build_checked()
}

/// Executor resolving to `build(source)`; the whole chain is torn down with
/// the scope
pub fn create_pipe<S, T, F>(source: &Executor<Observable<S>>, build: F) -> Executor<Observable<T>>
where
    S: Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: Fn(Observable<S>) -> Observable<T> + Send + Sync + 'static,
{
    let provider: ErasedProvider = Arc::new(move |ctx: ProviderCtx| {
        let outcome = ctx.input_as::<Observable<S>>().map(|source| {
            let piped = build(Observable::clone(&source));
            bind(&ctx.scope, piped.teardown());
            Some(erase_value(piped))
        });
        futures::future::ready(outcome).boxed()
    });
    ExecutorBuilder::new()
        .input(source.as_any())
        .raw_provider(Arity::Unary, provider)
        .build_checked()
}
