//! Stream operators
//!
//! Each operator subscribes to its upstream when applied and republishes
//! through a fresh push observable, so piped streams are hot. Error and
//! completion pass through unchanged. A user callback that panics or returns
//! `Err` turns into an error signal on the operator's own output.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::observable::{push_observable, Cleanup, Observable, Observer, Publisher, Subscription};
use crate::core::errors::ScopeError;

fn guarded<R>(f: impl FnOnce() -> R) -> Result<R, ScopeError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(ScopeError::from_panic)
}

/// Wire a new stage onto `source`.
///
/// `wire` gets the stage's publisher and returns the handler for upstream
/// values. Tearing the stage down unsubscribes it from upstream. An upstream
/// operator stage left without subscribers is torn down too; a source that
/// no operator built is left running for its other consumers.
pub(crate) fn stage<A, B, W, N>(source: Observable<A>, wire: W) -> Observable<B>
where
    A: 'static,
    B: Clone + Send + Sync + 'static,
    W: FnOnce(Publisher<B>) -> N,
    N: Fn(&A) + Send + Sync + 'static,
{
    let (output, publisher) = push_observable::<B>(None);
    let link = publisher.stage_link();
    let on_next = wire(publisher.clone());
    let on_error = publisher.clone();
    let on_complete = publisher;
    let upstream = source.subscribe(
        Observer::new()
            .on_next(on_next)
            .on_error(move |e: &ScopeError| on_error.error(e.clone()))
            .on_complete(move || on_complete.complete()),
    );
    let upstream_stage = source.stage_link();
    let source_teardown = source.teardown();
    output
        .with_teardown(Cleanup::new(move || {
            upstream.unsubscribe();
            if upstream_stage.is_some_and(|stage| stage.is_idle()) {
                source_teardown.run();
            }
        }))
        .into_stage(link)
}

fn emit<B: Clone + Send + Sync + 'static>(out: &Publisher<B>, outcome: Result<B, ScopeError>) {
    match outcome {
        Ok(value) => out.next(value),
        Err(e) => out.error(e),
    }
}

pub fn map<A, B, F>(f: F) -> impl FnOnce(Observable<A>) -> Observable<B>
where
    A: 'static,
    B: Clone + Send + Sync + 'static,
    F: Fn(&A) -> B + Send + Sync + 'static,
{
    move |source: Observable<A>| {
        stage(source, move |out: Publisher<B>| {
            move |a: &A| emit(&out, guarded(|| f(a)))
        })
    }
}

/// Fallible map; `Err` becomes an error signal
pub fn try_map<A, B, F>(f: F) -> impl FnOnce(Observable<A>) -> Observable<B>
where
    A: 'static,
    B: Clone + Send + Sync + 'static,
    F: Fn(&A) -> anyhow::Result<B> + Send + Sync + 'static,
{
    move |source: Observable<A>| {
        stage(source, move |out: Publisher<B>| {
            move |a: &A| {
                let outcome = guarded(|| f(a)).and_then(|r| r.map_err(ScopeError::stream_from));
                emit(&out, outcome)
            }
        })
    }
}

pub fn filter<A, F>(predicate: F) -> impl FnOnce(Observable<A>) -> Observable<A>
where
    A: Clone + Send + Sync + 'static,
    F: Fn(&A) -> bool + Send + Sync + 'static,
{
    move |source: Observable<A>| {
        stage(source, move |out: Publisher<A>| {
            move |a: &A| match guarded(|| predicate(a)) {
                Ok(true) => out.next(a.clone()),
                Ok(false) => {}
                Err(e) => out.error(e),
            }
        })
    }
}

/// Run a side effect for every value, forwarding it unchanged
pub fn tap<A, F>(f: F) -> impl FnOnce(Observable<A>) -> Observable<A>
where
    A: Clone + Send + Sync + 'static,
    F: Fn(&A) + Send + Sync + 'static,
{
    move |source: Observable<A>| {
        stage(source, move |out: Publisher<A>| {
            move |a: &A| match guarded(|| f(a)) {
                Ok(()) => out.next(a.clone()),
                Err(e) => out.error(e),
            }
        })
    }
}

/// Hold the most recent value and replay it to every later subscriber
pub fn latest<A>() -> impl FnOnce(Observable<A>) -> Observable<A>
where
    A: Clone + Send + Sync + 'static,
{
    move |source: Observable<A>| stage(source, |out: Publisher<A>| move |a: &A| out.next(a.clone()))
}

/// Drop values equal to the previous one
pub fn emit_on_change<A>() -> impl FnOnce(Observable<A>) -> Observable<A>
where
    A: Clone + PartialEq + Send + Sync + 'static,
{
    emit_on_change_by(|previous: &A, next: &A| previous == next)
}

/// Drop values that `same` considers equal to the previous one
pub fn emit_on_change_by<A, F>(same: F) -> impl FnOnce(Observable<A>) -> Observable<A>
where
    A: Clone + Send + Sync + 'static,
    F: Fn(&A, &A) -> bool + Send + Sync + 'static,
{
    move |source: Observable<A>| {
        stage(source, move |out: Publisher<A>| {
            let previous: Mutex<Option<A>> = Mutex::new(None);
            move |a: &A| {
                let last = previous.lock().clone();
                let unchanged = match &last {
                    Some(last) => guarded(|| same(last, a)),
                    None => Ok(false),
                };
                match unchanged {
                    Ok(true) => {}
                    Ok(false) => {
                        *previous.lock() = Some(a.clone());
                        out.next(a.clone());
                    }
                    Err(e) => out.error(e),
                }
            }
        })
    }
}

/// Fold every value into an accumulator and emit each intermediate result
pub fn reduce<A, B, F>(seed: B, f: F) -> impl FnOnce(Observable<A>) -> Observable<B>
where
    A: 'static,
    B: Clone + Send + Sync + 'static,
    F: Fn(&B, &A) -> B + Send + Sync + 'static,
{
    move |source: Observable<A>| {
        stage(source, move |out: Publisher<B>| {
            let acc = Mutex::new(seed);
            move |a: &A| {
                let current = acc.lock().clone();
                match guarded(|| f(&current, a)) {
                    Ok(next) => {
                        *acc.lock() = next.clone();
                        out.next(next);
                    }
                    Err(e) => out.error(e),
                }
            }
        })
    }
}

/// Pair each value with the latest value of `other`.
///
/// Values arriving before `other` has emitted are dropped. Errors from
/// `other` are forwarded; its completion is not.
pub fn with_latest_from<A, B>(other: Observable<B>) -> impl FnOnce(Observable<A>) -> Observable<(A, B)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    move |source: Observable<A>| {
        let side: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let side_slot = side.clone();
        let output = stage(source, move |out: Publisher<(A, B)>| {
            let latest: Arc<Mutex<Option<B>>> = Arc::new(Mutex::new(None));
            let store = latest.clone();
            let on_error = out.clone();
            let subscription = other.subscribe(
                Observer::new()
                    .on_next(move |b: &B| *store.lock() = Some(b.clone()))
                    .on_error(move |e: &ScopeError| on_error.error(e.clone())),
            );
            *side_slot.lock() = Some(subscription);
            move |a: &A| {
                let current = latest.lock().clone();
                if let Some(b) = current {
                    out.next((a.clone(), b));
                }
            }
        });
        output.with_teardown(Cleanup::new(move || {
            if let Some(subscription) = side.lock().take() {
                subscription.unsubscribe();
            }
        }))
    }
}

/// Serialize each value to JSON
pub fn to_json<A>() -> impl FnOnce(Observable<A>) -> Observable<Value>
where
    A: Serialize + 'static,
{
    move |source: Observable<A>| {
        stage(source, |out: Publisher<Value>| {
            move |a: &A| emit(&out, serde_json::to_value(a).map_err(ScopeError::from))
        })
    }
}
