//! Multi-source stream constructors

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::trace;

use super::observable::{push_observable, Cleanup, Observable, Observer};
use crate::core::errors::ScopeError;

struct LatestState<T> {
    values: BTreeMap<String, T>,
    completed: BTreeSet<String>,
}

/// Merge named streams into snapshots of their latest values.
///
/// Nothing is emitted until every source has emitted once; after that each
/// value from any source emits the full snapshot. The output completes when
/// every source has completed and errors as soon as any source errors.
/// Tearing the output down unsubscribes from the sources.
pub fn combine_latest<I, S, T>(sources: I) -> Observable<BTreeMap<String, T>>
where
    I: IntoIterator<Item = (S, Observable<T>)>,
    S: Into<String>,
    T: Clone + Send + Sync + 'static,
{
    let sources: BTreeMap<String, Observable<T>> = sources
        .into_iter()
        .map(|(name, source)| (name.into(), source))
        .collect();
    let (output, publisher) = push_observable(None);
    let total = sources.len();
    if total == 0 {
        publisher.complete();
        return output;
    }

    let state = Arc::new(Mutex::new(LatestState {
        values: BTreeMap::new(),
        completed: BTreeSet::new(),
    }));
    let mut subscriptions = Vec::with_capacity(total);

    for (name, source) in sources {
        let on_next = {
            let state = state.clone();
            let out = publisher.clone();
            let name = name.clone();
            move |value: &T| {
                let snapshot = {
                    let mut state = state.lock();
                    state.values.insert(name.clone(), value.clone());
                    (state.values.len() == total).then(|| state.values.clone())
                };
                if let Some(snapshot) = snapshot {
                    out.next(snapshot);
                }
            }
        };
        let on_error = {
            let out = publisher.clone();
            move |e: &ScopeError| out.error(e.clone())
        };
        let on_complete = {
            let state = state.clone();
            let out = publisher.clone();
            move || {
                let all_done = {
                    let mut state = state.lock();
                    state.completed.insert(name.clone());
                    state.completed.len() == total
                };
                if all_done {
                    trace!("combine_latest: all {} sources completed", total);
                    out.complete();
                }
            }
        };
        subscriptions.push(
            source.subscribe(
                Observer::new()
                    .on_next(on_next)
                    .on_error(on_error)
                    .on_complete(on_complete),
            ),
        );
    }

    output.with_teardown(Cleanup::new(move || {
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_completes_when_all_complete() {
        let (a, a_pub) = push_observable::<i32>(None);
        let (b, b_pub) = push_observable::<i32>(None);
        let combined = combine_latest([("a", a), ("b", b)]);
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        combined.subscribe(Observer::new().on_complete(move || flag.store(true, Ordering::SeqCst)));
        a_pub.complete();
        assert!(!done.load(Ordering::SeqCst));
        b_pub.complete();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_empty_completes_immediately() {
        let combined = combine_latest(Vec::<(String, Observable<i32>)>::new());
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        combined.subscribe(Observer::new().on_complete(move || flag.store(true, Ordering::SeqCst)));
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_teardown_detaches_sources() {
        let (a, a_pub) = push_observable::<i32>(None);
        let combined = combine_latest([("a", a)]);
        assert_eq!(a_pub.subscriber_count(), 1);
        combined.cleanup();
        assert_eq!(a_pub.subscriber_count(), 0);
    }
}
