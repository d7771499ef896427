//! Reactive streams: push and pull observables, operators and scope-bound
//! stream executors

pub mod bound;
pub mod holder;
pub mod observable;
pub mod observables;
pub mod operators;

pub use bound::{create_pipe, derive_observable, provide_observable, Subject};
pub use holder::Holder;
pub use observable::{
    pull_observable, push_observable, Cleanup, Observable, Observer, Publisher, Sink, Subscription,
};
pub use observables::combine_latest;

/// Apply operators left to right.
///
/// `pipe!(source, a, b)` is `source.pipe(a).pipe(b)`.
#[macro_export]
macro_rules! pipe {
    ($source:expr $(, $operator:expr)* $(,)?) => {{
        let observable = $source;
        $(let observable = observable.pipe($operator);)*
        observable
    }};
}
