//! Push and pull observables
//!
//! Callbacks run synchronously on the thread that publishes. No lock is held
//! while an observer runs, so observers may publish or subscribe again.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use crate::core::errors::ScopeError;

type NextFn<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&ScopeError) + Send + Sync>;
type CompleteFn = Arc<dyn Fn() + Send + Sync>;

/// Set of callbacks receiving a stream's signals
pub struct Observer<T> {
    next: Option<NextFn<T>>,
    error: Option<ErrorFn>,
    complete: Option<CompleteFn>,
}

impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Self {
            next: self.next.clone(),
            error: self.error.clone(),
            complete: self.complete.clone(),
        }
    }
}

impl<T> Default for Observer<T> {
    fn default() -> Self {
        Self {
            next: None,
            error: None,
            complete: None,
        }
    }
}

impl<T> Observer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_next<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.next = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ScopeError) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.complete = Some(Arc::new(f));
        self
    }

    pub fn next(&self, value: &T) {
        if let Some(f) = &self.next {
            f(value);
        }
    }

    pub fn error(&self, error: &ScopeError) {
        if let Some(f) = &self.error {
            f(error);
        }
    }

    pub fn complete(&self) {
        if let Some(f) = &self.complete {
            f();
        }
    }
}

/// Teardown callback that runs at most once
#[derive(Clone, Default)]
pub struct Cleanup {
    action: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl std::fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cleanup")
            .field("done", &self.is_done())
            .finish()
    }
}

impl Cleanup {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            action: Arc::new(Mutex::new(Some(Box::new(f)))),
        }
    }

    pub fn noop() -> Self {
        Self::default()
    }

    pub fn run(&self) {
        let action = self.action.lock().take();
        if let Some(action) = action {
            action();
        }
    }

    pub fn is_done(&self) -> bool {
        self.action.lock().is_none()
    }

    /// Run `self`, then `next`
    pub fn chain(self, next: Cleanup) -> Cleanup {
        Cleanup::new(move || {
            self.run();
            next.run();
        })
    }
}

/// Handle to one subscriber
#[derive(Clone, Debug)]
pub struct Subscription {
    cleanup: Cleanup,
}

impl Subscription {
    pub fn new(cleanup: Cleanup) -> Self {
        Self { cleanup }
    }

    /// Subscription that was never attached, e.g. to a terminated stream
    pub fn closed() -> Self {
        let cleanup = Cleanup::noop();
        Self { cleanup }
    }

    pub fn unsubscribe(&self) {
        self.cleanup.run();
    }

    pub fn is_closed(&self) -> bool {
        self.cleanup.is_done()
    }
}

type SubscribeFn<T> = Arc<dyn Fn(Observer<T>) -> Subscription + Send + Sync>;

/// Marks a stream produced by an operator; reports how many subscribers it
/// still has
#[derive(Clone)]
pub(crate) struct StageLink {
    subscribers: Arc<dyn Fn() -> usize + Send + Sync>,
}

impl StageLink {
    pub(crate) fn is_idle(&self) -> bool {
        (self.subscribers)() == 0
    }
}

/// Subscribable stream of `T`.
///
/// Cloning shares the stream. [`Observable::cleanup`] tears down the stream and
/// the operator stages it was built from once nothing else listens to them.
/// Streams that did not come from an operator, such as a push source, are
/// only unsubscribed from.
pub struct Observable<T> {
    subscribe: SubscribeFn<T>,
    teardown: Cleanup,
    stage: Option<StageLink>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            subscribe: self.subscribe.clone(),
            teardown: self.teardown.clone(),
            stage: self.stage.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("value_type", &std::any::type_name::<T>())
            .field("torn_down", &self.teardown.is_done())
            .finish()
    }
}

impl<T: 'static> Observable<T> {
    pub fn new<F>(subscribe: F, teardown: Cleanup) -> Self
    where
        F: Fn(Observer<T>) -> Subscription + Send + Sync + 'static,
    {
        Self {
            subscribe: Arc::new(subscribe),
            teardown,
            stage: None,
        }
    }

    pub fn subscribe(&self, observer: Observer<T>) -> Subscription {
        (self.subscribe)(observer)
    }

    /// Subscribe to values only
    pub fn subscribe_next<F>(&self, f: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe(Observer::new().on_next(f))
    }

    /// Apply an operator
    pub fn pipe<U, Op>(self, operator: Op) -> Observable<U>
    where
        Op: FnOnce(Observable<T>) -> Observable<U>,
    {
        operator(self)
    }

    pub fn teardown(&self) -> Cleanup {
        self.teardown.clone()
    }

    /// Same stream with an extra teardown step run after the existing one
    pub fn with_teardown(self, extra: Cleanup) -> Self {
        Self {
            subscribe: self.subscribe,
            teardown: self.teardown.chain(extra),
            stage: self.stage,
        }
    }

    pub(crate) fn into_stage(self, link: StageLink) -> Self {
        Self {
            stage: Some(link),
            ..self
        }
    }

    pub(crate) fn stage_link(&self) -> Option<StageLink> {
        self.stage.clone()
    }

    pub fn cleanup(&self) {
        self.teardown.run();
    }

    pub fn is_torn_down(&self) -> bool {
        self.teardown.is_done()
    }
}

enum PushState<T> {
    Init,
    Active(T),
    Errored(ScopeError),
    Completed,
}

struct PushInner<T> {
    state: PushState<T>,
    subscribers: Vec<(u64, Observer<T>)>,
    closed: bool,
}

struct PushShared<T> {
    inner: Mutex<PushInner<T>>,
    next_id: AtomicU64,
}

impl<T> PushShared<T> {
    fn detach(&self, id: u64) {
        self.inner.lock().subscribers.retain(|(sid, _)| *sid != id);
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }
}

/// Producer side of a push observable
pub struct Publisher<T> {
    shared: Arc<PushShared<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> {
    /// Emit a value. Ignored once the stream has terminated or closed.
    pub fn next(&self, value: T) {
        let subscribers = {
            let mut inner = self.shared.inner.lock();
            if inner.closed || matches!(inner.state, PushState::Errored(_) | PushState::Completed) {
                return;
            }
            inner.state = PushState::Active(value.clone());
            inner.subscribers.clone()
        };
        for (_, observer) in subscribers {
            observer.next(&value);
        }
    }

    pub fn error(&self, error: ScopeError) {
        let subscribers = {
            let mut inner = self.shared.inner.lock();
            if inner.closed || matches!(inner.state, PushState::Errored(_) | PushState::Completed) {
                return;
            }
            inner.state = PushState::Errored(error.clone());
            std::mem::take(&mut inner.subscribers)
        };
        debug!("Push observable errored: {}", error);
        for (_, observer) in subscribers {
            observer.error(&error);
        }
    }

    pub fn complete(&self) {
        let subscribers = {
            let mut inner = self.shared.inner.lock();
            if inner.closed || matches!(inner.state, PushState::Errored(_) | PushState::Completed) {
                return;
            }
            inner.state = PushState::Completed;
            std::mem::take(&mut inner.subscribers)
        };
        trace!("Push observable completed");
        for (_, observer) in subscribers {
            observer.complete();
        }
    }

    /// Drop every subscriber without signalling them
    pub fn close(&self) {
        self.shared.close();
    }

    /// Last emitted value, if the stream is active
    pub fn value(&self) -> Option<T> {
        match &self.shared.inner.lock().state {
            PushState::Active(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.closed || matches!(inner.state, PushState::Errored(_) | PushState::Completed)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.shared.inner.lock().state, PushState::Completed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.inner.lock().subscribers.len()
    }

    pub(crate) fn stage_link(&self) -> StageLink {
        let shared = self.shared.clone();
        StageLink {
            subscribers: Arc::new(move || shared.inner.lock().subscribers.len()),
        }
    }
}

/// Hot stream. Late subscribers get the last value, or the terminal signal.
pub fn push_observable<T>(initial: Option<T>) -> (Observable<T>, Publisher<T>)
where
    T: Clone + Send + Sync + 'static,
{
    let state = match initial {
        Some(value) => PushState::Active(value),
        None => PushState::Init,
    };
    let shared = Arc::new(PushShared {
        inner: Mutex::new(PushInner {
            state,
            subscribers: Vec::new(),
            closed: false,
        }),
        next_id: AtomicU64::new(0),
    });

    let for_subscribe = shared.clone();
    let subscribe = move |observer: Observer<T>| -> Subscription { attach(&for_subscribe, observer) };

    let for_teardown = shared.clone();
    let teardown = Cleanup::new(move || for_teardown.close());

    let observable = Observable::new(subscribe, teardown);
    (observable, Publisher { shared })
}

enum Replay<T> {
    Value(T),
    Error(ScopeError),
    Complete,
}

fn attach<T>(shared: &Arc<PushShared<T>>, observer: Observer<T>) -> Subscription
where
    T: Clone + Send + Sync + 'static,
{
    let (replay, subscription) = {
        let mut inner = shared.inner.lock();
        if inner.closed {
            return Subscription::closed();
        }
        let replay = match &inner.state {
            PushState::Init => None,
            PushState::Active(value) => Some(Replay::Value(value.clone())),
            PushState::Errored(e) => Some(Replay::Error(e.clone())),
            PushState::Completed => Some(Replay::Complete),
        };
        let subscription = match replay {
            None | Some(Replay::Value(_)) => register(shared, &mut inner, observer.clone()),
            _ => Subscription::closed(),
        };
        (replay, subscription)
    };

    match replay {
        Some(Replay::Value(value)) => observer.next(&value),
        Some(Replay::Error(error)) => observer.error(&error),
        Some(Replay::Complete) => observer.complete(),
        None => {}
    }
    subscription
}

fn register<T>(shared: &Arc<PushShared<T>>, inner: &mut PushInner<T>, observer: Observer<T>) -> Subscription
where
    T: Send + Sync + 'static,
{
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    inner.subscribers.push((id, observer));
    let weak: Weak<PushShared<T>> = Arc::downgrade(shared);
    Subscription::new(Cleanup::new(move || {
        if let Some(shared) = weak.upgrade() {
            shared.detach(id);
        }
    }))
}

/// Producer handle of one pull subscription
pub struct Sink<T> {
    observer: Observer<T>,
    done: Arc<AtomicBool>,
    cleanup: Arc<Mutex<Option<Cleanup>>>,
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self {
            observer: self.observer.clone(),
            done: self.done.clone(),
            cleanup: self.cleanup.clone(),
        }
    }
}

impl<T> Sink<T> {
    pub fn next(&self, value: T) {
        if !self.is_closed() {
            self.observer.next(&value);
        }
    }

    pub fn error(&self, error: ScopeError) {
        if self.finish() {
            self.observer.error(&error);
            self.run_cleanup();
        }
    }

    /// Signal completion. The producer's cleanup runs right after.
    pub fn complete(&self) {
        if self.finish() {
            self.observer.complete();
            self.run_cleanup();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn finish(&self) -> bool {
        !self.done.swap(true, Ordering::SeqCst)
    }

    fn run_cleanup(&self) {
        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            cleanup.run();
        }
    }
}

/// Cold stream. Every subscribe runs `producer` again.
///
/// The producer returns the cleanup for its subscription. It runs on
/// unsubscribe, on completion or error, and when the observable is torn down.
pub fn pull_observable<T, F>(producer: F) -> Observable<T>
where
    T: Send + Sync + 'static,
    F: Fn(Sink<T>) -> Cleanup + Send + Sync + 'static,
{
    let live: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

    let tracked = live.clone();
    let subscribe = move |observer: Observer<T>| -> Subscription {
        let sink = Sink {
            observer,
            done: Arc::new(AtomicBool::new(false)),
            cleanup: Arc::new(Mutex::new(None)),
        };
        let cleanup = producer(sink.clone());
        if sink.is_closed() {
            // finished while producing
            cleanup.run();
            return Subscription::closed();
        }
        *sink.cleanup.lock() = Some(cleanup);

        let subscription = Subscription::new(Cleanup::new(move || {
            sink.done.store(true, Ordering::SeqCst);
            sink.run_cleanup();
        }));
        let mut tracked = tracked.lock();
        tracked.retain(|s| !s.is_closed());
        tracked.push(subscription.clone());
        subscription
    };

    let teardown = Cleanup::new(move || {
        let subscriptions = std::mem::take(&mut *live.lock());
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
    });

    Observable::new(subscribe, teardown)
}
