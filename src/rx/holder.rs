use parking_lot::{ReentrantMutex, RwLock};

use super::observable::{push_observable, Observable, Publisher};

/// Current-value cell that publishes every replacement.
///
/// Values are replaced whole; changes inside a held value are not observed.
/// Writers are serialized and publish before the next writer starts, so
/// subscribers see replacements in the order they were stored.
pub struct Holder<T> {
    current: RwLock<T>,
    // reentrant so an observer may write back into the holder
    writer: ReentrantMutex<()>,
    publisher: Publisher<T>,
    changes: Observable<T>,
}

impl<T: Clone + Send + Sync + 'static> Holder<T> {
    pub fn new(initial: T) -> Self {
        let (changes, publisher) = push_observable(Some(initial.clone()));
        Self {
            current: RwLock::new(initial),
            writer: ReentrantMutex::new(()),
            publisher,
            changes,
        }
    }

    pub fn get(&self) -> T {
        self.current.read().clone()
    }

    /// Replace the value and publish it, returning the previous one
    pub fn set(&self, value: T) -> T {
        let _writer = self.writer.lock();
        self.replace(value)
    }

    /// Atomically replace the value with `f(current)`
    pub fn update<F>(&self, f: F) -> T
    where
        F: FnOnce(&T) -> T,
    {
        let _writer = self.writer.lock();
        let next = f(&self.current.read());
        self.replace(next.clone());
        next
    }

    // caller holds `writer`
    fn replace(&self, value: T) -> T {
        let previous = std::mem::replace(&mut *self.current.write(), value.clone());
        self.publisher.next(value);
        previous
    }

    /// Stream of values; subscribers first receive the current one
    pub fn changes(&self) -> Observable<T> {
        self.changes.clone()
    }
}

impl<T: Clone + Send + Sync + std::fmt::Debug + 'static> std::fmt::Debug for Holder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Holder").field("current", &self.get()).finish()
    }
}
