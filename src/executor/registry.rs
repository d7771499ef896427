//! Debug registry of created executors
//!
//! Disabled by default. Resolution never consults it; it only exists so tools
//! can list the executors that are alive in the process.

use dashmap::DashMap;
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use tracing::debug;

use super::executor::{AnyExecutor, ExecutorId, ExecutorInfo, ExecutorInner};

pub struct Registry {
    enabled: AtomicBool,
    entries: DashMap<ExecutorId, Weak<ExecutorInner>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            entries: DashMap::new(),
        }
    }
}

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

/// Start recording executors created from now on
pub fn enable() {
    REGISTRY.enabled.store(true, Ordering::SeqCst);
    debug!("Executor registry enabled");
}

/// Stop recording and forget every entry
pub fn disable() {
    REGISTRY.enabled.store(false, Ordering::SeqCst);
    REGISTRY.entries.clear();
    debug!("Executor registry disabled");
}

pub fn is_enabled() -> bool {
    REGISTRY.enabled.load(Ordering::SeqCst)
}

pub(crate) fn record(executor: &AnyExecutor) {
    if !is_enabled() {
        return;
    }
    REGISTRY
        .entries
        .insert(executor.id(), std::sync::Arc::downgrade(&executor.inner));
}

/// Look up a live executor by identity
pub fn lookup(id: ExecutorId) -> Option<AnyExecutor> {
    REGISTRY
        .entries
        .get(&id)
        .and_then(|weak| weak.upgrade())
        .map(|inner| AnyExecutor { inner })
}

/// Live executors, ordered by identity. Dead entries are pruned.
pub fn snapshot() -> Vec<ExecutorInfo> {
    REGISTRY.entries.retain(|_, weak| weak.strong_count() > 0);
    let mut infos: Vec<ExecutorInfo> = REGISTRY
        .entries
        .iter()
        .filter_map(|entry| entry.value().upgrade())
        .map(|inner| AnyExecutor { inner }.info())
        .collect();
    infos.sort_by_key(|info| info.id);
    infos
}
