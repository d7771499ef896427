//! Keyed executor families
//!
//! A family hands out one memoized child executor per distinct key. Keys are
//! normalized to strings; two keys with the same normalized form share the
//! same child until the pool evicts it.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::combinators::{derive, group, Factory};
use super::executor::Executor;
use crate::core::errors::{Result, ScopeError};

/// Normalizes a raw key into a pool key
pub type KeyBuilder<K> = Arc<dyn Fn(&K) -> Result<String> + Send + Sync>;

struct PoolEntry<K, V> {
    raw: K,
    member: Executor<V>,
    seq: u64,
}

/// Storage of a family's members
pub struct FamilyPool<K, V> {
    entries: DashMap<String, PoolEntry<K, V>>,
    seq: AtomicU64,
}

impl<K: Clone + Send + Sync + 'static, V: Send + Sync + 'static> FamilyPool<K, V> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Insert unless the key is already present. Returns whether it was inserted.
    pub fn insert(&self, key: String, raw: K, member: Executor<V>) -> bool {
        let mut inserted = false;
        self.entries.entry(key).or_insert_with(|| {
            inserted = true;
            PoolEntry {
                raw,
                member,
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
            }
        });
        inserted
    }

    pub fn get(&self, key: &str) -> Option<Executor<V>> {
        self.entries.get(key).map(|entry| entry.member.clone())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove the entry only if it still holds the given member
    pub fn remove_member(&self, key: &str, member: &Executor<V>) -> bool {
        self.entries
            .remove_if(key, |_, entry| entry.member == *member)
            .is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Pool key of the earliest inserted entry
    pub fn oldest_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|entry| entry.seq)
            .map(|entry| entry.key().clone())
    }

    fn ordered(&self) -> Vec<(u64, K, Executor<V>)> {
        let mut items: Vec<(u64, K, Executor<V>)> = self
            .entries
            .iter()
            .map(|entry| (entry.seq, entry.raw.clone(), entry.member.clone()))
            .collect();
        items.sort_by_key(|(seq, _, _)| *seq);
        items
    }
}

/// Insertion policy of a family pool
pub trait PoolControl<K, V>: Send + Sync {
    fn insert(&self, pool: &Arc<FamilyPool<K, V>>, key: String, raw: K, member: Executor<V>);
}

/// Default policy: keep every member until removed explicitly
pub struct KeepAll;

impl<K: Clone + Send + Sync + 'static, V: Send + Sync + 'static> PoolControl<K, V> for KeepAll {
    fn insert(&self, pool: &Arc<FamilyPool<K, V>>, key: String, raw: K, member: Executor<V>) {
        pool.insert(key, raw, member);
    }
}

/// Evict members a fixed time after insertion.
///
/// Needs a tokio runtime; without one the member is kept.
pub struct TtlPool {
    ttl: Duration,
}

impl TtlPool {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

impl<K: Clone + Send + Sync + 'static, V: Send + Sync + 'static> PoolControl<K, V> for TtlPool {
    fn insert(&self, pool: &Arc<FamilyPool<K, V>>, key: String, raw: K, member: Executor<V>) {
        if !pool.insert(key.clone(), raw, member.clone()) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::downgrade(pool);
                let ttl = self.ttl;
                handle.spawn(async move {
                    tokio::time::sleep(ttl).await;
                    if let Some(pool) = pool.upgrade() {
                        if pool.remove_member(&key, &member) {
                            debug!("Family member {} expired", key);
                        }
                    }
                });
            }
            Err(_) => warn!("No tokio runtime, family member {} will not expire", key),
        }
    }
}

/// Keep at most `capacity` members, evicting the oldest insertion first
pub struct BoundedPool {
    capacity: usize,
}

impl BoundedPool {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ScopeError::configuration("pool capacity cannot be zero"));
        }
        Ok(Self { capacity })
    }
}

impl<K: Clone + Send + Sync + 'static, V: Send + Sync + 'static> PoolControl<K, V> for BoundedPool {
    fn insert(&self, pool: &Arc<FamilyPool<K, V>>, key: String, raw: K, member: Executor<V>) {
        pool.insert(key, raw, member);
        while pool.len() > self.capacity {
            match pool.oldest_key() {
                Some(oldest) => {
                    debug!("Evicting family member {}", oldest);
                    pool.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Default key normalization.
///
/// Serializes the key to JSON with object keys sorted at every level. Objects
/// carrying an `id` field are identified by that field alone. Executors
/// serialize by identity.
pub fn canonical_key<K: Serialize>(key: &K) -> Result<String> {
    let value = serde_json::to_value(key)?;
    let value = match value {
        Value::Object(mut map) if map.contains_key("id") => map.remove("id").unwrap_or(Value::Null),
        other => other,
    };
    Ok(serde_json::to_string(&sort_keys(value))?)
}

/// Options for [`Family`]
pub struct FamilyOptions<K, V> {
    pub key_builder: Option<KeyBuilder<K>>,
    pub pool_control: Option<Arc<dyn PoolControl<K, V>>>,
    pub label: Option<String>,
}

impl<K, V> Default for FamilyOptions<K, V> {
    fn default() -> Self {
        Self {
            key_builder: None,
            pool_control: None,
            label: None,
        }
    }
}

impl<K, V> FamilyOptions<K, V> {
    pub fn key_builder<F>(mut self, f: F) -> Self
    where
        F: Fn(&K) -> Result<String> + Send + Sync + 'static,
    {
        self.key_builder = Some(Arc::new(f));
        self
    }

    pub fn pool_control<P: PoolControl<K, V> + 'static>(mut self, control: P) -> Self {
        self.pool_control = Some(Arc::new(control));
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Keyed factory of memoized child executors
pub struct Family<K, V> {
    builder: Arc<dyn Fn(&K) -> Executor<V> + Send + Sync>,
    key_builder: KeyBuilder<K>,
    pool_control: Arc<dyn PoolControl<K, V>>,
    pool: Arc<FamilyPool<K, V>>,
    label: Option<String>,
}

impl<K, V> Clone for Family<K, V> {
    fn clone(&self) -> Self {
        Self {
            builder: self.builder.clone(),
            key_builder: self.key_builder.clone(),
            pool_control: self.pool_control.clone(),
            pool: self.pool.clone(),
            label: self.label.clone(),
        }
    }
}

impl<K, V> Family<K, V>
where
    K: Serialize + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new<F>(builder: F) -> Self
    where
        F: Fn(&K) -> Executor<V> + Send + Sync + 'static,
    {
        Self::with_options(builder, FamilyOptions::default())
    }

    pub fn with_options<F>(builder: F, options: FamilyOptions<K, V>) -> Self
    where
        F: Fn(&K) -> Executor<V> + Send + Sync + 'static,
    {
        Self {
            builder: Arc::new(builder),
            key_builder: options
                .key_builder
                .unwrap_or_else(|| Arc::new(|key: &K| canonical_key(key))),
            pool_control: options.pool_control.unwrap_or_else(|| Arc::new(KeepAll)),
            pool: Arc::new(FamilyPool::new()),
            label: options.label,
        }
    }

    fn normalize(&self, key: &K) -> Result<String> {
        let normalized = (self.key_builder)(key)?;
        if normalized.is_empty() {
            return Err(ScopeError::EmptyKey);
        }
        Ok(normalized)
    }

    /// Member executor for `key`, created on first use
    pub fn get(&self, key: K) -> Result<Executor<V>> {
        let normalized = self.normalize(&key)?;
        if let Some(member) = self.pool.get(&normalized) {
            return Ok(member);
        }

        let member = (self.builder)(&key);
        trace!(
            "Family '{}' member {} created for key {}",
            self.label.as_deref().unwrap_or("unlabeled"),
            member.id(),
            normalized
        );
        self.pool_control
            .insert(&self.pool, normalized.clone(), key, member.clone());
        // A concurrent caller may have won the insert; hand out the pooled member.
        Ok(self.pool.get(&normalized).unwrap_or(member))
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.pool.contains(&self.normalize(key)?))
    }

    pub fn remove(&self, key: &K) -> Result<bool> {
        Ok(self.pool.remove(&self.normalize(key)?))
    }

    pub fn clear(&self) {
        self.pool.clear();
    }

    pub fn size(&self) -> usize {
        self.pool.len()
    }

    /// Members in insertion order
    pub fn members(&self) -> Vec<Executor<V>> {
        self.pool.ordered().into_iter().map(|(_, _, m)| m).collect()
    }

    /// Raw keys in insertion order
    pub fn raw_members(&self) -> Vec<K> {
        self.pool.ordered().into_iter().map(|(_, k, _)| k).collect()
    }

    /// One executor resolving every current member, in insertion order
    pub fn grouped_members(&self) -> Executor<Vec<Arc<V>>> {
        group(&self.members())
    }
}

/// Family whose members apply the factory resolved from `base` to their key
pub fn create_family<K, V>(
    base: &Executor<Factory<K, V>>,
    options: FamilyOptions<K, V>,
) -> Family<K, V>
where
    K: Serialize + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let base = base.clone();
    Family::with_options(
        move |key: &K| {
            let key = key.clone();
            derive(&base, move |factory: Arc<Factory<K, V>>| {
                Ok(factory.call(key.clone()))
            })
        },
        options,
    )
}
