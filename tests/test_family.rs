//! Keyed family tests

use pretty_assertions::assert_eq;
use scopeflow::executor::{canonical_key, BoundedPool, TtlPool};
use scopeflow::{create_family, factory, provide, value, Family, FamilyOptions, Scope, ScopeError};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Serialize)]
struct UserKey {
    id: u64,
    name: String,
}

#[test]
fn test_deep_equal_keys_share_member() {
    let family = Family::new(|key: &serde_json::Value| {
        let key = key.clone();
        provide(move || Ok(key.to_string()))
    });

    let first = family.get(json!({"a": 1, "b": {"y": 2, "x": 1}})).unwrap();
    let second = family.get(json!({"b": {"x": 1, "y": 2}, "a": 1})).unwrap();
    let other = family.get(json!({"a": 2})).unwrap();

    assert_eq!(first.id(), second.id());
    assert_ne!(first.id(), other.id());
    assert_eq!(family.size(), 2);
}

#[test]
fn test_id_field_identifies_key() {
    let family = Family::new(|key: &UserKey| value(key.name.clone()));

    let first = family
        .get(UserKey {
            id: 7,
            name: "ada".into(),
        })
        .unwrap();
    let renamed = family
        .get(UserKey {
            id: 7,
            name: "lovelace".into(),
        })
        .unwrap();

    assert_eq!(first.id(), renamed.id());
    assert_eq!(canonical_key(&json!({"id": 7, "name": "x"})).unwrap(), "7");
}

#[test]
fn test_empty_key_fails_fast() {
    let family = Family::with_options(
        |key: &String| value(key.clone()),
        FamilyOptions::default().key_builder(|key: &String| Ok(key.trim().to_string())),
    );
    assert!(matches!(family.get("   ".to_string()), Err(ScopeError::EmptyKey)));
    assert_eq!(family.size(), 0);
}

#[test]
fn test_remove_and_clear() {
    let family = Family::new(|key: &u32| value(*key));
    let first = family.get(1).unwrap();
    family.get(2).unwrap();

    assert!(family.remove(&1).unwrap());
    assert!(!family.contains(&1).unwrap());
    assert_ne!(family.get(1).unwrap().id(), first.id());

    family.clear();
    assert_eq!(family.size(), 0);
}

#[tokio::test]
async fn test_members_and_grouping() {
    let family = Family::new(|key: &u32| value(*key * 100));
    for key in [3, 1, 2] {
        family.get(key).unwrap();
    }

    assert_eq!(family.raw_members(), vec![3, 1, 2]);
    assert_eq!(family.members().len(), 3);

    let scope = Scope::new();
    let grouped = scope.resolve(&family.grouped_members()).await.unwrap();
    let values: Vec<u32> = grouped.iter().map(|v| **v).collect();
    assert_eq!(values, vec![300, 100, 200]);
}

#[tokio::test]
async fn test_create_family_applies_factory() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let prefix = provide(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok("user".to_string())
    });
    let naming = factory(&prefix, |prefix: &String, id: u32| format!("{}-{}", prefix, id));
    let family = create_family(&naming, FamilyOptions::default().label("user"));

    let scope = Scope::new();
    let one = scope.resolve(&family.get(1).unwrap()).await.unwrap();
    let two = scope.resolve(&family.get(2).unwrap()).await.unwrap();
    assert_eq!(one.as_str(), "user-1");
    assert_eq!(two.as_str(), "user-2");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_family_leaves_shared_members_untouched() {
    let shared = value(1u32);
    let handle = shared.clone();
    let family = Family::with_options(
        move |_: &u32| handle.clone(),
        FamilyOptions::default().label("aliases"),
    );

    assert_eq!(family.get(1).unwrap().id(), shared.id());
    assert_eq!(family.get(2).unwrap().id(), shared.id());
    assert_eq!(shared.as_any().label(), None);
}

#[test]
fn test_bounded_pool_evicts_oldest() {
    assert!(BoundedPool::new(0).is_err());

    let family = Family::with_options(
        |key: &u32| value(*key),
        FamilyOptions::default().pool_control(BoundedPool::new(2).unwrap()),
    );
    for key in [1, 2, 3] {
        family.get(key).unwrap();
    }
    assert_eq!(family.size(), 2);
    assert_eq!(family.raw_members(), vec![2, 3]);
}

#[tokio::test]
async fn test_ttl_pool_expires_members() {
    let family = Family::with_options(
        |key: &u32| value(*key),
        FamilyOptions::default().pool_control(TtlPool::new(Duration::from_millis(20))),
    );
    family.get(1).unwrap();
    assert_eq!(family.size(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(family.size(), 0);
}
