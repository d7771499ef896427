//! Resolution, memoization and lifecycle tests for Scope

use futures::future::Shared;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use scopeflow::executor::ExecutorId;
use scopeflow::{
    combine, create_scope, defaults, derive, factorize, factory, group, map, map_with, provide,
    provide_async, value, DependencyGraph, Executor, ExecutorBuilder, HookInstrument, Scope,
    ScopeConfig, ScopeError, Services,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn counted(start: i32) -> (Executor<i32>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let executor = provide(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        Ok(start + n as i32)
    });
    (executor, calls)
}

#[tokio::test]
async fn test_memoization_shares_one_promise() {
    let (a, calls) = counted(1);
    let scope = Scope::new();

    let first = scope.resolve_shared(&a);
    let second = scope.resolve_shared(&a);
    assert!(Shared::ptr_eq(&first, &second));

    let x = scope.resolve(&a).await.unwrap();
    let y = scope.resolve(&a).await.unwrap();
    assert!(Arc::ptr_eq(&x, &y));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_resolves_share_invocation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let slow = provide_async(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok("done".to_string())
        }
    });
    let scope = Scope::new();
    let (a, b) = tokio::join!(scope.resolve(&slow), scope.resolve(&slow));
    assert_eq!(a.unwrap().as_str(), "done");
    assert_eq!(b.unwrap().as_str(), "done");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scopes_are_isolated() {
    let counter = provide(|| Ok(Mutex::new(0)));
    let first = Scope::new();
    let second = Scope::new();

    *first.resolve(&counter).await.unwrap().lock() += 5;
    assert_eq!(*first.resolve(&counter).await.unwrap().lock(), 5);
    assert_eq!(*second.resolve(&counter).await.unwrap().lock(), 0);
}

#[tokio::test]
async fn test_dispose_resets_state() {
    let (a, calls) = counted(10);
    let scope = Scope::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    assert_eq!(*scope.resolve(&a).await.unwrap(), 10);
    let log = order.clone();
    scope.add_defer(move || log.lock().push("first"));
    let log = order.clone();
    scope.add_async_defer(move || async move {
        tokio::task::yield_now().await;
        log.lock().push("second");
    });
    assert!(scope.has(&a));

    scope.dispose().await;
    assert!(!scope.has(&a));
    assert_eq!(*order.lock(), vec!["first", "second"]);
    assert_eq!(scope.defer_count(), 0);

    assert_eq!(*scope.resolve(&a).await.unwrap(), 11);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_fallback_prefers_first_parent() {
    let (a, calls) = counted(1);
    let parent_a = Scope::new();
    let parent_b = Scope::new();
    parent_a.set(&a, 100);
    parent_b.set(&a, 200);

    let child = create_scope(&[parent_a.clone(), parent_b.clone()]);
    assert!(child.has(&a));
    assert_eq!(*child.resolve(&a).await.unwrap(), 100);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(child.cached_count(), 0);
}

#[tokio::test]
async fn test_fallback_computes_locally() {
    let (a, calls) = counted(1);
    let parent = Scope::new();
    let child = create_scope(&[parent.clone()]);

    assert_eq!(*child.resolve(&a).await.unwrap(), 1);
    assert!(!parent.has(&a));
    assert!(child.has(&a));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_combine_resolves_children_once() {
    let (a, calls) = counted(1);
    let b = map(&a, |x| x + 1);
    let c = map(&a, |x| x * 10);
    let left = combine([("a", a.erase()), ("b", b.erase())]);
    let right = combine([("a", a.erase()), ("c", c.erase())]);
    let both = combine([("left", left.erase()), ("right", right.erase())]);

    let scope = Scope::new();
    let resolved = scope.resolve(&both).await.unwrap();
    let left = resolved.get::<scopeflow::Combined>("left").unwrap();
    let right = resolved.get::<scopeflow::Combined>("right").unwrap();
    assert_eq!(*left.get::<i32>("b").unwrap(), 2);
    assert_eq!(*right.get::<i32>("c").unwrap(), 10);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(both.separate().len(), 2);
}

#[tokio::test]
async fn test_provide_map_end_to_end() {
    let (a, calls) = counted(1);
    let b = map(&a, |x| x + 1);
    let scope = create_scope(&[]);

    assert_eq!(*scope.resolve(&b).await.unwrap(), 2);
    assert_eq!(*scope.resolve(&a).await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resolve_named_and_all() {
    let a = value(1i32);
    let b = value(2i32);
    let scope = Scope::new();

    let named = scope
        .resolve_named([("a", a.erase()), ("b", b.erase())])
        .await
        .unwrap();
    assert_eq!(named.names(), vec!["a", "b"]);

    let all = scope.resolve_all(&[b.clone(), a.clone()]).await.unwrap();
    assert_eq!(all.iter().map(|v| **v).collect::<Vec<_>>(), vec![2, 1]);

    let grouped = group(&[a, b]);
    assert_eq!(scope.resolve(&grouped).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_map_with_resolved_transform() {
    let source = value(4i32);
    let transform = value(|x: &i32| x * x);
    let squared: Executor<i32> = map_with(&source, &transform);
    assert_eq!(*Scope::new().resolve(&squared).await.unwrap(), 16);
}

#[tokio::test]
async fn test_factory_and_factorize() {
    let base = value(10i32);
    let add = factory(&base, |base: &i32, n: i32| base + n);
    let fetch = factorize(&base, |base: Arc<i32>, n: i32| async move { Ok(*base * n) });

    let scope = Scope::new();
    assert_eq!(scope.resolve(&add).await.unwrap().call(5), 15);
    assert_eq!(scope.resolve(&fetch).await.unwrap().call(3).await.unwrap(), 30);
}

#[tokio::test]
async fn test_defaults_replaces_named_input() {
    let greeting = value("hello".to_string());
    let name = value("world".to_string());
    let message = ExecutorBuilder::<String>::new()
        .named_input([("greeting", greeting.erase()), ("name", name.erase())])
        .unary(|c: Arc<scopeflow::Combined>| {
            Ok(format!(
                "{} {}",
                c.get::<String>("greeting")?,
                c.get::<String>("name")?
            ))
        })
        .build()
        .unwrap();
    let custom = defaults(&message, [("name", value("rust".to_string()).erase())]).unwrap();

    let scope = Scope::new();
    assert_eq!(scope.resolve(&message).await.unwrap().as_str(), "hello world");
    assert_eq!(scope.resolve(&custom).await.unwrap().as_str(), "hello rust");

    let plain = map(&greeting, |g| g.len());
    assert!(matches!(defaults(&plain, Vec::<(String, _)>::new()), Err(ScopeError::Shape { .. })));
}

#[tokio::test]
async fn test_dependency_failure_blocks_dependent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let broken = provide(|| -> anyhow::Result<i32> { anyhow::bail!("database unreachable") });
    let dependent = derive(&broken, move |x: Arc<i32>| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(*x)
    });

    let err = Scope::new().resolve(&dependent).await.unwrap_err();
    assert_eq!(err.category(), "provider");
    assert!(err.to_string().contains("database unreachable"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_safe_run_distinguishes_failures() {
    let scope = Scope::new();
    let good = value(2i32);
    let broken = provide(|| -> anyhow::Result<i32> { anyhow::bail!("no config") });

    let ok = scope
        .safe_run(&good, |v: Arc<i32>, n: i32| async move { Ok(*v * n) }, 21)
        .await
        .unwrap();
    assert_eq!(ok, 42);

    let dep_err = scope
        .safe_run(&broken, |v: Arc<i32>, _: ()| async move { Ok(*v) }, ())
        .await
        .unwrap_err();
    assert!(matches!(dep_err, ScopeError::Dependency { .. }));

    let run_err = scope
        .safe_run(
            &good,
            |_: Arc<i32>, _: ()| async move { Err::<i32, _>(anyhow::anyhow!("runner broke")) },
            (),
        )
        .await
        .unwrap_err();
    assert!(matches!(run_err, ScopeError::Runner { .. }));
}

#[tokio::test]
async fn test_safe_resolve_catches_panic() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let explosive = provide(move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("first call explodes");
        }
        Ok(3i32)
    });
    let scope = Scope::new();

    let err = scope.safe_resolve(&explosive).await.unwrap_err();
    assert!(matches!(err, ScopeError::Panicked { .. }));
    assert!(!scope.has(&explosive));
    assert_eq!(*scope.safe_resolve(&explosive).await.unwrap(), 3);
}

#[tokio::test]
async fn test_scope_instrument_recovers_errors() {
    let broken = provide(|| -> anyhow::Result<i32> { anyhow::bail!("flaky") });
    let target = broken.id();
    let scope = Scope::new();
    scope.set_instrument(
        HookInstrument::new("fallback")
            .filter(move |ctx| ctx.executor_info().map(|i| i.id) == Some(target))
            .on_error(|_, _| Ok(Some(Arc::new(7i32) as scopeflow::AnyValue)))
            .into_arc(),
    );
    assert_eq!(*scope.resolve(&broken).await.unwrap(), 7);
}

#[tokio::test]
async fn test_instruments_compose_in_order() {
    let a = value(1i32);
    let target = a.id();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let scope = Scope::new();

    for (name, factor) in [("double", 2), ("add_three", 3)] {
        let log = seen.clone();
        scope.set_instrument(
            HookInstrument::new(name)
                .filter(move |ctx| ctx.executor_info().map(|i| i.id) == Some(target))
                .on_result(move |_, slot| {
                    log.lock().push(name);
                    let current = *slot?.downcast::<i32>().ok()?;
                    let next = if factor == 2 { current * 2 } else { current + 3 };
                    Some(Arc::new(next) as scopeflow::AnyValue)
                })
                .into_arc(),
        );
    }

    assert_eq!(*scope.resolve(&a).await.unwrap(), 5);
    assert_eq!(*seen.lock(), vec!["double", "add_three"]);
}

#[tokio::test]
async fn test_global_instrument_runs_before_scope() {
    let a = value(1i32);
    let target = a.id();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    scopeflow::set_instrument(
        HookInstrument::new("global")
            .filter(move |ctx| ctx.executor_info().map(|i| i.id) == Some(target))
            .on_result(move |_, slot| {
                log.lock().push("global");
                slot
            })
            .into_arc(),
    );
    let scope = Scope::new();
    let log = seen.clone();
    scope.set_instrument(
        HookInstrument::new("local")
            .on_result(move |_, slot| {
                log.lock().push("local");
                slot
            })
            .into_arc(),
    );

    scope.resolve(&a).await.unwrap();
    assert_eq!(*seen.lock(), vec!["global", "local"]);
}

#[tokio::test]
async fn test_wrap_services() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let services = Services::new()
        .function("ping", |_| async { Ok(serde_json::json!("pong")) })
        .group(
            "math",
            Services::new().function("double", |args| async move {
                let n = args.as_i64().unwrap_or_default();
                Ok(serde_json::json!(n * 2))
            }),
        );

    let log = calls.clone();
    let scope = Scope::new();
    scope.set_instrument(
        HookInstrument::new("audit")
            .filter(|ctx| ctx.is_service())
            .on_result(move |ctx, slot| {
                log.lock().push(ctx.name());
                slot
            })
            .into_arc(),
    );

    let wrapped = scope.wrap_services(&services);
    assert_eq!(wrapped.call("ping", serde_json::Value::Null).await.unwrap(), "pong");
    assert_eq!(
        wrapped.call("math.double", serde_json::json!(21)).await.unwrap(),
        serde_json::json!(42)
    );
    assert_eq!(*calls.lock(), vec!["ping".to_string(), "math.double".to_string()]);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config = ScopeConfig {
        service_depth: 0,
        ..ScopeConfig::default()
    };
    assert!(matches!(
        Scope::with_config(config, Vec::new()),
        Err(ScopeError::Configuration { .. })
    ));
}

#[test]
fn test_dependency_graph_order() {
    let a = value(1i32);
    let b = map(&a, |x| x + 1);
    let graph = DependencyGraph::from_roots(&[b.clone()]);
    let order: Vec<ExecutorId> = graph
        .topological_order()
        .unwrap()
        .into_iter()
        .map(|info| info.id)
        .collect();
    assert_eq!(order, vec![a.id(), b.id()]);
}

#[tokio::test]
async fn test_traced_scope_resolves() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();

    let config = ScopeConfig::default().with_label("traced").with_tracing();
    let scope = Scope::with_config(config, Vec::new()).unwrap();
    let a = ExecutorBuilder::new()
        .label("two")
        .provider(|| Ok(2i32))
        .build()
        .unwrap();
    let b = map(&a, |x| x * 3);

    assert_eq!(scope.label(), "traced");
    assert_eq!(*scope.resolve(&b).await.unwrap(), 6);
    scope.dispose().await;
}
