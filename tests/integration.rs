// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! End-to-end loading pipeline tests: multi-source resolution, sandbox
//! memoization under concurrency, and waiter survival across caller
//! cancellation.

use async_trait::async_trait;
use lodestar::{
    FactoryDef, LoadError, Loader, Manifest, MemorySource, ModuleRef, Package, Result, Sandbox,
    Source, VersionSpec,
};
use semver::Version;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_test::assert_ok;

fn spec(s: &str) -> VersionSpec {
    VersionSpec::parse(s).unwrap()
}

/// Route crate tracing through the test harness; repeated calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wraps a memory registry but refuses the blocking forms, standing in
/// for a network-backed source.
struct AsyncOnlySource {
    inner: MemorySource,
}

#[async_trait]
impl Source for AsyncOnlySource {
    async fn package_for(
        &self,
        package_id: &str,
        want: &VersionSpec,
    ) -> Result<Option<Arc<Package>>> {
        // Simulated registry round-trip.
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.inner.package_for(package_id, want).await
    }

    async fn package_list(&self) -> Result<Vec<Arc<Package>>> {
        self.inner.package_list().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requires_instantiate_once() {
    init_tracing();
    let source = MemorySource::new();
    source.define_package(Manifest::new("app", Version::new(1, 0, 0)).unwrap());
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    source
        .define_module(
            "app",
            &VersionSpec::Any,
            "shared",
            FactoryDef::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                // Make the race window wide enough to matter.
                std::thread::sleep(Duration::from_millis(50));
                Ok(json!({"ready": true}))
            }),
        )
        .unwrap();

    let sandbox = Sandbox::new(Arc::new(Loader::new(vec![Arc::new(source)])));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let sandbox = sandbox.clone();
        handles.push(tokio::spawn(
            async move { sandbox.require("app:shared").await },
        ));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    for exports in &results[1..] {
        assert!(Arc::ptr_eq(&results[0], exports));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_caller_does_not_cancel_waiters() {
    let source = MemorySource::new();
    source.define_package(Manifest::new("app", Version::new(1, 0, 0)).unwrap());
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    source
        .define_module(
            "app",
            &VersionSpec::Any,
            "slow",
            FactoryDef::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(80));
                Ok(json!({"done": true}))
            }),
        )
        .unwrap();

    let sandbox = Sandbox::new(Arc::new(Loader::new(vec![Arc::new(source)])));

    // First caller claims instantiation, then gets abandoned mid-flight.
    let first = {
        let sandbox = sandbox.clone();
        tokio::spawn(async move { sandbox.require("app:slow").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    first.abort();

    // A later caller still receives the instantiation the first one
    // started; the factory never runs twice.
    let exports = sandbox.require("app:slow").await.unwrap();
    assert_eq!(*exports, json!({"done": true}));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn versioned_modules_across_sources() {
    // Bundled source carries the stable line, the "network" source a
    // newer major. First compatible match wins per priority.
    let bundled = MemorySource::new();
    bundled.define_package(Manifest::new("wire", Version::new(1, 3, 1)).unwrap());
    bundled
        .define_module(
            "wire",
            &VersionSpec::Any,
            "codec",
            FactoryDef::new(|scope| {
                Ok(json!({"from": scope.canonical().version().to_string()}))
            }),
        )
        .unwrap();

    let remote = MemorySource::new();
    remote.define_package(Manifest::new("wire", Version::new(2, 0, 0)).unwrap());
    remote
        .define_module(
            "wire",
            &VersionSpec::Any,
            "codec",
            FactoryDef::new(|scope| {
                Ok(json!({"from": scope.canonical().version().to_string()}))
            }),
        )
        .unwrap();

    let loader = Arc::new(Loader::new(vec![
        Arc::new(bundled),
        Arc::new(AsyncOnlySource { inner: remote }),
    ]));
    let sandbox = Sandbox::new(loader.clone());

    let stable = sandbox
        .require_with(&ModuleRef::parse("wire:codec").unwrap(), None, Some(&spec("^1.2")))
        .await
        .unwrap();
    assert_eq!(*stable, json!({"from": "1.3.1"}));

    // The exact 2.0.0 only exists behind the async-only source.
    let next = sandbox
        .require_with(&ModuleRef::parse("wire:codec").unwrap(), None, Some(&spec("2.0.0")))
        .await
        .unwrap();
    assert_eq!(*next, json!({"from": "2.0.0"}));

    // Distinct canonical ids, distinct instantiations.
    assert!(!Arc::ptr_eq(&stable, &next));
    assert_eq!(sandbox.len(), 2);
}

#[tokio::test]
async fn would_block_leaves_no_poisoned_state() {
    let remote = MemorySource::new();
    remote.define_package(Manifest::new("wire", Version::new(1, 0, 0)).unwrap());
    remote
        .define_module(
            "wire",
            &VersionSpec::Any,
            "codec",
            FactoryDef::new(|_| Ok(json!({"ok": true}))),
        )
        .unwrap();

    let loader = Arc::new(Loader::new(vec![Arc::new(AsyncOnlySource {
        inner: remote,
    })]));
    let sandbox = Sandbox::new(loader);

    assert!(matches!(
        sandbox.require_blocking("wire:codec"),
        Err(LoadError::WouldBlock(_))
    ));
    assert!(sandbox.is_empty());

    // The async form succeeds, and afterwards the blocking form answers
    // from the loader's caches.
    let exports = tokio_test::assert_ok!(sandbox.require("wire:codec").await);
    let cached = tokio_test::assert_ok!(sandbox.require_blocking("wire:codec"));
    assert!(Arc::ptr_eq(&exports, &cached));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn declared_dependencies_resolve_over_async_only_source() {
    init_tracing();
    // Everything lives behind the async-only source, including the
    // dependency the entry factory requires while running.
    let remote = MemorySource::new();
    let app = Manifest::new("app", Version::new(0, 1, 0))
        .unwrap()
        .with_dependency("wire", spec("^1.0"))
        .unwrap();
    remote.define_package(app);
    remote.define_package(Manifest::new("wire", Version::new(1, 2, 0)).unwrap());
    remote
        .define_module(
            "wire",
            &VersionSpec::Any,
            "codec",
            FactoryDef::new(|_| Ok(json!({"format": "cbor"}))),
        )
        .unwrap();
    remote
        .define_module(
            "app",
            &VersionSpec::Any,
            "main",
            FactoryDef::new(|scope| {
                let codec = scope.require("wire:codec")?;
                Ok(json!({"using": codec["format"]}))
            })
            .with_dependencies([ModuleRef::parse("wire:codec").unwrap()]),
        )
        .unwrap();

    let loader = Arc::new(Loader::new(vec![Arc::new(AsyncOnlySource {
        inner: remote,
    })]));
    let sandbox = Sandbox::new(loader);

    // Declared dependencies are instantiated through the async pipeline
    // before the body runs, so its synchronous require hits warm caches
    // instead of failing WouldBlock.
    let exports = tokio_test::assert_ok!(sandbox.require("app:main").await);
    assert_eq!(*exports, json!({"using": "cbor"}));
    assert_eq!(sandbox.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mutual_requires_fail_instead_of_deadlocking() {
    init_tracing();
    let source = MemorySource::new();
    source.define_package(Manifest::new("app", Version::new(1, 0, 0)).unwrap());
    source
        .define_module(
            "app",
            &VersionSpec::Any,
            "x",
            FactoryDef::new(|scope| {
                // Give the other chain time to claim its slot first.
                std::thread::sleep(Duration::from_millis(50));
                let y = scope.require("y")?;
                Ok((*y).clone())
            }),
        )
        .unwrap();
    source
        .define_module(
            "app",
            &VersionSpec::Any,
            "y",
            FactoryDef::new(|scope| {
                std::thread::sleep(Duration::from_millis(50));
                let x = scope.require("x")?;
                Ok((*x).clone())
            }),
        )
        .unwrap();
    let sandbox = Sandbox::new(Arc::new(Loader::new(vec![Arc::new(source)])));

    let first = {
        let sandbox = sandbox.clone();
        tokio::spawn(async move { sandbox.require("app:x").await })
    };
    let second = {
        let sandbox = sandbox.clone();
        tokio::spawn(async move { sandbox.require("app:y").await })
    };

    // Two chains waiting on each other's slots must surface the cycle
    // instead of hanging.
    let results = tokio::time::timeout(Duration::from_secs(10), async {
        (first.await.unwrap(), second.await.unwrap())
    })
    .await
    .expect("mutual requires deadlocked");

    let (x, y) = results;
    assert!(x.is_err());
    assert!(y.is_err());
    // Whichever chain suspended last detects the wait-for cycle; the other
    // sees the resulting failure.
    let messages = format!("{} / {}", x.unwrap_err(), y.unwrap_err());
    assert!(messages.contains("circular module load"));
}

#[tokio::test]
async fn dependency_expansion_feeds_unhinted_requires() {
    let source = MemorySource::new();
    let app = Manifest::new("app", Version::new(0, 1, 0))
        .unwrap()
        .with_dependency("wire", spec("^1.0"))
        .unwrap();
    source.define_package(app);
    for version in ["1.0.0", "1.4.2", "2.0.0"] {
        source.define_package(
            Manifest::new("wire", Version::parse(version).unwrap()).unwrap(),
        );
        source
            .define_module(
                "wire",
                &spec(version),
                "codec",
                FactoryDef::new(|scope| {
                    Ok(json!({"version": scope.canonical().version().to_string()}))
                }),
            )
            .unwrap();
    }
    source
        .define_module(
            "app",
            &VersionSpec::Any,
            "main",
            FactoryDef::new(|scope| {
                // No version hint: the app manifest's declared ^1.0 spec
                // steers this to 1.4.2, not 2.0.0.
                let codec = scope.require("wire:codec")?;
                Ok(json!({"codec": codec["version"]}))
            }),
        )
        .unwrap();

    let sandbox = Sandbox::new(Arc::new(Loader::new(vec![Arc::new(source)])));
    let exports = sandbox.require("app:main").await.unwrap();
    assert_eq!(*exports, json!({"codec": "1.4.2"}));
}
