// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Sandboxes - isolated module instantiation contexts.
//!
//! A sandbox memoizes instantiated modules by canonical id: a factory runs
//! at most once per (sandbox, canonical id), however many concurrent or
//! re-entrant requires race for it. Sandboxes sharing a loader share its
//! package caches but never share instantiated modules, so resetting one
//! sandbox re-runs an application from scratch without touching another.
//!
//! Concurrency discipline is scoped per canonical id. The first requester
//! becomes the instantiator; everyone else suspends on that id's slot
//! (condvar in blocking mode, `Notify` in async mode) and receives the
//! same exports `Arc`. A requester that observes its own require chain
//! mid-instantiation has found a cycle and fails `CircularModuleLoad`.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{LoadError, Result};
use crate::factory::{Exports, Factory};
use crate::id::{CanonicalId, ModuleRef};
use crate::loader::Loader;
use crate::package::Package;
use crate::version::VersionSpec;

/// A resolved module: owning package, canonical identity, and resource
/// resolution. Does not force instantiation of the exports.
#[derive(Debug, Clone)]
pub struct Module {
    canonical: CanonicalId,
    package: Arc<Package>,
}

impl Module {
    /// Canonical identity.
    pub fn canonical(&self) -> &CanonicalId {
        &self.canonical
    }

    /// Module id within the owning package.
    pub fn id(&self) -> &str {
        self.canonical.module()
    }

    /// Owning package.
    pub fn package(&self) -> &Arc<Package> {
        &self.package
    }

    /// Resolve a resource name relative to the owning package into a
    /// stable, versioned identifier.
    pub fn resource(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.canonical.package(),
            self.canonical.version(),
            name
        )
    }
}

/// Per-canonical-id instantiation state. Absence from the slot map is the
/// Unresolved state.
enum SlotState {
    Instantiating,
    Ready(Exports),
    Failed(String),
}

struct Slot {
    state: Mutex<SlotState>,
    /// Wakes blocking waiters.
    done: Condvar,
    /// Wakes async waiters.
    notify: Notify,
    /// While this slot's instantiator is itself suspended on another slot,
    /// the id it waits for. Edges in the wait-for graph; following them
    /// finds deadlocks between concurrent require chains.
    waits_on: Mutex<Option<CanonicalId>>,
}

impl Slot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Instantiating),
            done: Condvar::new(),
            notify: Notify::new(),
            waits_on: Mutex::new(None),
        })
    }
}

enum Claim {
    /// This request created the slot and must instantiate.
    Owner(Arc<Slot>),
    Ready(Exports),
    Failed(String),
    /// Another request is instantiating; suspend on the slot.
    Wait(Arc<Slot>),
}

/// An isolated module instantiation context.
pub struct Sandbox {
    loader: Arc<Loader>,
    slots: DashMap<CanonicalId, Arc<Slot>>,
}

impl Sandbox {
    /// Create a sandbox delegating resolution to `loader`.
    pub fn new(loader: Arc<Loader>) -> Arc<Self> {
        Arc::new(Self {
            loader,
            slots: DashMap::new(),
        })
    }

    /// The loader this sandbox resolves through.
    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    /// Require a module by request string (`"module"` or
    /// `"package:module"`), instantiating it on first use.
    pub async fn require(self: &Arc<Self>, spec: &str) -> Result<Exports> {
        let mref = ModuleRef::parse(spec)?;
        self.require_with(&mref, None, None).await
    }

    /// Require with explicit package and version hints.
    pub async fn require_with(
        self: &Arc<Self>,
        mref: &ModuleRef,
        package_hint: Option<&str>,
        version_hint: Option<&VersionSpec>,
    ) -> Result<Exports> {
        let id = self
            .loader
            .canonical(mref, package_hint, version_hint, None)
            .await?;
        self.instantiate_async(id, Vec::new()).await
    }

    /// Blocking form of [`Sandbox::require`]. Fails `WouldBlock` when
    /// resolution would have to consult an async-only source.
    pub fn require_blocking(self: &Arc<Self>, spec: &str) -> Result<Exports> {
        let mref = ModuleRef::parse(spec)?;
        self.require_with_blocking(&mref, None, None)
    }

    /// Blocking form of [`Sandbox::require_with`].
    pub fn require_with_blocking(
        self: &Arc<Self>,
        mref: &ModuleRef,
        package_hint: Option<&str>,
        version_hint: Option<&VersionSpec>,
    ) -> Result<Exports> {
        let id = self
            .loader
            .canonical_blocking(mref, package_hint, version_hint, None)?;
        self.instantiate_blocking(id, &[])
    }

    /// Resolve to a [`Module`] wrapper without instantiating exports.
    pub async fn module(
        &self,
        mref: &ModuleRef,
        package_hint: Option<&str>,
        version_hint: Option<&VersionSpec>,
    ) -> Result<Module> {
        let id = self
            .loader
            .canonical(mref, package_hint, version_hint, None)
            .await?;
        let package = self
            .loader
            .package_for(id.package(), &VersionSpec::Exact(id.version().clone()))
            .await?;
        Ok(Module {
            canonical: id,
            package,
        })
    }

    /// Blocking form of [`Sandbox::module`].
    pub fn module_blocking(
        &self,
        mref: &ModuleRef,
        package_hint: Option<&str>,
        version_hint: Option<&VersionSpec>,
    ) -> Result<Module> {
        let id = self
            .loader
            .canonical_blocking(mref, package_hint, version_hint, None)?;
        let package = self
            .loader
            .package_for_blocking(id.package(), &VersionSpec::Exact(id.version().clone()))?;
        Ok(Module {
            canonical: id,
            package,
        })
    }

    /// Whether the module, its package, and all declared dependencies
    /// (transitively) are resolvable right now without blocking.
    pub fn ready(
        &self,
        mref: &ModuleRef,
        package_hint: Option<&str>,
        version_hint: Option<&VersionSpec>,
    ) -> bool {
        let Ok(id) = self
            .loader
            .canonical_blocking(mref, package_hint, version_hint, None)
        else {
            return false;
        };
        let mut visited = HashSet::new();
        self.check_ready(&id, &mut visited)
    }

    fn check_ready(&self, id: &CanonicalId, visited: &mut HashSet<CanonicalId>) -> bool {
        if !visited.insert(id.clone()) {
            // Dependency cycles are the factory's problem at require time;
            // for readiness a revisit is settled.
            return true;
        }
        if let Some(slot) = self.slots.get(id) {
            if matches!(&*slot.state.lock(), SlotState::Ready(_)) {
                return true;
            }
        }
        let Ok(package) = self
            .loader
            .package_for_blocking(id.package(), &VersionSpec::Exact(id.version().clone()))
        else {
            return false;
        };
        let Ok(factory) = package.load_blocking(id.module()) else {
            return false;
        };
        for dep in factory.dependencies() {
            let Ok(dep_id) = self.loader.canonical_blocking(dep, None, None, Some(id)) else {
                return false;
            };
            if !self.check_ready(&dep_id, visited) {
                return false;
            }
        }
        true
    }

    /// Drop every memoized module. Subsequent requires re-instantiate from
    /// scratch; the loader's package caches are untouched.
    pub fn clear(&self) {
        debug!(modules = self.slots.len(), "clearing sandbox");
        self.slots.clear();
    }

    /// Number of instantiated (or currently instantiating) modules.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing has been instantiated yet.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn claim(&self, id: &CanonicalId, chain: &[CanonicalId]) -> Result<Claim> {
        let slot = match self.slots.entry(id.clone()) {
            Entry::Vacant(entry) => {
                let slot = Slot::new();
                entry.insert(slot.clone());
                return Ok(Claim::Owner(slot));
            }
            Entry::Occupied(entry) => entry.get().clone(),
        };
        let observed = {
            let state = slot.state.lock();
            match &*state {
                SlotState::Ready(exports) => Some(Claim::Ready(exports.clone())),
                SlotState::Failed(message) => Some(Claim::Failed(message.clone())),
                SlotState::Instantiating => None,
            }
        };
        match observed {
            Some(claim) => Ok(claim),
            // Instantiating on our own chain is the cycle signal; on
            // someone else's chain it just means wait.
            None if chain.contains(id) => {
                Err(LoadError::CircularModuleLoad(cycle_path(chain, id)))
            }
            None => Ok(Claim::Wait(slot)),
        }
    }

    fn instantiate_blocking(
        self: &Arc<Self>,
        id: CanonicalId,
        chain: &[CanonicalId],
    ) -> Result<Exports> {
        match self.claim(&id, chain)? {
            Claim::Ready(exports) => Ok(exports),
            Claim::Failed(message) => Err(previous_failure(&id, message)),
            Claim::Wait(slot) => {
                self.begin_wait(chain, &id)?;
                let result = wait_blocking(&id, &slot);
                self.end_wait(chain);
                result
            }
            Claim::Owner(slot) => {
                // A panicking factory must still release its waiters.
                let result =
                    std::panic::catch_unwind(AssertUnwindSafe(|| {
                        self.run_factory_blocking(&id, chain)
                    }))
                    .unwrap_or_else(|_| {
                        Err(LoadError::Factory {
                            id: id.to_string(),
                            message: "factory panicked".to_string(),
                        })
                    });
                finish(&slot, result)
            }
        }
    }

    fn instantiate_async(
        self: &Arc<Self>,
        id: CanonicalId,
        chain: Vec<CanonicalId>,
    ) -> BoxFuture<'_, Result<Exports>> {
        Box::pin(async move {
        match self.claim(&id, &chain)? {
            Claim::Ready(exports) => Ok(exports),
            Claim::Failed(message) => Err(previous_failure(&id, message)),
            Claim::Wait(slot) => {
                self.begin_wait(&chain, &id)?;
                let result = wait_async(&id, slot).await;
                self.end_wait(&chain);
                result
            }
            Claim::Owner(slot) => {
                // Instantiate on a detached task: abandoning this future
                // must not cancel the instantiation other waiters share.
                let sandbox = self.clone();
                let task_id = id.clone();
                let handle = tokio::spawn(async move {
                    use futures::FutureExt;
                    let result = AssertUnwindSafe(
                        sandbox.run_factory_async(&task_id, &chain),
                    )
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(LoadError::Factory {
                            id: task_id.to_string(),
                            message: "factory panicked".to_string(),
                        })
                    });
                    finish(&slot, result)
                });
                match handle.await {
                    Ok(result) => result,
                    Err(err) => Err(LoadError::Factory {
                        id: id.to_string(),
                        message: format!("instantiation task failed: {}", err),
                    }),
                }
            }
        }
        })
    }

    /// Record that the chain is about to suspend on `target`, then look
    /// for a wait-for cycle. Two chains instantiating modules that require
    /// each other would otherwise block on each other's slots forever.
    ///
    /// The edge is recorded on every id of the chain: each ancestor is
    /// transitively blocked on the same innermost target, and a walk from
    /// another chain may arrive at any of them.
    fn begin_wait(&self, chain: &[CanonicalId], target: &CanonicalId) -> Result<()> {
        if chain.is_empty() {
            // A top-level require holds no slot, so it cannot close a cycle.
            return Ok(());
        }
        for link in chain {
            if let Some(slot) = self.slots.get(link) {
                *slot.waits_on.lock() = Some(target.clone());
            }
        }
        if let Err(err) = self.check_wait_cycle(chain, target) {
            self.end_wait(chain);
            return Err(err);
        }
        Ok(())
    }

    fn end_wait(&self, chain: &[CanonicalId]) {
        for link in chain {
            if let Some(slot) = self.slots.get(link) {
                *slot.waits_on.lock() = None;
            }
        }
    }

    /// Follow wait-for edges from `target`. Reaching an id on our own
    /// chain means the instantiator we would wait for is (transitively)
    /// waiting for us. Every waiter records its edge before walking, so in
    /// a genuine deadlock the last chain to suspend sees the full loop.
    fn check_wait_cycle(&self, chain: &[CanonicalId], target: &CanonicalId) -> Result<()> {
        let mut walked = vec![target.clone()];
        let mut cursor = target.clone();
        // The walk is bounded by the number of live slots.
        for _ in 0..=self.slots.len() {
            let next = match self.slots.get(&cursor) {
                Some(slot) => slot.waits_on.lock().clone(),
                None => return Ok(()),
            };
            let Some(next) = next else {
                return Ok(());
            };
            if let Some(start) = chain.iter().position(|c| c == &next) {
                let mut path: Vec<String> =
                    chain[start..].iter().map(|c| c.to_string()).collect();
                path.extend(walked.iter().map(|c| c.to_string()));
                path.push(next.to_string());
                return Err(LoadError::CircularModuleLoad(path.join(" -> ")));
            }
            walked.push(next.clone());
            cursor = next;
        }
        Ok(())
    }

    fn run_factory_blocking(
        self: &Arc<Self>,
        id: &CanonicalId,
        chain: &[CanonicalId],
    ) -> Result<Exports> {
        let package = self
            .loader
            .package_for_blocking(id.package(), &VersionSpec::Exact(id.version().clone()))?;
        let factory = package.load_blocking(id.module())?;
        self.invoke(id, package, factory, chain)
    }

    async fn run_factory_async(
        self: &Arc<Self>,
        id: &CanonicalId,
        chain: &[CanonicalId],
    ) -> Result<Exports> {
        let package = self
            .loader
            .package_for(id.package(), &VersionSpec::Exact(id.version().clone()))
            .await?;
        let factory = package.load(id.module()).await?;
        self.warm_dependencies(id, &factory, chain).await?;
        self.invoke(id, package, factory, chain)
    }

    /// Instantiate the factory's declared dependencies through the async
    /// pipeline before the body runs. The body's synchronous requires then
    /// answer from warmed loader caches and memoized slots, even when the
    /// dependency packages live behind async-only sources.
    async fn warm_dependencies(
        self: &Arc<Self>,
        id: &CanonicalId,
        factory: &Factory,
        chain: &[CanonicalId],
    ) -> Result<()> {
        if factory.dependencies().is_empty() {
            return Ok(());
        }
        let mut dep_chain = chain.to_vec();
        dep_chain.push(id.clone());
        for dep in factory.dependencies() {
            let dep_id = self.loader.canonical(dep, None, None, Some(id)).await?;
            // Boxed so the instantiate -> factory -> dependency recursion
            // has a finite future type.
            let warm: BoxFuture<'_, Result<Exports>> =
                Box::pin(self.instantiate_async(dep_id, dep_chain.clone()));
            warm.await?;
        }
        Ok(())
    }

    /// Run the factory body with a scope carrying the extended require
    /// chain, then validate declared exports.
    fn invoke(
        self: &Arc<Self>,
        id: &CanonicalId,
        package: Arc<Package>,
        factory: Arc<Factory>,
        chain: &[CanonicalId],
    ) -> Result<Exports> {
        let mut chain = chain.to_vec();
        chain.push(id.clone());
        let scope = ModuleScope {
            sandbox: self.clone(),
            module: Module {
                canonical: id.clone(),
                package,
            },
            chain,
        };
        debug!(module = %id, "instantiating");
        let value = factory.invoke(&scope)?;
        self.validate_exports(id, &factory, &value)?;
        Ok(Arc::new(value))
    }

    /// Declared export names are a pragma: warn on omissions, fail only in
    /// strict mode.
    fn validate_exports(&self, id: &CanonicalId, factory: &Factory, value: &Value) -> Result<()> {
        if factory.exports().is_empty() {
            return Ok(());
        }
        let missing: Vec<&String> = match value {
            Value::Object(map) => factory
                .exports()
                .iter()
                .filter(|name| !map.contains_key(*name))
                .collect(),
            _ => factory.exports().iter().collect(),
        };
        if missing.is_empty() {
            return Ok(());
        }
        warn!(module = %id, ?missing, "module omitted declared exports");
        if self.loader.config().strict_exports {
            return Err(LoadError::Factory {
                id: id.to_string(),
                message: format!(
                    "missing declared exports: {}",
                    missing
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("modules", &self.slots.len())
            .finish_non_exhaustive()
    }
}

/// The scope a factory body runs in: its resolved module plus a require
/// bound to the owning sandbox and the active require chain.
pub struct ModuleScope {
    sandbox: Arc<Sandbox>,
    module: Module,
    /// Canonical ids currently instantiating on this chain, innermost last.
    chain: Vec<CanonicalId>,
}

impl ModuleScope {
    /// Require another module; bare names resolve inside the owning
    /// package. Runs in blocking mode: modules named in the factory's
    /// declared dependencies are instantiated asynchronously before the
    /// body starts, so this answers from warmed caches even over
    /// async-only sources. Undeclared requires additionally need the
    /// loader to already hold the package or a blocking-capable source.
    pub fn require(&self, spec: &str) -> Result<Exports> {
        let mref = ModuleRef::parse(spec)?;
        self.require_with(&mref, None, None)
    }

    /// Require with explicit hints.
    pub fn require_with(
        &self,
        mref: &ModuleRef,
        package_hint: Option<&str>,
        version_hint: Option<&VersionSpec>,
    ) -> Result<Exports> {
        let id = self.sandbox.loader.canonical_blocking(
            mref,
            package_hint,
            version_hint,
            Some(self.module.canonical()),
        )?;
        self.sandbox.instantiate_blocking(id, &self.chain)
    }

    /// The module being instantiated.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Canonical id of the module being instantiated.
    pub fn canonical(&self) -> &CanonicalId {
        self.module.canonical()
    }

    /// Resolve a package-relative resource name.
    pub fn resource(&self, name: &str) -> String {
        self.module.resource(name)
    }
}

fn previous_failure(id: &CanonicalId, message: String) -> LoadError {
    LoadError::Factory {
        id: id.to_string(),
        message,
    }
}

fn finish(slot: &Arc<Slot>, result: Result<Exports>) -> Result<Exports> {
    {
        let mut state = slot.state.lock();
        *state = match &result {
            Ok(exports) => SlotState::Ready(exports.clone()),
            Err(err) => SlotState::Failed(err.to_string()),
        };
    }
    slot.done.notify_all();
    slot.notify.notify_waiters();
    result
}

fn wait_blocking(id: &CanonicalId, slot: &Arc<Slot>) -> Result<Exports> {
    let mut state = slot.state.lock();
    loop {
        match &*state {
            SlotState::Ready(exports) => return Ok(exports.clone()),
            SlotState::Failed(message) => return Err(previous_failure(id, message.clone())),
            SlotState::Instantiating => slot.done.wait(&mut state),
        }
    }
}

async fn wait_async(id: &CanonicalId, slot: Arc<Slot>) -> Result<Exports> {
    loop {
        let notified = slot.notify.notified();
        {
            let state = slot.state.lock();
            match &*state {
                SlotState::Ready(exports) => return Ok(exports.clone()),
                SlotState::Failed(message) => {
                    return Err(previous_failure(id, message.clone()));
                }
                SlotState::Instantiating => {}
            }
        }
        notified.await;
    }
}

fn cycle_path(chain: &[CanonicalId], id: &CanonicalId) -> String {
    let start = chain.iter().position(|c| c == id).unwrap_or(0);
    let mut path: Vec<String> = chain[start..].iter().map(|c| c.to_string()).collect();
    path.push(id.to_string());
    path.join(" -> ")
}
