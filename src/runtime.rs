// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The host-facing runtime context.
//!
//! Bundles a loader, a default sandbox, and an inline registry into one
//! explicit context object. Embedders construct it, inject it where entry
//! points need it, and drop it to tear everything down; there is no
//! process-wide singleton to reach for ambiently.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{LoadError, Result};
use crate::factory::{Exports, FactoryDef};
use crate::id::{CanonicalId, ModuleRef};
use crate::loader::{Loader, LoaderConfig};
use crate::package::{Manifest, Package};
use crate::sandbox::Sandbox;
use crate::source::{MemorySource, Source};
use crate::version::VersionSpec;
use semver::Version;

/// Package id used for modules defined inline without naming a package.
pub const DEFAULT_PACKAGE: &str = "app";

/// An embeddable loading runtime: loader + default sandbox + inline
/// registry + host resource registrations.
pub struct Runtime {
    loader: Arc<Loader>,
    sandbox: Arc<Sandbox>,
    registry: Arc<MemorySource>,
    main: Mutex<Option<CanonicalId>>,
    scripts: Mutex<Vec<String>>,
    stylesheets: Mutex<Vec<String>>,
}

impl Runtime {
    /// Create a runtime with only the inline registry.
    pub fn new() -> Self {
        Self::with_sources(LoaderConfig::default(), Vec::new())
    }

    /// Create a runtime with extra sources behind the inline registry.
    /// Inline definitions always win: the registry sits at the highest
    /// priority.
    pub fn with_sources(config: LoaderConfig, extra: Vec<Arc<dyn Source>>) -> Self {
        let registry = Arc::new(MemorySource::new());
        let mut sources: Vec<Arc<dyn Source>> = vec![registry.clone()];
        sources.extend(extra);
        let loader = Arc::new(Loader::with_config(sources, config));
        let sandbox = Sandbox::new(loader.clone());
        Self {
            loader,
            sandbox,
            registry,
            main: Mutex::new(None),
            scripts: Mutex::new(Vec::new()),
            stylesheets: Mutex::new(Vec::new()),
        }
    }

    /// The runtime's loader.
    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    /// The default sandbox.
    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    /// Require a module in the default sandbox.
    pub async fn require(&self, spec: &str) -> Result<Exports> {
        self.sandbox.require(spec).await
    }

    /// Blocking form of [`Runtime::require`].
    pub fn require_blocking(&self, spec: &str) -> Result<Exports> {
        self.sandbox.require_blocking(spec)
    }

    /// Register a package inline.
    pub fn define_package(&self, manifest: Manifest) -> Arc<Package> {
        self.registry.define_package(manifest)
    }

    /// Register a module factory inline, with no source round-trip.
    ///
    /// A qualified spec targets the named (already defined) package; a
    /// bare spec lands in the default application package, which is
    /// created on first use.
    pub fn define(&self, spec: &str, def: FactoryDef) -> Result<()> {
        let mref = ModuleRef::parse(spec)?;
        let package_id = match mref.package() {
            Some(package) => package.to_string(),
            None => {
                self.ensure_default_package();
                DEFAULT_PACKAGE.to_string()
            }
        };
        debug!(package = %package_id, module = mref.module(), "inline module definition");
        self.registry
            .define_module(&package_id, &VersionSpec::Any, mref.module(), def)
    }

    fn ensure_default_package(&self) {
        let exists = self
            .registry
            .package_for_blocking(DEFAULT_PACKAGE, &VersionSpec::Any)
            .ok()
            .flatten()
            .is_some();
        if !exists {
            // Manifest::new only fails on malformed ids; DEFAULT_PACKAGE
            // is well-formed by construction.
            if let Ok(manifest) = Manifest::new(DEFAULT_PACKAGE, Version::new(1, 0, 0)) {
                self.registry.define_package(manifest);
            }
        }
    }

    /// Mark and load the application entry module. A bare spec resolves in
    /// `package_hint` when given (a qualified spec overrides the hint).
    /// With `method`, the named export is selected and returned; without
    /// it, the module's full exports come back.
    pub async fn main(
        &self,
        spec: &str,
        package_hint: Option<&str>,
        method: Option<&str>,
    ) -> Result<Exports> {
        let mref = ModuleRef::parse(spec)?;
        let id = self.loader.canonical(&mref, package_hint, None, None).await?;
        info!(module = %id, "entry module");
        *self.main.lock() = Some(id.clone());

        let exports = self.sandbox.require_with(&mref, package_hint, None).await?;
        match method {
            None => Ok(exports),
            Some(name) => match exports.get(name) {
                Some(value) => Ok(Arc::new(value.clone())),
                None => Err(LoadError::Factory {
                    id: id.to_string(),
                    message: format!("entry export {} is not defined", name),
                }),
            },
        }
    }

    /// The marked entry module, if `main` has run.
    pub fn main_module(&self) -> Option<CanonicalId> {
        self.main.lock().clone()
    }

    /// Record a host script registration (pass-through; the host document
    /// owns injection).
    pub fn script(&self, id: &str) {
        self.scripts.lock().push(id.to_string());
    }

    /// Record a host stylesheet registration (pass-through).
    pub fn stylesheet(&self, id: &str) {
        self.stylesheets.lock().push(id.to_string());
    }

    /// Registered script ids, in registration order.
    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().clone()
    }

    /// Registered stylesheet ids, in registration order.
    pub fn stylesheets(&self) -> Vec<String> {
        self.stylesheets.lock().clone()
    }

    /// Drop every module instantiated in the default sandbox, re-running
    /// the application from a clean state on the next require. Loader
    /// caches and inline definitions survive.
    pub fn reset(&self) {
        self.sandbox.clear();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("main", &*self.main.lock())
            .finish_non_exhaustive()
    }
}
