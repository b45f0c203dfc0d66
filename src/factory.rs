// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module factories - uninvoked module definitions.
//!
//! A factory is the loaded-but-not-yet-run form of a module: its body, the
//! export names it promises, the modules it intends to require, and the
//! identity of the package that owns it. Factories are immutable once
//! produced; sandboxes invoke them at most once per canonical id.

use semver::Version;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::id::{CanonicalId, ModuleRef};
use crate::sandbox::ModuleScope;

/// Instantiated module exports. `Arc` identity is the memoization witness:
/// two requires for the same canonical id in one sandbox hand back the same
/// allocation.
pub type Exports = Arc<Value>;

/// A module body. Invoked with a scope bound to the owning sandbox and the
/// resolved module; must return the exports value.
pub type FactoryFn = Arc<dyn Fn(&ModuleScope) -> Result<Value> + Send + Sync>;

/// The raw parts of a module definition, as handed over by a provider or an
/// inline `define`. Cheap to clone; the body is shared.
#[derive(Clone)]
pub struct FactoryDef {
    /// Export names the module promises to produce (validation pragma).
    pub exports: Vec<String>,
    /// Modules this body will require while running.
    pub dependencies: Vec<ModuleRef>,
    /// The module body.
    pub body: FactoryFn,
}

impl FactoryDef {
    /// Create a definition from a body closure.
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&ModuleScope) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            exports: Vec::new(),
            dependencies: Vec::new(),
            body: Arc::new(body),
        }
    }

    /// Declare expected export names.
    pub fn with_exports<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exports = names.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the modules the body will require.
    pub fn with_dependencies<I>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = ModuleRef>,
    {
        self.dependencies = deps.into_iter().collect();
        self
    }
}

impl fmt::Debug for FactoryDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryDef")
            .field("exports", &self.exports)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// An uninvoked module definition tagged with its owning package identity.
pub struct Factory {
    canonical: CanonicalId,
    exports: Vec<String>,
    dependencies: Vec<ModuleRef>,
    body: FactoryFn,
}

impl Factory {
    pub(crate) fn new(
        package_id: &str,
        package_version: Version,
        module_id: &str,
        def: FactoryDef,
    ) -> Result<Self> {
        Ok(Self {
            canonical: CanonicalId::new(package_id, package_version, module_id)?,
            exports: def.exports,
            dependencies: def.dependencies,
            body: def.body,
        })
    }

    /// Owning package id.
    pub fn package_id(&self) -> &str {
        self.canonical.package()
    }

    /// Owning package version.
    pub fn package_version(&self) -> &Version {
        self.canonical.version()
    }

    /// Module id within the owning package.
    pub fn module_id(&self) -> &str {
        self.canonical.module()
    }

    /// The canonical id this factory instantiates under.
    pub fn canonical(&self) -> &CanonicalId {
        &self.canonical
    }

    /// Declared export names.
    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    /// Declared module dependencies.
    pub fn dependencies(&self) -> &[ModuleRef] {
        &self.dependencies
    }

    /// Run the body. Callers own memoization and re-entrancy discipline.
    pub fn invoke(&self, scope: &ModuleScope) -> Result<Value> {
        (self.body)(scope)
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("canonical", &self.canonical)
            .field("exports", &self.exports)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}
