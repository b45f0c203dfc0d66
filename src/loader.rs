// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The loader - canonical id resolution, package lookup, dependency
//! expansion and cache invalidation.
//!
//! Sources are consulted in priority order; the first compatible match
//! wins. Resolved packages are cached in read-mostly maps shared by every
//! sandbox on this loader. Every operation has an async form and a
//! blocking form; the blocking form fails `WouldBlock` the moment it would
//! have to consult a source that cannot answer synchronously.

use dashmap::DashMap;
use futures::future::BoxFuture;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{LoadError, Result};
use crate::factory::Factory;
use crate::id::{CanonicalId, ModuleRef, validate_package_id};
use crate::package::Package;
use crate::source::Source;
use crate::version::{VersionSpec, compatible};

/// Loader tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Fail instantiation when a module omits a declared export instead of
    /// only warning.
    pub strict_exports: bool,
    /// Hard ceiling on dependency expansion depth; a guard behind the
    /// cycle detector.
    pub max_expand_depth: usize,
    /// Log every source consultation.
    pub trace_sources: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            strict_exports: false,
            max_expand_depth: 256,
            trace_sources: false,
        }
    }
}

/// Resolves module requests to canonical ids and packages to factories.
pub struct Loader {
    sources: Vec<Arc<dyn Source>>,
    /// `package@version` -> resolved package.
    packages: DashMap<String, Arc<Package>>,
    /// `package@spec` request alias -> `package@version` cache key.
    aliases: DashMap<String, String>,
    config: LoaderConfig,
}

impl Loader {
    /// Create a loader over sources in priority order.
    pub fn new(sources: Vec<Arc<dyn Source>>) -> Self {
        Self::with_config(sources, LoaderConfig::default())
    }

    /// Create a loader with explicit configuration.
    pub fn with_config(sources: Vec<Arc<dyn Source>>, config: LoaderConfig) -> Self {
        Self {
            sources,
            packages: DashMap::new(),
            aliases: DashMap::new(),
            config,
        }
    }

    /// Loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Resolve a module request to its canonical id.
    ///
    /// A bare reference defaults to the requesting module's own package; a
    /// qualified reference overrides any hint. When no version hint is
    /// given, a cross-package request uses the spec the requesting package
    /// declares for the target, and a self-reference pins the requester's
    /// own version.
    pub async fn canonical(
        &self,
        mref: &ModuleRef,
        package_hint: Option<&str>,
        version_hint: Option<&VersionSpec>,
        requesting: Option<&CanonicalId>,
    ) -> Result<CanonicalId> {
        let package_id = target_package(mref, package_hint, requesting)?;
        let want = match self.implied_spec(&package_id, version_hint, requesting) {
            Implied::Known(spec) => spec,
            Implied::Declared(req) => {
                let req_pkg = self
                    .package_for(req.package(), &VersionSpec::Exact(req.version().clone()))
                    .await?;
                req_pkg
                    .required_version(&package_id)
                    .cloned()
                    .unwrap_or(VersionSpec::Any)
            }
        };
        let package = self.package_for(&package_id, &want).await?;
        CanonicalId::new(&package_id, package.version().clone(), mref.module())
    }

    /// Blocking form of [`Loader::canonical`].
    pub fn canonical_blocking(
        &self,
        mref: &ModuleRef,
        package_hint: Option<&str>,
        version_hint: Option<&VersionSpec>,
        requesting: Option<&CanonicalId>,
    ) -> Result<CanonicalId> {
        let package_id = target_package(mref, package_hint, requesting)?;
        let want = match self.implied_spec(&package_id, version_hint, requesting) {
            Implied::Known(spec) => spec,
            Implied::Declared(req) => {
                let req_pkg = self
                    .package_for_blocking(req.package(), &VersionSpec::Exact(req.version().clone()))?;
                req_pkg
                    .required_version(&package_id)
                    .cloned()
                    .unwrap_or(VersionSpec::Any)
            }
        };
        let package = self.package_for_blocking(&package_id, &want)?;
        CanonicalId::new(&package_id, package.version().clone(), mref.module())
    }

    /// Resolve the request and load the module's factory.
    pub async fn load(
        &self,
        mref: &ModuleRef,
        package_hint: Option<&str>,
        version_hint: Option<&VersionSpec>,
        requesting: Option<&CanonicalId>,
    ) -> Result<Arc<Factory>> {
        let id = self
            .canonical(mref, package_hint, version_hint, requesting)
            .await?;
        let package = self
            .package_for(id.package(), &VersionSpec::Exact(id.version().clone()))
            .await?;
        package.load(id.module()).await
    }

    /// Blocking form of [`Loader::load`].
    pub fn load_blocking(
        &self,
        mref: &ModuleRef,
        package_hint: Option<&str>,
        version_hint: Option<&VersionSpec>,
        requesting: Option<&CanonicalId>,
    ) -> Result<Arc<Factory>> {
        let id = self.canonical_blocking(mref, package_hint, version_hint, requesting)?;
        let package =
            self.package_for_blocking(id.package(), &VersionSpec::Exact(id.version().clone()))?;
        package.load_blocking(id.module())
    }

    /// Find the package matching `package_id` under `want`.
    ///
    /// Never returns a package whose version fails the spec, whatever a
    /// source claims. `NoCompatibleVersion` when some source knows the id
    /// but no version fits; `PackageNotFound` when no source knows it.
    pub async fn package_for(&self, package_id: &str, want: &VersionSpec) -> Result<Arc<Package>> {
        validate_package_id(package_id)?;
        if let Some(pkg) = self.cached(package_id, want) {
            return Ok(pkg);
        }
        for source in &self.sources {
            if self.config.trace_sources {
                debug!(package = package_id, %want, "querying source");
            }
            if let Some(pkg) = source.package_for(package_id, want).await? {
                if let Some(pkg) = self.admit(package_id, want, pkg) {
                    return Ok(pkg);
                }
            }
        }
        let mut known = false;
        for source in &self.sources {
            if source.has_package(package_id).await? {
                known = true;
                break;
            }
        }
        Err(self.miss(package_id, want, known))
    }

    /// Blocking form of [`Loader::package_for`].
    pub fn package_for_blocking(
        &self,
        package_id: &str,
        want: &VersionSpec,
    ) -> Result<Arc<Package>> {
        validate_package_id(package_id)?;
        if let Some(pkg) = self.cached(package_id, want) {
            return Ok(pkg);
        }
        for source in &self.sources {
            if !source.blocking_capable() {
                return Err(LoadError::WouldBlock(format!(
                    "resolving {} needs an async source",
                    package_id
                )));
            }
            if let Some(pkg) = source.package_for_blocking(package_id, want)? {
                if let Some(pkg) = self.admit(package_id, want, pkg) {
                    return Ok(pkg);
                }
            }
        }
        let mut known = false;
        for source in &self.sources {
            if source.has_package_blocking(package_id)? {
                known = true;
                break;
            }
        }
        Err(self.miss(package_id, want, known))
    }

    fn cached(&self, package_id: &str, want: &VersionSpec) -> Option<Arc<Package>> {
        let alias = format!("{}@{}", package_id, want);
        let key = self.aliases.get(&alias)?;
        self.packages.get(key.value()).map(|pkg| pkg.clone())
    }

    /// Cache and return a source answer, unless the source handed back a
    /// version that fails the spec.
    fn admit(
        &self,
        package_id: &str,
        want: &VersionSpec,
        pkg: Arc<Package>,
    ) -> Option<Arc<Package>> {
        if pkg.id() != package_id || !compatible(pkg.version(), want) {
            warn!(
                package = package_id,
                got = %pkg.key(),
                %want,
                "source returned a non-matching package; skipping"
            );
            return None;
        }
        let key = pkg.key();
        self.packages.insert(key.clone(), pkg.clone());
        self.aliases
            .insert(format!("{}@{}", package_id, want), key);
        Some(pkg)
    }

    fn miss(&self, package_id: &str, want: &VersionSpec, known: bool) -> LoadError {
        if known {
            LoadError::NoCompatibleVersion {
                package: package_id.to_string(),
                want: want.to_string(),
            }
        } else {
            LoadError::PackageNotFound(package_id.to_string())
        }
    }

    fn implied_spec(
        &self,
        package_id: &str,
        version_hint: Option<&VersionSpec>,
        requesting: Option<&CanonicalId>,
    ) -> Implied {
        if let Some(want) = version_hint {
            return Implied::Known(want.clone());
        }
        match requesting {
            // A sibling require stays inside the requester's own exact
            // package version.
            Some(req) if req.package() == package_id => {
                Implied::Known(VersionSpec::Exact(req.version().clone()))
            }
            Some(req) => Implied::Declared(req.clone()),
            None => Implied::Known(VersionSpec::Any),
        }
    }

    /// Stable identity string for a package + spec pair, `package@version`.
    pub async fn canonical_package_id(
        &self,
        package_id: &str,
        want: &VersionSpec,
    ) -> Result<String> {
        Ok(self.package_for(package_id, want).await?.key())
    }

    /// Blocking form of [`Loader::canonical_package_id`].
    pub fn canonical_package_id_blocking(
        &self,
        package_id: &str,
        want: &VersionSpec,
    ) -> Result<String> {
        Ok(self.package_for_blocking(package_id, want)?.key())
    }

    /// Direct dependencies of `pkg`, or with `expand` the full transitive
    /// closure. Fails `DependencyCycle` when a package transitively
    /// requires itself.
    pub async fn required_packages(
        &self,
        pkg: &Arc<Package>,
        expand: bool,
    ) -> Result<Vec<(String, Version)>> {
        if !expand {
            let mut out = Vec::new();
            for (dep, spec) in pkg.dependencies() {
                let resolved = self.package_for(dep, spec).await?;
                out.push((dep.clone(), resolved.version().clone()));
            }
            return Ok(out);
        }
        let mut stack = vec![pkg.id().to_string()];
        let mut out = BTreeMap::new();
        self.expand_deps(pkg.clone(), &mut stack, &mut out, 0).await?;
        Ok(out.into_iter().collect())
    }

    fn expand_deps<'a>(
        &'a self,
        pkg: Arc<Package>,
        stack: &'a mut Vec<String>,
        out: &'a mut BTreeMap<String, Version>,
        depth: usize,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if depth > self.config.max_expand_depth {
                return Err(LoadError::DependencyCycle(format!(
                    "dependency expansion exceeded depth {}",
                    self.config.max_expand_depth
                )));
            }
            for (dep, spec) in pkg.dependencies() {
                if stack.iter().any(|s| s == dep) {
                    let mut path = stack.clone();
                    path.push(dep.clone());
                    return Err(LoadError::DependencyCycle(path.join(" -> ")));
                }
                let resolved = self.package_for(dep, spec).await?;
                let seen = out.contains_key(dep);
                out.insert(dep.clone(), resolved.version().clone());
                if !seen {
                    stack.push(dep.clone());
                    self.expand_deps(resolved, stack, out, depth + 1).await?;
                    stack.pop();
                }
            }
            Ok(())
        })
    }

    /// Blocking form of [`Loader::required_packages`].
    pub fn required_packages_blocking(
        &self,
        pkg: &Arc<Package>,
        expand: bool,
    ) -> Result<Vec<(String, Version)>> {
        if !expand {
            let mut out = Vec::new();
            for (dep, spec) in pkg.dependencies() {
                let resolved = self.package_for_blocking(dep, spec)?;
                out.push((dep.clone(), resolved.version().clone()));
            }
            return Ok(out);
        }
        let mut stack = vec![pkg.id().to_string()];
        let mut out = BTreeMap::new();
        self.expand_deps_blocking(pkg, &mut stack, &mut out, 0)?;
        Ok(out.into_iter().collect())
    }

    fn expand_deps_blocking(
        &self,
        pkg: &Arc<Package>,
        stack: &mut Vec<String>,
        out: &mut BTreeMap<String, Version>,
        depth: usize,
    ) -> Result<()> {
        if depth > self.config.max_expand_depth {
            return Err(LoadError::DependencyCycle(format!(
                "dependency expansion exceeded depth {}",
                self.config.max_expand_depth
            )));
        }
        for (dep, spec) in pkg.dependencies() {
            if stack.iter().any(|s| s == dep) {
                let mut path = stack.clone();
                path.push(dep.clone());
                return Err(LoadError::DependencyCycle(path.join(" -> ")));
            }
            let resolved = self.package_for_blocking(dep, spec)?;
            let seen = out.contains_key(dep);
            out.insert(dep.clone(), resolved.version().clone());
            if !seen {
                stack.push(dep.clone());
                self.expand_deps_blocking(&resolved, stack, out, depth + 1)?;
                stack.pop();
            }
        }
        Ok(())
    }

    /// All visible packages: globally, or reachable from `scope` through
    /// transitive dependencies (the scope package included).
    pub async fn package_list(&self, scope: Option<&Arc<Package>>) -> Result<Vec<Arc<Package>>> {
        match scope {
            None => {
                let mut merged: BTreeMap<String, Arc<Package>> = BTreeMap::new();
                for source in &self.sources {
                    for pkg in source.package_list().await? {
                        merged.entry(pkg.key()).or_insert(pkg);
                    }
                }
                Ok(merged.into_values().collect())
            }
            Some(pkg) => {
                let mut out = vec![pkg.clone()];
                for (dep, version) in self.required_packages(pkg, true).await? {
                    let resolved = self
                        .package_for(&dep, &VersionSpec::Exact(version))
                        .await?;
                    out.push(resolved);
                }
                Ok(out)
            }
        }
    }

    /// Blocking form of [`Loader::package_list`].
    pub fn package_list_blocking(
        &self,
        scope: Option<&Arc<Package>>,
    ) -> Result<Vec<Arc<Package>>> {
        match scope {
            None => {
                let mut merged: BTreeMap<String, Arc<Package>> = BTreeMap::new();
                for source in &self.sources {
                    if !source.blocking_capable() {
                        return Err(LoadError::WouldBlock(
                            "package listing needs an async source".to_string(),
                        ));
                    }
                    for pkg in source.package_list_blocking()? {
                        merged.entry(pkg.key()).or_insert(pkg);
                    }
                }
                Ok(merged.into_values().collect())
            }
            Some(pkg) => {
                let mut out = vec![pkg.clone()];
                for (dep, version) in self.required_packages_blocking(pkg, true)? {
                    let resolved = self.package_for_blocking(&dep, &VersionSpec::Exact(version))?;
                    out.push(resolved);
                }
                Ok(out)
            }
        }
    }

    /// Invalidate cached lookups for a package (optionally only versions
    /// matching `want`). The next lookup re-queries sources. Modules
    /// already instantiated in sandboxes are untouched.
    pub fn clear(&self, package_id: &str, want: Option<&VersionSpec>) {
        self.packages.retain(|_, pkg| {
            let hit = pkg.id() == package_id
                && want.is_none_or(|w| compatible(pkg.version(), w));
            if hit {
                debug!(package = %pkg.key(), "clearing cached package");
                pkg.clear_factories();
            }
            !hit
        });
        // Aliases pointing at evicted entries go with them.
        self.aliases
            .retain(|_, key| self.packages.contains_key(key));
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("sources", &self.sources.len())
            .field("cached_packages", &self.packages.len())
            .finish_non_exhaustive()
    }
}

/// Which package a request targets: explicit qualification wins, then the
/// hint, then the requesting module's own package.
fn target_package(
    mref: &ModuleRef,
    package_hint: Option<&str>,
    requesting: Option<&CanonicalId>,
) -> Result<String> {
    if let Some(package) = mref.package() {
        return Ok(package.to_string());
    }
    if let Some(hint) = package_hint {
        validate_package_id(hint)?;
        return Ok(hint.to_string());
    }
    if let Some(req) = requesting {
        return Ok(req.package().to_string());
    }
    Err(LoadError::NoPackageContext(mref.to_string()))
}

/// Outcome of version-spec inference before any package lookup happens.
enum Implied {
    Known(VersionSpec),
    /// Spec comes from the requesting package's declared dependencies;
    /// the requester still has to be resolved.
    Declared(CanonicalId),
}
