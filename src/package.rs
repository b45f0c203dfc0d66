// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Packages - a manifest view plus per-package module lookup.
//!
//! A `Package` is produced by a `Source` when a manifest matches a request.
//! Identity (id, version, declared dependencies) is immutable; free-form
//! manifest attributes are readable and writable; loaded factories are
//! cached per package so repeated loads never re-fetch.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use semver::Version;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{LoadError, Result};
use crate::factory::{Factory, FactoryDef};
use crate::id::validate_package_id;
use crate::version::VersionSpec;

/// Fetches module definitions for one package. Owned by the source that
/// produced the package.
#[async_trait]
pub trait ModuleProvider: Send + Sync {
    /// Whether the package defines the module. Some registries need a
    /// round-trip to answer this.
    async fn exists(&self, module_id: &str) -> Result<bool>;

    /// Fetch the module's definition.
    async fn fetch(&self, module_id: &str) -> Result<FactoryDef>;

    /// Whether the blocking forms below can answer without suspending.
    fn blocking_capable(&self) -> bool {
        false
    }

    /// Blocking existence check; fails `WouldBlock` unless the provider is
    /// blocking-capable.
    fn exists_blocking(&self, module_id: &str) -> Result<bool> {
        Err(LoadError::WouldBlock(format!(
            "module existence check for {} requires async",
            module_id
        )))
    }

    /// Blocking fetch; fails `WouldBlock` unless the provider is
    /// blocking-capable.
    fn fetch_blocking(&self, module_id: &str) -> Result<FactoryDef> {
        Err(LoadError::WouldBlock(format!(
            "module fetch for {} requires async",
            module_id
        )))
    }
}

/// An immutable package manifest with mutable free-form attributes.
pub struct Manifest {
    id: String,
    version: Version,
    dependencies: BTreeMap<String, VersionSpec>,
    attributes: RwLock<BTreeMap<String, Value>>,
}

impl Manifest {
    /// Create a manifest for `id` at `version`.
    pub fn new(id: &str, version: Version) -> Result<Self> {
        validate_package_id(id)?;
        Ok(Self {
            id: id.to_string(),
            version,
            dependencies: BTreeMap::new(),
            attributes: RwLock::new(BTreeMap::new()),
        })
    }

    /// Declare a dependency on another package.
    pub fn with_dependency(mut self, package_id: &str, spec: VersionSpec) -> Result<Self> {
        validate_package_id(package_id)?;
        self.dependencies.insert(package_id.to_string(), spec);
        Ok(self)
    }

    /// Set an initial free-form attribute.
    pub fn with_attribute(self, key: &str, value: Value) -> Self {
        self.attributes.write().insert(key.to_string(), value);
        self
    }

    /// Package id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Package version.
    pub fn version(&self) -> &Version {
        &self.version
    }
}

impl fmt::Debug for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manifest")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// A resolved package: manifest plus a lazily-populated factory cache.
pub struct Package {
    manifest: Manifest,
    provider: Arc<dyn ModuleProvider>,
    factories: DashMap<String, Arc<Factory>>,
}

impl Package {
    /// Create a package backed by a module provider.
    pub fn new(manifest: Manifest, provider: Arc<dyn ModuleProvider>) -> Self {
        Self {
            manifest,
            provider,
            factories: DashMap::new(),
        }
    }

    /// Package id.
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Exact package version.
    pub fn version(&self) -> &Version {
        &self.manifest.version
    }

    /// Stable identity key, `id@version`.
    pub fn key(&self) -> String {
        format!("{}@{}", self.manifest.id, self.manifest.version)
    }

    /// Read a free-form manifest attribute.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.manifest.attributes.read().get(key).cloned()
    }

    /// Write a free-form manifest attribute.
    pub fn set(&self, key: &str, value: Value) {
        self.manifest.attributes.write().insert(key.to_string(), value);
    }

    /// Declared dependencies, `package id -> version spec`.
    pub fn dependencies(&self) -> &BTreeMap<String, VersionSpec> {
        &self.manifest.dependencies
    }

    /// The version spec this package declares for a dependency.
    pub fn required_version(&self, package_id: &str) -> Option<&VersionSpec> {
        self.manifest.dependencies.get(package_id)
    }

    /// Whether the provider is blocking-capable.
    pub fn blocking_capable(&self) -> bool {
        self.provider.blocking_capable()
    }

    /// Whether the package defines the module.
    pub async fn exists(&self, module_id: &str) -> Result<bool> {
        if self.factories.contains_key(module_id) {
            return Ok(true);
        }
        self.provider.exists(module_id).await
    }

    /// Blocking form of [`Package::exists`].
    pub fn exists_blocking(&self, module_id: &str) -> Result<bool> {
        if self.factories.contains_key(module_id) {
            return Ok(true);
        }
        self.provider.exists_blocking(module_id)
    }

    /// Load the module's factory, fetching it from the provider on first
    /// call and from the per-package cache afterwards.
    pub async fn load(&self, module_id: &str) -> Result<Arc<Factory>> {
        if let Some(factory) = self.factories.get(module_id) {
            return Ok(factory.clone());
        }
        if !self.provider.exists(module_id).await? {
            return Err(self.not_found(module_id));
        }
        let def = self.provider.fetch(module_id).await?;
        self.cache_factory(module_id, def)
    }

    /// Blocking form of [`Package::load`].
    pub fn load_blocking(&self, module_id: &str) -> Result<Arc<Factory>> {
        if let Some(factory) = self.factories.get(module_id) {
            return Ok(factory.clone());
        }
        if !self.provider.exists_blocking(module_id)? {
            return Err(self.not_found(module_id));
        }
        let def = self.provider.fetch_blocking(module_id)?;
        self.cache_factory(module_id, def)
    }

    fn cache_factory(&self, module_id: &str, def: FactoryDef) -> Result<Arc<Factory>> {
        let factory = Arc::new(Factory::new(
            &self.manifest.id,
            self.manifest.version.clone(),
            module_id,
            def,
        )?);
        debug!(package = %self.key(), module = module_id, "cached factory");
        // A concurrent load may have raced the fetch; keep whichever entry
        // landed first so every caller shares one factory.
        Ok(self
            .factories
            .entry(module_id.to_string())
            .or_insert(factory)
            .clone())
    }

    fn not_found(&self, module_id: &str) -> LoadError {
        LoadError::ModuleNotFound {
            package: self.key(),
            module: module_id.to_string(),
        }
    }

    /// Drop all cached factories; the next load re-fetches from the
    /// provider. Does not touch modules already instantiated in sandboxes.
    pub fn clear_factories(&self) {
        self.factories.clear();
    }
}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Package")
            .field("manifest", &self.manifest)
            .field("cached_factories", &self.factories.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct CountingProvider {
        modules: DashMap<String, FactoryDef>,
        fetches: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ModuleProvider for CountingProvider {
        async fn exists(&self, module_id: &str) -> Result<bool> {
            self.exists_blocking(module_id)
        }

        async fn fetch(&self, module_id: &str) -> Result<FactoryDef> {
            self.fetch_blocking(module_id)
        }

        fn blocking_capable(&self) -> bool {
            true
        }

        fn exists_blocking(&self, module_id: &str) -> Result<bool> {
            Ok(self.modules.contains_key(module_id))
        }

        fn fetch_blocking(&self, module_id: &str) -> Result<FactoryDef> {
            self.fetches
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.modules
                .get(module_id)
                .map(|d| d.clone())
                .ok_or_else(|| LoadError::Other(format!("missing {}", module_id)))
        }
    }

    fn test_package() -> (Package, Arc<CountingProvider>) {
        let provider = Arc::new(CountingProvider {
            modules: DashMap::new(),
            fetches: std::sync::atomic::AtomicUsize::new(0),
        });
        provider.modules.insert(
            "codec".to_string(),
            FactoryDef::new(|_| Ok(json!({"kind": "codec"}))),
        );
        let manifest = Manifest::new("wire", Version::new(1, 3, 1)).unwrap();
        (Package::new(manifest, provider.clone()), provider)
    }

    #[test]
    fn test_load_caches_factory() {
        let (pkg, provider) = test_package();
        let first = pkg.load_blocking("codec").unwrap();
        let second = pkg.load_blocking("codec").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            provider.fetches.load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        pkg.clear_factories();
        let third = pkg.load_blocking("codec").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(
            provider.fetches.load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }

    #[test]
    fn test_missing_module() {
        let (pkg, _) = test_package();
        assert!(!pkg.exists_blocking("nope").unwrap());
        match pkg.load_blocking("nope") {
            Err(LoadError::ModuleNotFound { package, module }) => {
                assert_eq!(package, "wire@1.3.1");
                assert_eq!(module, "nope");
            }
            other => panic!("expected ModuleNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_manifest_attributes() {
        let (pkg, _) = test_package();
        assert_eq!(pkg.get("homepage"), None);
        pkg.set("homepage", json!("https://example.net"));
        assert_eq!(pkg.get("homepage"), Some(json!("https://example.net")));
    }

    #[test]
    fn test_required_version() {
        let manifest = Manifest::new("app", Version::new(0, 1, 0))
            .unwrap()
            .with_dependency("wire", VersionSpec::parse("^1.2").unwrap())
            .unwrap();
        let (_, provider) = test_package();
        let pkg = Package::new(manifest, provider);
        assert_eq!(
            pkg.required_version("wire"),
            Some(&VersionSpec::parse("^1.2").unwrap())
        );
        assert_eq!(pkg.required_version("other"), None);
    }
}
