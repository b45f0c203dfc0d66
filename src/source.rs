// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Package sources.
//!
//! A source is a read-only provider of packages, queried by the loader in
//! priority order. `Ok(None)` means "not found here"; the loader moves on
//! to the next source. Network or filesystem back-ends implement the async
//! methods only; in-memory back-ends also answer the blocking forms.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{LoadError, Result};
use crate::factory::FactoryDef;
use crate::package::{Manifest, ModuleProvider, Package};
use crate::version::{VersionSpec, best};

/// A provider of packages and their module factories.
#[async_trait]
pub trait Source: Send + Sync {
    /// Find the best package matching `package_id` under `want`, or `None`
    /// if this source has no match.
    async fn package_for(
        &self,
        package_id: &str,
        want: &VersionSpec,
    ) -> Result<Option<Arc<Package>>>;

    /// All packages this source can provide.
    async fn package_list(&self) -> Result<Vec<Arc<Package>>>;

    /// Whether the source knows the package id at any version. Used to
    /// distinguish "unknown package" from "no compatible version".
    async fn has_package(&self, package_id: &str) -> Result<bool> {
        Ok(self
            .package_list()
            .await?
            .iter()
            .any(|p| p.id() == package_id))
    }

    /// Whether the blocking forms can answer without suspending.
    fn blocking_capable(&self) -> bool {
        false
    }

    /// Blocking form of [`Source::package_for`].
    fn package_for_blocking(
        &self,
        package_id: &str,
        _want: &VersionSpec,
    ) -> Result<Option<Arc<Package>>> {
        Err(LoadError::WouldBlock(format!(
            "source lookup for {} requires async",
            package_id
        )))
    }

    /// Blocking form of [`Source::package_list`].
    fn package_list_blocking(&self) -> Result<Vec<Arc<Package>>> {
        Err(LoadError::WouldBlock(
            "source listing requires async".to_string(),
        ))
    }

    /// Blocking form of [`Source::has_package`].
    fn has_package_blocking(&self, package_id: &str) -> Result<bool> {
        Ok(self
            .package_list_blocking()?
            .iter()
            .any(|p| p.id() == package_id))
    }
}

/// Per-package module table backing [`MemorySource`] packages.
struct MemoryModules {
    package_key: String,
    modules: DashMap<String, FactoryDef>,
}

#[async_trait]
impl ModuleProvider for MemoryModules {
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
        self.modules
            .get(module_id)
            .map(|def| def.clone())
            .ok_or_else(|| LoadError::ModuleNotFound {
                package: self.package_key.clone(),
                module: module_id.to_string(),
            })
    }
}

/// One installed version of a package in a [`MemorySource`].
struct MemoryEntry {
    package: Arc<Package>,
    modules: Arc<MemoryModules>,
}

/// In-memory package registry.
///
/// Holds multiple installed versions per package id; version selection goes
/// through the same matcher the loader uses everywhere else. This is the
/// back-end for inline `define` and for tests; network registries live
/// behind the same [`Source`] trait out of tree.
#[derive(Default)]
pub struct MemorySource {
    packages: DashMap<String, Vec<MemoryEntry>>,
}

impl MemorySource {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package. Replaces an existing entry with the identical
    /// version; other versions of the same id are kept side by side.
    pub fn define_package(&self, manifest: Manifest) -> Arc<Package> {
        let modules = Arc::new(MemoryModules {
            package_key: format!("{}@{}", manifest.id(), manifest.version()),
            modules: DashMap::new(),
        });
        let package = Arc::new(Package::new(manifest, modules.clone()));
        let mut versions = self.packages.entry(package.id().to_string()).or_default();
        versions.retain(|e| e.package.version() != package.version());
        debug!(package = %package.key(), "registered package");
        versions.push(MemoryEntry {
            package: package.clone(),
            modules,
        });
        package
    }

    /// Register a module factory in an installed package version.
    pub fn define_module(
        &self,
        package_id: &str,
        want: &VersionSpec,
        module_id: &str,
        def: FactoryDef,
    ) -> Result<()> {
        let versions = self
            .packages
            .get(package_id)
            .ok_or_else(|| LoadError::PackageNotFound(package_id.to_string()))?;
        let entry = pick(&versions, want).ok_or_else(|| LoadError::NoCompatibleVersion {
            package: package_id.to_string(),
            want: want.to_string(),
        })?;
        entry
            .modules
            .modules
            .insert(module_id.to_string(), def);
        Ok(())
    }

    fn lookup(&self, package_id: &str, want: &VersionSpec) -> Option<Arc<Package>> {
        let versions = self.packages.get(package_id)?;
        pick(&versions, want).map(|e| e.package.clone())
    }

    fn list(&self) -> Vec<Arc<Package>> {
        self.packages
            .iter()
            .flat_map(|versions| {
                versions
                    .value()
                    .iter()
                    .map(|e| e.package.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Pick the entry holding the best version under `want`.
fn pick<'a>(entries: &'a [MemoryEntry], want: &VersionSpec) -> Option<&'a MemoryEntry> {
    let chosen = best(entries.iter().map(|e| e.package.version()), want)?;
    entries.iter().find(|e| e.package.version() == chosen)
}

#[async_trait]
impl Source for MemorySource {
    async fn package_for(
        &self,
        package_id: &str,
        want: &VersionSpec,
    ) -> Result<Option<Arc<Package>>> {
        Ok(self.lookup(package_id, want))
    }

    async fn package_list(&self) -> Result<Vec<Arc<Package>>> {
        Ok(self.list())
    }

    async fn has_package(&self, package_id: &str) -> Result<bool> {
        Ok(self.packages.contains_key(package_id))
    }

    fn blocking_capable(&self) -> bool {
        true
    }

    fn package_for_blocking(
        &self,
        package_id: &str,
        want: &VersionSpec,
    ) -> Result<Option<Arc<Package>>> {
        Ok(self.lookup(package_id, want))
    }

    fn package_list_blocking(&self) -> Result<Vec<Arc<Package>>> {
        Ok(self.list())
    }

    fn has_package_blocking(&self, package_id: &str) -> Result<bool> {
        Ok(self.packages.contains_key(package_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;
    use serde_json::json;

    fn source_with_versions() -> MemorySource {
        let source = MemorySource::new();
        for version in ["1.2.0", "1.3.1", "2.0.0"] {
            let manifest =
                Manifest::new("wire", Version::parse(version).unwrap()).unwrap();
            source.define_package(manifest);
        }
        source
    }

    #[test]
    fn test_version_selection() {
        let source = source_with_versions();

        let pkg = source
            .package_for_blocking("wire", &VersionSpec::parse("^1.2").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(pkg.version(), &Version::new(1, 3, 1));

        let pkg = source
            .package_for_blocking("wire", &VersionSpec::parse("2.0.0").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(pkg.version(), &Version::new(2, 0, 0));

        assert!(source
            .package_for_blocking("wire", &VersionSpec::parse("^1.5").unwrap())
            .unwrap()
            .is_none());
        assert!(source
            .package_for_blocking("other", &VersionSpec::Any)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_redefine_replaces_same_version() {
        let source = source_with_versions();
        let manifest = Manifest::new("wire", Version::new(1, 3, 1)).unwrap();
        source.define_package(manifest);
        assert_eq!(source.list().len(), 3);
    }

    #[test]
    fn test_define_module_targets_version() {
        let source = source_with_versions();
        source
            .define_module(
                "wire",
                &VersionSpec::parse("^1.2").unwrap(),
                "codec",
                FactoryDef::new(|_| Ok(json!({}))),
            )
            .unwrap();

        let v13 = source
            .package_for_blocking("wire", &VersionSpec::parse("1.3.1").unwrap())
            .unwrap()
            .unwrap();
        let v20 = source
            .package_for_blocking("wire", &VersionSpec::parse("2.0.0").unwrap())
            .unwrap()
            .unwrap();
        assert!(v13.exists_blocking("codec").unwrap());
        assert!(!v20.exists_blocking("codec").unwrap());

        assert!(matches!(
            source.define_module("nope", &VersionSpec::Any, "m", FactoryDef::new(|_| Ok(json!({})))),
            Err(LoadError::PackageNotFound(_))
        ));
    }
}
