// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module references and canonical module identity.
//!
//! A request names a module either bare (`"codec"`) or qualified with its
//! package (`"wire:codec"`). The qualified form is parsed exactly once at
//! the boundary into [`ModuleRef`]; nothing downstream re-splits strings.
//!
//! A [`CanonicalId`] is the fully-resolved `(package, exact version, module)`
//! triple. Two requests resolving to the same canonical id are the same
//! module everywhere in the runtime.

use semver::Version;
use std::fmt;
use std::str::FromStr;

use crate::error::{LoadError, Result};

/// Package ids are a namespace root: no separators allowed inside them.
/// Module ids may contain `/` (subpaths), which keeps the canonical triple
/// encoding unambiguous.
pub(crate) fn validate_package_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') || id.contains(':') || id.contains('@') {
        return Err(LoadError::InvalidPackageId(id.to_string()));
    }
    Ok(())
}

fn validate_module_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains(':') {
        return Err(LoadError::InvalidModuleRef(id.to_string()));
    }
    Ok(())
}

/// A parsed module request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModuleRef {
    /// Module named relative to the requesting module's own package.
    Bare(String),
    /// Module with an explicit owning package.
    Qualified {
        /// Owning package id
        package: String,
        /// Module id within that package
        module: String,
    },
}

impl ModuleRef {
    /// Parse a request string: `"module"` or `"package:module"`.
    pub fn parse(spec: &str) -> Result<Self> {
        match spec.split_once(':') {
            Some((package, module)) => {
                validate_package_id(package)?;
                validate_module_id(module)?;
                Ok(ModuleRef::Qualified {
                    package: package.to_string(),
                    module: module.to_string(),
                })
            }
            None => {
                validate_module_id(spec)?;
                Ok(ModuleRef::Bare(spec.to_string()))
            }
        }
    }

    /// The module id part of the reference.
    pub fn module(&self) -> &str {
        match self {
            ModuleRef::Bare(m) => m,
            ModuleRef::Qualified { module, .. } => module,
        }
    }

    /// The explicit package id, if the reference carries one.
    pub fn package(&self) -> Option<&str> {
        match self {
            ModuleRef::Bare(_) => None,
            ModuleRef::Qualified { package, .. } => Some(package),
        }
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleRef::Bare(m) => write!(f, "{}", m),
            ModuleRef::Qualified { package, module } => write!(f, "{}:{}", package, module),
        }
    }
}

/// Fully-qualified module identity: `(package, exact version, module)`.
///
/// Serialized as `package/version/module`. Package ids cannot contain `/`,
/// and a semver version cannot contain `/` either, so `splitn(3, '/')`
/// round-trips without ambiguity even when the module id has subpaths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalId {
    package: String,
    version: Version,
    module: String,
}

impl CanonicalId {
    /// Build a canonical id, validating the package id.
    pub fn new(package: &str, version: Version, module: &str) -> Result<Self> {
        validate_package_id(package)?;
        validate_module_id(module)?;
        Ok(Self {
            package: package.to_string(),
            version,
            module: module.to_string(),
        })
    }

    /// Owning package id.
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Exact resolved version of the owning package.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Module id within the package.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Stable identity key for the owning package, `package@version`.
    pub fn package_key(&self) -> String {
        format!("{}@{}", self.package, self.version)
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.package, self.version, self.module)
    }
}

impl FromStr for CanonicalId {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '/');
        let (package, version, module) = match (parts.next(), parts.next(), parts.next()) {
            (Some(p), Some(v), Some(m)) if !p.is_empty() && !m.is_empty() => (p, v, m),
            _ => return Err(LoadError::InvalidCanonicalId(s.to_string())),
        };
        let version =
            Version::parse(version).map_err(|_| LoadError::InvalidCanonicalId(s.to_string()))?;
        CanonicalId::new(package, version, module)
            .map_err(|_| LoadError::InvalidCanonicalId(s.to_string()))
    }
}
