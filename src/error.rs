// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error types for lodestar.

use thiserror::Error;

/// Result type for loading operations.
pub type Result<T> = std::result::Result<T, LoadError>;

/// Main error type for the loading runtime.
#[derive(Error, Debug)]
pub enum LoadError {
    /// No installed version of the package satisfies the requested spec
    #[error("no compatible version of {package} for {want}")]
    NoCompatibleVersion { package: String, want: String },

    /// No configured source knows the package at all
    #[error("package not found: {0}")]
    PackageNotFound(String),

    /// Package exists but does not define the requested module
    #[error("module {module} not found in package {package}")]
    ModuleNotFound { package: String, module: String },

    /// A package transitively requires itself
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    /// A module factory required its own canonical id mid-instantiation
    #[error("circular module load: {0}")]
    CircularModuleLoad(String),

    /// A synchronous call hit an inherently asynchronous source
    #[error("operation would block: {0}")]
    WouldBlock(String),

    /// Version spec string could not be parsed
    #[error("invalid version spec: {0}")]
    InvalidVersionSpec(String),

    /// Canonical id string could not be parsed back into a triple
    #[error("invalid canonical id: {0}")]
    InvalidCanonicalId(String),

    /// Package id contains reserved characters or is empty
    #[error("invalid package id: {0}")]
    InvalidPackageId(String),

    /// Module reference string could not be parsed
    #[error("invalid module reference: {0}")]
    InvalidModuleRef(String),

    /// A bare module reference with no requesting module or package hint
    #[error("no package context for module {0}")]
    NoPackageContext(String),

    /// Module factory invocation failed
    #[error("factory for {id} failed: {message}")]
    Factory { id: String, message: String },

    /// Semver parsing error
    #[error("invalid version: {0}")]
    Semver(#[from] semver::Error),

    /// General error with message
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for LoadError {
    fn from(err: anyhow::Error) -> Self {
        LoadError::Other(err.to_string())
    }
}

impl From<String> for LoadError {
    fn from(s: String) -> Self {
        LoadError::Other(s)
    }
}

impl From<&str> for LoadError {
    fn from(s: &str) -> Self {
        LoadError::Other(s.to_string())
    }
}
