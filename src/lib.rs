// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # lodestar
//!
//! A dynamic module loading runtime with versioned package resolution and
//! sandboxed instantiation.
//!
//! Given a symbolic module reference - optionally qualified by package and
//! version - lodestar resolves it to a canonical `(package, exact version,
//! module)` identity, locates the defining package across prioritized
//! sources, and instantiates the module exactly once per sandbox:
//!
//! - Multiple packages can define modules with the same local name.
//! - Multiple installed versions of one package coexist; requests select
//!   among them with semver compatibility ranges.
//! - Every resolution operation exists in an async form and a blocking
//!   form; the blocking form fails fast with `WouldBlock` instead of
//!   faking synchronicity over an async back-end.
//! - Re-entrant requires during a module's own initialization are safe,
//!   and genuine cycles surface as `CircularModuleLoad` rather than
//!   deadlocks.
//!
//! ## Quick Start
//!
//! ```rust
//! use lodestar::{FactoryDef, Runtime};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::new();
//!     runtime.define("greeting", FactoryDef::new(|_| Ok(json!({"text": "hello"}))))?;
//!     runtime.define(
//!         "main",
//!         FactoryDef::new(|scope| {
//!             let greeting = scope.require("greeting")?;
//!             Ok(json!({"message": greeting["text"]}))
//!         }),
//!     )?;
//!
//!     let exports = runtime.main("app:main", None, Some("message")).await?;
//!     assert_eq!(*exports, json!("hello"));
//!     Ok(())
//! }
//! ```
//!
//! Custom registries implement the [`Source`] trait; in-memory back-ends
//! also answer the blocking forms, network back-ends leave them to fail
//! `WouldBlock`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod factory;
pub mod id;
pub mod loader;
pub mod package;
pub mod runtime;
pub mod sandbox;
pub mod source;
pub mod version;

// Re-exports
pub use error::{LoadError, Result};
pub use factory::{Exports, Factory, FactoryDef, FactoryFn};
pub use id::{CanonicalId, ModuleRef};
pub use loader::{Loader, LoaderConfig};
pub use package::{Manifest, ModuleProvider, Package};
pub use runtime::{DEFAULT_PACKAGE, Runtime};
pub use sandbox::{Module, ModuleScope, Sandbox};
pub use source::{MemorySource, Source};
pub use version::{VersionSpec, best, compatible};

/// Version of the lodestar runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
