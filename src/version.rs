// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Semantic version compatibility matching.
//!
//! The compatibility range here is narrower than npm's full requirement
//! grammar on purpose: a caret spec pins the major version and sets a
//! minor.patch floor, nothing else. Exact specs match one version only.

use semver::Version;
use std::fmt;

use crate::error::{LoadError, Result};

/// A version requirement attached to a package request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    /// No requirement; the best (highest) available version wins.
    Any,
    /// Only an identical version qualifies.
    Exact(Version),
    /// Same major version, and minor.patch at or above the floor.
    Compatible(Version),
}

impl VersionSpec {
    /// Parse a spec string.
    ///
    /// `""` and `"*"` mean any version; `^M`, `^M.m` and `^M.m.p` are
    /// compatibility floors; `M.m.p` (optionally `=`-prefixed, optionally
    /// with a pre-release tag) is exact.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() || spec == "*" {
            return Ok(VersionSpec::Any);
        }
        if let Some(floor) = spec.strip_prefix('^') {
            let version = parse_loose(floor)
                .map_err(|_| LoadError::InvalidVersionSpec(spec.to_string()))?;
            return Ok(VersionSpec::Compatible(version));
        }
        let exact = spec.strip_prefix('=').unwrap_or(spec);
        let version =
            Version::parse(exact).map_err(|_| LoadError::InvalidVersionSpec(spec.to_string()))?;
        Ok(VersionSpec::Exact(version))
    }

    /// Check whether an installed version satisfies this spec.
    pub fn matches(&self, have: &Version) -> bool {
        match self {
            VersionSpec::Any => true,
            VersionSpec::Exact(want) => have == want,
            // Pre-release ordering rides on semver's total order, so
            // 1.2.0-beta sorts below the 1.2.0 floor as expected.
            VersionSpec::Compatible(floor) => have.major == floor.major && have >= floor,
        }
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Any => write!(f, "*"),
            VersionSpec::Exact(v) => write!(f, "{}", v),
            VersionSpec::Compatible(v) => write!(f, "^{}", v),
        }
    }
}

/// Check whether `have` satisfies `want`.
pub fn compatible(have: &Version, want: &VersionSpec) -> bool {
    want.matches(have)
}

/// Pick the best (highest) candidate satisfying `want`.
///
/// Ties cannot occur under semver's strict total order. Returns `None` when
/// no candidate qualifies; callers turn that into `NoCompatibleVersion`.
pub fn best<'a, I>(candidates: I, want: &VersionSpec) -> Option<&'a Version>
where
    I: IntoIterator<Item = &'a Version>,
{
    candidates
        .into_iter()
        .filter(|v| want.matches(v))
        .max()
}

/// Parse a version with missing minor/patch components padded with zeros.
fn parse_loose(s: &str) -> std::result::Result<Version, semver::Error> {
    // Don't pad when a pre-release or build tag is present; those require
    // the full triple anyway.
    if s.contains('-') || s.contains('+') {
        return Version::parse(s);
    }
    match s.split('.').count() {
        1 => Version::parse(&format!("{}.0.0", s)),
        2 => Version::parse(&format!("{}.0", s)),
        _ => Version::parse(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_parse_specs() {
        assert_eq!(VersionSpec::parse("*").unwrap(), VersionSpec::Any);
        assert_eq!(VersionSpec::parse("").unwrap(), VersionSpec::Any);
        assert_eq!(
            VersionSpec::parse("1.2.3").unwrap(),
            VersionSpec::Exact(v("1.2.3"))
        );
        assert_eq!(
            VersionSpec::parse("=1.2.3").unwrap(),
            VersionSpec::Exact(v("1.2.3"))
        );
        assert_eq!(
            VersionSpec::parse("^1.2").unwrap(),
            VersionSpec::Compatible(v("1.2.0"))
        );
        assert_eq!(
            VersionSpec::parse("^2").unwrap(),
            VersionSpec::Compatible(v("2.0.0"))
        );
        assert!(VersionSpec::parse("1.2").is_err());
        assert!(VersionSpec::parse("banana").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for spec in ["*", "1.2.3", "^1.2.0", "^1.2.3-beta.1"] {
            let parsed = VersionSpec::parse(spec).unwrap();
            assert_eq!(VersionSpec::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn test_compatible_range() {
        let want = VersionSpec::parse("^1.2").unwrap();
        assert!(want.matches(&v("1.2.0")));
        assert!(want.matches(&v("1.3.1")));
        assert!(!want.matches(&v("1.1.9")));
        assert!(!want.matches(&v("2.0.0")));
        // Pre-release of the floor itself sorts below the floor.
        assert!(!want.matches(&v("1.2.0-beta.1")));
    }

    #[test]
    fn test_best_selection() {
        let candidates = vec![v("1.2.0"), v("1.3.1"), v("2.0.0")];

        let got = best(&candidates, &VersionSpec::parse("^1.2").unwrap());
        assert_eq!(got, Some(&v("1.3.1")));

        let got = best(&candidates, &VersionSpec::parse("2.0.0").unwrap());
        assert_eq!(got, Some(&v("2.0.0")));

        assert!(best(&candidates, &VersionSpec::parse("^1.5").unwrap()).is_none());

        let got = best(&candidates, &VersionSpec::Any);
        assert_eq!(got, Some(&v("2.0.0")));
    }

    #[test]
    fn test_best_prerelease_ordering() {
        let candidates = vec![v("1.4.0-alpha.1"), v("1.4.0-alpha.2"), v("1.3.0")];
        let got = best(&candidates, &VersionSpec::parse("^1.3").unwrap());
        // 1.4.0-alpha.2 > 1.3.0 under semver ordering.
        assert_eq!(got, Some(&v("1.4.0-alpha.2")));
    }
}
