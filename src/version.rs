//! Version parsing and ordering for Kubernetes and provider versions
//!
//! Versions in this system look like `v1.28.4` or `v1.28.4+vmware.1-build.2`.
//! Ordering is semantic on major.minor.patch; when those are equal the
//! numeric build-metadata suffix breaks the tie. This ordering backs the
//! downgrade guard in the upgrade orchestrator and the provider eligibility
//! check against the version catalog.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A parsed version with optional numeric build metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Major component
    pub major: u64,
    /// Minor component
    pub minor: u64,
    /// Patch component
    pub patch: u64,
    /// Numeric build-metadata suffix, when present
    pub build: Option<u64>,
}

impl Version {
    /// Construct a version without build metadata
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            build: None,
        }
    }

    /// Canonical `vMAJOR.MINOR.PATCH` rendering, build metadata dropped
    pub fn canonical(&self) -> String {
        format!("v{}.{}.{}", self.major, self.minor, self.patch)
    }

    /// The `major.minor` series this version belongs to, e.g. `v1.28`
    pub fn minor_series(&self) -> String {
        format!("v{}.{}", self.major, self.minor)
    }

    /// True when both versions share major.minor.patch
    pub fn same_release(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor && self.patch == other.patch
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            // absent build metadata sorts below any present build
            .then_with(|| self.build.cmp(&other.build))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.build {
            Some(build) => write!(f, "v{}.{}.{}+{}", self.major, self.minor, self.patch, build),
            None => write!(f, "v{}.{}.{}", self.major, self.minor, self.patch),
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('v');
        if trimmed.is_empty() {
            return Err(Error::validation("empty version string"));
        }

        let (core, metadata) = match trimmed.split_once('+') {
            Some((core, meta)) => (core, Some(meta)),
            None => (trimmed, None),
        };

        let mut parts = core.splitn(3, '.');
        let major = parse_component(parts.next(), s)?;
        let minor = parse_component(parts.next(), s)?;
        let patch = parse_component(parts.next(), s)?;

        let build = match metadata {
            Some(meta) => Some(parse_build_metadata(meta, s)?),
            None => None,
        };

        Ok(Version {
            major,
            minor,
            patch,
            build,
        })
    }
}

fn parse_component(part: Option<&str>, original: &str) -> Result<u64> {
    part.and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::validation(format!("malformed version string {:?}", original)))
}

/// Extract the numeric tail of build metadata like `vmware.1-build.17` or `3`
fn parse_build_metadata(meta: &str, original: &str) -> Result<u64> {
    let digits: String = meta
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits
        .parse()
        .map_err(|_| Error::validation(format!("non-numeric build metadata in {:?}", original)))
}

/// Compare two version strings with the build-metadata-aware rule
///
/// Returns `Ordering::Less` when `a` is older than `b`. Parse failures
/// surface as validation errors so callers abort before mutating anything.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering> {
    let left: Version = a.parse()?;
    let right: Version = b.parse()?;
    Ok(left.cmp(&right))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story: Version Parsing
    // ==========================================================================

    #[test]
    fn when_version_has_leading_v_it_parses() {
        let v: Version = "v1.28.4".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch, v.build), (1, 28, 4, None));
    }

    #[test]
    fn when_version_has_build_metadata_the_numeric_tail_is_kept() {
        let v: Version = "v1.28.4+vmware.1-build.17".parse().unwrap();
        assert_eq!(v.build, Some(17));

        let v: Version = "1.28.4+3".parse().unwrap();
        assert_eq!(v.build, Some(3));
    }

    #[test]
    fn when_version_is_malformed_parse_fails() {
        assert!("".parse::<Version>().is_err());
        assert!("v1.28".parse::<Version>().is_err());
        assert!("not-a-version".parse::<Version>().is_err());
        assert!("v1.28.4+build".parse::<Version>().is_err());
    }

    // ==========================================================================
    // Story: Ordering Backs the Downgrade Guard
    //
    // Equal major.minor.patch falls back to the numeric build suffix;
    // different triples compare semantically, never lexically.
    // ==========================================================================

    #[test]
    fn when_triples_differ_ordering_is_semantic() {
        assert_eq!(compare_versions("v1.9.0", "v1.10.0").unwrap(), Ordering::Less);
        assert_eq!(compare_versions("v2.0.0", "v1.99.9").unwrap(), Ordering::Greater);
    }

    #[test]
    fn when_triples_match_build_metadata_breaks_the_tie() {
        assert_eq!(
            compare_versions("v1.28.4+vmware.1-build.2", "v1.28.4+vmware.1-build.10").unwrap(),
            Ordering::Less
        );
        assert_eq!(
            compare_versions("v1.28.4+5", "v1.28.4+5").unwrap(),
            Ordering::Equal
        );
        // no build metadata sorts below any build
        assert_eq!(
            compare_versions("v1.28.4", "v1.28.4+1").unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn canonical_drops_build_metadata() {
        let v: Version = "v1.28.4+vmware.1".parse().unwrap();
        assert_eq!(v.canonical(), "v1.28.4");
        assert_eq!(v.minor_series(), "v1.28");
    }
}
