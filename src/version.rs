//! ttyhost version compatibility checks.
//!
//! Versions follow `MAJOR.MINOR.PATCH[-PRERELEASE][+BUILD]`. Build
//! metadata is ignored; a stable version outranks any prerelease with the
//! same base; prerelease identifiers compare per SemVer precedence, which
//! orders `dev.N` by the integer N and everything else lexicographically.

// Rust guideline compliant 2026-01

use std::cmp::Ordering;

use anyhow::{Context, Result};
use semver::Version;

/// Parse a version string, tolerating a leading `v`.
pub fn parse(version: &str) -> Result<Version> {
    Version::parse(version.trim().trim_start_matches('v'))
        .with_context(|| format!("invalid version string: {version:?}"))
}

/// Compare two versions by SemVer precedence (build metadata ignored).
#[must_use]
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.cmp_precedence(b)
}

/// Whether a discovered ttyhost's version can be adopted.
///
/// Compatible when it equals the expected version, or is at least
/// `min_compatible` by precedence. Unparseable versions are incompatible.
#[must_use]
pub fn is_compatible(found: &str, expected: &str, min_compatible: &str) -> bool {
    let (Ok(found), Ok(min)) = (parse(found), parse(min_compatible)) else {
        return false;
    };
    if let Ok(expected) = parse(expected) {
        if compare(&found, &expected) == Ordering::Equal {
            return true;
        }
    }
    compare(&found, &min) != Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ord(a: &str, b: &str) -> Ordering {
        compare(&parse(a).unwrap(), &parse(b).unwrap())
    }

    #[test]
    fn test_plain_ordering() {
        assert_eq!(ord("1.2.3", "1.2.3"), Ordering::Equal);
        assert_eq!(ord("1.2.3", "1.2.4"), Ordering::Less);
        assert_eq!(ord("2.0.0", "1.9.9"), Ordering::Greater);
    }

    #[test]
    fn test_build_metadata_is_ignored() {
        assert_eq!(ord("1.2.3+abc", "1.2.3+def"), Ordering::Equal);
        assert_eq!(ord("1.2.3+build.99", "1.2.3"), Ordering::Equal);
    }

    #[test]
    fn test_stable_outranks_prerelease_of_same_base() {
        assert_eq!(ord("2.0.0", "2.0.0-dev.5"), Ordering::Greater);
        assert_eq!(ord("2.0.0-rc.1", "2.0.0"), Ordering::Less);
    }

    #[test]
    fn test_dev_prerelease_ordered_by_integer() {
        assert_eq!(ord("1.0.0-dev.2", "1.0.0-dev.10"), Ordering::Less);
        assert_eq!(ord("1.0.0-dev.10", "1.0.0-dev.9"), Ordering::Greater);
    }

    #[test]
    fn test_other_prerelease_is_lexicographic() {
        assert_eq!(ord("1.0.0-alpha", "1.0.0-beta"), Ordering::Less);
        assert_eq!(ord("1.0.0-alpha.1", "1.0.0-alpha.beta"), Ordering::Less);
    }

    #[test]
    fn test_leading_v_is_tolerated() {
        assert_eq!(ord("v1.2.3", "1.2.3"), Ordering::Equal);
    }

    #[test]
    fn test_compatibility_rule() {
        // Exact match with expected always wins, even below the minimum.
        assert!(is_compatible("0.4.0", "0.4.0", "0.5.0"));
        // At or above minimum.
        assert!(is_compatible("0.5.0", "0.6.0", "0.5.0"));
        assert!(is_compatible("0.5.1", "0.6.0", "0.5.0"));
        // Below minimum and not the expected version.
        assert!(!is_compatible("1.0.0", "2.0.0", "2.0.0"));
        // Garbage is incompatible.
        assert!(!is_compatible("not-a-version", "1.0.0", "1.0.0"));
    }
}
