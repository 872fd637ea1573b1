// src/version/mod.rs

//! Appliance version parsing and comparison
//!
//! Versions are dot-separated numeric components of any arity (`0.2.10`,
//! `1.2`, `2024.1.0.3`). Comparison is component-wise numeric with the
//! shorter version zero-padded, so `0.2.0 < 0.2.1 < 0.10.0` and
//! `1.2 == 1.2.0`.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Version reported when no version file exists
pub const DEFAULT_VERSION: &str = "0.2.0";

/// A parsed dotted numeric version
#[derive(Debug, Clone)]
pub struct VersionInfo {
    components: Vec<u64>,
}

impl VersionInfo {
    /// Parse a version string
    ///
    /// Examples:
    /// - "0.2.0" → [0, 2, 0]
    /// - "v1.10" → [1, 10]
    /// - "1..2" → error
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let bare = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        if bare.is_empty() {
            return Err(Error::ParseError("Empty version string".to_string()));
        }

        let components = bare
            .split('.')
            .map(|part| {
                part.parse::<u64>().map_err(|_| {
                    Error::ParseError(format!("Invalid version component '{}' in '{}'", part, s))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { components })
    }

    pub fn components(&self) -> &[u64] {
        &self.components
    }

    fn padded(&self, len: usize) -> impl Iterator<Item = u64> + '_ {
        self.components
            .iter()
            .copied()
            .chain(std::iter::repeat(0))
            .take(len)
    }
}

impl Ord for VersionInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        self.padded(len).cmp(other.padded(len))
    }
}

impl PartialOrd for VersionInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for VersionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VersionInfo {}

impl FromStr for VersionInfo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Compare two version strings
///
/// If either side cannot be parsed the versions are reported equal, which
/// means "no update available" to callers.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (VersionInfo::parse(a), VersionInfo::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Cannot compare versions '{}' and '{}': {}", a, b, e);
            Ordering::Equal
        }
    }
}

/// True if `latest` is strictly newer than `current`
pub fn is_newer(latest: &str, current: &str) -> bool {
    compare_versions(latest, current) == Ordering::Greater
}

/// Read the installed version from a single-line version file
///
/// Falls back to [`DEFAULT_VERSION`] when the file is missing or empty.
pub fn read_version_file(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let line = content.lines().next().unwrap_or("").trim();
            if line.is_empty() {
                DEFAULT_VERSION.to_string()
            } else {
                line.to_string()
            }
        }
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read version file {}: {}", path.display(), e);
            }
            DEFAULT_VERSION.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let v = VersionInfo::parse("0.2.10").unwrap();
        assert_eq!(v.components(), &[0, 2, 10]);
    }

    #[test]
    fn test_parse_v_prefix() {
        assert_eq!(VersionInfo::parse("v1.4").unwrap().components(), &[1, 4]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(VersionInfo::parse("").is_err());
        assert!(VersionInfo::parse("1..2").is_err());
        assert!(VersionInfo::parse("1.2-beta").is_err());
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        assert_eq!(compare_versions("0.2.0", "0.2.1"), Ordering::Less);
        assert_eq!(compare_versions("0.2.1", "0.10.0"), Ordering::Less);
        assert_eq!(compare_versions("0.9", "0.10"), Ordering::Less);
    }

    #[test]
    fn test_zero_padding() {
        assert_eq!(compare_versions("1.2", "1.2.1"), Ordering::Less);
        assert_eq!(compare_versions("2.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.2", "1.2.0.0"), Ordering::Equal);
        assert_eq!(VersionInfo::parse("1.2").unwrap(), VersionInfo::parse("1.2.0").unwrap());
    }

    #[test]
    fn test_unparseable_compares_equal() {
        assert_eq!(compare_versions("abc", "1.0"), Ordering::Equal);
        assert!(!is_newer("1.0.x", "0.1"));
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer("0.2.1", "0.2.0"));
        assert!(!is_newer("0.2.0", "0.2.0"));
        assert!(!is_newer("0.1.9", "0.2.0"));
    }

    #[test]
    fn test_display() {
        assert_eq!(VersionInfo::parse("v0.3.1").unwrap().to_string(), "0.3.1");
    }

    #[test]
    fn test_read_version_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("VERSION");
        assert_eq!(read_version_file(&path), DEFAULT_VERSION);

        std::fs::write(&path, "0.3.2\n").unwrap();
        assert_eq!(read_version_file(&path), "0.3.2");

        std::fs::write(&path, "\n").unwrap();
        assert_eq!(read_version_file(&path), DEFAULT_VERSION);
    }
}
