//! Engine version tags (`v1.19.20`)

use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

static VERSION_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"v(\d+)\.(\d+)\.(\d+)").expect("static regex"));

/// A comparable `vMAJOR.MINOR.PATCH` tag
///
/// The same tag names the release directory and the artifact file on the
/// download server, so `Display` must reproduce the input form exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl EngineVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        EngineVersion { major, minor, patch }
    }

    /// Find the first version tag in free-form text such as `mihomo -v` output
    ///
    /// `Mihomo Meta v1.19.20 linux amd64 with go1.24.2 ...`
    pub fn find_in(text: &str) -> Option<Self> {
        let caps = VERSION_IN_TEXT.captures(text)?;
        Some(EngineVersion {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
            patch: caps[3].parse().ok()?,
        })
    }
}

impl FromStr for EngineVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let digits = s
            .strip_prefix('v')
            .ok_or_else(|| Error::config(format!("version tag must start with 'v': {}", s)))?;

        let parts: Vec<&str> = digits.split('.').collect();
        if parts.len() != 3 {
            return Err(Error::config(format!("version tag must be vMAJOR.MINOR.PATCH: {}", s)));
        }

        let num = |p: &str| {
            p.parse::<u64>()
                .map_err(|_| Error::config(format!("invalid version component '{}' in {}", p, s)))
        };

        Ok(EngineVersion {
            major: num(parts[0])?,
            minor: num(parts[1])?,
            patch: num(parts[2])?,
        })
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let v: EngineVersion = "v1.19.20".parse().unwrap();
        assert_eq!(v, EngineVersion::new(1, 19, 20));
        assert_eq!(v.to_string(), "v1.19.20");
    }

    #[test]
    fn test_reject_malformed() {
        assert!("1.19.20".parse::<EngineVersion>().is_err());
        assert!("v1.19".parse::<EngineVersion>().is_err());
        assert!("v1.x.3".parse::<EngineVersion>().is_err());
        assert!("latest".parse::<EngineVersion>().is_err());
    }

    #[test]
    fn test_ordering() {
        let a: EngineVersion = "v1.18.10".parse().unwrap();
        let b: EngineVersion = "v1.19.2".parse().unwrap();
        let c: EngineVersion = "v1.19.20".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_find_in_version_output() {
        let out = "Mihomo Meta v1.19.20 linux amd64 with go1.24.2 Mon Mar 3 2025\nUse tags: with_gvisor";
        assert_eq!(EngineVersion::find_in(out), Some(EngineVersion::new(1, 19, 20)));
        assert_eq!(EngineVersion::find_in("no version here"), None);
    }
}
