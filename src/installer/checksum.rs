//! Release artifact digests
//!
//! Sources are consulted in order; the first one that knows the
//! version/arch pair decides. Pairs nobody knows are reported as unknown and
//! the installer applies its `require_checksum` policy.

use crate::config::EngineVersion;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A source of expected SHA-256 digests for release artifacts
pub trait ChecksumSource: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Expected lowercase hex digest of the `.gz` artifact
    fn expected(&self, version: &EngineVersion, arch: &str) -> Option<String>;
}

/// Digests shipped with the supervisor
pub struct KnownChecksums;

const KNOWN: &[(&str, &str, &str)] = &[
    (
        "v1.19.20",
        "amd64",
        "631e9ec36a2f70d876bbe4c70f58c4fd99589584ace741bbc2240098f452ee3a",
    ),
    (
        "v1.19.20",
        "amd64-compatible",
        "5e255e9eafd34077d177fc9c22b49c398c6a464b10b7bf3818f61e7179938de1",
    ),
    (
        "v1.19.20",
        "arm64",
        "729b04fcf54a7be6dfbb138fe8a972e058c0d7f3fddc6206fd34443342121e7c",
    ),
];

impl ChecksumSource for KnownChecksums {
    fn name(&self) -> &str {
        "built-in"
    }

    fn expected(&self, version: &EngineVersion, arch: &str) -> Option<String> {
        let version = version.to_string();
        KNOWN
            .iter()
            .find(|(v, a, _)| *v == version && *a == arch)
            .map(|(_, _, digest)| digest.to_string())
    }
}

/// Digests pinned in the manifest (`checksums: {version: {arch: sha256}}`)
pub struct PinnedChecksums {
    table: HashMap<String, HashMap<String, String>>,
}

impl PinnedChecksums {
    pub fn new(table: HashMap<String, HashMap<String, String>>) -> Self {
        PinnedChecksums { table }
    }
}

impl ChecksumSource for PinnedChecksums {
    fn name(&self) -> &str {
        "manifest"
    }

    fn expected(&self, version: &EngineVersion, arch: &str) -> Option<String> {
        self.table
            .get(&version.to_string())
            .and_then(|by_arch| by_arch.get(arch))
            .map(|d| d.trim().to_ascii_lowercase())
    }
}

/// First digest any source knows, with the source name
pub fn lookup(
    sources: &[Box<dyn ChecksumSource>],
    version: &EngineVersion,
    arch: &str,
) -> Option<(String, String)> {
    sources
        .iter()
        .find_map(|s| s.expected(version, arch).map(|d| (s.name().to_string(), d)))
}

/// Lowercase hex SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> EngineVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_known_table() {
        let known = KnownChecksums;
        assert!(known.expected(&v("v1.19.20"), "amd64").is_some());
        assert!(known.expected(&v("v1.19.20"), "armv7").is_none());
        assert!(known.expected(&v("v1.18.0"), "amd64").is_none());
    }

    #[test]
    fn test_pinned_normalised() {
        let mut by_arch = HashMap::new();
        by_arch.insert("arm64".to_string(), " ABCDEF ".to_string());
        let mut table = HashMap::new();
        table.insert("v1.18.0".to_string(), by_arch);

        let pinned = PinnedChecksums::new(table);
        assert_eq!(pinned.expected(&v("v1.18.0"), "arm64").as_deref(), Some("abcdef"));
        assert!(pinned.expected(&v("v1.18.0"), "amd64").is_none());
    }

    #[test]
    fn test_lookup_order() {
        let mut by_arch = HashMap::new();
        by_arch.insert("amd64".to_string(), "00".to_string());
        let mut table = HashMap::new();
        table.insert("v1.19.20".to_string(), by_arch);

        let sources: Vec<Box<dyn ChecksumSource>> =
            vec![Box::new(PinnedChecksums::new(table)), Box::new(KnownChecksums)];

        let (source, digest) = lookup(&sources, &v("v1.19.20"), "amd64").unwrap();
        assert_eq!(source, "manifest");
        assert_eq!(digest, "00");

        let (source, _) = lookup(&sources, &v("v1.19.20"), "arm64").unwrap();
        assert_eq!(source, "built-in");

        assert!(lookup(&sources, &v("v0.1.0"), "amd64").is_none());
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
