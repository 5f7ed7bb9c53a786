//! Engine binary installer
//!
//! Installs `<install_dir>/mihomo` for the target version:
//! - an installed binary reporting the target version is kept as is
//! - anything else is removed and replaced from the release artifact
//! - the artifact is checked against pinned digests, gunzipped, made
//!   executable and run once with `-v` before it is trusted

mod checksum;

pub use checksum::{lookup as lookup_checksum, sha256_hex, ChecksumSource, KnownChecksums, PinnedChecksums};

use crate::common::fs::remove_if_exists;
use crate::common::http::{build_client, get_bytes, Route};
use crate::common::process;
use crate::config::{EngineVersion, ProxyConfig};
use crate::{Error, Result};
use flate2::read::GzDecoder;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const USER_AGENT: &str = concat!("mihomo-supervisor/", env!("CARGO_PKG_VERSION"));

/// Host OS and CPU in the engine's release naming
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub os: String,
    pub arch: String,
}

impl HostTarget {
    /// Detect the running host
    pub fn detect() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        HostTarget {
            os: os.to_string(),
            arch: Self::map_arch(std::env::consts::ARCH, Self::needs_compatible_build()).to_string(),
        }
    }

    /// Map a Rust arch name to the release arch name
    pub fn map_arch(arch: &str, compatible: bool) -> &str {
        match arch {
            "x86_64" if compatible => "amd64-compatible",
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "arm" => "armv7",
            "x86" => "386",
            "loongarch64" => "loong64-abi2",
            other => other,
        }
    }

    /// Default amd64 builds assume AVX2; older CPUs get the compatible build
    fn needs_compatible_build() -> bool {
        #[cfg(target_arch = "x86_64")]
        {
            !std::is_x86_feature_detected!("avx2")
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            false
        }
    }

    /// Release artifact file name for a version
    pub fn artifact_name(&self, version: &EngineVersion) -> String {
        format!("mihomo-{}-{}-{}.gz", self.os, self.arch, version)
    }
}

/// Result of a successful install call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Target version was already present; nothing was downloaded
    AlreadyInstalled,
    /// Binary was downloaded, verified and validated
    Installed,
}

/// Output of `mihomo -v`
#[derive(Debug, Clone)]
pub struct VersionProbe {
    pub success: bool,
    pub stdout: String,
}

impl VersionProbe {
    pub fn version(&self) -> Option<EngineVersion> {
        EngineVersion::find_in(&self.stdout)
    }

    /// Exit 0 and output that identifies the engine
    pub fn looks_valid(&self) -> bool {
        self.success && self.stdout.to_ascii_lowercase().contains("mihomo")
    }
}

/// Run `<binary> -v` with a timeout
pub async fn probe_version(binary: &Path, limit: Duration) -> Result<VersionProbe> {
    let mut cmd = Command::new(binary);
    cmd.arg("-v")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = process::spawn(&mut cmd).await?;
    let output = timeout(limit, child.wait_with_output()).await??;
    Ok(VersionProbe {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    })
}

/// Installs the engine binary for one `ProxyConfig`
pub struct BinaryInstaller {
    version: EngineVersion,
    install_dir: PathBuf,
    download_base: String,
    require_checksum: bool,
    timings: crate::config::Timings,
    route: Route,
    target: HostTarget,
    checksums: Vec<Box<dyn ChecksumSource>>,
}

impl BinaryInstaller {
    /// Create an installer downloading over `route`
    pub fn new(config: &ProxyConfig, route: Route) -> Self {
        let checksums: Vec<Box<dyn ChecksumSource>> = vec![
            Box::new(PinnedChecksums::new(config.pinned_checksums.clone())),
            Box::new(KnownChecksums),
        ];

        BinaryInstaller {
            version: config.version,
            install_dir: config.install_dir.clone(),
            download_base: config.download_base.trim_end_matches('/').to_string(),
            require_checksum: config.require_checksum,
            timings: config.timings.clone(),
            route,
            target: HostTarget::detect(),
            checksums,
        }
    }

    /// Override the detected host target
    pub fn with_target(mut self, target: HostTarget) -> Self {
        self.target = target;
        self
    }

    /// Append another digest source after the defaults
    pub fn with_checksum_source(mut self, source: Box<dyn ChecksumSource>) -> Self {
        self.checksums.push(source);
        self
    }

    pub fn binary_path(&self) -> PathBuf {
        self.install_dir.join(crate::config::BINARY_NAME)
    }

    fn archive_path(&self) -> PathBuf {
        self.install_dir.join(format!("{}.gz", crate::config::BINARY_NAME))
    }

    /// Full artifact URL for the target version and host
    pub fn download_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.download_base,
            self.version,
            self.target.artifact_name(&self.version)
        )
    }

    /// Version reported by the installed binary, if it runs
    pub async fn installed_version(&self) -> Option<EngineVersion> {
        match probe_version(&self.binary_path(), self.timings.probe_timeout).await {
            Ok(probe) if probe.success => probe.version(),
            Ok(_) => None,
            Err(e) => {
                debug!("Version probe failed: {}", e);
                None
            }
        }
    }

    /// Ensure the target version is installed
    pub async fn install(&self) -> Result<InstallOutcome> {
        let bin = self.binary_path();

        if bin.exists() {
            match self.installed_version().await {
                Some(v) if v == self.version => {
                    info!("mihomo {} already installed at {}", v, bin.display());
                    return Ok(InstallOutcome::AlreadyInstalled);
                }
                Some(v) => info!("Installed mihomo is {}, replacing with {}", v, self.version),
                None => warn!("Installed mihomo at {} is unusable, replacing", bin.display()),
            }
            remove_if_exists(&bin).await?;
        }

        info!("Downloading mihomo {} ({})", self.version, self.target.arch);
        debug!("URL: {}", self.download_url());

        match self.download_and_unpack().await {
            Ok(()) => {
                info!("mihomo {} installed at {}", self.version, bin.display());
                Ok(InstallOutcome::Installed)
            }
            Err(e) => {
                error!("mihomo install failed: {}", e);
                let _ = remove_if_exists(&self.archive_path()).await;
                let _ = remove_if_exists(&bin).await;
                Err(e)
            }
        }
    }

    async fn download_and_unpack(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.install_dir).await?;

        let client = build_client(&self.route, self.timings.download_timeout, Some(USER_AGENT))?;
        let url = self.download_url();
        let data = get_bytes(&client, &url).await.map_err(|e| match e {
            Error::Timeout(msg) => Error::transport(format!("download timed out: {}", msg)),
            other => other,
        })?;

        let archive = self.archive_path();
        tokio::fs::write(&archive, &data).await?;

        self.verify(&data)?;

        let bin = self.binary_path();
        let (src, dst) = (archive.clone(), bin.clone());
        tokio::task::spawn_blocking(move || gunzip(&src, &dst))
            .await
            .map_err(|e| Error::internal(format!("decompress task failed: {}", e)))??;

        set_executable(&bin).await?;
        remove_if_exists(&archive).await?;

        let probe = probe_version(&bin, self.timings.probe_timeout).await?;
        if !probe.looks_valid() {
            return Err(Error::install(
                "downloaded binary does not run; the artifact may be corrupt",
            ));
        }
        if probe.version() != Some(self.version) {
            warn!(
                "Downloaded binary reports {:?}, expected {}",
                probe.version().map(|v| v.to_string()),
                self.version
            );
        }

        Ok(())
    }

    /// Check the archive against the digest sources
    fn verify(&self, data: &[u8]) -> Result<()> {
        match lookup_checksum(&self.checksums, &self.version, &self.target.arch) {
            Some((source, expected)) => {
                let actual = sha256_hex(data);
                if actual != expected {
                    return Err(Error::integrity(format!(
                        "SHA-256 mismatch ({} digest): expected {}..., got {}...",
                        source,
                        &expected[..expected.len().min(16)],
                        &actual[..16]
                    )));
                }
                info!("SHA-256 verified against {} digest", source);
                Ok(())
            }
            None if self.require_checksum => Err(Error::integrity(format!(
                "no pinned digest for {} {} and require_checksum is set",
                self.version, self.target.arch
            ))),
            None => {
                warn!(
                    "No pinned digest for {} {}; artifact accepted unverified",
                    self.version, self.target.arch
                );
                Ok(())
            }
        }
    }
}

fn gunzip(src: &Path, dst: &Path) -> Result<()> {
    let input = std::fs::File::open(src)?;
    let mut decoder = GzDecoder::new(BufReader::new(input));
    let mut out = std::fs::File::create(dst)?;
    std::io::copy(&mut decoder, &mut out)
        .map_err(|e| Error::install(format!("failed to decompress {}: {}", src.display(), e)))?;
    out.sync_all()?;
    Ok(())
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_arch() {
        assert_eq!(HostTarget::map_arch("x86_64", false), "amd64");
        assert_eq!(HostTarget::map_arch("x86_64", true), "amd64-compatible");
        assert_eq!(HostTarget::map_arch("aarch64", false), "arm64");
        assert_eq!(HostTarget::map_arch("arm", false), "armv7");
        assert_eq!(HostTarget::map_arch("riscv64", false), "riscv64");
    }

    #[test]
    fn test_download_url() {
        let config = ProxyConfig {
            download_base: "https://example.com/releases/".into(),
            ..Default::default()
        };
        let installer = BinaryInstaller::new(&config, Route::Direct).with_target(HostTarget {
            os: "linux".into(),
            arch: "arm64".into(),
        });
        assert_eq!(
            installer.download_url(),
            "https://example.com/releases/v1.19.20/mihomo-linux-arm64-v1.19.20.gz"
        );
    }

    #[test]
    fn test_verify_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProxyConfig {
            version: "v9.9.9".parse().unwrap(),
            install_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let target = HostTarget { os: "linux".into(), arch: "amd64".into() };

        let installer = BinaryInstaller::new(&config, Route::Direct).with_target(target.clone());
        assert!(installer.verify(b"anything").is_ok());

        config.require_checksum = true;
        let strict = BinaryInstaller::new(&config, Route::Direct).with_target(target.clone());
        assert!(matches!(strict.verify(b"anything"), Err(Error::Integrity(_))));

        let mut by_arch = std::collections::HashMap::new();
        by_arch.insert("amd64".to_string(), sha256_hex(b"payload"));
        config.pinned_checksums.insert("v9.9.9".to_string(), by_arch);
        let pinned = BinaryInstaller::new(&config, Route::Direct).with_target(target);
        assert!(pinned.verify(b"payload").is_ok());
        assert!(matches!(pinned.verify(b"tampered"), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_probe_validity() {
        let probe = VersionProbe {
            success: true,
            stdout: "Mihomo Meta v1.19.20 linux amd64".into(),
        };
        assert!(probe.looks_valid());
        assert_eq!(probe.version(), Some(EngineVersion::new(1, 19, 20)));

        let failed = VersionProbe { success: false, ..probe.clone() };
        assert!(!failed.looks_valid());

        let other = VersionProbe { success: true, stdout: "busybox v1.36.1".into() };
        assert!(!other.looks_valid());
    }

    #[tokio::test]
    async fn test_probe_missing_binary() {
        let result = probe_version(Path::new("/nonexistent/mihomo"), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
