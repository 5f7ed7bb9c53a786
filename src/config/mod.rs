//! Configuration module
//!
//! Settings come from two YAML files: `manifest.yaml` (ports, version,
//! directories, mirrors) and `secrets.yaml` (subscription URL, API secret,
//! tokens). Missing files fall back to defaults; malformed files are errors.

pub mod patch;
mod version;

pub use patch::{patch_config, patch_document};
pub use version::EngineVersion;

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default local mixed (HTTP + SOCKS) listen port
pub const DEFAULT_PROXY_PORT: u16 = 7890;

/// Default control API port
pub const DEFAULT_API_PORT: u16 = 9090;

/// Default engine release
pub const DEFAULT_VERSION: &str = "v1.19.20";

/// Release download base; artifacts live at `<base>/<version>/<file>`
pub const DEFAULT_DOWNLOAD_BASE: &str = "https://github.com/MetaCubeX/mihomo/releases/download";

/// Fast, well-known endpoint used for the end-to-end health probe
pub const DEFAULT_HEALTH_CHECK_URL: &str = "https://cp.cloudflare.com/generate_204";

/// Bootstrap accelerator script shipped on the instance image
pub const DEFAULT_TURBO_SCRIPT: &str = "/etc/network_turbo";

/// Geodata mirror bases, highest priority first
pub const DEFAULT_GEODATA_MIRRORS: &[&str] = &[
    "https://testingcf.jsdelivr.net/gh/MetaCubeX/meta-rules-dat@release",
    "https://fastly.jsdelivr.net/gh/MetaCubeX/meta-rules-dat@release",
    "https://github.com/MetaCubeX/meta-rules-dat/releases/download/latest",
];

/// Engine binary name inside the install directory
pub const BINARY_NAME: &str = "mihomo";

/// Routing document name inside the runtime and backup directories
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Connection-selection cache the engine persists next to its config
pub const CACHE_FILE_NAME: &str = "cache.db";

pub const PID_FILE_NAME: &str = "mihomo.pid";

pub const LOG_FILE_NAME: &str = "mihomo.log";

/// Bounded waits used throughout the lifecycle
#[derive(Debug, Clone)]
pub struct Timings {
    /// Per-attempt subscription fetch timeout
    pub fetch_timeout: Duration,
    /// Binary and geodata download timeout
    pub download_timeout: Duration,
    /// `mihomo -v` probe timeout
    pub probe_timeout: Duration,
    /// How long `start` waits for the proxy port
    pub ready_timeout: Duration,
    /// How long `start` waits for a previous instance to release the port
    pub port_release_timeout: Duration,
    /// How long `stop` waits after SIGTERM before SIGKILL
    pub stop_grace: Duration,
    /// Sleep between readiness and exit polls
    pub poll_interval: Duration,
    pub health_timeout: Duration,
    pub control_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            fetch_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(15),
            port_release_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            health_timeout: Duration::from_secs(10),
            control_timeout: Duration::from_secs(5),
        }
    }
}

/// Immutable per-run configuration of the supervised engine
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Subscription URL; `None` means only a restored backup can be used
    pub subscription_url: Option<String>,
    pub proxy_port: u16,
    pub api_port: u16,
    /// Control API bearer secret
    pub api_secret: Option<String>,
    pub version: EngineVersion,
    pub install_dir: PathBuf,
    /// Runtime directory: config, PID record, log, geodata
    pub config_dir: PathBuf,
    /// Durable location surviving instance teardown
    pub backup_dir: Option<PathBuf>,
    pub download_base: String,
    pub geodata_mirrors: Vec<String>,
    pub health_check_url: String,
    /// Refuse artifacts that have no pinned digest
    pub require_checksum: bool,
    /// Extra digests: version -> arch -> sha256 hex
    pub pinned_checksums: HashMap<String, HashMap<String, String>>,
    pub timings: Timings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            subscription_url: None,
            proxy_port: DEFAULT_PROXY_PORT,
            api_port: DEFAULT_API_PORT,
            api_secret: None,
            version: EngineVersion::new(1, 19, 20),
            install_dir: PathBuf::from("/usr/local/bin"),
            config_dir: PathBuf::from("/etc/mihomo"),
            backup_dir: None,
            download_base: DEFAULT_DOWNLOAD_BASE.to_string(),
            geodata_mirrors: DEFAULT_GEODATA_MIRRORS.iter().map(|s| s.to_string()).collect(),
            health_check_url: DEFAULT_HEALTH_CHECK_URL.to_string(),
            require_checksum: false,
            pinned_checksums: HashMap::new(),
            timings: Timings::default(),
        }
    }
}

impl ProxyConfig {
    /// Local proxy URL handed to clients
    pub fn proxy_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.proxy_port)
    }

    /// Control API base URL
    pub fn api_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.api_port)
    }

    pub fn binary_path(&self) -> PathBuf {
        self.install_dir.join(BINARY_NAME)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.config_dir.join(PID_FILE_NAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.config_dir.join(LOG_FILE_NAME)
    }

    /// Whether a subscription source is configured
    pub fn has_subscription(&self) -> bool {
        self.subscription_url.as_deref().map_or(false, |u| !u.trim().is_empty())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.proxy_port == 0 || self.api_port == 0 {
            return Err(Error::config("proxy_port and api_port must be non-zero"));
        }

        if self.proxy_port == self.api_port {
            return Err(Error::config(format!(
                "proxy_port and api_port must differ (both {})",
                self.proxy_port
            )));
        }

        if let Some(ref sub) = self.subscription_url {
            let url = url::Url::parse(sub)
                .map_err(|e| Error::config(format!("invalid subscription_url: {}", e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::config(format!(
                    "subscription_url must be http(s), got {}",
                    url.scheme()
                )));
            }
        }

        url::Url::parse(&self.health_check_url)
            .map_err(|e| Error::config(format!("invalid health_check_url: {}", e)))?;

        Ok(())
    }
}

/// Extra variables exported alongside the proxy settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraEnv {
    pub hf_endpoint: Option<String>,
    pub hf_token: Option<String>,
    pub civitai_token: Option<String>,
}

/// Everything the orchestrator needs for one run
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub proxy: ProxyConfig,
    pub turbo_script: PathBuf,
    pub extras: ExtraEnv,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            proxy: ProxyConfig::default(),
            turbo_script: PathBuf::from(DEFAULT_TURBO_SCRIPT),
            extras: ExtraEnv::default(),
        }
    }
}

/// `manifest.yaml` layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub proxy_port: Option<u16>,
    pub api_port: Option<u16>,
    pub mihomo_version: Option<String>,
    pub install_dir: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub download_base: Option<String>,
    pub geodata_mirrors: Option<Vec<String>>,
    pub health_check_url: Option<String>,
    pub require_checksum: bool,
    pub checksums: HashMap<String, HashMap<String, String>>,
    pub turbo_script: Option<PathBuf>,
    pub huggingface_mirror: Option<String>,
}

/// `secrets.yaml` layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Secrets {
    pub subscription_url: Option<String>,
    pub api_secret: Option<String>,
    pub api_keys: ApiKeys,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub hf_api_token: Option<String>,
    pub civitai_api_token: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl NetworkSettings {
    /// Load settings from the manifest and secrets files
    pub fn load(manifest: &Path, secrets: &Path) -> Result<Self> {
        let manifest: Manifest = read_yaml_or_default(manifest)?;
        let secrets: Secrets = read_yaml_or_default(secrets)?;
        Self::from_parts(manifest, secrets)
    }

    /// Merge parsed files over the defaults and validate the result
    pub fn from_parts(manifest: Manifest, secrets: Secrets) -> Result<Self> {
        let defaults = ProxyConfig::default();

        let version = match manifest.mihomo_version {
            Some(ref v) => v.parse()?,
            None => defaults.version,
        };

        let proxy = ProxyConfig {
            subscription_url: non_empty(secrets.subscription_url),
            proxy_port: manifest.proxy_port.unwrap_or(defaults.proxy_port),
            api_port: manifest.api_port.unwrap_or(defaults.api_port),
            api_secret: non_empty(secrets.api_secret),
            version,
            install_dir: manifest.install_dir.unwrap_or(defaults.install_dir),
            config_dir: manifest.config_dir.unwrap_or(defaults.config_dir),
            backup_dir: manifest.backup_dir,
            download_base: manifest.download_base.unwrap_or(defaults.download_base),
            geodata_mirrors: manifest
                .geodata_mirrors
                .filter(|m| !m.is_empty())
                .unwrap_or(defaults.geodata_mirrors),
            health_check_url: manifest.health_check_url.unwrap_or(defaults.health_check_url),
            require_checksum: manifest.require_checksum,
            pinned_checksums: manifest.checksums,
            timings: Timings::default(),
        };
        proxy.validate()?;

        Ok(NetworkSettings {
            proxy,
            turbo_script: manifest
                .turbo_script
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TURBO_SCRIPT)),
            extras: ExtraEnv {
                hf_endpoint: non_empty(manifest.huggingface_mirror),
                hf_token: non_empty(secrets.api_keys.hf_api_token),
                civitai_token: non_empty(secrets.api_keys.civitai_api_token),
            },
        })
    }
}

fn read_yaml_or_default<T>(path: &Path) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if !path.exists() {
        debug!("{} not found, using defaults", path.display());
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }

    serde_yaml::from_str(&content)
        .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.proxy_port, 7890);
        assert_eq!(config.api_port, 9090);
        assert_eq!(config.version.to_string(), DEFAULT_VERSION);
        assert_eq!(config.proxy_url(), "http://127.0.0.1:7890");
        assert_eq!(config.api_url(), "http://127.0.0.1:9090");
        assert_eq!(config.binary_path(), PathBuf::from("/usr/local/bin/mihomo"));
        assert_eq!(config.pid_file(), PathBuf::from("/etc/mihomo/mihomo.pid"));
        assert!(!config.has_subscription());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ports_must_be_disjoint() {
        let config = ProxyConfig {
            api_port: 7890,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_subscription_must_be_http() {
        let config = ProxyConfig {
            subscription_url: Some("ftp://example.com/sub".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_parts() {
        let manifest: Manifest = serde_yaml::from_str(
            r#"
proxy_port: 17890
api_port: 19090
mihomo_version: v1.18.10
config_dir: /tmp/mihomo
backup_dir: /root/autodl-fs/mihomo
huggingface_mirror: https://hf-mirror.com
checksums:
  v1.18.10:
    amd64: "00ff"
"#,
        )
        .unwrap();
        let secrets: Secrets = serde_yaml::from_str(
            r#"
subscription_url: "https://sub.example.com/api/v1/client/subscribe?token=abc"
api_secret: "  "
api_keys:
  hf_api_token: hf_xxx
"#,
        )
        .unwrap();

        let settings = NetworkSettings::from_parts(manifest, secrets).unwrap();
        let proxy = &settings.proxy;
        assert_eq!(proxy.proxy_port, 17890);
        assert_eq!(proxy.api_port, 19090);
        assert_eq!(proxy.version, EngineVersion::new(1, 18, 10));
        assert_eq!(proxy.config_dir, PathBuf::from("/tmp/mihomo"));
        assert_eq!(proxy.backup_dir, Some(PathBuf::from("/root/autodl-fs/mihomo")));
        assert!(proxy.has_subscription());
        assert_eq!(proxy.api_secret, None);
        assert_eq!(proxy.pinned_checksums["v1.18.10"]["amd64"], "00ff");
        assert_eq!(settings.extras.hf_endpoint.as_deref(), Some("https://hf-mirror.com"));
        assert_eq!(settings.extras.hf_token.as_deref(), Some("hf_xxx"));
        assert_eq!(settings.extras.civitai_token, None);
    }

    #[test]
    fn test_load_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let settings = NetworkSettings::load(
            &dir.path().join("manifest.yaml"),
            &dir.path().join("secrets.yaml"),
        )
        .unwrap();
        assert!(!settings.proxy.has_subscription());
        assert_eq!(settings.turbo_script, PathBuf::from(DEFAULT_TURBO_SCRIPT));
    }

    #[test]
    fn test_load_malformed_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("manifest.yaml");
        std::fs::write(&manifest, "proxy_port: [not, a, port]").unwrap();
        let result = NetworkSettings::load(&manifest, &dir.path().join("secrets.yaml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
