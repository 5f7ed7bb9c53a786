//! Bootstrap acceleration
//!
//! Before our own proxy is up, downloads go through whatever accelerator
//! the host offers: proxy variables already exported by the user, or the
//! ones set by the platform's `network_turbo` script.

use super::env::ProxyEnvironment;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Variables taken from the accelerator; everything else it sets is dropped
pub const TURBO_KEYS: &[&str] = &[
    "http_proxy",
    "https_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "no_proxy",
    "NO_PROXY",
    "REQUESTS_CA_BUNDLE",
    "SSL_CERT_FILE",
];

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Loads the bootstrap environment
#[derive(Debug, Clone)]
pub struct Bootstrap {
    ambient: HashMap<String, String>,
    script: PathBuf,
    own_proxy: Option<String>,
}

impl Bootstrap {
    /// Read the ambient variables of the current process
    pub fn from_process(script: impl Into<PathBuf>) -> Self {
        Self::with_vars(std::env::vars().collect(), script)
    }

    pub fn with_vars(ambient: HashMap<String, String>, script: impl Into<PathBuf>) -> Self {
        Bootstrap {
            ambient,
            script: script.into(),
            own_proxy: None,
        }
    }

    /// Ambient proxy variables naming our own listener are not a bootstrap
    pub fn with_own_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.own_proxy = Some(proxy_url.into());
        self
    }

    pub fn ambient(&self) -> &HashMap<String, String> {
        &self.ambient
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    fn ambient_proxy(&self) -> Option<&str> {
        ["http_proxy", "HTTP_PROXY"]
            .iter()
            .filter_map(|k| self.ambient.get(*k))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .filter(|v| !self.is_own_proxy(v))
    }

    fn is_own_proxy(&self, url: &str) -> bool {
        self.own_proxy
            .as_deref()
            .map_or(false, |own| own.trim_end_matches('/') == url.trim_end_matches('/'))
    }

    /// Bootstrap environment; empty when no accelerator is available
    pub async fn load(&self) -> ProxyEnvironment {
        if let Some(proxy) = self.ambient_proxy() {
            info!("Bootstrap proxy already set in environment: {}", proxy);
            return ProxyEnvironment::from_vars(
                TURBO_KEYS
                    .iter()
                    .filter_map(|k| self.ambient.get(*k).map(|v| (*k, v.clone())))
                    .filter(|(_, v)| !v.is_empty()),
            );
        }

        if !self.script.is_file() {
            debug!("No accelerator script at {}", self.script.display());
            return ProxyEnvironment::new();
        }

        match self.source_script().await {
            Some(env) if env.proxy_url().is_some() => {
                info!("Bootstrap acceleration loaded from {}", self.script.display());
                env
            }
            Some(_) => {
                warn!("{} set no proxy variables", self.script.display());
                ProxyEnvironment::new()
            }
            None => ProxyEnvironment::new(),
        }
    }

    /// Source the script in bash and keep the whitelisted variables
    async fn source_script(&self) -> Option<ProxyEnvironment> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg("source \"$1\" >/dev/null 2>&1 && env")
            .arg("bash")
            .arg(&self.script)
            .envs(&self.ambient)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(SCRIPT_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Failed to run {}: {}", self.script.display(), e);
                return None;
            }
            Err(_) => {
                warn!("{} timed out after {:?}", self.script.display(), SCRIPT_TIMEOUT);
                return None;
            }
        };

        if !output.status.success() {
            warn!("{} exited with {}", self.script.display(), output.status);
            return None;
        }

        Some(parse_env_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Keep whitelisted `KEY=value` lines of `env` output
fn parse_env_output(text: &str) -> ProxyEnvironment {
    ProxyEnvironment::from_vars(text.lines().filter_map(|line| {
        let (key, value) = line.split_once('=')?;
        (TURBO_KEYS.contains(&key) && !value.is_empty()).then(|| (key.to_string(), value.to_string()))
    }))
}
