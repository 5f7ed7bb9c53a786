//! Environment handed to downstream tools
//!
//! Nothing here touches the process-wide environment. Callers apply the
//! value to the commands they spawn, or print it for a shell to `eval`.

use std::collections::BTreeMap;
use tokio::process::Command;

/// Proxy variables, both spellings
pub const PROXY_KEYS: &[&str] = &["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"];

pub const NO_PROXY_KEYS: &[&str] = &["no_proxy", "NO_PROXY"];

/// Destinations that must bypass the local proxy
pub const DEFAULT_NO_PROXY: &str = "localhost,127.0.0.1,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16";

/// Keys printed first by `export_shell`, in this order
const EXPORT_ORDER: &[&str] = &[
    "http_proxy",
    "https_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "no_proxy",
    "NO_PROXY",
    "REQUESTS_CA_BUNDLE",
    "SSL_CERT_FILE",
    "HF_ENDPOINT",
    "HF_TOKEN",
    "CIVITAI_API_TOKEN",
];

/// A set of environment variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyEnvironment {
    vars: BTreeMap<String, String>,
}

impl ProxyEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        ProxyEnvironment {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Point every proxy variable at `proxy_url` and set the bypass list
    pub fn set_proxy(&mut self, proxy_url: &str) {
        for key in PROXY_KEYS {
            self.set(*key, proxy_url);
        }
        for key in NO_PROXY_KEYS {
            self.set(*key, DEFAULT_NO_PROXY);
        }
    }

    /// The HTTP proxy this environment routes through, if any
    pub fn proxy_url(&self) -> Option<&str> {
        ["http_proxy", "HTTP_PROXY", "https_proxy", "HTTPS_PROXY"]
            .iter()
            .filter_map(|k| self.get(k))
            .find(|v| !v.is_empty())
    }

    /// Add the variables to a command about to be spawned
    pub fn apply_to(&self, cmd: &mut Command) {
        cmd.envs(&self.vars);
    }

    /// `export KEY='value'` lines suitable for `eval`
    pub fn export_shell(&self) -> String {
        let mut out = String::new();
        for key in EXPORT_ORDER {
            if let Some(value) = self.vars.get(*key) {
                out.push_str(&export_line(key, value));
            }
        }
        for (key, value) in &self.vars {
            if !EXPORT_ORDER.contains(&key.as_str()) {
                out.push_str(&export_line(key, value));
            }
        }
        out
    }
}

fn export_line(key: &str, value: &str) -> String {
    format!("export {}='{}'\n", key, value.replace('\'', "'\\''"))
}
