//! Control API and end-to-end health probe

use crate::common::http::{build_client, Route};
use crate::config::ProxyConfig;
use crate::{Error, Result};
use reqwest::StatusCode;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Talks to the running engine: hot reload over its REST API, and a real
/// request routed through its listener.
#[derive(Debug, Clone)]
pub struct ControlClient {
    api_url: String,
    secret: Option<String>,
    config_file: PathBuf,
    proxy_url: String,
    health_url: String,
    control_timeout: Duration,
    health_timeout: Duration,
}

fn is_ok_status(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::NO_CONTENT
}

impl ControlClient {
    pub fn new(config: &ProxyConfig) -> Self {
        ControlClient {
            api_url: config.api_url(),
            secret: config.api_secret.clone(),
            config_file: config.config_file(),
            proxy_url: config.proxy_url(),
            health_url: config.health_check_url.clone(),
            control_timeout: config.timings.control_timeout,
            health_timeout: config.timings.health_timeout,
        }
    }

    /// `PUT /configs` naming the config file, so the engine re-reads it in place
    pub async fn reload(&self) -> Result<()> {
        let client = build_client(&Route::Direct, self.control_timeout, None)?;
        let url = format!("{}/configs?force=true", self.api_url);
        let body = json!({ "path": self.config_file.to_string_lossy() });

        let mut req = client.put(&url).json(&body);
        if let Some(ref secret) = self.secret {
            req = req.bearer_auth(secret);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if is_ok_status(status) {
            info!("Engine configuration hot-reloaded");
            Ok(())
        } else {
            Err(Error::transport(format!("PUT /configs returned {}", status)))
        }
    }

    /// GET the health endpoint through the proxy
    pub async fn probe(&self) -> Result<()> {
        let client = build_client(&Route::Proxy(self.proxy_url.clone()), self.health_timeout, None)?;
        let resp = client
            .get(&self.health_url)
            .send()
            .await
            .map_err(|e| Error::health_degraded(format!("{}: {}", self.health_url, e)))?;

        let status = resp.status();
        debug!("Health probe {} -> {}", self.health_url, status);
        if is_ok_status(status) {
            Ok(())
        } else {
            Err(Error::health_degraded(format!(
                "{} returned {} through the proxy",
                self.health_url, status
            )))
        }
    }
}
