//! Subscription fetcher with a strategy chain
//!
//! Some providers gate the document on the client's User-Agent, and either
//! network path may be broken on a given instance. Each (User-Agent, route)
//! pair is a `FetchStrategy`; the chain is tried in order and the first
//! plausible document wins. Once a document has been obtained, a failed
//! refresh falls back to the copy already on disk.

use super::SubscriptionInfo;
use crate::common::fs::{has_min_size, write_atomic};
use crate::common::http::{build_client, Route};
use crate::config::{patch_config, ProxyConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Smallest body accepted as a routing document; error pages are shorter
pub const MIN_CONFIG_SIZE: usize = 256;

/// A fetched subscription body
#[derive(Debug, Clone)]
pub struct Payload {
    pub body: Vec<u8>,
    pub info: Option<SubscriptionInfo>,
}

/// One way of fetching the subscription
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    /// Human-readable description for logs
    fn describe(&self) -> String;

    /// Fetch the document at `url`
    async fn fetch(&self, url: &str) -> Result<Payload>;
}

/// Plain HTTP GET with a fixed User-Agent over a fixed route
pub struct HttpStrategy {
    user_agent: String,
    route: Route,
    timeout: Duration,
}

impl HttpStrategy {
    pub fn new(user_agent: impl Into<String>, route: Route, timeout: Duration) -> Self {
        HttpStrategy {
            user_agent: user_agent.into(),
            route,
            timeout,
        }
    }
}

#[async_trait]
impl FetchStrategy for HttpStrategy {
    fn describe(&self) -> String {
        format!("UA '{}' {}", self.user_agent, self.route)
    }

    async fn fetch(&self, url: &str) -> Result<Payload> {
        let client = build_client(&self.route, self.timeout, Some(&self.user_agent))?;

        let resp = client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::transport(format!("subscription returned {}", status)));
        }

        let info = resp
            .headers()
            .get("subscription-userinfo")
            .and_then(|v| v.to_str().ok())
            .and_then(SubscriptionInfo::parse);

        let body = resp.bytes().await?.to_vec();
        Ok(Payload { body, info })
    }
}

/// User-Agents to try, most specific first
///
/// A mihomo-flavoured agent makes many providers return documents using
/// mihomo-only protocols; the generic clash agents are fallbacks for
/// providers that only recognise those.
pub fn default_user_agents(config: &ProxyConfig) -> Vec<String> {
    vec![
        format!("clash.meta/{}", config.version),
        format!("mihomo/{}", config.version),
        "clash-verge/v2.0.0".to_string(),
        "ClashforWindows/0.20.39".to_string(),
    ]
}

/// Outcome of a successful `fetch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A new document was downloaded
    Fresh {
        strategy: String,
        info: Option<SubscriptionInfo>,
    },
    /// Every strategy failed; the document already on disk was kept
    Stale,
}

impl FetchOutcome {
    pub fn is_fresh(&self) -> bool {
        matches!(self, FetchOutcome::Fresh { .. })
    }
}

/// Acquires and patches the routing document
pub struct ConfigAcquirer {
    config: ProxyConfig,
    strategies: Vec<Box<dyn FetchStrategy>>,
    min_size: usize,
}

impl ConfigAcquirer {
    /// Default chain: every User-Agent, via bootstrap first (when known), then direct
    pub fn new(config: &ProxyConfig, bootstrap_proxy: Option<&str>) -> Self {
        let timeout = config.timings.fetch_timeout;
        let mut routes = Vec::new();
        if let Route::Proxy(url) = Route::from_proxy(bootstrap_proxy) {
            routes.push(Route::Proxy(url));
        }
        routes.push(Route::Direct);

        let mut strategies: Vec<Box<dyn FetchStrategy>> = Vec::new();
        for ua in default_user_agents(config) {
            for route in &routes {
                strategies.push(Box::new(HttpStrategy::new(ua.clone(), route.clone(), timeout)));
            }
        }

        Self::with_strategies(config, strategies)
    }

    /// Use an explicit strategy chain
    pub fn with_strategies(config: &ProxyConfig, strategies: Vec<Box<dyn FetchStrategy>>) -> Self {
        ConfigAcquirer {
            config: config.clone(),
            strategies,
            min_size: MIN_CONFIG_SIZE,
        }
    }

    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Strategy descriptions in try order
    pub fn strategies(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.describe()).collect()
    }

    /// Fetch the subscription into `dest`, reusing `dest` if every attempt fails
    pub async fn fetch(&self, dest: &Path) -> Result<FetchOutcome> {
        if let Some(url) = self.subscription_url() {
            info!("Updating subscription ({} strategies)", self.strategies.len());

            for (i, strategy) in self.strategies.iter().enumerate() {
                let name = strategy.describe();
                match strategy.fetch(url).await {
                    Ok(payload) if payload.body.len() >= self.min_size => {
                        write_atomic(dest, &payload.body).await?;
                        info!(
                            "Subscription fetched with {} (attempt {}, {} bytes)",
                            name,
                            i + 1,
                            payload.body.len()
                        );
                        if let Some(ref info) = payload.info {
                            log_subscription_info(info);
                        }
                        self.patch(dest).await;
                        return Ok(FetchOutcome::Fresh {
                            strategy: name,
                            info: payload.info,
                        });
                    }
                    Ok(payload) => {
                        debug!("{}: body too small ({} bytes), rejected", name, payload.body.len());
                    }
                    Err(e) if e.is_recoverable() => {
                        debug!("{}: {}", name, e);
                    }
                    Err(e) => {
                        warn!("{}: {}", name, e);
                    }
                }
            }

            warn!("All {} subscription strategies failed", self.strategies.len());
        } else {
            info!("No subscription URL configured");
        }

        if has_min_size(dest, 1).await {
            warn!("Reusing existing routing document {} (degraded)", dest.display());
            self.patch(dest).await;
            return Ok(FetchOutcome::Stale);
        }

        Err(Error::transport(
            "subscription unavailable and no previous routing document exists",
        ))
    }

    /// Patch `file` in place; failures keep the unpatched document
    pub async fn patch(&self, file: &Path) {
        match patch_config(&self.config, file).await {
            Ok(()) => debug!("Patched routing document {}", file.display()),
            Err(e) => warn!("Failed to patch routing document (using it unpatched): {}", e),
        }
    }

    fn subscription_url(&self) -> Option<&str> {
        self.config
            .subscription_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

fn log_subscription_info(info: &SubscriptionInfo) {
    const GIB: f64 = (1u64 << 30) as f64;
    let expires = info
        .expires_at()
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "never".to_string());
    info!(
        "Subscription traffic: {:.1} GiB left of {:.1} GiB, expires {}",
        info.remaining() as f64 / GIB,
        info.total as f64 / GIB,
        expires
    );
}
