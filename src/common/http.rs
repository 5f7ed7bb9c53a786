//! HTTP client construction
//!
//! Every request the supervisor makes picks an explicit route. Ambient
//! `http_proxy` variables are never consulted implicitly.

use crate::{Error, Result};
use std::fmt;
use std::time::Duration;

/// Network path a request takes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Straight to the origin
    Direct,
    /// Through an HTTP proxy (bootstrap acceleration or the engine itself)
    Proxy(String),
}

impl Route {
    /// Route through `proxy` when present, direct otherwise
    pub fn from_proxy(proxy: Option<&str>) -> Self {
        match proxy {
            Some(url) if !url.is_empty() => Route::Proxy(url.to_string()),
            _ => Route::Direct,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct => write!(f, "direct"),
            Route::Proxy(url) => write!(f, "via {}", url),
        }
    }
}

/// Build a client bound to a route
pub fn build_client(route: &Route, timeout: Duration, user_agent: Option<&str>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)));

    if let Some(ua) = user_agent {
        builder = builder.user_agent(ua);
    }

    builder = match route {
        Route::Direct => builder.no_proxy(),
        Route::Proxy(url) => {
            let proxy = reqwest::Proxy::all(url.as_str())
                .map_err(|e| Error::config(format!("invalid proxy url {}: {}", url, e)))?;
            builder.proxy(proxy)
        }
    };

    builder
        .build()
        .map_err(|e| Error::internal(format!("failed to build http client: {}", e)))
}

/// GET a URL and return the body; non-2xx statuses are transport errors
pub async fn get_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::transport(format!("GET {} returned {}", url, status)));
    }
    Ok(resp.bytes().await?.to_vec())
}
