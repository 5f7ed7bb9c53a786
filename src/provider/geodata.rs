//! Geodata pre-population
//!
//! The engine downloads its GeoIP/GeoSite databases on first start, from
//! hosts that are often unreachable before the proxy is up. Fetching them
//! here, through our mirrors, avoids a slow or failed first start.

use crate::common::fs::{has_min_size, write_atomic};
use crate::common::http::{build_client, get_bytes, Route};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Database files the engine looks for in its config directory
pub const GEODATA_FILES: &[&str] = &["geoip.metadb", "geosite.dat", "geoip.dat"];

/// Smallest body accepted as a database
pub const MIN_GEODATA_SIZE: usize = 64 * 1024;

/// What `ensure` did per file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoDataReport {
    pub present: Vec<String>,
    pub downloaded: Vec<String>,
    pub missing: Vec<String>,
}

impl GeoDataReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Best-effort mirror downloader for geodata files
pub struct GeoDataFetcher {
    mirrors: Vec<String>,
    files: Vec<String>,
    route: Route,
    timeout: Duration,
    min_size: usize,
}

impl GeoDataFetcher {
    pub fn new(mirrors: &[String], route: Route, timeout: Duration) -> Self {
        GeoDataFetcher {
            mirrors: mirrors.iter().map(|m| m.trim_end_matches('/').to_string()).collect(),
            files: GEODATA_FILES.iter().map(|f| f.to_string()).collect(),
            route,
            timeout,
            min_size: MIN_GEODATA_SIZE,
        }
    }

    pub fn with_files(mut self, files: &[&str]) -> Self {
        self.files = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Make sure every geodata file exists in `config_dir`. Never fails.
    pub async fn ensure(&self, config_dir: &Path) -> GeoDataReport {
        let mut report = GeoDataReport::default();

        let client = match build_client(&self.route, self.timeout, None) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("Geodata client unavailable: {}", e);
                None
            }
        };

        for file in &self.files {
            let dest = config_dir.join(file);
            if has_min_size(&dest, 1).await {
                debug!("Geodata {} present", file);
                report.present.push(file.clone());
                continue;
            }

            let fetched = match client {
                Some(ref client) => self.fetch_one(client, file, &dest).await,
                None => false,
            };

            if fetched {
                report.downloaded.push(file.clone());
            } else {
                warn!("Geodata {} unavailable from all mirrors; engine will resolve it itself", file);
                report.missing.push(file.clone());
            }
        }

        report
    }

    async fn fetch_one(&self, client: &reqwest::Client, file: &str, dest: &Path) -> bool {
        for mirror in &self.mirrors {
            let url = format!("{}/{}", mirror, file);
            match get_bytes(client, &url).await {
                Ok(body) if body.len() >= self.min_size => match write_atomic(dest, &body).await {
                    Ok(()) => {
                        info!("Geodata {} downloaded from {} ({} bytes)", file, mirror, body.len());
                        return true;
                    }
                    Err(e) => {
                        warn!("Failed to write {}: {}", dest.display(), e);
                        return false;
                    }
                },
                Ok(body) => debug!("{}: body too small ({} bytes)", url, body.len()),
                Err(e) => debug!("{}: {}", url, e),
            }
        }
        false
    }
}
