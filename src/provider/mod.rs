//! Remote inputs of the engine: subscription documents and geodata files

mod fetcher;
mod geodata;

pub use fetcher::{
    default_user_agents, ConfigAcquirer, FetchOutcome, FetchStrategy, HttpStrategy, Payload,
    MIN_CONFIG_SIZE,
};
pub use geodata::{GeoDataFetcher, GeoDataReport, GEODATA_FILES, MIN_GEODATA_SIZE};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription information parsed from headers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// Upload bytes used
    pub upload: u64,
    /// Download bytes used
    pub download: u64,
    /// Total bytes available
    pub total: u64,
    /// Expiration timestamp (Unix epoch), 0 if none
    pub expire: u64,
}

impl SubscriptionInfo {
    /// Parse from Subscription-Userinfo header
    ///
    /// Format: "upload=xxx; download=xxx; total=xxx; expire=xxx"
    pub fn parse(header: &str) -> Option<Self> {
        let mut info = SubscriptionInfo::default();
        let mut seen = false;

        for part in header.split(';') {
            if let Some((key, value)) = part.trim().split_once('=') {
                let value: u64 = value.trim().parse().unwrap_or(0);
                match key.trim().to_lowercase().as_str() {
                    "upload" => info.upload = value,
                    "download" => info.download = value,
                    "total" => info.total = value,
                    "expire" => info.expire = value,
                    _ => continue,
                }
                seen = true;
            }
        }

        seen.then_some(info)
    }

    /// Traffic left in the plan
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.upload.saturating_add(self.download))
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.expire == 0 {
            return None;
        }
        DateTime::<Utc>::from_timestamp(i64::try_from(self.expire).ok()?, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_info_parse() {
        let header = "upload=1234; download=5678; total=10000000; expire=1704067200";
        let info = SubscriptionInfo::parse(header).unwrap();

        assert_eq!(info.upload, 1234);
        assert_eq!(info.download, 5678);
        assert_eq!(info.total, 10000000);
        assert_eq!(info.expire, 1704067200);
        assert_eq!(info.remaining(), 10000000 - 1234 - 5678);
        assert_eq!(info.expires_at().unwrap().to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_subscription_info_garbage() {
        assert!(SubscriptionInfo::parse("nonsense").is_none());
        let info = SubscriptionInfo::parse("total=100; upload=500").unwrap();
        assert_eq!(info.remaining(), 0);
        assert!(info.expires_at().is_none());
    }
}
