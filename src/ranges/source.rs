//! Where edge ranges come from.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::config::IpFilterConfig;
use crate::ranges::cidr::CidrSet;
use crate::{Error, Result};

/// A provider of the CDN's current edge prefixes.
///
/// One call is one complete fetch: both address families, or an error.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Fetch and parse the full edge range list.
    async fn fetch(&self) -> Result<CidrSet>;
}

/// Fetches the IPv4 and IPv6 lists from two fixed HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpRangeSource {
    client: reqwest::Client,
    ipv4_url: String,
    ipv6_url: String,
}

impl HttpRangeSource {
    /// Create a source where every request is bounded by `timeout`.
    pub fn new(
        ipv4_url: impl Into<String>,
        ipv6_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("origin-guard/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            ipv4_url: ipv4_url.into(),
            ipv6_url: ipv6_url.into(),
        })
    }

    /// Build a source from the `ip_filter` configuration block.
    pub fn from_config(config: &IpFilterConfig) -> Result<Self> {
        Self::new(&config.ipv4_url, &config.ipv6_url, config.fetch_timeout)
    }

    async fn fetch_list(&self, url: &str) -> Result<CidrSet> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::RangeFetch(format!("{url}: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::RangeFetch(format!("{url}: {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::RangeFetch(format!("{url}: {e}")))?;

        let set = CidrSet::parse_list(url, &body)?;
        debug!(url, prefixes = set.len(), "Fetched edge ranges");
        Ok(set)
    }
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    async fn fetch(&self) -> Result<CidrSet> {
        let ipv4 = self.fetch_list(&self.ipv4_url).await?;
        let ipv6 = self.fetch_list(&self.ipv6_url).await?;
        Ok(ipv4.chain(ipv6))
    }
}
