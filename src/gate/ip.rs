//! Edge allowlist membership with refresh-on-miss.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::{error, trace};

use crate::ranges::RangeCache;

/// Answers whether a peer address belongs to the CDN edge.
#[derive(Debug, Clone)]
pub struct IpGate {
    cache: Arc<RangeCache>,
}

impl IpGate {
    /// Create a gate over a shared range cache.
    pub fn new(cache: Arc<RangeCache>) -> Self {
        Self { cache }
    }

    /// The underlying cache.
    pub fn cache(&self) -> &Arc<RangeCache> {
        &self.cache
    }

    /// Whether the peer's IP is inside the current allowlist. The port is ignored.
    pub async fn is_allowed(&self, remote: SocketAddr) -> bool {
        self.is_ip_allowed(remote.ip()).await
    }

    /// Test against the published set, then once more after a refresh.
    ///
    /// The refresh is throttled by the cache, so a flood of misses costs at
    /// most one fetch per window.
    pub async fn is_ip_allowed(&self, ip: IpAddr) -> bool {
        if self.cache.current().is_some_and(|set| set.contains(ip)) {
            return true;
        }

        // maybe a newly added edge range
        let allowed = match self.cache.refresh().await {
            Ok(Some(set)) => set.contains(ip),
            Ok(None) => false,
            Err(e) => {
                error!(error = %e, "Edge ranges unavailable, denying");
                false
            }
        };
        if allowed {
            trace!("Peer admitted after refresh");
        }
        allowed
    }
}
