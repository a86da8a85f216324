//! The process-wide edge range cache.
//!
//! Reads are lock-free loads of the last published [`CidrSet`]. Refreshes are
//! serialized behind one async mutex and throttled: a fetch is attempted at most
//! once per `refresh_interval`, whether or not the previous attempt succeeded.
//!
//! # Failure policy
//!
//! | Published set | Fetch fails | Result |
//! |---|---|---|
//! | absent | yes | [`Error::RangeBootstrap`], the caller must stop |
//! | present | yes | stale set returned, failure logged |
//! | any | no | new set swapped in |

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::ranges::cidr::CidrSet;
use crate::ranges::source::RangeSource;
use crate::{Error, Result};

/// Default minimum spacing between two fetch attempts.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Cache of the CDN's published edge prefixes.
pub struct RangeCache {
    source: Arc<dyn RangeSource>,
    refresh_interval: Duration,
    /// Last published set. Never goes back to `None` once stored.
    published: ArcSwapOption<CidrSet>,
    /// Time of the last fetch attempt; the lock also serializes fetches.
    last_attempt: Mutex<Option<Instant>>,
}

impl RangeCache {
    /// Create an empty cache; nothing is fetched until [`RangeCache::refresh`].
    pub fn new(source: Arc<dyn RangeSource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            refresh_interval,
            published: ArcSwapOption::empty(),
            last_attempt: Mutex::new(None),
        }
    }

    /// The last published set, without blocking.
    pub fn current(&self) -> Option<Arc<CidrSet>> {
        self.published.load_full()
    }

    /// Refresh the published set if the throttle window has elapsed.
    ///
    /// Returns the set in effect afterwards: the fresh one on success, the
    /// unchanged one when throttled or when a fetch after bootstrap fails.
    /// Only a failure with nothing ever published is an error.
    pub async fn refresh(&self) -> Result<Option<Arc<CidrSet>>> {
        let mut last_attempt = self.last_attempt.lock().await;

        if let Some(at) = *last_attempt {
            if at.elapsed() < self.refresh_interval {
                // another caller may have refreshed while we waited
                return Ok(self.current());
            }
        }
        *last_attempt = Some(Instant::now());

        match self.source.fetch().await {
            Ok(set) => {
                let set = Arc::new(set);
                info!(prefixes = set.len(), "Edge ranges updated");
                self.published.store(Some(Arc::clone(&set)));
                Ok(Some(set))
            }
            Err(e) => match self.current() {
                Some(stale) => {
                    warn!(
                        error = %e,
                        prefixes = stale.len(),
                        "Edge range update failed, keeping previous ranges"
                    );
                    Ok(Some(stale))
                }
                None => {
                    error!(error = %e, "Edge range fetch failed with no ranges ever loaded");
                    Err(Error::RangeBootstrap(e.to_string()))
                }
            },
        }
    }

    /// Perform the first fetch, failing if no set can be published.
    pub async fn bootstrap(&self) -> Result<Arc<CidrSet>> {
        self.refresh().await?.ok_or_else(|| {
            Error::RangeBootstrap("throttled before any ranges were published".to_string())
        })
    }
}

impl std::fmt::Debug for RangeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeCache")
            .field("refresh_interval", &self.refresh_interval)
            .field("published", &self.current().map(|set| set.len()))
            .finish_non_exhaustive()
    }
}
