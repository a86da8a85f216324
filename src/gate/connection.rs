//! The composition point: accept filter, certificate selector and TLS policy.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::Acceptor;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info};

use crate::config::Config;
use crate::gate::{AcceptFilter, IpGate};
use crate::ranges::{HttpRangeSource, RangeCache, RangeSource};
use crate::tls::{CertSelector, CertificateEntry, ClientHelloInfo, OriginPullAuthority, TlsPolicy};
use crate::Result;

/// Decides whether a connection attempt reaches a real certificate and a real
/// byte stream.
///
/// Cheap to clone; one clone per connection task.
#[derive(Debug, Clone)]
pub struct ConnectionGate {
    filter: AcceptFilter,
    selector: CertSelector,
    policy: TlsPolicy,
}

impl ConnectionGate {
    /// Wire a filter, certificates and TLS policy together.
    ///
    /// The selector only gets the filter's IP gate under the in-handshake
    /// strategy, so the allowlist is checked in exactly one place.
    pub fn new(filter: AcceptFilter, entries: Vec<CertificateEntry>, policy: TlsPolicy) -> Self {
        let selector = CertSelector::new(entries, filter.handshake_gate());
        Self {
            filter,
            selector,
            policy,
        }
    }

    /// Build from configuration, fetching edge ranges over HTTP.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let source = HttpRangeSource::from_config(&config.ip_filter)?;
        Self::from_config_with_source(config, Arc::new(source)).await
    }

    /// Build from configuration with an explicit range source.
    ///
    /// When IP filtering is enabled the first range fetch happens here; a
    /// failure is [`crate::Error::RangeBootstrap`] and nothing is served.
    pub async fn from_config_with_source(
        config: &Config,
        source: Arc<dyn RangeSource>,
    ) -> Result<Self> {
        config.validate()?;
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let entries = load_entries(config, &provider)?;

        let origin_pull = config
            .tls
            .origin_pull_ca
            .as_ref()
            .map(OriginPullAuthority::load)
            .transpose()?;
        let policy = TlsPolicy::new(Arc::clone(&provider), origin_pull.as_ref())?;

        let filter = if config.ip_filter.enabled {
            let cache = Arc::new(RangeCache::new(source, config.ip_filter.refresh_interval));
            let ranges = cache.bootstrap().await?;
            info!(
                prefixes = ranges.len(),
                strategy = ?config.ip_filter.strategy,
                "Edge IP filtering enabled"
            );
            AcceptFilter::new(Some(IpGate::new(cache)), config.ip_filter.strategy)
        } else {
            AcceptFilter::open()
        };

        info!(
            certificates = entries.len(),
            origin_pull = origin_pull.is_some(),
            "Connection gate ready"
        );
        Ok(Self::new(filter, entries, policy))
    }

    /// Accept-time filter, for wrapping a listener.
    pub fn filter(&self) -> &AcceptFilter {
        &self.filter
    }

    /// The certificate selector.
    pub fn selector(&self) -> &CertSelector {
        &self.selector
    }

    /// Run the TLS handshake for an admitted connection.
    ///
    /// The ClientHello is read first, the selector decides, then rustls
    /// completes the handshake with the selected certificate or aborts it.
    pub async fn handshake<S>(&self, stream: S, peer: SocketAddr) -> io::Result<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
        let hello = ClientHelloInfo::from_client_hello(&start.client_hello(), peer);

        let selection = self.selector.select(&hello).await;
        if let Err(refusal) = &selection {
            debug!(%refusal, "Handshake refused");
        }

        start.into_stream(self.policy.config_for(selection)).await
    }
}

/// Load every configured certificate, in configuration order.
pub fn load_entries(config: &Config, provider: &CryptoProvider) -> Result<Vec<CertificateEntry>> {
    config
        .tls
        .certificates
        .iter()
        .map(|paths| CertificateEntry::load(&paths.cert, &paths.key, provider))
        .collect()
}
