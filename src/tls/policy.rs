//! rustls server configuration for the gate.
//!
//! The handshake is driven through a lazy acceptor: the ClientHello is read
//! first, [`CertSelector`] decides, and only then is a `ServerConfig` chosen.
//! Every refusal maps to one shared configuration whose resolver never yields
//! a certificate, so rustls aborts with the same alert for every reason.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, version};
use tracing::debug;

use crate::tls::mtls::OriginPullAuthority;
use crate::tls::selector::Refusal;
use crate::{Error, Result};

/// Base TLS settings shared by every connection.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    /// Template with the refusing resolver installed.
    refusing: Arc<ServerConfig>,
    client_auth: bool,
}

impl TlsPolicy {
    /// TLS 1.3 only, ALPN `h2` then `http/1.1`, client certificates required
    /// when `origin_pull` is set.
    pub fn new(
        provider: Arc<CryptoProvider>,
        origin_pull: Option<&OriginPullAuthority>,
    ) -> Result<Self> {
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&[&version::TLS13])
            .map_err(|e| Error::Tls(format!("TLS 1.3 unsupported by provider: {e}")))?;

        let builder = match origin_pull {
            Some(authority) => {
                builder.with_client_cert_verifier(authority.client_verifier(provider)?)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder.with_cert_resolver(Arc::new(Refuse));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        debug!(client_auth = origin_pull.is_some(), "TLS policy built");

        Ok(Self {
            refusing: Arc::new(config),
            client_auth: origin_pull.is_some(),
        })
    }

    /// Whether client certificates are required.
    pub fn requires_client_cert(&self) -> bool {
        self.client_auth
    }

    /// The configuration to finish a handshake with, given the selection outcome.
    pub fn config_for(
        &self,
        selection: std::result::Result<Arc<CertifiedKey>, Refusal>,
    ) -> Arc<ServerConfig> {
        match selection {
            Ok(key) => {
                let mut config = ServerConfig::clone(&self.refusing);
                config.cert_resolver = Arc::new(Selected(key));
                Arc::new(config)
            }
            Err(_) => Arc::clone(&self.refusing),
        }
    }
}

/// Serves the one certificate chosen for this connection.
#[derive(Debug)]
struct Selected(Arc<CertifiedKey>);

impl ResolvesServerCert for Selected {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Never yields a certificate; rustls aborts the handshake with a fatal alert.
#[derive(Debug)]
struct Refuse;

impl ResolvesServerCert for Refuse {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}
