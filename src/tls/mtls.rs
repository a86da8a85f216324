//! Authenticated origin pulls.
//!
//! When an origin-pull CA is configured, the CDN must present a client
//! certificate signed by it during the same handshake the selector serves.
//! Verification is left entirely to rustls' WebPKI verifier.

use std::path::Path;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use tracing::info;

use crate::tls::certs::load_certs;
use crate::{Error, Result};

/// Trust anchors for the CDN's origin-pull client certificates.
#[derive(Debug, Clone)]
pub struct OriginPullAuthority {
    roots: Arc<RootCertStore>,
}

impl OriginPullAuthority {
    /// Load a PEM bundle of one or more CA certificates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let authority = Self::from_der(load_certs(path)?)?;
        info!(
            ca_file = %path.display(),
            cert_count = authority.roots.len(),
            "Loaded origin-pull CA"
        );
        Ok(authority)
    }

    /// Build from decoded CA certificates.
    pub fn from_der(certs: Vec<CertificateDer<'static>>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("Failed to add origin-pull CA cert: {e}")))?;
        }
        if roots.is_empty() {
            return Err(Error::Tls("origin-pull CA bundle is empty".to_string()));
        }
        Ok(Self {
            roots: Arc::new(roots),
        })
    }

    /// A verifier that requires and verifies a client certificate.
    pub fn client_verifier(
        &self,
        provider: Arc<CryptoProvider>,
    ) -> Result<Arc<dyn ClientCertVerifier>> {
        WebPkiClientVerifier::builder_with_provider(Arc::clone(&self.roots), provider)
            .build()
            .map_err(|e| Error::Tls(format!("Failed to build client verifier: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use rcgen::ExtendedKeyUsagePurpose;

    use super::*;
    use crate::tls::certs::tests::{mint, provider};

    #[test]
    fn loads_pem_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let ca = mint(&["origin-pull.example"], ExtendedKeyUsagePurpose::ClientAuth);
        let path = dir.path().join("origin-pull-ca.pem");
        fs::write(&path, &ca.cert_pem).unwrap();

        let authority = OriginPullAuthority::load(&path).unwrap();
        assert!(authority.client_verifier(Arc::new(provider())).is_ok());
    }

    #[test]
    fn empty_bundle_is_rejected() {
        assert!(OriginPullAuthority::from_der(Vec::new()).is_err());
    }

    #[test]
    fn missing_file_is_rejected() {
        assert!(OriginPullAuthority::load("/nonexistent/ca.pem").is_err());
    }
}
