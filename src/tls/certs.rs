//! Operator certificates: PEM loading and name compatibility.
//!
//! A [`CertificateEntry`] keeps the rustls [`CertifiedKey`] used for the
//! handshake alongside the DNS names parsed from the leaf's subjectAltName
//! extension, so a ClientHello can be matched without completing a handshake.
//!
//! All certificate and key files are expected in **PEM format**.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::SignatureScheme;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use tracing::{debug, warn};
use x509_parser::extensions::GeneralName;

use crate::{Error, Result};

/// One configured certificate chain, its key, and the names its leaf serves.
#[derive(Debug, Clone)]
pub struct CertificateEntry {
    key: Arc<CertifiedKey>,
    names: Vec<String>,
}

impl CertificateEntry {
    /// Load a chain and private key from PEM files.
    pub fn load(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        provider: &CryptoProvider,
    ) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let chain = load_certs(cert_path)?;
        let key = load_private_key(key_path.as_ref())?;
        let entry = Self::from_der(chain, key, provider)?;

        debug!(
            cert = %cert_path.display(),
            names = ?entry.names,
            "Loaded server certificate"
        );
        Ok(entry)
    }

    /// Build an entry from an already decoded chain (leaf first) and key.
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        provider: &CryptoProvider,
    ) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Tls("certificate chain is empty".to_string()))?;
        let names = leaf_dns_names(leaf)?;
        if names.is_empty() {
            warn!("Certificate has no DNS subjectAltName; it will never be selected");
        }

        let signing_key = provider
            .key_provider
            .load_private_key(key)
            .map_err(|e| Error::Tls(format!("unsupported private key: {e}")))?;

        Ok(Self {
            key: Arc::new(CertifiedKey::new(chain, signing_key)),
            names,
        })
    }

    /// The rustls key material handed to the handshake.
    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.key
    }

    /// DNS names from the leaf's subjectAltName, lowercased.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Whether this entry can serve `server_name` to a client offering `schemes`.
    ///
    /// The name must match a SAN entry and the key must be able to sign with
    /// one of the offered signature schemes.
    pub fn supports(&self, server_name: &str, schemes: &[SignatureScheme]) -> bool {
        self.serves_name(server_name) && self.key.key.choose_scheme(schemes).is_some()
    }

    /// Whether any SAN entry matches `server_name`.
    pub fn serves_name(&self, server_name: &str) -> bool {
        let host = normalize(server_name);
        self.names.iter().any(|pattern| name_matches(pattern, &host))
    }
}

/// Match a SAN pattern against a normalized host name.
///
/// A wildcard is only honoured as the whole leftmost label and covers exactly
/// one label: `*.example.com` matches `a.example.com`, not `example.com` nor
/// `a.b.example.com`.
pub fn name_matches(pattern: &str, host: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && !suffix.is_empty() && rest == suffix,
            None => false,
        };
    }
    pattern == host
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn leaf_dns_names(leaf: &CertificateDer<'_>) -> Result<Vec<String>> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| Error::Tls(format!("cannot parse leaf certificate: {e}")))?;

    let Some(san) = cert
        .subject_alternative_name()
        .map_err(|e| Error::Tls(format!("invalid subjectAltName: {e}")))?
    else {
        return Ok(Vec::new());
    };

    Ok(san
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(normalize(dns)),
            _ => None,
        })
        .collect())
}

/// Load all certificates from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::Tls(format!(
                "Failed to parse certs from '{}': {e}",
                path.display()
            ))
        })?;

    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| {
            Error::Tls(format!(
                "Failed to parse private key from '{}': {e}",
                path.display()
            ))
        })?
        .ok_or_else(|| Error::Tls(format!("No private key found in '{}'", path.display())))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Tls(format!("Cannot read '{}': {e}", path.display())))
}
