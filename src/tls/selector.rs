//! SNI-driven certificate selection.
//!
//! # Policy
//!
//! 1. No SNI → [`Refusal::MissingServerName`]. There is no default certificate.
//! 2. First configured entry whose leaf serves the name with a signature scheme
//!    the client offers wins; none → [`Refusal::MismatchedServerName`].
//! 3. Only after a name match, and only when an [`IpGate`] is attached, the peer
//!    must be inside the edge allowlist; otherwise [`Refusal::NotAllowedOrigin`].
//!
//! Every refusal aborts the handshake the same way (see
//! [`crate::tls::policy::TlsPolicy`]), so a scanner cannot tell which names exist.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::SignatureScheme;
use rustls::server::ClientHello;
use rustls::sign::CertifiedKey;
use thiserror::Error;

use crate::gate::IpGate;
use crate::tls::certs::CertificateEntry;

/// Why a handshake was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The client sent no Server Name Indication
    #[error("missing server name")]
    MissingServerName,
    /// No configured certificate serves the requested name
    #[error("mismatched server name")]
    MismatchedServerName,
    /// The peer is not inside the CDN edge ranges
    #[error("not an allowed origin")]
    NotAllowedOrigin,
}

/// The parts of a ClientHello the selector looks at.
#[derive(Debug, Clone)]
pub struct ClientHelloInfo {
    /// SNI as sent; `None` or empty when absent.
    pub server_name: Option<String>,
    /// Signature schemes the client can verify.
    pub signature_schemes: Vec<SignatureScheme>,
    /// Transport peer address.
    pub remote_addr: SocketAddr,
}

impl ClientHelloInfo {
    /// Capture the selector inputs from a rustls ClientHello.
    pub fn from_client_hello(hello: &ClientHello<'_>, remote_addr: SocketAddr) -> Self {
        Self {
            server_name: hello.server_name().map(str::to_owned),
            signature_schemes: hello.signature_schemes().to_vec(),
            remote_addr,
        }
    }
}

/// Picks the certificate for a ClientHello or refuses.
#[derive(Debug, Clone)]
pub struct CertSelector {
    entries: Arc<[CertificateEntry]>,
    ip_gate: Option<IpGate>,
}

impl CertSelector {
    /// Selector over `entries` in configured order. `ip_gate` enables the
    /// in-handshake origin check.
    pub fn new(entries: Vec<CertificateEntry>, ip_gate: Option<IpGate>) -> Self {
        Self {
            entries: entries.into(),
            ip_gate,
        }
    }

    /// Whether the in-handshake origin check is active.
    pub fn filters_ips(&self) -> bool {
        self.ip_gate.is_some()
    }

    /// Configured entries, in selection order.
    pub fn entries(&self) -> &[CertificateEntry] {
        &self.entries
    }

    /// Apply the name steps of the policy only.
    pub fn match_name(&self, hello: &ClientHelloInfo) -> Result<&CertificateEntry, Refusal> {
        let name = hello
            .server_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(Refusal::MissingServerName)?;

        self.entries
            .iter()
            .find(|entry| entry.supports(name, &hello.signature_schemes))
            .ok_or(Refusal::MismatchedServerName)
    }

    /// Apply the full policy.
    ///
    /// Awaits only when the origin check misses and triggers a range refresh.
    pub async fn select(&self, hello: &ClientHelloInfo) -> Result<Arc<CertifiedKey>, Refusal> {
        let entry = self.match_name(hello)?;

        if let Some(gate) = &self.ip_gate {
            if !gate.is_allowed(hello.remote_addr).await {
                return Err(Refusal::NotAllowedOrigin);
            }
        }

        Ok(Arc::clone(entry.certified_key()))
    }
}
