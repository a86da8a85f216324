//! TLS side of the gate.
//!
//! # Handshake flow
//!
//! ```text
//! ClientHello read (tokio-rustls LazyConfigAcceptor)
//!   → ClientHelloInfo { SNI, signature schemes, peer }
//!   → CertSelector::select  (name first, then optional IpGate)
//!   → TlsPolicy::config_for (selected cert, or the shared refusing config)
//!   → rustls finishes the handshake, verifying the origin-pull client cert if configured
//! ```
//!
//! - [`certs`]: [`CertificateEntry`] loading and SAN matching
//! - [`selector`]: [`CertSelector`] and [`Refusal`]
//! - [`mtls`]: [`OriginPullAuthority`]
//! - [`policy`]: [`TlsPolicy`], rustls `ServerConfig` construction

pub mod certs;
pub mod mtls;
pub mod policy;
pub mod selector;

pub use certs::CertificateEntry;
pub use mtls::OriginPullAuthority;
pub use policy::TlsPolicy;
pub use selector::{CertSelector, ClientHelloInfo, Refusal};
