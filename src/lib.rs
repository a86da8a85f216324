//! Origin Guard Library
//!
//! TLS origin protection for servers that sit behind a CDN.
//!
//! # Features
//!
//! - **SNI-bound certificates**: a certificate is only served for the names it covers;
//!   a missing or unknown SNI fails the handshake
//! - **Edge IP allowlist**: peers outside the CDN's published ranges are refused,
//!   inside the handshake or at accept time
//! - **Origin-pull mTLS**: optionally require a client certificate issued by the CDN
//! - **Host/SNI binding**: HTTP requests must address the name the connection negotiated
//!
//! # Handshake refusals
//!
//! Every refusal produces the same fatal TLS alert, whichever check failed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gate;
pub mod ranges;
pub mod server;
pub mod tls;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to initialise logging: {e}")))
}
