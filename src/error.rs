//! Error types for Origin Guard

use std::io;

use thiserror::Error;

/// Result type alias for Origin Guard
pub type Result<T> = std::result::Result<T, Error>;

/// Origin Guard errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Certificate, key or CA bundle could not be loaded
    #[error("TLS error: {0}")]
    Tls(String),

    /// Edge range refresh failed; the previously published set stays in use
    #[error("Edge range fetch failed: {0}")]
    RangeFetch(String),

    /// First-ever edge range fetch failed; the gate has no baseline allowlist
    #[error("Edge range fetch failed at bootstrap: {0}")]
    RangeBootstrap(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether this error must stop the process instead of being recovered locally.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RangeBootstrap(_) | Self::Config(_) | Self::Tls(_))
    }
}
