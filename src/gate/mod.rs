//! Peer admission.
//!
//! - [`ip`]: [`IpGate`], allowlist membership with refresh-on-miss
//! - [`accept`]: [`AcceptFilter`], turning peers away before TLS when configured to
//! - [`connection`]: [`ConnectionGate`], the filter, selector and TLS policy composed

pub mod accept;
pub mod connection;
pub mod ip;

pub use accept::{AcceptFilter, DecoyStream, GatedStream};
pub use connection::ConnectionGate;
pub use ip::IpGate;
