//! Configuration management

use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::ranges::DEFAULT_REFRESH_INTERVAL;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Certificates and origin-pull CA
    pub tls: TlsConfig,
    /// Edge IP allowlist
    pub ip_filter: IpFilterConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Upper bound on a TLS handshake, including certificate selection
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Upper bound on reading HTTP/1 request headers
    #[serde(with = "humantime_serde")]
    pub header_read_timeout: Duration,
    /// Longest a read may stall while a request is being served
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Longest a write may stall
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Longest a connection may sit with no request in flight
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How long in-flight connections get to finish after shutdown begins
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 443,
            handshake_timeout: Duration::from_secs(10),
            header_read_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(10 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// The socket address to listen on.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid listen host '{}': {e}", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Certificate configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Server certificates, in selection order
    pub certificates: Vec<CertificatePaths>,
    /// PEM bundle of the CDN's origin-pull CA; when set, client certificates are required
    pub origin_pull_ca: Option<PathBuf>,
}

/// One certificate chain and its private key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificatePaths {
    /// PEM certificate chain, leaf first
    pub cert: PathBuf,
    /// PEM private key
    pub key: PathBuf,
}

/// How disallowed peers are turned away
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterStrategy {
    /// Check inside the handshake; a disallowed peer sees the same failure as a wrong SNI
    #[default]
    Handshake,
    /// Close the TCP connection on accept, before any TLS byte
    Close,
    /// Accept, then fail every read and write on the connection
    Decoy,
}

/// Edge IP allowlist configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpFilterConfig {
    /// Only accept peers inside the CDN's published ranges
    pub enabled: bool,
    /// Where the check happens
    pub strategy: FilterStrategy,
    /// Newline-separated IPv4 CIDR list
    pub ipv4_url: String,
    /// Newline-separated IPv6 CIDR list
    pub ipv6_url: String,
    /// Per-request timeout for each list
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Minimum spacing between fetch attempts, successful or not
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for IpFilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: FilterStrategy::default(),
            ipv4_url: "https://www.cloudflare.com/ips-v4".to_string(),
            ipv6_url: "https://www.cloudflare.com/ips-v6".to_string(),
            fetch_timeout: Duration::from_secs(1),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// Environment variables use the `ORIGIN_GUARD_` prefix with `__` between
    /// nesting levels, e.g. `ORIGIN_GUARD_IP_FILTER__ENABLED=true`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("ORIGIN_GUARD_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Check the settings that cannot be expressed in types.
    pub fn validate(&self) -> Result<()> {
        if self.tls.certificates.is_empty() {
            return Err(Error::Config(
                "at least one entry in tls.certificates is required".to_string(),
            ));
        }
        if self.ip_filter.enabled
            && (self.ip_filter.ipv4_url.is_empty() || self.ip_filter.ipv6_url.is_empty())
        {
            return Err(Error::Config(
                "ip_filter.ipv4_url and ip_filter.ipv6_url are required when filtering is enabled"
                    .to_string(),
            ));
        }
        let server = &self.server;
        for (name, value) in [
            ("handshake_timeout", server.handshake_timeout),
            ("header_read_timeout", server.header_read_timeout),
            ("read_timeout", server.read_timeout),
            ("write_timeout", server.write_timeout),
            ("idle_timeout", server.idle_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("server.{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Human-readable `Duration` serde: `"500ms"`, `"30s"`, `"5m"`, `"1h"`, or bare seconds
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// A duration as written in YAML or the environment.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    /// Deserialize a human-readable duration string or a whole number of seconds
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(s.trim()).map_err(serde::de::Error::custom),
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Duration, String> {
        // "ms" before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            return number(ms, s).map(Duration::from_millis);
        }
        let (digits, unit_secs) = if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else {
            (s, 1)
        };

        number(digits, s)?
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    }

    fn number(digits: &str, whole: &str) -> Result<u64, String> {
        digits
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{whole}': {e}"))
    }
}
