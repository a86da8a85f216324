//! Immutable sets of edge network prefixes.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::{Error, Result};

/// An ordered, immutable sequence of IPv4 and IPv6 prefixes.
///
/// A refresh never mutates a published set; it builds a new one and swaps it in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CidrSet {
    nets: Vec<IpNet>,
}

impl CidrSet {
    /// Build a set from already parsed prefixes, preserving their order.
    #[must_use]
    pub fn new(nets: Vec<IpNet>) -> Self {
        Self { nets }
    }

    /// Parse a newline-separated list of CIDR blocks.
    ///
    /// Any line that is not a valid prefix, including a blank one, fails the
    /// whole list. `origin` is only used to label the error.
    pub fn parse_list(origin: &str, body: &str) -> Result<Self> {
        let nets = body
            .lines()
            .enumerate()
            .map(|(n, line)| {
                line.parse::<IpNet>().map_err(|e| {
                    Error::RangeFetch(format!("{origin}: line {}: {line:?}: {e}", n + 1))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if nets.is_empty() {
            return Err(Error::RangeFetch(format!("{origin}: no prefixes listed")));
        }
        Ok(Self { nets })
    }

    /// Concatenate two sets, `self` first.
    #[must_use]
    pub fn chain(mut self, other: Self) -> Self {
        self.nets.extend(other.nets);
        self
    }

    /// Whether `ip` falls inside any prefix.
    ///
    /// IPv4-mapped IPv6 addresses are tested as IPv4.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.nets.iter().any(|net| net.contains(&ip))
    }

    /// Number of prefixes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nets.len()
    }

    /// Returns `true` when the set holds no prefix.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    /// Iterate the prefixes in order.
    pub fn iter(&self) -> impl Iterator<Item = &IpNet> {
        self.nets.iter()
    }
}
