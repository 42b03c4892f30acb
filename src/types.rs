//! Shared domain scalars used across entities, snapshots, and the wire

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// Cluster tier. Community clusters run under the built-in three-proxy limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Community,
    Enterprise,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Community => write!(f, "community"),
            Tier::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Protocols a backend service can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Http,
    Https,
    Grpc,
    Websocket,
}

impl Protocol {
    /// Bearer authentication only makes sense on application-layer protocols.
    pub fn supports_bearer_auth(self) -> bool {
        matches!(
            self,
            Protocol::Http | Protocol::Https | Protocol::Grpc | Protocol::Websocket
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Grpc => "grpc",
            Protocol::Websocket => "websocket",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a destination service authenticates callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    None,
    BearerJwt,
    BearerOpaque,
}

impl AuthMode {
    pub fn requires_bearer(self) -> bool {
        !matches!(self, AuthMode::None)
    }
}

/// Declared data-plane proxy type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyKind {
    #[serde(rename = "l7")]
    L7,
    #[serde(rename = "l3l4")]
    L3L4,
}

/// Proxy registration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    Registering,
    Active,
    Stale,
    Revoked,
}

impl ProxyStatus {
    /// States that count against the licensed proxy quota.
    pub fn counts_against_quota(self) -> bool {
        matches!(self, ProxyStatus::Registering | ProxyStatus::Active)
    }
}

/// Declarative load-balancing policy emitted through discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbPolicy {
    RoundRobin,
    LeastConn,
    Random,
}

/// Declarative rate-limit policy; enforcement is a data-plane concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub requests: u32,
    pub interval_secs: u32,
    pub burst: u32,
}

/// An inclusive port range. Single ports are stored as `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A non-empty set of ports and port ranges. Overlap between entries is
/// allowed; the canonical form is sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortSet(Vec<PortRange>);

impl PortSet {
    pub fn ranges(&self) -> &[PortRange] {
        &self.0
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.iter().any(|r| r.contains(port))
    }

    /// True when every port of `other` is covered by this set.
    pub fn covers(&self, other: &PortSet) -> bool {
        other.0.iter().all(|range| {
            (range.start..=range.end).all(|p| self.contains(p))
        })
    }

    fn parse_part(part: &str) -> Result<PortRange> {
        let parse_port = |raw: &str| -> Result<u16> {
            let value: u32 = raw
                .parse()
                .map_err(|_| ControlError::invalid_field("ports", format!("invalid port `{raw}`")))?;
            if value == 0 || value > u16::MAX as u32 {
                return Err(ControlError::invalid_field(
                    "ports",
                    format!("port {value} out of range 1-65535"),
                ));
            }
            Ok(value as u16)
        };
        match part.split_once('-') {
            None => {
                let port = parse_port(part)?;
                Ok(PortRange { start: port, end: port })
            }
            Some((lo, hi)) => {
                if lo.is_empty() || hi.is_empty() {
                    return Err(ControlError::invalid_field(
                        "ports",
                        format!("dangling range bound in `{part}`"),
                    ));
                }
                let start = parse_port(lo)?;
                let end = parse_port(hi)?;
                if start > end {
                    return Err(ControlError::invalid_field(
                        "ports",
                        format!("inverted range `{part}`"),
                    ));
                }
                Ok(PortRange { start, end })
            }
        }
    }
}

impl FromStr for PortSet {
    type Err = ControlError;

    /// Accepts `"80"`, `"80-90"`, `"80,443"`, `"80,8000-8010"`.
    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(ControlError::invalid_field("ports", "port set is empty"));
        }
        let mut ranges = s
            .split(',')
            .map(|part| Self::parse_part(part.trim()))
            .collect::<Result<Vec<_>>>()?;
        ranges.sort();
        Ok(PortSet(ranges))
    }
}

impl fmt::Display for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Validate a service address: an IP literal or a DNS name.
pub fn validate_address(address: &str) -> Result<()> {
    if address.is_empty() {
        return Err(ControlError::invalid_field("address", "address is empty"));
    }
    if address.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let valid_dns = address.len() <= 253
        && address.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if valid_dns {
        Ok(())
    } else {
        Err(ControlError::invalid_field(
            "address",
            format!("`{address}` is neither an IP literal nor a DNS name"),
        ))
    }
}

/// Entity names: lowercase alphanumeric plus `-` and `_`, 1..=64 chars.
pub fn validate_name(field: &'static str, name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ControlError::invalid_field(
            field,
            format!("`{name}` must be 1-64 chars of [a-z0-9_-]"),
        ))
    }
}
