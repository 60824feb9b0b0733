//! Network and silo addressing.
//!
//! A silo is a runtime process; its address is its network endpoint plus a
//! monotonic generation stamped at process start. Two processes listening
//! on the same endpoint at different times are *different* silos — the
//! generation is what tells them apart in the membership table and the
//! directory.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Network address (IP + port).
///
/// # Examples
///
/// ```
/// use granary_core::NetworkAddress;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let addr = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 11111);
/// assert_eq!(addr.to_string(), "127.0.0.1:11111");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// IP address (IPv4 or IPv6).
    pub ip: IpAddr,
    /// Port number.
    pub port: u16,
}

impl NetworkAddress {
    /// Create a new network address.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Loopback address on the given port (test convenience).
    pub fn localhost(port: u16) -> Self {
        Self::new(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), port)
    }

    /// Parse from `"ip:port"` format.
    ///
    /// Supports IPv4 (`127.0.0.1:11111`) and bracketed IPv6 (`[::1]:11111`).
    ///
    /// # Errors
    ///
    /// Returns an error if the IP or port cannot be parsed.
    pub fn parse(s: &str) -> Result<Self, NetworkAddressParseError> {
        if let Some(bracket_end) = s.rfind(']') {
            if !s.starts_with('[') {
                return Err(NetworkAddressParseError::InvalidIp);
            }
            let ip_str = &s[1..bracket_end];
            let port_str = s
                .get(bracket_end + 2..)
                .ok_or(NetworkAddressParseError::MissingPort)?;
            let ip: IpAddr = ip_str
                .parse()
                .map_err(|_| NetworkAddressParseError::InvalidIp)?;
            let port: u16 = port_str
                .parse()
                .map_err(|_| NetworkAddressParseError::InvalidPort)?;
            Ok(Self::new(ip, port))
        } else {
            let (ip_str, port_str) = s
                .rsplit_once(':')
                .ok_or(NetworkAddressParseError::MissingPort)?;
            let ip: IpAddr = ip_str
                .parse()
                .map_err(|_| NetworkAddressParseError::InvalidIp)?;
            let port: u16 = port_str
                .parse()
                .map_err(|_| NetworkAddressParseError::InvalidPort)?;
            Ok(Self::new(ip, port))
        }
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Error parsing a network address from string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkAddressParseError {
    /// The IP address could not be parsed.
    #[error("invalid IP address")]
    InvalidIp,
    /// The port number could not be parsed.
    #[error("invalid port number")]
    InvalidPort,
    /// No port separator (`:`) found in the input.
    #[error("missing port separator")]
    MissingPort,
}

/// Stable identity of a silo: endpoint + generation.
///
/// The generation is assigned once at silo start and never reused. A silo
/// that is declared Dead never comes back under the same generation; a
/// restart on the same endpoint produces a *new* `SiloAddress`.
///
/// Ordering is (endpoint, generation) lexicographic — the directory uses
/// this for deterministic tie-breaking between concurrent registrations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SiloAddress {
    /// The listening endpoint.
    pub endpoint: NetworkAddress,
    /// Monotonic generation stamped at process start.
    pub generation: i64,
}

impl SiloAddress {
    /// Create a silo address with an explicit generation.
    pub fn new(endpoint: NetworkAddress, generation: i64) -> Self {
        Self {
            endpoint,
            generation,
        }
    }

    /// Create a silo address stamped with the current time as generation.
    ///
    /// Wall-clock seconds are monotonic enough across restarts of the same
    /// host; within a test process use [`SiloAddress::new`] with explicit
    /// generations instead.
    pub fn fresh(endpoint: NetworkAddress) -> Self {
        let generation = (crate::epoch_ms() / 1000) as i64;
        Self {
            endpoint,
            generation,
        }
    }

    /// True when `other` is the same endpoint but a different generation —
    /// i.e. a predecessor or successor incarnation of this silo.
    pub fn is_same_endpoint(&self, other: &SiloAddress) -> bool {
        self.endpoint == other.endpoint && self.generation != other.generation
    }
}

impl std::fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}@{}", self.endpoint, self.generation)
    }
}

/// Monotonically increasing membership table version.
///
/// Every successful membership write bumps the version; readers use it to
/// order snapshots and detect staleness.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MembershipVersion(pub u64);

impl MembershipVersion {
    /// Version 0 (initial).
    pub fn new() -> Self {
        Self(0)
    }

    /// The next version.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for MembershipVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}
