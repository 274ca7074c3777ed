pub mod tracker;

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

/// An IPv4 or IPv6 address with bit-exact equality and hashing.
///
/// The family discriminant is part of the value: an IPv6 address with an
/// embedded IPv4 prefix never compares equal to the bare IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    V4(u32),
    V6(u128),
}

impl Address {
    /// Returns the canonical family label.
    pub const fn family(&self) -> &'static str {
        match self {
            Self::V4(_) => "ipv4",
            Self::V6(_) => "ipv6",
        }
    }
}

impl From<Ipv4Addr> for Address {
    fn from(addr: Ipv4Addr) -> Self {
        Self::V4(u32::from(addr))
    }
}

impl From<Ipv6Addr> for Address {
    fn from(addr: Ipv6Addr) -> Self {
        Self::V6(u128::from(addr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(bits) => write!(f, "{}", Ipv4Addr::from(*bits)),
            Self::V6(bits) => write!(f, "{}", Ipv6Addr::from(*bits)),
        }
    }
}

/// An `(address, port)` pair. Port 0 means "unspecified" and is preserved
/// verbatim; it only compares equal to another port 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub address: Address,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Address::V4(_) => write!(f, "{}:{}", self.address, self.port),
            Address::V6(_) => write!(f, "[{}]:{}", self.address, self.port),
        }
    }
}

/// L4 protocol of a tracked connection. Other protocols are dropped
/// before reaching the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum L4Proto {
    Tcp,
    Udp,
}

impl L4Proto {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the connection the observed socket plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnRole {
    Server,
    Client,
}

impl ConnRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for ConnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical connection record: 5-tuple plus role plus container identity.
///
/// For `role == Server` the local endpoint is the listening side; for
/// `role == Client` it is the initiating side. Orientation comes from the
/// source FD's role, never from port numbers. Equality uses all five
/// fields, so two connections differing only in role are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Connection {
    pub container_id: String,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub proto: L4Proto,
    pub role: ConnRole,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {} -> {} ({})",
            self.container_id, self.proto, self.local, self.remote, self.role,
        )
    }
}

/// Whether a delta opens or closes a socket for its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Add,
    Remove,
}

/// A single add/remove event against the tracker. Timestamps are
/// wall-clock-equivalent microseconds taken from the event.
#[derive(Debug, Clone)]
pub struct ConnectionDelta {
    pub conn: Connection,
    pub timestamp_us: u64,
    pub kind: DeltaKind,
}

/// Errors produced when parsing a CIDR block from its textual form.
#[derive(Error, Debug)]
pub enum CidrParseError {
    #[error("missing '/' separator in {0:?}")]
    MissingSeparator(String),

    #[error("invalid address in {0:?}")]
    InvalidAddress(String),

    #[error("prefix length {len} out of range for {family}")]
    PrefixOutOfRange { family: &'static str, len: u32 },
}

/// A CIDR block over either address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: Address,
    prefix_len: u8,
}

impl Cidr {
    pub const fn new(addr: Address, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    /// Returns true if `addr` falls inside this block. Families never mix:
    /// a v4-mapped IPv6 address is not contained in any IPv4 block.
    pub fn contains(&self, addr: &Address) -> bool {
        match (self.addr, addr) {
            (Address::V4(net), Address::V4(host)) => {
                if self.prefix_len == 0 {
                    true
                } else {
                    (net ^ host) >> (32 - u32::from(self.prefix_len)) == 0
                }
            }
            (Address::V6(net), Address::V6(host)) => {
                if self.prefix_len == 0 {
                    true
                } else {
                    (net ^ host) >> (128 - u32::from(self.prefix_len)) == 0
                }
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, len_part) = s
            .split_once('/')
            .ok_or_else(|| CidrParseError::MissingSeparator(s.to_string()))?;

        let len: u32 = len_part
            .parse()
            .map_err(|_| CidrParseError::InvalidAddress(s.to_string()))?;

        if let Ok(v4) = addr_part.parse::<Ipv4Addr>() {
            if len > 32 {
                return Err(CidrParseError::PrefixOutOfRange {
                    family: "ipv4",
                    len,
                });
            }
            return Ok(Self::new(Address::from(v4), len as u8));
        }

        if let Ok(v6) = addr_part.parse::<Ipv6Addr>() {
            if len > 128 {
                return Err(CidrParseError::PrefixOutOfRange {
                    family: "ipv6",
                    len,
                });
            }
            return Ok(Self::new(Address::from(v6), len as u8));
        }

        Err(CidrParseError::InvalidAddress(s.to_string()))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> Address {
        Address::from(s.parse::<Ipv4Addr>().expect("valid ipv4"))
    }

    fn v6(s: &str) -> Address {
        Address::from(s.parse::<Ipv6Addr>().expect("valid ipv6"))
    }

    #[test]
    fn test_address_equality_is_bit_exact() {
        assert_eq!(v4("10.0.0.1"), v4("10.0.0.1"));
        assert_ne!(v4("10.0.0.1"), v4("10.0.0.2"));
        assert_eq!(v6("::1"), v6("0:0:0:0:0:0:0:1"));
    }

    #[test]
    fn test_v4_mapped_v6_stays_v6() {
        let mapped = v6("::ffff:10.0.0.1");
        let plain = v4("10.0.0.1");
        assert_ne!(mapped, plain);
        assert_eq!(mapped.family(), "ipv6");
    }

    #[test]
    fn test_port_zero_is_preserved() {
        let a = Endpoint::new(v4("10.0.0.1"), 0);
        let b = Endpoint::new(v4("10.0.0.1"), 80);
        assert_ne!(a, b);
        assert_eq!(a, Endpoint::new(v4("10.0.0.1"), 0));
        assert_eq!(a.to_string(), "10.0.0.1:0");
    }

    #[test]
    fn test_endpoint_display_v6_brackets() {
        let ep = Endpoint::new(v6("2001:db8::1"), 443);
        assert_eq!(ep.to_string(), "[2001:db8::1]:443");
    }

    #[test]
    fn test_connections_differing_only_in_role_are_distinct() {
        let local = Endpoint::new(v4("10.0.0.1"), 40000);
        let remote = Endpoint::new(v4("10.0.0.2"), 443);

        let client = Connection {
            container_id: "c1".to_string(),
            local,
            remote,
            proto: L4Proto::Tcp,
            role: ConnRole::Client,
        };
        let mut server = client.clone();
        server.role = ConnRole::Server;

        assert_ne!(client, server);
    }

    #[test]
    fn test_cidr_parse_and_contains_v4() {
        let net: Cidr = "10.0.0.0/8".parse().expect("valid cidr");
        assert!(net.contains(&v4("10.0.0.1")));
        assert!(net.contains(&v4("10.255.255.255")));
        assert!(!net.contains(&v4("11.0.0.1")));
        assert!(!net.contains(&v6("::ffff:10.0.0.1")));
    }

    #[test]
    fn test_cidr_host_prefix() {
        let net: Cidr = "192.168.1.7/32".parse().expect("valid cidr");
        assert!(net.contains(&v4("192.168.1.7")));
        assert!(!net.contains(&v4("192.168.1.8")));
    }

    #[test]
    fn test_cidr_zero_prefix_matches_family() {
        let net: Cidr = "0.0.0.0/0".parse().expect("valid cidr");
        assert!(net.contains(&v4("8.8.8.8")));
        assert!(!net.contains(&v6("2001:db8::1")));
    }

    #[test]
    fn test_cidr_parse_v6() {
        let net: Cidr = "2001:db8::/32".parse().expect("valid cidr");
        assert!(net.contains(&v6("2001:db8::42")));
        assert!(!net.contains(&v6("2001:db9::42")));
    }

    #[test]
    fn test_cidr_parse_errors() {
        assert!("10.0.0.0".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("2001:db8::/129".parse::<Cidr>().is_err());
        assert!("not-an-address/8".parse::<Cidr>().is_err());
    }
}
