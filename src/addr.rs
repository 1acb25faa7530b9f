//! Address and Index Types
//!
//! Newtype identifiers used throughout the peer registry: the overlay
//! address a peer is known by inside the mesh, the underlay transport
//! address used to actually reach it, and the 32-bit session index
//! embedded in encrypted frames for receiver-side dispatch.

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::{AddrParseError, IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

// ============================================================================
// Overlay Address
// ============================================================================

/// Virtual IPv4 address assigned to a participant inside the overlay.
///
/// This is the primary key for peers. The zero address is reserved: a peer
/// created from an inbound handshake carries `UNSPECIFIED` until its
/// identity is confirmed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OverlayAddr(u32);

impl OverlayAddr {
    /// The zero address (identity not yet confirmed / no default route).
    pub const UNSPECIFIED: OverlayAddr = OverlayAddr(0);

    /// Create from a raw u32 (network order, as in an IPv4 header).
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw u32 value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Convert to the dotted-quad form.
    pub fn to_ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.0)
    }

    /// Check whether this is the reserved zero address.
    pub fn is_unspecified(&self) -> bool {
        self.0 == 0
    }
}

impl From<Ipv4Addr> for OverlayAddr {
    fn from(ip: Ipv4Addr) -> Self {
        Self(u32::from(ip))
    }
}

impl FromStr for OverlayAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>().map(Self::from)
    }
}

impl fmt::Display for OverlayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ipv4())
    }
}

impl Serialize for OverlayAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// Endpoint Address
// ============================================================================

/// Underlay transport address (IP + UDP port) reaching a participant.
///
/// Full equality compares both fields; `ip_equals` ignores the port, which
/// is the comparison used for NAT-blind lookups and path-MTU fan-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointAddr(SocketAddr);

impl EndpointAddr {
    /// Create from an IP and port.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    /// Get the IP portion.
    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Get the port portion.
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Get the underlying socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Compare IP portions only, ignoring the port.
    pub fn ip_equals(&self, other: &EndpointAddr) -> bool {
        self.0.ip() == other.0.ip()
    }

    /// RFC1918 test used by the endpoint fallback rule.
    ///
    /// IPv6 addresses never count as private here.
    pub fn is_private(&self) -> bool {
        match self.0.ip() {
            IpAddr::V4(ip) => ip.is_private(),
            IpAddr::V6(_) => false,
        }
    }
}

impl From<SocketAddr> for EndpointAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for EndpointAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>().map(Self)
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for EndpointAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// Session Index
// ============================================================================

/// A 32-bit session index.
///
/// Chosen by each side of a session independently and embedded in outgoing
/// encrypted frames so the receiver can find its own session state without
/// trial decryption. Zero is reserved and never allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SessionIndex(u32);

impl SessionIndex {
    /// Create from a raw u32.
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw u32 value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Check whether this is the reserved zero index.
    pub fn is_unspecified(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SessionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}
