//! Collaborator Seams
//!
//! Traits for the services the registry core consumes but does not own:
//! the node's packet emission path plus its lighthouse cache, the OS
//! path-MTU query, and the raw socket write used for hole punching.
//! Implementations must be non-blocking where noted; the core calls
//! every hook with no registry lock held.

use crate::addr::{EndpointAddr, OverlayAddr};
use crate::packet::{PacketKind, PacketSubKind};
use crate::peer::{Endpoint, Peer};
use crate::session::ConnectionSession;
use std::io;
use std::net::IpAddr;

/// The node-side services endpoint promotion needs: a read of the local
/// lighthouse cache and the ability to emit a packet to a specific
/// endpoint of a peer.
pub trait Interface {
    /// Transport addresses the lighthouse cache currently holds for an
    /// overlay address. Must be a cache-only read; no queries are issued.
    fn lighthouse_cached_endpoints(&self, addr: OverlayAddr) -> Vec<EndpointAddr>;

    /// Emit a packet to one specific endpoint of a peer.
    ///
    /// `nonce_buf` and `out_buf` are caller-provided scratch space for
    /// encryption. Implementations must not re-enter the session's queue
    /// lock: flush callbacks run while it is held.
    #[allow(clippy::too_many_arguments)]
    fn send(
        &self,
        kind: PacketKind,
        sub: PacketSubKind,
        session: &ConnectionSession,
        peer: &Peer,
        endpoint: &Endpoint,
        payload: &[u8],
        nonce_buf: &mut [u8],
        out_buf: &mut [u8],
    );
}

/// OS routing-table query for the known path MTU toward an IP.
pub trait MtuResolver {
    /// Look up the cached kernel MTU for a destination.
    fn known_mtu(&self, ip: IpAddr) -> io::Result<u16>;
}

/// Raw datagram write used by the hole-punch loop.
pub trait UdpWriter {
    /// Send `buf` to the given transport address.
    fn write_to(&self, buf: &[u8], addr: &EndpointAddr) -> io::Result<()>;
}
