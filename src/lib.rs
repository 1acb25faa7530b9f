//! warren: peer-state core for a mesh overlay network
//!
//! The in-memory registry a mesh overlay node consults on every data
//! packet and every handshake: overlay address → peer and local session
//! index → peer, together with the machinery that selects, rotates, and
//! promotes the transport endpoints used to reach each peer.
//!
//! The crate owns no sockets, threads, or cryptography. Packet emission,
//! the lighthouse cache, the OS path-MTU query, and metrics are reached
//! through the traits in [`iface`] and [`metrics`]; the handshake engine
//! binds an opaque [`ConnectionSession`] into each peer and drives the
//! registry's binding primitives.

pub mod addr;
pub mod config;
pub mod iface;
pub mod metrics;
pub mod packet;
pub mod peer;
pub mod registry;
pub mod session;
pub mod time;

// Re-export address types
pub use addr::{EndpointAddr, OverlayAddr, SessionIndex};

// Re-export configuration
pub use config::RegistryConfig;

// Re-export collaborator seams
pub use iface::{Interface, MtuResolver, UdpWriter};

// Re-export metrics types
pub use metrics::{MemoryMetrics, MetricsSink, NullMetrics};

// Re-export packet discriminators and overhead constants
pub use packet::{
    PacketKind, PacketSubKind, AEAD_TAG_LEN, DEFAULT_MTU, HEADER_LEN, NONCE_LEN,
    OVERLAY_OVERHEAD,
};

// Re-export peer types
pub use peer::{
    DeferredPacket, Endpoint, PacketCallback, Peer, DEFERRED_PACKET_CAP, MAX_ENDPOINTS,
    MTU_TIMEOUT_MS, PROMOTE_EVERY, RECV_ERROR_THRESHOLD, ROAMING_SUPPRESS_MS,
};

// Re-export registry types
pub use registry::{PeerHandle, Registry, RegistryError, PUNCH_INTERVAL};

// Re-export session types
pub use session::{CertState, ConnectionSession};

// Re-export the wall-clock helper
pub use time::unix_now_ms;
