//! Peer Records and Endpoint Selection
//!
//! A [`Peer`] is everything this node knows about one remote participant:
//! candidate transport endpoints, the currently selected endpoint, the
//! cryptographic session reference, handshake progress, and the bounded
//! store of packets deferred while key exchange is in flight.
//!
//! Peer operations mutate only the peer's own fields and never take
//! registry locks; the registry hands out shared, lockable handles and
//! higher layers route all mutation for one peer through the same worker.

mod endpoint;
mod record;

pub use endpoint::{Endpoint, MTU_TIMEOUT_MS};
pub use record::{
    Peer, DEFERRED_PACKET_CAP, MAX_ENDPOINTS, PROMOTE_EVERY, RECV_ERROR_THRESHOLD,
    ROAMING_SUPPRESS_MS,
};

use crate::packet::{PacketKind, PacketSubKind};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;
use std::sync::Arc;

/// Callback re-entering the send path for one deferred packet once the
/// peer's session is ready.
///
/// Invoked with the peer, the stored payload, and scratch nonce/output
/// buffers. Runs while the session's queue lock is held, so it must not
/// re-acquire that lock; advancing the message counter is fine.
pub type PacketCallback =
    Arc<dyn Fn(PacketKind, PacketSubKind, &Peer, &[u8], &mut [u8], &mut [u8]) + Send + Sync>;

/// A data packet queued on a peer while its handshake is incomplete.
///
/// The payload is copied at cache time; the caller's buffer may be
/// reused immediately.
pub struct DeferredPacket {
    pub(crate) kind: PacketKind,
    pub(crate) sub: PacketSubKind,
    pub(crate) callback: PacketCallback,
    pub(crate) payload: Vec<u8>,
}

impl DeferredPacket {
    /// Top-level discriminator of the stored packet.
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Secondary discriminator of the stored packet.
    pub fn subkind(&self) -> PacketSubKind {
        self.sub
    }

    /// The copied payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl fmt::Debug for DeferredPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredPacket")
            .field("kind", &self.kind)
            .field("sub", &self.sub)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl Serialize for DeferredPacket {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Payload bytes and the callback stay out of operator output; the
        // serialized list conveys count only.
        serializer.serialize_map(Some(0))?.end()
    }
}
