//! Packet Discriminators and Overhead Constants
//!
//! Kind/subkind tags identify what a deferred or emitted packet carries;
//! the overhead constants feed the path-MTU arithmetic.

use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Length of the overlay packet header.
pub const HEADER_LEN: usize = 16;

/// AEAD tag length. Both AES-GCM and ChaCha20-Poly1305 use a 16-byte tag;
/// adding a cipher with a different overhead means computing this from the
/// cipher instead.
pub const AEAD_TAG_LEN: usize = 16;

/// IPv4 header without options. The maximum is 60 bytes, but options are
/// not emitted on the underlay path.
pub const IPV4_HEADER_LEN: usize = 20;

/// UDP header length.
pub const UDP_HEADER_LEN: usize = 8;

/// Total per-packet overhead between inner payload and the wire.
pub const OVERLAY_OVERHEAD: usize = HEADER_LEN + AEAD_TAG_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN;

/// Default tunnel MTU, sizing scratch buffers for probe and flush emission.
pub const DEFAULT_MTU: usize = 1300;

/// Nonce buffer length handed to the emission hook.
pub const NONCE_LEN: usize = 12;

// ============================================================================
// Packet Kinds
// ============================================================================

/// Top-level packet discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Handshake message.
    Handshake,
    /// Encrypted application data.
    Data,
    /// Receive-error signal to the far side.
    RecvError,
    /// Lighthouse query/response traffic.
    Lighthouse,
    /// Reachability test.
    Test,
    /// Session teardown notice.
    Close,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketKind::Handshake => "handshake",
            PacketKind::Data => "data",
            PacketKind::RecvError => "recv_error",
            PacketKind::Lighthouse => "lighthouse",
            PacketKind::Test => "test",
            PacketKind::Close => "close",
        };
        write!(f, "{}", s)
    }
}

/// Secondary packet discriminator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PacketSubKind {
    /// No subkind.
    #[default]
    None,
    /// Reachability test request; the receiver answers with a reply.
    TestRequest,
    /// Reachability test reply.
    TestReply,
}

impl fmt::Display for PacketSubKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketSubKind::None => "none",
            PacketSubKind::TestRequest => "test_request",
            PacketSubKind::TestReply => "test_reply",
        };
        write!(f, "{}", s)
    }
}
