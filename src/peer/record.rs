//! The Peer Record
//!
//! State machine for one remote participant: candidate endpoint
//! admission with bounded eviction, round-robin rotation for handshake
//! retransmission, preferred-range promotion, the deferred-packet store
//! drained at handshake completion, receive-error accounting, and
//! roaming suppression.

use crate::addr::{EndpointAddr, OverlayAddr, SessionIndex};
use crate::iface::Interface;
use crate::packet::{PacketKind, PacketSubKind, DEFAULT_MTU, NONCE_LEN};
use crate::session::ConnectionSession;
use ipnet::Ipv4Net;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use super::endpoint::Endpoint;
use super::{DeferredPacket, PacketCallback};

/// Maximum candidate endpoints retained per peer; admission beyond the
/// bound evicts the oldest entries.
pub const MAX_ENDPOINTS: usize = 10;

/// A promotion attempt runs every this many data-path queries.
pub const PROMOTE_EVERY: u32 = 1000;

/// Window during which a second roam for the same peer is ignored. This
/// absorbs packets already in flight from the previous address and keeps
/// the current endpoint from flapping.
pub const ROAMING_SUPPRESS_MS: u64 = 2_000;

/// Upper bound on packets deferred while a handshake is in progress.
pub const DEFERRED_PACKET_CAP: usize = 100;

/// Receive failures tolerated before the caller should re-handshake.
pub const RECV_ERROR_THRESHOLD: u32 = 3;

/// Everything known about one remote participant.
#[derive(Debug)]
pub struct Peer {
    // === Identity ===
    /// Overlay address, confirmed from the certificate presented during
    /// the handshake. `UNSPECIFIED` until then for inbound peers.
    overlay_addr: OverlayAddr,

    // === Endpoints ===
    /// Candidate endpoints in insertion order, bounded by [`MAX_ENDPOINTS`].
    endpoints: Vec<Endpoint>,
    /// Index of the currently selected endpoint. Always a live index into
    /// `endpoints`; eviction shifts or drops it.
    current: Option<usize>,
    /// Incremented on every data-path query.
    promote_counter: u32,

    // === Session ===
    /// Cryptographic session, owned by the handshake engine.
    session: Option<Arc<ConnectionSession>>,

    // === Handshake Progress ===
    /// When the handshake began (Unix ms). 0 = not started.
    handshake_start_ms: u64,
    /// Local side has everything it needs to finish.
    handshake_ready: bool,
    /// Handshake attempts initiated so far.
    handshake_counter: u32,
    /// Key exchange finished; deferred packets have been flushed.
    handshake_complete: bool,
    /// Unacknowledged handshake messages by stage, kept for
    /// retransmission.
    handshake_packets: BTreeMap<u8, Vec<u8>>,

    // === Deferred Packets ===
    /// Packets held back until the session is ready, flushed in order.
    deferred: Vec<DeferredPacket>,

    // === Session Indexes ===
    /// Index this node chose for the session.
    local_index: SessionIndex,
    /// Index the far side chose, kept for reverse lookup.
    remote_index: SessionIndex,

    // === Receive Errors ===
    /// Consecutive decryption failures reported by the receive path.
    recv_errors: u32,

    // === Roaming ===
    /// When the current endpoint last changed in response to a received
    /// packet (Unix ms). 0 = never.
    last_roam_ms: u64,
    /// The endpoint that was current before the last roam.
    last_roam_endpoint: Option<Endpoint>,
}

impl Peer {
    /// Create an empty peer known only by its overlay address.
    pub fn new(overlay_addr: OverlayAddr) -> Self {
        Self {
            overlay_addr,
            endpoints: Vec::new(),
            current: None,
            promote_counter: 0,
            session: None,
            handshake_start_ms: 0,
            handshake_ready: false,
            handshake_counter: 0,
            handshake_complete: false,
            handshake_packets: BTreeMap::new(),
            deferred: Vec::new(),
            local_index: SessionIndex::new(0),
            remote_index: SessionIndex::new(0),
            recv_errors: 0,
            last_roam_ms: 0,
            last_roam_endpoint: None,
        }
    }

    /// Create a peer from an inbound handshake: session and local index
    /// known, overlay identity not yet confirmed.
    pub fn with_session(local_index: SessionIndex, session: Arc<ConnectionSession>) -> Self {
        let mut peer = Self::new(OverlayAddr::UNSPECIFIED);
        peer.local_index = local_index;
        peer.session = Some(session);
        peer
    }

    // === Identity ===

    /// The overlay address this peer is known by.
    pub fn overlay_addr(&self) -> OverlayAddr {
        self.overlay_addr
    }

    /// Record the confirmed overlay identity. Called by the registry when
    /// binding the peer into the overlay-address map.
    pub fn set_overlay_addr(&mut self, addr: OverlayAddr) {
        self.overlay_addr = addr;
    }

    // === Endpoints ===

    /// The candidate endpoint list, in insertion order.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Admit a candidate endpoint.
    ///
    /// Idempotent by full transport-address equality: a known address is
    /// returned unchanged. Admission past [`MAX_ENDPOINTS`] evicts the
    /// oldest entries; the returned reference stays valid until the next
    /// eviction.
    pub fn add_endpoint(&mut self, addr: EndpointAddr) -> &Endpoint {
        let index = self.admit_endpoint(addr);
        &self.endpoints[index]
    }

    fn admit_endpoint(&mut self, addr: EndpointAddr) -> usize {
        if let Some(index) = self.endpoints.iter().position(|e| e.addr() == addr) {
            return index;
        }
        if self.endpoints.len() >= MAX_ENDPOINTS {
            let excess = self.endpoints.len() + 1 - MAX_ENDPOINTS;
            self.endpoints.drain(..excess);
            // Eviction shifts every surviving index down; a current entry
            // that fell off the front is simply gone.
            self.current = match self.current {
                Some(current) if current >= excess => Some(current - excess),
                _ => None,
            };
        }
        self.endpoints.push(Endpoint::new(addr));
        self.endpoints.len() - 1
    }

    /// Admit an endpoint and make it the current one.
    pub fn set_current(&mut self, addr: EndpointAddr) {
        let index = self.admit_endpoint(addr);
        self.current = Some(index);
    }

    /// The currently selected endpoint, if any.
    pub fn current_endpoint(&self) -> Option<&Endpoint> {
        self.current.map(|i| &self.endpoints[i])
    }

    /// Mutable access to the current endpoint, for path-MTU refresh on
    /// the send path.
    pub fn current_endpoint_mut(&mut self) -> Option<&mut Endpoint> {
        match self.current {
            Some(i) => Some(&mut self.endpoints[i]),
            None => None,
        }
    }

    /// Drop every candidate endpoint, including the current one.
    pub fn clear_endpoints(&mut self) {
        self.endpoints.clear();
        self.current = None;
    }

    /// Whether any candidate endpoint shares an IP with `addr` (port
    /// ignored).
    pub fn has_endpoint_ip(&self, addr: &EndpointAddr) -> bool {
        self.endpoints.iter().any(|e| e.matches_ip(addr))
    }

    /// Transport addresses of every candidate endpoint.
    pub fn endpoint_addrs(&self) -> Vec<EndpointAddr> {
        self.endpoints.iter().map(|e| e.addr()).collect()
    }

    // === Rotation ===

    /// Move the current endpoint to the next candidate in the list,
    /// wrapping at the end.
    ///
    /// Unlike promotion this ignores what is algorithmically best; the
    /// only use is retransmitting a stage-0 handshake that may simply be
    /// aimed at an unreachable address.
    pub fn rotate_endpoint(&mut self) {
        if self.endpoints.is_empty() {
            return;
        }
        let current = match self.current {
            Some(i) => i,
            None => {
                self.current = Some(0);
                return;
            }
        };
        let current_addr = self.endpoints[current].addr();
        // Look at all but the last entry; the last wraps to the front.
        for x in 0..self.endpoints.len() - 1 {
            if self.endpoints[x].addr() == current_addr {
                self.current = Some(x + 1);
                return;
            }
        }
        self.current = Some(0);
    }

    // === Promotion ===

    /// Select the best candidate (see [`Peer::best_endpoint`]) as current,
    /// if there is one.
    pub fn force_promote(&mut self, preferred_ranges: &[Ipv4Net]) {
        let (best, _) = self.best_index(preferred_ranges);
        if let Some(best) = best {
            self.current = Some(best);
        }
    }

    /// Lazy promotion, called on every data-path query.
    ///
    /// Counts the query; when the current endpoint is already inside a
    /// preferred range nothing else happens. Every [`PROMOTE_EVERY`]-th
    /// query the lighthouse cache is re-read for new candidates and, when
    /// a strictly preferred candidate differs from the current endpoint, a
    /// test packet is emitted toward it. The far side observes traffic
    /// from the new path and roams; the current endpoint here changes only
    /// when a return packet arrives from the new address.
    pub fn try_promote(&mut self, preferred_ranges: &[Ipv4Net], iface: &dyn Interface) {
        let current_addr = match self.current {
            Some(i) => self.endpoints[i].addr(),
            None => {
                self.force_promote(preferred_ranges);
                return;
            }
        };

        self.promote_counter = self.promote_counter.wrapping_add(1);
        if in_ranges(current_addr, preferred_ranges) {
            return;
        }
        if self.promote_counter % PROMOTE_EVERY != 0 {
            return;
        }

        // Lighthouse re-queries run in the background while packets flow;
        // fold whatever has landed in the local cache since the last look.
        for addr in iface.lighthouse_cached_endpoints(self.overlay_addr) {
            self.admit_endpoint(addr);
        }

        let (best, preferred) = self.best_index(preferred_ranges);
        let best = match best {
            Some(best) if preferred => best,
            _ => return,
        };
        if self.endpoints[best].addr() == current_addr {
            return;
        }
        let session = match &self.session {
            Some(session) => session.clone(),
            None => return,
        };

        let mut nonce_buf = [0u8; NONCE_LEN];
        let mut out_buf = vec![0u8; DEFAULT_MTU];
        iface.send(
            PacketKind::Test,
            PacketSubKind::TestRequest,
            &session,
            self,
            &self.endpoints[best],
            &[],
            &mut nonce_buf,
            &mut out_buf,
        );
    }

    /// The best candidate endpoint under the preferred-range policy.
    ///
    /// The first endpoint inside any preferred range wins outright
    /// (`preferred = true`). Otherwise a fallback is tracked: any
    /// non-RFC1918 candidate overwrites it, and the first candidate wins
    /// when every address is private. An empty list yields `(None, false)`.
    pub fn best_endpoint(&self, preferred_ranges: &[Ipv4Net]) -> (Option<&Endpoint>, bool) {
        let (index, preferred) = self.best_index(preferred_ranges);
        (index.map(|i| &self.endpoints[i]), preferred)
    }

    fn best_index(&self, preferred_ranges: &[Ipv4Net]) -> (Option<usize>, bool) {
        let mut best: Option<usize> = None;
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            if in_ranges(endpoint.addr(), preferred_ranges) {
                return (Some(i), true);
            }
            if best.is_none() || !endpoint.addr().is_private() {
                best = Some(i);
            }
        }
        (best, false)
    }

    /// Number of data-path queries observed so far.
    pub fn promote_counter(&self) -> u32 {
        self.promote_counter
    }

    // === Roaming ===

    /// Switch the current endpoint in response to a valid packet from a
    /// new transport address.
    ///
    /// Returns false without switching when the previous roam was within
    /// [`ROAMING_SUPPRESS_MS`]; on success the previous current endpoint
    /// and the roam time are recorded.
    pub fn roam_to(&mut self, addr: EndpointAddr, now_ms: u64) -> bool {
        if self.last_roam_ms != 0
            && now_ms.saturating_sub(self.last_roam_ms) < ROAMING_SUPPRESS_MS
        {
            debug!(
                peer = %self.overlay_addr,
                endpoint = %addr,
                "roam suppressed, too soon after previous roam"
            );
            return false;
        }
        self.last_roam_endpoint = self.current_endpoint().cloned();
        self.set_current(addr);
        self.last_roam_ms = now_ms;
        true
    }

    /// When the last roam happened (Unix ms). 0 = never.
    pub fn last_roam_ms(&self) -> u64 {
        self.last_roam_ms
    }

    /// The endpoint that was current before the last roam.
    pub fn last_roam_endpoint(&self) -> Option<&Endpoint> {
        self.last_roam_endpoint.as_ref()
    }

    // === Deferred Packets ===

    /// Defer a packet until the handshake completes.
    ///
    /// Beyond [`DEFERRED_PACKET_CAP`] the packet is dropped; traffic
    /// continues through the normal path once the session is up, so the
    /// drop is not surfaced to the caller.
    pub fn cache_packet(
        &mut self,
        kind: PacketKind,
        sub: PacketSubKind,
        payload: &[u8],
        callback: PacketCallback,
    ) {
        if self.deferred.len() < DEFERRED_PACKET_CAP {
            self.deferred.push(DeferredPacket {
                kind,
                sub,
                callback,
                payload: payload.to_vec(),
            });
            debug!(
                peer = %self.overlay_addr,
                length = self.deferred.len(),
                stored = true,
                "deferred packet"
            );
        } else {
            debug!(
                peer = %self.overlay_addr,
                length = self.deferred.len(),
                stored = false,
                "deferred packet"
            );
        }
    }

    /// Packets currently deferred.
    pub fn deferred_packets(&self) -> &[DeferredPacket] {
        &self.deferred
    }

    // === Session ===

    /// Attach the cryptographic session. Handshake flags are untouched.
    pub fn bind_session(&mut self, session: Arc<ConnectionSession>) {
        self.session = Some(session);
    }

    /// Detach the cryptographic session on teardown.
    pub fn clear_session(&mut self) {
        self.session = None;
    }

    /// The attached session, if any.
    pub fn session(&self) -> Option<&Arc<ConnectionSession>> {
        self.session.as_ref()
    }

    /// Mark the session ready and flush every deferred packet, in
    /// insertion order, through its callback.
    ///
    /// Runs under the session's queue lock so the send path cannot
    /// observe a half-drained store, and clamps the session's outbound
    /// counter to 2 first so data frames never reuse counter values the
    /// handshake consumed. Transient certificate state is dropped after
    /// the lock is released.
    pub fn complete_handshake(&mut self) {
        let session = match &self.session {
            Some(session) => session.clone(),
            None => {
                debug_assert!(false, "handshake completion without a bound session");
                return;
            }
        };

        let queue_guard = session.lock_queue();
        self.handshake_complete = true;
        session.clamp_message_counter(2);
        debug!(
            peer = %self.overlay_addr,
            stored = self.deferred.len(),
            "sending deferred packets"
        );
        let mut nonce_buf = [0u8; NONCE_LEN];
        let mut out_buf = vec![0u8; DEFAULT_MTU];
        let deferred = std::mem::take(&mut self.deferred);
        for packet in &deferred {
            (packet.callback)(
                packet.kind,
                packet.sub,
                self,
                &packet.payload,
                &mut nonce_buf,
                &mut out_buf,
            );
        }
        session.mark_ready();
        drop(queue_guard);
        session.clear_cert_state();
    }

    // === Handshake Progress ===

    /// When the handshake began (Unix ms). 0 = not started.
    pub fn handshake_start_ms(&self) -> u64 {
        self.handshake_start_ms
    }

    /// Stamp the handshake start time.
    pub fn set_handshake_start_ms(&mut self, now_ms: u64) {
        self.handshake_start_ms = now_ms;
    }

    /// Whether the local side has everything it needs to finish.
    pub fn handshake_ready(&self) -> bool {
        self.handshake_ready
    }

    /// Record local handshake readiness.
    pub fn set_handshake_ready(&mut self, ready: bool) {
        self.handshake_ready = ready;
    }

    /// Handshake attempts initiated so far.
    pub fn handshake_counter(&self) -> u32 {
        self.handshake_counter
    }

    /// Count another handshake attempt.
    pub fn record_handshake_attempt(&mut self) {
        self.handshake_counter += 1;
    }

    /// Whether key exchange has finished.
    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    /// Keep a handshake message for retransmission, keyed by stage.
    pub fn store_handshake_packet(&mut self, stage: u8, packet: &[u8]) {
        self.handshake_packets.insert(stage, packet.to_vec());
    }

    /// A stored handshake message, if any, for the given stage.
    pub fn handshake_packet(&self, stage: u8) -> Option<&[u8]> {
        self.handshake_packets.get(&stage).map(Vec::as_slice)
    }

    // === Session Indexes ===

    /// Index this node chose for the session. Zero = unassigned.
    pub fn local_index(&self) -> SessionIndex {
        self.local_index
    }

    /// Record the locally chosen session index.
    pub fn set_local_index(&mut self, index: SessionIndex) {
        self.local_index = index;
    }

    /// Index the far side chose. Zero = unknown.
    pub fn remote_index(&self) -> SessionIndex {
        self.remote_index
    }

    /// Record the far side's session index.
    pub fn set_remote_index(&mut self, index: SessionIndex) {
        self.remote_index = index;
    }

    // === Receive Errors ===

    /// Count one decryption failure on this peer's session.
    ///
    /// Returns false for the first [`RECV_ERROR_THRESHOLD`] calls and true
    /// from then on; the caller treats true as the signal to start a fresh
    /// handshake.
    pub fn recv_error_exceeded(&mut self) -> bool {
        if self.recv_errors < RECV_ERROR_THRESHOLD {
            self.recv_errors += 1;
            return false;
        }
        true
    }

    /// Consecutive receive failures recorded so far.
    pub fn recv_error_count(&self) -> u32 {
        self.recv_errors
    }

    // === Path MTU ===

    /// Record an externally observed MTU on every endpoint whose IP
    /// matches `remote` (port ignored).
    pub fn set_remote_mtu(&mut self, remote: &EndpointAddr, mtu: u16, now_ms: u64) {
        for endpoint in &mut self.endpoints {
            if endpoint.matches_ip(remote) {
                endpoint.set_path_mtu(mtu, now_ms);
                debug!(endpoint = %endpoint.addr(), mtu, "updated remote mtu");
            }
        }
    }
}

fn in_ranges(addr: EndpointAddr, ranges: &[Ipv4Net]) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ranges.iter().any(|range| range.contains(&ip)),
        IpAddr::V6(_) => false,
    }
}

impl Serialize for Peer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(16))?;
        map.serialize_entry("remote", &self.current_endpoint())?;
        map.serialize_entry("remotes", &self.endpoints)?;
        map.serialize_entry("promote_counter", &self.promote_counter)?;
        let session_ptr = self
            .session
            .as_ref()
            .map(|s| format!("{:p}", Arc::as_ptr(s)));
        map.serialize_entry("connection_state", &session_ptr)?;
        map.serialize_entry("handshake_start", &self.handshake_start_ms)?;
        map.serialize_entry("handshake_ready", &self.handshake_ready)?;
        map.serialize_entry("handshake_counter", &self.handshake_counter)?;
        map.serialize_entry("handshake_complete", &self.handshake_complete)?;
        map.serialize_entry("handshake_packet", &self.handshake_packets)?;
        map.serialize_entry("packet_store", &self.deferred)?;
        map.serialize_entry("remote_index", &self.remote_index)?;
        map.serialize_entry("local_index", &self.local_index)?;
        map.serialize_entry("host_id", &self.overlay_addr)?;
        map.serialize_entry("receive_errors", &self.recv_errors)?;
        map.serialize_entry("last_roam", &self.last_roam_ms)?;
        map.serialize_entry("last_roam_remote", &self.last_roam_endpoint)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockInterface {
        cached: Vec<EndpointAddr>,
        lighthouse_queries: Mutex<u32>,
        sent: Mutex<Vec<(PacketKind, PacketSubKind, EndpointAddr)>>,
    }

    impl MockInterface {
        fn with_cached(cached: Vec<EndpointAddr>) -> Self {
            Self {
                cached,
                ..Self::default()
            }
        }
    }

    impl Interface for MockInterface {
        fn lighthouse_cached_endpoints(&self, _addr: OverlayAddr) -> Vec<EndpointAddr> {
            *self.lighthouse_queries.lock().unwrap() += 1;
            self.cached.clone()
        }

        fn send(
            &self,
            kind: PacketKind,
            sub: PacketSubKind,
            _session: &ConnectionSession,
            _peer: &Peer,
            endpoint: &Endpoint,
            _payload: &[u8],
            _nonce_buf: &mut [u8],
            _out_buf: &mut [u8],
        ) {
            self.sent.lock().unwrap().push((kind, sub, endpoint.addr()));
        }
    }

    fn ep(s: &str) -> EndpointAddr {
        s.parse().unwrap()
    }

    fn ov(s: &str) -> OverlayAddr {
        s.parse().unwrap()
    }

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn make_peer() -> Peer {
        Peer::new(ov("10.0.0.5"))
    }

    #[test]
    fn test_add_endpoint_idempotent() {
        let mut peer = make_peer();
        peer.add_endpoint(ep("203.0.113.1:4242"));
        let returned = peer.add_endpoint(ep("203.0.113.1:4242")).addr();

        assert_eq!(peer.endpoints().len(), 1);
        assert_eq!(returned, ep("203.0.113.1:4242"));

        // Same IP, different port is a distinct endpoint.
        peer.add_endpoint(ep("203.0.113.1:9999"));
        assert_eq!(peer.endpoints().len(), 2);
    }

    #[test]
    fn test_add_endpoint_evicts_oldest() {
        let mut peer = make_peer();
        for i in 1..=12u8 {
            peer.add_endpoint(ep(&format!("203.0.113.{i}:4242")));
        }

        assert_eq!(peer.endpoints().len(), MAX_ENDPOINTS);
        let addrs = peer.endpoint_addrs();
        assert_eq!(addrs[0], ep("203.0.113.3:4242"));
        assert_eq!(addrs[9], ep("203.0.113.12:4242"));
    }

    #[test]
    fn test_eviction_shifts_current_index() {
        let mut peer = make_peer();
        for i in 1..=10u8 {
            peer.add_endpoint(ep(&format!("203.0.113.{i}:4242")));
        }
        peer.set_current(ep("203.0.113.5:4242"));

        peer.add_endpoint(ep("203.0.113.11:4242"));
        assert_eq!(
            peer.current_endpoint().unwrap().addr(),
            ep("203.0.113.5:4242")
        );
    }

    #[test]
    fn test_eviction_drops_current_when_evicted() {
        let mut peer = make_peer();
        for i in 1..=10u8 {
            peer.add_endpoint(ep(&format!("203.0.113.{i}:4242")));
        }
        peer.set_current(ep("203.0.113.1:4242"));

        peer.add_endpoint(ep("203.0.113.11:4242"));
        assert!(peer.current_endpoint().is_none());
    }

    #[test]
    fn test_rotate_wraps_from_last() {
        let mut peer = make_peer();
        peer.add_endpoint(ep("203.0.113.1:1"));
        peer.add_endpoint(ep("203.0.113.2:1"));
        peer.add_endpoint(ep("203.0.113.3:1"));
        peer.set_current(ep("203.0.113.3:1"));

        peer.rotate_endpoint();
        assert_eq!(peer.current_endpoint().unwrap().addr(), ep("203.0.113.1:1"));
    }

    #[test]
    fn test_rotate_visits_every_endpoint() {
        let mut peer = make_peer();
        let addrs = [ep("203.0.113.1:1"), ep("203.0.113.2:1"), ep("203.0.113.3:1")];
        for addr in addrs {
            peer.add_endpoint(addr);
        }
        peer.set_current(addrs[1]);
        let start = peer.current_endpoint().unwrap().addr();

        let mut seen = Vec::new();
        for _ in 0..addrs.len() {
            peer.rotate_endpoint();
            seen.push(peer.current_endpoint().unwrap().addr());
        }
        for addr in addrs {
            assert!(seen.contains(&addr));
        }
        assert_eq!(*seen.last().unwrap(), start);
    }

    #[test]
    fn test_rotate_empty_and_unset() {
        let mut peer = make_peer();
        peer.rotate_endpoint();
        assert!(peer.current_endpoint().is_none());

        peer.add_endpoint(ep("203.0.113.1:1"));
        peer.add_endpoint(ep("203.0.113.2:1"));
        peer.rotate_endpoint();
        assert_eq!(peer.current_endpoint().unwrap().addr(), ep("203.0.113.1:1"));
    }

    #[test]
    fn test_best_endpoint_prefers_ranges() {
        let mut peer = make_peer();
        peer.add_endpoint(ep("203.0.113.1:4242"));
        peer.add_endpoint(ep("192.168.1.5:4242"));

        let ranges = [net("192.168.0.0/16")];
        let (best, preferred) = peer.best_endpoint(&ranges);
        assert!(preferred);
        assert_eq!(best.unwrap().addr(), ep("192.168.1.5:4242"));
    }

    #[test]
    fn test_best_endpoint_last_public_fallback() {
        let mut peer = make_peer();
        peer.add_endpoint(ep("10.1.1.1:4242"));
        peer.add_endpoint(ep("203.0.113.9:4242"));
        peer.add_endpoint(ep("192.168.0.5:4242"));

        let (best, preferred) = peer.best_endpoint(&[]);
        assert!(!preferred);
        assert_eq!(best.unwrap().addr(), ep("203.0.113.9:4242"));
    }

    #[test]
    fn test_best_endpoint_all_private_first_wins() {
        let mut peer = make_peer();
        peer.add_endpoint(ep("10.1.1.1:4242"));
        peer.add_endpoint(ep("192.168.0.5:4242"));

        let (best, preferred) = peer.best_endpoint(&[]);
        assert!(!preferred);
        assert_eq!(best.unwrap().addr(), ep("10.1.1.1:4242"));
    }

    #[test]
    fn test_best_endpoint_empty() {
        let peer = make_peer();
        let (best, preferred) = peer.best_endpoint(&[]);
        assert!(best.is_none());
        assert!(!preferred);
    }

    #[test]
    fn test_force_promote_switches_to_preferred() {
        let mut peer = make_peer();
        peer.add_endpoint(ep("203.0.113.1:4242"));
        peer.add_endpoint(ep("192.168.1.5:4242"));
        peer.set_current(ep("203.0.113.1:4242"));

        peer.force_promote(&[net("192.168.0.0/16")]);
        assert_eq!(
            peer.current_endpoint().unwrap().addr(),
            ep("192.168.1.5:4242")
        );
    }

    #[test]
    fn test_try_promote_sets_current_when_unset() {
        let mut peer = make_peer();
        peer.add_endpoint(ep("203.0.113.1:4242"));
        let iface = MockInterface::default();

        peer.try_promote(&[], &iface);
        assert_eq!(
            peer.current_endpoint().unwrap().addr(),
            ep("203.0.113.1:4242")
        );
        assert_eq!(peer.promote_counter(), 0);
    }

    #[test]
    fn test_try_promote_probes_preferred_candidate() {
        let mut peer = make_peer();
        peer.set_current(ep("203.0.113.1:4242"));
        peer.bind_session(Arc::new(ConnectionSession::new()));

        let ranges = [net("192.168.0.0/16")];
        let iface = MockInterface::with_cached(vec![ep("192.168.1.5:4242")]);

        for _ in 0..PROMOTE_EVERY {
            peer.try_promote(&ranges, &iface);
        }

        assert_eq!(*iface.lighthouse_queries.lock().unwrap(), 1);
        let sent = iface.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![(
                PacketKind::Test,
                PacketSubKind::TestRequest,
                ep("192.168.1.5:4242")
            )]
        );
        drop(sent);

        // The switch waits for a return packet; current is unchanged.
        assert_eq!(
            peer.current_endpoint().unwrap().addr(),
            ep("203.0.113.1:4242")
        );
        assert!(peer.has_endpoint_ip(&ep("192.168.1.5:1")));
    }

    #[test]
    fn test_try_promote_skips_when_current_preferred() {
        let mut peer = make_peer();
        peer.set_current(ep("192.168.1.5:4242"));
        peer.bind_session(Arc::new(ConnectionSession::new()));

        let ranges = [net("192.168.0.0/16")];
        let iface = MockInterface::with_cached(vec![ep("192.168.2.2:4242")]);

        for _ in 0..PROMOTE_EVERY {
            peer.try_promote(&ranges, &iface);
        }
        assert_eq!(*iface.lighthouse_queries.lock().unwrap(), 0);
        assert!(iface.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cache_packet_cap() {
        let mut peer = make_peer();
        let callback: PacketCallback = Arc::new(|_, _, _, _, _, _| {});
        for i in 0..(DEFERRED_PACKET_CAP + 10) {
            peer.cache_packet(
                PacketKind::Data,
                PacketSubKind::None,
                &[i as u8],
                callback.clone(),
            );
        }
        assert_eq!(peer.deferred_packets().len(), DEFERRED_PACKET_CAP);
    }

    #[test]
    fn test_complete_handshake_flushes_in_order() {
        let mut peer = make_peer();
        let session = Arc::new(ConnectionSession::new());
        peer.bind_session(session.clone());
        session.set_cert_state(crate::session::CertState::new(vec![0xca]));

        let flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = flushed.clone();
        let callback: PacketCallback = Arc::new(move |_, _, _, payload, _, _| {
            sink.lock().unwrap().push(payload.to_vec());
        });

        for payload in [b"p1".as_slice(), b"p2".as_slice(), b"p3".as_slice()] {
            peer.cache_packet(
                PacketKind::Data,
                PacketSubKind::None,
                payload,
                callback.clone(),
            );
        }

        peer.complete_handshake();

        assert_eq!(
            *flushed.lock().unwrap(),
            vec![b"p1".to_vec(), b"p2".to_vec(), b"p3".to_vec()]
        );
        assert!(peer.deferred_packets().is_empty());
        assert!(peer.handshake_complete());
        assert!(session.is_ready());
        assert_eq!(session.message_counter(), 2);
        assert!(!session.has_cert_state());
    }

    #[test]
    fn test_recv_error_threshold() {
        let mut peer = make_peer();
        assert!(!peer.recv_error_exceeded());
        assert!(!peer.recv_error_exceeded());
        assert!(!peer.recv_error_exceeded());
        assert!(peer.recv_error_exceeded());
        assert!(peer.recv_error_exceeded());
    }

    #[test]
    fn test_roaming_suppression_window() {
        let mut peer = make_peer();
        peer.set_current(ep("203.0.113.1:4242"));

        assert!(peer.roam_to(ep("203.0.113.2:4242"), 10_000));
        assert_eq!(
            peer.last_roam_endpoint().unwrap().addr(),
            ep("203.0.113.1:4242")
        );

        // Inside the window: ignored, state untouched.
        assert!(!peer.roam_to(ep("203.0.113.3:4242"), 11_000));
        assert_eq!(
            peer.current_endpoint().unwrap().addr(),
            ep("203.0.113.2:4242")
        );
        assert_eq!(peer.last_roam_ms(), 10_000);

        // Window elapsed: accepted.
        assert!(peer.roam_to(ep("203.0.113.3:4242"), 10_000 + ROAMING_SUPPRESS_MS));
        assert_eq!(
            peer.current_endpoint().unwrap().addr(),
            ep("203.0.113.3:4242")
        );
        assert_eq!(
            peer.last_roam_endpoint().unwrap().addr(),
            ep("203.0.113.2:4242")
        );
    }

    #[test]
    fn test_set_remote_mtu_port_blind() {
        let mut peer = make_peer();
        peer.add_endpoint(ep("203.0.113.1:4242"));
        peer.add_endpoint(ep("203.0.113.1:9999"));
        peer.add_endpoint(ep("203.0.113.2:4242"));

        peer.set_remote_mtu(&ep("203.0.113.1:0"), 1500, 5_000);

        let mtus: Vec<u16> = peer.endpoints().iter().map(|e| e.cached_mtu()).collect();
        let expected = 1500 - crate::packet::OVERLAY_OVERHEAD as u16;
        assert_eq!(mtus, vec![expected, expected, 0]);
    }

    #[test]
    fn test_handshake_packet_store() {
        let mut peer = make_peer();
        peer.store_handshake_packet(0, b"stage0");
        peer.store_handshake_packet(2, b"stage2");

        assert_eq!(peer.handshake_packet(0), Some(b"stage0".as_slice()));
        assert_eq!(peer.handshake_packet(1), None);
        assert_eq!(peer.handshake_packet(2), Some(b"stage2".as_slice()));
    }

    #[test]
    fn test_serialized_field_names() {
        let mut peer = make_peer();
        peer.set_current(ep("203.0.113.1:4242"));
        peer.bind_session(Arc::new(ConnectionSession::new()));
        peer.store_handshake_packet(1, b"hs");
        peer.cache_packet(
            PacketKind::Data,
            PacketSubKind::None,
            b"secret",
            Arc::new(|_, _, _, _, _, _| {}),
        );
        peer.set_local_index(SessionIndex::new(7));
        peer.set_remote_index(SessionIndex::new(9));

        let v = serde_json::to_value(&peer).unwrap();
        for key in [
            "remote",
            "remotes",
            "promote_counter",
            "connection_state",
            "handshake_start",
            "handshake_ready",
            "handshake_counter",
            "handshake_complete",
            "handshake_packet",
            "packet_store",
            "remote_index",
            "local_index",
            "host_id",
            "receive_errors",
            "last_roam",
            "last_roam_remote",
        ] {
            assert!(v.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(v["host_id"], "10.0.0.5");
        assert_eq!(v["local_index"], 7);
        assert_eq!(v["remote_index"], 9);
        assert_eq!(v["remote"]["address"], "203.0.113.1:4242");
        // Deferred entries serialize empty; payload bytes never appear.
        assert_eq!(v["packet_store"], serde_json::json!([{}]));
        assert!(v["connection_state"].is_string());
    }
}
