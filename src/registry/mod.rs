//! The Peer Registry
//!
//! Two concurrently accessed mappings — overlay address → peer and local
//! session index → peer — behind a single reader-writer lock, plus the
//! lookup and mutation primitives the data path, receive path, and
//! handshake engine drive.
//!
//! A peer may be bound in neither, either, or both maps during its
//! lifecycle: session indexes are chosen locally at session allocation,
//! while overlay addresses come from certificates validated during the
//! handshake, so the two keys legitimately appear at different moments.
//!
//! ## Locking
//!
//! The registry lock covers both maps together; reads take shared
//! access, structural mutations exclusive. Peer fields are guarded by the
//! per-peer lock inside [`PeerHandle`], never by the registry lock. Lock
//! order is always registry → peer, and no hook (lighthouse read, packet
//! emission, punch write) runs with the registry lock held.


use crate::addr::{EndpointAddr, OverlayAddr, SessionIndex};
use crate::config::RegistryConfig;
use crate::iface::{Interface, UdpWriter};
use crate::metrics::{MetricsSink, NullMetrics};
use crate::peer::Peer;
use crate::session::ConnectionSession;
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{
    Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Delay between hole-punch rounds.
pub const PUNCH_INTERVAL: Duration = Duration::from_secs(30);

/// Errors related to registry lookups and bindings.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no peer for overlay address {0}")]
    OverlayNotFound(OverlayAddr),

    #[error("no peer for local index {0}")]
    IndexNotFound(SessionIndex),

    #[error("refusing to overwrite existing index {0}")]
    IndexCollision(SessionIndex),

    #[error("no peer with remote index {index} in {name} registry")]
    ReverseIndexNotFound { index: SessionIndex, name: String },
}

/// A shared, lockable reference to a peer record.
///
/// Registry queries hand these out; the reference stays usable after the
/// peer is removed from the maps — operations on a removed peer are safe,
/// the peer is simply no longer found by future lookups. Lock poisoning
/// is recovered rather than propagated, so one panicked writer does not
/// wedge every packet thread.
#[derive(Clone, Debug)]
pub struct PeerHandle(Arc<RwLock<Peer>>);

impl PeerHandle {
    /// Wrap a peer record.
    pub fn new(peer: Peer) -> Self {
        Self(Arc::new(RwLock::new(peer)))
    }

    /// Shared access to the peer.
    pub fn read(&self) -> RwLockReadGuard<'_, Peer> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access to the peer.
    pub fn write(&self) -> RwLockWriteGuard<'_, Peer> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether two handles refer to the same peer record.
    pub fn same_peer(&self, other: &PeerHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// The two peer maps, guarded together.
#[derive(Default)]
struct PeerMaps {
    by_overlay: HashMap<OverlayAddr, PeerHandle>,
    by_index: HashMap<SessionIndex, PeerHandle>,
}

impl PeerMaps {
    /// Single iteration seam for the linear-scan queries, so a dedicated
    /// reverse index can replace the scans without touching callers.
    fn scan_all(&self) -> impl Iterator<Item = &PeerHandle> {
        self.by_index.values().chain(self.by_overlay.values())
    }

    fn scan_overlay(&self) -> impl Iterator<Item = &PeerHandle> {
        self.by_overlay.values()
    }
}

/// The in-memory peer registry.
pub struct Registry {
    name: String,
    overlay_cidr: Ipv4Net,
    preferred_ranges: Vec<Ipv4Net>,
    /// Raw overlay address of the default-route peer. 0 = unset.
    default_route: AtomicU32,
    maps: RwLock<PeerMaps>,
    metrics: Arc<dyn MetricsSink>,
}

impl Registry {
    /// Create a registry that discards metrics.
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_metrics(config, Arc::new(NullMetrics))
    }

    /// Create a registry publishing gauges to the given sink.
    pub fn with_metrics(config: RegistryConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            name: config.name,
            overlay_cidr: config.overlay_cidr,
            preferred_ranges: config.preferred_ranges,
            default_route: AtomicU32::new(0),
            maps: RwLock::new(PeerMaps::default()),
            metrics,
        }
    }

    /// Name used in gauges and log fields.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The overlay's declared address range.
    pub fn overlay_cidr(&self) -> Ipv4Net {
        self.overlay_cidr
    }

    /// Underlay prefixes preferred during endpoint selection.
    pub fn preferred_ranges(&self) -> &[Ipv4Net] {
        &self.preferred_ranges
    }

    // === Overlay-Address Map ===

    /// Bind a peer under an overlay address, overwriting silently.
    pub fn add(&self, addr: OverlayAddr, peer: PeerHandle) {
        let mut maps = self.maps_write();
        maps.by_overlay.insert(addr, peer);
    }

    /// Get the peer for an overlay address, creating an empty record if
    /// none exists.
    pub fn add_overlay(&self, addr: OverlayAddr) -> PeerHandle {
        let mut maps = self.maps_write();
        if let Some(existing) = maps.by_overlay.get(&addr).cloned() {
            return existing;
        }
        let handle = PeerHandle::new(Peer::new(addr));
        maps.by_overlay.insert(addr, handle.clone());
        handle
    }

    /// Remove the peer bound to an overlay address.
    pub fn delete_overlay(&self, addr: OverlayAddr) {
        let total = {
            let mut maps = self.maps_write();
            maps.by_overlay.remove(&addr);
            if maps.by_overlay.is_empty() {
                // A long-lived process sheds the map's grown backing
                // storage once the last peer is gone.
                maps.by_overlay = HashMap::new();
            }
            maps.by_overlay.len()
        };
        debug!(registry = %self.name, addr = %addr, total, "overlay address deleted");
    }

    // === Session-Index Map ===

    /// Bind a fresh peer, created around the given session, under a local
    /// session index. Fails if the index is already in use; the handshake
    /// engine picks a new index and retries.
    pub fn add_index(
        &self,
        index: SessionIndex,
        session: Arc<ConnectionSession>,
    ) -> Result<PeerHandle, RegistryError> {
        let mut maps = self.maps_write();
        if maps.by_index.contains_key(&index) {
            return Err(RegistryError::IndexCollision(index));
        }
        let handle = PeerHandle::new(Peer::with_session(index, session));
        maps.by_index.insert(index, handle.clone());
        debug!(
            registry = %self.name,
            index = %index,
            total = maps.by_index.len(),
            "index added"
        );
        Ok(handle)
    }

    /// Bind an existing peer under a local session index, updating the
    /// peer's own index field.
    pub fn bind_index(&self, index: SessionIndex, peer: &PeerHandle) {
        let mut maps = self.maps_write();
        peer.write().set_local_index(index);
        maps.by_index.insert(index, peer.clone());
        debug!(
            registry = %self.name,
            index = %index,
            total = maps.by_index.len(),
            "index bound to existing peer"
        );
    }

    /// Bind an existing peer under an overlay address, updating the
    /// peer's own address field.
    pub fn bind_overlay(&self, addr: OverlayAddr, peer: &PeerHandle) {
        let mut maps = self.maps_write();
        peer.write().set_overlay_addr(addr);
        maps.by_overlay.insert(addr, peer.clone());
        debug!(
            registry = %self.name,
            addr = %addr,
            total = maps.by_overlay.len(),
            "overlay address bound to existing peer"
        );
    }

    /// Remove the peer bound to a local session index.
    pub fn delete_index(&self, index: SessionIndex) {
        let total = {
            let mut maps = self.maps_write();
            maps.by_index.remove(&index);
            if maps.by_index.is_empty() {
                maps.by_index = HashMap::new();
            }
            maps.by_index.len()
        };
        debug!(registry = %self.name, index = %index, total, "index deleted");
    }

    // === Lookups ===

    /// Look up a peer by local session index.
    pub fn query_index(&self, index: SessionIndex) -> Result<PeerHandle, RegistryError> {
        let maps = self.maps_read();
        match maps.by_index.get(&index) {
            Some(handle) => Ok(handle.clone()),
            None => {
                debug!(registry = %self.name, index = %index, "index lookup miss");
                Err(RegistryError::IndexNotFound(index))
            }
        }
    }

    /// Look up a peer by overlay address.
    ///
    /// An address outside the overlay range resolves to the deprecated
    /// default-route peer when one is configured and present; such hits
    /// skip endpoint promotion entirely.
    pub fn query_overlay(&self, addr: OverlayAddr) -> Result<PeerHandle, RegistryError> {
        self.query_overlay_inner(addr, None)
    }

    /// Look up a peer by overlay address and lazily promote its endpoint.
    ///
    /// This is the per-packet call on the data path: the handle is taken
    /// under the shared lock, the lock is released, and only then does
    /// promotion (and any probe emission) run against the peer itself.
    pub fn promote_and_query_overlay(
        &self,
        addr: OverlayAddr,
        iface: &dyn Interface,
    ) -> Result<PeerHandle, RegistryError> {
        self.query_overlay_inner(addr, Some(iface))
    }

    fn query_overlay_inner(
        &self,
        addr: OverlayAddr,
        promote: Option<&dyn Interface>,
    ) -> Result<PeerHandle, RegistryError> {
        let handle = {
            let maps = self.maps_read();
            if !self.overlay_cidr.contains(&addr.to_ipv4()) {
                let route = OverlayAddr::new(self.default_route.load(Ordering::SeqCst));
                if !route.is_unspecified() {
                    if let Some(fallback) = maps.by_overlay.get(&route) {
                        return Ok(fallback.clone());
                    }
                }
            }
            match maps.by_overlay.get(&addr) {
                Some(handle) => handle.clone(),
                None => {
                    debug!(registry = %self.name, addr = %addr, "overlay lookup miss");
                    return Err(RegistryError::OverlayNotFound(addr));
                }
            }
        };
        if let Some(iface) = promote {
            handle.write().try_promote(&self.preferred_ranges, iface);
        }
        Ok(handle)
    }

    /// Find the peer whose recorded remote session index matches.
    ///
    /// Linear over both maps and used only at handshake completion;
    /// callers must not depend on its latency. Only peers with a bound
    /// session participate.
    pub fn query_reverse_index(
        &self,
        remote_index: SessionIndex,
    ) -> Result<PeerHandle, RegistryError> {
        let maps = self.maps_read();
        for handle in maps.scan_all() {
            let peer = handle.read();
            if peer.session().is_some() && peer.remote_index() == remote_index {
                drop(peer);
                return Ok(handle.clone());
            }
        }
        Err(RegistryError::ReverseIndexNotFound {
            index: remote_index,
            name: self.name.clone(),
        })
    }

    /// Every peer with at least one endpoint whose IP matches (ports
    /// ignored). Multiple peers can share a source IP behind NAT.
    pub fn query_transport_ip(&self, remote: &EndpointAddr) -> Vec<PeerHandle> {
        let maps = self.maps_read();
        maps.scan_overlay()
            .filter(|handle| handle.read().has_endpoint_ip(remote))
            .cloned()
            .collect()
    }

    /// The local session index bound for an overlay address.
    pub fn index_of_overlay(&self, addr: OverlayAddr) -> Result<SessionIndex, RegistryError> {
        let maps = self.maps_read();
        match maps.by_overlay.get(&addr) {
            Some(handle) => Ok(handle.read().local_index()),
            None => Err(RegistryError::OverlayNotFound(addr)),
        }
    }

    /// The overlay address recorded for a local session index.
    pub fn overlay_of_index(&self, index: SessionIndex) -> Result<OverlayAddr, RegistryError> {
        let maps = self.maps_read();
        match maps.by_index.get(&index) {
            Some(handle) => Ok(handle.read().overlay_addr()),
            None => Err(RegistryError::IndexNotFound(index)),
        }
    }

    // === Endpoint Admission ===

    /// Record that an overlay address was seen at a transport address.
    ///
    /// Extends the existing peer or creates one with this endpoint as the
    /// sole candidate and current, then re-runs promotion over the
    /// preferred ranges.
    pub fn add_endpoint(&self, addr: OverlayAddr, endpoint: EndpointAddr) -> PeerHandle {
        let mut maps = self.maps_write();
        let handle = match maps.by_overlay.get(&addr).cloned() {
            Some(existing) => {
                existing.write().add_endpoint(endpoint);
                existing
            }
            None => {
                let mut peer = Peer::new(addr);
                peer.set_current(endpoint);
                let handle = PeerHandle::new(peer);
                maps.by_overlay.insert(addr, handle.clone());
                debug!(
                    registry = %self.name,
                    addr = %addr,
                    endpoint = %endpoint,
                    total = maps.by_overlay.len(),
                    "endpoint added"
                );
                handle
            }
        };
        handle.write().force_promote(&self.preferred_ranges);
        handle
    }

    /// Clear the endpoint list of the peer at an overlay address, if any.
    pub fn clear_endpoints(&self, addr: OverlayAddr) {
        let maps = self.maps_write();
        if let Some(handle) = maps.by_overlay.get(&addr) {
            handle.write().clear_endpoints();
        }
    }

    // === Handshake State Queries ===

    /// Whether the peer at an overlay address has completed its
    /// handshake.
    pub fn handshake_complete_overlay(&self, addr: OverlayAddr) -> bool {
        let maps = self.maps_read();
        maps.by_overlay
            .get(&addr)
            .map(|handle| handle.read().handshake_complete())
            .unwrap_or(false)
    }

    /// Whether the peer at a local session index has completed its
    /// handshake.
    pub fn handshake_complete_index(&self, index: SessionIndex) -> bool {
        let maps = self.maps_read();
        maps.by_index
            .get(&index)
            .map(|handle| handle.read().handshake_complete())
            .unwrap_or(false)
    }

    // === Default Route ===

    /// Route overlay addresses outside the overlay range to this peer.
    ///
    /// A default-route hit bypasses endpoint promotion. This escape hatch
    /// predates real subnet routing and is kept only for compatibility.
    #[deprecated(note = "temporary escape hatch; do not extend")]
    pub fn set_default_route(&self, addr: OverlayAddr) {
        self.default_route.store(addr.as_u32(), Ordering::SeqCst);
    }

    // === Hole Punching ===

    /// Every endpoint of every peer, snapshotted under the shared lock.
    pub fn punch_list(&self) -> Vec<EndpointAddr> {
        let maps = self.maps_read();
        let mut list = Vec::new();
        for handle in maps.scan_overlay() {
            list.extend(handle.read().endpoint_addrs());
        }
        list
    }

    /// Emit one byte to every punch-list entry, forever, sleeping
    /// [`PUNCH_INTERVAL`] between rounds. Run this on a dedicated thread;
    /// the snapshot is taken under the shared lock and the writes happen
    /// after release.
    pub fn punch_loop(&self, writer: &dyn UdpWriter) {
        loop {
            for addr in self.punch_list() {
                if let Err(err) = writer.write_to(&[1], &addr) {
                    debug!(endpoint = %addr, %err, "hole punch failed");
                }
            }
            thread::sleep(PUNCH_INTERVAL);
        }
    }

    // === Stats ===

    /// Number of peers bound by overlay address.
    pub fn peer_count(&self) -> usize {
        self.maps_read().by_overlay.len()
    }

    /// Number of peers bound by local session index.
    pub fn index_count(&self) -> usize {
        self.maps_read().by_index.len()
    }

    /// Publish both map sizes as gauges under the given name.
    pub fn emit_stats(&self, name: &str) {
        let (peers, indexes) = {
            let maps = self.maps_read();
            (maps.by_overlay.len(), maps.by_index.len())
        };
        self.metrics
            .gauge(&format!("registry.{name}.peers"), peers as i64);
        self.metrics
            .gauge(&format!("registry.{name}.indexes"), indexes as i64);
    }

    fn maps_read(&self) -> RwLockReadGuard<'_, PeerMaps> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn maps_write(&self) -> RwLockWriteGuard<'_, PeerMaps> {
        self.maps.write().unwrap_or_else(PoisonError::into_inner)
    }
}
