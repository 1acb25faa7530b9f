//! Candidate Endpoint
//!
//! One transport address through which a peer may be reachable, plus
//! path-MTU metadata populated only when MTU discovery is enabled. The
//! probe counter is reserved for path-quality grading and is carried so
//! the operator debug format stays stable if grading is revived.

use crate::addr::EndpointAddr;
use crate::iface::MtuResolver;
use crate::packet::OVERLAY_OVERHEAD;
use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::{debug, error};

/// How long a path-MTU observation stays fresh before the OS is asked
/// again.
pub const MTU_TIMEOUT_MS: u64 = 60_000;

/// A single candidate transport address for a peer.
#[derive(Clone, Debug)]
pub struct Endpoint {
    addr: EndpointAddr,
    /// Discovered path MTU toward this endpoint. 0 = unknown.
    mtu: u16,
    /// When the MTU was last observed (Unix ms). 0 = never.
    mtu_timestamp_ms: u64,
    /// Reserved for path-quality grading.
    probe_counter: u32,
}

impl Endpoint {
    /// Create an endpoint with no MTU observation.
    pub fn new(addr: EndpointAddr) -> Self {
        Self {
            addr,
            mtu: 0,
            mtu_timestamp_ms: 0,
            probe_counter: 0,
        }
    }

    /// The transport address of this endpoint.
    pub fn addr(&self) -> EndpointAddr {
        self.addr
    }

    /// Compare IP portions only, ignoring the port.
    pub fn matches_ip(&self, other: &EndpointAddr) -> bool {
        self.addr.ip_equals(other)
    }

    /// The cached path MTU, refreshed through the OS hook when never
    /// observed or older than [`MTU_TIMEOUT_MS`].
    ///
    /// Lookup failures are logged and the stale (or zero) value returned.
    pub fn path_mtu(&mut self, now_ms: u64, resolver: &dyn MtuResolver) -> u16 {
        if self.mtu_timestamp_ms == 0
            || now_ms.saturating_sub(self.mtu_timestamp_ms) > MTU_TIMEOUT_MS
        {
            self.mtu_timestamp_ms = now_ms;
            match resolver.known_mtu(self.addr.ip()) {
                Ok(found) => {
                    self.mtu = found;
                    debug!(addr = %self.addr, mtu = found, "looked up known path mtu");
                }
                Err(err) => {
                    error!(addr = %self.addr, %err, "failed to look up current path mtu");
                }
            }
        }
        self.mtu
    }

    /// Record an externally reported MTU, net of the per-packet overlay
    /// overhead.
    pub fn set_path_mtu(&mut self, observed: u16, now_ms: u64) {
        self.mtu_timestamp_ms = now_ms;
        self.mtu = observed.saturating_sub(OVERLAY_OVERHEAD as u16);
    }

    /// The cached MTU without triggering a refresh. 0 = unknown.
    pub fn cached_mtu(&self) -> u16 {
        self.mtu
    }

    /// When the MTU was last observed (Unix ms). 0 = never.
    pub fn mtu_observed_at_ms(&self) -> u64 {
        self.mtu_timestamp_ms
    }

    /// Reserved path-quality probe counter.
    pub fn probe_counter(&self) -> u32 {
        self.probe_counter
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let observed = self.mtu_timestamp_ms != 0;
        let mut map = serializer.serialize_map(Some(if observed { 4 } else { 2 }))?;
        map.serialize_entry("address", &self.addr)?;
        map.serialize_entry("probe_count", &self.probe_counter)?;
        if observed {
            map.serialize_entry("mtu", &self.mtu)?;
            map.serialize_entry("mtu_timestamp", &self.mtu_timestamp_ms)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::net::IpAddr;
    use std::sync::Mutex;

    struct FixedMtu(u16);

    impl MtuResolver for FixedMtu {
        fn known_mtu(&self, _ip: IpAddr) -> io::Result<u16> {
            Ok(self.0)
        }
    }

    struct CountingMtu {
        mtu: u16,
        calls: Mutex<u32>,
    }

    impl MtuResolver for CountingMtu {
        fn known_mtu(&self, _ip: IpAddr) -> io::Result<u16> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.mtu)
        }
    }

    struct FailingMtu;

    impl MtuResolver for FailingMtu {
        fn known_mtu(&self, _ip: IpAddr) -> io::Result<u16> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no route"))
        }
    }

    fn ep(s: &str) -> Endpoint {
        Endpoint::new(s.parse().unwrap())
    }

    #[test]
    fn test_matches_ip_ignores_port() {
        let e = ep("203.0.113.1:4242");
        assert!(e.matches_ip(&"203.0.113.1:9999".parse().unwrap()));
        assert!(!e.matches_ip(&"203.0.113.2:4242".parse().unwrap()));
    }

    #[test]
    fn test_path_mtu_refreshes_only_after_timeout() {
        let resolver = CountingMtu {
            mtu: 1500,
            calls: Mutex::new(0),
        };
        let mut e = ep("203.0.113.1:4242");

        assert_eq!(e.path_mtu(1_000, &resolver), 1500);
        assert_eq!(*resolver.calls.lock().unwrap(), 1);

        // Still fresh: no second lookup.
        assert_eq!(e.path_mtu(30_000, &resolver), 1500);
        assert_eq!(*resolver.calls.lock().unwrap(), 1);

        // Past the timeout: refreshed.
        assert_eq!(e.path_mtu(1_000 + MTU_TIMEOUT_MS + 1, &resolver), 1500);
        assert_eq!(*resolver.calls.lock().unwrap(), 2);
    }

    #[test]
    fn test_path_mtu_failure_keeps_cached_value() {
        let mut e = ep("203.0.113.1:4242");
        e.set_path_mtu(1500, 1_000);
        let cached = e.cached_mtu();

        let refreshed = e.path_mtu(1_000 + MTU_TIMEOUT_MS + 1, &FailingMtu);
        assert_eq!(refreshed, cached);
        // The failed attempt still stamps the timestamp, so the next call
        // within the window does not retry.
        assert_eq!(e.mtu_observed_at_ms(), 1_000 + MTU_TIMEOUT_MS + 1);
    }

    #[test]
    fn test_path_mtu_failure_on_first_lookup_returns_zero() {
        let mut e = ep("203.0.113.1:4242");
        assert_eq!(e.path_mtu(1_000, &FailingMtu), 0);
        assert_eq!(e.path_mtu(1_000, &FixedMtu(1500)), 0); // still fresh
    }

    #[test]
    fn test_set_path_mtu_subtracts_overhead() {
        let mut e = ep("203.0.113.1:4242");
        e.set_path_mtu(1500, 2_000);
        assert_eq!(e.cached_mtu(), 1500 - OVERLAY_OVERHEAD as u16);
        assert_eq!(e.mtu_observed_at_ms(), 2_000);

        e.set_path_mtu(10, 3_000);
        assert_eq!(e.cached_mtu(), 0);
    }

    #[test]
    fn test_serialize_omits_mtu_until_observed() {
        let e = ep("203.0.113.1:4242");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["address"], "203.0.113.1:4242");
        assert_eq!(v["probe_count"], 0);
        assert!(v.get("mtu").is_none());
        assert!(v.get("mtu_timestamp").is_none());

        let mut e = e;
        e.set_path_mtu(1500, 1_234);
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["mtu"], 1500 - OVERLAY_OVERHEAD as u64);
        assert_eq!(v["mtu_timestamp"], 1_234);
    }
}
