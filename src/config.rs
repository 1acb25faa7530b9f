//! Registry Configuration
//!
//! Construction-time settings for a peer registry. The struct derives
//! serde so the relevant section of a node's YAML configuration can be
//! deserialized straight into it, e.g.:
//!
//! ```yaml
//! name: main
//! overlay_cidr: 10.0.0.0/8
//! preferred_ranges:
//!   - 192.168.0.0/16
//! ```

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Fixed configuration for one registry instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Name used in gauge names and log fields.
    pub name: String,

    /// The overlay's declared address range. Overlay addresses outside it
    /// are only reachable through the deprecated default route.
    pub overlay_cidr: Ipv4Net,

    /// Underlay prefixes whose endpoints are strictly preferred when
    /// selecting a peer's current endpoint.
    #[serde(default)]
    pub preferred_ranges: Vec<Ipv4Net>,
}

impl RegistryConfig {
    /// Create a configuration with no preferred ranges.
    pub fn new(name: impl Into<String>, overlay_cidr: Ipv4Net) -> Self {
        Self {
            name: name.into(),
            overlay_cidr,
            preferred_ranges: Vec::new(),
        }
    }

    /// Replace the preferred-range list.
    pub fn with_preferred_ranges(mut self, ranges: Vec<Ipv4Net>) -> Self {
        self.preferred_ranges = ranges;
        self
    }
}
