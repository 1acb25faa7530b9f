//! Wall-clock helper.
//!
//! State-machine methods across the crate take explicit `now_ms`
//! arguments; embedders read the clock once per event and thread the value
//! through, which keeps the timing logic deterministic under test.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
