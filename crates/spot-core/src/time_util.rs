//! Wall-clock timestamps.
//!
//! Client-facing messages carry **milliseconds since Unix epoch**, the unit
//! browser clients expect from `Date.now()`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
