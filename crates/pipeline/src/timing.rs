//! Wall-clock helpers shared across the engine.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, used for log event timestamps and
/// cache entry bookkeeping. Saturates to 0 rather than panicking if the
/// system clock is set before the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
