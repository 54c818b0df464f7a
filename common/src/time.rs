//! Time utilities shared by the tracker and the reducers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// Used to stamp reducer registrations. A clock set before 1970 yields 0
/// rather than a panic.
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Blocks per second over `elapsed`. Zero-length intervals count as one millisecond.
pub fn blocks_per_second(blocks: u64, elapsed: Duration) -> f64 {
    let millis = elapsed.as_millis().max(1) as f64;
    blocks as f64 * 1000.0 / millis
}
