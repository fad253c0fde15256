//! Time helpers.
//!
//! In-process bookkeeping uses `tokio::time::Instant` so tests can pause the
//! clock; only persisted records carry wall-clock milliseconds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Whole milliseconds in a duration, saturating at `u64::MAX`.
pub fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Fold one sample into a running mean over `count` samples (including this one).
pub fn incremental_mean(mean: f64, sample: f64, count: u64) -> f64 {
    if count == 0 {
        return mean;
    }
    mean + (sample - mean) / count as f64
}
