//! Small shared helpers that don't belong to any one component.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in whole seconds since the epoch, used by
/// [`crate::rate::RateWindow`]. Only differences are ever compared, so a
/// clock jump affects freshness but never panics.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
