//! # Utility Helpers
//!
//! Small shared helpers with no broker semantics of their own.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current timestamp as milliseconds since the Unix epoch
///
/// Used as the leading component of payload-store keys. If the system
/// clock reads before the epoch, returns 0 rather than panicking; key
/// uniqueness is carried by the per-client counter, not the timestamp.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
