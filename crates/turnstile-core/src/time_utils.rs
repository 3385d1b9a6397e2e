use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch; saturates instead of failing.
pub fn current_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_ms)
        .unwrap_or_default()
}

/// Whole milliseconds in `duration`, clamped to `u64::MAX`.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Deadline `window` after `started_unix_ms`.
pub fn unix_ms_deadline(started_unix_ms: u64, window: Duration) -> u64 {
    started_unix_ms.saturating_add(duration_ms(window))
}

/// A deadline is reached at its own instant; `None` never expires.
pub fn is_past_deadline(deadline_unix_ms: Option<u64>, now_unix_ms: u64) -> bool {
    deadline_unix_ms.is_some_and(|deadline| deadline <= now_unix_ms)
}
