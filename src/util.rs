use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch for `time`, saturating at zero for clocks set before it.
pub fn system_time_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    system_time_millis(SystemTime::now())
}
