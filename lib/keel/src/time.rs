use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds elapsed since the Unix epoch. Ban expiry timestamps and
/// command log lines all use this resolution.
#[inline]
pub fn timestamp_usecs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_micros() as u64
}
