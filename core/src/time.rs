use std::time::{Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Monotonic millisecond tick counter, used to build synthetic SIDs for locally
/// accepted connections (`"<fd>-<ticks_ms_hex>"`, see local_listener).
#[inline]
pub fn ticks_ms(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}

/// Guard against a clock that hasn't been set yet (common on first boot of an SBC with
/// no RTC battery): year-2000 sentinel used by the supervisor to skip DNS-staleness
/// decisions until a real wall clock is available.
pub const CLOCK_SENTINEL: u64 = 0x2764_0000;

#[inline]
pub fn clock_is_sane() -> bool {
    timestamp_secs() >= CLOCK_SENTINEL
}
