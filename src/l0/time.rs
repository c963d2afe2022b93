//! src/l0/time.rs
//! Monotonic tick source, timespan conversions, absolute-wakeup computation.
//!
//! Every suspension point in [`crate::ukern`] expresses its deadline as an
//! absolute tick rather than a relative duration, so that a fiber re-checking
//! its wait predicate after a spurious wakeup never computes a fresh (and
//! therefore wrong) relative timeout. `GetAbsoluteTimeToWakeup` is the single
//! place that conversion happens.

use std::time::{Duration, Instant};

/// A monotonic tick count. Not wall-clock time; only differences are
/// meaningful. Backed by `Instant` internally but exposed as an opaque `u64`
/// of nanoseconds since the runtime's epoch so it can be stored in the same
/// word as other scheduler bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(pub u64);

/// Sentinel meaning "wait forever" — never completes early, never completes
/// at all unless explicitly woken.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Process-wide monotonic clock. A single `Instant` epoch is established on
/// first use; all [`Tick`] values are nanoseconds elapsed since that epoch.
pub struct TickSource {
    epoch: Instant,
}

impl TickSource {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    #[inline]
    pub fn now(&self) -> Tick {
        Tick(self.epoch.elapsed().as_nanos() as u64)
    }

    /// Query the effective tick frequency. The host clock is nanosecond
    /// resolution, so this is fixed; kept as a method rather than a constant
    /// so call sites read like the host-OS query-frequency API they model.
    #[inline]
    pub const fn frequency_hz(&self) -> u64 {
        1_000_000_000
    }
}

impl Default for TickSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a relative timeout (in nanoseconds, `0` meaning "no timeout") to
/// an absolute deadline tick, rounding up to never complete early.
///
/// `GetAbsoluteTimeToWakeup(0)` always returns [`NO_TIMEOUT`].
pub fn get_absolute_time_to_wakeup(tick_source: &TickSource, relative_timeout_ns: i64) -> u64 {
    if relative_timeout_ns <= 0 {
        return NO_TIMEOUT;
    }
    let now = tick_source.now().0;
    // Round up: a positive timeout must never be observed as already-elapsed
    // due to truncation.
    now.saturating_add(relative_timeout_ns as u64)
}

/// A duration expressed in whole nanoseconds, used for user-facing APIs that
/// accept a relative wait (`Sleep`, `WaitOnAddress`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeSpan(pub i64);

impl TimeSpan {
    pub const ZERO: TimeSpan = TimeSpan(0);
    pub const FOREVER: TimeSpan = TimeSpan(-1);

    pub fn from_nanoseconds(ns: i64) -> Self {
        TimeSpan(ns)
    }
    pub fn from_milliseconds(ms: i64) -> Self {
        TimeSpan(ms.saturating_mul(1_000_000))
    }
    pub fn as_duration(self) -> Option<Duration> {
        if self.0 <= 0 {
            None
        } else {
            Some(Duration::from_nanos(self.0 as u64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_relative_timeout_is_no_timeout() {
        let src = TickSource::new();
        assert_eq!(get_absolute_time_to_wakeup(&src, 0), NO_TIMEOUT);
        assert_eq!(get_absolute_time_to_wakeup(&src, -5), NO_TIMEOUT);
    }

    #[test]
    fn positive_timeout_never_completes_early() {
        let src = TickSource::new();
        let before = src.now().0;
        let deadline = get_absolute_time_to_wakeup(&src, 1_000_000);
        assert!(deadline >= before + 1_000_000);
    }

    #[test]
    fn ticks_are_monotonic() {
        let src = TickSource::new();
        let a = src.now();
        std::thread::sleep(Duration::from_millis(1));
        let b = src.now();
        assert!(b >= a);
    }
}
