//! Monotonic timebase.
//!
//! [`Time`] is an absolute instant measured in microseconds since the
//! process started; [`Duration`] is a span between instants. The scheduler
//! sorts sleeping tasks by `Time` and `delay(ms)` carries a `Duration`.

use std::ops::{Add, Sub};
use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// A span of time with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(u64);

impl Duration {
    /// Zero-length span.
    pub const ZERO: Duration = Duration(0);

    /// Span from whole milliseconds.
    pub fn from_millis(ms: u64) -> Duration {
        Duration(ms.saturating_mul(1000))
    }

    /// Span from whole microseconds.
    pub fn from_micros(us: u64) -> Duration {
        Duration(us)
    }

    /// Whole milliseconds (truncating).
    pub fn as_millis(self) -> u64 {
        self.0 / 1000
    }

    /// Whole microseconds.
    pub fn as_micros(self) -> u64 {
        self.0
    }

    /// Conversion for host sleep calls.
    pub fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_micros(self.0)
    }
}

/// An absolute instant on the runtime's monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time(u64);

impl Time {
    /// The current instant.
    pub fn now() -> Time {
        Time(epoch().elapsed().as_micros() as u64)
    }

    /// The farthest representable instant; used as the idle deadline.
    pub fn longest() -> Time {
        Time(u64::MAX)
    }

    /// Seconds since the process started, with microsecond precision.
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Raw microsecond count.
    pub fn as_micros(self) -> u64 {
        self.0
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, d: Duration) -> Time {
        Time(self.0.saturating_add(d.0))
    }
}

impl Sub<Time> for Time {
    type Output = Duration;

    fn sub(self, other: Time) -> Duration {
        Duration(self.0.saturating_sub(other.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_millis_round_trip() {
        let d = Duration::from_millis(250);
        assert_eq!(d.as_millis(), 250);
        assert_eq!(d.as_micros(), 250_000);
    }

    #[test]
    fn test_time_is_monotonic() {
        let a = Time::now();
        let b = Time::now();
        assert!(b >= a);
    }

    #[test]
    fn test_time_arithmetic() {
        let t = Time::now();
        let later = t + Duration::from_millis(5);
        assert!(later > t);
        assert_eq!((later - t).as_millis(), 5);
    }

    #[test]
    fn test_longest_sorts_last() {
        assert!(Time::longest() > Time::now() + Duration::from_millis(1_000_000));
    }
}
