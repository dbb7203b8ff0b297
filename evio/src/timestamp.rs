//! Monotonic microsecond-resolution timestamps.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Microseconds per second.
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// A point in time on the monotonic clock, in microseconds.
///
/// The epoch is arbitrary (whatever `CLOCK_MONOTONIC` reports), so values
/// are only meaningful relative to each other within one process. Ordering
/// and arithmetic are total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Sample the monotonic clock.
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        Timestamp(ts.tv_sec as i64 * MICROS_PER_SECOND + ts.tv_nsec as i64 / 1_000)
    }

    /// Build a timestamp from a raw microsecond count.
    pub fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    /// The raw microsecond count.
    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// An invalid (zero) timestamp, ordered before every sampled one.
    pub fn invalid() -> Self {
        Timestamp(0)
    }

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl Add<i64> for Timestamp {
    type Output = Timestamp;

    /// Offset by a microsecond count.
    fn add(self, micros: i64) -> Timestamp {
        Timestamp(self.0 + micros)
    }
}

impl AddAssign<i64> for Timestamp {
    fn add_assign(&mut self, micros: i64) {
        self.0 += micros;
    }
}

impl Sub<i64> for Timestamp {
    type Output = Timestamp;

    fn sub(self, micros: i64) -> Timestamp {
        Timestamp(self.0 - micros)
    }
}

impl Sub for Timestamp {
    type Output = i64;

    /// Microseconds elapsed between two timestamps.
    fn sub(self, rhs: Timestamp) -> i64 {
        self.0 - rhs.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.0 / MICROS_PER_SECOND,
            self.0 % MICROS_PER_SECOND
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a.is_valid());
        assert!(b >= a);
    }

    #[test]
    fn test_arithmetic() {
        let t = Timestamp::from_micros(5_000_000);
        assert_eq!((t + 250).as_micros(), 5_000_250);
        assert_eq!((t - 250).as_micros(), 4_999_750);
        assert_eq!(t + 250 - t, 250);
    }

    #[test]
    fn test_ordering_is_total() {
        let a = Timestamp::from_micros(1);
        let b = Timestamp::from_micros(2);
        assert!(a < b);
        assert_eq!(a.max(b), b);
        assert!(!Timestamp::invalid().is_valid());
        assert!(Timestamp::invalid() < a);
    }

    #[test]
    fn test_display() {
        let t = Timestamp::from_micros(3 * MICROS_PER_SECOND + 42);
        assert_eq!(t.to_string(), "3.000042");
    }
}
