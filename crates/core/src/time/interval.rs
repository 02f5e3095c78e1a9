//! Virtual time intervals and exact instruction/time conversion.
//!
//! Time is counted in ticks of one nanosecond. Performance is expressed in
//! instructions per microsecond, so one microsecond at `mips` executes exactly
//! `mips` instructions.
//!
//! Conversions never round. Whatever cannot be represented exactly is returned
//! as a residuum that the caller carries into the next conversion:
//! 1. **Time to cycles:** the residuum is a number of ticks smaller than the
//!    smallest tick count that maps to a whole number of instructions.
//! 2. **Cycles to time:** the residuum is a number of instructions smaller than
//!    the smallest instruction count that maps to a whole number of ticks.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Ticks in one microsecond of virtual time.
pub const TICKS_PER_MICROSECOND: u64 = 1000;

/// A span of virtual time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TimeInterval {
    ticks: u64,
}

impl TimeInterval {
    /// Zero-length interval.
    pub const EMPTY: Self = Self { ticks: 0 };

    /// Longest representable interval; used as "no limit".
    pub const MAX: Self = Self { ticks: u64::MAX };

    /// Creates an interval from raw ticks.
    pub const fn from_ticks(ticks: u64) -> Self {
        Self { ticks }
    }

    /// Creates an interval from microseconds, saturating on overflow.
    pub const fn from_microseconds(us: u64) -> Self {
        Self {
            ticks: us.saturating_mul(TICKS_PER_MICROSECOND),
        }
    }

    /// Creates an interval from milliseconds, saturating on overflow.
    pub const fn from_milliseconds(ms: u64) -> Self {
        Self::from_microseconds(ms.saturating_mul(1000))
    }

    /// Converts a host duration, saturating on overflow.
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            ticks: u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
        }
    }

    /// Raw tick count.
    pub const fn ticks(self) -> u64 {
        self.ticks
    }

    /// Whole microseconds contained in the interval.
    pub const fn microseconds(self) -> u64 {
        self.ticks / TICKS_PER_MICROSECOND
    }

    /// Returns `true` for a zero-length interval.
    pub const fn is_empty(self) -> bool {
        self.ticks == 0
    }

    /// Host duration of the interval.
    pub const fn to_duration(self) -> Duration {
        Duration::from_nanos(self.ticks)
    }

    /// The shorter of `self` and `other`.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Ord::min(self, other)
    }

    /// Subtraction clamped at zero.
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self {
            ticks: self.ticks.saturating_sub(other.ticks),
        }
    }

    /// Converts the interval to instructions at `mips`.
    ///
    /// Returns the number of instructions and the ticks that did not make up a whole
    /// instruction. For `mips == 0` nothing converts and the whole interval is returned
    /// as the residuum.
    ///
    /// # Arguments
    ///
    /// * `mips` - Performance in instructions per microsecond.
    pub fn to_cpu_cycles(self, mips: u64) -> (u64, Self) {
        if mips == 0 {
            return (0, self);
        }
        let step = TICKS_PER_MICROSECOND / gcd(mips, TICKS_PER_MICROSECOND);
        let residuum = self.ticks % step;
        let exact = u128::from(self.ticks - residuum) * u128::from(mips)
            / u128::from(TICKS_PER_MICROSECOND);
        (
            u64::try_from(exact).unwrap_or(u64::MAX),
            Self::from_ticks(residuum),
        )
    }

    /// Converts instructions executed at `mips` to time.
    ///
    /// Returns the interval and the instructions that did not make up a whole tick.
    /// For `mips == 0` nothing converts and all cycles are returned as the residuum.
    ///
    /// # Arguments
    ///
    /// * `cycles` - Number of instructions.
    /// * `mips` - Performance in instructions per microsecond.
    pub fn from_cpu_cycles(cycles: u64, mips: u64) -> (Self, u64) {
        if mips == 0 {
            return (Self::EMPTY, cycles);
        }
        let step = mips / gcd(mips, TICKS_PER_MICROSECOND);
        let residuum = cycles % step;
        let exact =
            u128::from(cycles - residuum) * u128::from(TICKS_PER_MICROSECOND) / u128::from(mips);
        (
            Self::from_ticks(u64::try_from(exact).unwrap_or(u64::MAX)),
            residuum,
        )
    }
}

const fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl Add for TimeInterval {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            ticks: self.ticks.saturating_add(rhs.ticks),
        }
    }
}

impl AddAssign for TimeInterval {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for TimeInterval {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let us = self.ticks / TICKS_PER_MICROSECOND;
        let rest = self.ticks % TICKS_PER_MICROSECOND;
        if rest == 0 {
            write!(f, "{us}us")
        } else {
            write!(f, "{us}.{rest:03}us")
        }
    }
}
