//! Timestamps and clocks
//!
//! Throttle decisions are made against a caller supplied `now`. On the
//! consensus path that is the consensus timestamp of the transaction, in the
//! local admission path it is wall-clock time. Either way it is expressed as a
//! [`Timestamp`], seconds and nanoseconds since the Unix epoch.

use std::{
    cmp::Ordering,
    fmt,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

const NANOS_PER_SECOND: u32 = 1_000_000_000;

/// Errors produced when constructing a [`Timestamp`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The nanosecond component was not less than one second.
    #[error("nanos {0} must be less than 1_000_000_000")]
    Nanos(u32),
}

/// A point in time, seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTimestamp")]
pub struct Timestamp {
    seconds: i64,
    nanos: u32,
}

/// The serialized form of a [`Timestamp`], validated on the way in.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTimestamp {
    seconds: i64,
    nanos: u32,
}

impl TryFrom<RawTimestamp> for Timestamp {
    type Error = Error;

    fn try_from(raw: RawTimestamp) -> Result<Self, Self::Error> {
        Timestamp::new(raw.seconds, raw.nanos)
    }
}

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Timestamp = Timestamp {
        seconds: 0,
        nanos: 0,
    };

    /// Create a new `Timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if `nanos` is one second or more.
    pub fn new(seconds: i64, nanos: u32) -> Result<Self, Error> {
        if nanos >= NANOS_PER_SECOND {
            return Err(Error::Nanos(nanos));
        }
        Ok(Self { seconds, nanos })
    }

    /// Create a `Timestamp` at a whole number of seconds.
    #[must_use]
    pub const fn from_seconds(seconds: i64) -> Self {
        Self { seconds, nanos: 0 }
    }

    /// Seconds since the epoch.
    #[must_use]
    pub const fn seconds(&self) -> i64 {
        self.seconds
    }

    /// Nanoseconds past `seconds`.
    #[must_use]
    pub const fn nanos(&self) -> u32 {
        self.nanos
    }

    /// Signed nanoseconds from `earlier` to `self`, negative if `earlier` is
    /// in fact later.
    #[must_use]
    pub fn nanos_since(&self, earlier: Timestamp) -> i128 {
        let secs = i128::from(self.seconds) - i128::from(earlier.seconds);
        let nanos = i128::from(self.nanos) - i128::from(earlier.nanos);
        secs * i128::from(NANOS_PER_SECOND) + nanos
    }

    /// Return a `Timestamp` `duration` later than this one, saturating at the
    /// representable maximum.
    #[must_use]
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let mut nanos = self.nanos + duration.subsec_nanos();
        let mut carry = 0_i64;
        if nanos >= NANOS_PER_SECOND {
            nanos -= NANOS_PER_SECOND;
            carry = 1;
        }
        let secs = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
        match self
            .seconds
            .checked_add(secs)
            .and_then(|s| s.checked_add(carry))
        {
            Some(seconds) => Self { seconds, nanos },
            None => Self {
                seconds: i64::MAX,
                nanos: NANOS_PER_SECOND - 1,
            },
        }
    }

    /// Convenience for `saturating_add` with a number of nanoseconds.
    #[must_use]
    pub fn plus_nanos(&self, nanos: u64) -> Self {
        self.saturating_add(Duration::from_nanos(nanos))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .cmp(&other.seconds)
            .then(self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => Timestamp::EPOCH.saturating_add(since),
            Err(err) => {
                // Before the epoch, count backwards.
                let before = err.duration();
                let mut seconds = -i64::try_from(before.as_secs()).unwrap_or(i64::MAX);
                let mut nanos = before.subsec_nanos();
                if nanos > 0 {
                    seconds -= 1;
                    nanos = NANOS_PER_SECOND - nanos;
                }
                Timestamp { seconds, nanos }
            }
        }
    }
}

/// The source of `now` for callers that do not have a consensus timestamp to
/// hand.
pub trait Clock {
    /// The current time.
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy)]
/// A clock that reads wall-clock time once, at creation, and advances
/// monotonically from there. Never runs backward even if the system clock is
/// stepped.
pub struct RealClock {
    wall_start: Timestamp,
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            wall_start: Timestamp::from(SystemTime::now()),
            start: Instant::now(),
        }
    }
}

impl Clock for RealClock {
    fn now(&self) -> Timestamp {
        self.wall_start.saturating_add(self.start.elapsed())
    }
}
