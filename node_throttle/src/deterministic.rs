//! Deterministic throttle
//!
//! A [`BucketThrottle`] that keeps its own notion of time. Callers pass in
//! `now` on every decision, the throttle computes the elapsed time since its
//! last decision and leaks accordingly. Given the same `(n, now)` sequence two
//! throttles with the same rate and burst end in the same state, to the unit.
//! That state, a [`UsageSnapshot`], is all that needs persisting to resume
//! exactly where a node left off.
//!
//! Decisions are serialized by a mutex held per throttle. The leak, the
//! capacity comparison and the usage update all happen under that one lock so
//! two racing callers cannot both spend the last of the capacity.

use std::{fmt, sync::PoisonError};

#[cfg(not(loom))]
use std::sync::{Mutex, MutexGuard};

#[cfg(loom)]
use loom::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    bucket::{self, BucketThrottle, MS_PER_SECOND, MTPS_PER_TPS},
    time::{Clock, Timestamp},
};

/// Errors produced by [`DeterministicThrottle`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A decision was requested for a time before the last decision. This is
    /// an ordering bug upstream of the throttle.
    #[error("decision time {now} precedes last decision time {last}")]
    TimeReversed {
        /// Time of the last decision.
        last: Timestamp,
        /// Time of the rejected request.
        now: Timestamp,
    },
    /// Rate or burst period would overflow.
    #[error("rate of {tps} ops/s overflows")]
    RateOverflow {
        /// Requested operations per second.
        tps: u64,
    },
    /// Burst period would overflow.
    #[error("burst period of {seconds}s overflows")]
    BurstOverflow {
        /// Requested burst period in seconds.
        seconds: u64,
    },
    /// The underlying bucket could not be built.
    #[error(transparent)]
    Bucket(#[from] bucket::Error),
}

/// Errors produced by [`DeterministicThrottle::reset_usage_to`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    /// The snapshot uses more capacity than this throttle has.
    #[error("snapshot usage {used} exceeds throttle capacity {capacity}")]
    ExceedsCapacity {
        /// Usage recorded in the snapshot.
        used: u64,
        /// Capacity of the throttle.
        capacity: u64,
    },
}

/// The persisted state of a throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    /// Capacity units in use.
    pub used: u64,
    /// Time of the last decision, `None` if the throttle has never decided.
    #[serde(default)]
    pub last_decision_time: Option<Timestamp>,
}

impl UsageSnapshot {
    /// Create a new `UsageSnapshot`.
    #[must_use]
    pub fn new(used: u64, last_decision_time: Option<Timestamp>) -> Self {
        Self {
            used,
            last_decision_time,
        }
    }
}

impl fmt::Display for UsageSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_decision_time {
            Some(t) => write!(f, "{} used (last decision @ {t})", self.used),
            None => write!(f, "{} used (never decided)", self.used),
        }
    }
}

#[derive(Debug)]
struct State {
    throttle: BucketThrottle,
    last_decision_time: Option<Timestamp>,
}

impl State {
    /// Nanoseconds since the last decision, zero if there was none.
    fn elapsed_nanos(&self, now: Timestamp) -> Result<u64, Error> {
        let Some(last) = self.last_decision_time else {
            return Ok(0);
        };
        let elapsed = now.nanos_since(last);
        if elapsed < 0 {
            return Err(Error::TimeReversed { last, now });
        }
        // Anything past u64::MAX nanoseconds drains any bucket.
        Ok(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }

    fn decide(&mut self, n: u32, now: Timestamp) -> Result<bool, Error> {
        let elapsed = self.elapsed_nanos(now)?;
        let decision = self.throttle.allow(n, elapsed);
        self.last_decision_time = Some(now);
        Ok(decision)
    }

    fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            used: self.throttle.used(),
            last_decision_time: self.last_decision_time,
        }
    }
}

/// A leaky-bucket throttle whose decisions depend only on its inputs.
pub struct DeterministicThrottle {
    name: Option<String>,
    mtps: u64,
    capacity: u64,
    state: Mutex<State>,
}

impl DeterministicThrottle {
    /// A throttle of `tps` operations per second with a one second burst.
    ///
    /// # Errors
    ///
    /// See [`Error`].
    pub fn with_tps(tps: u64) -> Result<Self, Error> {
        Self::with_tps_and_burst_period(tps, 1)
    }

    /// A throttle of `tps` operations per second that holds
    /// `burst_period_seconds` worth of operations.
    ///
    /// # Errors
    ///
    /// See [`Error`].
    pub fn with_tps_and_burst_period(tps: u64, burst_period_seconds: u64) -> Result<Self, Error> {
        let mtps = tps
            .checked_mul(MTPS_PER_TPS)
            .ok_or(Error::RateOverflow { tps })?;
        Self::with_mtps_and_burst_period(mtps, burst_period_seconds)
    }

    /// A throttle of `mtps` milli-operations per second with a one second
    /// burst. Useful for rates under one operation per second.
    ///
    /// # Errors
    ///
    /// See [`Error`].
    pub fn with_mtps(mtps: u64) -> Result<Self, Error> {
        Self::with_mtps_and_burst_period(mtps, 1)
    }

    /// A throttle of `mtps` milli-operations per second with a burst of
    /// `burst_period_seconds`.
    ///
    /// # Errors
    ///
    /// See [`Error`].
    pub fn with_mtps_and_burst_period(mtps: u64, burst_period_seconds: u64) -> Result<Self, Error> {
        let burst_period_ms = burst_period_seconds
            .checked_mul(MS_PER_SECOND)
            .ok_or(Error::BurstOverflow {
                seconds: burst_period_seconds,
            })?;
        Self::with_mtps_and_burst_period_ms(mtps, burst_period_ms)
    }

    /// A throttle of `mtps` milli-operations per second with a burst of
    /// `burst_period_ms` milliseconds.
    ///
    /// # Errors
    ///
    /// Returns an error if capacity overflows or cannot hold a single
    /// operation.
    pub fn with_mtps_and_burst_period_ms(mtps: u64, burst_period_ms: u64) -> Result<Self, Error> {
        let throttle = BucketThrottle::new(mtps, burst_period_ms)?;
        Ok(Self {
            name: None,
            mtps,
            capacity: throttle.capacity(),
            state: Mutex::new(State {
                throttle,
                last_decision_time: None,
            }),
        })
    }

    /// Builder-style [`set_name`](Self::set_name).
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.set_name(name);
        self
    }

    /// Name this throttle, for diagnostics.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// The diagnostic name of this throttle, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Total capacity in units.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Milli-operations per second.
    #[must_use]
    pub fn mtps(&self) -> u64 {
        self.mtps
    }

    /// Capacity units `n` operations require, `None` if that overflows.
    #[must_use]
    pub fn capacity_required_for(n: u32) -> Option<u64> {
        bucket::capacity_required_for(n)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // The state is consistent at every point the lock is released, a
        // panicking holder cannot leave it torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether `n` operations may proceed at `now`.
    ///
    /// A rejection is `Ok(false)` and still advances the last decision time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimeReversed`] if `now` precedes the last decision.
    /// The throttle is not modified.
    pub fn allow(&self, n: u32, now: Timestamp) -> Result<bool, Error> {
        self.lock().decide(n, now)
    }

    /// Decide whether `n` operations may proceed, reading `now` from `clock`
    /// while holding the lock. Racing callers therefore observe decision
    /// times in lock order, which a `now` read before the call cannot
    /// promise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimeReversed`] if `clock` runs backward.
    pub fn allow_now<C>(&self, n: u32, clock: &C) -> Result<bool, Error>
    where
        C: Clock + ?Sized,
    {
        let mut state = self.lock();
        let now = clock.now();
        state.decide(n, now)
    }

    /// Percent of capacity in use at `now`, without modifying the throttle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimeReversed`] if `now` precedes the last decision.
    pub fn percent_used(&self, now: Timestamp) -> Result<f64, Error> {
        let state = self.lock();
        let elapsed = state.elapsed_nanos(now)?;
        Ok(state.throttle.percent_used(elapsed))
    }

    /// Capacity units in use as of the last decision.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.lock().throttle.used()
    }

    /// Undo the most recent admission. Used when one throttle of several
    /// admitted but another rejected.
    pub fn reclaim_last_allowed_use(&self) {
        self.lock().throttle.reclaim_last_allowed_use();
    }

    /// Give back the capacity `n` operations consumed. Unlike
    /// [`reclaim_last_allowed_use`](Self::reclaim_last_allowed_use) this is
    /// safe when other callers may have decided in between.
    pub fn reclaim_capacity_for(&self, n: u32) {
        self.lock().throttle.reclaim(n);
    }

    /// Make the most recent admission permanent.
    pub fn reset_last_allowed_use(&self) {
        self.lock().throttle.reset_last_allowed_use();
    }

    /// Capture the current state.
    #[must_use]
    pub fn usage_snapshot(&self) -> UsageSnapshot {
        self.lock().snapshot()
    }

    /// Overwrite the current state with `snapshot`.
    ///
    /// A snapshot over capacity by no more than one nanosecond of leak is
    /// clamped to capacity with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::ExceedsCapacity`] if the snapshot uses more
    /// than that. The throttle is not modified.
    pub fn reset_usage_to(&self, snapshot: &UsageSnapshot) -> Result<(), SnapshotError> {
        let used = if snapshot.used > self.capacity {
            if snapshot.used - self.capacity > self.mtps {
                return Err(SnapshotError::ExceedsCapacity {
                    used: snapshot.used,
                    capacity: self.capacity,
                });
            }
            warn!(
                throttle = self.name().unwrap_or("unnamed"),
                used = snapshot.used,
                capacity = self.capacity,
                "Clamping snapshot usage to throttle capacity"
            );
            self.capacity
        } else {
            snapshot.used
        };

        let mut state = self.lock();
        state
            .throttle
            .reset_used(used)
            .map_err(|_| SnapshotError::ExceedsCapacity {
                used,
                capacity: self.capacity,
            })?;
        state.last_decision_time = snapshot.last_decision_time;
        Ok(())
    }
}

impl PartialEq for DeterministicThrottle {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        // Snapshots are taken one lock at a time, never both at once.
        self.capacity == other.capacity
            && self.name == other.name
            && self.usage_snapshot() == other.usage_snapshot()
    }
}

impl fmt::Debug for DeterministicThrottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeterministicThrottle")
            .field("name", &self.name)
            .field("mtps", &self.mtps)
            .field("capacity", &self.capacity)
            .field("usage", &self.usage_snapshot())
            .finish()
    }
}


#[cfg(all(test, loom))]
mod loom_test {
    use loom::{sync::Arc, thread};

    use super::DeterministicThrottle;
    use crate::time::Timestamp;

    #[test]
    fn racing_for_the_last_op_admits_exactly_one() {
        loom::model(|| {
            let throttle = Arc::new(DeterministicThrottle::with_tps(1).unwrap());
            let now = Timestamp::from_seconds(1);

            let theirs = {
                let throttle = Arc::clone(&throttle);
                thread::spawn(move || throttle.allow(1, now).unwrap())
            };
            let mine = throttle.allow(1, now).unwrap();
            let theirs = theirs.join().unwrap();

            assert!(mine ^ theirs, "exactly one caller must be admitted");
            assert_eq!(throttle.used(), throttle.capacity());
        });
    }

    #[test]
    fn reset_and_allow_do_not_tear() {
        use super::UsageSnapshot;

        loom::model(|| {
            let throttle = Arc::new(DeterministicThrottle::with_tps(2).unwrap());
            let now = Timestamp::from_seconds(1);

            let resetter = {
                let throttle = Arc::clone(&throttle);
                thread::spawn(move || {
                    let full = UsageSnapshot::new(throttle.capacity(), Some(now));
                    throttle.reset_usage_to(&full).unwrap();
                })
            };
            throttle.allow(1, now).unwrap();
            resetter.join().unwrap();

            // Either the reset landed last, or our admission found the bucket
            // already full.
            assert_eq!(throttle.used(), throttle.capacity());
        });
    }
}
