//! Gas-limit throttle
//!
//! Smart-contract calls are throttled by the gas they reserve as well as by
//! count. This throttle holds one second worth of gas and leaks it linearly,
//! `capacity * elapsed / 1s`, rounding down.

use std::{fmt, sync::PoisonError};

#[cfg(not(loom))]
use std::sync::{Mutex, MutexGuard};

#[cfg(loom)]
use loom::sync::{Mutex, MutexGuard};

use crate::{
    deterministic::{Error, SnapshotError, UsageSnapshot},
    leaky::DiscreteLeakyBucket,
    time::Timestamp,
};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

#[derive(Debug)]
struct State {
    bucket: DiscreteLeakyBucket,
    last_decision_time: Option<Timestamp>,
    last_allowed_gas: u64,
}

/// A throttle over gas per second.
pub struct GasLimitThrottle {
    capacity: u64,
    state: Mutex<State>,
}

impl GasLimitThrottle {
    /// Create a throttle admitting `capacity` gas per second.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                bucket: DiscreteLeakyBucket::new(capacity),
                last_decision_time: None,
                last_allowed_gas: 0,
            }),
        }
    }

    /// Gas per second.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn leak_for(capacity: u64, elapsed_nanos: u64) -> u64 {
        if elapsed_nanos >= NANOS_PER_SECOND {
            return capacity;
        }
        // elapsed < 1s so the quotient is below capacity and fits.
        (u128::from(capacity) * u128::from(elapsed_nanos) / u128::from(NANOS_PER_SECOND)) as u64
    }

    fn elapsed_nanos(state: &State, now: Timestamp) -> Result<u64, Error> {
        let Some(last) = state.last_decision_time else {
            return Ok(0);
        };
        let elapsed = now.nanos_since(last);
        if elapsed < 0 {
            return Err(Error::TimeReversed { last, now });
        }
        Ok(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }

    /// Decide whether a transaction reserving `gas_limit` may proceed at
    /// `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimeReversed`] if `now` precedes the last decision.
    pub fn allow(&self, now: Timestamp, gas_limit: u64) -> Result<bool, Error> {
        let mut state = self.lock();
        let elapsed = Self::elapsed_nanos(&state, now)?;
        state.bucket.leak(Self::leak_for(self.capacity, elapsed));
        state.last_decision_time = Some(now);
        if state.bucket.use_capacity(gas_limit).is_ok() {
            state.last_allowed_gas = gas_limit;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Percent of capacity in use at `now`, without modifying the throttle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimeReversed`] if `now` precedes the last decision.
    #[allow(clippy::cast_precision_loss)]
    pub fn percent_used(&self, now: Timestamp) -> Result<f64, Error> {
        if self.capacity == 0 {
            return Ok(0.0);
        }
        let state = self.lock();
        let elapsed = Self::elapsed_nanos(&state, now)?;
        let used = state
            .bucket
            .used()
            .saturating_sub(Self::leak_for(self.capacity, elapsed));
        Ok(100.0 * used as f64 / self.capacity as f64)
    }

    /// Undo the most recent admission.
    pub fn reclaim_last_allowed_use(&self) {
        let mut state = self.lock();
        let gas = state.last_allowed_gas;
        state.bucket.leak(gas);
        state.last_allowed_gas = 0;
    }

    /// Capture the current state.
    #[must_use]
    pub fn usage_snapshot(&self) -> UsageSnapshot {
        let state = self.lock();
        UsageSnapshot::new(state.bucket.used(), state.last_decision_time)
    }

    /// Overwrite the current state with `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::ExceedsCapacity`] if the snapshot uses more gas
    /// than this throttle holds. The throttle is not modified.
    pub fn reset_usage_to(&self, snapshot: &UsageSnapshot) -> Result<(), SnapshotError> {
        let mut state = self.lock();
        state
            .bucket
            .reset_used(snapshot.used)
            .map_err(|_| SnapshotError::ExceedsCapacity {
                used: snapshot.used,
                capacity: self.capacity,
            })?;
        state.last_decision_time = snapshot.last_decision_time;
        state.last_allowed_gas = 0;
        Ok(())
    }
}

impl PartialEq for GasLimitThrottle {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        self.capacity == other.capacity && self.usage_snapshot() == other.usage_snapshot()
    }
}

impl fmt::Debug for GasLimitThrottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GasLimitThrottle")
            .field("capacity", &self.capacity)
            .field("usage", &self.usage_snapshot())
            .finish()
    }
}
