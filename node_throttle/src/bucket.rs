//! Bucket throttle
//!
//! Pairs a [`DiscreteLeakyBucket`] with a rate. The rate is expressed in
//! milli-operations per second (mtps) and capacity in fixed-point units such
//! that a throttle leaks exactly `mtps` units per elapsed nanosecond:
//!
//! ```text
//! 1 op/s = 1_000 mtps, 1_000 mtps * 1_000_000_000 ns = 10^12 units = 1 op
//! ```
//!
//! Everything here is integer arithmetic. Two nodes fed the same calls compute
//! the same `used`, to the unit.

use crate::leaky::DiscreteLeakyBucket;

/// Capacity units consumed by one logical operation.
pub const CAPACITY_UNITS_PER_OP: u64 = 1_000_000_000_000;
/// Milli-operations per operation.
pub const MTPS_PER_TPS: u64 = 1_000;
/// Capacity units per mtps per millisecond of burst period.
const UNITS_PER_MTPS_MS: u64 = 1_000_000;
/// Milliseconds in a second.
pub const MS_PER_SECOND: u64 = 1_000;

/// Errors produced by [`BucketThrottle`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Capacity of the throttle does not fit in 64 bits.
    #[error("capacity for {mtps} mtps over {burst_period_ms}ms overflows")]
    Overflow {
        /// Milli-operations per second.
        mtps: u64,
        /// Burst period in milliseconds.
        burst_period_ms: u64,
    },
    /// The throttle could never admit a single operation.
    #[error("{mtps} mtps over {burst_period_ms}ms cannot admit a single operation")]
    InsufficientCapacity {
        /// Milli-operations per second.
        mtps: u64,
        /// Burst period in milliseconds.
        burst_period_ms: u64,
    },
}

/// Return the capacity units `n` operations require, or `None` if that does
/// not fit in 64 bits.
#[must_use]
#[inline]
pub fn capacity_required_for(n: u32) -> Option<u64> {
    u64::from(n).checked_mul(CAPACITY_UNITS_PER_OP)
}

/// Return the total capacity of a throttle with `mtps` and a burst period of
/// `burst_period_ms`, or `None` on overflow.
#[must_use]
pub fn capacity_for(mtps: u64, burst_period_ms: u64) -> Option<u64> {
    mtps.checked_mul(UNITS_PER_MTPS_MS)?
        .checked_mul(burst_period_ms)
}

/// A rated leaky bucket. Not synchronized, see
/// [`DeterministicThrottle`](crate::DeterministicThrottle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketThrottle {
    mtps: u64,
    bucket: DiscreteLeakyBucket,
    /// Units admitted by the most recent successful `allow`, zero if that
    /// has since been reclaimed.
    last_allowed_units: u64,
}

impl BucketThrottle {
    /// Create a new `BucketThrottle`.
    ///
    /// # Errors
    ///
    /// Returns an error if capacity overflows or is smaller than one
    /// operation.
    pub fn new(mtps: u64, burst_period_ms: u64) -> Result<Self, Error> {
        let capacity = capacity_for(mtps, burst_period_ms).ok_or(Error::Overflow {
            mtps,
            burst_period_ms,
        })?;
        if capacity < CAPACITY_UNITS_PER_OP {
            return Err(Error::InsufficientCapacity {
                mtps,
                burst_period_ms,
            });
        }
        Ok(Self {
            mtps,
            bucket: DiscreteLeakyBucket::new(capacity),
            last_allowed_units: 0,
        })
    }

    /// Milli-operations per second.
    #[must_use]
    pub fn mtps(&self) -> u64 {
        self.mtps
    }

    /// Total capacity, in units.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.bucket.total_capacity()
    }

    /// Units in use.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.bucket.used()
    }

    /// Leak for `elapsed_nanos` and then try to admit `n` operations.
    ///
    /// A rejection still leaks.
    pub fn allow(&mut self, n: u32, elapsed_nanos: u64) -> bool {
        self.leak_for(elapsed_nanos);
        self.allow_instantaneous(n)
    }

    /// Try to admit `n` operations without leaking.
    pub fn allow_instantaneous(&mut self, n: u32) -> bool {
        let Some(required) = capacity_required_for(n) else {
            return false;
        };
        if self.bucket.use_capacity(required).is_ok() {
            self.last_allowed_units = required;
            true
        } else {
            false
        }
    }

    /// Drain the bucket by the amount `elapsed_nanos` of time would drain.
    pub fn leak_for(&mut self, elapsed_nanos: u64) {
        self.bucket.leak(self.effective_leak(elapsed_nanos));
    }

    fn effective_leak(&self, elapsed_nanos: u64) -> u64 {
        // An overflowing product drains more than any bucket holds.
        elapsed_nanos
            .checked_mul(self.mtps)
            .unwrap_or_else(|| self.bucket.total_capacity())
    }

    /// Percent of capacity that would be in use after `elapsed_nanos`, without
    /// leaking.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn percent_used(&self, elapsed_nanos: u64) -> f64 {
        let used = self
            .bucket
            .used()
            .saturating_sub(self.effective_leak(elapsed_nanos));
        100.0 * used as f64 / self.bucket.total_capacity() as f64
    }

    /// Give back the units admitted by the last successful `allow`. Calling
    /// this twice in a row reclaims nothing the second time.
    pub fn reclaim_last_allowed_use(&mut self) {
        self.bucket.leak(self.last_allowed_units);
        self.last_allowed_units = 0;
    }

    /// Give back the units `n` operations consumed.
    pub fn reclaim(&mut self, n: u32) {
        if let Some(units) = capacity_required_for(n) {
            self.bucket.leak(units);
        }
    }

    /// Forget the last successful `allow` so it can no longer be reclaimed.
    pub fn reset_last_allowed_use(&mut self) {
        self.last_allowed_units = 0;
    }

    /// Overwrite the units in use.
    ///
    /// # Errors
    ///
    /// Returns an error if `used` exceeds capacity.
    pub fn reset_used(&mut self, used: u64) -> Result<(), crate::leaky::Error> {
        self.bucket.reset_used(used)?;
        self.last_allowed_units = 0;
        Ok(())
    }
}
