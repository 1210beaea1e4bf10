//! Discrete leaky bucket
//!
//! The counter at the bottom of every throttle. It knows nothing of time or
//! rates: callers tell it how much to leak and how much to use. Keeping it
//! free of clocks and locks lets us make proof claims about it.

/// Errors produced by [`DiscreteLeakyBucket`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The request would push usage past total capacity.
    #[error("cannot use {requested} units with only {free} free")]
    Capacity {
        /// Units requested.
        requested: u64,
        /// Units free at the time of request.
        free: u64,
    },
    /// A reset asked for more usage than the bucket holds.
    #[error("cannot reset usage to {requested} in a bucket of capacity {total}")]
    Reset {
        /// Units requested.
        requested: u64,
        /// Total capacity of the bucket.
        total: u64,
    },
}

/// A bucket of fixed total capacity that fills with use and drains with leak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscreteLeakyBucket {
    /// The capacity of the bucket. Never changes after construction.
    total_capacity: u64,
    /// The portion of `total_capacity` presently in use. Always less than or
    /// equal to `total_capacity`.
    used: u64,
}

impl DiscreteLeakyBucket {
    /// Create an empty bucket.
    #[must_use]
    pub fn new(total_capacity: u64) -> Self {
        Self {
            total_capacity,
            used: 0,
        }
    }

    /// Create a bucket with `used` units already consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if `used` exceeds `total_capacity`.
    pub fn with_used(total_capacity: u64, used: u64) -> Result<Self, Error> {
        let mut bucket = Self::new(total_capacity);
        bucket.reset_used(used)?;
        Ok(bucket)
    }

    /// Total capacity of the bucket.
    #[must_use]
    pub fn total_capacity(&self) -> u64 {
        self.total_capacity
    }

    /// Units in use.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Units free for use.
    #[must_use]
    pub fn capacity_free(&self) -> u64 {
        self.total_capacity - self.used
    }

    /// Drain `units` from the bucket. Usage never drops below zero.
    pub fn leak(&mut self, units: u64) {
        self.used = self.used.saturating_sub(units);
    }

    /// Consume `units` of capacity.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the bucket untouched, if fewer than `units`
    /// are free.
    pub fn use_capacity(&mut self, units: u64) -> Result<(), Error> {
        let free = self.capacity_free();
        if units > free {
            return Err(Error::Capacity {
                requested: units,
                free,
            });
        }
        self.used += units;
        Ok(())
    }

    /// Overwrite usage.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the bucket untouched, if `used` exceeds the
    /// total capacity.
    pub fn reset_used(&mut self, used: u64) -> Result<(), Error> {
        if used > self.total_capacity {
            return Err(Error::Reset {
                requested: used,
                total: self.total_capacity,
            });
        }
        self.used = used;
        Ok(())
    }
}


#[cfg(kani)]
mod verification {
    use crate::leaky::DiscreteLeakyBucket;

    /// Usage never exceeds total capacity after a use.
    #[kani::proof]
    fn use_capacity_bounded() {
        let total: u64 = kani::any();
        let used: u64 = kani::any_where(|u: &u64| *u <= total);
        let mut bucket = DiscreteLeakyBucket::with_used(total, used).expect("in bounds");

        let request: u64 = kani::any();
        let res = bucket.use_capacity(request);
        kani::assert(
            bucket.used() <= bucket.total_capacity(),
            "Usage must never exceed total capacity.",
        );
        if request <= total - used {
            kani::assert(res.is_ok(), "In-capacity requests must succeed.");
            kani::assert(bucket.used() == used + request, "Usage grows by request.");
        } else {
            kani::assert(res.is_err(), "Over-capacity requests must fail.");
            kani::assert(bucket.used() == used, "Failed requests do not mutate.");
        }
    }

    /// Leaking never underflows and never increases usage.
    #[kani::proof]
    fn leak_never_underflows() {
        let total: u64 = kani::any();
        let used: u64 = kani::any_where(|u: &u64| *u <= total);
        let mut bucket = DiscreteLeakyBucket::with_used(total, used).expect("in bounds");

        let units: u64 = kani::any();
        bucket.leak(units);
        kani::assert(bucket.used() <= used, "Leak must not increase usage.");
        kani::assert(
            bucket.used() == used.saturating_sub(units),
            "Leak drains exactly, floored at zero.",
        );
    }
}
