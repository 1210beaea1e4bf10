//! Concurrent access harness
//!
//! Drives one [`DeterministicThrottle`] from many threads at once, each asking
//! for the same number of operations as fast as it can against a real clock,
//! and reports what was admitted. A correct throttle admits at its configured
//! rate no matter the contention: never more than capacity plus leak over any
//! window, and not noticeably less over a sustained run.

use std::{
    cell::Cell,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info};

use crate::{
    bucket::CAPACITY_UNITS_PER_OP,
    deterministic::{self, DeterministicThrottle},
    time::{Clock, RealClock, Timestamp},
};

/// Errors produced while running a [`ConcurrentHarness`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The harness was asked to run with no threads.
    #[error("harness needs at least one thread")]
    NoThreads,
    /// A worker thread panicked.
    #[error("harness worker panicked")]
    WorkerPanicked,
    /// The throttle refused a decision.
    #[error(transparent)]
    Throttle(#[from] deterministic::Error),
}

/// A [`HarnessReport`] outside of what a correct throttle produces.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum ToleranceError {
    /// Achieved throughput strayed from the expected rate.
    #[error("achieved {achieved:.3} tps, expected {expected:.3} tps within {tolerance_pct}%")]
    OutOfTolerance {
        /// Expected requests per second.
        expected: f64,
        /// Achieved requests per second.
        achieved: f64,
        /// Allowed deviation, in percent of `expected`.
        tolerance_pct: f64,
    },
    /// More was admitted over some window than capacity plus leak allows.
    #[error(
        "admitted {admitted_units} units within {window_nanos}ns, at most {allowed_units} allowed"
    )]
    OverCapacity {
        /// Length of the offending window.
        window_nanos: u128,
        /// Units admitted within the window.
        admitted_units: u128,
        /// Capacity plus leak over the window.
        allowed_units: u128,
    },
}

/// A [`Clock`] that remembers the last time it was read. Passed to
/// [`DeterministicThrottle::allow_now`] it captures the exact decision time.
#[derive(Debug)]
struct RecordingClock<'a> {
    inner: &'a RealClock,
    last: Cell<Timestamp>,
}

impl<'a> RecordingClock<'a> {
    fn new(inner: &'a RealClock) -> Self {
        Self {
            inner,
            last: Cell::new(Timestamp::EPOCH),
        }
    }
}

impl Clock for RecordingClock<'_> {
    fn now(&self) -> Timestamp {
        let now = self.inner.now();
        self.last.set(now);
        now
    }
}

#[derive(Debug, Default)]
struct Worker {
    admitted: Vec<Timestamp>,
    rejected: u64,
}

/// Runs a throttle under contention.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrentHarness {
    threads: usize,
    duration: Duration,
    ops_per_request: u32,
}

impl ConcurrentHarness {
    /// Create a harness of `threads` workers each requesting
    /// `ops_per_request` operations at a time for `duration`.
    #[must_use]
    pub fn new(threads: usize, duration: Duration, ops_per_request: u32) -> Self {
        Self {
            threads,
            duration,
            ops_per_request,
        }
    }

    /// Run the harness against `throttle`. The throttle is used as found, any
    /// prior usage counts against the run.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no threads, a worker panics or the
    /// throttle refuses a decision.
    pub fn run_with(&self, throttle: &DeterministicThrottle) -> Result<HarnessReport, Error> {
        if self.threads == 0 {
            return Err(Error::NoThreads);
        }
        let clock = &RealClock::default();
        let started = Instant::now();
        let deadline = started + self.duration;
        let ops = self.ops_per_request;

        let workers: Vec<Result<Worker, Error>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..self.threads)
                .map(|_| {
                    scope.spawn(move || -> Result<Worker, Error> {
                        let recorder = RecordingClock::new(clock);
                        let mut worker = Worker::default();
                        while Instant::now() < deadline {
                            if throttle.allow_now(ops, &recorder)? {
                                worker.admitted.push(recorder.last.get());
                            } else {
                                worker.rejected += 1;
                            }
                        }
                        Ok(worker)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(Err(Error::WorkerPanicked)))
                .collect()
        });
        let elapsed = started.elapsed();

        let mut admitted = Vec::new();
        let mut rejected = 0;
        for worker in workers {
            let worker = worker?;
            debug!(
                admitted = worker.admitted.len(),
                rejected = worker.rejected,
                "Harness worker finished"
            );
            admitted.extend(worker.admitted);
            rejected += worker.rejected;
        }
        admitted.sort_unstable();

        let report = HarnessReport {
            ops_per_request: ops,
            elapsed,
            admitted,
            rejected,
        };
        info!(
            threads = self.threads,
            elapsed_ms = elapsed.as_millis(),
            admitted = report.admitted.len(),
            rejected,
            achieved_tps = report.achieved_tps(),
            "Harness run complete"
        );
        Ok(report)
    }
}

/// The outcome of a [`ConcurrentHarness`] run.
#[derive(Debug, Clone)]
pub struct HarnessReport {
    ops_per_request: u32,
    elapsed: Duration,
    /// Decision times of admitted requests, ascending.
    admitted: Vec<Timestamp>,
    rejected: u64,
}

impl HarnessReport {
    /// Wall-clock length of the run.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Decision times of every admitted request, ascending.
    #[must_use]
    pub fn admitted(&self) -> &[Timestamp] {
        &self.admitted
    }

    /// Number of rejected requests.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Admitted requests per second of the run.
    #[must_use]
    pub fn achieved_tps(&self) -> f64 {
        if self.elapsed.is_zero() {
            return 0.0;
        }
        self.admitted.len() as f64 / self.elapsed.as_secs_f64()
    }

    /// Check the achieved throughput is within `tolerance_pct` percent of
    /// `expected` requests per second.
    ///
    /// # Errors
    ///
    /// Returns [`ToleranceError::OutOfTolerance`] otherwise.
    pub fn check_tolerable_tps(
        &self,
        expected: f64,
        tolerance_pct: f64,
    ) -> Result<(), ToleranceError> {
        let achieved = self.achieved_tps();
        let deviation_pct = 100.0 * (achieved - expected).abs() / expected;
        // A NaN deviation fails as well.
        if deviation_pct <= tolerance_pct {
            Ok(())
        } else {
            Err(ToleranceError::OutOfTolerance {
                expected,
                achieved,
                tolerance_pct,
            })
        }
    }

    /// Check that over every window between two admissions no more was
    /// admitted than `throttle`'s capacity plus what it leaks over the window.
    ///
    /// # Errors
    ///
    /// Returns [`ToleranceError::OverCapacity`] for the worst window found.
    pub fn check_capacity_bound(
        &self,
        throttle: &DeterministicThrottle,
    ) -> Result<(), ToleranceError> {
        let Some(first) = self.admitted.first() else {
            return Ok(());
        };
        let units = i128::from(self.ops_per_request) * i128::from(CAPACITY_UNITS_PER_OP);
        let mtps = i128::from(throttle.mtps());
        let capacity = i128::from(throttle.capacity());

        // Admissions i..=j cost (j - i + 1) * units and the bucket leaks
        // mtps * (t_j - t_i) between them. With f(k) = k * units - mtps * t_k
        // the bound is f(j) - f(i) + units <= capacity, so tracking the
        // smallest f(i) seen finds the worst window in one pass.
        let mut worst = i128::MIN;
        let mut worst_window = (0, 0);
        let mut min_f = i128::MAX;
        let mut min_at = 0;
        for (k, at) in self.admitted.iter().enumerate() {
            let k = i128::try_from(k).unwrap_or(i128::MAX);
            let offset = at.nanos_since(*first);
            let f = k * units - mtps * offset;
            if f < min_f {
                min_f = f;
                min_at = offset;
            }
            let excess = f - min_f + units;
            if excess > worst {
                worst = excess;
                worst_window = (min_at, offset);
            }
        }

        if worst <= capacity {
            return Ok(());
        }
        let window_nanos = worst_window.1 - worst_window.0;
        let allowed = capacity + mtps * window_nanos;
        Err(ToleranceError::OverCapacity {
            window_nanos: window_nanos.unsigned_abs(),
            admitted_units: (worst + mtps * window_nanos).unsigned_abs(),
            allowed_units: allowed.unsigned_abs(),
        })
    }
}

#[cfg(all(test, not(loom)))]
mod test {
    use std::time::Duration;

    use super::{ConcurrentHarness, Error, HarnessReport, ToleranceError};
    use crate::{
        deterministic::{DeterministicThrottle, UsageSnapshot},
        time::Timestamp,
    };

    #[test]
    fn contended_throttle_holds_its_rate() {
        let throttle = DeterministicThrottle::with_tps(500).unwrap();
        let one_op = DeterministicThrottle::capacity_required_for(1).unwrap();
        throttle
            .reset_usage_to(&UsageSnapshot::new(throttle.capacity() - one_op, None))
            .unwrap();

        let report = ConcurrentHarness::new(4, Duration::from_secs(2), 1)
            .run_with(&throttle)
            .unwrap();
        assert!(report.rejected() > 0);
        report.check_tolerable_tps(500.0, 1.0).unwrap();
        report.check_capacity_bound(&throttle).unwrap();
    }

    #[test]
    fn fresh_burst_is_over_the_sustained_rate() {
        let throttle = DeterministicThrottle::with_tps(500).unwrap();
        let report = ConcurrentHarness::new(2, Duration::from_secs(1), 1)
            .run_with(&throttle)
            .unwrap();
        // The initial burst of a full second's capacity doubles the rate.
        assert!(matches!(
            report.check_tolerable_tps(500.0, 1.0),
            Err(ToleranceError::OutOfTolerance { .. })
        ));
        report.check_capacity_bound(&throttle).unwrap();
    }

    #[test]
    fn refuses_zero_threads() {
        let throttle = DeterministicThrottle::with_tps(1).unwrap();
        assert_eq!(
            ConcurrentHarness::new(0, Duration::from_millis(1), 1)
                .run_with(&throttle)
                .unwrap_err(),
            Error::NoThreads
        );
    }

    #[test]
    fn capacity_bound_catches_over_admission() {
        let throttle = DeterministicThrottle::with_tps(2).unwrap();
        let start = Timestamp::from_seconds(10);
        let report = HarnessReport {
            ops_per_request: 1,
            elapsed: Duration::from_secs(1),
            admitted: vec![
                start,
                start,
                start.plus_nanos(100_000_000),
                start.plus_nanos(900_000_000),
            ],
            rejected: 0,
        };
        // Three ops within 100ms against a capacity of two plus 0.2 leaked.
        assert!(matches!(
            report.check_capacity_bound(&throttle),
            Err(ToleranceError::OverCapacity {
                window_nanos: 100_000_000,
                ..
            })
        ));

        let report = HarnessReport {
            admitted: vec![start, start, start.plus_nanos(500_000_000)],
            ..report
        };
        report.check_capacity_bound(&throttle).unwrap();
        assert!((report.achieved_tps() - 3.0).abs() < f64::EPSILON);
    }
}
