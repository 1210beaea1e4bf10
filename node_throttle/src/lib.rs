//! Deterministic throttling for consensus nodes
//!
//! This library decides whether a request may proceed given the rate a
//! network has agreed to. Every node runs the same throttles and, fed the same
//! consensus timestamps, makes the same decisions: all arithmetic is integer
//! and time only ever comes from the caller.
//!
//! The pieces, bottom up:
//!
//! * [`leaky`]: a bounded counter that fills on admission and drains on leak.
//! * [`bucket`]: a counter with a rate, in fixed-point units.
//! * [`deterministic`]: a rated bucket with its own notion of time, safe to
//!   share between threads, and its persistable [`UsageSnapshot`].
//! * [`definitions`]: JSON throttle definitions and their resolution into
//!   throttles for a given network size.
//! * [`reqs`] and [`table`]: per-operation requirements over several buckets
//!   and the table of all of them.
//! * [`gas`]: a throttle over smart-contract gas per second.
//! * [`harness`]: drives a throttle from many threads and checks the rate it
//!   achieves.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod bucket;
pub mod definitions;
pub mod deterministic;
pub mod gas;
pub mod harness;
pub mod leaky;
pub mod reqs;
pub mod table;
pub mod time;

#[cfg(all(test, not(loom)))]
mod fixtures;

pub use definitions::{ThrottleBucket, ThrottleDefinitions, ThrottleGroup};
pub use deterministic::{DeterministicThrottle, SnapshotError, UsageSnapshot};
pub use gas::GasLimitThrottle;
pub use harness::{ConcurrentHarness, HarnessReport};
pub use reqs::ThrottleReqs;
pub use table::{PersistedState, ThrottleTable};
pub use time::{Clock, RealClock, Timestamp};

/// Errors produced by this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Timestamp
    #[error(transparent)]
    Time(#[from] time::Error),
    /// Leaky bucket
    #[error(transparent)]
    Leaky(#[from] leaky::Error),
    /// Bucket throttle
    #[error(transparent)]
    Bucket(#[from] bucket::Error),
    /// Deterministic throttle
    #[error(transparent)]
    Throttle(#[from] deterministic::Error),
    /// Snapshot
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// Throttle definitions
    #[error(transparent)]
    Definitions(#[from] definitions::Error),
    /// Harness
    #[error(transparent)]
    Harness(#[from] harness::Error),
    /// Harness tolerance
    #[error(transparent)]
    Tolerance(#[from] harness::ToleranceError),
}
