//! Throttle table
//!
//! The resolved form of a network's throttle definitions: one
//! [`DeterministicThrottle`] per bucket, held in a flat arena, and for every
//! operation kind the [`ThrottleReqs`] it must satisfy. An optional
//! [`GasLimitThrottle`] rides alongside for smart-contract gas.
//!
//! The table's whole mutable state is a [`PersistedState`]. Restoring one is
//! forgiving: a snapshot that does not fit the current configuration is logged
//! and skipped, leaving the freshly built throttles as they are.

use std::{collections::HashMap, hash::Hash, num::NonZeroU32, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    definitions::{self, ThrottleDefinitions},
    deterministic::{DeterministicThrottle, Error, UsageSnapshot},
    gas::GasLimitThrottle,
    reqs::ThrottleReqs,
    time::Timestamp,
};

/// Everything needed to resume a [`ThrottleTable`] where it left off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    /// One snapshot per bucket throttle, in bucket order.
    #[serde(default)]
    pub tps_throttles: Vec<UsageSnapshot>,
    /// Snapshot of the gas throttle, if one was configured.
    #[serde(default)]
    pub gas_throttle: Option<UsageSnapshot>,
    /// Start times of congestion levels. Not interpreted here, carried so
    /// that it is saved and restored with the throttles.
    #[serde(default)]
    pub congestion_level_starts: Vec<Timestamp>,
}

/// What [`ThrottleTable::reset_from`] applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetReport {
    /// Bucket throttles reset from their snapshot.
    pub throttles_reset: usize,
    /// Whether the gas throttle was reset.
    pub gas_reset: bool,
}

/// Bucket throttles and per-kind requirements for one network size.
#[derive(Debug)]
pub struct ThrottleTable<K> {
    throttles: Vec<Arc<DeterministicThrottle>>,
    reqs: HashMap<K, ThrottleReqs>,
    gas: Option<GasLimitThrottle>,
}

impl<K> ThrottleTable<K>
where
    K: Clone + Eq + Hash,
{
    /// Resolve `defs` for a network of `network_size` nodes. A kind listed in
    /// several buckets must be admitted by all of them. If `gas_capacity` is
    /// given a gas throttle of that many gas per second is attached.
    ///
    /// # Errors
    ///
    /// Returns the first bucket's resolution error. No table is built.
    pub fn from_definitions(
        defs: &ThrottleDefinitions<K>,
        network_size: NonZeroU32,
        gas_capacity: Option<u64>,
    ) -> Result<Self, definitions::Error> {
        let mut throttles = Vec::with_capacity(defs.buckets.len());
        let mut reqs: HashMap<K, ThrottleReqs> = HashMap::new();
        for (throttle, ops_reqs) in defs.resolve(network_size)? {
            let throttle = Arc::new(throttle);
            for (kind, ops) in ops_reqs {
                reqs.entry(kind)
                    .or_default()
                    .push(Arc::clone(&throttle), ops);
            }
            throttles.push(throttle);
        }
        info!(
            network_size = network_size.get(),
            throttles = throttles.len(),
            kinds = reqs.len(),
            gas_capacity,
            "Built throttle table"
        );
        Ok(Self {
            throttles,
            reqs,
            gas: gas_capacity.map(GasLimitThrottle::new),
        })
    }

    /// Whether a request of `kind` at `now` must be throttled. A kind no
    /// bucket mentions is always throttled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimeReversed`] if `now` precedes the last decision of
    /// any throttle `kind` touches.
    pub fn should_throttle(&self, kind: &K, now: Timestamp) -> Result<bool, Error> {
        match self.reqs.get(kind) {
            Some(reqs) => Ok(!reqs.all_reqs_met_for(now)?),
            None => Ok(true),
        }
    }

    /// The requirements a request of `kind` must meet, if any bucket
    /// mentions it.
    #[must_use]
    pub fn reqs_for(&self, kind: &K) -> Option<&ThrottleReqs> {
        self.reqs.get(kind)
    }
}

impl<K> ThrottleTable<K> {
    /// Whether a transaction reserving `gas_limit` may proceed at `now`.
    /// Without a gas throttle every transaction may.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimeReversed`] if `now` precedes the gas throttle's
    /// last decision.
    pub fn allow_gas(&self, now: Timestamp, gas_limit: u64) -> Result<bool, Error> {
        match &self.gas {
            Some(gas) => gas.allow(now, gas_limit),
            None => Ok(true),
        }
    }

    /// The bucket throttles, in bucket order.
    #[must_use]
    pub fn active_throttles(&self) -> &[Arc<DeterministicThrottle>] {
        &self.throttles
    }

    /// The gas throttle, if configured.
    #[must_use]
    pub fn gas_throttle(&self) -> Option<&GasLimitThrottle> {
        self.gas.as_ref()
    }

    /// A snapshot of every bucket throttle, in bucket order.
    #[must_use]
    pub fn usage_snapshots(&self) -> Vec<UsageSnapshot> {
        self.throttles
            .iter()
            .map(|throttle| throttle.usage_snapshot())
            .collect()
    }

    /// Capture the table's state, along with the congestion level start times
    /// kept by the caller.
    #[must_use]
    pub fn save_state(&self, congestion_level_starts: Vec<Timestamp>) -> PersistedState {
        PersistedState {
            tps_throttles: self.usage_snapshots(),
            gas_throttle: self.gas.as_ref().map(GasLimitThrottle::usage_snapshot),
            congestion_level_starts,
        }
    }

    /// Restore the table from `state`.
    ///
    /// Bucket throttles are restored all or nothing: if the number of
    /// snapshots differs from the number of throttles, or any snapshot does
    /// not fit its throttle, every bucket throttle keeps its current state.
    /// An incompatible gas snapshot leaves the gas throttle as it is. These
    /// cases are logged, none is an error.
    #[must_use]
    pub fn reset_from(&self, state: &PersistedState) -> ResetReport {
        if state.tps_throttles.len() != self.throttles.len() {
            warn!(
                saved = state.tps_throttles.len(),
                configured = self.throttles.len(),
                "Throttle snapshot count does not match configured throttles, not resetting"
            );
            return ResetReport::default();
        }
        let throttles_reset =
            safe_reset_throttles(&self.throttles, &state.tps_throttles, "saved state");

        let gas_reset = match (&self.gas, &state.gas_throttle) {
            (Some(gas), Some(snapshot)) => match gas.reset_usage_to(snapshot) {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        capacity = gas.capacity(),
                        %snapshot,
                        "Saved gas throttle snapshot incompatible, keeping current: {err}"
                    );
                    false
                }
            },
            (None, Some(snapshot)) => {
                warn!(%snapshot, "Saved gas throttle snapshot but no gas throttle configured");
                false
            }
            (_, None) => false,
        };

        ResetReport {
            throttles_reset,
            gas_reset,
        }
    }
}

/// Reset each throttle from the snapshot at the same position, all or
/// nothing. If any snapshot does not fit its throttle a warning naming
/// `source` is logged and every throttle is put back to the state it had
/// before the call. Extra throttles or snapshots are ignored.
///
/// Returns the number of throttles reset, zero if the reset was declined.
#[must_use]
pub fn safe_reset_throttles(
    throttles: &[Arc<DeterministicThrottle>],
    snapshots: &[UsageSnapshot],
    source: &str,
) -> usize {
    let prior: Vec<UsageSnapshot> = throttles
        .iter()
        .map(|throttle| throttle.usage_snapshot())
        .collect();
    let mut reset = 0;
    for (throttle, snapshot) in throttles.iter().zip(snapshots) {
        if let Err(err) = throttle.reset_usage_to(snapshot) {
            warn!(
                throttle = throttle.name().unwrap_or("unnamed"),
                source,
                %snapshot,
                "Could not reset throttle, keeping prior state of all throttles: {err}"
            );
            restore(throttles, &prior);
            return 0;
        }
        reset += 1;
    }
    reset
}

fn restore(throttles: &[Arc<DeterministicThrottle>], prior: &[UsageSnapshot]) {
    for (throttle, snapshot) in throttles.iter().zip(prior) {
        // A snapshot taken from the throttle itself always fits it.
        if let Err(err) = throttle.reset_usage_to(snapshot) {
            warn!(
                throttle = throttle.name().unwrap_or("unnamed"),
                %snapshot,
                "Could not restore prior throttle state: {err}"
            );
        }
    }
}
