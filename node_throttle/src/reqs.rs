//! Per-operation throttle requirements
//!
//! An operation kind may appear in several buckets. A request of that kind is
//! admitted only if every one of those buckets admits it. Buckets that admit
//! while another rejects have the admission given back, so a rejected request
//! never consumes capacity anywhere.

use std::sync::Arc;

use crate::{
    deterministic::{DeterministicThrottle, Error},
    time::Timestamp,
};

/// The throttles, and logical operations against each, that apply to one
/// operation kind.
#[derive(Debug, Default, Clone)]
pub struct ThrottleReqs {
    reqs: Vec<(Arc<DeterministicThrottle>, u32)>,
}

impl ThrottleReqs {
    /// Create an empty `ThrottleReqs`. An empty set of requirements is always
    /// met.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `ops` logical operations of `throttle`.
    pub fn push(&mut self, throttle: Arc<DeterministicThrottle>, ops: u32) {
        self.reqs.push((throttle, ops));
    }

    /// The requirements, in the order they were added.
    #[must_use]
    pub fn reqs(&self) -> &[(Arc<DeterministicThrottle>, u32)] {
        &self.reqs
    }

    /// Ask every throttle to admit its operations at `now`. Every throttle is
    /// asked, even after one rejects, so that all of them observe `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimeReversed`] if `now` precedes any throttle's last
    /// decision. Admissions already made by this call are given back.
    pub fn all_reqs_met_for(&self, now: Timestamp) -> Result<bool, Error> {
        let mut admitted: Vec<(&DeterministicThrottle, u32)> = Vec::with_capacity(self.reqs.len());
        let mut all_met = true;
        for (throttle, ops) in &self.reqs {
            match throttle.allow(*ops, now) {
                Ok(true) => admitted.push((throttle, *ops)),
                Ok(false) => all_met = false,
                Err(err) => {
                    reclaim(&admitted);
                    return Err(err);
                }
            }
        }
        if !all_met {
            reclaim(&admitted);
        }
        Ok(all_met)
    }
}

fn reclaim(admitted: &[(&DeterministicThrottle, u32)]) {
    for (throttle, ops) in admitted {
        throttle.reclaim_capacity_for(*ops);
    }
}

#[cfg(all(test, not(loom)))]
mod test {
    use std::sync::Arc;

    use super::ThrottleReqs;
    use crate::{
        bucket::CAPACITY_UNITS_PER_OP,
        deterministic::{DeterministicThrottle, Error},
        time::Timestamp,
    };

    #[test]
    fn empty_reqs_are_met() {
        assert!(ThrottleReqs::new().all_reqs_met_for(Timestamp::EPOCH).unwrap());
    }

    #[test]
    fn rejection_anywhere_gives_back_admissions() {
        let wide = Arc::new(DeterministicThrottle::with_tps(100).unwrap());
        let narrow = Arc::new(DeterministicThrottle::with_tps(2).unwrap());
        let mut reqs = ThrottleReqs::new();
        reqs.push(Arc::clone(&wide), 10);
        reqs.push(Arc::clone(&narrow), 1);

        let now = Timestamp::from_seconds(7);
        assert!(reqs.all_reqs_met_for(now).unwrap());
        assert!(reqs.all_reqs_met_for(now).unwrap());
        assert!(!reqs.all_reqs_met_for(now).unwrap());

        assert_eq!(wide.used(), 20 * CAPACITY_UNITS_PER_OP);
        assert_eq!(narrow.used(), 2 * CAPACITY_UNITS_PER_OP);
        // The rejected call still advanced both throttles' clocks.
        assert_eq!(wide.usage_snapshot().last_decision_time, Some(now));
    }

    #[test]
    fn time_reversal_gives_back_admissions() {
        let first = Arc::new(DeterministicThrottle::with_tps(5).unwrap());
        let second = Arc::new(DeterministicThrottle::with_tps(5).unwrap());
        assert!(second.allow(1, Timestamp::from_seconds(10)).unwrap());

        let mut reqs = ThrottleReqs::new();
        reqs.push(Arc::clone(&first), 1);
        reqs.push(Arc::clone(&second), 1);
        assert!(matches!(
            reqs.all_reqs_met_for(Timestamp::from_seconds(9)),
            Err(Error::TimeReversed { .. })
        ));
        assert_eq!(first.used(), 0);
        assert_eq!(second.used(), CAPACITY_UNITS_PER_OP);
    }
}
