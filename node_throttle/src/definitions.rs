//! Throttle definitions
//!
//! The network's throttle policy is a list of buckets. Each bucket holds one
//! or more groups, a group being a rate in operations per second and the
//! operation kinds it applies to. Every bucket becomes a single
//! [`DeterministicThrottle`] shared by all its groups. To let groups of
//! different rates share one bucket, the bucket is rated at the least common
//! multiple of its group rates and each request of a kind costs
//! `lcm / group rate` logical operations.
//!
//! Definitions arrive as JSON. Any inconsistency is a configuration error and
//! must stop the node from adopting the definitions.

use std::{
    collections::HashSet,
    fs,
    hash::Hash,
    io,
    num::NonZeroU32,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    bucket::{self, MS_PER_SECOND, MTPS_PER_TPS},
    deterministic::{self, DeterministicThrottle},
};

/// The burst period of a bucket that declares none.
pub const DEFAULT_BURST_PERIOD_MS: u64 = 1_000;

/// Errors produced by [`ThrottleDefinitions`] and [`ThrottleBucket`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The bucket has no groups.
    #[error("bucket {bucket} includes no throttle groups")]
    NoGroups {
        /// Name of the bucket.
        bucket: String,
    },
    /// A group in the bucket has no operations.
    #[error("bucket {bucket} has a throttle group with no operations")]
    NoOperations {
        /// Name of the bucket.
        bucket: String,
    },
    /// A group in the bucket has a rate of zero.
    #[error("bucket {bucket} has a throttle group with zero ops per second")]
    ZeroOpsPerSec {
        /// Name of the bucket.
        bucket: String,
    },
    /// An operation kind appears in more than one group of the bucket.
    #[error("bucket {bucket} repeats an operation across throttle groups")]
    RepeatedOperation {
        /// Name of the bucket.
        bucket: String,
    },
    /// Capacity arithmetic for the bucket overflows.
    #[error("bucket {bucket} overflows with its throttle groups")]
    Overflow {
        /// Name of the bucket.
        bucket: String,
    },
    /// At this network size the bucket could never admit a request of one of
    /// its groups.
    #[error("bucket {bucket} contains an unsatisfiable ops per second with {network_size} nodes")]
    NeverPermits {
        /// Name of the bucket.
        bucket: String,
        /// Number of nodes sharing the bucket.
        network_size: u32,
    },
    /// Failed to deserialize definitions.
    #[error("Failed to deserialize throttle definitions: {0}")]
    Json(#[from] serde_json::Error),
    /// Error reading definitions file
    #[error("Failed to read throttle definitions {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

/// A rate and the operation kinds it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleGroup<K> {
    /// Network-wide operations per second.
    pub ops_per_sec: u64,
    /// Operation kinds sharing the rate.
    pub operations: Vec<K>,
}

/// A set of groups sharing one leaky bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleBucket<K> {
    /// Name of the bucket, carried into its throttle.
    pub name: String,
    /// Burst period in seconds. Ignored if `burst_period_ms` is set.
    #[serde(default)]
    pub burst_period: u64,
    /// Burst period in milliseconds.
    #[serde(default)]
    pub burst_period_ms: u64,
    /// The groups, in declaration order.
    pub throttle_groups: Vec<ThrottleGroup<K>>,
}

/// The logical operations each request of a kind costs against a bucket.
pub type OpsRequirement<K> = (K, u32);

/// A bucket resolved for a given network size.
pub type ThrottleMapping<K> = (DeterministicThrottle, Vec<OpsRequirement<K>>);

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: u64, b: u64) -> Option<u64> {
    (a / gcd(a, b)).checked_mul(b)
}

impl<K> ThrottleBucket<K> {
    fn overflow(&self) -> Error {
        Error::Overflow {
            bucket: self.name.clone(),
        }
    }

    /// The burst period in milliseconds this bucket resolves to.
    ///
    /// # Errors
    ///
    /// Returns an error if `burst_period` in milliseconds overflows.
    pub fn implied_burst_period_ms(&self) -> Result<u64, Error> {
        if self.burst_period_ms > 0 {
            Ok(self.burst_period_ms)
        } else if self.burst_period > 0 {
            self.burst_period
                .checked_mul(MS_PER_SECOND)
                .ok_or_else(|| self.overflow())
        } else {
            Ok(DEFAULT_BURST_PERIOD_MS)
        }
    }

    /// Operations per second that every group's rate divides evenly.
    fn aggregate_ops_per_sec(&self) -> Result<u64, Error> {
        self.throttle_groups
            .iter()
            .try_fold(1, |acc, group| lcm(acc, group.ops_per_sec))
            .ok_or_else(|| self.overflow())
    }

    fn validate_groups(&self) -> Result<(), Error> {
        if self.throttle_groups.is_empty() {
            return Err(Error::NoGroups {
                bucket: self.name.clone(),
            });
        }
        for group in &self.throttle_groups {
            if group.ops_per_sec == 0 {
                return Err(Error::ZeroOpsPerSec {
                    bucket: self.name.clone(),
                });
            }
            if group.operations.is_empty() {
                return Err(Error::NoOperations {
                    bucket: self.name.clone(),
                });
            }
        }
        Ok(())
    }
}

impl<K> ThrottleBucket<K>
where
    K: Clone + Eq + Hash,
{
    /// Resolve this bucket into one throttle for a node of a network of
    /// `network_size` nodes, paired with the logical operations each kind
    /// costs against it. Kinds are listed in declaration order, once each.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket is inconsistent, overflows, or could
    /// never admit a request of one of its groups at this network size.
    pub fn as_throttle_mapping(
        &self,
        network_size: NonZeroU32,
    ) -> Result<ThrottleMapping<K>, Error> {
        self.validate_groups()?;

        let n = u64::from(network_size.get());
        let aggregate = self.aggregate_ops_per_sec()?;
        let logical_mtps = aggregate
            .checked_mul(MTPS_PER_TPS)
            .ok_or_else(|| self.overflow())?;
        let never_permits = || Error::NeverPermits {
            bucket: self.name.clone(),
            network_size: network_size.get(),
        };

        let burst_period_ms = self.implied_burst_period_ms()?;
        let mtps = logical_mtps / n;
        let throttle =
            match DeterministicThrottle::with_mtps_and_burst_period_ms(mtps, burst_period_ms) {
                Ok(throttle) => throttle.with_name(self.name.clone()),
                Err(deterministic::Error::Bucket(bucket::Error::InsufficientCapacity { .. })) => {
                    return Err(never_permits());
                }
                Err(_) => return Err(self.overflow()),
            };
        let capacity = throttle.capacity();

        let mut seen: HashSet<&K> = HashSet::new();
        let mut reqs = Vec::new();
        for group in &self.throttle_groups {
            let ops = aggregate / group.ops_per_sec;
            // Each count must remain a positive 32-bit signed value even when
            // multiplied out across the network.
            let ops = u32::try_from(ops)
                .ok()
                .filter(|ops| *ops > 0)
                .filter(|ops| u64::from(*ops).saturating_mul(n) <= i32::MAX.unsigned_abs().into())
                .ok_or_else(|| self.overflow())?;
            match DeterministicThrottle::capacity_required_for(ops) {
                Some(required) if required <= capacity => {}
                _ => return Err(never_permits()),
            }

            let mut in_group: HashSet<&K> = HashSet::new();
            for op in &group.operations {
                if seen.contains(op) {
                    return Err(Error::RepeatedOperation {
                        bucket: self.name.clone(),
                    });
                }
                // Repeats within a group collapse to their first occurrence.
                if in_group.insert(op) {
                    reqs.push((op.clone(), ops));
                }
            }
            seen.extend(in_group);
        }

        debug!(
            bucket = %self.name,
            network_size = network_size.get(),
            mtps = throttle.mtps(),
            burst_period_ms,
            "Resolved throttle bucket"
        );
        Ok((throttle, reqs))
    }
}

/// The full throttle policy of a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThrottleDefinitions<K> {
    /// The buckets, in declaration order.
    pub buckets: Vec<ThrottleBucket<K>>,
}

impl<K> ThrottleDefinitions<K>
where
    K: DeserializeOwned,
{
    /// Parse definitions from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if `json` is not valid definitions.
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse definitions from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid
    /// definitions.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_json_str(&contents)
    }
}

impl<K> ThrottleDefinitions<K>
where
    K: Clone + Eq + Hash,
{
    /// Resolve every bucket, failing on the first bad one.
    ///
    /// # Errors
    ///
    /// See [`ThrottleBucket::as_throttle_mapping`].
    pub fn resolve(&self, network_size: NonZeroU32) -> Result<Vec<ThrottleMapping<K>>, Error> {
        self.buckets
            .iter()
            .map(|bucket| bucket.as_throttle_mapping(network_size))
            .collect()
    }
}

#[cfg(all(test, not(loom)))]
mod test {
    use std::{io::Write, num::NonZeroU32};

    use proptest::{collection, prelude::*};

    use super::{Error, ThrottleBucket, ThrottleDefinitions, ThrottleGroup, lcm};
    use crate::{
        deterministic::{DeterministicThrottle, UsageSnapshot},
        fixtures::{self, Op},
        harness::ConcurrentHarness,
    };

    fn nodes(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn bucket_a() -> ThrottleBucket<Op> {
        fixtures::definitions("throttles.json").buckets.remove(0)
    }

    fn expected_reqs() -> Vec<(Op, u32)> {
        vec![
            (Op::CryptoTransfer, 3),
            (Op::CryptoCreate, 3),
            (Op::ContractCall, 2500),
            (Op::TokenMint, 10),
        ]
    }

    #[test]
    fn maps_bucket_for_single_node() {
        // Groups of 10_000, 12 and 3_000 ops/s share an aggregate of 30_000,
        // so requests cost 3, 2_500 and 10 logical ops respectively.
        let (throttle, reqs) = bucket_a().as_throttle_mapping(nodes(1)).unwrap();
        let expected = DeterministicThrottle::with_tps_and_burst_period(30_000, 2)
            .unwrap()
            .with_name("A");
        assert_eq!(throttle, expected);
        assert_eq!(throttle.mtps(), 30_000_000);
        assert_eq!(reqs, expected_reqs());
    }

    #[test]
    fn maps_bucket_even_with_repetitions() {
        let mut defs = fixtures::definitions("throttles-repeating.json");
        let (throttle, reqs) = defs.buckets.remove(0).as_throttle_mapping(nodes(1)).unwrap();
        let expected = DeterministicThrottle::with_tps_and_burst_period(30_000, 2)
            .unwrap()
            .with_name("A");
        assert_eq!(throttle, expected);
        assert_eq!(reqs, expected_reqs());
    }

    #[test]
    fn maps_bucket_for_twenty_four_nodes() {
        let (throttle, reqs) = bucket_a().as_throttle_mapping(nodes(24)).unwrap();
        let expected = DeterministicThrottle::with_mtps_and_burst_period(30_000 * 1_000 / 24, 2)
            .unwrap()
            .with_name("A");
        assert_eq!(throttle, expected);
        assert_eq!(reqs, expected_reqs());
    }

    #[test]
    fn every_bucket_resolves() {
        let defs = fixtures::definitions("throttles.json");
        let mappings = defs.resolve(nodes(1)).unwrap();
        assert_eq!(mappings.len(), defs.buckets.len());
        for ((throttle, _), bucket) in mappings.iter().zip(&defs.buckets) {
            assert_eq!(throttle.name(), Some(bucket.name.as_str()));
        }
    }

    #[test]
    fn never_permits_at_node_level() {
        for (n, file) in [
            (2, "insufficient-capacity-throttles.json"),
            (24, "overdone-throttles.json"),
        ] {
            let bucket = fixtures::definitions(file).buckets.remove(0);
            assert!(
                matches!(
                    bucket.as_throttle_mapping(nodes(n)),
                    Err(Error::NeverPermits { network_size, .. }) if network_size == n
                ),
                "{file} at {n} nodes"
            );
            // The same definitions are fine for a single node.
            assert!(bucket.as_throttle_mapping(nodes(1)).is_ok(), "{file} at 1 node");
        }
    }

    #[test]
    fn fails_with_zero_groups() {
        let bucket: ThrottleBucket<Op> = ThrottleBucket {
            name: "empty".into(),
            burst_period: 0,
            burst_period_ms: 0,
            throttle_groups: vec![],
        };
        assert!(matches!(
            bucket.as_throttle_mapping(nodes(1)),
            Err(Error::NoGroups { .. })
        ));
    }

    #[test]
    fn fails_with_zero_ops_per_sec() {
        let bucket = fixtures::definitions("undersupplied-throttles.json")
            .buckets
            .remove(0);
        assert!(matches!(
            bucket.as_throttle_mapping(nodes(1)),
            Err(Error::ZeroOpsPerSec { .. })
        ));
    }

    #[test]
    fn fails_with_empty_group() {
        let bucket = ThrottleBucket {
            name: "hollow".into(),
            burst_period: 1,
            burst_period_ms: 0,
            throttle_groups: vec![ThrottleGroup::<Op> {
                ops_per_sec: 10,
                operations: vec![],
            }],
        };
        assert!(matches!(
            bucket.as_throttle_mapping(nodes(1)),
            Err(Error::NoOperations { .. })
        ));
    }

    #[test]
    fn fails_on_small_capacity_overflow_or_repeated_op() {
        let never = fixtures::definitions("never-true-throttles.json").buckets.remove(0);
        assert!(matches!(
            never.as_throttle_mapping(nodes(1)),
            Err(Error::NeverPermits { .. })
        ));
        let overflow = fixtures::definitions("overflow-throttles.json").buckets.remove(0);
        assert!(matches!(
            overflow.as_throttle_mapping(nodes(1)),
            Err(Error::Overflow { .. })
        ));
        let repeated = fixtures::definitions("repeated-op-throttles.json").buckets.remove(0);
        assert!(matches!(
            repeated.as_throttle_mapping(nodes(1)),
            Err(Error::RepeatedOperation { .. })
        ));
    }

    #[test]
    fn burst_period_defaults() {
        let mut bucket = bucket_a();
        bucket.burst_period = 0;
        assert_eq!(bucket.implied_burst_period_ms().unwrap(), 1_000);
        bucket.burst_period = 3;
        assert_eq!(bucket.implied_burst_period_ms().unwrap(), 3_000);
        bucket.burst_period_ms = 250;
        assert_eq!(bucket.implied_burst_period_ms().unwrap(), 250);
        bucket.burst_period_ms = 0;
        bucket.burst_period = u64::MAX;
        assert!(matches!(
            bucket.implied_burst_period_ms(),
            Err(Error::Overflow { .. })
        ));
    }

    #[test]
    fn rejects_unknown_fields_and_reads_files() {
        let bad = r#"{"buckets":[{"name":"A","throttleGroups":[],"extra":1}]}"#;
        assert!(matches!(
            ThrottleDefinitions::<Op>::from_json_str(bad),
            Err(Error::Json(_))
        ));

        let missing = std::path::Path::new("/definitely/not/here.json");
        assert!(matches!(
            ThrottleDefinitions::<Op>::from_path(missing),
            Err(Error::ReadFile { .. })
        ));

        let dir = std::env::temp_dir().join(format!("node-throttle-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("throttles.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(fixtures::raw("throttles.json").as_bytes())
            .unwrap();
        drop(file);
        let defs = ThrottleDefinitions::<Op>::from_path(&path).unwrap();
        assert_eq!(defs, fixtures::definitions("throttles.json"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn constructed_throttle_admits_at_node_share_of_group_rate() {
        let bucket = bucket_a();
        let n = 14;
        let expected_xfer_tps = bucket.throttle_groups[0].ops_per_sec as f64 / f64::from(n);
        let (throttle, reqs) = bucket.as_throttle_mapping(nodes(n)).unwrap();
        let ops_for_xfer = reqs
            .iter()
            .find(|(op, _)| *op == Op::CryptoTransfer)
            .map(|(_, ops)| *ops)
            .unwrap();
        let one_xfer = DeterministicThrottle::capacity_required_for(ops_for_xfer).unwrap();
        throttle
            .reset_usage_to(&UsageSnapshot::new(throttle.capacity() - one_xfer, None))
            .unwrap();

        let harness = ConcurrentHarness::new(3, std::time::Duration::from_secs(3), ops_for_xfer);
        let report = harness.run_with(&throttle).unwrap();
        report.check_tolerable_tps(expected_xfer_tps, 1.0).unwrap();
    }

    proptest! {
        // Logical ops always divide the aggregate evenly and the cheapest
        // group still fits at one node.
        #[test]
        fn logical_ops_divide_aggregate(rates in collection::vec(1_u64..5_000, 1..5)) {
            let bucket = ThrottleBucket {
                name: "p".into(),
                burst_period: 1,
                burst_period_ms: 0,
                throttle_groups: rates
                    .iter()
                    .enumerate()
                    .map(|(i, rate)| ThrottleGroup { ops_per_sec: *rate, operations: vec![i] })
                    .collect(),
            };
            let aggregate = rates.iter().try_fold(1, |acc, r| lcm(acc, *r));
            match bucket.as_throttle_mapping(nodes(1)) {
                Ok((throttle, reqs)) => {
                    let aggregate = aggregate.unwrap();
                    prop_assert_eq!(throttle.mtps(), aggregate * 1_000);
                    for ((_, ops), rate) in reqs.iter().zip(&rates) {
                        prop_assert_eq!(u64::from(*ops) * rate, aggregate);
                    }
                }
                Err(Error::Overflow { .. }) => {}
                Err(e) => prop_assert!(false, "unexpected error {e}"),
            }
        }
    }
}
