//! Per-step metric counters and cross-partition roll-up.

use serde::{Deserialize, Serialize};

/// The eight counters recorded for every step thread execution.
///
/// Counters only ever accumulate within one execution row. Aggregation
/// across partitions happens by summing separate rows; a partition's own
/// counters are never mutated by the roll-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub read_count: u64,
    pub write_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub filter_count: u64,
    pub write_skip_count: u64,
}

impl StepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add another metrics row into this one, counter by counter.
    pub fn add(&mut self, other: &StepMetrics) {
        self.read_count += other.read_count;
        self.write_count += other.write_count;
        self.commit_count += other.commit_count;
        self.rollback_count += other.rollback_count;
        self.read_skip_count += other.read_skip_count;
        self.process_skip_count += other.process_skip_count;
        self.filter_count += other.filter_count;
        self.write_skip_count += other.write_skip_count;
    }

    /// Sum an iterator of metric rows.
    pub fn sum<'a>(rows: impl IntoIterator<Item = &'a StepMetrics>) -> StepMetrics {
        let mut total = StepMetrics::new();
        for row in rows {
            total.add(row);
        }
        total
    }

    /// Whether `self` is a legal successor snapshot of `prev` within one
    /// execution row (every counter at least as large).
    pub fn is_monotonic_successor_of(&self, prev: &StepMetrics) -> bool {
        self.read_count >= prev.read_count
            && self.write_count >= prev.write_count
            && self.commit_count >= prev.commit_count
            && self.rollback_count >= prev.rollback_count
            && self.read_skip_count >= prev.read_skip_count
            && self.process_skip_count >= prev.process_skip_count
            && self.filter_count >= prev.filter_count
            && self.write_skip_count >= prev.write_skip_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(read: u64, write: u64, commit: u64) -> StepMetrics {
        StepMetrics {
            read_count: read,
            write_count: write,
            commit_count: commit,
            ..StepMetrics::default()
        }
    }

    #[test]
    fn sum_adds_every_counter() {
        let rows = [
            metrics(10, 8, 2),
            metrics(5, 5, 1),
            StepMetrics {
                read_skip_count: 3,
                filter_count: 7,
                ..StepMetrics::default()
            },
        ];
        let total = StepMetrics::sum(rows.iter());
        assert_eq!(total.read_count, 15);
        assert_eq!(total.write_count, 13);
        assert_eq!(total.commit_count, 3);
        assert_eq!(total.read_skip_count, 3);
        assert_eq!(total.filter_count, 7);
        assert_eq!(total.rollback_count, 0);
    }

    #[test]
    fn sum_of_nothing_is_zero() {
        assert_eq!(StepMetrics::sum([].iter()), StepMetrics::new());
    }

    #[test]
    fn monotonic_successor_check() {
        let before = metrics(10, 8, 2);
        let after = metrics(12, 8, 3);
        assert!(after.is_monotonic_successor_of(&before));
        assert!(!before.is_monotonic_successor_of(&after));
        assert!(before.is_monotonic_successor_of(&before));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_metrics() -> impl Strategy<Value = StepMetrics> {
            (0u64..1000, 0u64..1000, 0u64..1000, 0u64..1000).prop_map(|(r, w, c, s)| StepMetrics {
                read_count: r,
                write_count: w,
                commit_count: c,
                read_skip_count: s,
                ..StepMetrics::default()
            })
        }

        proptest! {
            /// Property: summation is order-independent.
            #[test]
            fn sum_is_commutative(a in arb_metrics(), b in arb_metrics(), c in arb_metrics()) {
                let fwd = StepMetrics::sum([a, b, c].iter());
                let rev = StepMetrics::sum([c, b, a].iter());
                prop_assert_eq!(fwd, rev);
            }

            /// Property: adding a row never decreases any counter.
            #[test]
            fn add_is_monotonic(a in arb_metrics(), b in arb_metrics()) {
                let mut total = a;
                total.add(&b);
                prop_assert!(total.is_monotonic_successor_of(&a));
                prop_assert!(total.is_monotonic_successor_of(&b));
            }
        }
    }
}
