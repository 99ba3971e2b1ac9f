//! Coalescing set of half-open `u32` intervals.
//!
//! Used for sent/acknowledged bookkeeping on queued messages and for
//! fragment reassembly. Ranges are kept sorted, disjoint and non-adjacent:
//! inserting `[0, 4)` next to `[4, 8)` leaves a single `[0, 8)`.

use core::fmt;
use core::ops::Range;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<Range<u32>>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges held.
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Total number of positions covered.
    pub fn covered_len(&self) -> u64 {
        self.ranges.iter().map(|r| u64::from(r.end - r.start)).sum()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Add `[start, end)`, merging with anything it overlaps or touches.
    /// Empty or inverted ranges are ignored.
    pub fn insert(&mut self, start: u32, end: u32) {
        if start >= end {
            return;
        }
        let lo = self.ranges.partition_point(|r| r.end < start);
        let hi = self.ranges.partition_point(|r| r.start <= end);
        if lo == hi {
            self.ranges.insert(lo, start..end);
            return;
        }
        let merged = start.min(self.ranges[lo].start)..end.max(self.ranges[hi - 1].end);
        self.ranges.splice(lo..hi, core::iter::once(merged));
    }

    /// Remove `[start, end)`, splitting any range it cuts through.
    pub fn remove(&mut self, start: u32, end: u32) {
        if start >= end {
            return;
        }
        let lo = self.ranges.partition_point(|r| r.end <= start);
        let hi = self.ranges.partition_point(|r| r.start < end);
        if lo >= hi {
            return;
        }
        let head = self.ranges[lo].start..start;
        let tail = end..self.ranges[hi - 1].end;
        let keep = [head, tail].into_iter().filter(|r| r.start < r.end);
        self.ranges.splice(lo..hi, keep);
    }

    pub fn contains(&self, pos: u32) -> bool {
        let i = self.ranges.partition_point(|r| r.end <= pos);
        self.ranges.get(i).is_some_and(|r| r.start <= pos)
    }

    /// True if every position in `[start, end)` is in the set.
    pub fn covers(&self, start: u32, end: u32) -> bool {
        if start >= end {
            return true;
        }
        let i = self.ranges.partition_point(|r| r.end <= start);
        self.ranges
            .get(i)
            .is_some_and(|r| r.start <= start && r.end >= end)
    }

    /// The uncovered parts of `[0, limit)`, in ascending order.
    pub fn gaps(&self, limit: u32) -> Vec<Range<u32>> {
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for r in &self.ranges {
            if r.start >= limit {
                break;
            }
            if r.start > cursor {
                gaps.push(cursor..r.start);
            }
            cursor = cursor.max(r.end);
        }
        if cursor < limit {
            gaps.push(cursor..limit);
        }
        gaps
    }

    /// First uncovered range within `[0, limit)`.
    pub fn first_gap(&self, limit: u32) -> Option<Range<u32>> {
        let mut cursor = 0;
        for r in &self.ranges {
            if r.start > cursor {
                return Some(cursor..r.start.min(limit)).filter(|g| g.start < g.end);
            }
            cursor = r.end;
            if cursor >= limit {
                return None;
            }
        }
        (cursor < limit).then_some(cursor..limit)
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<u32>> + '_ {
        self.ranges.iter().cloned()
    }
}

impl fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ranges.iter()).finish()
    }
}

impl FromIterator<Range<u32>> for RangeSet {
    fn from_iter<I: IntoIterator<Item = Range<u32>>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for r in iter {
            set.insert(r.start, r.end);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ranges(set: &RangeSet) -> Vec<Range<u32>> {
        set.iter().collect()
    }

    #[test]
    fn insert_merges_adjacent_and_overlapping() {
        let mut set = RangeSet::new();
        set.insert(0, 4);
        set.insert(8, 12);
        assert_eq!(ranges(&set), vec![0..4, 8..12]);

        set.insert(4, 8);
        assert_eq!(ranges(&set), vec![0..12]);

        set.insert(10, 20);
        assert_eq!(ranges(&set), vec![0..20]);
    }

    #[test]
    fn insert_bridges_many_ranges() {
        let mut set: RangeSet = [0..2, 4..6, 8..10, 20..30].into_iter().collect();
        set.insert(1, 9);
        assert_eq!(ranges(&set), vec![0..10, 20..30]);
    }

    #[test]
    fn empty_and_inverted_ranges_are_ignored() {
        let mut set = RangeSet::new();
        set.insert(5, 5);
        set.insert(9, 3);
        assert!(set.is_empty());
        set.insert(0, 10);
        set.remove(7, 2);
        assert_eq!(ranges(&set), vec![0..10]);
    }

    #[test]
    fn remove_splits_range() {
        let mut set: RangeSet = [0..100].into_iter().collect();
        set.remove(40, 60);
        assert_eq!(ranges(&set), vec![0..40, 60..100]);
        assert!(!set.contains(40));
        assert!(set.contains(39));
        assert!(set.contains(60));
    }

    #[test]
    fn remove_spanning_several_ranges() {
        let mut set: RangeSet = [0..10, 20..30, 40..50].into_iter().collect();
        set.remove(5, 45);
        assert_eq!(ranges(&set), vec![0..5, 45..50]);
    }

    #[test]
    fn covers_requires_single_range() {
        let set: RangeSet = [0..10, 11..20].into_iter().collect();
        assert!(set.covers(2, 10));
        assert!(!set.covers(2, 12));
        assert!(set.covers(11, 20));
        assert!(set.covers(3, 3));
    }

    #[test]
    fn gaps_and_first_gap() {
        let set: RangeSet = [2..4, 6..8].into_iter().collect();
        assert_eq!(set.gaps(10), vec![0..2, 4..6, 8..10]);
        assert_eq!(set.first_gap(10), Some(0..2));
        assert_eq!(set.gaps(5), vec![0..2, 4..5]);

        let full: RangeSet = [0..10].into_iter().collect();
        assert!(full.gaps(10).is_empty());
        assert_eq!(full.first_gap(10), None);
        assert_eq!(full.first_gap(12), Some(10..12));

        let from_zero: RangeSet = [0..3].into_iter().collect();
        assert_eq!(from_zero.first_gap(10), Some(3..10));
    }

    #[test]
    fn covered_len_sums_ranges() {
        let set: RangeSet = [0..10, 20..25].into_iter().collect();
        assert_eq!(set.covered_len(), 15);
    }

    fn arb_ops() -> impl Strategy<Value = Vec<(bool, u32, u32)>> {
        prop::collection::vec((any::<bool>(), 0..500u32, 0..500u32), 0..40)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn stays_sorted_disjoint_and_non_adjacent(ops in arb_ops()) {
            let mut set = RangeSet::new();
            for (add, a, b) in ops {
                if add { set.insert(a, b) } else { set.remove(a, b) }
            }
            let rs = ranges(&set);
            for r in &rs {
                prop_assert!(r.start < r.end);
            }
            for pair in rs.windows(2) {
                prop_assert!(pair[0].end < pair[1].start);
            }
        }

        #[test]
        fn membership_matches_model(ops in arb_ops(), probe in 0..520u32) {
            let mut set = RangeSet::new();
            let mut model = vec![false; 520];
            for (add, a, b) in ops {
                if add { set.insert(a, b) } else { set.remove(a, b) }
                for slot in model.iter_mut().take(b as usize).skip(a as usize) {
                    *slot = add;
                }
            }
            prop_assert_eq!(set.contains(probe), model[probe as usize]);
        }

        #[test]
        fn insert_then_remove_equals_remove(ops in arb_ops(), a in 0..500u32, len in 1..50u32) {
            let mut base = RangeSet::new();
            for (add, x, y) in ops {
                if add { base.insert(x, y) } else { base.remove(x, y) }
            }
            let mut expected = base.clone();
            expected.remove(a, a + len);

            let mut round = base.clone();
            round.insert(a, a + len);
            round.remove(a, a + len);
            prop_assert_eq!(round, expected);
        }

        #[test]
        fn gaps_complement_the_set(ops in arb_ops(), limit in 1..520u32) {
            let mut set = RangeSet::new();
            for (add, a, b) in ops {
                if add { set.insert(a, b) } else { set.remove(a, b) }
            }
            let gaps = set.gaps(limit);
            for pos in 0..limit {
                let in_gap = gaps.iter().any(|g| g.contains(&pos));
                prop_assert_eq!(in_gap, !set.contains(pos));
            }
            prop_assert_eq!(set.first_gap(limit), gaps.first().cloned());
        }
    }
}
