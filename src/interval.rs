//! C1 — Interval index: per-inode merge-on-insert of half-open page ranges.
//!
//! Uses a binary search to a position, then a bounded linear walk outward
//! to find the full touching-or-overlapping span, rather than an
//! out-of-band sentinel trick: `Vec::binary_search_by` gives the insertion
//! position directly, no sentinel element required.

use crate::error::CoreError;
use crate::model::{DeviceId, DeviceTable, InodeIndex, PageRange};
use log::warn;

/// Owns the [`DeviceTable`] for the duration of one trace and exposes the
/// `add`/`find` contract for one trace's touched-page bookkeeping.
#[derive(Debug, Default)]
pub struct IntervalIndex {
    table: DeviceTable,
}

impl IntervalIndex {
    pub fn new() -> Self {
        Self {
            table: DeviceTable::new(),
        }
    }

    /// Consumes the index, handing ownership of the table to the reducer.
    pub fn into_table(self) -> DeviceTable {
        self.table
    }

    pub fn table(&self) -> &DeviceTable {
        &self.table
    }

    pub fn find(&self, device_id: DeviceId, inode_id: u64) -> Option<&InodeIndex> {
        self.table.find(device_id, inode_id)
    }

    /// Adds `[first_page, last_page_inclusive]` to the inode's range set.
    ///
    /// Numeric overflow on the `last_page + 1` conversion is detected and
    /// rejected with a logged warning and no mutation (a per-record condition, not a
    /// recoverable split in §7: this is a per-record condition, not a crash).
    pub fn add(
        &mut self,
        device_id: DeviceId,
        inode_id: u64,
        first_page: u64,
        last_page_inclusive: u64,
    ) {
        let Some(range) = PageRange::from_inclusive(first_page, last_page_inclusive) else {
            warn!(
                "inode {inode_id} on device {device_id:?}: page range [{first_page}, {last_page_inclusive}] \
                 overflows address space, dropping"
            );
            return;
        };
        let device = self.table.device_mut(device_id);
        let inode = device.get_or_insert(inode_id);
        Self::merge_in(inode, range);
    }

    fn merge_in(inode: &mut InodeIndex, range: PageRange) {
        let ranges = &mut inode.ranges;
        // Binary search for any range whose `start` is >= range.start; the
        // true touching-or-overlapping span may extend one step to the left
        // of this, so we widen the search outward from here.
        let pos = ranges.partition_point(|r| r.start < range.start);

        // Walk left from `pos` while the predecessor touches-or-overlaps.
        let mut lo = pos;
        while lo > 0 && ranges[lo - 1].touches_or_overlaps(&range) {
            lo -= 1;
        }
        // Walk right from `pos` while the candidate touches-or-overlaps.
        let mut hi = pos;
        while hi < ranges.len() && ranges[hi].touches_or_overlaps(&range) {
            hi += 1;
        }

        if lo == hi {
            // No existing range touches-or-overlaps; plain insert.
            ranges.insert(lo, range);
            return;
        }

        let merged_start = ranges[lo..hi]
            .iter()
            .map(|r| r.start)
            .min()
            .unwrap()
            .min(range.start);
        let merged_end = ranges[lo..hi]
            .iter()
            .map(|r| r.end)
            .max()
            .unwrap()
            .max(range.end);
        ranges.splice(
            lo..hi,
            std::iter::once(PageRange {
                start: merged_start,
                end: merged_end,
            }),
        );
    }
}

/// Allocation failure during interval bookkeeping is fatal; Rust
/// surfaces that as an abort from the global allocator, not a `Result`, so
/// there is no corresponding fallible path here. This helper exists only to
/// give fatal-invariant callers (C5/C6) a typed error to return.
pub fn fatal_invariant(msg: impl Into<String>) -> CoreError {
    CoreError::FatalInvariant(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> DeviceId {
        DeviceId { major: 8, minor: 0 }
    }

    fn ranges_of(idx: &IntervalIndex, inode: u64) -> Vec<(u64, u64)> {
        idx.find(dev(), inode)
            .map(|ii| ii.ranges.iter().map(|r| (r.start, r.end)).collect())
            .unwrap_or_default()
    }

    #[test]
    fn fill_a_gap() {
        let mut idx = IntervalIndex::new();
        idx.add(dev(), 12345, 0, 0);
        assert_eq!(ranges_of(&idx, 12345), vec![(0, 1)]);
        idx.add(dev(), 12345, 2, 3);
        assert_eq!(ranges_of(&idx, 12345), vec![(0, 1), (2, 4)]);
        idx.add(dev(), 12345, 1, 1);
        assert_eq!(ranges_of(&idx, 12345), vec![(0, 4)]);
    }

    #[test]
    fn touching_at_end() {
        let mut idx = IntervalIndex::new();
        idx.add(dev(), 1, 0, 0);
        idx.add(dev(), 1, 2, 3);
        idx.add(dev(), 1, 1, 1);
        idx.add(dev(), 1, 4, 5);
        assert_eq!(ranges_of(&idx, 1), vec![(0, 6)]);
        idx.add(dev(), 1, 8, 10);
        assert_eq!(ranges_of(&idx, 1), vec![(0, 6), (8, 11)]);
        idx.add(dev(), 1, 7, 7);
        assert_eq!(ranges_of(&idx, 1), vec![(0, 6), (7, 11)]);
    }

    #[test]
    fn swallow_multiple() {
        let mut idx = IntervalIndex::new();
        for (s, e) in [(0, 11), (20, 31), (50, 61), (70, 81), (90, 101)] {
            idx.add(dev(), 1, s, e - 1);
        }
        idx.add(dev(), 1, 25, 69);
        assert_eq!(
            ranges_of(&idx, 1),
            vec![(0, 11), (20, 81), (90, 101)]
        );
    }

    #[test]
    fn insertion_is_commutative() {
        let adds = [(0u64, 0u64), (2, 3), (1, 1), (8, 10), (7, 7), (20, 25)];
        let mut forward = IntervalIndex::new();
        for (s, e) in adds {
            forward.add(dev(), 1, s, e);
        }
        let mut backward = IntervalIndex::new();
        for (s, e) in adds.iter().rev() {
            backward.add(dev(), 1, *s, *e);
        }
        assert_eq!(ranges_of(&forward, 1), ranges_of(&backward, 1));
    }

    #[test]
    fn overflow_is_rejected_without_mutation() {
        let mut idx = IntervalIndex::new();
        idx.add(dev(), 1, 0, u64::MAX);
        assert_eq!(ranges_of(&idx, 1), Vec::<(u64, u64)>::new());
    }

    #[test]
    fn result_is_sorted_and_non_touching() {
        let mut idx = IntervalIndex::new();
        for (s, e) in [(50, 55), (0, 2), (100, 110), (4, 4), (60, 62)] {
            idx.add(dev(), 1, s, e);
        }
        let ranges: Vec<_> = idx.find(dev(), 1).unwrap().ranges.clone();
        for w in ranges.windows(2) {
            assert!(w[0].start < w[1].start);
            assert!(w[0].end < w[1].start, "ranges must not touch: {:?}", w);
        }
    }
}
