use crate::segment::AlignedHeapSegment;
use crate::storage::AlignedStorage;

use std::ptr::NonNull;

/// Sorted map from segment base addresses to the segments themselves,
/// answering "which segment contains this pointer" in O(log n). A sorted
/// vector beats a tree at the handful-of-segments scale this index sees.
///
/// Entries are raw segment pointers; generations keep their segments boxed
/// so the pointers stay stable, and remove entries here before a segment is
/// dropped.
pub struct GCSegmentAddressIndex {
    entries: Vec<(usize, NonNull<AlignedHeapSegment>)>,
}

impl GCSegmentAddressIndex {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert the mapping for `segment`, or overwrite the existing entry
    /// for its base address (the segment object may have moved).
    pub fn update(&mut self, segment: NonNull<AlignedHeapSegment>) {
        let key = unsafe { segment.as_ref().low_lim() as usize };
        match self.entries.binary_search_by_key(&key, |e| e.0) {
            Ok(pos) => self.entries[pos].1 = segment,
            Err(pos) => self.entries.insert(pos, (key, segment)),
        }
    }

    /// The segment whose storage contains `ptr`, if it is tracked here.
    /// Returns `None` for any address outside all tracked segments, e.g. a
    /// stack pointer or a segment already returned to its provider.
    pub fn segment_covering(&self, ptr: *const u8) -> Option<NonNull<AlignedHeapSegment>> {
        let key = AlignedStorage::start(ptr) as usize;
        self.entries
            .binary_search_by_key(&key, |e| e.0)
            .ok()
            .map(|pos| self.entries[pos].1)
    }

    /// Remove a batch of entries in one merge pass. `low_lims` must be
    /// sorted ascending; passing unsorted keys is a programming error, not
    /// a recoverable condition.
    pub fn remove(&mut self, low_lims: &[usize]) {
        debug_assert!(
            low_lims.windows(2).all(|w| w[0] < w[1]),
            "removal keys must be pre-sorted"
        );
        let mut cursor = 0;
        self.entries.retain(|&(key, _)| {
            while cursor < low_lims.len() && low_lims[cursor] < key {
                cursor += 1;
            }
            !(cursor < low_lims.len() && low_lims[cursor] == key)
        });
    }

    /// Segments in increasing address order; the order the full collector
    /// relies on for its overflow-restart scan.
    pub fn iter(&self) -> impl Iterator<Item = NonNull<AlignedHeapSegment>> + '_ {
        self.entries.iter().map(|e| e.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::AlignedHeapSegment;
    use crate::storage::VMStorageProvider;

    fn boxed_segment(provider: &mut VMStorageProvider) -> Box<AlignedHeapSegment> {
        Box::new(AlignedHeapSegment::create(provider, "index-test").unwrap())
    }

    #[test]
    fn covering_queries() {
        let mut provider = VMStorageProvider::new();
        let mut a = boxed_segment(&mut provider);
        let mut b = boxed_segment(&mut provider);
        a.grow_to_limit();
        b.grow_to_limit();

        let mut index = GCSegmentAddressIndex::new();
        index.update(NonNull::from(&mut *a));
        index.update(NonNull::from(&mut *b));
        assert_eq!(index.len(), 2);

        for segment in [&a, &b].iter() {
            let interior = unsafe { segment.low_lim().add(100_000) };
            let found = index.segment_covering(interior).unwrap();
            assert_eq!(
                unsafe { found.as_ref().low_lim() },
                segment.low_lim(),
                "covering query must resolve to the owning segment"
            );
        }

        // An address in no tracked segment resolves to nothing.
        let stack_local = 0usize;
        assert!(index
            .segment_covering(&stack_local as *const usize as *const u8)
            .is_none());
    }

    #[test]
    fn batch_removal() {
        let mut provider = VMStorageProvider::new();
        let mut segments: Vec<_> = (0..4).map(|_| boxed_segment(&mut provider)).collect();

        let mut index = GCSegmentAddressIndex::new();
        for segment in segments.iter_mut() {
            index.update(NonNull::from(&mut **segment));
        }
        assert_eq!(index.len(), 4);

        let mut doomed: Vec<usize> = [&segments[1], &segments[3]]
            .iter()
            .map(|s| s.low_lim() as usize)
            .collect();
        doomed.sort_unstable();
        index.remove(&doomed);

        assert_eq!(index.len(), 2);
        assert!(index.segment_covering(segments[1].low_lim()).is_none());
        assert!(index.segment_covering(segments[0].low_lim()).is_some());

        // Iteration stays in address order.
        let addresses: Vec<usize> = index.iter().map(|s| unsafe { s.as_ref().low_lim() as usize }).collect();
        let mut sorted = addresses.clone();
        sorted.sort_unstable();
        assert_eq!(addresses, sorted);
    }
}
