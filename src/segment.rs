use crate::api::Visitor;
use crate::card_table::CardTable;
use crate::cell::{self, displaced, GCCell};
use crate::globals::*;
use crate::kind_table;
use crate::mark_bits::MarkBitArray;
use crate::storage::{AlignedStorage, StorageError, StorageProvider};
use crate::sweep::{HeadersRemaining, SweepResult};
use crate::util::{align_up, is_aligned};

use std::mem::size_of;
use std::ptr::NonNull;

/// Whether pages freed by a level rollback should be advised back to the
/// OS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdviseUnused {
    No,
    Yes,
}

/// Result of a bump allocation attempt: the uninitialized cell on success,
/// `None` when the segment is out of space. Failure is normal control flow;
/// the caller escalates (next segment, collection, growth) and only the top
/// of that ladder is fatal.
pub type AllocResult = Option<NonNull<GCCell>>;

/// The metadata laid out inline at the base of every segment's storage.
/// Because storage is self-aligned, masking any interior pointer recovers
/// the base and hence these tables in O(1); that's the sole reason the
/// tables live inside the region they describe.
///
/// +----------------------------------------+ <- low_lim
/// | (1) Card table (status + boundaries)   |
/// +----------------------------------------+
/// | (2) Mark bit array                     |
/// +----------------------------------------+
/// | (3) Guard strip (protected)            |
/// +----------------------------------------+ <- start
/// | (4) Allocation region                  |
/// |     ...                                |
/// +----------------------------------------+ <- hi_lim
#[repr(C)]
pub(crate) struct SegmentContents {
    card_table: CardTable,
    mark_bits: MarkBitArray,
    guard: [u8; GUARD_SIZE],
}

/// Offset of the allocation region within a segment's storage.
pub const OFFSET_OF_ALLOC_REGION: usize = size_of::<SegmentContents>();

/// The unit of generation growth: one aligned storage region carrying its
/// own card table and mark bits, with a bump-pointer allocation region
/// filling the rest.
pub struct AlignedHeapSegment {
    storage: AlignedStorage,
    level: *mut u8,
    /// The upper limit of the space that we can currently allocate into;
    /// this may be decreased when externally allocated memory is credited
    /// to the generation owning this segment.
    effective_end: *mut u8,
    /// The end of the allocation region; grows and shrinks in page
    /// multiples, never past `hi_lim`.
    end: *mut u8,
}

impl AlignedHeapSegment {
    pub fn new(storage: AlignedStorage) -> Self {
        let start = (storage.low_lim() as usize + OFFSET_OF_ALLOC_REGION) as *mut u8;
        debug_assert!(is_aligned(OFFSET_OF_ALLOC_REGION, HEAP_ALIGN));
        debug_assert!(is_aligned(OFFSET_OF_ALLOC_REGION, PAGE_SIZE));

        let segment = Self {
            storage,
            level: start,
            effective_end: start,
            end: start,
        };
        // Storage may be recycled through a generation's segment cache;
        // start from a known-clean remembered set.
        segment.card_table().clear();
        let guard = (segment.low_lim() as usize + OFFSET_OF_ALLOC_REGION - GUARD_SIZE) as *mut u8;
        segment.storage.protect(guard, start);
        segment
    }

    pub fn create(
        provider: &mut dyn StorageProvider,
        name: &'static str,
    ) -> Result<Self, StorageError> {
        Ok(Self::new(provider.new_storage(name)?))
    }

    /// The largest the allocation region of any segment can be.
    #[inline(always)]
    pub const fn max_size() -> usize {
        SEGMENT_SIZE - OFFSET_OF_ALLOC_REGION
    }

    #[inline(always)]
    pub(crate) fn contents(low_lim: *mut u8) -> *mut SegmentContents {
        low_lim as *mut SegmentContents
    }

    /// The card table covering the segment that contains `ptr`.
    ///
    /// There must exist a currently alive segment containing `ptr`.
    #[inline(always)]
    pub fn card_table_covering(ptr: *const u8) -> &'static CardTable {
        unsafe { &(*Self::contents(AlignedStorage::start(ptr))).card_table }
    }

    /// The mark bit array covering the segment that contains `ptr`.
    #[inline(always)]
    pub fn mark_bit_array_covering(ptr: *const u8) -> &'static MarkBitArray {
        unsafe { &(*Self::contents(AlignedStorage::start(ptr))).mark_bits }
    }

    /// Mark the given cell. Assumes the address is a valid heap object.
    #[inline(always)]
    pub fn set_cell_mark_bit(cell: *const GCCell) {
        let bits = Self::mark_bit_array_covering(cell as *const u8);
        bits.mark(bits.address_to_index(cell as *const u8));
    }

    /// Whether the given cell is marked. Assumes the address is a valid
    /// heap object.
    #[inline(always)]
    pub fn get_cell_mark_bit(cell: *const GCCell) -> bool {
        let bits = Self::mark_bit_array_covering(cell as *const u8);
        bits.at(bits.address_to_index(cell as *const u8))
    }

    /// Whether `a` and `b` lie in the same segment.
    #[inline(always)]
    pub fn contained_in_same(a: *const u8, b: *const u8) -> bool {
        AlignedStorage::contained_in_same(a, b)
    }

    #[inline(always)]
    pub fn low_lim(&self) -> *mut u8 {
        self.storage.low_lim()
    }

    #[inline(always)]
    pub fn hi_lim(&self) -> *mut u8 {
        self.storage.hi_lim()
    }

    /// First address of the allocation region.
    #[inline(always)]
    pub fn start(&self) -> *mut u8 {
        (self.low_lim() as usize + OFFSET_OF_ALLOC_REGION) as *mut u8
    }

    #[inline(always)]
    pub fn end(&self) -> *mut u8 {
        self.end
    }

    #[inline(always)]
    pub fn effective_end(&self) -> *mut u8 {
        self.effective_end
    }

    #[inline(always)]
    pub fn level(&self) -> *mut u8 {
        self.level
    }

    /// Size of the allocation region as currently grown.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.end as usize - self.start() as usize
    }

    #[inline(always)]
    pub fn used(&self) -> usize {
        self.level as usize - self.start() as usize
    }

    #[inline(always)]
    pub fn available(&self) -> usize {
        self.effective_end as usize - self.level as usize
    }

    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.storage.contains(ptr)
    }

    pub fn card_table(&self) -> &CardTable {
        unsafe { &(*Self::contents(self.low_lim())).card_table }
    }

    pub fn mark_bit_array(&self) -> &MarkBitArray {
        unsafe { &(*Self::contents(self.low_lim())).mark_bits }
    }

    /// Attempt a bump allocation of `size` bytes (rounded up to heap
    /// alignment).
    #[inline]
    pub fn alloc(&mut self, size: usize) -> AllocResult {
        debug_assert!(size >= cell::CELL_HEADER_SIZE);
        let size = crate::sweep::heap_align_size(size);
        let new_level = self.level as usize + size;
        if new_level > self.effective_end as usize {
            return None;
        }
        let result = self.level;
        self.level = new_level as *mut u8;
        NonNull::new(result as *mut GCCell)
    }

    /// The external memory charge of the owning generation changed; move
    /// the effective end. `effective_end` must be a valid position between
    /// the level and the real end.
    pub fn set_effective_end(&mut self, effective_end: *mut u8) {
        debug_assert!(self.level as usize <= effective_end as usize);
        debug_assert!(effective_end as usize <= self.end as usize);
        self.effective_end = effective_end;
    }

    /// Equate the effective end to the real end, dropping any external
    /// memory charge against this segment.
    pub fn clear_external_memory_charge(&mut self) {
        self.effective_end = self.end;
    }

    /// Grow the allocation region by the minimum amount such that
    /// `size() >= desired`. `desired` must be page-aligned and within
    /// `max_size()`.
    pub fn grow_to(&mut self, desired: usize) {
        debug_assert!(is_aligned(desired, PAGE_SIZE));
        debug_assert!(desired <= Self::max_size());
        if self.size() >= desired {
            return;
        }

        // Preserve whatever external charge is currently applied.
        let charge = self.end as usize - self.effective_end as usize;
        let new_end = (self.start() as usize + desired) as *mut u8;
        self.storage.mark_used(self.end, new_end);
        self.end = new_end;
        self.effective_end = (new_end as usize - charge) as *mut u8;
    }

    /// Shrink the allocation region by the minimum amount such that
    /// `size() <= desired`. `desired` must be page-aligned, non-zero, and
    /// must not cut below the current level.
    pub fn shrink_to(&mut self, desired: usize) {
        debug_assert!(desired > 0 && is_aligned(desired, PAGE_SIZE));
        debug_assert!(desired <= Self::max_size());
        if self.size() <= desired {
            return;
        }
        let new_end = (self.start() as usize + desired) as *mut u8;
        assert!(new_end as usize >= self.level as usize);

        let charge = self.end as usize - self.effective_end as usize;
        self.storage.mark_unused(new_end, self.end);
        self.end = new_end;
        let effective = (new_end as usize).saturating_sub(charge).max(self.level as usize);
        self.effective_end = effective as *mut u8;
    }

    /// Grow the allocation region as big as possible.
    pub fn grow_to_limit(&mut self) {
        self.grow_to(Self::max_size());
        self.clear_external_memory_charge();
    }

    /// Try to make at least `amount` more bytes allocatable, growing if
    /// needed. Returns false, leaving the segment untouched, if the request
    /// cannot fit the storage.
    pub fn grow_to_fit(&mut self, amount: usize) -> bool {
        if self.available() >= amount {
            return true;
        }
        let charge = self.end as usize - self.effective_end as usize;
        let desired = align_up(self.used() + amount + charge, PAGE_SIZE);
        if desired > Self::max_size() {
            return false;
        }
        self.grow_to(desired);
        true
    }

    /// Roll the allocation frontier back to `level`, optionally advising
    /// the OS that the freed pages are reclaimable.
    pub fn set_level(&mut self, level: *mut u8, advise: AdviseUnused) {
        debug_assert!(self.dbg_contains_level(level));
        if (level as usize) < self.level as usize {
            if advise == AdviseUnused::Yes {
                let from = align_up(level as usize, PAGE_SIZE) as *mut u8;
                if (from as usize) < self.end as usize {
                    self.storage.mark_unused(from, self.end);
                }
            }
            #[cfg(debug_assertions)]
            unsafe {
                // Poison the rolled-back span so a stale read trips fast.
                core::ptr::write_bytes(level, 0xDE, self.level as usize - level as usize);
            }
        }
        self.level = level;
        if (self.effective_end as usize) < self.level as usize {
            self.effective_end = self.level;
        }
    }

    /// Empty the segment.
    pub fn reset_level(&mut self, advise: AdviseUnused) {
        self.set_level(self.start(), advise);
    }

    /// Rebuild the card boundary table from the actual cells, for use after
    /// a period when allocation did not maintain it (direct old-gen
    /// allocation before the TTI switch).
    pub fn recreate_card_table_boundaries(&mut self) {
        let table = self.card_table();
        let mut cursor = table.next_boundary(self.start());
        let mut ptr = self.start();
        while (ptr as usize) < self.level as usize {
            let cell = ptr as *mut GCCell;
            let size = unsafe { (*cell).size() };
            let next = (ptr as usize + size) as *mut u8;
            if cursor.address() < next as usize {
                table.update_boundaries(&mut cursor, ptr, next);
            }
            ptr = next;
        }
    }

    /// Call `callback` on each live cell with its start in `[low, high)`.
    /// Dead-region placeholders are stepped over.
    pub fn for_objs_in_range(
        &self,
        mut callback: impl FnMut(*mut GCCell),
        low: *mut u8,
        high: *mut u8,
    ) {
        debug_assert!(self.dbg_contains_level(low) && self.dbg_contains_level(high));
        let mut ptr = low;
        while (ptr as usize) < high as usize {
            let cell = ptr as *mut GCCell;
            unsafe {
                let size = (*cell).size();
                if !(*cell).is_dead_region() {
                    callback(cell);
                }
                ptr = (ptr as usize + size) as *mut u8;
            }
        }
    }

    /// Call `callback` on every live cell in this segment.
    pub fn for_all_objs(&self, callback: impl FnMut(*mut GCCell)) {
        self.for_objs_in_range(callback, self.start(), self.level);
    }

    /// Assumes marking is complete. Walks the allocation region, assigning
    /// every marked cell its post-compaction address (bump-allocated from
    /// `sweep_result.compaction_result`), displacing its header word into
    /// the side array and installing a forwarding pointer in its place.
    /// Runs of dead cells are stamped with a single dead-region placeholder
    /// so later traversals skip them in one step.
    ///
    /// Finalizers for dead cells have already run by this point; see the
    /// collection pipeline in `GenGC::collect`.
    pub fn sweep_and_install_forwarding_pointers(&mut self, sweep_result: &mut SweepResult) {
        let bits = self.mark_bit_array();
        let mut ptr = self.start();
        let level = self.level;

        while (ptr as usize) < level as usize {
            let cell = ptr as *mut GCCell;
            unsafe {
                if bits.at(bits.address_to_index(ptr)) {
                    let size = (*cell).size();
                    let target = sweep_result.compaction_result.alloc(size);
                    sweep_result.displaced_headers.push((*cell).header_word());
                    (*cell).set_forwarding_pointer(target as *mut GCCell);
                    ptr = (ptr as usize + size) as *mut u8;
                } else {
                    let dead_start = ptr;
                    ptr = (ptr as usize + (*cell).size()) as *mut u8;
                    while (ptr as usize) < level as usize {
                        if bits.at(bits.address_to_index(ptr)) {
                            break;
                        }
                        ptr = (ptr as usize + (*(ptr as *mut GCCell)).size()) as *mut u8;
                    }
                    cell::write_dead_region(dead_start, ptr as usize - dead_start as usize);
                }
            }
        }
    }

    /// Assumes sweeping is complete. Visits every live cell's pointer
    /// fields with `acceptor` (which rewrites them through the referents'
    /// forwarding pointers), taking each cell's kind and size from the
    /// displaced header words, in the order sweep produced them.
    pub fn update_references(&self, acceptor: &mut dyn Visitor, headers: &mut HeadersRemaining<'_>) {
        self.walk_marked(headers, |cell, word| {
            let kind = displaced::kind(word);
            kind_table::trace_cell_with_kind(cell, kind, acceptor);
            // Weak-map entry values are not covered by the trace
            // procedure; rewrite (or clear) them here.
            if kind_table::is_weak_map_kind(kind) {
                kind_table::update_weak_map_entries_after_sweep(cell, kind);
            }
        });
    }

    /// Assumes reference updating is complete. Moves every live cell to its
    /// forwarding address and restores its displaced header word, consuming
    /// the side array in the same order.
    pub fn compact(&mut self, headers: &mut HeadersRemaining<'_>) {
        self.walk_marked(headers, |cell, word| unsafe {
            let size = displaced::size(word);
            let target = (*cell).forwarding_pointer();
            // Same-segment moves always move downwards; the ranges may
            // still overlap.
            core::ptr::copy(cell as *const u8, target as *mut u8, size);
            (*target).set_header_word(word);
        });
    }

    /// Shared walk for the two post-sweep phases: find each marked cell via
    /// the mark bits and pair it with its displaced header word.
    fn walk_marked(&self, headers: &mut HeadersRemaining<'_>, mut f: impl FnMut(*mut GCCell, u64)) {
        let bits = self.mark_bit_array();
        let base = self.low_lim() as usize;
        let mut from = (self.start() as usize - base) >> LOG_HEAP_ALIGN;
        let to = (self.level as usize - base) >> LOG_HEAP_ALIGN;

        while let Some(index) = bits.find_next_marked_bit(from, to) {
            let cell = bits.index_to_address(index) as *mut GCCell;
            let word = headers.next();
            f(cell, word);
            from = index + (displaced::size(word) >> LOG_HEAP_ALIGN);
        }
    }

    /// Returns true iff `lvl` could refer to a level within this segment.
    pub fn dbg_contains_level(&self, lvl: *const u8) -> bool {
        self.start() as usize <= lvl as usize && lvl as usize <= self.end as usize
    }

    /// Returns true iff `p` is located within the allocated section of the
    /// segment and plausibly points at a cell.
    pub fn valid_pointer(&self, p: *const u8) -> bool {
        self.start() as usize <= p as usize
            && (p as usize) < self.level as usize
            && is_aligned(p as usize, HEAP_ALIGN)
    }

    pub(crate) fn storage(&self) -> &AlignedStorage {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VMStorageProvider;

    fn fresh_segment() -> AlignedHeapSegment {
        let mut provider = VMStorageProvider::new();
        let mut segment = AlignedHeapSegment::create(&mut provider, "segment-test").unwrap();
        segment.grow_to_limit();
        segment
    }

    #[test]
    fn alloc_is_monotonic_until_exhaustion() {
        let mut segment = fresh_segment();
        let mut last = 0usize;
        let mut allocated = 0usize;
        while let Some(cell) = segment.alloc(64) {
            let addr = cell.as_ptr() as usize;
            assert!(addr >= last + 64 || last == 0);
            assert!(addr >= segment.start() as usize);
            last = addr;
            allocated += 64;
        }
        assert!(segment.available() < 64);
        assert_eq!(segment.used(), allocated);
    }

    #[test]
    fn metadata_found_by_masking_interior_pointers() {
        let mut segment = fresh_segment();
        let cell = segment.alloc(128).unwrap().as_ptr();
        let table = AlignedHeapSegment::card_table_covering(cell as *const u8);
        assert_eq!(
            table as *const _ as usize,
            segment.low_lim() as usize,
            "card table must sit at the segment base"
        );

        assert!(!AlignedHeapSegment::get_cell_mark_bit(cell));
        AlignedHeapSegment::set_cell_mark_bit(cell);
        assert!(AlignedHeapSegment::get_cell_mark_bit(cell));
    }

    #[test]
    fn effective_end_caps_allocation() {
        let mut segment = fresh_segment();
        let charge = PAGE_SIZE;
        let effective = (segment.end() as usize - charge) as *mut u8;
        segment.set_effective_end(effective);
        assert_eq!(segment.available(), AlignedHeapSegment::max_size() - charge);

        while segment.alloc(1024).is_some() {}
        assert!(segment.level() as usize <= effective as usize);

        segment.clear_external_memory_charge();
        assert!(segment.alloc(1024).is_some());
    }

    #[test]
    fn level_rollback_resets_used() {
        let mut segment = fresh_segment();
        let first = segment.alloc(256).unwrap().as_ptr() as *mut u8;
        segment.alloc(256).unwrap();
        assert_eq!(segment.used(), 512);

        segment.set_level(first, AdviseUnused::No);
        assert_eq!(segment.used(), 0);
        segment.reset_level(AdviseUnused::Yes);
        assert_eq!(segment.used(), 0);
    }

    #[test]
    fn grow_to_fit_refuses_oversize() {
        let mut provider = VMStorageProvider::new();
        let mut segment = AlignedHeapSegment::create(&mut provider, "segment-test").unwrap();
        segment.grow_to(PAGE_SIZE * 4);
        assert_eq!(segment.size(), PAGE_SIZE * 4);

        assert!(segment.grow_to_fit(PAGE_SIZE * 8));
        assert!(segment.size() >= PAGE_SIZE * 8);
        assert!(!segment.grow_to_fit(AlignedHeapSegment::max_size() + PAGE_SIZE));
    }
}
