use crate::card_table::Boundary;
use crate::cell::{CellKind, GCCell};
use crate::gen_gc::GenGC;
use crate::generation::{
    update_finalizer_list_references, AllocContext, ContextHolder, Generation, HasFinalizer,
};
use crate::globals::*;
use crate::kind_table;
use crate::segment::{AdviseUnused, AlignedHeapSegment, AllocResult};
use crate::segment_index::GCSegmentAddressIndex;
use crate::storage::{StorageError, StorageProvider};
use crate::sweep::{ChunksRemaining, CompactionResult, GenId, HeadersRemaining, SweepResult};
use crate::util::align_up;
use crate::young_gen::EvacAcceptor;

use std::ptr::NonNull;

const SEGMENT_NAME: &str = "pulsar-oldgen-segment";

/// Size bounds for the old generation, which spans a variable number of
/// segments.
#[derive(Clone, Copy, Debug)]
pub struct OldGenSize {
    min: usize,
    max: usize,
}

impl OldGenSize {
    pub fn new(min: usize, max: usize) -> Self {
        let min = align_up(min.max(PAGE_SIZE), PAGE_SIZE);
        let max = align_up(max.max(min), PAGE_SIZE);
        Self { min, max }
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn adjust_size(&self, desired: usize) -> usize {
        align_up(desired.max(self.min).min(self.max), PAGE_SIZE)
    }

    /// Number of segments needed to back `size` bytes of allocation region.
    pub fn segments_for_size(size: usize) -> usize {
        (size + AlignedHeapSegment::max_size() - 1) / AlignedHeapSegment::max_size()
    }
}

/// A position in the old generation's (logically contiguous) allocation
/// region: a segment ordinal plus an address within that segment. The
/// ordinal of the active segment equals the number of filled segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Location {
    pub segment_num: usize,
    pub ptr: *mut u8,
}

impl Location {
    fn at_or_after(&self, other: &Location) -> bool {
        self.segment_num > other.segment_num
            || (self.segment_num == other.segment_num && self.ptr >= other.ptr)
    }
}

/// The old generation: an ordered sequence of filled segments plus one
/// active segment, collected via mark-sweep-compact as part of a full
/// collection, and scanned through its dirty cards during young
/// collections.
pub struct OldGen {
    limits: OldGenSize,
    /// Logical size of the generation; may span several segments and may
    /// exceed the bytes currently backed by storage (segments materialize
    /// on demand).
    size: usize,
    filled_segments: Vec<Box<AlignedHeapSegment>>,
    /// Segments reserved ahead of need (by `ensure_fits`), so a young
    /// collection's worst case cannot fail halfway through evacuation.
    segment_cache: Vec<Box<AlignedHeapSegment>>,
    context: ContextHolder,
    /// Bytes actually allocated in filled segments (a filled segment may
    /// have tail waste; see `fragmentation_loss`).
    used_in_filled_segments: usize,
    external_memory: usize,
    /// Cursor for maintaining the active segment's crossing-object table as
    /// allocation proceeds.
    card_boundary: Boundary,
    release_unused: bool,
}

impl OldGen {
    pub fn new(
        provider: &mut dyn StorageProvider,
        limits: OldGenSize,
        release_unused: bool,
    ) -> Result<Self, StorageError> {
        let segment = Box::new(AlignedHeapSegment::create(provider, SEGMENT_NAME)?);
        let card_boundary = segment.card_table().next_boundary(segment.start());
        Ok(Self {
            limits,
            size: 0,
            filled_segments: Vec::new(),
            segment_cache: Vec::new(),
            context: ContextHolder::new(AllocContext::new(segment)),
            used_in_filled_segments: 0,
            external_memory: 0,
            card_boundary,
            release_unused,
        })
    }

    pub fn limits(&self) -> &OldGenSize {
        &self.limits
    }

    pub fn adjust_size(&self, desired: usize) -> usize {
        self.limits.adjust_size(desired)
    }

    pub(crate) fn context_mut(&mut self) -> &mut ContextHolder {
        &mut self.context
    }

    pub fn owns_alloc_context(&self) -> bool {
        self.context.owned()
    }

    pub fn active_segment(&self) -> &AlignedHeapSegment {
        &self.context.get().segment
    }

    pub fn active_segment_mut(&mut self) -> &mut AlignedHeapSegment {
        &mut self.context.get_mut().segment
    }

    pub fn filled_count(&self) -> usize {
        self.filled_segments.len()
    }

    pub(crate) fn filled_segment_start(&self, i: usize) -> *mut u8 {
        self.filled_segments[i].start()
    }

    pub(crate) fn filled_segment_level(&self, i: usize) -> *mut u8 {
        self.filled_segments[i].level()
    }

    /// The segment holding ordinal `i` of the used sequence.
    pub(crate) fn segment_at(&self, i: usize) -> &AlignedHeapSegment {
        if i < self.filled_segments.len() {
            &self.filled_segments[i]
        } else {
            debug_assert_eq!(i, self.filled_segments.len());
            self.active_segment()
        }
    }

    /// The current allocation frontier.
    pub fn level_location(&self) -> Location {
        Location {
            segment_num: self.filled_segments.len(),
            ptr: self.active_segment().level(),
        }
    }

    /// Offset of the allocation frontier in the generation's logical
    /// address space, where every filled segment contributes its full
    /// capacity.
    pub fn level_offset(&self) -> usize {
        self.filled_segments.len() * AlignedHeapSegment::max_size() + self.active_segment().used()
    }

    /// Capacity lost to the unusable tails of filled segments.
    pub fn fragmentation_loss(&self) -> usize {
        self.filled_segments.len() * AlignedHeapSegment::max_size() - self.used_in_filled_segments
    }

    /// External memory considered to be "allocated at the end" of the
    /// generation: the charge net of fragmentation losses it is deemed to
    /// fill first.
    pub fn trailing_external_memory(&self) -> usize {
        self.external_memory.saturating_sub(self.fragmentation_loss())
    }

    /// Where the effective end of the generation falls, or `None` when it
    /// lies beyond every used segment (the common case).
    fn effective_end_location(&self) -> Option<Location> {
        let offset = self.effective_size();
        let seg_num = offset / AlignedHeapSegment::max_size();
        let seg_off = offset % AlignedHeapSegment::max_size();

        if seg_num > self.filled_segments.len() {
            return None;
        }
        let segment = self.segment_at(seg_num);
        let ptr = (segment.start() as usize + seg_off).min(segment.end() as usize) as *mut u8;
        Some(Location {
            segment_num: seg_num,
            ptr,
        })
    }

    /// Push the external charge into the active segment's effective end (or
    /// clear it when the charge is consumed by fragmentation or falls past
    /// the used region).
    pub fn update_effective_end_for_external_memory(&mut self) {
        let desired = self.effective_end_location();
        let level = self.level_location();
        let filled = self.filled_segments.len();
        let segment = self.active_segment_mut();
        match desired {
            None => segment.clear_external_memory_charge(),
            Some(desired) => {
                let clamped = if level.at_or_after(&desired) { level } else { desired };
                // The clamped end is at or above the level, hence in the
                // active segment.
                debug_assert_eq!(clamped.segment_num, filled);
                segment.set_effective_end(clamped.ptr);
            }
        }
    }

    pub fn credit_external_memory(&mut self, size: usize) {
        self.external_memory += size;
        self.update_effective_end_for_external_memory();
    }

    pub fn debit_external_memory(&mut self, size: usize) {
        debug_assert!(self.external_memory >= size);
        self.external_memory -= size;
        self.update_effective_end_for_external_memory();
    }

    pub fn grow_to(&mut self, desired: usize) {
        debug_assert_eq!(desired, self.adjust_size(desired));
        if self.size >= desired {
            return;
        }
        // Only a generation still within its first segment grows storage
        // here; later segments materialize at their full size on demand.
        if self.size < AlignedHeapSegment::max_size() {
            debug_assert!(self.filled_segments.is_empty());
            self.active_segment_mut()
                .grow_to(desired.min(AlignedHeapSegment::max_size()));
        }
        self.size = desired;
        self.update_effective_end_for_external_memory();
    }

    pub fn shrink_to(&mut self, desired: usize) {
        debug_assert!(desired >= self.used());
        debug_assert_eq!(desired, self.adjust_size(desired));
        if self.size <= desired {
            return;
        }
        if desired < AlignedHeapSegment::max_size() {
            debug_assert!(self.filled_segments.is_empty());
            self.active_segment_mut().shrink_to(desired);
        }
        self.size = desired;
        self.update_effective_end_for_external_memory();
    }

    pub fn grow_to_fit(&mut self, amount: usize, provider: &mut dyn StorageProvider) -> bool {
        let unavailable = self.level_offset() + self.trailing_external_memory();
        let adjusted = self.adjust_size(unavailable + amount);

        // Insufficient headroom under the max?
        if adjusted < unavailable + amount {
            return false;
        }
        // Could not allocate segments to back the growth?
        if !self.seed_segment_cache_for_size(self.level_offset() + amount, provider) {
            return false;
        }
        self.grow_to(adjusted);
        true
    }

    /// Hard precondition check for young collections: can this generation
    /// absorb `amount` more bytes, with the storage to back it already
    /// reserved?
    pub fn ensure_fits(&mut self, amount: usize, provider: &mut dyn StorageProvider) -> bool {
        if amount > self.available() {
            return false;
        }
        self.seed_segment_cache_for_size(self.level_offset() + amount, provider)
    }

    /// Reserve enough cached segments that the generation can reach
    /// `size` bytes of allocation without asking the provider again.
    /// All-or-nothing: on failure the cache is rolled back and false
    /// returned.
    fn seed_segment_cache_for_size(
        &mut self,
        size: usize,
        provider: &mut dyn StorageProvider,
    ) -> bool {
        let committed =
            |this: &Self| this.filled_segments.len() + this.segment_cache.len() + 1;
        let required = OldGenSize::segments_for_size(size);
        let cache_before = self.segment_cache.len();

        while committed(self) < required {
            match AlignedHeapSegment::create(provider, SEGMENT_NAME) {
                Ok(mut segment) => {
                    segment.grow_to_limit();
                    self.segment_cache.push(Box::new(segment));
                }
                Err(_) => {
                    for segment in self.segment_cache.drain(cache_before..) {
                        provider.storage_released(segment.storage());
                    }
                    return false;
                }
            }
        }
        true
    }

    /// The active segment is full; move it to the filled list and install a
    /// fresh one (cached if possible). Fails, leaving the generation
    /// unchanged, when the size limit or the provider is exhausted.
    pub(crate) fn materialize_next_segment(
        &mut self,
        provider: &mut dyn StorageProvider,
        index: &mut GCSegmentAddressIndex,
    ) -> bool {
        let used_segs = self.filled_segments.len() + 1;
        if used_segs >= OldGenSize::segments_for_size(self.effective_size()) {
            return false;
        }

        let fresh = if let Some(segment) = self.segment_cache.pop() {
            segment
        } else {
            match AlignedHeapSegment::create(provider, SEGMENT_NAME) {
                Ok(mut segment) => {
                    segment.grow_to_limit();
                    Box::new(segment)
                }
                Err(_) => return false,
            }
        };

        let used_in_filled = self.active_segment().used();
        let previous = std::mem::replace(&mut self.context.get_mut().segment, fresh);
        self.filled_segments.push(previous);
        self.used_in_filled_segments += used_in_filled;

        // The segment just declared full carries no external charge; the
        // charge concept rides the active segment's effective end.
        self.filled_segments
            .last_mut()
            .unwrap()
            .clear_external_memory_charge();

        index.update(NonNull::from(&mut *self.context.get_mut().segment));

        // The active segment changed; the boundary cursor must realign
        // with its allocation region.
        self.update_card_table_boundary();
        self.update_effective_end_for_external_memory();
        true
    }

    /// Drop (or cache) every used segment past the first `keep`, after a
    /// compaction emptied them.
    pub(crate) fn release_segments(
        &mut self,
        keep: usize,
        provider: &mut dyn StorageProvider,
        index: &mut GCSegmentAddressIndex,
    ) {
        assert!(keep > 0, "cannot release every segment");

        if self.release_unused {
            for segment in self.segment_cache.drain(..) {
                provider.storage_released(segment.storage());
            }
        }

        let n_segs = self.filled_segments.len() + 1;
        if keep >= n_segs {
            return;
        }

        let mut released_low_lims = Vec::new();

        // The tail of the filled list and the current active segment are
        // all empty (compaction placed every survivor below them); the last
        // kept filled segment becomes the new active segment.
        let mut tail = self.filled_segments.split_off(keep - 1);
        let new_active = tail.remove(0);
        let old_active = std::mem::replace(&mut self.context.get_mut().segment, new_active);
        tail.push(old_active);

        for mut segment in tail {
            released_low_lims.push(segment.low_lim() as usize);
            if self.release_unused {
                provider.storage_released(segment.storage());
            } else {
                segment.reset_level(AdviseUnused::No);
                self.segment_cache.push(segment);
            }
        }

        released_low_lims.sort_unstable();
        index.remove(&released_low_lims);
    }

    /// Bump-allocate in the active segment, maintaining the card boundary
    /// table when requested, and falling back to materializing the next
    /// segment.
    pub(crate) fn alloc_raw(
        &mut self,
        size: usize,
        kind: CellKind,
        has_finalizer: HasFinalizer,
        provider: &mut dyn StorageProvider,
        index: &mut GCSegmentAddressIndex,
        maintain_boundaries: bool,
    ) -> AllocResult {
        let aligned = crate::sweep::heap_align_size(size);
        if let Some(cell) = self.context.get_mut().alloc(size, kind, has_finalizer) {
            if maintain_boundaries {
                self.update_boundaries_after_alloc(cell.as_ptr() as *mut u8, aligned);
            }
            return Some(cell);
        }
        self.alloc_raw_slow(size, kind, has_finalizer, provider, index, maintain_boundaries)
    }

    fn alloc_raw_slow(
        &mut self,
        size: usize,
        kind: CellKind,
        has_finalizer: HasFinalizer,
        provider: &mut dyn StorageProvider,
        index: &mut GCSegmentAddressIndex,
        maintain_boundaries: bool,
    ) -> AllocResult {
        // The size must fit a segment at all; GenGC rejects super-segment
        // requests before they get here.
        if crate::sweep::heap_align_size(size) > AlignedHeapSegment::max_size() {
            return None;
        }
        if !self.materialize_next_segment(provider, index) {
            return None;
        }
        // Not unbounded recursion: the new active segment is empty and
        // max-sized, so this attempt succeeds.
        self.alloc_raw(size, kind, has_finalizer, provider, index, maintain_boundaries)
    }

    fn update_boundaries_after_alloc(&mut self, start: *mut u8, size: usize) {
        let end = (start as usize + size) as *mut u8;
        if self.card_boundary.address() < end as usize {
            let table = self.context.get().segment.card_table();
            table.update_boundaries(&mut self.card_boundary, start, end);
        }
    }

    /// Realign the boundary cursor with the active segment's level.
    pub(crate) fn update_card_table_boundary(&mut self) {
        let segment = &self.context.get().segment;
        self.card_boundary = segment.card_table().next_boundary(segment.level());
    }

    /// Rebuild every used segment's crossing-object table from the cells
    /// themselves; required after a period of allocation that did not
    /// maintain the tables.
    pub fn recreate_card_table_boundaries(&mut self) {
        for segment in self.filled_segments.iter_mut() {
            segment.recreate_card_table_boundaries();
        }
        self.context.get_mut().segment.recreate_card_table_boundaries();
        self.update_card_table_boundary();
    }

    pub(crate) fn for_used_segments(&self, mut callback: impl FnMut(&AlignedHeapSegment)) {
        for segment in self.filled_segments.iter() {
            callback(segment);
        }
        callback(self.active_segment());
    }

    pub(crate) fn for_used_segments_mut(&mut self, mut callback: impl FnMut(&mut AlignedHeapSegment)) {
        for segment in self.filled_segments.iter_mut() {
            callback(segment);
        }
        callback(&mut self.context.get_mut().segment);
    }

    pub fn for_all_objs(&self, mut callback: impl FnMut(*mut GCCell)) {
        self.for_used_segments(|segment| segment.for_all_objs(&mut callback));
    }

    /// Contribute this generation's used segments as compaction targets,
    /// in allocation order.
    pub(crate) fn push_chunks(&self, result: &mut CompactionResult) {
        self.for_used_segments(|segment| result.push_segment(segment, GenId::Old));
    }

    pub(crate) fn sweep_and_install_forwarding_pointers(&mut self, sweep_result: &mut SweepResult) {
        self.for_used_segments_mut(|segment| {
            segment.sweep_and_install_forwarding_pointers(sweep_result)
        });
    }

    pub(crate) fn update_references(
        &mut self,
        acceptor: &mut dyn crate::api::Visitor,
        headers: &mut HeadersRemaining<'_>,
    ) {
        self.for_used_segments_mut(|segment| segment.update_references(acceptor, headers));
        update_finalizer_list_references(&mut self.context.get_mut().cells_with_finalizers);
    }

    pub(crate) fn compact(&mut self, headers: &mut HeadersRemaining<'_>) {
        self.for_used_segments_mut(|segment| segment.compact(headers));
    }

    /// Consume this generation's prefix of the used chunks, writing each
    /// chunk's fill level back into its segment, then release the segments
    /// compaction emptied.
    pub(crate) fn record_level_after_compaction(
        &mut self,
        chunks: &mut ChunksRemaining<'_>,
        provider: &mut dyn StorageProvider,
        index: &mut GCSegmentAddressIndex,
    ) {
        let advise = if self.release_unused {
            AdviseUnused::Yes
        } else {
            AdviseUnused::No
        };
        let filled_len = self.filled_segments.len();
        let mut used_segs = 0;

        for i in 0..=filled_len {
            if !chunks.has_next() || chunks.peek().generation() != GenId::Old {
                break;
            }
            let segment: &mut AlignedHeapSegment = if i < filled_len {
                &mut self.filled_segments[i]
            } else {
                &mut self.context.get_mut().segment
            };
            chunks.next().record_level(segment, advise);
            used_segs += 1;
        }

        self.release_segments(used_segs.max(1), provider, index);

        // Everything below the last used segment is exactly full of
        // survivors; recompute the filled-segment accounting from scratch.
        self.used_in_filled_segments = self.filled_segments.iter().map(|s| s.used()).sum();

        self.update_card_table_boundary();
    }

    /// Post-compaction remembered-set repair: survivors moved, so dirty
    /// bits are recomputed conservatively and the crossing-object tables
    /// rebuilt from the compacted cells.
    pub(crate) fn update_card_tables_after_compaction(&mut self, young_is_empty: bool) {
        self.for_used_segments_mut(|segment| {
            if young_is_empty {
                segment.card_table().clear();
            } else {
                segment
                    .card_table()
                    .update_after_compaction(segment.start(), segment.level());
            }
            segment.recreate_card_table_boundaries();
        });
        self.update_card_table_boundary();
    }

    pub fn dbg_contains(&self, ptr: *const u8) -> bool {
        self.filled_segments.iter().any(|s| s.contains(ptr))
            || (self.context.owned() && self.active_segment().contains(ptr))
    }

    /// Debug validation of the crossing-object tables: every card covered
    /// by a cell's extent must resolve back to a cell that contains the
    /// card's start.
    #[cfg(debug_assertions)]
    pub(crate) fn verify_card_table_boundaries(&self) {
        self.for_used_segments(|segment| {
            let table = segment.card_table();
            let start = segment.start() as usize;
            let level = segment.level() as usize;
            if start == level {
                return;
            }
            let first = table.address_to_index(segment.start());
            let last = table.address_to_index((level - 1) as *const u8);
            for index in first..=last {
                let card_start = table.index_to_address(index) as usize;
                if card_start < start {
                    continue;
                }
                let obj = table.first_obj_for_card(index) as usize;
                assert!(
                    obj >= start && obj <= card_start,
                    "crossing object must start at or before its card"
                );
                let size = unsafe { (*(obj as *mut GCCell)).size() };
                assert!(
                    obj + size > card_start,
                    "crossing object must extend past its card's start"
                );
            }
        });
    }
}

impl Generation for OldGen {
    fn size(&self) -> usize {
        self.size
    }

    fn used(&self) -> usize {
        self.used_in_filled_segments + self.active_segment().used()
    }

    fn available(&self) -> usize {
        debug_assert!(self.size >= self.level_offset());
        let avail = self.size - self.level_offset();
        avail.saturating_sub(self.trailing_external_memory())
    }

    fn external_memory(&self) -> usize {
        self.external_memory
    }

    fn effective_size(&self) -> usize {
        self.size.saturating_sub(self.trailing_external_memory())
    }
}

impl GenGC {
    pub(crate) fn old_gen_ensure_fits(&mut self, amount: usize) -> bool {
        self.old_gen.ensure_fits(amount, &mut *self.provider)
    }

    pub(crate) fn old_gen_grow_to_fit(&mut self, amount: usize) -> bool {
        self.old_gen.grow_to_fit(amount, &mut *self.provider)
    }

    pub(crate) fn old_gen_alloc_raw(
        &mut self,
        size: usize,
        kind: CellKind,
        has_finalizer: HasFinalizer,
    ) -> AllocResult {
        let maintain = self.alloc_context_from_young;
        self.old_gen.alloc_raw(
            size,
            kind,
            has_finalizer,
            &mut *self.provider,
            &mut self.segment_index,
            maintain,
        )
    }

    /// Allocation target for one evacuated young cell. The header is
    /// overwritten by the evacuation copy, so the kind passed here only
    /// pre-stamps an identical header.
    pub(crate) fn old_gen_alloc_for_promotion(&mut self, size: usize) -> AllocResult {
        self.old_gen.alloc_raw(
            size,
            crate::cell::KIND_DEAD_REGION,
            HasFinalizer::No,
            &mut *self.provider,
            &mut self.segment_index,
            true,
        )
    }

    pub(crate) fn old_gen_recreate_card_table_boundaries(&mut self) {
        self.old_gen.recreate_card_table_boundaries();
    }

    /// Find old-to-young pointers via dirty cards and evacuate their
    /// referents. Only the region that existed when the collection started
    /// (`to_scan` and below) is scanned; everything above it is promotion
    /// output, covered by the transitive closure.
    pub(crate) fn mark_young_gen_pointers(&mut self, to_scan: Location) {
        if self.old_gen.used() == 0 {
            return;
        }

        let n_segs = self.old_gen.filled_count() + 1;
        for i in 0..n_segs {
            if i > to_scan.segment_num {
                break;
            }
            let (start, orig_level) = {
                let segment = self.old_gen.segment_at(i);
                let level = if i == to_scan.segment_num {
                    to_scan.ptr
                } else {
                    segment.level()
                };
                (segment.start(), level)
            };
            let table = AlignedHeapSegment::card_table_covering(start);

            if (start as usize) < orig_level as usize {
                let mut from = table.address_to_index(start);
                let to = table.address_to_index((orig_level as usize - 1) as *const u8) + 1;

                while let Some(i_begin) = table.find_next_dirty_card(from, to) {
                    let i_end = table.find_next_clean_card(i_begin, to).unwrap_or(to);
                    debug_assert!(i_begin < i_end);

                    let end = table.index_to_address(i_end) as usize;
                    let boundary = end.min(orig_level as usize);

                    // Walk from the object crossing into the first dirty
                    // card through the last object starting before the run
                    // ends.
                    let mut obj = table.first_obj_for_card(i_begin) as usize;
                    debug_assert!(obj >= start as usize);
                    while obj < boundary {
                        let cell = obj as *mut GCCell;
                        obj += unsafe { (*cell).size() };
                        self.evac_trace_cell(cell);
                    }

                    from = i_end;
                }
            }

            // The young gen empties by the end of this collection, so no
            // old-to-young pointers survive it.
            table.clear();
        }
    }

    /// Scan every cell promoted since `to_scan`, evacuating whatever young
    /// cells they reference, until the frontier stops moving. This is the
    /// young collection's transitive closure: the promoted region is the
    /// worklist.
    pub(crate) fn young_gen_transitive_closure(&mut self, to_scan: Location) {
        let mut seg_num = to_scan.segment_num;
        let mut ptr = to_scan.ptr as usize;

        loop {
            // Filled segments have fixed levels; scan them flat out.
            while seg_num < self.old_gen.filled_count() {
                let level = self.old_gen.filled_segment_level(seg_num) as usize;
                while ptr < level {
                    let cell = ptr as *mut GCCell;
                    ptr += unsafe { (*cell).size() };
                    self.evac_trace_cell(cell);
                }
                seg_num += 1;
                ptr = if seg_num < self.old_gen.filled_count() {
                    self.old_gen.filled_segment_start(seg_num) as usize
                } else {
                    self.old_gen.active_segment().start() as usize
                };
            }

            // The active segment's level moves underneath us as evacuation
            // allocates; re-read it until it holds still. If allocation
            // rolls over into a fresh segment, the one being scanned turns
            // into a filled segment and the outer loop finishes it there;
            // the level snapshot below is only comparable while the
            // ordinal still names the segment `ptr` walks.
            loop {
                if seg_num != self.old_gen.filled_count() {
                    break;
                }
                let level = self.old_gen.active_segment().level() as usize;
                if ptr >= level {
                    break;
                }
                while ptr < level {
                    let cell = ptr as *mut GCCell;
                    ptr += unsafe { (*cell).size() };
                    self.evac_trace_cell(cell);
                }
            }

            // Allocation may have rolled over into a fresh segment, turning
            // the one we were scanning into a filled segment; go around
            // again until the frontier truly stands still.
            if seg_num == self.old_gen.filled_count()
                && ptr >= self.old_gen.active_segment().level() as usize
            {
                break;
            }
        }
    }

    /// Trace one old-gen cell for evacuation. Weak-map kinds additionally
    /// have their entry values evacuated strongly; values are only
    /// conditionally retained at full collections.
    pub(crate) fn evac_trace_cell(&mut self, cell: *mut GCCell) {
        let kind = unsafe { (*cell).kind() };
        {
            let mut acceptor = EvacAcceptor { gc: self };
            kind_table::trace_cell_with_kind(cell, kind, &mut acceptor);
        }
        if kind_table::is_weak_map_kind(kind) {
            let entries = unsafe { kind_table::KIND_TABLE.get(kind).weak_entries.unwrap() };
            let mut value_slots: Vec<*mut *mut GCCell> = Vec::new();
            entries(cell, &mut |_key, value_slot| value_slots.push(value_slot));
            for slot in value_slots {
                unsafe {
                    self.ensure_referent_copied(slot);
                }
            }
        }
    }
}
