use crate::cell::GCCell;
use crate::gen_gc::{GcPhase, GenGC};
use crate::generation::{AllocContext, ContextHolder, Generation, HasFinalizer};
use crate::api::Visitor;
use crate::globals::*;
use crate::kind_table;
use crate::segment::{AdviseUnused, AlignedHeapSegment, AllocResult};
use crate::storage::{AlignedStorage, StorageError, StorageProvider};
use crate::util::{align_up, formatted_size};
use crate::weak_ref::WeakRefSlot;

use std::ptr::NonNull;

/// Size bounds for the nursery. The nursery is a single segment, so the
/// maximum is one segment's allocation region.
#[derive(Clone, Copy, Debug)]
pub struct YoungGenSize {
    min: usize,
    max: usize,
}

impl YoungGenSize {
    pub fn new(min: usize, max: usize) -> Self {
        let max = max.min(AlignedHeapSegment::max_size());
        let min = min.max(PAGE_SIZE).min(max);
        Self {
            min: align_up(min, PAGE_SIZE),
            max: align_up(max, PAGE_SIZE),
        }
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Clamp and page-align a desired size. Idempotent, and within an
    /// additive constant of the request.
    pub fn adjust_size(&self, desired: usize) -> usize {
        align_up(desired.max(self.min).min(self.max), PAGE_SIZE)
    }
}

/// The young generation: a single-segment nursery collected by evacuation.
/// Every live young cell is copied into the old generation, so a young
/// collection's cost tracks the survivors, not the garbage.
pub struct YoungGen {
    limits: YoungGenSize,
    context: ContextHolder,
    /// The nursery segment's base, cached so `contains` works (for write
    /// barriers) even while the collector has claimed the context.
    low_lim: *mut u8,
    external_memory: usize,
    /// Cumulative bytes in the nursery at collection starts, and bytes
    /// promoted out; their ratio is the survival rate.
    pub(crate) cum_pre_bytes: u64,
    pub(crate) cum_promoted_bytes: u64,
}

impl YoungGen {
    pub fn new(
        provider: &mut dyn StorageProvider,
        limits: YoungGenSize,
        initial_size: usize,
    ) -> Result<Self, StorageError> {
        let mut segment = Box::new(AlignedHeapSegment::create(provider, "pulsar-younggen")?);
        segment.grow_to(limits.adjust_size(initial_size));
        let low_lim = segment.low_lim();
        Ok(Self {
            limits,
            context: ContextHolder::new(AllocContext::new(segment)),
            low_lim,
            external_memory: 0,
            cum_pre_bytes: 0,
            cum_promoted_bytes: 0,
        })
    }

    pub fn limits(&self) -> &YoungGenSize {
        &self.limits
    }

    pub fn adjust_size(&self, desired: usize) -> usize {
        self.limits.adjust_size(desired)
    }

    /// Whether `ptr` points into the nursery. Valid at any time, including
    /// while the context is claimed.
    #[inline(always)]
    pub fn contains(&self, ptr: *const u8) -> bool {
        AlignedStorage::start(ptr) == self.low_lim
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

    /// Attempt a nursery allocation. Requires the generation to own its
    /// context.
    #[inline]
    pub fn alloc_raw(
        &mut self,
        size: usize,
        kind: crate::cell::CellKind,
        has_finalizer: HasFinalizer,
    ) -> AllocResult {
        self.context.get_mut().alloc(size, kind, has_finalizer)
    }

    pub fn grow_to(&mut self, desired: usize) {
        debug_assert_eq!(desired, self.adjust_size(desired));
        self.active_segment_mut_internal().grow_to(desired);
        self.update_effective_end_for_external_memory();
    }

    pub fn shrink_to(&mut self, desired: usize) {
        debug_assert_eq!(desired, self.adjust_size(desired));
        debug_assert!(self.used() <= desired);
        self.active_segment_mut_internal().shrink_to(desired);
        self.update_effective_end_for_external_memory();
    }

    fn active_segment_mut_internal(&mut self) -> &mut AlignedHeapSegment {
        &mut self.context.get_mut().segment
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

    /// Apply the external charge to the nursery segment's effective end,
    /// clamped so it never cuts below the current level.
    pub fn update_effective_end_for_external_memory(&mut self) {
        let external = self.external_memory;
        let segment = self.active_segment_mut_internal();
        let end = segment.end() as usize;
        let level = segment.level() as usize;
        let effective = end.saturating_sub(external).max(level);
        segment.set_effective_end(effective as *mut u8);
    }

    pub fn dbg_contains(&self, ptr: *const u8) -> bool {
        self.contains(ptr)
    }

    pub fn for_all_objs(&self, callback: impl FnMut(*mut GCCell)) {
        self.active_segment().for_all_objs(callback);
    }
}

impl Generation for YoungGen {
    fn size(&self) -> usize {
        self.active_segment().size()
    }

    fn used(&self) -> usize {
        self.active_segment().used()
    }

    fn available(&self) -> usize {
        self.active_segment().available()
    }

    fn external_memory(&self) -> usize {
        self.external_memory
    }
}

/// Evacuation acceptor for young collections: every visited slot holding a
/// young pointer gets its referent copied to the old generation (or, if the
/// referent already moved, is rewritten to the copy).
pub(crate) struct EvacAcceptor<'a> {
    pub gc: &'a mut GenGC,
}

impl<'a> Visitor for EvacAcceptor<'a> {
    fn visit_pointer(&mut self, slot: *mut *mut GCCell) {
        unsafe {
            self.gc.ensure_referent_copied(slot);
        }
    }

    fn visit_weak_slot(&mut self, _slot: *mut WeakRefSlot) {
        // Weak slots are processed wholesale after reachability is known.
    }
}

#[cold]
fn promotion_oom(size: usize, cell: *const u8) -> ! {
    // ensure_fits checked worst-case space before evacuation started, so
    // this is unreachable unless that invariant broke.
    eprintln!(
        "[gc] out of memory promoting young object: {} at {:p}",
        formatted_size(size),
        cell
    );
    std::process::abort()
}

impl GenGC {
    /// Copy the young referent of `slot` into the old generation exactly
    /// once. The first visit copies the cell and overwrites its header with
    /// a forwarding pointer; every later visit (this collection) reads the
    /// same target back. Old referents are left untouched.
    pub(crate) unsafe fn ensure_referent_copied(&mut self, slot: *mut *mut GCCell) {
        let cell = *slot;
        if cell.is_null() || !self.young_gen.contains(cell as *const u8) {
            return;
        }

        if (*cell).is_forwarded() {
            *slot = (*cell).forwarding_pointer();
            return;
        }

        let size = (*cell).size();
        let target = match self.old_gen_alloc_for_promotion(size) {
            Some(target) => target.as_ptr(),
            None => promotion_oom(size, cell as *const u8),
        };
        core::ptr::copy_nonoverlapping(cell as *const u8, target as *mut u8, size);
        (*cell).set_forwarding_pointer(target);
        *slot = target;
        self.promoted_bytes += size;
    }

    /// Evacuating young-generation collection.
    ///
    /// Precondition (checked by callers through `old_gen_ensure_fits`): the
    /// old generation can absorb every live young byte. Evacuation cannot
    /// be undone partway, so this is hard, not best-effort.
    pub(crate) fn young_collect_inner(&mut self, cause: &str) {
        assert!(
            self.young_gen.owns_alloc_context(),
            "collection entered while the allocation context is claimed"
        );
        let start_time = std::time::Instant::now();
        self.phase.store(GcPhase::YoungCollection, atomic::Ordering::Release);

        // A young collection interrupts any run of consecutive full
        // collections the effective-OOM heuristic was counting.
        self.consec_full_gcs = 0;

        // If direct old-gen allocation was in effect, the old gen's card
        // boundaries are stale; the dirty-card scan below depends on them.
        if !self.alloc_context_from_young {
            self.old_gen_recreate_card_table_boundaries();
        }

        let young_used_before = self.young_gen.used();
        let old_used_before = self.old_gen.used();
        self.young_gen.cum_pre_bytes += young_used_before as u64;
        self.promoted_bytes = 0;

        // Snapshot the old generation's fill frontier: everything promoted
        // from here on is scanned by the transitive closure.
        let to_scan = self.old_gen.level_location();

        // Old-to-young pointers first, discovered through dirty cards, so
        // the snapshot taken above bounds the card scan.
        self.mark_young_gen_pointers(to_scan);

        // Roots.
        self.mark_roots_for_young_collection();

        // Transitive closure over everything promoted so far.
        self.young_gen_transitive_closure(to_scan);

        // Reachability in the young gen is now decided; update weak
        // references with young referents.
        self.update_weak_references(false);

        // Finalize the dead, transfer the finalizer entries of the living
        // to the old generation's list.
        self.finalize_unreachable_and_transfer();

        // Restart allocation at the bottom of the nursery.
        let advise = if self.release_unused {
            AdviseUnused::Yes
        } else {
            AdviseUnused::No
        };
        self.young_gen
            .context_mut()
            .get_mut()
            .segment
            .reset_level(advise);
        self.young_gen.update_effective_end_for_external_memory();

        let promoted = self.promoted_bytes;
        debug_assert_eq!(
            promoted,
            self.old_gen.used() - old_used_before,
            "promotion accounting out of sync with the old gen frontier"
        );
        debug_assert!(
            promoted <= young_used_before,
            "promoted more bytes than the young gen held"
        );
        self.young_gen.cum_promoted_bytes += promoted as u64;
        self.young_collections += 1;

        logln_if!(
            self.verbose,
            "[gc] GC({}) Pause Young ({}) {} -> promoted {} (old gen {}) {:.4}ms",
            self.young_collections + self.full_collections - 1,
            cause,
            formatted_size(young_used_before),
            formatted_size(promoted),
            formatted_size(self.old_gen.used()),
            start_time.elapsed().as_micros() as f64 / 1000.0
        );

        self.phase.store(GcPhase::Idle, atomic::Ordering::Release);

        #[cfg(debug_assertions)]
        {
            self.check_well_formed();
            self.old_gen.verify_card_table_boundaries();
        }
    }

    fn mark_roots_for_young_collection(&mut self) {
        #[cfg(debug_assertions)]
        self.check_duplicate_roots(false);

        let mut roots = self.roots.take();
        let extra = self.extra_root;
        {
            let mut acceptor = EvacAcceptor { gc: self };
            if let Some(root_set) = roots.as_mut() {
                root_set.mark_roots(&mut acceptor, false);
            }
            if let Some(root) = extra {
                unsafe {
                    (*root).trace(&mut acceptor);
                }
            }
        }
        self.roots = roots;
        self.mark_persistent_roots_for_evac();
    }

    fn mark_persistent_roots_for_evac(&mut self) {
        let slots = self.persistent_roots.slot_ptrs();
        for slot in slots {
            unsafe {
                self.ensure_referent_copied(slot);
            }
        }
    }

    /// Young-gen slow path: try a young collection (if the old gen can
    /// absorb the worst case), then escalate to a full collection, then to
    /// growing the old generation. `None` means the configured maximum
    /// heap cannot satisfy the request; callers decide whether that is
    /// fatal.
    pub(crate) fn young_alloc_slow(
        &mut self,
        size: usize,
        kind: crate::cell::CellKind,
        has_finalizer: HasFinalizer,
        fixed_size: bool,
    ) -> Option<NonNull<GCCell>> {
        if self.old_gen_ensure_fits(self.young_gen.used()) {
            self.young_collect_inner("allocation-failure");
            if let Some(cell) = self.young_gen.alloc_raw(size, kind, has_finalizer) {
                return Some(cell);
            }
            if !fixed_size {
                // The nursery was just emptied, so the allocation is simply
                // too large for it; place it directly in the old gen.
                if let Some(cell) = self.old_gen_alloc_raw(size, kind, has_finalizer) {
                    return Some(cell);
                }
            }
        }
        self.full_collect_then_alloc(size, kind, has_finalizer, fixed_size)
    }

    fn full_collect_then_alloc(
        &mut self,
        size: usize,
        kind: crate::cell::CellKind,
        has_finalizer: HasFinalizer,
        fixed_size: bool,
    ) -> Option<NonNull<GCCell>> {
        self.collect_inner("allocation-failure", true);
        if let Some(cell) = self.young_gen.alloc_raw(size, kind, has_finalizer) {
            return Some(cell);
        }

        // Grow the old gen far enough to allow a worst-case young
        // collection, if the allocation itself can fit the nursery.
        if size <= self.young_gen.size() && self.old_gen_grow_to_fit(self.young_gen.used()) {
            self.young_collect_inner("allocation-failure");
            return Some(
                self.young_gen
                    .alloc_raw(size, kind, has_finalizer)
                    .expect("young gen must fit the allocation after collection"),
            );
        }

        if !fixed_size {
            if self.old_gen_grow_to_fit(size) {
                return Some(
                    self.old_gen_alloc_raw(size, kind, has_finalizer)
                        .expect("old gen must fit the allocation after growth"),
                );
            }
        }

        None
    }

    /// Young finalizer bookkeeping at the end of an evacuation: survivors
    /// moved, so their entries migrate to the old generation's list; the
    /// rest run their finalizers now.
    fn finalize_unreachable_and_transfer(&mut self) {
        let mut young_list = std::mem::take(
            &mut self.young_gen.context_mut().get_mut().cells_with_finalizers,
        );
        let old_list = &mut self.old_gen.context_mut().get_mut().cells_with_finalizers;
        for cell in young_list.drain(..) {
            unsafe {
                if (*cell).is_forwarded() {
                    old_list.push((*cell).forwarding_pointer());
                } else {
                    kind_table::finalize_cell(cell);
                    #[cfg(debug_assertions)]
                    {
                        self.num_finalized_objects += 1;
                    }
                }
            }
        }
        // The (now empty) vec goes back to keep its capacity.
        self.young_gen.context_mut().get_mut().cells_with_finalizers = young_list;
    }
}
