use crate::api::{Collectable, Gc, RootSet, Visitor, WeakGc};
use crate::cell::{CellKind, GCCell, CELL_HEADER_SIZE};
use crate::complete_mark::{
    complete_marking_in_segment, CompleteMarkState, MarkTransitiveAcceptor,
};
use crate::generation::{finalize_unreachable, Generation, HasFinalizer};
use crate::globals::*;
use crate::kind_table;
use crate::old_gen::{OldGen, OldGenSize};
use crate::segment::{AlignedHeapSegment, AlignedHeapSegment as Segment};
use crate::segment_index::GCSegmentAddressIndex;
use crate::storage::{StorageProvider, VMStorageProvider};
use crate::sweep::{heap_align_size, ChunksRemaining, CompactionResult, GenId, HeadersRemaining, SweepResult};
use crate::util::formatted_size;
use crate::weak_ref::{WeakRefSlot, WeakState};
use crate::young_gen::{YoungGen, YoungGenSize};

use atomic::{Atomic, Ordering};
use crossbeam_utils::atomic::AtomicCell;
use std::marker::PhantomData;
use std::ptr::{null_mut, NonNull};

/// Which stage of a collection currently owns the heap. Consulted by debug
/// assertions; the forwarding-pointer protocol depends on the strict
/// mark -> sweep -> update-references -> compact order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GcPhase {
    Idle,
    Mark,
    Sweep,
    UpdateReferences,
    Compact,
    YoungCollection,
}

/// Fatal out-of-memory classes, mirrored into the crash report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OomError {
    /// Too many consecutive full collections with too little recovered.
    Effective,
    /// The configured maximum heap cannot satisfy the request.
    MaxHeapReached,
    /// A single allocation larger than a segment can ever hold.
    SuperSegmentAlloc,
}

/// Diagnostic payload delivered to the crash sink right before abort.
pub struct OomReport {
    pub code: OomError,
    pub message: String,
    pub backtrace: backtrace::Backtrace,
}

/// Heap summary exposed to embedders and crash tooling.
#[derive(Clone, Debug, Default)]
pub struct HeapInfo {
    pub heap_size: usize,
    pub allocated_bytes: usize,
    pub external_bytes: usize,
    pub total_allocated_bytes: u64,
    pub va_size: usize,
    pub num_young_collections: u64,
    pub num_full_collections: u64,
}

/// Sink for OOM reports and heap telemetry. The default implementation
/// drops everything; embedders with crash reporting plug in here.
pub trait CrashManager {
    fn report_oom(&mut self, _report: &OomReport) {}
    fn set_heap_info(&mut self, _info: &HeapInfo) {}
    fn set_custom_data(&mut self, _key: &str, _value: &str) {}
}

pub struct NullCrashManager;
impl CrashManager for NullCrashManager {}

/// Configuration for the collector.
pub struct GCConfig {
    /// Lower bound the heap never shrinks below.
    pub min_heap: usize,
    /// Starting heap size.
    pub init_heap: usize,
    /// Hard upper bound; exhausting it is fatal.
    pub max_heap: usize,
    /// Fraction of the heap the live set may occupy before the heap grows.
    pub occupancy_target: f64,
    /// Consecutive full collections tolerated before declaring effective
    /// OOM. Zero disables the heuristic.
    pub effective_oom_threshold: u32,
    /// Return freed pages to the OS eagerly.
    pub release_unused: bool,
    /// Start in direct old-gen allocation and switch to the young gen when
    /// `tti_reached` is signalled.
    pub alloc_in_old_before_tti: bool,
    /// Enables `[gc]` pause lines on stderr.
    pub verbose: bool,
}

impl Default for GCConfig {
    fn default() -> Self {
        Self {
            min_heap: 1024 * 1024,
            init_heap: 8 * 1024 * 1024,
            max_heap: 512 * 1024 * 1024,
            occupancy_target: 0.5,
            effective_oom_threshold: 6,
            release_unused: true,
            alloc_in_old_before_tti: false,
            verbose: false,
        }
    }
}

/// Exponential smoothing factor for the live-size estimate consulted when
/// shrinking the heap.
const WEIGHTED_USED_ALPHA: f64 = 0.2;

struct GenerationSizes {
    young: YoungGenSize,
    old: OldGenSize,
}

impl GenerationSizes {
    /// Split a total-heap hint between the generations: the young gen gets
    /// its fraction, the old gen the remainder, both clamped to their own
    /// bounds.
    fn adjust(&self, hint: usize) -> (usize, usize) {
        let young = self.young.adjust_size(hint / YOUNG_GEN_FRACTION_DENOM);
        let old = self.old.adjust_size(hint.saturating_sub(young));
        (young, old)
    }
}

/// GC-owned table of root slots, for embedders (and tests) that want the
/// collector to keep a handful of handles up to date across collections.
pub(crate) struct PersistentRoots {
    slots: Vec<*mut GCCell>,
    free: Vec<usize>,
}

impl PersistentRoots {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn add(&mut self, cell: *mut GCCell) -> usize {
        if let Some(index) = self.free.pop() {
            self.slots[index] = cell;
            index
        } else {
            self.slots.push(cell);
            self.slots.len() - 1
        }
    }

    fn remove(&mut self, index: usize) {
        self.slots[index] = null_mut();
        self.free.push(index);
    }

    fn get(&self, index: usize) -> *mut GCCell {
        self.slots[index]
    }

    /// Addresses of all slots (freed ones hold null, which acceptors
    /// skip).
    pub(crate) fn slot_ptrs(&mut self) -> Vec<*mut *mut GCCell> {
        self.slots
            .iter_mut()
            .map(|slot| slot as *mut *mut GCCell)
            .collect()
    }
}

/// Owning handle into the persistent-root table. Dropping it without
/// `remove_root` leaks the slot (the referent stays alive).
pub struct RootHandle<T: Collectable> {
    index: usize,
    marker: PhantomData<T>,
}

/// The generational collector: owns both generations, the segment address
/// index, the weak-reference table and the collection state machine. This
/// is the only type an embedding runtime talks to directly.
pub struct GenGC {
    pub(crate) provider: Box<dyn StorageProvider>,
    pub(crate) young_gen: YoungGen,
    pub(crate) old_gen: OldGen,
    pub(crate) segment_index: GCSegmentAddressIndex,
    mark_state: CompleteMarkState,

    /// The allocation context the fast path bump-allocates through,
    /// claimed from whichever generation `alloc_context_from_young`
    /// names. Yielded back to its owner around every collection.
    claimed: Option<crate::generation::AllocContext>,
    pub(crate) alloc_context_from_young: bool,
    revert_to_yg_at_tti: bool,
    tti: AtomicCell<bool>,

    pub(crate) phase: Atomic<GcPhase>,

    weak_slots: Vec<Box<WeakRefSlot>>,
    first_free_weak: *mut WeakRefSlot,
    weak_refs_with_possible_young_referent: Vec<*mut WeakRefSlot>,

    pub(crate) roots: Option<Box<dyn RootSet>>,
    pub(crate) persistent_roots: PersistentRoots,
    /// The value being allocated by the current slow path, kept alive and
    /// up to date across the collection it triggers. Points into the
    /// caller's stack frame; set and cleared by `alloc_raw_rooted`.
    pub(crate) extra_root: Option<*mut dyn crate::api::Trace>,

    crash_mgr: Box<dyn CrashManager>,
    generation_sizes: GenerationSizes,
    occupancy_target: f64,
    effective_oom_threshold: u32,
    pub(crate) consec_full_gcs: u32,
    weighted_used: f64,
    pub(crate) release_unused: bool,
    pub(crate) verbose: bool,

    pub(crate) young_collections: u64,
    pub(crate) full_collections: u64,
    total_allocated_bytes: u64,
    pub(crate) promoted_bytes: usize,
    #[cfg(debug_assertions)]
    pub(crate) num_finalized_objects: u64,
}

impl GenGC {
    pub fn new(config: GCConfig) -> Box<Self> {
        unsafe {
            kind_table::KindTable::init();
        }

        let mut provider: Box<dyn StorageProvider> = Box::new(VMStorageProvider::new());

        let young_limits = YoungGenSize::new(
            config.min_heap / YOUNG_GEN_FRACTION_DENOM,
            config.max_heap / YOUNG_GEN_FRACTION_DENOM,
        );
        let old_limits = OldGenSize::new(PAGE_SIZE, config.max_heap);

        let mut young_gen = YoungGen::new(
            &mut *provider,
            young_limits,
            config.init_heap / YOUNG_GEN_FRACTION_DENOM,
        )
        .expect("failed to reserve the young generation");
        let mut old_gen = OldGen::new(&mut *provider, old_limits, config.release_unused)
            .expect("failed to reserve the old generation");
        let initial_old = old_gen.adjust_size(config.init_heap.saturating_sub(young_gen.size()));
        old_gen.grow_to(initial_old);

        let mut segment_index = GCSegmentAddressIndex::new();
        segment_index.update(NonNull::from(
            &mut *young_gen.context_mut().get_mut().segment,
        ));
        segment_index.update(NonNull::from(&mut *old_gen.context_mut().get_mut().segment));

        let mut gc = Box::new(Self {
            provider,
            young_gen,
            old_gen,
            segment_index,
            mark_state: CompleteMarkState::new(),
            claimed: None,
            alloc_context_from_young: !config.alloc_in_old_before_tti,
            revert_to_yg_at_tti: config.alloc_in_old_before_tti,
            tti: AtomicCell::new(false),
            phase: Atomic::new(GcPhase::Idle),
            weak_slots: Vec::new(),
            first_free_weak: null_mut(),
            weak_refs_with_possible_young_referent: Vec::new(),
            roots: None,
            persistent_roots: PersistentRoots::new(),
            extra_root: None,
            crash_mgr: Box::new(NullCrashManager),
            generation_sizes: GenerationSizes {
                young: young_limits,
                old: old_limits,
            },
            occupancy_target: config.occupancy_target,
            effective_oom_threshold: config.effective_oom_threshold,
            consec_full_gcs: 0,
            weighted_used: 0.0,
            release_unused: config.release_unused,
            verbose: config.verbose,
            young_collections: 0,
            full_collections: 0,
            total_allocated_bytes: 0,
            promoted_bytes: 0,
            #[cfg(debug_assertions)]
            num_finalized_objects: 0,
        });
        gc.claim_alloc_context();
        gc
    }

    /// Register the embedder's root enumeration.
    pub fn set_root_set(&mut self, roots: Box<dyn RootSet>) {
        self.roots = Some(roots);
    }

    /// Replace the crash sink.
    pub fn set_crash_manager(&mut self, crash_mgr: Box<dyn CrashManager>) {
        self.crash_mgr = crash_mgr;
    }

    // ---------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------

    /// Allocate `value` on the GC heap. Never returns null: the slow path
    /// escalates through collections and heap growth, and aborts the
    /// process when memory truly cannot be obtained.
    pub fn allocate<T: Collectable>(&mut self, value: T) -> Gc<T> {
        match self.allocate_impl(value, false) {
            Ok(gc) => gc,
            Err(_) => self.oom(OomError::MaxHeapReached),
        }
    }

    /// Allocate directly in the old generation, for objects the embedder
    /// knows will be long-lived.
    pub fn allocate_long_lived<T: Collectable>(&mut self, value: T) -> Gc<T> {
        match self.allocate_impl(value, true) {
            Ok(gc) => gc,
            Err(_) => self.oom(OomError::MaxHeapReached),
        }
    }

    /// Like `allocate`, but hands the value back instead of aborting when
    /// the heap is exhausted. The effective-OOM heuristic still applies to
    /// any full collections the attempt triggers.
    pub fn try_allocate<T: Collectable>(&mut self, value: T) -> Result<Gc<T>, T> {
        self.allocate_impl(value, false)
    }

    fn allocate_impl<T: Collectable>(&mut self, mut value: T, long_lived: bool) -> Result<Gc<T>, T> {
        let kind = kind_table::kind_index::<T>();
        let size = heap_align_size(CELL_HEADER_SIZE + value.allocation_size());
        if size > Segment::max_size() {
            self.oom(OomError::SuperSegmentAlloc);
        }
        let has_finalizer = if std::mem::needs_drop::<T>() {
            HasFinalizer::Yes
        } else {
            HasFinalizer::No
        };

        // The value may itself hold heap pointers; a collection triggered
        // by this very allocation must treat it as a root, both to keep
        // its referents alive and to rewrite its pointers when they move.
        let value_root = &mut value as &mut dyn crate::api::Trace as *mut dyn crate::api::Trace;
        let cell = match self.alloc_raw_rooted(size, kind, has_finalizer, long_lived, value_root) {
            Some(cell) => cell,
            None => return Err(value),
        };
        unsafe {
            ((*cell.as_ptr()).data() as *mut T).write(value);
        }
        Ok(Gc::from_cell(cell))
    }

    /// The raw allocation ladder: fast bump through the claimed context,
    /// then the owning generation's slow path (collection, then growth).
    /// `None` means the configured maximum heap cannot satisfy the
    /// request.
    fn alloc_raw_rooted(
        &mut self,
        size: usize,
        kind: CellKind,
        has_finalizer: HasFinalizer,
        long_lived: bool,
        value_root: *mut dyn crate::api::Trace,
    ) -> Option<NonNull<GCCell>> {
        self.total_allocated_bytes += size as u64;

        if long_lived && self.alloc_context_from_young {
            // Direct old-gen allocation while the fast path serves the
            // nursery.
            if let Some(cell) = self.old_gen_alloc_raw(size, kind, has_finalizer) {
                return Some(cell);
            }
            self.extra_root = Some(value_root);
            self.yield_alloc_context();
            let cell = self.old_alloc_slow(size, kind, has_finalizer);
            self.claim_alloc_context();
            self.extra_root = None;
            return cell;
        }

        if let Some(ctx) = self.claimed.as_mut() {
            if let Some(cell) = ctx.alloc(size, kind, has_finalizer) {
                return Some(cell);
            }
        }

        self.extra_root = Some(value_root);
        self.yield_alloc_context();
        let cell = if self.alloc_context_from_young {
            self.young_alloc_slow(size, kind, has_finalizer, false)
        } else {
            self.old_alloc_slow(size, kind, has_finalizer)
        };
        self.claim_alloc_context();
        self.extra_root = None;
        cell
    }

    fn old_alloc_slow(
        &mut self,
        size: usize,
        kind: CellKind,
        has_finalizer: HasFinalizer,
    ) -> Option<NonNull<GCCell>> {
        if let Some(cell) = self.old_gen_alloc_raw(size, kind, has_finalizer) {
            return Some(cell);
        }
        self.collect_inner("allocation-failure", true);
        if let Some(cell) = self.old_gen_alloc_raw(size, kind, has_finalizer) {
            return Some(cell);
        }
        if self.old_gen_grow_to_fit(size) {
            return Some(
                self.old_gen_alloc_raw(size, kind, has_finalizer)
                    .expect("old gen must fit the allocation after growth"),
            );
        }
        None
    }

    /// Trace the in-flight allocation value, if any, as a root.
    pub(crate) fn trace_extra_root(&mut self, acceptor: &mut dyn Visitor) {
        if let Some(root) = self.extra_root {
            unsafe {
                (*root).trace(acceptor);
            }
        }
    }

    /// Allocate a weak-map value, ensuring the kind is registered with its
    /// entries callback before the first cell of this type exists.
    pub fn allocate_weak_map<T: kind_table::WeakMapCollectable>(&mut self, value: T) -> Gc<T> {
        kind_table::weak_map_kind_index::<T>();
        self.allocate(value)
    }

    /// Whether the cell behind `handle` currently resides in the young
    /// generation.
    pub fn is_young<T: Collectable>(&self, handle: Gc<T>) -> bool {
        self.young_gen.contains(handle.as_cell() as *const u8)
    }

    /// Create a weak reference to `target`.
    pub fn allocate_weak<T: Collectable>(&mut self, target: Gc<T>) -> WeakGc<T> {
        let slot = self.alloc_weak_slot(target.as_cell());
        WeakGc {
            slot: NonNull::new(slot).expect("weak slot allocation produced null"),
            marker: PhantomData,
        }
    }

    // ---------------------------------------------------------------
    // Write barriers
    // ---------------------------------------------------------------

    /// Record the store of `value` into the heap location `loc`. The
    /// embedder must call this (or `write_barrier_range`) for every store
    /// of a heap pointer into a heap-resident slot; a missed barrier
    /// silently corrupts the old-to-young remembered set.
    #[inline]
    pub fn write_barrier(&mut self, loc: *const u8, value: *const GCCell) {
        debug_assert!(self.dbg_contains(loc), "write barrier on non-heap location");
        if value.is_null() {
            return;
        }
        if self.young_gen.contains(value as *const u8) && !self.young_gen.contains(loc) {
            Segment::card_table_covering(loc).dirty_card_for_address(loc);
        }
    }

    /// Barrier for a bulk store into `[start, start + len_bytes)`; dirties
    /// every covered card without inspecting the values.
    pub fn write_barrier_range(&mut self, start: *const u8, len_bytes: usize) {
        debug_assert!(self.dbg_contains(start));
        if len_bytes == 0 || self.young_gen.contains(start) {
            return;
        }
        let end = (start as usize + len_bytes) as *const u8;
        debug_assert!(
            crate::storage::AlignedStorage::contained_in_same(start, (end as usize - 1) as *const u8),
            "range barrier must stay within one segment"
        );
        Segment::card_table_covering(start).dirty_cards_for_address_range(start, end);
    }

    #[cfg(debug_assertions)]
    pub fn needs_write_barrier(&self, loc: *const u8, value: *const GCCell) -> bool {
        !self.young_gen.contains(loc) && self.young_gen.contains(value as *const u8)
    }

    // ---------------------------------------------------------------
    // Collection entry points
    // ---------------------------------------------------------------

    /// Run a young-generation collection, or a full collection when the
    /// old generation cannot absorb the worst case.
    pub fn collect_young(&mut self) {
        self.yield_alloc_context();
        if self.old_gen_ensure_fits(self.young_gen.used()) {
            self.young_collect_inner("requested");
        } else {
            self.collect_inner("requested", false);
        }
        self.claim_alloc_context();
    }

    /// Run a full (both-generation) collection.
    pub fn collect_full(&mut self, cause: &str) {
        self.yield_alloc_context();
        self.collect_inner(cause, false);
        self.claim_alloc_context();
    }

    pub(crate) fn claim_alloc_context(&mut self) {
        debug_assert!(self.claimed.is_none());
        let ctx = if self.alloc_context_from_young {
            self.young_gen.context_mut().claim()
        } else {
            self.old_gen.context_mut().claim()
        };
        self.claimed = Some(ctx);
    }

    /// Hand the claimed context back to its owner; a no-op if it was
    /// already yielded.
    pub(crate) fn yield_alloc_context(&mut self) {
        if let Some(ctx) = self.claimed.take() {
            if self.alloc_context_from_young {
                self.young_gen.context_mut().yield_back(ctx);
            } else {
                self.old_gen.context_mut().yield_back(ctx);
            }
        }
    }

    /// The embedder signals time-to-interactive: if startup ran in direct
    /// old-gen allocation, switch to nursery allocation. The old gen's
    /// crossing-object tables were not maintained during the direct phase
    /// and must be rebuilt before the next young collection can run.
    pub fn tti_reached(&mut self) {
        self.tti.store(true);
        if !self.alloc_context_from_young && self.revert_to_yg_at_tti {
            self.yield_alloc_context();
            self.old_gen.recreate_card_table_boundaries();
            self.alloc_context_from_young = true;
            self.claim_alloc_context();
        }
    }

    /// Full mark-sweep-compact collection over both generations.
    pub(crate) fn collect_inner(&mut self, cause: &str, can_effective_oom: bool) {
        assert!(
            self.claimed.is_none(),
            "collection entered while the allocation context is claimed"
        );
        if can_effective_oom {
            self.consec_full_gcs += 1;
            if self.effective_oom_threshold > 0 && self.consec_full_gcs >= self.effective_oom_threshold
            {
                self.oom(OomError::Effective);
            }
        }

        let start_time = std::time::Instant::now();
        let used_before = self.used_direct();
        let size_before = self.size_direct();

        // Mark.
        self.mark_phase();

        // Finalize the unreachable before their headers are repurposed.
        self.finalize_unreachable_objects();

        // Remove the external charge for the duration of the collection;
        // compaction addresses are computed against real segment ends.
        let young_external = self.young_gen.external_memory();
        let old_external = self.old_gen.external_memory();
        self.young_gen.debit_external_memory(young_external);
        self.old_gen.debit_external_memory(old_external);

        // Sweep: assign post-compaction addresses and install forwarding
        // pointers, old generation first; the phases below must consume
        // displaced headers in this same order.
        self.phase.store(GcPhase::Sweep, Ordering::Release);
        let mut compaction = CompactionResult::new();
        self.old_gen.push_chunks(&mut compaction);
        compaction.push_segment(self.young_gen.active_segment(), GenId::Young);
        let mut sweep_result = SweepResult::new(compaction);
        self.old_gen
            .sweep_and_install_forwarding_pointers(&mut sweep_result);
        self.young_gen
            .context_mut()
            .get_mut()
            .segment
            .sweep_and_install_forwarding_pointers(&mut sweep_result);

        // Update references: every pointer slot (roots, cell fields, weak
        // structures) is rewritten through the forwarding pointers while
        // all cells still sit at their old addresses.
        self.phase.store(GcPhase::UpdateReferences, Ordering::Release);
        let displaced = std::mem::take(&mut sweep_result.displaced_headers);
        self.update_root_references();
        {
            let mut headers = HeadersRemaining::new(&displaced);
            let mut acceptor = UpdateAcceptor;
            self.old_gen.update_references(&mut acceptor, &mut headers);
            self.young_gen
                .context_mut()
                .get_mut()
                .segment
                .update_references(&mut acceptor, &mut headers);
            debug_assert!(!headers.has_next(), "not all displaced headers consumed");
        }
        crate::generation::update_finalizer_list_references(
            &mut self.young_gen.context_mut().get_mut().cells_with_finalizers,
        );
        self.update_weak_references(true);
        self.unmark_weak_references();

        // Re-instate the external charge.
        self.young_gen.credit_external_memory(young_external);
        self.old_gen.credit_external_memory(old_external);

        // Compact: physically move cells and restore their displaced
        // headers, in the same order again.
        self.phase.store(GcPhase::Compact, Ordering::Release);
        {
            let mut headers = HeadersRemaining::new(&displaced);
            self.old_gen.compact(&mut headers);
            self.young_gen
                .context_mut()
                .get_mut()
                .segment
                .compact(&mut headers);
            debug_assert!(!headers.has_next(), "not all displaced headers restored");
        }

        {
            let compaction_result = sweep_result.compaction_result;
            let mut chunks = ChunksRemaining::new(compaction_result.used_chunks());
            self.old_gen.record_level_after_compaction(
                &mut chunks,
                &mut *self.provider,
                &mut self.segment_index,
            );
            let advise = if self.release_unused {
                crate::segment::AdviseUnused::Yes
            } else {
                crate::segment::AdviseUnused::No
            };
            if chunks.has_next() {
                debug_assert_eq!(chunks.peek().generation(), GenId::Young);
                chunks
                    .next()
                    .record_level(&mut self.young_gen.context_mut().get_mut().segment, advise);
            } else {
                // Every young survivor landed in an old-gen chunk; the
                // nursery chunk went unused and the segment is empty.
                self.young_gen
                    .context_mut()
                    .get_mut()
                    .segment
                    .reset_level(advise);
            }
            debug_assert!(!chunks.has_next(), "chunks left unrecorded");
        }

        // Young survivors that were compacted into old-gen chunks carry
        // their finalizer entries with them.
        self.compact_young_finalizable_list();

        self.old_gen.update_effective_end_for_external_memory();
        self.young_gen.update_effective_end_for_external_memory();

        let young_is_empty = self.young_gen.used() == 0;
        self.old_gen.update_card_tables_after_compaction(young_is_empty);

        self.update_weighted_used();
        self.update_heap_size();

        // If startup-mode direct OG allocation survived until a full
        // collection, revert to nursery allocation as a backstop.
        if !self.alloc_context_from_young && self.revert_to_yg_at_tti {
            self.alloc_context_from_young = true;
            self.old_gen.recreate_card_table_boundaries();
        }

        self.full_collections += 1;
        debug_assert!(self.used_direct() <= used_before, "a full GC must not grow the live set");

        logln_if!(
            self.verbose,
            "[gc] GC({}) Pause Full ({}) {} -> {} (heap {} -> {}) {:.4}ms",
            self.young_collections + self.full_collections - 1,
            cause,
            formatted_size(used_before),
            formatted_size(self.used_direct()),
            formatted_size(size_before),
            formatted_size(self.size_direct()),
            start_time.elapsed().as_micros() as f64 / 1000.0
        );

        self.phase.store(GcPhase::Idle, Ordering::Release);
        self.report_heap_extents();

        #[cfg(debug_assertions)]
        {
            self.check_well_formed();
            self.old_gen.verify_card_table_boundaries();
        }
    }

    /// Debug validation of the whole heap: every live cell has a
    /// registered kind and a heap-aligned size, and every pointer field
    /// refers to a valid cell.
    #[cfg(debug_assertions)]
    pub fn check_well_formed(&mut self) {
        let mut cells = Vec::new();
        self.for_all_objs(|cell| cells.push(cell));

        struct VerifyAcceptor<'a> {
            gc: &'a GenGC,
        }
        impl<'a> Visitor for VerifyAcceptor<'a> {
            fn visit_pointer(&mut self, slot: *mut *mut GCCell) {
                let cell = unsafe { *slot };
                if !cell.is_null() {
                    assert!(
                        self.gc.valid_pointer(cell as *const u8),
                        "cell field points outside the live heap"
                    );
                }
            }
            fn visit_weak_slot(&mut self, slot: *mut WeakRefSlot) {
                assert_ne!(
                    unsafe { (*slot).state() },
                    WeakState::Free,
                    "cell references a freed weak slot"
                );
            }
        }

        for cell in cells {
            unsafe {
                let kind = (*cell).kind();
                let size = (*cell).size();
                assert!(crate::util::is_aligned(size, HEAP_ALIGN));
                let mut acceptor = VerifyAcceptor { gc: self };
                kind_table::trace_cell_with_kind(cell, kind, &mut acceptor);
            }
        }
    }

    // ---------------------------------------------------------------
    // Mark phase
    // ---------------------------------------------------------------

    fn mark_phase(&mut self) {
        self.phase.store(GcPhase::Mark, Ordering::Release);
        self.mark_state.reset();
        self.clear_mark_bits();

        #[cfg(debug_assertions)]
        {
            for slot in self.weak_slots.iter() {
                debug_assert_ne!(
                    slot.state(),
                    WeakState::Marked,
                    "weak slot left marked by the previous collection"
                );
            }
            self.check_duplicate_roots(true);
        }

        // Roots only set mark bits; the closure finds the marked cells by
        // scanning.
        let slots = self.persistent_roots.slot_ptrs();
        {
            let mut acceptor = MarkRootsAcceptor;
            for slot in slots {
                acceptor.visit_pointer(slot);
            }
        }
        let mut roots = self.roots.take();
        if let Some(root_set) = roots.as_mut() {
            let mut acceptor = MarkRootsAcceptor;
            root_set.mark_roots(&mut acceptor, true);
        }
        self.roots = roots;
        self.trace_extra_root(&mut MarkRootsAcceptor);

        self.complete_marking();
    }

    fn clear_mark_bits(&mut self) {
        for segment in self.segment_index.iter() {
            unsafe {
                segment.as_ref().mark_bit_array().clear();
            }
        }
    }

    /// Transitive closure with overflow recovery: scan the segments in
    /// increasing address order, completing marking from every marked
    /// cell; whenever a mark stack overflowed, restart the scan. Each
    /// restart only needs to reach still-unmarked cells, so the loop
    /// terminates.
    fn complete_marking(&mut self) {
        loop {
            self.mark_state.mark_stack_overflow = false;
            let segments: Vec<NonNull<AlignedHeapSegment>> = self.segment_index.iter().collect();
            for segment in segments {
                complete_marking_in_segment(unsafe { segment.as_ref() }, &mut self.mark_state);
                if self.mark_state.mark_stack_overflow {
                    break;
                }
            }
            if !self.mark_state.mark_stack_overflow {
                self.complete_weak_map_marking();
            }
            if !self.mark_state.mark_stack_overflow {
                break;
            }
        }
        self.mark_state.current_par_pointer = null_mut();
        self.mark_state.reachable_weak_maps.clear();
    }

    /// Two-pass weak map protocol: all non-weak edges were marked above;
    /// now, for every reachable weak map, mark the values of entries whose
    /// keys are independently reachable, iterating (marking values can
    /// surface new weak maps or new keys) until nothing changes.
    fn complete_weak_map_marking(&mut self) {
        // Everything discovered from here on must go through the stacks.
        self.mark_state.current_par_pointer = usize::MAX as *mut GCCell;

        let mut strong_traced = 0;
        loop {
            let mut progress = false;

            // Strong (non-entry) fields of newly discovered weak maps.
            while strong_traced < self.mark_state.reachable_weak_maps.len() {
                let map = self.mark_state.reachable_weak_maps[strong_traced];
                strong_traced += 1;
                let kind = unsafe { (*map).kind() };
                {
                    let mut acceptor = MarkTransitiveAcceptor {
                        state: &mut self.mark_state,
                    };
                    kind_table::trace_cell_with_kind(map, kind, &mut acceptor);
                }
                self.mark_state.drain_mark_stack();
                if self.mark_state.mark_stack_overflow {
                    return;
                }
                progress = true;
            }

            // Entries whose keys are reachable get their values marked.
            for i in 0..self.mark_state.reachable_weak_maps.len() {
                let map = self.mark_state.reachable_weak_maps[i];
                let kind = unsafe { (*map).kind() };
                let entries = unsafe {
                    kind_table::KIND_TABLE
                        .get(kind)
                        .weak_entries
                        .expect("weak-map kind without an entries callback")
                };
                let mut newly_live: Vec<*mut GCCell> = Vec::new();
                entries(map, &mut |key, value_slot| {
                    let value = unsafe { *value_slot };
                    if key.is_null() || value.is_null() {
                        return;
                    }
                    if AlignedHeapSegment::get_cell_mark_bit(key)
                        && !AlignedHeapSegment::get_cell_mark_bit(value)
                    {
                        AlignedHeapSegment::set_cell_mark_bit(value);
                        newly_live.push(value);
                    }
                });
                for cell in newly_live {
                    self.mark_state.push_cell(cell);
                    progress = true;
                }
                self.mark_state.drain_mark_stack();
                if self.mark_state.mark_stack_overflow {
                    return;
                }
            }

            if !progress {
                break;
            }
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn check_duplicate_roots(&mut self, long_lived: bool) {
        use std::collections::HashSet;

        struct DuplicateRootsDetector {
            seen: HashSet<usize>,
        }
        impl Visitor for DuplicateRootsDetector {
            fn visit_pointer(&mut self, slot: *mut *mut GCCell) {
                assert!(
                    self.seen.insert(slot as usize),
                    "root enumeration visited a slot twice"
                );
            }
            fn visit_weak_slot(&mut self, _slot: *mut WeakRefSlot) {}
        }

        let mut detector = DuplicateRootsDetector {
            seen: HashSet::new(),
        };
        for slot in self.persistent_roots.slot_ptrs() {
            detector.visit_pointer(slot);
        }
        let mut roots = self.roots.take();
        if let Some(root_set) = roots.as_mut() {
            root_set.mark_roots(&mut detector, long_lived);
        }
        self.roots = roots;
    }

    // ---------------------------------------------------------------
    // Finalizers
    // ---------------------------------------------------------------

    fn finalize_unreachable_objects(&mut self) {
        let finalized_young =
            finalize_unreachable(&mut self.young_gen.context_mut().get_mut().cells_with_finalizers);
        let finalized_old =
            finalize_unreachable(&mut self.old_gen.context_mut().get_mut().cells_with_finalizers);
        #[cfg(debug_assertions)]
        {
            self.num_finalized_objects += (finalized_young + finalized_old) as u64;
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = (finalized_young, finalized_old);
        }
    }

    /// Move young finalizer entries whose cells were compacted into the
    /// old generation over to the old generation's list.
    fn compact_young_finalizable_list(&mut self) {
        let mut young_list = std::mem::take(
            &mut self.young_gen.context_mut().get_mut().cells_with_finalizers,
        );
        let young = &self.young_gen;
        let old_list = &mut self.old_gen.context_mut().get_mut().cells_with_finalizers;
        young_list.retain(|&cell| {
            if young.contains(cell as *const u8) {
                true
            } else {
                old_list.push(cell);
                false
            }
        });
        self.young_gen.context_mut().get_mut().cells_with_finalizers = young_list;
    }

    // ---------------------------------------------------------------
    // Update-references helpers
    // ---------------------------------------------------------------

    fn update_root_references(&mut self) {
        let mut acceptor = UpdateAcceptor;
        for slot in self.persistent_roots.slot_ptrs() {
            acceptor.visit_pointer(slot);
        }
        let mut roots = self.roots.take();
        if let Some(root_set) = roots.as_mut() {
            root_set.mark_roots(&mut acceptor, true);
        }
        self.roots = roots;
        self.trace_extra_root(&mut UpdateAcceptor);
    }

    // ---------------------------------------------------------------
    // Weak references
    // ---------------------------------------------------------------

    fn alloc_weak_slot(&mut self, cell: *mut GCCell) -> *mut WeakRefSlot {
        let slot = if !self.first_free_weak.is_null() {
            let slot = self.first_free_weak;
            unsafe {
                self.first_free_weak = (*slot).next_free();
                (*slot).reset(cell);
            }
            slot
        } else {
            self.weak_slots.push(Box::new(WeakRefSlot::new(cell)));
            &mut **self.weak_slots.last_mut().unwrap() as *mut WeakRefSlot
        };
        self.weak_refs_with_possible_young_referent.push(slot);
        slot
    }

    fn free_weak_slot(&mut self, slot: *mut WeakRefSlot) {
        unsafe {
            (*slot).free(self.first_free_weak);
        }
        self.first_free_weak = slot;
    }

    /// Opportunistically drop free slots from the end of the table.
    fn shrink_weak_slots(&mut self) {
        while let Some(last) = self.weak_slots.last() {
            let last_ptr = &**last as *const WeakRefSlot as *mut WeakRefSlot;
            if self.first_free_weak != last_ptr {
                break;
            }
            unsafe {
                self.first_free_weak = (*last_ptr).next_free();
            }
            self.weak_slots.pop();
        }
    }

    fn update_weak_reference(&mut self, slot: *mut WeakRefSlot, full_gc: bool) {
        unsafe {
            if (*slot).state() == WeakState::Free {
                return;
            }

            if full_gc {
                // A slot nothing reachable refers to goes back on the free
                // list.
                if (*slot).state() == WeakState::Unmarked {
                    self.free_weak_slot(slot);
                    return;
                }
                debug_assert_eq!((*slot).state(), WeakState::Marked);
            }

            if !(*slot).has_pointer() {
                return;
            }
            let cell = (*slot).pointer();

            if full_gc {
                if AlignedHeapSegment::get_cell_mark_bit(cell) {
                    (*slot).set_pointer((*cell).forwarding_pointer());
                } else {
                    (*slot).clear_pointer();
                }
            } else if self.young_gen.contains(cell as *const u8) {
                // Young collection: survivors moved, the rest died.
                if (*cell).is_forwarded() {
                    (*slot).set_pointer((*cell).forwarding_pointer());
                } else {
                    (*slot).clear_pointer();
                }
            }
        }
    }

    pub(crate) fn update_weak_references(&mut self, full_gc: bool) {
        if full_gc {
            for i in 0..self.weak_slots.len() {
                let slot = &mut *self.weak_slots[i] as *mut WeakRefSlot;
                self.update_weak_reference(slot, true);
            }
        } else {
            let list = std::mem::take(&mut self.weak_refs_with_possible_young_referent);
            for &slot in list.iter() {
                self.update_weak_reference(slot, false);
            }
            self.weak_refs_with_possible_young_referent = list;
        }

        // Keep only entries that can still refer into the young gen.
        let young = &self.young_gen;
        self.weak_refs_with_possible_young_referent.retain(|&slot| {
            let slot = unsafe { &*slot };
            slot.state() != WeakState::Free
                && slot.has_pointer()
                && young.contains(slot.pointer() as *const u8)
        });

        if full_gc {
            self.shrink_weak_slots();
        }
    }

    fn unmark_weak_references(&mut self) {
        for slot in self.weak_slots.iter_mut() {
            if slot.state() == WeakState::Marked {
                slot.unmark();
            }
        }
    }

    // ---------------------------------------------------------------
    // Heap sizing
    // ---------------------------------------------------------------

    fn update_weighted_used(&mut self) {
        let current = self.used_direct() as f64;
        self.weighted_used =
            WEIGHTED_USED_ALPHA * current + (1.0 - WEIGHTED_USED_ALPHA) * self.weighted_used;
    }

    fn used_to_desired_size(&self, used: usize) -> usize {
        (used as f64 / self.occupancy_target) as usize
    }

    fn update_heap_size(&mut self) {
        if self.used_direct() as f64 > self.size_direct() as f64 * self.occupancy_target {
            let desired = self.used_to_desired_size(self.used_direct());
            self.grow_heap_to(desired);
        } else if self.young_gen.used() == 0 {
            // Shrinking may cut the young gen; only safe while it is
            // empty, the common case right after a full collection.
            let desired = self.used_to_desired_size(self.weighted_used as usize);
            self.shrink_heap_to(desired);
        }

        let info = self.heap_info_direct();
        self.crash_mgr.set_heap_info(&info);
    }

    fn grow_heap_to(&mut self, hint: usize) {
        let (young_size, old_size) = self.generation_sizes.adjust(hint);
        self.young_gen.grow_to(self.young_gen.adjust_size(young_size));
        self.old_gen.grow_to(self.old_gen.adjust_size(old_size));
    }

    fn shrink_heap_to(&mut self, hint: usize) {
        let (young_size, old_size) = self.generation_sizes.adjust(hint);
        debug_assert_eq!(self.young_gen.used(), 0);

        // Never shrink below what a young collection could need, nor below
        // the old gen's allocation frontier (filled segments may carry
        // unusable tails that still count toward it).
        let min_heap = self.used_direct();
        let old_size = self
            .old_gen
            .adjust_size(old_size.max(min_heap).max(self.old_gen.level_offset()));

        self.young_gen.shrink_to(self.young_gen.adjust_size(young_size));
        self.old_gen.shrink_to(old_size);
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    /// Total heap size. Internal variant; requires the generations to own
    /// their contexts.
    pub(crate) fn size_direct(&self) -> usize {
        self.young_gen.size() + self.old_gen.size()
    }

    pub(crate) fn used_direct(&self) -> usize {
        self.young_gen.used() + self.old_gen.used()
    }

    /// Yield the claimed context, run `f`, and re-claim only if this call
    /// was the one that yielded (so introspection nests inside a
    /// collection, which already owns nothing).
    fn with_yielded_context<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let was_claimed = self.claimed.is_some();
        self.yield_alloc_context();
        let result = f(self);
        if was_claimed {
            self.claim_alloc_context();
        }
        result
    }

    /// Total heap size.
    pub fn size(&mut self) -> usize {
        self.with_yielded_context(|gc| gc.size_direct())
    }

    /// Bytes currently allocated across both generations.
    pub fn used(&mut self) -> usize {
        self.with_yielded_context(|gc| gc.used_direct())
    }

    /// Finalizers run so far, for debugging collection behavior.
    #[cfg(debug_assertions)]
    pub fn num_finalized_objects(&self) -> u64 {
        self.num_finalized_objects
    }

    /// Whether `ptr` lies in some live segment of this heap.
    pub fn dbg_contains(&self, ptr: *const u8) -> bool {
        self.segment_index.segment_covering(ptr).is_some()
    }

    /// Whether `ptr` plausibly refers to a live cell.
    pub fn valid_pointer(&self, ptr: *const u8) -> bool {
        match self.segment_index.segment_covering(ptr) {
            Some(segment) => unsafe { segment.as_ref().valid_pointer(ptr) },
            None => false,
        }
    }

    /// Call `callback` on every live cell in the heap.
    pub fn for_all_objs(&mut self, mut callback: impl FnMut(*mut GCCell)) {
        self.with_yielded_context(|gc| {
            gc.young_gen.for_all_objs(&mut callback);
            gc.old_gen.for_all_objs(&mut callback);
        });
    }

    fn heap_info_direct(&self) -> HeapInfo {
        HeapInfo {
            heap_size: self.size_direct(),
            allocated_bytes: self.used_direct(),
            external_bytes: self.young_gen.external_memory() + self.old_gen.external_memory(),
            total_allocated_bytes: self.total_allocated_bytes,
            va_size: self.segment_index.len() * crate::storage::AlignedStorage::size(),
            num_young_collections: self.young_collections,
            num_full_collections: self.full_collections,
        }
    }

    pub fn heap_info(&mut self) -> HeapInfo {
        self.with_yielded_context(|gc| gc.heap_info_direct())
    }

    /// Heap statistics as a JSON object string.
    pub fn stats_json(&mut self) -> String {
        let info = self.heap_info();
        let survival = if self.young_gen.cum_pre_bytes > 0 {
            100.0 * self.young_gen.cum_promoted_bytes as f64 / self.young_gen.cum_pre_bytes as f64
        } else {
            0.0
        };
        format!(
            "{{\"heapSize\":{},\"allocatedBytes\":{},\"externalBytes\":{},\
             \"totalAllocatedBytes\":{},\"vaSize\":{},\"youngGenCollections\":{},\
             \"fullCollections\":{},\"ygSurvivalPct\":{:.2}}}",
            info.heap_size,
            info.allocated_bytes,
            info.external_bytes,
            info.total_allocated_bytes,
            info.va_size,
            info.num_young_collections,
            info.num_full_collections,
            survival
        )
    }

    /// Per-kind census of live cells, as a JSON array string. Purely
    /// observational; walks the heap but changes nothing.
    pub fn heap_census_json(&mut self) -> String {
        use std::collections::HashMap;

        let mut counts: HashMap<CellKind, (u64, u64)> = HashMap::new();
        self.for_all_objs(|cell| unsafe {
            let entry = counts.entry((*cell).kind()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += (*cell).size() as u64;
        });

        let mut entries: Vec<_> = counts.into_iter().collect();
        entries.sort_by_key(|e| e.0);
        let body = entries
            .iter()
            .map(|(kind, (count, bytes))| {
                let name = unsafe { kind_table::KIND_TABLE.get(*kind).name };
                format!(
                    "{{\"kind\":\"{}\",\"count\":{},\"bytes\":{}}}",
                    name, count, bytes
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        format!("[{}]", body)
    }

    fn report_heap_extents(&mut self) {
        let mut extents = String::new();
        for segment in self.segment_index.iter() {
            let segment = unsafe { segment.as_ref() };
            extents.push_str(&format!(
                "[{:p},{:p}) ",
                segment.low_lim(),
                segment.hi_lim()
            ));
        }
        self.crash_mgr.set_custom_data("heap_extents", extents.trim_end());
    }

    // ---------------------------------------------------------------
    // External memory accounting
    // ---------------------------------------------------------------

    /// Charge `size` bytes of off-heap memory to `cell`'s generation; the
    /// charge shrinks the generation's effective capacity so external
    /// allocations count toward collection triggers.
    pub fn credit_external_memory(&mut self, cell: *mut GCCell, size: usize) {
        if self.young_gen.contains(cell as *const u8) {
            self.young_gen.credit_external_memory(size);
        } else {
            self.old_gen.credit_external_memory(size);
        }
    }

    pub fn debit_external_memory(&mut self, cell: *mut GCCell, size: usize) {
        if self.young_gen.contains(cell as *const u8) {
            self.young_gen.debit_external_memory(size);
        } else {
            self.old_gen.debit_external_memory(size);
        }
    }

    // ---------------------------------------------------------------
    // Persistent roots
    // ---------------------------------------------------------------

    /// Keep `cell` (and everything reachable from it) alive, and keep the
    /// returned handle's view of it current across moving collections.
    pub fn add_root<T: Collectable>(&mut self, cell: Gc<T>) -> RootHandle<T> {
        RootHandle {
            index: self.persistent_roots.add(cell.as_cell()),
            marker: PhantomData,
        }
    }

    /// The current address of a rooted cell.
    pub fn root<T: Collectable>(&self, handle: &RootHandle<T>) -> Gc<T> {
        let cell = self.persistent_roots.get(handle.index);
        assert!(!cell.is_null(), "root read after removal");
        Gc::from_cell(NonNull::new(cell).unwrap())
    }

    pub fn remove_root<T: Collectable>(&mut self, handle: RootHandle<T>) {
        self.persistent_roots.remove(handle.index);
    }

    // ---------------------------------------------------------------
    // OOM
    // ---------------------------------------------------------------

    /// Fatal exit. Builds a diagnostic report, hands it to the crash sink,
    /// and aborts: a heap that cannot allocate is not allowed to limp on
    /// into corruption.
    #[cold]
    pub fn oom(&mut self, code: OomError) -> ! {
        // The context may still be claimed when the fast path escalates
        // straight to a fatal error; the stats below need it yielded.
        self.yield_alloc_context();
        let message = format!(
            "used={} size={} segments={} maxHeap={} youngGCs={} fullGCs={} consecFullGCs={}",
            formatted_size(self.used_direct()),
            formatted_size(self.size_direct()),
            self.segment_index.len(),
            formatted_size(self.generation_sizes.old.max()),
            self.young_collections,
            self.full_collections,
            self.consec_full_gcs,
        );
        let report = OomReport {
            code,
            message,
            backtrace: backtrace::Backtrace::new(),
        };
        self.crash_mgr.report_oom(&report);
        eprintln!("[gc] fatal out of memory ({:?}): {}", report.code, report.message);
        std::process::abort()
    }
}

/// Root acceptor for the full collector's initial mark: set bits, push
/// nothing (the closure scan finds marked cells), and mark traced weak
/// slots reachable.
struct MarkRootsAcceptor;

impl Visitor for MarkRootsAcceptor {
    fn visit_pointer(&mut self, slot: *mut *mut GCCell) {
        let cell = unsafe { *slot };
        if !cell.is_null() {
            AlignedHeapSegment::set_cell_mark_bit(cell);
        }
    }

    fn visit_weak_slot(&mut self, slot: *mut WeakRefSlot) {
        unsafe {
            (*slot).mark();
        }
    }
}

/// Acceptor for the update-references phase: rewrite every non-null slot
/// through its referent's forwarding pointer.
struct UpdateAcceptor;

impl Visitor for UpdateAcceptor {
    fn visit_pointer(&mut self, slot: *mut *mut GCCell) {
        unsafe {
            let cell = *slot;
            if !cell.is_null() {
                *slot = (*cell).forwarding_pointer();
            }
        }
    }

    fn visit_weak_slot(&mut self, _slot: *mut WeakRefSlot) {
        // Weak slots are rewritten by update_weak_references.
    }
}
