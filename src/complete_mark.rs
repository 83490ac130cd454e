use crate::api::Visitor;
use crate::cell::GCCell;
use crate::globals::MARK_STACK_LIMIT;
use crate::kind_table;
use crate::segment::AlignedHeapSegment;
use crate::weak_ref::WeakRefSlot;

use std::ptr::null_mut;

/// Cells at or above this size go on the variable-size stack; the split
/// keeps bursts of small-cell pushes from evicting the occasional large
/// scan target and vice versa.
const VAR_SIZED_CELL_THRESHOLD: usize = 128;

/// Book-keeping for the full collector's transitive closure: two bounded
/// mark stacks, the overflow flag that triggers a whole-heap rescan, and
/// the side list of reachable weak maps awaiting the key-reachability
/// passes.
pub struct CompleteMarkState {
    fixed_stack: Vec<*mut GCCell>,
    var_stack: Vec<*mut GCCell>,
    /// Set instead of losing a cell when a stack is at capacity. The mark
    /// phase must restart its heap scan (in segment address order) until a
    /// pass completes with this flag clear; each pass only has to find
    /// still-unmarked reachable cells, a strictly shrinking set, so the
    /// loop terminates.
    pub mark_stack_overflow: bool,
    /// The linear scan's progress through the current segment. Referents at
    /// lower addresses have already been passed and must be pushed;
    /// referents ahead will be reached by the scan itself, so marking their
    /// bit suffices.
    pub current_par_pointer: *mut GCCell,
    /// Weak-map cells diverted out of normal tracing; see
    /// `GenGC::complete_weak_map_marking`.
    pub reachable_weak_maps: Vec<*mut GCCell>,
}

impl CompleteMarkState {
    pub fn new() -> Self {
        Self {
            fixed_stack: Vec::new(),
            var_stack: Vec::new(),
            mark_stack_overflow: false,
            current_par_pointer: null_mut(),
            reachable_weak_maps: Vec::new(),
        }
    }

    /// Queue a marked cell for scanning, diverting weak maps to the side
    /// list. Sets the overflow flag instead of growing past the stack
    /// limit.
    pub fn push_cell(&mut self, cell: *mut GCCell) {
        let (kind, size) = unsafe { ((*cell).kind(), (*cell).size()) };
        if kind_table::is_weak_map_kind(kind) {
            self.reachable_weak_maps.push(cell);
            return;
        }
        let stack = if size >= VAR_SIZED_CELL_THRESHOLD {
            &mut self.var_stack
        } else {
            &mut self.fixed_stack
        };
        if stack.len() >= MARK_STACK_LIMIT {
            self.mark_stack_overflow = true;
            return;
        }
        stack.push(cell);
    }

    fn pop_cell(&mut self) -> Option<*mut GCCell> {
        self.var_stack.pop().or_else(|| self.fixed_stack.pop())
    }

    /// Pop and scan until both stacks are empty.
    pub fn drain_mark_stack(&mut self) {
        while let Some(cell) = self.pop_cell() {
            let kind = unsafe { (*cell).kind() };
            let mut acceptor = MarkTransitiveAcceptor { state: self };
            kind_table::trace_cell_with_kind(cell, kind, &mut acceptor);
        }
    }

    /// Forget everything from the previous collection.
    pub fn reset(&mut self) {
        self.fixed_stack.clear();
        self.var_stack.clear();
        self.mark_stack_overflow = false;
        self.current_par_pointer = null_mut();
        self.reachable_weak_maps.clear();
    }
}

/// The closure acceptor: marks unmarked referents, pushing only the ones
/// the segment scan has already passed.
pub(crate) struct MarkTransitiveAcceptor<'a> {
    pub state: &'a mut CompleteMarkState,
}

impl<'a> Visitor for MarkTransitiveAcceptor<'a> {
    fn visit_pointer(&mut self, slot: *mut *mut GCCell) {
        let cell = unsafe { *slot };
        if cell.is_null() {
            return;
        }
        if !AlignedHeapSegment::get_cell_mark_bit(cell) {
            AlignedHeapSegment::set_cell_mark_bit(cell);
            // Referents ahead of the cursor are left for the linear scan,
            // which pushes (or diverts) them when it reaches their bit.
            if cell < self.state.current_par_pointer {
                self.state.push_cell(cell);
            }
        }
    }

    fn visit_weak_slot(&mut self, slot: *mut WeakRefSlot) {
        unsafe {
            (*slot).mark();
        }
    }
}

/// Scan one segment for marked cells and complete the closure from each,
/// per the restart-on-overflow protocol: marking from the roots has set
/// some bits, the stacks are empty, and every marked cell found is pushed
/// and drained in turn.
pub(crate) fn complete_marking_in_segment(
    segment: &AlignedHeapSegment,
    state: &mut CompleteMarkState,
) {
    let mut ptr = segment.start();
    let level = segment.level();

    while (ptr as usize) < level as usize {
        let cell = ptr as *mut GCCell;
        let size = unsafe { (*cell).size() };
        if AlignedHeapSegment::get_cell_mark_bit(cell) {
            state.current_par_pointer = cell;
            // A weak map noticed here (rather than through a slot) still
            // needs diverting; push_cell handles both stacks and the
            // diversion.
            state.push_cell(cell);
            state.drain_mark_stack();
            if state.mark_stack_overflow {
                return;
            }
        }
        ptr = (ptr as usize + size) as *mut u8;
    }
}
