use crate::globals::*;
use crate::util::*;

use std::mem::size_of;

/// Index into the global kind table; derives the trace and finalize
/// procedures for a cell. See [`crate::kind_table`].
pub type CellKind = u16;

/// Kind reserved for the placeholder cells that sweep writes over runs of
/// dead objects, so later traversals skip a whole run in one step.
pub const KIND_DEAD_REGION: CellKind = 0;

/// Smallest kind index the kind table hands out; everything below is a
/// sentinel.
pub const KIND_FIRST_USER: CellKind = 1;

pub const CELL_HEADER_SIZE: usize = size_of::<GCCell>();

/// The largest single allocation: a cell must fit in one segment's
/// allocation region.
pub const MAX_CELL_SIZE: usize = SEGMENT_SIZE;

// The cell header is a single word with two mutually exclusive layouts,
// selected by bit 62:
//
// +--------------+------+----------------------------------------------+
// | field        | bits |                                              |
// +--------------+------+----------------------------------------------+
// | kind         |   16 | Index into the kind table.                   |
// | size         |   32 | Allocated size in heap-alignment units.      |
// | unused       |   14 |                                              |
// +--------------+------+----------------------------------------------+
// or, while a collection has installed a forwarding pointer:
// +--------------+------+----------------------------------------------+
// | fwd address  |   48 | The cell's post-copy address.                |
// | unused       |   14 |                                              |
// | forwarded    |    1 | Discriminant for the two layouts.            |
// | unused       |    1 |                                              |
// +--------------+------+----------------------------------------------+
//
// The kind and size are unrecoverable from a forwarded header; collections
// that need them afterwards (the full collector's update/compact phases)
// displace the whole word into a side array first. The accessors assert the
// discriminant so a phase ordering mistake trips immediately in debug
// builds instead of reading a forwarding address as type information.
#[repr(C)]
pub struct GCCell {
    header: u64,
}

impl GCCell {
    #[inline(always)]
    pub fn make_header(kind: CellKind, size: usize) -> u64 {
        debug_assert!(is_aligned(size, HEAP_ALIGN));
        debug_assert!(size >= CELL_HEADER_SIZE && size <= MAX_CELL_SIZE);
        let word = KindBitField::encode(kind as u64);
        SizeBitField::update(word, (size >> LOG_HEAP_ALIGN) as u64)
    }

    /// Initialize the header in place. `at` must point to `size` bytes of
    /// fresh allocation.
    #[inline(always)]
    pub unsafe fn write_new(at: *mut u8, kind: CellKind, size: usize) -> *mut GCCell {
        let cell = at as *mut GCCell;
        (*cell).header = Self::make_header(kind, size);
        cell
    }

    #[inline(always)]
    pub fn header_word(&self) -> u64 {
        self.header
    }

    #[inline(always)]
    pub fn set_header_word(&mut self, word: u64) {
        self.header = word;
    }

    #[inline(always)]
    pub fn is_forwarded(&self) -> bool {
        ForwardedBit::decode(self.header) != 0
    }

    #[inline(always)]
    pub fn kind(&self) -> CellKind {
        debug_assert!(!self.is_forwarded(), "kind read from a forwarded cell");
        KindBitField::decode(self.header) as CellKind
    }

    /// Allocated size in bytes, including the header.
    #[inline(always)]
    pub fn size(&self) -> usize {
        debug_assert!(!self.is_forwarded(), "size read from a forwarded cell");
        (SizeBitField::decode(self.header) as usize) << LOG_HEAP_ALIGN
    }

    #[inline(always)]
    pub fn set_size(&mut self, size: usize) {
        debug_assert!(!self.is_forwarded());
        debug_assert!(is_aligned(size, HEAP_ALIGN));
        self.header = SizeBitField::update(self.header, (size >> LOG_HEAP_ALIGN) as u64);
    }

    #[inline(always)]
    pub fn is_dead_region(&self) -> bool {
        !self.is_forwarded() && self.kind() == KIND_DEAD_REGION
    }

    /// Replace the header with a forwarding pointer to `target`. The kind
    /// and size are destroyed; callers displace the header word first if
    /// they will need it again.
    #[inline(always)]
    pub fn set_forwarding_pointer(&mut self, target: *mut GCCell) {
        debug_assert!(is_aligned(target as usize, HEAP_ALIGN));
        debug_assert!(
            (target as u64) & !FwdPtrBitField::MASK == 0,
            "forwarding target does not fit the pointer field"
        );
        let word = FwdPtrBitField::encode(target as u64);
        self.header = ForwardedBit::update(word, 1);
    }

    #[inline(always)]
    pub fn forwarding_pointer(&self) -> *mut GCCell {
        debug_assert!(self.is_forwarded(), "no forwarding pointer installed");
        FwdPtrBitField::decode(self.header) as *mut GCCell
    }

    /// First byte of the payload.
    #[inline(always)]
    pub fn data(&self) -> *mut u8 {
        (self as *const Self as usize + CELL_HEADER_SIZE) as *mut u8
    }

    /// The cell immediately after this one in its segment.
    #[inline(always)]
    pub fn next_cell(&self) -> *mut GCCell {
        (self as *const Self as usize + self.size()) as *mut GCCell
    }

    /// Recover the cell from a payload pointer.
    #[inline(always)]
    pub unsafe fn from_data(data: *const u8) -> *mut GCCell {
        (data as usize - CELL_HEADER_SIZE) as *mut GCCell
    }
}

/// Stamp a dead-region placeholder over `[at, at + size)`.
#[inline]
pub unsafe fn write_dead_region(at: *mut u8, size: usize) {
    debug_assert!(is_aligned(size, HEAP_ALIGN) && size >= CELL_HEADER_SIZE);
    GCCell::write_new(at, KIND_DEAD_REGION, size);
}

/// Helpers for decoding a displaced header word without a cell to hang it
/// on.
pub mod displaced {
    use super::*;

    #[inline(always)]
    pub fn kind(word: u64) -> CellKind {
        debug_assert_eq!(ForwardedBit::decode(word), 0);
        KindBitField::decode(word) as CellKind
    }

    #[inline(always)]
    pub fn size(word: u64) -> usize {
        debug_assert_eq!(ForwardedBit::decode(word), 0);
        (SizeBitField::decode(word) as usize) << LOG_HEAP_ALIGN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layouts_are_disjoint() {
        let mut backing = [0u64; 4];
        let cell = unsafe { GCCell::write_new(backing.as_mut_ptr() as *mut u8, 7, 24) };
        unsafe {
            assert_eq!((*cell).kind(), 7);
            assert_eq!((*cell).size(), 24);
            assert!(!(*cell).is_forwarded());

            let word = (*cell).header_word();
            let target = 0x7f00_1234_5678usize as *mut GCCell;
            (*cell).set_forwarding_pointer(target);
            assert!((*cell).is_forwarded());
            assert_eq!((*cell).forwarding_pointer(), target);

            (*cell).set_header_word(word);
            assert_eq!((*cell).kind(), 7);
            assert_eq!((*cell).size(), 24);
        }
    }

    #[test]
    fn dead_region_spans_its_run() {
        let mut backing = [0u64; 8];
        unsafe {
            write_dead_region(backing.as_mut_ptr() as *mut u8, 64);
            let cell = backing.as_ptr() as *const GCCell;
            assert!((*cell).is_dead_region());
            assert_eq!((*cell).size(), 64);
            assert_eq!((*cell).next_cell() as usize, cell as usize + 64);
        }
    }
}
