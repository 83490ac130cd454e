use crate::cell::GCCell;
use crate::globals::*;
use crate::util::{align_down, is_aligned};

use atomic::Ordering;

pub const CARD_CLEAN: u8 = 0;
pub const CARD_DIRTY: u8 = 1;

/// Remembered set for one segment: a status byte per 512-byte card, dirtied
/// by write barriers and consumed by the young-generation collector, plus a
/// parallel "crossing object" table that answers `first_obj_for_card` in
/// O(log(object size / card size)).
///
/// The table lives at the very start of its segment's storage, so `self`'s
/// own address determines the covered range; there is no base pointer field.
///
/// Boundary byte encoding: a non-negative byte `k` means the object covering
/// this card's start begins `k` heap-alignment units before the card start.
/// A negative byte `v` means "jump back `2^(-v-1)` cards and retry"; the
/// jumps shrink geometrically, so the search is logarithmic in the object's
/// span.
#[repr(C)]
pub struct CardTable {
    status: [u8; CARDS_PER_SEGMENT],
    boundaries: [i8; CARDS_PER_SEGMENT],
}

/// Cursor over the card boundaries of a segment, tracking the next card
/// start that has no crossing-object entry yet. Owned by the generation
/// allocating into the segment and advanced on every allocation that
/// crosses into a new card.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Boundary {
    index: usize,
    address: usize,
}

impl Boundary {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn address(&self) -> usize {
        self.address
    }

    #[inline]
    fn bump(&mut self) {
        self.index += 1;
        self.address += CARD_SIZE;
    }
}

#[inline(always)]
fn encode_exp(exp: u32) -> i8 {
    // The largest jump a segment can ever need is back across all of its
    // cards, which is covered by exponents well inside i8 range.
    debug_assert!(exp < 127, "boundary exponent out of encoding range");
    -(exp as i8) - 1
}

#[inline(always)]
fn decode_exp(value: i8) -> u32 {
    debug_assert!(value < 0);
    (-1 - value) as u32
}

impl CardTable {
    #[inline(always)]
    fn base(&self) -> usize {
        let base = align_down(self as *const Self as usize, SEGMENT_SIZE);
        debug_assert_eq!(base, self as *const Self as usize);
        base
    }

    /// Index of the card covering `addr`.
    ///
    /// `addr` must lie within this table's segment (callers establish this
    /// via `AlignedHeapSegment::card_table_covering`), or be at most one
    /// card past its end, which the range scans use as an exclusive bound.
    #[inline]
    pub fn address_to_index(&self, addr: *const u8) -> usize {
        let addr = addr as usize;
        let base = self.base();
        debug_assert!(
            addr >= base && addr < base + SEGMENT_SIZE + CARD_SIZE,
            "address not covered by this card table"
        );
        (addr - base) >> LOG_CARD_SIZE
    }

    #[inline]
    pub fn index_to_address(&self, index: usize) -> *const u8 {
        debug_assert!(index <= CARDS_PER_SEGMENT);
        (self.base() + (index << LOG_CARD_SIZE)) as *const u8
    }

    #[inline(always)]
    fn status_at(&self, index: usize) -> &core::sync::atomic::AtomicU8 {
        as_atomic!(&self.status[index]; AtomicU8)
    }

    /// Dirty the card containing `addr`. Relaxed store: within one
    /// collection pause there is a single writer per card table, and the
    /// background compaction configuration reads with matching atomics.
    #[inline]
    pub fn dirty_card_for_address(&self, addr: *const u8) {
        let index = self.address_to_index(addr);
        self.status_at(index).store(CARD_DIRTY, Ordering::Relaxed);
    }

    /// Dirty all cards intersecting `[from, to)`.
    pub fn dirty_cards_for_address_range(&self, from: *const u8, to: *const u8) {
        debug_assert!((from as usize) < to as usize);
        let from = self.address_to_index(from);
        let to = self.address_to_index(unsafe { to.sub(1) });
        for index in from..=to {
            self.status_at(index).store(CARD_DIRTY, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn is_card_for_address_dirty(&self, addr: *const u8) -> bool {
        self.is_card_for_index_dirty(self.address_to_index(addr))
    }

    #[inline]
    pub fn is_card_for_index_dirty(&self, index: usize) -> bool {
        debug_assert!(index < CARDS_PER_SEGMENT);
        self.status_at(index).load(Ordering::Relaxed) == CARD_DIRTY
    }

    /// First dirty card in `[from, to)`, if any.
    pub fn find_next_dirty_card(&self, from: usize, to: usize) -> Option<usize> {
        debug_assert!(to <= CARDS_PER_SEGMENT);
        (from..to).find(|&i| self.status[i] != CARD_CLEAN)
    }

    /// First clean card in `[from, to)`, if any.
    pub fn find_next_clean_card(&self, from: usize, to: usize) -> Option<usize> {
        debug_assert!(to <= CARDS_PER_SEGMENT);
        (from..to).find(|&i| self.status[i] == CARD_CLEAN)
    }

    /// Reset every card to clean.
    pub fn clear(&self) {
        let ptr = self.status.as_ptr() as *mut u8;
        unsafe {
            core::ptr::write_bytes(ptr, CARD_CLEAN, CARDS_PER_SEGMENT);
        }
    }

    /// Conservative post-compaction reset: every card covering live data in
    /// `[start, level)` becomes dirty (compaction moved old-gen objects that
    /// may reference surviving young-gen objects), and the rest clean.
    pub fn update_after_compaction(&self, start: *const u8, level: *const u8) {
        self.clear();
        if (start as usize) < level as usize {
            self.dirty_cards_for_address_range(start, level);
        }
    }

    /// Cursor positioned at the first card start at or after `level`.
    pub fn next_boundary(&self, level: *const u8) -> Boundary {
        let base = self.base();
        let address = crate::util::align_up(level as usize, CARD_SIZE);
        debug_assert!(address >= base);
        Boundary {
            index: (address - base) >> LOG_CARD_SIZE,
            address,
        }
    }

    /// Record the object `[start, end)` as the crossing object of every card
    /// boundary it spans, starting from `boundary` (which must not have
    /// advanced past `start`'s card). Advances the cursor past `end`.
    pub fn update_boundaries(&self, boundary: &mut Boundary, start: *const u8, end: *const u8) {
        let start = start as usize;
        let end = end as usize;
        debug_assert!(AlignedStorageCovers::covers(self.base(), start));
        debug_assert!(
            boundary.address >= start && boundary.address - start < CARD_SIZE,
            "boundary cursor out of sync with allocation frontier"
        );

        let first_crossed = boundary.index;
        let table = self.boundaries.as_ptr() as *mut i8;
        while boundary.address < end {
            let offset_units = (boundary.address - start) >> LOG_HEAP_ALIGN;
            let byte = if offset_units <= i8::MAX as usize {
                offset_units as i8
            } else {
                // Too far from the object start for a direct offset; record
                // the largest power-of-two jump that stays within this
                // object's run of cards.
                let gap = boundary.index - first_crossed;
                encode_exp(usize::BITS - 1 - gap.leading_zeros())
            };
            unsafe {
                table.add(boundary.index).write(byte);
            }
            boundary.bump();
        }
    }

    /// The object whose extent covers the start of card `index`.
    ///
    /// Callers must have established that the card's start lies within some
    /// live object whose boundaries were recorded.
    pub fn first_obj_for_card(&self, index: usize) -> *mut GCCell {
        debug_assert!(index < CARDS_PER_SEGMENT);
        let mut i = index;
        loop {
            let b = self.boundaries[i];
            if b >= 0 {
                let addr = self.index_to_address(i) as usize - ((b as usize) << LOG_HEAP_ALIGN);
                debug_assert!(is_aligned(addr, HEAP_ALIGN));
                return addr as *mut GCCell;
            }
            let jump = 1usize << decode_exp(b);
            debug_assert!(jump <= i, "boundary jump escapes the card table");
            i -= jump;
        }
    }

    /// Raw boundary byte, for diagnostics.
    pub fn boundary_value(&self, index: usize) -> i8 {
        self.boundaries[index]
    }
}

/// Tiny helper so the debug assertion above reads as a sentence.
struct AlignedStorageCovers;
impl AlignedStorageCovers {
    #[inline(always)]
    fn covers(base: usize, addr: usize) -> bool {
        align_down(addr, SEGMENT_SIZE) == base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AlignedStorage;

    fn table_on(storage: &AlignedStorage) -> &'static CardTable {
        unsafe { &*(storage.low_lim() as *const CardTable) }
    }

    #[test]
    fn dirty_and_scan() {
        let storage = AlignedStorage::create("card-test").unwrap();
        let table = table_on(&storage);
        table.clear();

        let base = storage.low_lim() as usize;
        let addr = (base + 100 * CARD_SIZE + 17) as *const u8;
        assert!(!table.is_card_for_address_dirty(addr));
        table.dirty_card_for_address(addr);
        assert!(table.is_card_for_address_dirty(addr));

        assert_eq!(table.find_next_dirty_card(0, CARDS_PER_SEGMENT), Some(100));
        assert_eq!(table.find_next_clean_card(100, CARDS_PER_SEGMENT), Some(101));
        table.clear();
        assert_eq!(table.find_next_dirty_card(0, CARDS_PER_SEGMENT), None);
    }

    #[test]
    fn range_dirtying_touches_every_card() {
        let storage = AlignedStorage::create("card-test").unwrap();
        let table = table_on(&storage);
        table.clear();

        let base = storage.low_lim() as usize;
        let from = (base + 3 * CARD_SIZE + 8) as *const u8;
        let to = (base + 6 * CARD_SIZE + 8) as *const u8;
        table.dirty_cards_for_address_range(from, to);
        for i in 3..=6 {
            assert!(table.is_card_for_index_dirty(i));
        }
        assert!(!table.is_card_for_index_dirty(2));
        assert!(!table.is_card_for_index_dirty(7));
    }

    #[test]
    fn boundaries_resolve_small_objects() {
        let storage = AlignedStorage::create("card-test").unwrap();
        let table = table_on(&storage);

        // Lay out three objects starting mid-card, each crossing one or two
        // boundaries.
        let base = storage.low_lim() as usize;
        let start = base + 64 * CARD_SIZE + 256;
        let mut cursor = table.next_boundary(start as *const u8);

        let a = start; // 1024 bytes: crosses cards 65 and 66
        let b = a + 1024; // 512 bytes: crosses card 67
        let c = b + 512; // 512 bytes: crosses card 68
        table.update_boundaries(&mut cursor, a as *const u8, b as *const u8);
        table.update_boundaries(&mut cursor, b as *const u8, c as *const u8);
        table.update_boundaries(&mut cursor, c as *const u8, (c + 512) as *const u8);

        for card in 65..=66 {
            assert_eq!(table.first_obj_for_card(card) as usize, a);
        }
        assert_eq!(table.first_obj_for_card(67) as usize, b);
        assert_eq!(table.first_obj_for_card(68) as usize, c);
    }

    #[test]
    fn boundaries_resolve_a_huge_object() {
        let storage = AlignedStorage::create("card-test").unwrap();
        let table = table_on(&storage);

        // One object spanning 600 cards; every covered card must walk back
        // to the true start in a bounded number of hops.
        let base = storage.low_lim() as usize;
        let start = base + 10 * CARD_SIZE + 64;
        let span = 600 * CARD_SIZE;
        let mut cursor = table.next_boundary(start as *const u8);
        table.update_boundaries(&mut cursor, start as *const u8, (start + span) as *const u8);

        for card in (11..600).step_by(37) {
            assert_eq!(table.first_obj_for_card(card) as usize, start);
        }
        assert_eq!(table.first_obj_for_card(11 + 599) as usize, start);
    }
}
