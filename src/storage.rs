use crate::globals::*;
use crate::mmap::Mmap;
use crate::util::{align_down, is_aligned};

use std::fmt;

/// Why a storage request could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// The OS refused to reserve the region.
    ReserveFailed,
    /// The provider refuses to hand out more regions.
    ProviderExhausted,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ReserveFailed => write!(f, "virtual memory reservation failed"),
            StorageError::ProviderExhausted => write!(f, "storage provider exhausted"),
        }
    }
}

/// Source of [`AlignedStorage`] regions. Generations pull fresh storage from
/// a provider when they grow and hand it back when they shrink, so a
/// provider can cap or pool the segments of one heap.
pub trait StorageProvider {
    fn new_storage(&mut self, name: &'static str) -> Result<AlignedStorage, StorageError>;

    /// `storage` is dropped after this returns; the hook exists so pooling
    /// providers can observe the release.
    fn storage_released(&mut self, _storage: &AlignedStorage) {}
}

/// Provider that asks the OS for every region and imposes no cap beyond the
/// address space itself.
#[derive(Default)]
pub struct VMStorageProvider {
    reserved: usize,
}

impl VMStorageProvider {
    pub fn new() -> Self {
        Self { reserved: 0 }
    }

    /// Total bytes of storage currently handed out.
    pub fn reserved(&self) -> usize {
        self.reserved
    }
}

impl StorageProvider for VMStorageProvider {
    fn new_storage(&mut self, name: &'static str) -> Result<AlignedStorage, StorageError> {
        let storage = AlignedStorage::create(name)?;
        self.reserved += SEGMENT_SIZE;
        Ok(storage)
    }

    fn storage_released(&mut self, _storage: &AlignedStorage) {
        self.reserved -= SEGMENT_SIZE;
    }
}

/// A contiguous, fixed-size virtual memory region whose low address is
/// aligned to its own size ([`SEGMENT_SIZE`]). The alignment invariant is
/// what makes [`AlignedStorage::start`] a single mask instruction, and every
/// per-segment metadata lookup hangs off that.
///
/// The region is carved out of an over-reserved mapping: we ask the OS for
/// `SEGMENT_SIZE` extra bytes and take the aligned span inside it. The whole
/// mapping is returned to the OS when the storage is dropped.
pub struct AlignedStorage {
    map: Mmap,
    low_lim: *mut u8,
    name: &'static str,
}

impl AlignedStorage {
    /// Given any pointer into some live storage's region, the region's low
    /// address.
    #[inline(always)]
    pub fn start(ptr: *const u8) -> *mut u8 {
        align_down(ptr as usize, SEGMENT_SIZE) as *mut u8
    }

    /// Given any pointer into some live storage's region, the region's end.
    #[inline(always)]
    pub fn end(ptr: *const u8) -> *mut u8 {
        (Self::start(ptr) as usize + SEGMENT_SIZE) as *mut u8
    }

    /// Whether `a` and `b` lie in the same storage region.
    #[inline(always)]
    pub fn contained_in_same(a: *const u8, b: *const u8) -> bool {
        Self::start(a) == Self::start(b)
    }

    /// The fixed size of every storage region.
    #[inline(always)]
    pub const fn size() -> usize {
        SEGMENT_SIZE
    }

    pub fn create(name: &'static str) -> Result<Self, StorageError> {
        let map = Mmap::new(SEGMENT_SIZE + SEGMENT_SIZE).ok_or(StorageError::ReserveFailed)?;
        let low_lim = map.aligned(SEGMENT_SIZE);
        debug_assert!(is_aligned(low_lim as usize, SEGMENT_SIZE));
        Ok(Self { map, low_lim, name })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn low_lim(&self) -> *mut u8 {
        self.low_lim
    }

    pub fn hi_lim(&self) -> *mut u8 {
        unsafe { self.low_lim.add(SEGMENT_SIZE) }
    }

    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        Self::start(ptr) == self.low_lim
    }

    /// Advise the OS that `[from, to)` (page-aligned) is not needed; the
    /// pages stay mapped and will refault as zeroes.
    pub fn mark_unused(&self, from: *mut u8, to: *mut u8) {
        debug_assert!(is_aligned(from as usize, PAGE_SIZE));
        debug_assert!(from <= to && self.contains(from) && to as usize <= self.hi_lim() as usize);
        self.map.dontneed(from, to as usize - from as usize);
    }

    /// Hint that `[from, to)` will be used soon.
    pub fn mark_used(&self, from: *mut u8, to: *mut u8) {
        debug_assert!(from <= to);
        self.map.commit(from, to as usize - from as usize);
    }

    /// Make `[from, to)` fault on any access.
    pub fn protect(&self, from: *mut u8, to: *mut u8) {
        debug_assert!(is_aligned(from as usize, PAGE_SIZE));
        self.map.protect_none(from, to as usize - from as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_is_self_aligned() {
        let storage = AlignedStorage::create("test-segment").unwrap();
        let low = storage.low_lim() as usize;
        assert!(is_aligned(low, SEGMENT_SIZE));
        // Any interior pointer masks back to the base.
        let interior = (low + SEGMENT_SIZE / 2) as *const u8;
        assert_eq!(AlignedStorage::start(interior), storage.low_lim());
        assert!(storage.contains(interior));
        assert!(!storage.contains((low + SEGMENT_SIZE) as *const u8));
    }

    #[test]
    fn provider_tracks_reservations() {
        let mut provider = VMStorageProvider::new();
        let a = provider.new_storage("a").unwrap();
        let b = provider.new_storage("b").unwrap();
        assert_eq!(provider.reserved(), 2 * SEGMENT_SIZE);
        provider.storage_released(&a);
        drop(a);
        provider.storage_released(&b);
        drop(b);
        assert_eq!(provider.reserved(), 0);
    }
}
