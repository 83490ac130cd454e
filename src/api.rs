use crate::cell::{CellKind, GCCell};
use crate::weak_ref::{WeakRefSlot, WeakState};

use std::{
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

/// Acceptor handed to tracing code. Collections implement this to evacuate,
/// mark, or rewrite the slots they are shown.
pub trait Visitor {
    /// Visit a slot holding a (possibly null) strong pointer to a heap
    /// cell. The collection may overwrite the slot.
    fn visit_pointer(&mut self, slot: *mut *mut GCCell);

    /// Visit a weak reference slot owned by the collector. Slots do not
    /// move, so only the slot itself is reported.
    fn visit_weak_slot(&mut self, _slot: *mut WeakRefSlot) {}
}

/// Types stored on the GC heap report their outgoing pointers here.
///
/// # Safety
///
/// Every field that can hold a heap pointer must be reported on every call;
/// a missed field is unreachable to the collector and will dangle after the
/// next collection.
pub unsafe trait Trace {
    fn trace(&mut self, _vis: &mut dyn Visitor) {}
}

/// A type that can be allocated in the GC heap.
pub trait Collectable: Trace + 'static {
    /// Payload size of this value. The default covers fixed-size types;
    /// types with trailing variable storage override it.
    fn allocation_size(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

/// Typed handle to a heap cell.
///
/// Handles are plain copies of the cell address; they are only kept up to
/// date across collections while reachable from a root (see
/// `GenGC::add_root`) or from a traced field of another live object.
#[repr(transparent)]
pub struct Gc<T: Collectable + ?Sized> {
    pub(crate) base: NonNull<GCCell>,
    pub(crate) marker: PhantomData<T>,
}

impl<T: Collectable + ?Sized> Gc<T> {
    pub(crate) fn from_cell(cell: NonNull<GCCell>) -> Self {
        Self {
            base: cell,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_cell(&self) -> *mut GCCell {
        self.base.as_ptr()
    }

    /// The cell's kind index, as registered in the kind table.
    #[inline]
    pub fn kind(&self) -> CellKind {
        unsafe { (*self.base.as_ptr()).kind() }
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Gc<T>) -> bool {
        self.base == other.base
    }
}

impl<T: Collectable + ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Collectable + ?Sized> Copy for Gc<T> {}

impl<T: Collectable + Sized> Deref for Gc<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*((*self.base.as_ptr()).data() as *const T) }
    }
}

impl<T: Collectable + Sized> DerefMut for Gc<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *((*self.base.as_ptr()).data() as *mut T) }
    }
}

impl<T: Collectable + ?Sized> std::fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.base)
    }
}

unsafe impl<T: Collectable + ?Sized> Trace for Gc<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        // Gc is transparent over the cell pointer, so the handle itself is
        // the slot.
        vis.visit_pointer(&mut self.base as *mut NonNull<GCCell> as *mut *mut GCCell);
    }
}

unsafe impl<T: Collectable + ?Sized> Trace for Option<Gc<T>> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        // The niche layout makes Option<Gc<T>> a nullable cell pointer.
        vis.visit_pointer(self as *mut Option<Gc<T>> as *mut *mut GCCell);
    }
}

/// Weak handle: points at a collector-owned slot, not at the cell, so a
/// dead referent is observed as a failed [`WeakGc::upgrade`] rather than a
/// dangling pointer.
#[repr(transparent)]
pub struct WeakGc<T: Collectable> {
    pub(crate) slot: NonNull<WeakRefSlot>,
    pub(crate) marker: PhantomData<T>,
}

impl<T: Collectable> WeakGc<T> {
    /// The referent, if it is still alive.
    pub fn upgrade(&self) -> Option<Gc<T>> {
        unsafe {
            let slot = self.slot.as_ref();
            if slot.state() == WeakState::Free || !slot.has_pointer() {
                return None;
            }
            Some(Gc::from_cell(NonNull::new_unchecked(slot.pointer())))
        }
    }
}

impl<T: Collectable> Clone for WeakGc<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Collectable> Copy for WeakGc<T> {}

unsafe impl<T: Collectable> Trace for WeakGc<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        vis.visit_weak_slot(self.slot.as_ptr());
    }
}

/// The embedder's root enumeration, invoked during every mark phase.
///
/// Implementations must visit every root slot exactly once per call; debug
/// builds check for duplicates. `long_lived` is false during young-gen
/// collections, allowing the embedder to skip roots it knows can only
/// reference old objects.
pub trait RootSet {
    fn mark_roots(&mut self, vis: &mut dyn Visitor, long_lived: bool);
}

impl<F: FnMut(&mut dyn Visitor, bool)> RootSet for F {
    fn mark_roots(&mut self, vis: &mut dyn Visitor, long_lived: bool) {
        self(vis, long_lived)
    }
}

macro_rules! impl_prim {
    ($($t: ty)*) => {
        $(
            unsafe impl Trace for $t {}
            impl Collectable for $t {}
        )*
    };
}

impl_prim!(
    u8 u16 u32 u64 u128
    i8 i16 i32 i64 i128
    f32 f64
    bool
    String
);
