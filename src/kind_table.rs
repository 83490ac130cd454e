use crate::api::{Collectable, Visitor};
use crate::cell::{CellKind, GCCell, KIND_DEAD_REGION, KIND_FIRST_USER};

use modular_bitfield::prelude::*;
use parking_lot::Mutex;
use std::{
    any::TypeId,
    collections::HashMap,
    mem::size_of,
    ptr::null_mut,
    sync::atomic::{AtomicU16, Ordering},
};

/// Scans a cell's payload, reporting every pointer slot to the visitor.
pub type TraceCallback = fn(*mut GCCell, &mut dyn Visitor);

/// Runs the cell's destructor. Never invoked twice for one cell.
pub type FinalizeCallback = unsafe fn(*mut GCCell);

/// For weak-map kinds: invoke the closure with every (key, value-slot)
/// pair. See `GenGC`'s weak map marking for the reachability protocol.
pub type WeakEntriesCallback = fn(*mut GCCell, &mut dyn FnMut(*mut GCCell, *mut *mut GCCell));

#[bitfield(bits = 8)]
#[derive(Clone, Copy)]
pub struct KindFlags {
    weak_map: bool,
    reserved: B7,
}

/// Metadata for one cell kind.
pub struct KindInfo {
    pub trace: TraceCallback,
    pub finalize: Option<FinalizeCallback>,
    pub weak_entries: Option<WeakEntriesCallback>,
    pub flags: KindFlags,
    pub type_id: TypeId,
    pub name: &'static str,
}

pub struct KindTable {
    map: Option<memmap2::MmapMut>,
    table: *mut KindInfo,
    next: AtomicU16,
}

pub(crate) static mut KIND_TABLE: KindTable = KindTable {
    map: None,
    table: null_mut(),
    next: AtomicU16::new(KIND_FIRST_USER),
};

static KIND_REGISTRY: Mutex<Option<HashMap<TypeId, CellKind>>> = parking_lot::const_mutex(None);

impl KindTable {
    /// We assume that 16 bits are enough to represent all cell kinds.
    pub const MAX_KINDS: u16 = u16::MAX;

    pub(crate) unsafe fn init() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| unsafe {
            let mut map =
                memmap2::MmapMut::map_anon(Self::MAX_KINDS as usize * size_of::<KindInfo>())
                    .expect("failed to reserve the kind table");
            KIND_TABLE.table = map.as_mut_ptr() as *mut KindInfo;
            KIND_TABLE.map = Some(map);

            // Index 0: the dead-region placeholder. It has no pointers and
            // no destructor; traversals step over it by size.
            KIND_TABLE.table.add(KIND_DEAD_REGION as usize).write(KindInfo {
                trace: |_, _| {},
                finalize: None,
                weak_entries: None,
                flags: KindFlags::new(),
                type_id: TypeId::of::<()>(),
                name: "dead-region",
            });
        });
    }

    unsafe fn add(&mut self, info: KindInfo) -> CellKind {
        let index = self.next.fetch_add(1, Ordering::AcqRel);
        if index >= Self::MAX_KINDS {
            panic!("kind table exhausted");
        }
        self.table.add(index as usize).write(info);
        index
    }

    #[inline]
    pub unsafe fn get(&self, kind: CellKind) -> &KindInfo {
        debug_assert!(!self.table.is_null(), "kind table not initialized");
        debug_assert!(kind < self.next.load(Ordering::Acquire));
        &*self.table.add(kind as usize)
    }
}

fn trace_erased<T: Collectable>(cell: *mut GCCell, vis: &mut dyn Visitor) {
    unsafe {
        (*((*cell).data() as *mut T)).trace(vis);
    }
}

unsafe fn finalize_erased<T: Collectable>(cell: *mut GCCell) {
    core::ptr::drop_in_place((*cell).data() as *mut T);
}

fn register<T: Collectable>(weak_entries: Option<WeakEntriesCallback>) -> CellKind {
    unsafe {
        KindTable::init();
    }
    let mut guard = KIND_REGISTRY.lock();
    let map = guard.get_or_insert_with(HashMap::new);
    if let Some(&kind) = map.get(&TypeId::of::<T>()) {
        return kind;
    }
    let kind = unsafe {
        KIND_TABLE.add(KindInfo {
            trace: trace_erased::<T>,
            finalize: if std::mem::needs_drop::<T>() {
                Some(finalize_erased::<T> as FinalizeCallback)
            } else {
                None
            },
            weak_entries,
            flags: KindFlags::new().with_weak_map(weak_entries.is_some()),
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        })
    };
    map.insert(TypeId::of::<T>(), kind);
    kind
}

/// The kind index for `T`, registering it on first use.
pub fn kind_index<T: Collectable>() -> CellKind {
    register::<T>(None)
}

/// A heap type whose values must not keep their keys' referents alive: the
/// collector marks an entry's value only once its key is proven reachable
/// through other edges.
///
/// The type's [`Trace`](crate::api::Trace) impl must cover its non-entry
/// storage only; entries are walked through `for_each_entry`.
pub trait WeakMapCollectable: Collectable {
    fn for_each_entry(&mut self, f: &mut dyn FnMut(*mut GCCell, *mut *mut GCCell));
}

fn weak_entries_erased<T: WeakMapCollectable>(
    cell: *mut GCCell,
    f: &mut dyn FnMut(*mut GCCell, *mut *mut GCCell),
) {
    unsafe {
        (*((*cell).data() as *mut T)).for_each_entry(f);
    }
}

/// The kind index for a weak-map type, registering it on first use.
pub fn weak_map_kind_index<T: WeakMapCollectable>() -> CellKind {
    register::<T>(Some(weak_entries_erased::<T> as WeakEntriesCallback))
}

/// Dispatch a cell's registered trace procedure.
#[inline]
pub fn trace_cell(cell: *mut GCCell, vis: &mut dyn Visitor) {
    unsafe {
        let info = KIND_TABLE.get((*cell).kind());
        (info.trace)(cell, vis);
    }
}

/// Dispatch for a cell whose header has been displaced; the kind comes from
/// the side array instead of the (forwarded) header.
#[inline]
pub fn trace_cell_with_kind(cell: *mut GCCell, kind: CellKind, vis: &mut dyn Visitor) {
    unsafe {
        let info = KIND_TABLE.get(kind);
        (info.trace)(cell, vis);
    }
}

/// Whether cells of this kind divert to the weak-map side list during
/// marking.
#[inline]
pub fn is_weak_map_kind(kind: CellKind) -> bool {
    unsafe { KIND_TABLE.get(kind).flags.weak_map() }
}

/// Run the finalizer for `cell`, if its kind has one.
#[inline]
pub unsafe fn finalize_cell(cell: *mut GCCell) {
    let info = KIND_TABLE.get((*cell).kind());
    if let Some(finalize) = info.finalize {
        finalize(cell);
    }
}

/// During the update-references phase of a full collection, rewrite a weak
/// map's entry value slots: values of surviving entries follow their
/// forwarding pointers, values whose mark bit is clear are dropped. Keys
/// are held through weak slots and handled with the rest of the weak
/// reference table.
pub fn update_weak_map_entries_after_sweep(cell: *mut GCCell, kind: CellKind) {
    use crate::segment::AlignedHeapSegment;

    let entries = unsafe {
        KIND_TABLE
            .get(kind)
            .weak_entries
            .expect("weak-map kind without an entries callback")
    };
    entries(cell, &mut |_key, value_slot| unsafe {
        let value = *value_slot;
        if value.is_null() {
            return;
        }
        if AlignedHeapSegment::get_cell_mark_bit(value) {
            *value_slot = (*value).forwarding_pointer();
        } else {
            *value_slot = core::ptr::null_mut();
        }
    });
}
