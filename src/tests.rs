use crate::api::{Collectable, Gc, Trace, Visitor, WeakGc};
use crate::cell::GCCell;
use crate::gen_gc::{GCConfig, GenGC};
use crate::kind_table::{self, WeakMapCollectable};
use crate::segment::AlignedHeapSegment;
use crate::storage::AlignedStorage;

use std::sync::atomic::{AtomicUsize, Ordering};

struct Foo {
    bar: Option<Gc<Bar>>,
}

unsafe impl Trace for Foo {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        self.bar.trace(vis);
    }
}
impl Collectable for Foo {}

struct Bar {
    x: u32,
}

unsafe impl Trace for Bar {}
impl Collectable for Bar {}

fn small_heap() -> Box<GenGC> {
    GenGC::new(GCConfig {
        min_heap: 1024 * 1024,
        init_heap: 2 * 1024 * 1024,
        max_heap: 64 * 1024 * 1024,
        ..Default::default()
    })
}

#[test]
fn young_allocation_and_pointer_queries() {
    let mut gc = small_heap();
    let foo = gc.allocate(Foo { bar: None });

    assert!(gc.is_young(foo));
    assert!(gc.dbg_contains(foo.as_cell() as *const u8));
    assert!(gc.valid_pointer(foo.as_cell() as *const u8));

    // Self-aligned storage: the owning segment is recoverable from any
    // interior pointer by masking.
    let interior = unsafe { (foo.as_cell() as *const u8).add(4) };
    assert_eq!(
        AlignedStorage::start(interior),
        AlignedStorage::start(foo.as_cell() as *const u8)
    );

    let stack_local = 0u8;
    assert!(!gc.dbg_contains(&stack_local as *const u8));
}

#[test]
fn young_collection_round_trip() {
    let mut gc = small_heap();

    // A pile of garbage and one survivor.
    for i in 0..100u32 {
        gc.allocate(Bar { x: i });
    }
    let survivor = gc.allocate(Bar { x: 420 });
    let old_addr = survivor.as_cell();
    let root = gc.add_root(survivor);

    gc.collect_young();

    let survivor = gc.root(&root);
    assert_ne!(survivor.as_cell(), old_addr, "survivor must have moved");
    assert!(!gc.is_young(survivor));
    assert_eq!(survivor.x, 420);

    // The nursery is empty again.
    gc.yield_alloc_context();
    assert_eq!(crate::generation::Generation::used(&gc.young_gen), 0);
    gc.claim_alloc_context();

    gc.remove_root(root);
}

#[test]
fn evacuation_is_idempotent_per_cell() {
    let mut gc = small_heap();
    let cell = gc.allocate(Bar { x: 7 });
    let root_a = gc.add_root(cell);
    let root_b = gc.add_root(cell);

    gc.collect_young();

    // Both slots were forwarded to the same copy: the first visit copies,
    // the second reads the forwarding pointer back.
    let a = gc.root(&root_a);
    let b = gc.root(&root_b);
    assert_eq!(a.as_cell(), b.as_cell());
    assert_eq!(a.x, 7);

    gc.remove_root(root_a);
    gc.remove_root(root_b);
}

#[test]
fn write_barrier_feeds_the_card_table() {
    let mut gc = small_heap();

    let foo = gc.allocate(Foo { bar: None });
    let root = gc.add_root(foo);
    gc.collect_young();
    let mut foo = gc.root(&root);
    assert!(!gc.is_young(foo), "foo must be promoted by now");

    let bar = gc.allocate(Bar { x: 420 });
    assert!(gc.is_young(bar));

    foo.bar = Some(bar);
    let loc = &foo.bar as *const Option<Gc<Bar>> as *const u8;
    gc.write_barrier(loc, bar.as_cell());

    // The store dirtied the card covering the old-gen slot.
    assert!(AlignedHeapSegment::card_table_covering(loc).is_card_for_address_dirty(loc));

    // A young collection treats the dirty card as a root-equivalent
    // source: bar survives and the slot is rewritten.
    gc.collect_young();
    let foo = gc.root(&root);
    let bar = foo.bar.expect("field lost across young collection");
    assert_eq!(bar.x, 420);
    assert!(!gc.is_young(bar));

    gc.remove_root(root);
}

#[test]
fn full_collection_compacts_and_restores_headers() {
    let mut gc = small_heap();

    // Interleave two kinds; drop every Foo, keep every Bar.
    let mut roots = Vec::new();
    for i in 0..50u32 {
        gc.allocate(Foo { bar: None });
        let bar = gc.allocate(Bar { x: i });
        roots.push(gc.add_root(bar));
    }

    gc.collect_full("test");

    let bar_kind = kind_table::kind_index::<Bar>();
    for (i, root) in roots.iter().enumerate() {
        let bar = gc.root(root);
        assert_eq!(bar.kind(), bar_kind, "type tag must be restored after compaction");
        assert_eq!(bar.x, i as u32);
    }

    // Every surviving cell in the heap reports a valid kind.
    let foo_kind = kind_table::kind_index::<Foo>();
    let mut survivors = 0;
    gc.for_all_objs(|cell| unsafe {
        let kind = (*cell).kind();
        assert!(kind == bar_kind || kind == foo_kind);
        assert_eq!(kind, bar_kind, "all Foos were unreachable");
        survivors += 1;
    });
    assert_eq!(survivors, 50);

    for root in roots {
        gc.remove_root(root);
    }
}

#[test]
fn full_collection_preserves_edges() {
    let mut gc = small_heap();

    let bar = gc.allocate(Bar { x: 99 });
    let foo = gc.allocate(Foo { bar: Some(bar) });
    let root = gc.add_root(foo);

    gc.collect_full("test");
    gc.collect_full("test");

    let foo = gc.root(&root);
    assert_eq!(foo.bar.expect("edge lost").x, 99);
    gc.remove_root(root);
}

#[test]
fn weak_refs_clear_when_referent_dies() {
    let mut gc = small_heap();

    let live = gc.allocate(Bar { x: 1 });
    let live_root = gc.add_root(live);
    let live_weak = gc.allocate_weak(live);

    let dead = gc.allocate(Bar { x: 2 });
    let dead_weak = gc.allocate_weak(dead);
    // `dead` is unrooted from here on.

    // Weak handles must be reachable themselves or their slots are freed;
    // keep them alive through a rooted holder.
    struct WeakHolder {
        live: WeakGc<Bar>,
        dead: WeakGc<Bar>,
    }
    unsafe impl Trace for WeakHolder {
        fn trace(&mut self, vis: &mut dyn Visitor) {
            self.live.trace(vis);
            self.dead.trace(vis);
        }
    }
    impl Collectable for WeakHolder {}

    let holder = gc.allocate(WeakHolder {
        live: live_weak,
        dead: dead_weak,
    });
    let holder_root = gc.add_root(holder);

    gc.collect_full("test");

    let holder = gc.root(&holder_root);
    let upgraded = holder.live.upgrade().expect("live referent lost");
    assert_eq!(upgraded.x, 1);
    assert_eq!(upgraded.as_cell(), gc.root(&live_root).as_cell());
    assert!(holder.dead.upgrade().is_none(), "dead referent must clear");

    gc.remove_root(holder_root);
    gc.remove_root(live_root);
}

#[test]
fn weak_refs_track_young_collections() {
    let mut gc = small_heap();

    let target = gc.allocate(Bar { x: 5 });
    let root = gc.add_root(target);
    let weak = gc.allocate_weak(target);

    gc.collect_young();

    let upgraded = weak.upgrade().expect("promoted referent lost");
    assert_eq!(upgraded.as_cell(), gc.root(&root).as_cell());

    gc.remove_root(root);
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

struct Finalizable {
    _payload: u64,
}

impl Drop for Finalizable {
    fn drop(&mut self) {
        FINALIZED.fetch_add(1, Ordering::SeqCst);
    }
}

unsafe impl Trace for Finalizable {}
impl Collectable for Finalizable {}

#[test]
fn finalizers_run_exactly_once_for_the_dead() {
    let mut gc = small_heap();
    FINALIZED.store(0, Ordering::SeqCst);

    let keep = gc.allocate(Finalizable { _payload: 1 });
    let root = gc.add_root(keep);
    for i in 0..10 {
        gc.allocate(Finalizable { _payload: i });
    }

    gc.collect_young();
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 10);

    // The survivor's finalizer entry moved to the old generation; a full
    // collection with the root gone finally runs it.
    gc.remove_root(root);
    gc.collect_full("test");
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 11);
}

#[test]
fn try_allocate_reports_exhaustion() {
    let mut gc = GenGC::new(GCConfig {
        min_heap: 1024 * 1024,
        init_heap: 1024 * 1024,
        max_heap: 1024 * 1024,
        effective_oom_threshold: 0,
        ..Default::default()
    });

    let mut roots = Vec::new();
    let mut allocated = 0usize;
    loop {
        match gc.try_allocate(Bar { x: allocated as u32 }) {
            Ok(cell) => {
                roots.push(gc.add_root(cell));
                allocated += 1;
            }
            Err(_) => break,
        }
        assert!(allocated < 1_000_000, "heap never reported exhaustion");
    }

    // The failure was a clean refusal: everything allocated before it is
    // still intact.
    for (i, root) in roots.iter().enumerate() {
        assert_eq!(gc.root(root).x, i as u32);
    }
}

#[test]
fn long_lived_allocation_before_tti() {
    let mut gc = GenGC::new(GCConfig {
        alloc_in_old_before_tti: true,
        ..Default::default()
    });

    let early = gc.allocate(Bar { x: 1 });
    assert!(!gc.is_young(early), "pre-TTI allocation must go to the old gen");

    gc.tti_reached();

    let late = gc.allocate(Bar { x: 2 });
    assert!(gc.is_young(late), "post-TTI allocation must go to the nursery");

    // The recreated card boundaries support a young collection.
    let root = gc.add_root(late);
    gc.collect_young();
    assert_eq!(gc.root(&root).x, 2);
    gc.remove_root(root);
}

#[test]
fn long_lived_allocation_after_tti() {
    let mut gc = small_heap();
    let cell = gc.allocate_long_lived(Bar { x: 3 });
    assert!(!gc.is_young(cell));

    let root = gc.add_root(cell);
    gc.collect_young();
    assert_eq!(gc.root(&root).x, 3);
    gc.remove_root(root);
}

#[test]
fn external_memory_is_accounted() {
    let mut gc = small_heap();
    let cell = gc.allocate(Bar { x: 0 });
    let root = gc.add_root(cell);

    gc.credit_external_memory(cell.as_cell(), 64 * 1024);
    assert_eq!(gc.heap_info().external_bytes, 64 * 1024);

    gc.debit_external_memory(gc.root(&root).as_cell(), 64 * 1024);
    assert_eq!(gc.heap_info().external_bytes, 0);
    gc.remove_root(root);
}

struct Node {
    tag: u32,
}

unsafe impl Trace for Node {}
impl Collectable for Node {}

struct TestWeakMap {
    entries: Vec<(WeakGc<Node>, Option<Gc<Node>>)>,
}

unsafe impl Trace for TestWeakMap {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        // Keys are weak: only their slots are kept registered. Values are
        // deliberately not traced here; the collector marks them only for
        // entries whose keys prove reachable.
        for (key, _) in self.entries.iter_mut() {
            key.trace(vis);
        }
    }
}
impl Collectable for TestWeakMap {}

impl WeakMapCollectable for TestWeakMap {
    fn for_each_entry(&mut self, f: &mut dyn FnMut(*mut GCCell, *mut *mut GCCell)) {
        for (key, value) in self.entries.iter_mut() {
            let key_cell = match key.upgrade() {
                Some(cell) => cell.as_cell(),
                None => core::ptr::null_mut(),
            };
            f(key_cell, value as *mut Option<Gc<Node>> as *mut *mut GCCell);
        }
    }
}

#[test]
fn weak_map_values_follow_key_reachability() {
    let mut gc = small_heap();

    let live_key = gc.allocate(Node { tag: 1 });
    let live_key_root = gc.add_root(live_key);
    let live_val = gc.allocate(Node { tag: 100 });

    let dead_key = gc.allocate(Node { tag: 2 });
    let dead_val = gc.allocate(Node { tag: 200 });

    let live_weak = gc.allocate_weak(live_key);
    let dead_weak = gc.allocate_weak(dead_key);
    let map = gc.allocate_weak_map(TestWeakMap {
        entries: vec![
            (live_weak, Some(live_val)),
            (dead_weak, Some(dead_val)),
        ],
    });
    let map_root = gc.add_root(map);
    // dead_key and both values are unrooted; only the map and live_key
    // are.

    gc.collect_full("test");

    let map = gc.root(&map_root);
    let (_, live_value) = &map.entries[0];
    let live_value = (*live_value).expect("value of a reachable key must survive");
    assert_eq!(live_value.tag, 100);

    let (dead_entry_key, dead_value) = &map.entries[1];
    assert!(dead_entry_key.upgrade().is_none(), "dead key must clear");
    assert!(dead_value.is_none(), "value of a dead key must be dropped");

    gc.remove_root(map_root);
    gc.remove_root(live_key_root);
}

#[test]
fn stats_reflect_collections() {
    let mut gc = small_heap();
    for i in 0..10u32 {
        gc.allocate(Bar { x: i });
    }
    gc.collect_young();
    gc.collect_full("test");

    let info = gc.heap_info();
    assert!(info.num_young_collections >= 1);
    assert_eq!(info.num_full_collections, 1);
    assert!(info.heap_size > 0);
    assert!(info.va_size >= info.heap_size);

    let json = gc.stats_json();
    assert!(json.contains("\"fullCollections\":1"));
}

#[test]
fn heap_census_reports_live_kinds() {
    let mut gc = small_heap();
    let a = gc.allocate(Bar { x: 1 });
    let root = gc.add_root(a);

    let census = gc.heap_census_json();
    assert!(census.contains("Bar"));
    assert!(census.contains("\"count\":"));
    gc.remove_root(root);
}
