//! End-to-end scenario tests exercising the collector through its public
//! `Gc` façade the way an embedder would: allocate, root, mutate through
//! the barrier, collect, observe.

use std::cell::Cell;
use std::sync::Arc;

use genuvm_gc::api::{walk_flags, Gc};
use genuvm_gc::config::GcConfig;
use genuvm_gc::ephemeron::EphemeronTable;
use genuvm_gc::finalization::FinalizationRegistryData;
use genuvm_gc::major::MajorCollectionReason;
use genuvm_gc::object::{tags, GcHeader, MarkColor};
use genuvm_gc::root::RootDescriptor;
use genuvm_gc::weak_ref::{DisappearingLink, LinkKind};

fn new_gc() -> Gc {
    Gc::new(GcConfig::default()).unwrap()
}

unsafe fn write_leaf_object(addr: usize) -> *const GcHeader {
    unsafe {
        std::ptr::write(addr as *mut GcHeader, GcHeader::new(tags::OBJECT, std::ptr::null()));
    }
    addr as *const GcHeader
}

/// Scenario 1: a nursery-allocated object reachable only from a root
/// survives a minor collection and is promoted to the old generation.
#[test]
fn scenario_promotion_across_a_minor_collection() {
    let gc = new_gc();
    let addr = gc.collector().nursery().allocate(64).unwrap();
    let header = unsafe { write_leaf_object(addr) };

    let slot: Cell<*const GcHeader> = Cell::new(header);
    gc.register_root_wbarrier(
        slot.as_ptr() as usize,
        std::mem::size_of::<usize>(),
        RootDescriptor::Slots { count: 1 },
    );

    assert_eq!(unsafe { gc.get_generation(header) }, 0);
    let outcome = gc.collect_nursery();
    assert!(outcome.promoted_bytes > 0);
    assert_eq!(unsafe { gc.get_generation(slot.get()) }, 1);
    assert_ne!(slot.get(), header, "surviving object must have moved out of the nursery");
}

/// Scenario 2: an object reachable only through a conservatively-scanned
/// stack address is pinned in place across a minor collection rather
/// than relocated.
#[test]
fn scenario_pinning_keeps_a_conservatively_found_object_in_place() {
    let gc = new_gc();
    let addr = gc.collector().nursery().allocate(64).unwrap();
    let header = unsafe { write_leaf_object(addr) };

    // A conservative stack/register scan would hand the collector raw
    // candidate addresses; simulate that directly.
    gc.collector().pins().push(addr);

    gc.collect_nursery();

    assert!(unsafe { (*header).is_pinned() });
    let mut seen = Vec::new();
    gc.walk_heap(walk_flags::NURSERY, |obj| seen.push(obj.header));
    assert!(seen.contains(&header));
}

/// Scenario 3: objects unreachable from any root, each registered for
/// ordinary finalization, become pending once a major collection
/// confirms they're dead — and are kept alive (resurrected) long enough
/// for their finalizer to still safely read them.
#[test]
fn scenario_unreachable_objects_are_resurrected_and_queued_for_finalization() {
    let gc = new_gc();

    let mut obj_a = GcHeader::new(tags::OBJECT, std::ptr::null());
    let ptr_a: *const GcHeader = &mut obj_a;
    let mut obj_b = GcHeader::new(tags::OBJECT, std::ptr::null());
    let ptr_b: *const GcHeader = &mut obj_b;

    let registry = Arc::new(FinalizationRegistryData::new());
    let idx_a = registry.register(ptr_a);
    let idx_b = registry.register(ptr_b);
    gc.register_finalization_registry(registry.clone());

    // Neither object is rooted, so both are unreachable going into the
    // collection; the finisher must still resurrect them to run their
    // finalizers safely.
    gc.collect_major(MajorCollectionReason::Explicit);

    assert!(registry.has_pending());
    let pending = registry.drain_pending();
    assert!(pending.contains(&idx_a));
    assert!(pending.contains(&idx_b));
    assert_eq!(unsafe { (*ptr_a).mark() }, MarkColor::Black);
    assert_eq!(unsafe { (*ptr_b).mark() }, MarkColor::Black);
}

/// Scenario 4: a WeakMap-shaped ephemeron entry keeps its value alive
/// exactly as long as its key is reachable, and is tombstoned the
/// collection after the key becomes unreachable.
#[test]
fn scenario_ephemeron_value_liveness_follows_its_key() {
    let gc = new_gc();

    let mut key = GcHeader::new(tags::OBJECT, std::ptr::null());
    let key_ptr: *const GcHeader = &mut key;
    let mut value = GcHeader::new(tags::OBJECT, std::ptr::null());
    let value_ptr: *const GcHeader = &mut value;

    let table = Arc::new(EphemeronTable::new());
    unsafe { table.set_raw(key_ptr, (value_ptr as usize).to_ne_bytes().to_vec(), None) };
    gc.register_ephemeron_table(table.clone());

    let key_slot: Cell<*const GcHeader> = Cell::new(key_ptr);
    let root_id = gc.register_root(
        key_slot.as_ptr() as usize,
        std::mem::size_of::<usize>(),
        RootDescriptor::Slots { count: 1 },
    );

    gc.collect_major(MajorCollectionReason::Explicit);
    assert!(unsafe { table.has(key_ptr) });
    assert_eq!(unsafe { (*value_ptr).mark() }, MarkColor::Black);

    assert!(gc.deregister_root(root_id));
    gc.collect_major(MajorCollectionReason::Explicit);
    assert!(!unsafe { table.has(key_ptr) });
}

/// Scenario 5: a tracking disappearing link to an object that also has a
/// pending finalizer is NOT cleared — the finalization pass resurrects
/// the target before the tracking-link pass runs, so the link survives
/// to let the runtime's resurrection-sensitive handle observe it.
#[test]
fn scenario_tracking_link_survives_finalizer_resurrection() {
    let gc = new_gc();

    let mut target = GcHeader::new(tags::OBJECT, std::ptr::null());
    let target_ptr: *const GcHeader = &mut target;

    let registry = Arc::new(FinalizationRegistryData::new());
    registry.register(target_ptr);
    gc.register_finalization_registry(registry.clone());

    let link = Arc::new(DisappearingLink::new(target_ptr, LinkKind::Tracking));
    gc.register_disappearing_link(link.clone());

    gc.collect_major(MajorCollectionReason::Explicit);

    assert!(registry.has_pending());
    assert!(
        link.is_registered(),
        "resurrection by the finalization pass must keep the tracking link intact"
    );
    assert_eq!(link.target(), Some(target_ptr));

    // Simulate the finalizer thread having run: drain the pending entry.
    // The registry no longer resurrects this target, so the next major
    // collection finds it genuinely unreachable and the tracking link is
    // finally cleared.
    let drained = registry.drain_pending();
    assert_eq!(drained, vec![0]);

    gc.collect_major(MajorCollectionReason::Explicit);
    assert!(!link.is_registered());
    assert_eq!(link.target(), None);
}

/// Scenario 6: a store through the write barrier into what stands in for
/// an old-generation slot is recorded in the remembered set, and a minor
/// collection correctly keeps the young object alive and updates the
/// slot to its new address.
#[test]
fn scenario_cross_generation_store_is_tracked_by_the_remembered_set() {
    let gc = new_gc();
    let addr = gc.collector().nursery().allocate(64).unwrap();
    let young = unsafe { write_leaf_object(addr) };

    let mut old_field: *const GcHeader = std::ptr::null();
    unsafe { gc.wbarrier_set_field(&mut old_field, young) };
    assert_eq!(gc.collector().remset().len(), 1);

    gc.collect_nursery();

    assert_eq!(gc.collector().remset().len(), 0, "remset must be drained once scanned");
    assert_ne!(old_field, young, "the stored pointer must be updated to the promoted address");
    assert_ne!(old_field, std::ptr::null());
}
