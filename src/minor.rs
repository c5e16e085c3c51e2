//! Minor collector: the copying nursery collection (spec §4.4).
//!
//! Runs entirely within a single stop-the-world pause. Evacuates every
//! live nursery object either into the old generation (promotion, via the
//! configured major collector's `copy_or_mark_object`) or leaves it in
//! place if a conservative root or register pinned it. Every reference to
//! a moved object — remembered-set slots, precise root slots, and fields
//! inside objects reached while tracing — is rewritten to the new address
//! as it's discovered, so nothing is left pointing at nursery storage the
//! rebuild step is about to reclaim.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::allowance::exceeds_allowance;
use crate::gray::GrayQueue;
use crate::heap::GcHeap;
use crate::major::MajorCollector;
use crate::nursery::Nursery;
use crate::object::GcHeader;
use crate::pin::PinQueue;
use crate::remset::Remset;
use crate::root::RootTable;

#[cfg(feature = "gc_logging")]
use tracing::debug;

/// What a minor collection decided once it finished.
pub struct MinorOutcome {
    /// Bytes promoted from the nursery into the old generation this
    /// cycle.
    pub promoted_bytes: usize,
    /// Whether the accumulated promotion traffic since the last major
    /// collection now exceeds the configured allowance, i.e. a major
    /// collection is due.
    pub major_due: bool,
    /// Whether the nursery rebuild found no usable capacity left after
    /// pinning — every byte up to the high-water mark is occupied by
    /// survivors. A major collection should run immediately regardless of
    /// the allowance heuristic.
    pub degraded: bool,
}

/// Per-cycle tallies threaded through the phases below.
///
/// Fields use interior mutability rather than `&mut` because a single
/// root-table scan hands out two live closures at once (the slot-based
/// and value-based tracing paths) — both need to update these counters,
/// which a shared `&MinorState` permits and an exclusive `&mut` wouldn't.
#[derive(Default)]
struct MinorState {
    promoted_bytes: Cell<usize>,
    objects_promoted: Cell<usize>,
    objects_evacuated: Cell<usize>,
    /// Header addresses of nursery objects pinned this cycle — either by
    /// conservative stack/register scanning or by a pinned-kind root —
    /// fed to the nursery rebuild at the end of the cycle.
    pinned_nursery_addrs: RefCell<Vec<usize>>,
}

impl MinorState {
    fn record_promotion(&self, bytes: usize) {
        self.promoted_bytes.set(self.promoted_bytes.get() + bytes);
        self.objects_promoted.set(self.objects_promoted.get() + 1);
    }

    fn record_evacuation(&self) {
        self.objects_evacuated
            .set(self.objects_evacuated.get() + 1);
    }

    fn record_pinned(&self, addr: usize) {
        self.pinned_nursery_addrs.borrow_mut().push(addr);
    }
}

/// Drives one minor collection. Holds references to the shared
/// structures it coordinates; owns no state of its own across cycles.
pub struct MinorCollector<'a> {
    heap: &'a Arc<GcHeap>,
    nursery: &'a Nursery,
    gray: &'a GrayQueue,
    pins: &'a PinQueue,
    remset: &'a dyn Remset,
    /// The configured old-generation backend: every nursery survivor is
    /// promoted into it directly (this design keeps no nursery to-space of
    /// its own — a nursery object is either pinned in place or evacuated
    /// out to the major heap).
    major: &'a dyn MajorCollector,
}

impl<'a> MinorCollector<'a> {
    /// Construct a collector bound to the given shared structures for one
    /// invocation of `collect`.
    pub fn new(
        heap: &'a Arc<GcHeap>,
        nursery: &'a Nursery,
        gray: &'a GrayQueue,
        pins: &'a PinQueue,
        remset: &'a dyn Remset,
        major: &'a dyn MajorCollector,
    ) -> Self {
        Self {
            heap,
            nursery,
            gray,
            pins,
            remset,
            major,
        }
    }

    /// Run one full minor collection. Must be called with the world
    /// already stopped (spec §4.4 precondition).
    pub fn collect(&self) -> MinorOutcome {
        self.collect_with_finish(|| Vec::new())
    }

    /// Run one full minor collection, invoking `run_finish` once the main
    /// trace has drained (phases 1-6) but before the nursery is rebuilt.
    /// `run_finish` is where the caller runs the gray-stack finisher over
    /// the now-stable object graph; it returns any additional nursery
    /// addresses the finisher resurrected (e.g. a finalization target that
    /// was otherwise unreached), which are pinned in the rebuild alongside
    /// this cycle's own conservative pins.
    pub fn collect_with_finish(&self, run_finish: impl FnOnce() -> Vec<usize>) -> MinorOutcome {
        let state = MinorState::default();

        self.phase_1_bump_mark_version();
        self.phase_2_pin_conservative_roots(&state);
        self.phase_3_scan_remset_into_gray(&state);
        self.phase_4_scan_roots_into_gray(&state);
        self.phase_5_drain_gray_evacuating(&state);
        self.phase_6_verify_no_stale_forwards();

        let resurrected = run_finish();
        state.pinned_nursery_addrs.borrow_mut().extend(resurrected);

        let degraded = self.phase_7_rebuild_nursery(&state);

        let promoted_bytes = state.promoted_bytes.get();

        #[cfg(feature = "gc_logging")]
        debug!(
            promoted_bytes,
            objects_promoted = state.objects_promoted.get(),
            objects_evacuated = state.objects_evacuated.get(),
            degraded,
            "minor collection complete"
        );

        self.heap.record_allocated(promoted_bytes);
        self.heap.set_degraded(degraded);

        let major_due =
            degraded || exceeds_allowance(promoted_bytes, 1, 0, self.heap.allowance());

        MinorOutcome {
            promoted_bytes,
            major_due,
            degraded,
        }
    }

    /// Step 1: bump the global mark version, making every object
    /// logically white without touching per-object memory.
    fn phase_1_bump_mark_version(&self) {
        crate::object::bump_mark_version();
    }

    /// Step 2: release last cycle's pins (spec §4.2: pinning is
    /// redecided every cycle), then resolve this cycle's conservative
    /// stack/register candidates against the nursery section, pinning and
    /// shading anything they touch so the copying phase leaves it in
    /// place but still traces its fields.
    fn phase_2_pin_conservative_roots(&self, state: &MinorState) {
        self.nursery.reset_prior_pins();

        let section = self.nursery.section();
        // SAFETY: the world is stopped; no thread is bump-allocating into
        // the nursery section concurrently.
        let pinned = unsafe { self.pins.resolve_and_pin(&[section.as_ref()]) };
        for &addr in &pinned {
            self.gray.shade(addr as *const GcHeader);
        }
        state.pinned_nursery_addrs.borrow_mut().extend(pinned);
    }

    /// Step 3: scan the remembered set — slots inside old objects that
    /// might hold nursery pointers — rewriting each in place as its
    /// referent is evacuated (or found already forwarded / pinned).
    fn phase_3_scan_remset_into_gray(&self, state: &MinorState) {
        self.remset.scan_and_clear(&mut |slot| {
            self.copy_slot(slot, state);
        });
    }

    /// Step 4: scan every registered root. Pinned-table roots pin and
    /// shade their targets (never rewritten, since pinned objects never
    /// move). Normal and write-barriered roots are traced as rewritable
    /// slots so their stored pointers get fixed up the same way
    /// remembered-set slots do.
    fn phase_4_scan_roots_into_gray(&self, state: &MinorState) {
        let roots: &RootTable = &self.heap.roots().read();

        roots.trace_pinned(&mut |header| {
            if !header.is_null() && self.nursery.section().contains(header as usize) {
                state.record_pinned(header as usize);
            }
            self.gray.shade(header);
        });

        roots.trace_all_mut(
            &mut |slot| self.copy_slot(slot, state),
            &mut |value| self.trace_value_into_gray(value, state),
        );
    }

    /// Step 5: drain the gray queue. Every entry reached this point is
    /// already at its final address for this cycle (promoted, pinned in
    /// place, or outside the nursery entirely) — it was rewritten to that
    /// address by `copy_slot` (or was a pinned-root/pinned-candidate
    /// value, which never moves) before being shaded. Tracing its own
    /// fields via the major collector's slot-based scan fixes up any
    /// further nursery pointers it holds.
    fn phase_5_drain_gray_evacuating(&self, state: &MinorState) {
        while let Some(header_ptr) = self.gray.pop() {
            // SAFETY: gray-queue entries always come from root/remset/
            // field tracing of live headers.
            let header = unsafe { &*header_ptr };
            header.set_mark(crate::object::MarkColor::Black);

            // SAFETY: `header_ptr` is live and owned by `self.major`
            // (either already promoted/old-gen/LOS storage, or a pinned
            // nursery object the major backend's descriptor lookup works
            // on identically).
            unsafe {
                self.major.minor_scan_object_mut(header_ptr, &mut |slot| {
                    self.copy_slot(slot, state);
                });
            }
        }
    }

    /// Evacuate (or follow the forwarding pointer of, or leave pinned)
    /// the nursery object at `*slot`, rewriting `*slot` in place so it
    /// never again points at storage the nursery rebuild is about to
    /// reclaim. A no-op if `*slot` is null or already outside the
    /// nursery.
    fn copy_slot(&self, slot: *mut *const GcHeader, state: &MinorState) {
        // SAFETY: caller guarantees `slot` is valid and writable.
        let target = unsafe { *slot };
        if target.is_null() || !self.nursery.section().contains(target as usize) {
            return;
        }
        // SAFETY: a non-null pointer into the nursery section names a
        // live header there.
        let header = unsafe { &*target };

        if let Some(new_addr) = header.forward_address() {
            // SAFETY: `slot` is writable per the caller's contract.
            unsafe { *slot = new_addr as *const GcHeader };
            return;
        }

        if header.is_pinned() {
            self.gray.shade(target);
            return;
        }

        let total_size = Self::object_total_size(header);
        // SAFETY: `target` is live, unpinned, and not yet forwarded.
        let new_ptr = unsafe { self.major.copy_or_mark_object(target, total_size) };
        // SAFETY: `slot` is writable per the caller's contract.
        unsafe { *slot = new_ptr };

        if new_ptr != target {
            state.record_evacuation();
            state.record_promotion(total_size);
        }

        self.gray.shade(new_ptr);
    }

    /// Value-only counterpart to `copy_slot`, used for the handful of root
    /// kinds (`UserMarkFn`, conservative) that don't expose an addressable
    /// slot back to the collector. The referent is still evacuated and
    /// traced so its transitive closure stays live, but the root's own
    /// stored pointer cannot be rewritten here — the runtime that owns
    /// that storage is responsible for re-deriving it (e.g. by re-walking
    /// a JIT stack map next safepoint) if it depends on seeing the moved
    /// address.
    fn trace_value_into_gray(&self, value: *const GcHeader, state: &MinorState) {
        if value.is_null() {
            self.gray.shade(value);
            return;
        }
        if !self.nursery.section().contains(value as usize) {
            self.gray.shade(value);
            return;
        }
        // SAFETY: a non-null pointer into the nursery section names a
        // live header there.
        let header = unsafe { &*value };
        if let Some(new_addr) = header.forward_address() {
            self.gray.shade(new_addr as *const GcHeader);
            return;
        }
        if header.is_pinned() {
            self.gray.shade(value);
            return;
        }
        let total_size = Self::object_total_size(header);
        // SAFETY: `value` is live, unpinned, and not yet forwarded.
        let new_ptr = unsafe { self.major.copy_or_mark_object(value, total_size) };
        if new_ptr != value {
            state.record_evacuation();
            state.record_promotion(total_size);
        }
        self.gray.shade(new_ptr);
    }

    fn object_total_size(header: &GcHeader) -> usize {
        let descriptor = header.descriptor();
        let payload_size = if descriptor.is_null() {
            0
        } else {
            // SAFETY: non-null descriptors are never collected.
            unsafe { (*descriptor).size }
        };
        std::mem::size_of::<GcHeader>() + payload_size
    }

    /// Step 6: by construction every slot encountered during steps 3-5 was
    /// rewritten the moment its referent moved, so there is nothing left
    /// to fix up after the gray queue drains empty. Kept as an explicit
    /// step to mirror the collection's documented phase structure.
    fn phase_6_verify_no_stale_forwards(&self) {}

    /// Step 7: rebuild the nursery for the next allocation cycle, keeping
    /// pinned survivors in place and donating the rest as fragments.
    /// Returns whether the rebuild left the nursery degraded (no usable
    /// capacity at all).
    fn phase_7_rebuild_nursery(&self, state: &MinorState) -> bool {
        let mut pinned = state.pinned_nursery_addrs.borrow_mut();
        pinned.sort_unstable();
        pinned.dedup();

        if pinned.is_empty() {
            self.nursery.reset();
            false
        } else {
            self.nursery.rebuild_fragments(&pinned[..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::major::mark_sweep::MarkSweepMajor;
    use crate::object::tags;
    use crate::remset::SsbRemset;

    #[test]
    fn test_minor_collection_runs_to_completion() {
        let heap = GcHeap::new();
        let nursery = Nursery::new(heap.clone());
        let gray = GrayQueue::new();
        let pins = PinQueue::new();
        let remset = SsbRemset::new(16);
        let major = MarkSweepMajor::new(4096, 4096 * 16, false, false);

        let addr = nursery.allocate(64).unwrap();
        unsafe {
            std::ptr::write(
                addr as *mut GcHeader,
                GcHeader::new(tags::OBJECT, std::ptr::null()),
            );
        }

        let collector = MinorCollector::new(&heap, &nursery, &gray, &pins, &remset, &major);
        let outcome = collector.collect();
        assert_eq!(outcome.promoted_bytes, 0);
        assert!(!outcome.major_due);
        assert!(!outcome.degraded);
    }

    #[test]
    fn test_minor_collection_promotes_rooted_object() {
        use crate::root::{RootDescriptor, RootEntry, RootKind};
        use std::cell::Cell;

        let heap = GcHeap::new();
        let nursery = Nursery::new(heap.clone());
        let gray = GrayQueue::new();
        let pins = PinQueue::new();
        let remset = SsbRemset::new(16);
        let major = MarkSweepMajor::new(4096, 4096 * 16, false, false);

        let addr = nursery.allocate(64).unwrap();
        unsafe {
            std::ptr::write(
                addr as *mut GcHeader,
                GcHeader::new(tags::OBJECT, std::ptr::null()),
            );
        }
        let slot: Cell<*const GcHeader> = Cell::new(addr as *const GcHeader);
        heap.roots().write().register(
            RootKind::Normal,
            RootEntry {
                start: slot.as_ptr() as usize,
                len: std::mem::size_of::<usize>(),
                descriptor: RootDescriptor::Slots { count: 1 },
            },
        );

        let collector = MinorCollector::new(&heap, &nursery, &gray, &pins, &remset, &major);
        let outcome = collector.collect();
        assert!(outcome.promoted_bytes > 0);

        // The root's own slot must have been rewritten to the promoted
        // object's new address, not left pointing at reclaimed nursery
        // storage.
        let new_addr = slot.get();
        assert_ne!(new_addr, addr as *const GcHeader);
        assert!(!nursery.section().contains(new_addr as usize));
    }

    #[test]
    fn test_minor_collection_leaves_pinned_object_in_place_and_reusable_next_cycle() {
        use crate::root::{RootDescriptor, RootEntry, RootKind};
        use std::cell::Cell;

        let heap = GcHeap::new();
        let nursery = Nursery::new(heap.clone());
        let gray = GrayQueue::new();
        let pins = PinQueue::new();
        let remset = SsbRemset::new(16);
        let major = MarkSweepMajor::new(4096, 4096 * 16, false, false);

        let addr = nursery.allocate(64).unwrap();
        unsafe {
            std::ptr::write(
                addr as *mut GcHeader,
                GcHeader::new(tags::OBJECT, std::ptr::null()),
            );
        }
        let slot: Cell<*const GcHeader> = Cell::new(addr as *const GcHeader);
        heap.roots().write().register(
            RootKind::Pinned,
            RootEntry {
                start: slot.as_ptr() as usize,
                len: std::mem::size_of::<usize>(),
                descriptor: RootDescriptor::Slots { count: 1 },
            },
        );

        let collector = MinorCollector::new(&heap, &nursery, &gray, &pins, &remset, &major);
        let outcome = collector.collect();
        assert_eq!(outcome.promoted_bytes, 0);

        // Pinned: left exactly where it was, not evacuated.
        assert_eq!(slot.get(), addr as *const GcHeader);
        let header = unsafe { &*(addr as *const GcHeader) };
        assert!(header.is_pinned());

        // A fresh allocation must not stomp on the pinned object's memory.
        let other = nursery.allocate(64).unwrap();
        assert!(other != addr);
    }
}
