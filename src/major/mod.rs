//! Major-collector driver (spec §4.5, component C8).
//!
//! The old generation is pluggable: a sequential or parallel mark-sweep
//! backend that never moves objects, or a copying (evacuating) backend
//! that compacts by relocating survivors into fresh storage. Both satisfy
//! the same [`MajorCollector`] trait so the rest of the crate — the
//! gray-stack finisher, the minor collector's promotion path, the public
//! API — never needs to know which one is configured; only
//! `collector.rs`'s construction site reads `config::MajorKind`.
//!
//! Generalizes the teacher's hard-coded `mark_sweep::AllocationRegistry`
//! (which only ever ran one fixed, incremental mark-sweep algorithm) into
//! a trait object selected at startup, with a genuinely new copying
//! backend alongside it, grounded on the teacher's forwarding-pointer
//! convention in `object::GcHeader` and on `mmtk-core`'s semispace
//! `copyspace` for the two-space evacuation shape.

pub mod copying;
pub mod mark_sweep;

use crate::object::GcHeader;

/// The "major-collector interface (consumed)" of spec §6, as a Rust trait
/// rather than a record of function pointers — per spec §9's note that a
/// systems-language implementation should model this as a polymorphic
/// object.
pub trait MajorCollector: Send + Sync {
    /// Allocate `size` bytes of old-generation storage (header included),
    /// used for direct old-gen allocation and for objects promoted out of
    /// the nursery. Returns `None` if the backend has exhausted its
    /// configured capacity.
    fn alloc_heap(&self, size: usize) -> Option<usize>;

    /// Begin a new major-collection cycle: bump the logical mark version
    /// and let the backend prepare any per-cycle state (e.g. a fresh
    /// to-space for the copying backend).
    fn start_major_collection(&self);

    /// Reclaim everything not marked black this cycle. Returns the number
    /// of bytes reclaimed.
    fn sweep(&self) -> usize;

    /// Visit every live object's header, in backend-defined order.
    fn iterate_objects(&self, visit: &mut dyn FnMut(*const GcHeader));

    /// Evacuate-or-mark an object reached during tracing: a mark-sweep
    /// backend marks it black in place and returns the same pointer; a
    /// copying backend relocates it (unless pinned) and returns the new
    /// address, installing a forwarding pointer at the old one. `size` is
    /// the object's total size including its header.
    ///
    /// # Safety
    /// `header` must point at a live, not-yet-forwarded object of exactly
    /// `size` bytes (header included) owned by this backend.
    unsafe fn copy_or_mark_object(&self, header: *const GcHeader, size: usize) -> *const GcHeader;

    /// Trace `header`'s outgoing references via its descriptor's trace
    /// function, shading each reference *value* into `visit`. Used by
    /// read-only graph walks that never relocate anything: the gray-stack
    /// finisher's ephemeron/bridge fixpoint and domain-unload's reachability
    /// pass.
    ///
    /// # Safety
    /// `header` must point at a live object owned by this backend.
    unsafe fn minor_scan_object(&self, header: *const GcHeader, visit: &mut dyn FnMut(*const GcHeader));

    /// Trace `header`'s outgoing references the same way, but hands `visit`
    /// each field's *address* rather than its value, so the minor
    /// collector can rewrite a field in place once it has evacuated (or
    /// followed the forwarding pointer of) whatever it pointed at. Used
    /// only while evacuating the nursery — old-generation storage under
    /// this trait's other methods never moves, so nothing else needs slot
    /// access.
    ///
    /// # Safety
    /// `header` must point at a live object owned by this backend.
    unsafe fn minor_scan_object_mut(&self, header: *const GcHeader, visit: &mut dyn FnMut(*mut *const GcHeader));

    /// Whether `header` is currently considered live (marked black this
    /// cycle).
    ///
    /// # Safety
    /// `header` must point at a live object owned by this backend.
    unsafe fn is_object_live(&self, header: *const GcHeader) -> bool;

    /// Number of sections currently backing this generation.
    fn get_num_major_sections(&self) -> usize;

    /// Bytes per section (the allowance heuristic's unit of accounting).
    fn section_size(&self) -> usize;

    /// Group a sorted, deduped list of conservative pin candidates into
    /// the `(start, end)` address ranges of the sections they fall in, so
    /// the collector can resolve each range against its section once
    /// rather than walking every candidate independently.
    fn find_pin_queue_start_ends(&self, pins: &[usize]) -> Vec<(usize, usize)>;

    /// Pin every given header so this cycle's collection (if it moves
    /// objects at all) leaves them in place.
    ///
    /// # Safety
    /// Every header must be live and owned by this backend.
    unsafe fn pin_objects(&self, headers: &[*const GcHeader]);

    /// Free a pinned object outright (domain unload only — bypasses the
    /// usual mark-driven sweep).
    ///
    /// # Safety
    /// `header` must be live, owned by this backend, and not referenced
    /// by anything the caller intends to keep using afterward.
    unsafe fn free_pinned_object(&self, header: *const GcHeader);

    /// Free a non-pinned object outright (domain unload only).
    ///
    /// # Safety
    /// Same as `free_pinned_object`.
    unsafe fn free_non_pinned_object(&self, header: *const GcHeader);

    /// Whether this backend's storage addresses remain stable across a
    /// cycle, making a card table a valid write-barrier strategy for it.
    fn supports_cardtable(&self) -> bool;

    /// Whether this backend traces across the worker pool rather than on
    /// the single collector thread.
    fn is_parallel(&self) -> bool;

    /// Resolve a whole-heap conservative candidate against this backend's
    /// own sections (spec §4.5 "pinning scope expands to the whole heap").
    /// Returns `None` if `addr` does not land inside a live object owned by
    /// this backend.
    ///
    /// # Safety
    /// No other thread may be concurrently allocating into this backend's
    /// sections (true during STW pinning).
    unsafe fn resolve_pin_candidate(&self, addr: usize) -> Option<*const GcHeader>;
}

use std::sync::Arc;

use crate::gray::GrayQueue;
use crate::heap::GcHeap;
use crate::los::LargeObjectStore;
use crate::nursery::Nursery;
use crate::pin::PinQueue;
use crate::remset::Remset;
use crate::root::RootTable;
use crate::worker::WorkerPool;

#[cfg(feature = "gc_logging")]
use tracing::debug;

/// Why a major collection was triggered (spec §6 `collect_major(reason)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorCollectionReason {
    /// The minor collector's promotion traffic exceeded the allowance.
    AllowanceExceeded,
    /// A minor collection's rebuild found no usable nursery capacity.
    NurseryDegraded,
    /// Accumulated allocation crossed the configured soft heap limit.
    SoftHeapLimit,
    /// Requested directly through the public API.
    Explicit,
}

/// What one major collection accomplished.
#[derive(Debug, Default, Clone)]
pub struct MajorOutcome {
    pub bytes_reclaimed: usize,
    pub promoted_bytes: usize,
    /// Nursery addresses pinned by this cycle's whole-heap conservative
    /// pass. The caller must merge these with anything the gray-stack
    /// finisher resurrects afterward before rebuilding the nursery — this
    /// driver deliberately stops short of that rebuild so minor and major
    /// cycles can share one finisher-then-rebuild sequence in
    /// `collector.rs`.
    pub pinned_nursery: Vec<usize>,
}

/// Total size (header included) of a live, non-filler object.
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

/// Resolve `target` to its final address for this cycle, evacuating it
/// through `major` if it's a live, un-pinned, un-forwarded object outside
/// the large object store, and shading the result into `gray`. Returns
/// `target` unchanged for null, large-object, pinned, or already-forwarded
/// pointers.
///
/// Shared between the sequential drain below and the worker pool's
/// parallel drain closure (built in `collector.rs`) so both apply
/// identical promotion/evacuation semantics.
///
/// # Safety
/// `target`, if non-null, must be a live header owned by `major`'s
/// generation, the nursery, or `large_objects`.
pub unsafe fn shade_or_evacuate_value(
    target: *const GcHeader,
    major: &dyn MajorCollector,
    large_objects: &LargeObjectStore,
    gray: &GrayQueue,
) -> *const GcHeader {
    if target.is_null() {
        return target;
    }
    if large_objects.contains(target) {
        gray.shade(target);
        return target;
    }
    // SAFETY: caller guarantees `target` is a live header.
    let header = unsafe { &*target };
    if let Some(new_addr) = header.forward_address() {
        let new_ptr = new_addr as *const GcHeader;
        gray.shade(new_ptr);
        return new_ptr;
    }
    if header.is_pinned() {
        gray.shade(target);
        return target;
    }
    let total_size = object_total_size(header);
    // SAFETY: `target` is live, unpinned, and not yet forwarded.
    let new_ptr = unsafe { major.copy_or_mark_object(target, total_size) };
    gray.shade(new_ptr);
    new_ptr
}

/// Slot-rewriting counterpart to [`shade_or_evacuate_value`]: resolves
/// `*slot` and writes the (possibly new) address back if it moved.
///
/// # Safety
/// `slot` must be valid and writable; `*slot`, if non-null, must be a live
/// header as described in [`shade_or_evacuate_value`].
pub unsafe fn shade_or_evacuate_slot(
    slot: *mut *const GcHeader,
    major: &dyn MajorCollector,
    large_objects: &LargeObjectStore,
    gray: &GrayQueue,
) {
    // SAFETY: caller guarantees `slot` is valid and writable.
    let target = unsafe { *slot };
    if target.is_null() {
        return;
    }
    // SAFETY: delegated to the caller's contract on `target`.
    let new_ptr = unsafe { shade_or_evacuate_value(target, major, large_objects, gray) };
    if new_ptr != target {
        // SAFETY: caller guarantees `slot` is writable.
        unsafe { *slot = new_ptr };
    }
}

/// Trace one object reached during a major collection: a large object is
/// traced value-only (its storage never moves, but the fields it points at
/// might — the runtime's registered trace callback is responsible for any
/// internal rewriting it needs, the same escape hatch `root.rs`'s
/// value-only root kinds already rely on); anything else is traced through
/// the major collector's slot-based scan so moved children are rewritten
/// in place.
///
/// # Safety
/// `header` must be a live object reachable from this cycle's roots,
/// remembered set, or gray queue.
pub unsafe fn trace_and_shade(
    header: *const GcHeader,
    major: &dyn MajorCollector,
    large_objects: &LargeObjectStore,
    gray: &GrayQueue,
) {
    if large_objects.contains(header) {
        large_objects.trace_one(header, &mut |child| {
            // SAFETY: `child` comes from a registered LOS trace callback,
            // which only ever hands back live header pointers.
            unsafe {
                shade_or_evacuate_value(child, major, large_objects, gray);
            }
        });
        return;
    }
    // SAFETY: caller guarantees `header` is live.
    unsafe {
        major.minor_scan_object_mut(header, &mut |slot| {
            shade_or_evacuate_slot(slot, major, large_objects, gray);
        });
    }
}

/// Drives one major collection (spec §4.5). Holds references to the
/// shared structures it coordinates; owns no state across cycles.
pub struct MajorCycle<'a> {
    heap: &'a Arc<GcHeap>,
    nursery: &'a Nursery,
    gray: &'a GrayQueue,
    pins: &'a PinQueue,
    remset: &'a dyn Remset,
    major: &'a dyn MajorCollector,
    large_objects: &'a LargeObjectStore,
    workers: Option<&'a WorkerPool>,
}

impl<'a> MajorCycle<'a> {
    /// Construct a driver bound to the given shared structures for one
    /// invocation of `run`. `workers`, if given, must have been built with
    /// a trace closure equivalent to [`trace_and_shade`] over the same
    /// `major`/`large_objects`/`gray`; used only when `major.is_parallel()`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        heap: &'a Arc<GcHeap>,
        nursery: &'a Nursery,
        gray: &'a GrayQueue,
        pins: &'a PinQueue,
        remset: &'a dyn Remset,
        major: &'a dyn MajorCollector,
        large_objects: &'a LargeObjectStore,
        workers: Option<&'a WorkerPool>,
    ) -> Self {
        Self {
            heap,
            nursery,
            gray,
            pins,
            remset,
            major,
            large_objects,
            workers,
        }
    }

    /// Run one full major collection. Must be called with the world
    /// already stopped. Does not run the gray-stack finisher or recompute
    /// the allowance — the caller (`collector.rs`) sequences those around
    /// this call since both are shared with the minor-collection path.
    pub fn run(&self, reason: MajorCollectionReason) -> MajorOutcome {
        self.major.start_major_collection();
        self.nursery.reset_prior_pins();

        let pinned_nursery = self.phase_pin_whole_heap();
        self.phase_scan_remset();
        let promoted_bytes = self.phase_scan_roots();
        self.phase_drain_gray();

        let bytes_reclaimed = self.major.sweep();
        let los_bytes_reclaimed = self.large_objects.sweep();

        self.heap.set_last_major_reclaimed(bytes_reclaimed + los_bytes_reclaimed);
        self.heap.reset_allocated();

        #[cfg(feature = "gc_logging")]
        debug!(
            ?reason,
            bytes_reclaimed,
            los_bytes_reclaimed,
            promoted_bytes,
            objects_pinned = pinned_nursery.len(),
            "major collection complete"
        );

        MajorOutcome {
            bytes_reclaimed: bytes_reclaimed + los_bytes_reclaimed,
            promoted_bytes,
            pinned_nursery,
        }
    }

    /// Resolve this cycle's whole-heap conservative pin candidates against
    /// every generation (spec §4.5: "pinning scope expands to the whole
    /// heap" for a major collection). Returns the nursery-resident
    /// addresses pinned, for the caller's later rebuild step.
    fn phase_pin_whole_heap(&self) -> Vec<usize> {
        let candidates = self.pins.optimize();
        let mut pinned_nursery = Vec::new();
        let mut pinned_major = Vec::new();

        for addr in candidates {
            if self.nursery.section().contains(addr) {
                // SAFETY: the world is stopped; no concurrent allocation
                // into the nursery section.
                if let Some(header) = unsafe { self.nursery.section().resolve_candidate(addr) } {
                    if !header.is_null() {
                        // SAFETY: `header` was just resolved as live.
                        unsafe { (*header).pin() };
                        pinned_nursery.push(header as usize);
                    }
                }
                continue;
            }
            // SAFETY: the world is stopped; no concurrent allocation into
            // the major backend's sections.
            if let Some(header) = unsafe { self.major.resolve_pin_candidate(addr) } {
                pinned_major.push(header);
                continue;
            }
            if let Some(header) = self.large_objects.resolve_candidate(addr) {
                self.gray.shade(header);
            }
        }

        if !pinned_major.is_empty() {
            pinned_major.sort_unstable();
            pinned_major.dedup();
            // SAFETY: every entry came from `resolve_pin_candidate`, which
            // only returns live headers owned by this backend.
            unsafe { self.major.pin_objects(&pinned_major) };
        }

        pinned_nursery.sort_unstable();
        pinned_nursery.dedup();
        for &addr in &pinned_nursery {
            self.gray.shade(addr as *const GcHeader);
        }
        for &header in &pinned_major {
            self.gray.shade(header);
        }

        pinned_nursery
    }

    /// Scan the remembered set. Sound for the mark-sweep major backend,
    /// whose storage never moves; pairing a moving (copying) major
    /// collector with a remembered-set write barrier is a configuration
    /// hazard this crate does not separately validate (see `DESIGN.md`).
    fn phase_scan_remset(&self) {
        self.remset.scan_and_clear(&mut |slot| {
            // SAFETY: remembered-set slots are always live, writable
            // fields inside still-live old-generation objects.
            unsafe { shade_or_evacuate_slot(slot, self.major, self.large_objects, self.gray) };
        });
    }

    /// Scan every registered root, evacuating/rewriting normal and
    /// write-barriered roots and shading (without moving) pinned-kind
    /// roots, exactly as the minor collector does. Returns the bytes
    /// evacuated out of the nursery this cycle, for the caller's
    /// bookkeeping.
    fn phase_scan_roots(&self) -> usize {
        let roots: &RootTable = &self.heap.roots().read();
        let promoted = std::cell::Cell::new(0usize);

        roots.trace_pinned(&mut |header| {
            self.gray.shade(header);
        });

        roots.trace_all_mut(
            &mut |slot| {
                let before = unsafe { *slot };
                let was_nursery = !before.is_null() && self.nursery.section().contains(before as usize);
                // SAFETY: root slots are valid, writable fields for the
                // lifetime of the collection.
                unsafe { shade_or_evacuate_slot(slot, self.major, self.large_objects, self.gray) };
                if was_nursery {
                    promoted.set(promoted.get() + object_size_or_zero(before));
                }
            },
            &mut |value| {
                // SAFETY: delegated to `shade_or_evacuate_value`'s
                // contract; `value` comes from a live root.
                unsafe {
                    shade_or_evacuate_value(value, self.major, self.large_objects, self.gray);
                }
            },
        );

        promoted.get()
    }

    /// Drain the gray queue to completion, in parallel across the worker
    /// pool when the configured major backend supports it, sequentially
    /// otherwise.
    fn phase_drain_gray(&self) {
        if self.major.is_parallel() {
            if let Some(workers) = self.workers {
                loop {
                    let batch = self.gray.pop_batch(64);
                    if batch.is_empty() {
                        workers.wait_idle();
                        if self.gray.is_empty() {
                            break;
                        }
                        continue;
                    }
                    workers.submit(batch);
                }
                return;
            }
        }

        while let Some(header_ptr) = self.gray.pop() {
            // SAFETY: gray-queue entries always come from shading a live
            // header.
            let header = unsafe { &*header_ptr };
            header.set_mark(crate::object::MarkColor::Black);
            // SAFETY: `header_ptr` is live per the gray queue's invariant.
            unsafe { trace_and_shade(header_ptr, self.major, self.large_objects, self.gray) };
        }
    }
}

fn object_size_or_zero(header: *const GcHeader) -> usize {
    if header.is_null() {
        return 0;
    }
    // SAFETY: caller only passes addresses already confirmed live.
    object_total_size(unsafe { &*header })
}
