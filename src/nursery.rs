//! Nursery: the young generation, allocated into via per-thread TLABs
//! carved out of the nursery's section (spec §4.4 precondition, §3
//! "nursery fragment list").
//!
//! Generalizes the teacher's `allocator::Allocator` (a single flat `Vec`
//! bump pointer) into a `Section`-backed design so scan-starts and
//! fragment reuse are available, matching what `section.rs`'s conservative
//! pinning needs.

use std::cell::Cell;
use std::sync::Arc;

use crate::heap::GcHeap;
use crate::object::GcHeader;
use crate::section::{FragmentList, Section};

/// A thread-local bump region carved out of the nursery section.
pub struct Tlab {
    start: Cell<usize>,
    end: Cell<usize>,
}

impl Default for Tlab {
    fn default() -> Self {
        Self {
            start: Cell::new(0),
            end: Cell::new(0),
        }
    }
}

impl Tlab {
    fn remaining(&self) -> usize {
        self.end.get() - self.start.get()
    }

    fn bump(&self, size: usize) -> Option<usize> {
        let start = self.start.get();
        let new_start = start.checked_add(size)?;
        if new_start > self.end.get() {
            return None;
        }
        self.start.set(new_start);
        Some(start)
    }
}

/// Per-thread nursery allocator. Not `Sync` — each mutator thread owns one
/// and it must not be shared; the shared `Section`/`FragmentList` it draws
/// from are reached through `heap` under lock.
pub struct Nursery {
    heap: Arc<GcHeap>,
    section: Arc<Section>,
    fragments: parking_lot::Mutex<FragmentList>,
    /// Header addresses pinned by the most recent rebuild. Pinning is
    /// re-decided every cycle from that cycle's conservative roots, so
    /// these must have their move state reset back to `Normal` before the
    /// next cycle's pin pass runs — otherwise an object pinned once would
    /// stay un-evacuable forever even after nothing references it
    /// conservatively anymore.
    pinned: parking_lot::Mutex<Vec<usize>>,
    tlab: Tlab,
    /// Minimum TLAB size requested from the shared fragment list; below
    /// this, a failed bump falls through to old-gen/LOS allocation instead
    /// of fragmenting further.
    min_tlab_size: usize,
}

impl Nursery {
    /// Create a nursery allocator for `heap`, backed by a fresh section
    /// sized per `GcConfig::nursery_size`.
    pub fn new(heap: Arc<GcHeap>) -> Self {
        let nursery_size = heap.config().nursery_size;
        Self {
            heap,
            section: Arc::new(Section::new(nursery_size)),
            fragments: parking_lot::Mutex::new(FragmentList::new()),
            pinned: parking_lot::Mutex::new(Vec::new()),
            tlab: Tlab::default(),
            min_tlab_size: 4096,
        }
    }

    /// The backing section, for root/pin scanning.
    pub fn section(&self) -> &Arc<Section> {
        &self.section
    }

    /// Bump-allocate `size` bytes for a new object. Returns `None` if the
    /// nursery has no room left (the caller should trigger a minor
    /// collection, or fall through to old-gen/LOS allocation for
    /// oversized requests).
    pub fn allocate(&self, size: usize) -> Option<usize> {
        let aligned = (size + 7) & !7;

        if self.tlab.remaining() >= aligned {
            return self.bump_and_record(aligned);
        }

        // TLAB exhausted: try to carve a new one from a fragment or from
        // the section's raw remaining space.
        if let Some((start, end)) = self.fragments.lock().take_largest() {
            self.tlab.start.set(start);
            self.tlab.end.set(end);
            if self.tlab.remaining() >= aligned {
                return self.bump_and_record(aligned);
            }
        }

        if let Some(start) = self.section.bump_alloc(aligned.max(self.min_tlab_size)) {
            self.tlab.start.set(start + aligned);
            self.tlab.end.set(start + aligned.max(self.min_tlab_size));
            self.heap.record_allocated(aligned.max(self.min_tlab_size));
            return Some(start);
        }

        None
    }

    fn bump_and_record(&self, aligned: usize) -> Option<usize> {
        let addr = self.tlab.bump(aligned)?;
        Some(addr)
    }

    /// Clear the pinned state left by the previous cycle's rebuild, so
    /// this cycle's pin pass starts from a clean slate instead of
    /// inheriting pins from roots that may no longer reference these
    /// objects. Must run before `PinQueue::resolve_and_pin` for this
    /// cycle.
    pub fn reset_prior_pins(&self) {
        for addr in self.pinned.lock().drain(..) {
            // SAFETY: every address here was pinned by a previous call to
            // `rebuild_fragments` and still names a live header (nothing
            // between cycles frees nursery storage except this rebuild
            // itself, which filler-covers only non-pinned ranges).
            unsafe { (*(addr as *const GcHeader)).reset_move_state() };
        }
    }

    /// Reset the nursery for reuse when a minor collection found nothing
    /// worth preserving in place (no pinned survivors): the whole section
    /// is free again.
    pub fn reset(&self) {
        self.tlab.start.set(0);
        self.tlab.end.set(0);
        self.section.reset();
        self.fragments.lock().clear();
        self.pinned.lock().clear();
    }

    /// Rebuild the nursery for reuse after a minor collection that left
    /// `pinned` (sorted, deduped header addresses) in place. Every other
    /// byte of previously-allocated space becomes a donated fragment;
    /// pinned objects' memory is left untouched (spec §4.4 step 11).
    ///
    /// Returns whether the rebuild produced no usable capacity at all
    /// (every byte up to the high-water mark is occupied by survivors and
    /// the section has no untouched tail) — the caller should treat this
    /// as the degraded-allocation condition and consider an immediate
    /// major collection.
    pub fn rebuild_fragments(&self, pinned: &[usize]) -> bool {
        self.tlab.start.set(0);
        self.tlab.end.set(0);
        let mut fragments = self.fragments.lock();
        fragments.clear();
        // SAFETY: called only from the minor collector's own thread while
        // the world is stopped, after pinning has finished and before any
        // further allocation.
        let donated = unsafe { self.section.rebuild_after_pinning(pinned) };
        let total_free: usize = donated.iter().map(|(s, e)| e - s).sum();
        for (start, end) in donated {
            fragments.push(start, end);
        }
        drop(fragments);
        *self.pinned.lock() = pinned.to_vec();
        total_free == 0 && self.section.remaining() == 0
    }

    /// Register surviving fragments left behind by a collection (the
    /// byte ranges between evacuated objects), for reuse by future TLABs.
    pub fn donate_fragment(&self, start: usize, end: usize) {
        self.fragments.lock().push(start, end);
    }

    /// Bytes still available across the active TLAB plus the section's
    /// untouched tail — an approximation used by `should_gc` style checks.
    pub fn approx_remaining(&self) -> usize {
        self.tlab.remaining() + self.section.remaining()
    }

    /// Walk the section's live header chain looking for objects the main
    /// trace left black but neither forwarded nor pinned — the signature
    /// of an object the gray-stack finisher resurrected (e.g. a
    /// finalization target) after the main trace had already finished
    /// with it. Such an object must be pinned before the rebuild runs, or
    /// the rebuild's fragment fill would overwrite still-live memory.
    /// Returns their addresses; the caller is responsible for merging
    /// them into the cycle's pinned set.
    ///
    /// # Safety
    /// Must run with the world stopped and no concurrent allocation into
    /// this section.
    pub unsafe fn collect_unforwarded_black_survivors(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = self.section.base();
        let limit = self.section.base() + self.section.used();
        let header_size = std::mem::size_of::<GcHeader>();

        while cursor < limit {
            // SAFETY: caller guarantees no concurrent allocation; `cursor`
            // walks a contiguous chain of live/filler headers.
            let header = unsafe { &*(cursor as *const GcHeader) };
            let payload = if header.tag() == crate::object::tags::FILLER {
                header.forward_address().unwrap_or(0)
            } else {
                let descriptor = header.descriptor();
                if descriptor.is_null() {
                    0
                } else {
                    // SAFETY: non-null descriptors are never collected.
                    unsafe { (*descriptor).size }
                }
            };
            let total = header_size + payload;

            if header.tag() != crate::object::tags::FILLER
                && header.mark() == crate::object::MarkColor::Black
                && !header.is_forwarded()
                && !header.is_pinned()
            {
                header.pin();
                out.push(cursor);
            }

            cursor += total;
        }

        out
    }
}
