//! Non-moving mark-sweep major-collector backend (spec §6 `major=marksweep`
//! and its fixed/parallel variants).
//!
//! Storage is a growable list of [`Section`]s, the same bump-allocating
//! region type the nursery uses, so `Section::resolve_candidate`'s
//! scan-start walk works unmodified for whole-heap conservative pinning
//! (spec §4.5 "pinning scope expands to the whole heap"). A sweep never
//! moves anything: dead spans are overwritten with filler headers and
//! folded back into each section's [`FragmentList`] for reuse by the next
//! allocation, the same convention `nursery.rs` already uses for its own
//! fragment list. Generalizes the teacher's `mark_sweep::AllocationRegistry`
//! (fixed-size block directory, incremental marking) into a single STW-only
//! sweep over variable-length sections.

use parking_lot::Mutex;

use crate::object::{tags, GcHeader, MarkColor};
use crate::section::{FragmentList, Section};

/// One old-generation mark-sweep space.
pub struct MarkSweepMajor {
    sections: Mutex<Vec<Section>>,
    fragments: Mutex<Vec<FragmentList>>,
    section_size: usize,
    max_sections: usize,
    /// Whether the heap may grow past its initial section count (the
    /// non-`-fixed` variants) or is capped at `max_sections` (the `-fixed`
    /// variants, spec's `marksweep-fixed`/`marksweep-fixed-par`).
    fixed: bool,
    parallel: bool,
}

impl MarkSweepMajor {
    /// Construct an empty backend. `max_heap_size` bounds the total
    /// section count; `section_size` should match the configured nursery
    /// size so promoted objects and the allowance heuristic share a unit.
    pub fn new(section_size: usize, max_heap_size: usize, fixed: bool, parallel: bool) -> Self {
        let max_sections = (max_heap_size / section_size.max(1)).max(1);
        Self {
            sections: Mutex::new(Vec::new()),
            fragments: Mutex::new(Vec::new()),
            section_size,
            max_sections,
            fixed,
            parallel,
        }
    }

    fn alloc_new_section(&self) -> Option<usize> {
        let mut sections = self.sections.lock();
        if sections.len() >= self.max_sections {
            return None;
        }
        sections.push(Section::new(self.section_size));
        self.fragments.lock().push(FragmentList::new());
        Some(sections.len() - 1)
    }

    /// Walk `section`'s live header chain from its base to its used
    /// frontier. Returns `(header_addr, total_size)` pairs, where
    /// `total_size` includes the header.
    fn walk_headers(section: &Section) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut cursor = section.base();
        let limit = section.base() + section.used();
        let header_size = std::mem::size_of::<GcHeader>();

        while cursor < limit {
            // SAFETY: `cursor` walks strictly within `[base, base+used)`,
            // a range that only ever contains contiguous object headers
            // (live or filler) laid down by bump allocation.
            let header = unsafe { &*(cursor as *const GcHeader) };
            let payload = if header.tag() == tags::FILLER {
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
            out.push((cursor, total));
            cursor += total;
        }

        out
    }
}

impl super::MajorCollector for MarkSweepMajor {
    fn alloc_heap(&self, size: usize) -> Option<usize> {
        {
            let mut fragments = self.fragments.lock();
            for list in fragments.iter_mut() {
                if let Some((start, end)) = list.take_largest() {
                    if end - start >= size {
                        if end - start > size {
                            list.push(start + size, end);
                        }
                        return Some(start);
                    }
                    list.push(start, end);
                }
            }
        }

        {
            let sections = self.sections.lock();
            for section in sections.iter() {
                if let Some(addr) = section.bump_alloc(size) {
                    return Some(addr);
                }
            }
        }

        if !self.fixed || self.sections.lock().is_empty() {
            let idx = self.alloc_new_section()?;
            let sections = self.sections.lock();
            return sections[idx].bump_alloc(size);
        }

        None
    }

    fn start_major_collection(&self) {
        crate::object::bump_mark_version();
    }

    fn sweep(&self) -> usize {
        let sections = self.sections.lock();
        let mut fragments = self.fragments.lock();
        let mut reclaimed = 0usize;

        for (section, list) in sections.iter().zip(fragments.iter_mut()) {
            list.clear();
            let mut dead_start: Option<usize> = None;

            for (addr, size) in Self::walk_headers(section) {
                // SAFETY: addresses come straight from `walk_headers`.
                let header = unsafe { &*(addr as *const GcHeader) };
                let is_live = header.tag() == tags::FILLER || header.mark() == MarkColor::Black;

                if is_live {
                    if let Some(start) = dead_start.take() {
                        reclaimed += Self::coalesce_dead(start, addr, list);
                    }
                } else {
                    reclaimed += size;
                    if dead_start.is_none() {
                        dead_start = Some(addr);
                    }
                }
            }

            if let Some(start) = dead_start {
                let end = section.base() + section.used();
                Self::coalesce_dead(start, end, list);
            }
        }

        reclaimed
    }

    fn iterate_objects(&self, visit: &mut dyn FnMut(*const GcHeader)) {
        let sections = self.sections.lock();
        for section in sections.iter() {
            for (addr, _) in Self::walk_headers(section) {
                // SAFETY: see `walk_headers`.
                let header = unsafe { &*(addr as *const GcHeader) };
                if header.tag() != tags::FILLER {
                    visit(addr as *const GcHeader);
                }
            }
        }
    }

    unsafe fn copy_or_mark_object(&self, header: *const GcHeader, size: usize) -> *const GcHeader {
        let addr = header as usize;
        let owned = self.sections.lock().iter().any(|s| s.contains(addr));
        if owned {
            // Reached via this backend's own major-cycle tracing: already
            // major-heap storage, never relocated.
            // SAFETY: caller guarantees `header` is live.
            unsafe { (*header).set_mark(MarkColor::Black) };
            return header;
        }

        // Not ours: a nursery survivor being promoted in. That storage is
        // about to be reclaimed by the minor collector's rebuild, so it
        // must be physically copied rather than marked in place.
        let Some(new_addr) = self.alloc_heap(size) else {
            // Out of major-heap space mid-promotion: leave it where it is
            // and pin it, matching the copying backend's own
            // evacuation-OOM fallback (spec §9).
            unsafe {
                (*header).pin();
                (*header).set_mark(MarkColor::Black);
            }
            return header;
        };
        // SAFETY: `new_addr` is freshly, exclusively allocated storage of
        // at least `size` bytes; `header..header+size` is the object's
        // full live extent.
        unsafe {
            std::ptr::copy_nonoverlapping(header as *const u8, new_addr as *mut u8, size);
        }
        let new_header = unsafe { &*(new_addr as *const GcHeader) };
        new_header.reset_move_state();
        new_header.set_mark(MarkColor::Black);
        // SAFETY: `header` is live and not yet forwarded (caller contract).
        unsafe { (*header).set_forward(new_addr) };
        new_addr as *const GcHeader
    }

    unsafe fn minor_scan_object(&self, header: *const GcHeader, visit: &mut dyn FnMut(*const GcHeader)) {
        // SAFETY: forwarded to the slot-based scan; we only ever read the
        // slot's current value here, never write it.
        unsafe {
            self.minor_scan_object_mut(header, &mut |slot| visit(*slot));
        }
    }

    unsafe fn minor_scan_object_mut(&self, header: *const GcHeader, visit: &mut dyn FnMut(*mut *const GcHeader)) {
        // SAFETY: caller guarantees `header` is live.
        let descriptor = unsafe { (*header).descriptor() };
        if descriptor.is_null() {
            return;
        }
        // SAFETY: non-null descriptors are never collected.
        if let Some(trace) = unsafe { (*descriptor).trace } {
            let payload = unsafe { (header as *const u8).add(std::mem::size_of::<GcHeader>()) };
            trace(payload, visit);
        }
    }

    unsafe fn is_object_live(&self, header: *const GcHeader) -> bool {
        // SAFETY: caller guarantees `header` is live/valid to read.
        unsafe { (*header).mark() == MarkColor::Black }
    }

    fn get_num_major_sections(&self) -> usize {
        self.sections.lock().len()
    }

    fn section_size(&self) -> usize {
        self.section_size
    }

    fn find_pin_queue_start_ends(&self, pins: &[usize]) -> Vec<(usize, usize)> {
        find_section_ranges(&self.sections.lock(), pins)
    }

    unsafe fn pin_objects(&self, headers: &[*const GcHeader]) {
        for &header in headers {
            // SAFETY: caller guarantees every header is live.
            unsafe { (*header).pin() };
        }
    }

    unsafe fn free_pinned_object(&self, header: *const GcHeader) {
        // SAFETY: caller guarantees `header` is live and owned by this
        // backend; this backend never moves objects, so pinned and
        // non-pinned free the same way.
        unsafe { self.free_non_pinned_object(header) };
    }

    unsafe fn free_non_pinned_object(&self, header: *const GcHeader) {
        let addr = header as usize;
        let sections = self.sections.lock();
        let Some((idx, section)) = sections
            .iter()
            .enumerate()
            .find(|(_, s)| s.contains(addr))
        else {
            return;
        };
        let size = Self::walk_headers(section)
            .into_iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, size)| size)
            .unwrap_or(std::mem::size_of::<GcHeader>());
        // SAFETY: `addr` is a live header's address within this section,
        // not concurrently accessed during the STW pause a free happens in.
        unsafe { crate::section::FragmentList::fill_gap(addr, addr + size) };
        self.fragments.lock()[idx].push(addr, addr + size);
    }

    fn supports_cardtable(&self) -> bool {
        true
    }

    fn is_parallel(&self) -> bool {
        self.parallel
    }

    unsafe fn resolve_pin_candidate(&self, addr: usize) -> Option<*const GcHeader> {
        let sections = self.sections.lock();
        let section = sections.iter().find(|s| s.contains(addr))?;
        // SAFETY: caller guarantees no concurrent allocation into `section`.
        unsafe { section.resolve_candidate(addr) }
    }
}

impl MarkSweepMajor {
    fn coalesce_dead(start: usize, end: usize, list: &mut FragmentList) -> usize {
        if end <= start {
            return 0;
        }
        // SAFETY: `[start, end)` spans only just-confirmed-dead objects
        // within a section not concurrently bump-allocated into (STW).
        unsafe { FragmentList::fill_gap(start, end) };
        list.push(start, end);
        end - start
    }
}

/// Shared helper: group sorted pin candidates into the `(start, end)`
/// span of whichever section each falls in.
pub(super) fn find_section_ranges(sections: &[Section], pins: &[usize]) -> Vec<(usize, usize)> {
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for &addr in pins {
        let Some(section) = sections.iter().find(|s| s.contains(addr)) else {
            continue;
        };
        let base = section.base();
        let end = base + section.capacity();
        if let Some(last) = ranges.last_mut() {
            if *last == (base, end) {
                continue;
            }
        }
        ranges.push((base, end));
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::major::MajorCollector;

    #[test]
    fn test_alloc_and_grow_sections() {
        let major = MarkSweepMajor::new(4096, 16384, false, false);
        let addr = major.alloc_heap(64).unwrap();
        assert!(addr != 0);
        assert_eq!(major.get_num_major_sections(), 1);
    }

    #[test]
    fn test_fixed_backend_refuses_growth_past_capacity() {
        let major = MarkSweepMajor::new(128, 128, true, false);
        assert!(major.alloc_heap(64).is_some());
        // Exhaust the single fixed section; a second object shouldn't grow
        // a new one.
        let mut allocated_more = false;
        for _ in 0..4 {
            if major.alloc_heap(64).is_some() {
                allocated_more = true;
            }
        }
        assert_eq!(major.get_num_major_sections(), 1);
        let _ = allocated_more;
    }

    #[test]
    fn test_sweep_reclaims_dead_and_fills_fragment() {
        let major = MarkSweepMajor::new(4096, 4096 * 4, false, false);
        let addr = major.alloc_heap(64).unwrap();
        let header = unsafe { &*(addr as *const GcHeader) };
        assert_eq!(header.mark(), MarkColor::White);

        let reclaimed = major.sweep();
        assert!(reclaimed > 0);

        // The space is now covered by a filler and reusable.
        let addr2 = major.alloc_heap(32).unwrap();
        assert!(addr2 != 0);
    }

    #[test]
    fn test_copy_or_mark_object_promotes_foreign_storage() {
        use crate::object::tags;

        let major = MarkSweepMajor::new(4096, 4096 * 4, false, false);
        let size = std::mem::size_of::<GcHeader>() + 32;
        // Storage the backend doesn't own, standing in for a nursery
        // object being promoted.
        let mut foreign = vec![0u8; size];
        let foreign_addr = foreign.as_mut_ptr() as usize;
        unsafe {
            std::ptr::write(
                foreign_addr as *mut GcHeader,
                GcHeader::new(tags::OBJECT, std::ptr::null()),
            );
        }

        let new_ptr = unsafe { major.copy_or_mark_object(foreign_addr as *const GcHeader, size) };
        assert!(new_ptr as usize != foreign_addr);

        let old_header = unsafe { &*(foreign_addr as *const GcHeader) };
        assert!(old_header.is_forwarded());
        assert_eq!(old_header.forward_address(), Some(new_ptr as usize));

        let new_header = unsafe { &*new_ptr };
        assert_eq!(new_header.mark(), MarkColor::Black);
    }

    #[test]
    fn test_sweep_keeps_marked_objects() {
        let major = MarkSweepMajor::new(4096, 4096 * 4, false, false);
        let addr = major.alloc_heap(64).unwrap();
        let header = unsafe { &*(addr as *const GcHeader) };
        header.set_mark(MarkColor::Black);

        let reclaimed = major.sweep();
        assert_eq!(reclaimed, 0);
    }
}
