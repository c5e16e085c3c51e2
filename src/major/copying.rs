//! Copying (evacuating) major-collector backend (spec §6 `major=copying`).
//!
//! A classic semispace design: `from` holds the old generation's current
//! contents, `to` is where this cycle's survivors are evacuated to. Once
//! tracing finishes, `sweep` retires `from` and promotes `to` into its
//! place. Pinned objects (conservative-scan hits from the whole-heap pin
//! pass, spec §4.5) cannot be relocated mid-cycle, so they're kept on a
//! side list that survives every flip untouched — the same accommodation
//! SGen's major collector makes for "pinned major blocks" when running in
//! copying mode.
//!
//! Grounded on the forwarding-pointer convention already built into
//! `object::GcHeader` (the teacher's design) and on `mmtk-core`'s
//! semispace `copyspace`/`flip` shape for the two-space bookkeeping.

use parking_lot::Mutex;

use crate::object::{GcHeader, MarkColor};
use crate::section::Section;

pub struct CopyingMajor {
    from: Mutex<Vec<Section>>,
    to: Mutex<Vec<Section>>,
    /// Objects pinned during whole-heap conservative scanning; excluded
    /// from evacuation and kept across every flip.
    pinned: Mutex<Vec<*const GcHeader>>,
    section_size: usize,
    max_sections: usize,
}

// `pinned` holds raw pointers into `from`'s storage, touched only while
// the world is stopped.
unsafe impl Send for CopyingMajor {}
unsafe impl Sync for CopyingMajor {}

impl CopyingMajor {
    pub fn new(section_size: usize, max_heap_size: usize) -> Self {
        // Semispace doubles the working set; halve the section budget so
        // `max_heap_size` still bounds total resident bytes.
        let max_sections = (max_heap_size / (section_size.max(1) * 2)).max(1);
        Self {
            from: Mutex::new(vec![Section::new(section_size)]),
            to: Mutex::new(Vec::new()),
            pinned: Mutex::new(Vec::new()),
            section_size,
            max_sections,
        }
    }

    fn bump_into(sections: &mut Vec<Section>, section_size: usize, max_sections: usize, size: usize) -> Option<usize> {
        if let Some(addr) = sections.iter().find_map(|s| s.bump_alloc(size)) {
            return Some(addr);
        }
        if sections.len() >= max_sections {
            return None;
        }
        sections.push(Section::new(section_size.max(size)));
        sections.last().unwrap().bump_alloc(size)
    }
}

impl super::MajorCollector for CopyingMajor {
    fn alloc_heap(&self, size: usize) -> Option<usize> {
        let mut from = self.from.lock();
        Self::bump_into(&mut from, self.section_size, self.max_sections, size)
    }

    fn start_major_collection(&self) {
        crate::object::bump_mark_version();
        self.to.lock().clear();
    }

    fn sweep(&self) -> usize {
        let mut from = self.from.lock();
        let mut to = self.to.lock();
        let reclaimed: usize = from.iter().map(Section::used).sum();
        let promoted: usize = to.iter().map(Section::used).sum();
        // Flip: this cycle's survivors (`to`) become the new `from`; the
        // retired space is left in `to` until the next cycle clears it,
        // reusing its backing storage instead of reallocating.
        std::mem::swap(&mut *from, &mut *to);
        reclaimed.saturating_sub(promoted)
    }

    fn iterate_objects(&self, visit: &mut dyn FnMut(*const GcHeader)) {
        let from = self.from.lock();
        for section in from.iter() {
            let mut cursor = section.base();
            let limit = section.base() + section.used();
            let header_size = std::mem::size_of::<GcHeader>();
            while cursor < limit {
                // SAFETY: `from` after a flip contains only this cycle's
                // survivors, laid down contiguously by bump allocation.
                let header = unsafe { &*(cursor as *const GcHeader) };
                let descriptor = header.descriptor();
                let payload = if descriptor.is_null() {
                    0
                } else {
                    unsafe { (*descriptor).size }
                };
                visit(cursor as *const GcHeader);
                cursor += header_size + payload;
            }
        }
        for &header in self.pinned.lock().iter() {
            visit(header);
        }
    }

    unsafe fn copy_or_mark_object(&self, header: *const GcHeader, size: usize) -> *const GcHeader {
        // SAFETY: caller guarantees `header` is live and not yet forwarded.
        let header_ref = unsafe { &*header };
        if header_ref.is_pinned() {
            header_ref.set_mark(MarkColor::Black);
            return header;
        }

        let mut to = self.to.lock();
        let Some(new_addr) = Self::bump_into(&mut to, self.section_size, self.max_sections, size) else {
            // Evacuation space exhausted: degrade to leaving the object in
            // place, matching spec §9's note that evacuation OOM is a
            // recoverable condition, not a fatal one.
            header_ref.set_mark(MarkColor::Black);
            return header;
        };

        // SAFETY: `new_addr` is a freshly bump-allocated, exclusively
        // owned region at least `size` bytes long; `header`..`header+size`
        // is the object's full, live extent.
        unsafe {
            std::ptr::copy_nonoverlapping(header as *const u8, new_addr as *mut u8, size);
        }
        let new_header = unsafe { &*(new_addr as *const GcHeader) };
        new_header.reset_move_state();
        new_header.set_mark(MarkColor::Black);
        header_ref.set_forward(new_addr);
        new_addr as *const GcHeader
    }

    unsafe fn minor_scan_object(&self, header: *const GcHeader, visit: &mut dyn FnMut(*const GcHeader)) {
        // SAFETY: forwarded to the slot-based scan, read-only from here.
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
        if let Some(trace) = unsafe { (*descriptor).trace } {
            let payload = unsafe { (header as *const u8).add(std::mem::size_of::<GcHeader>()) };
            trace(payload, visit);
        }
    }

    unsafe fn is_object_live(&self, header: *const GcHeader) -> bool {
        // SAFETY: caller guarantees `header` is live/valid to read.
        unsafe { (*header).mark() == MarkColor::Black || (*header).is_forwarded() }
    }

    fn get_num_major_sections(&self) -> usize {
        self.from.lock().len()
    }

    fn section_size(&self) -> usize {
        self.section_size
    }

    fn find_pin_queue_start_ends(&self, pins: &[usize]) -> Vec<(usize, usize)> {
        super::mark_sweep::find_section_ranges(&self.from.lock(), pins)
    }

    unsafe fn pin_objects(&self, headers: &[*const GcHeader]) {
        let mut pinned = self.pinned.lock();
        for &header in headers {
            // SAFETY: caller guarantees every header is live.
            unsafe { (*header).pin() };
            if !pinned.contains(&header) {
                pinned.push(header);
            }
        }
    }

    unsafe fn free_pinned_object(&self, header: *const GcHeader) {
        self.pinned.lock().retain(|&h| h != header);
    }

    unsafe fn free_non_pinned_object(&self, _header: *const GcHeader) {
        // Non-pinned storage in a copying space is reclaimed by the next
        // flip, not freed piecemeal; domain unload relies on `sweep`
        // running afterward to drop anything left unmarked.
    }

    fn supports_cardtable(&self) -> bool {
        false
    }

    fn is_parallel(&self) -> bool {
        false
    }

    unsafe fn resolve_pin_candidate(&self, addr: usize) -> Option<*const GcHeader> {
        let from = self.from.lock();
        let section = from.iter().find(|s| s.contains(addr))?;
        // SAFETY: caller guarantees no concurrent allocation into `section`.
        unsafe { section.resolve_candidate(addr) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::major::MajorCollector;
    use crate::object::tags;

    #[test]
    fn test_alloc_heap_bump_allocates() {
        let major = CopyingMajor::new(4096, 65536);
        let addr = major.alloc_heap(64).unwrap();
        assert!(addr != 0);
    }

    #[test]
    fn test_copy_or_mark_evacuates_into_to_space() {
        let major = CopyingMajor::new(4096, 65536);
        let size = std::mem::size_of::<GcHeader>() + 32;
        let addr = major.alloc_heap(size).unwrap();
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        unsafe { std::ptr::write(addr as *mut GcHeader, header) };

        major.start_major_collection();
        let new_ptr = unsafe { major.copy_or_mark_object(addr as *const GcHeader, size) };
        assert!(new_ptr != addr as *const GcHeader);

        let old_header = unsafe { &*(addr as *const GcHeader) };
        assert!(old_header.is_forwarded());
        assert_eq!(old_header.forward_address(), Some(new_ptr as usize));
    }

    #[test]
    fn test_pinned_object_is_not_moved() {
        let major = CopyingMajor::new(4096, 65536);
        let size = std::mem::size_of::<GcHeader>() + 16;
        let addr = major.alloc_heap(size).unwrap();
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        unsafe { std::ptr::write(addr as *mut GcHeader, header) };

        let ptr = addr as *const GcHeader;
        unsafe { major.pin_objects(&[ptr]) };

        major.start_major_collection();
        let result = unsafe { major.copy_or_mark_object(ptr, size) };
        assert_eq!(result, ptr);
    }
}
