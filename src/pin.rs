//! Pin queue: conservative-scan candidates awaiting resolution to objects.
//!
//! Conservative stack/register scanning produces a flood of candidate
//! addresses, most of which aren't really pointers. The pin queue buffers
//! them during the scan phase; `optimize()` then sorts, dedupes, and
//! partitions by owning section so each candidate is resolved exactly once
//! against the right section's scan-start index (spec §4.2).

use parking_lot::Mutex;

use crate::object::GcHeader;
use crate::section::Section;

/// Buffer of masked candidate addresses collected during conservative
/// stack/register scanning, not yet resolved to objects.
#[derive(Default)]
pub struct PinQueue {
    candidates: Mutex<Vec<usize>>,
}

impl PinQueue {
    /// An empty pin queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a candidate address. Called once per conservative
    /// stack/register word during the scan phase; no filtering happens
    /// here, only in `optimize`.
    pub fn push(&self, addr: usize) {
        self.candidates.lock().push(addr);
    }

    /// Number of raw (pre-optimize) candidates recorded.
    pub fn len(&self) -> usize {
        self.candidates.lock().len()
    }

    /// Whether the queue holds no candidates.
    pub fn is_empty(&self) -> bool {
        self.candidates.lock().is_empty()
    }

    /// Sort, dedupe, and return the candidate list ready for per-section
    /// resolution. Clears the internal buffer.
    pub fn optimize(&self) -> Vec<usize> {
        let mut candidates = self.candidates.lock();
        let mut sorted = std::mem::take(&mut *candidates);
        sorted.sort_unstable();
        sorted.dedup();
        sorted
    }

    /// Resolve every optimized candidate against `sections` (tried in
    /// order; each candidate belongs to at most one) and pin the objects
    /// found. Returns the pinned objects' header addresses, sorted and
    /// deduped (the nursery's post-collection fragment rebuild needs this
    /// exact list to know which ranges it must leave untouched).
    ///
    /// # Safety
    /// No section in `sections` may be concurrently bump-allocated into
    /// (true during the STW pause this runs in).
    pub unsafe fn resolve_and_pin(&self, sections: &[&Section]) -> Vec<usize> {
        let candidates = self.optimize();
        let mut pinned = Vec::new();
        let mut last_header: Option<*const GcHeader> = None;

        for addr in candidates {
            let Some(section) = sections.iter().find(|s| s.contains(addr)) else {
                continue;
            };
            // SAFETY: caller guarantees exclusive access to `sections`.
            let Some(header) = (unsafe { section.resolve_candidate(addr) }) else {
                continue;
            };
            if last_header == Some(header) {
                continue;
            }
            last_header = Some(header);
            // SAFETY: `resolve_candidate` only returns pointers to live
            // headers within the section's allocated range.
            unsafe { (*header).pin() };
            pinned.push(header as usize);
        }

        pinned
    }

    /// Discard all candidates without resolving them (used when a
    /// collection is aborted before pinning runs).
    pub fn clear(&self) {
        self.candidates.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_len() {
        let queue = PinQueue::new();
        queue.push(100);
        queue.push(200);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_optimize_sorts_and_dedupes() {
        let queue = PinQueue::new();
        for addr in [300, 100, 200, 100, 300] {
            queue.push(addr);
        }
        assert_eq!(queue.optimize(), vec![100, 200, 300]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_resolve_and_pin_against_section() {
        let section = Section::new(4096);
        let addr = section.bump_alloc(64).unwrap();

        let queue = PinQueue::new();
        // A candidate pointing into the middle of the object should still
        // resolve to its header.
        queue.push(addr + 8);
        queue.push(0xffff_ffff); // out of range, ignored

        let pinned = unsafe { queue.resolve_and_pin(&[&section]) };
        assert_eq!(pinned, vec![addr]);

        let header = unsafe { &*(addr as *const GcHeader) };
        assert!(header.is_pinned());
    }
}
