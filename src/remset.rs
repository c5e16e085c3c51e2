//! Remembered sets: the cross-generation reference tracking that lets a
//! minor collection scan only "old objects that might point into the
//! nursery" instead of the whole old generation.
//!
//! Two backends, selected by `config::WriteBarrierKind`: a sequential
//! store buffer (bounded per-thread log, flushed into a global list) and a
//! card table (a flat dirty-byte array indexed by address). Both
//! implement the same `Remset` trait so `barrier.rs` can dispatch through
//! one without knowing which is configured, generalizing the teacher's
//! single hard-coded `RememberedSet`/`CardTable` pair in `barrier.rs` into
//! pluggable strategies (spec §4.3).

use std::cell::RefCell;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::object::GcHeader;

/// Bytes of heap covered by a single card.
pub const CARD_SIZE: usize = 512;

/// Common interface both remembered-set backends satisfy.
pub trait Remset: Send + Sync {
    /// Record that `field` (a pointer-sized slot inside an old object) was
    /// just written to point at a potential young-generation reference.
    ///
    /// # Safety
    /// `field` must be a valid, currently-writable pointer-to-pointer slot
    /// inside a live old-generation object.
    unsafe fn record(&self, field: *mut *const GcHeader);

    /// Visit every currently-recorded slot and clear the set afterward (a
    /// minor collection scans the remembered set exactly once per cycle).
    /// Each `visit` call receives the slot's *address*, not its value, so
    /// the minor collector can rewrite it once the object it currently
    /// points at has been evacuated.
    fn scan_and_clear(&self, visit: &mut dyn FnMut(*mut *const GcHeader));

    /// Approximate number of recorded entries, for stats/logging.
    fn len(&self) -> usize;

    /// Whether no entries are recorded.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-thread bounded sequential store buffer; overflow flushes eagerly
/// into a shared global set rather than growing unboundedly.
pub struct SsbRemset {
    local: RefCell<Vec<*mut *const GcHeader>>,
    global: Mutex<FxHashSet<usize>>,
    capacity: usize,
}

// The local buffer is only ever touched by the owning mutator thread; the
// global set is behind its own lock.
unsafe impl Send for SsbRemset {}
unsafe impl Sync for SsbRemset {}

impl SsbRemset {
    /// A new SSB remset with the given per-thread buffer capacity before
    /// an eager flush.
    pub fn new(capacity: usize) -> Self {
        Self {
            local: RefCell::new(Vec::with_capacity(capacity)),
            global: Mutex::new(FxHashSet::default()),
            capacity,
        }
    }

    fn flush_local(&self) {
        let mut local = self.local.borrow_mut();
        if local.is_empty() {
            return;
        }
        let mut global = self.global.lock();
        global.extend(local.drain(..).map(|p| p as usize));
    }
}

impl Default for SsbRemset {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Remset for SsbRemset {
    unsafe fn record(&self, field: *mut *const GcHeader) {
        let mut local = self.local.borrow_mut();
        local.push(field);
        if local.len() >= self.capacity {
            drop(local);
            self.flush_local();
        }
    }

    fn scan_and_clear(&self, visit: &mut dyn FnMut(*mut *const GcHeader)) {
        self.flush_local();
        let mut global = self.global.lock();
        for addr in global.drain() {
            visit(addr as *mut *const GcHeader);
        }
    }

    fn len(&self) -> usize {
        self.local.borrow().len() + self.global.lock().len()
    }
}

/// Flat byte-per-card dirty table covering the whole heap's address range.
///
/// Generalizes the teacher's fixed-region `CardTable` (`barrier.rs`) to be
/// indexed relative to a configurable heap base so a single table can
/// cover the old generation plus large-object space.
pub struct CardTableRemset {
    base: usize,
    cards: Vec<AtomicU8>,
}

impl CardTableRemset {
    /// A card table covering `[base, base + size)`.
    pub fn new(base: usize, size: usize) -> Self {
        let card_count = size.div_ceil(CARD_SIZE).max(1);
        Self {
            base,
            cards: (0..card_count).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    fn card_index(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        let idx = offset / CARD_SIZE;
        if idx < self.cards.len() {
            Some(idx)
        } else {
            None
        }
    }

    /// Mark the card containing `addr` dirty.
    pub fn mark_card(&self, addr: usize) {
        if let Some(idx) = self.card_index(addr) {
            self.cards[idx].store(1, Ordering::Release);
        }
    }

    /// Whether the card containing `addr` is dirty.
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.card_index(addr)
            .map(|idx| self.cards[idx].load(Ordering::Acquire) != 0)
            .unwrap_or(false)
    }

    /// Iterate the byte ranges of every dirty card, clearing each as it's
    /// visited.
    pub fn dirty_ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        for (idx, card) in self.cards.iter().enumerate() {
            if card.swap(0, Ordering::AcqRel) != 0 {
                let start = self.base + idx * CARD_SIZE;
                ranges.push((start, start + CARD_SIZE));
            }
        }
        ranges
    }
}

impl Remset for CardTableRemset {
    unsafe fn record(&self, field: *mut *const GcHeader) {
        self.mark_card(field as usize);
    }

    fn scan_and_clear(&self, visit: &mut dyn FnMut(*mut *const GcHeader)) {
        for (start, end) in self.dirty_ranges() {
            let mut cursor = start;
            while cursor < end {
                visit(cursor as *mut *const GcHeader);
                cursor += std::mem::size_of::<usize>();
            }
        }
    }

    fn len(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Acquire) != 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tags;

    #[test]
    fn test_ssb_record_and_scan() {
        let remset = SsbRemset::new(16);
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        let header_ptr: *const GcHeader = &header;
        let mut slot: *const GcHeader = header_ptr;
        let slot_ptr: *mut *const GcHeader = &mut slot;
        unsafe { remset.record(slot_ptr) };

        let mut seen = Vec::new();
        remset.scan_and_clear(&mut |p| seen.push(p));
        assert_eq!(seen, vec![slot_ptr]);
        assert!(remset.is_empty());
    }

    #[test]
    fn test_ssb_overflow_flush() {
        let remset = SsbRemset::new(4);
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        let header_ptr: *const GcHeader = &header;
        let mut slot: *const GcHeader = header_ptr;
        let slot_ptr: *mut *const GcHeader = &mut slot;
        for _ in 0..10 {
            unsafe { remset.record(slot_ptr) };
        }
        assert!(remset.len() <= 10);
    }

    #[test]
    fn test_card_table_mark_and_dirty() {
        let table = CardTableRemset::new(0x1000, 4096);
        assert!(!table.is_dirty(0x1000));
        table.mark_card(0x1000);
        assert!(table.is_dirty(0x1000));
        assert!(table.is_dirty(0x1000 + CARD_SIZE - 1));
        assert!(!table.is_dirty(0x1000 + CARD_SIZE));
    }

    #[test]
    fn test_card_table_dirty_ranges_clears() {
        let table = CardTableRemset::new(0, 4096);
        table.mark_card(0);
        table.mark_card(CARD_SIZE * 2);
        let ranges = table.dirty_ranges();
        assert_eq!(ranges.len(), 2);
        assert!(table.dirty_ranges().is_empty());
    }
}
