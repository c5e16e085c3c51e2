//! Root tables: normal, pinned, and write-barriered root registrations.
//!
//! A root is any memory location the runtime guarantees to keep pointing
//! at a live object (or null) for as long as it's registered: globals,
//! handle-scope slots, VM register spill areas. Three tables exist because
//! each needs slightly different treatment during a collection: normal
//! roots are just traced, pinned roots additionally pin their target
//! in-place, and write-barriered roots must go through the barrier when
//! the runtime updates them directly (rather than through a managed
//! field write) so the remembered set still sees the store.

use rustc_hash::FxHashMap;

use crate::object::GcHeader;

/// How a root's precise layout is described to the collector.
pub enum RootDescriptor {
    /// The root is itself a single `*const GcHeader` slot (or an array of
    /// them, `count` wide).
    Slots { count: usize },
    /// A bitmap where bit `i` set means word `i` of the root range is a
    /// pointer.
    Bitmap(Vec<u64>),
    /// Runtime-supplied precise mark callback, invoked with the root's
    /// base address.
    UserMarkFn(fn(usize, &mut dyn FnMut(*const GcHeader))),
    /// No precise layout available; every word in the range is a
    /// conservative pointer candidate.
    Conservative,
}

/// Which table a root belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    /// Traced only.
    Normal,
    /// Traced, and the referenced object is pinned for this cycle.
    Pinned,
    /// Traced; mutation of this root's slots must go through the write
    /// barrier.
    WriteBarriered,
}

/// A single registered root range.
pub struct RootEntry {
    /// Start address of the root range.
    pub start: usize,
    /// Length of the root range in bytes.
    pub len: usize,
    /// How to interpret the range's contents.
    pub descriptor: RootDescriptor,
}

impl RootEntry {
    /// Trace this root's outgoing pointers into `visit`.
    pub fn trace(&self, visit: &mut dyn FnMut(*const GcHeader)) {
        match &self.descriptor {
            RootDescriptor::Slots { count } => {
                for i in 0..*count {
                    // SAFETY: the runtime guarantees `start..start+len`
                    // is a valid, readable array of `*const GcHeader`.
                    let slot =
                        unsafe { *(self.start as *const *const GcHeader).add(i) };
                    if !slot.is_null() {
                        visit(slot);
                    }
                }
            }
            RootDescriptor::Bitmap(bits) => {
                for (word_idx, word) in bits.iter().enumerate() {
                    for bit in 0..64 {
                        if word & (1 << bit) != 0 {
                            let idx = word_idx * 64 + bit;
                            // SAFETY: bitmap only sets bits within the
                            // registered range.
                            let slot = unsafe {
                                *(self.start as *const *const GcHeader).add(idx)
                            };
                            if !slot.is_null() {
                                visit(slot);
                            }
                        }
                    }
                }
            }
            RootDescriptor::UserMarkFn(f) => f(self.start, visit),
            RootDescriptor::Conservative => {
                let words = self.len / std::mem::size_of::<usize>();
                for i in 0..words {
                    // SAFETY: conservative scan only inspects bytes within
                    // the registered, runtime-owned range.
                    let word = unsafe { *(self.start as *const usize).add(i) };
                    visit(word as *const GcHeader);
                }
            }
        }
    }

    /// Trace this root's outgoing pointers as rewritable slots rather than
    /// plain values, so a copying collector can fix them up once the
    /// referent moves. Only `Slots` and `Bitmap` expose real addresses;
    /// `UserMarkFn` has no slot to hand back (the runtime owns that
    /// layout) and `Conservative` roots are always pinned rather than
    /// moved, so both fall back to tracing by value through `visit_value`
    /// with no fixup opportunity.
    pub fn trace_mut(
        &self,
        visit: &mut dyn FnMut(*mut *const GcHeader),
        visit_value: &mut dyn FnMut(*const GcHeader),
    ) {
        match &self.descriptor {
            RootDescriptor::Slots { count } => {
                for i in 0..*count {
                    // SAFETY: the runtime guarantees `start..start+len` is
                    // a valid, writable array of `*const GcHeader`.
                    let slot = unsafe { (self.start as *mut *const GcHeader).add(i) };
                    if !unsafe { *slot }.is_null() {
                        visit(slot);
                    }
                }
            }
            RootDescriptor::Bitmap(bits) => {
                for (word_idx, word) in bits.iter().enumerate() {
                    for bit in 0..64 {
                        if word & (1 << bit) != 0 {
                            let idx = word_idx * 64 + bit;
                            // SAFETY: bitmap only sets bits within the
                            // registered, writable range.
                            let slot = unsafe { (self.start as *mut *const GcHeader).add(idx) };
                            if !unsafe { *slot }.is_null() {
                                visit(slot);
                            }
                        }
                    }
                }
            }
            RootDescriptor::UserMarkFn(f) => f(self.start, visit_value),
            RootDescriptor::Conservative => self.trace(visit_value),
        }
    }
}

/// The three root tables, keyed by start address for O(1)
/// register/unregister.
#[derive(Default)]
pub struct RootTable {
    normal: FxHashMap<usize, RootEntry>,
    pinned: FxHashMap<usize, RootEntry>,
    write_barriered: FxHashMap<usize, RootEntry>,
}

impl RootTable {
    /// An empty root table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a root under the given kind.
    pub fn register(&mut self, kind: RootKind, entry: RootEntry) {
        let table = self.table_mut(kind);
        table.insert(entry.start, entry);
    }

    /// Unregister a previously-registered root by its start address.
    /// Returns whether a root was actually removed.
    pub fn unregister(&mut self, kind: RootKind, start: usize) -> bool {
        self.table_mut(kind).remove(&start).is_some()
    }

    fn table_mut(&mut self, kind: RootKind) -> &mut FxHashMap<usize, RootEntry> {
        match kind {
            RootKind::Normal => &mut self.normal,
            RootKind::Pinned => &mut self.pinned,
            RootKind::WriteBarriered => &mut self.write_barriered,
        }
    }

    /// Trace every root in all three tables into `visit`.
    pub fn trace_all(&self, visit: &mut dyn FnMut(*const GcHeader)) {
        for entry in self.normal.values() {
            entry.trace(visit);
        }
        for entry in self.pinned.values() {
            entry.trace(visit);
        }
        for entry in self.write_barriered.values() {
            entry.trace(visit);
        }
    }

    /// Trace the normal and write-barriered tables — the two kinds whose
    /// targets the copying minor collector is free to relocate — as
    /// rewritable slots, so evacuation can fix each root up in place.
    /// Pinned roots are excluded: their targets never move, so
    /// `trace_pinned`'s value-based trace is all they ever need.
    pub fn trace_all_mut(
        &self,
        visit: &mut dyn FnMut(*mut *const GcHeader),
        visit_value: &mut dyn FnMut(*const GcHeader),
    ) {
        for entry in self.normal.values() {
            entry.trace_mut(visit, visit_value);
        }
        for entry in self.write_barriered.values() {
            entry.trace_mut(visit, visit_value);
        }
    }

    /// Trace only the pinned-root table, additionally pinning each
    /// reachable target (spec §4.2: pinned roots pin their targets before
    /// the copying minor collector runs).
    pub fn trace_pinned(&self, visit: &mut dyn FnMut(*const GcHeader)) {
        for entry in self.pinned.values() {
            entry.trace(&mut |header| {
                if !header.is_null() {
                    // SAFETY: visit only receives headers produced by
                    // `RootEntry::trace`, which the runtime guarantees
                    // point at live headers.
                    unsafe { (*header).pin() };
                }
                visit(header);
            });
        }
    }

    /// Total number of registered roots across all tables.
    pub fn len(&self) -> usize {
        self.normal.len() + self.pinned.len() + self.write_barriered.len()
    }

    /// Whether no roots are registered anywhere.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tags;
    use std::cell::Cell;

    #[test]
    fn test_register_and_unregister() {
        let mut table = RootTable::new();
        let slot: Cell<*const GcHeader> = Cell::new(std::ptr::null());
        table.register(
            RootKind::Normal,
            RootEntry {
                start: slot.as_ptr() as usize,
                len: std::mem::size_of::<usize>(),
                descriptor: RootDescriptor::Slots { count: 1 },
            },
        );
        assert_eq!(table.len(), 1);
        assert!(table.unregister(RootKind::Normal, slot.as_ptr() as usize));
        assert!(table.is_empty());
    }

    #[test]
    fn test_trace_slots() {
        let mut table = RootTable::new();
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        let header_ptr: *const GcHeader = &header;
        let slot: Cell<*const GcHeader> = Cell::new(header_ptr);

        table.register(
            RootKind::Normal,
            RootEntry {
                start: slot.as_ptr() as usize,
                len: std::mem::size_of::<usize>(),
                descriptor: RootDescriptor::Slots { count: 1 },
            },
        );

        let mut seen = Vec::new();
        table.trace_all(&mut |h| seen.push(h));
        assert_eq!(seen, vec![header_ptr]);
    }

    #[test]
    fn test_trace_pinned_pins_target() {
        let mut table = RootTable::new();
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        let header_ptr: *const GcHeader = &header;
        let slot: Cell<*const GcHeader> = Cell::new(header_ptr);

        table.register(
            RootKind::Pinned,
            RootEntry {
                start: slot.as_ptr() as usize,
                len: std::mem::size_of::<usize>(),
                descriptor: RootDescriptor::Slots { count: 1 },
            },
        );

        table.trace_pinned(&mut |_| {});
        assert!(header.is_pinned());
    }
}
