//! Ephemeron tables for weak key-value mappings (WeakMap/WeakSet
//! semantics, spec §4.6 step 5-6, §3 "ephemeron array").
//!
//! An ephemeron (key, value) entry is retained only while the key is
//! reachable from roots; once the key dies, the value is released too
//! (unless reachable some other way). Correctly marking these requires
//! fixpoint iteration over the gray-stack finisher's ephemeron pass:
//! repeatedly sweep the table marking values whose keys turned black,
//! until a pass marks nothing new.
//!
//! Dead entries are tombstoned rather than removed outright during a
//! domain unload's first pass, so the second pass (which frees the
//! underlying storage) can distinguish "entry never existed" from "key
//! died this cycle" — see `domain.rs`.

use std::cell::RefCell;

use rustc_hash::FxHashMap;

use crate::object::{GcHeader, MarkColor};

/// Sentinel key-pointer value marking an entry whose key has died but
/// whose slot is kept around until the next full sweep/compaction.
pub const TOMBSTONE: usize = usize::MAX;

/// Ephemeron entry: (key, value) where value is only live if key is live.
struct EphemeronEntry {
    /// Pointer to key's GC header (for identity comparison), or
    /// `TOMBSTONE` once the key has died.
    key_ptr: usize,
    /// The value (kept alive only if key is alive). Stored as raw bytes
    /// to avoid type-erasing issues.
    value: Vec<u8>,
    /// Type-specific drop function.
    drop_fn: Option<unsafe fn(*mut u8)>,
}

// SAFETY: entries are only touched under the table's single RefCell,
// itself only ever accessed from the thread that owns the table.
unsafe impl Send for EphemeronEntry {}
unsafe impl Sync for EphemeronEntry {}

/// Ephemeron table backing one WeakMap/WeakSet instance.
pub struct EphemeronTable {
    entries: RefCell<FxHashMap<usize, EphemeronEntry>>,
}

unsafe impl Send for EphemeronTable {}
unsafe impl Sync for EphemeronTable {}

impl std::fmt::Debug for EphemeronTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeronTable")
            .field("entry_count", &self.entries.borrow().len())
            .finish()
    }
}

impl EphemeronTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(FxHashMap::default()),
        }
    }

    /// Set or update an entry.
    ///
    /// # Safety
    /// `key` must point to a valid, live `GcHeader`; `drop_fn`, if given,
    /// must correctly deallocate `value_bytes`' contents.
    pub unsafe fn set_raw(
        &self,
        key: *const GcHeader,
        value_bytes: Vec<u8>,
        drop_fn: Option<unsafe fn(*mut u8)>,
    ) {
        let entry = EphemeronEntry {
            key_ptr: key as usize,
            value: value_bytes,
            drop_fn,
        };
        self.entries.borrow_mut().insert(key as usize, entry);
    }

    /// Get the value for a key, if present and not tombstoned.
    ///
    /// # Safety
    /// `key` must point to a valid, live `GcHeader`.
    pub unsafe fn get_raw(&self, key: *const GcHeader) -> Option<Vec<u8>> {
        self.entries
            .borrow()
            .get(&(key as usize))
            .filter(|e| e.key_ptr != TOMBSTONE)
            .map(|entry| entry.value.clone())
    }

    /// Whether `key` has a live (non-tombstoned) entry.
    ///
    /// # Safety
    /// `key` must point to a valid `GcHeader` (may be dead).
    pub unsafe fn has(&self, key: *const GcHeader) -> bool {
        self.entries
            .borrow()
            .get(&(key as usize))
            .is_some_and(|e| e.key_ptr != TOMBSTONE)
    }

    /// Remove an entry outright (used by explicit `WeakMap::delete`, not
    /// by GC sweeping, which tombstones instead). Returns whether an entry
    /// existed.
    ///
    /// # Safety
    /// `key` must point to a valid `GcHeader` (may be dead).
    pub unsafe fn delete(&self, key: *const GcHeader) -> bool {
        let mut entries = self.entries.borrow_mut();
        if let Some(entry) = entries.remove(&(key as usize)) {
            if let Some(drop_fn) = entry.drop_fn {
                // SAFETY: drop_fn was registered by the same caller that
                // produced value, under the same contract as `set_raw`.
                unsafe { drop_fn(entry.value.as_ptr() as *mut u8) };
            }
            true
        } else {
            false
        }
    }

    /// One fixpoint pass: for every entry whose key is marked black, trace
    /// its value (shading whatever `GcHeader` it points to). Returns the
    /// number of values that transitioned from white to non-white this
    /// pass, so the caller can detect a fixpoint (spec §4.6 step 6).
    ///
    /// # Safety
    /// Must be called only while a collection's mark phase is in
    /// progress; `tracer` must correctly shade any header it's given.
    pub unsafe fn trace_live_entries(&self, tracer: &mut dyn FnMut(*const GcHeader)) -> usize {
        let entries = self.entries.borrow();
        let mut newly_marked = 0;

        for entry in entries.values() {
            if entry.key_ptr == TOMBSTONE || entry.key_ptr == 0 {
                continue;
            }
            // SAFETY: non-tombstoned entries always hold a pointer
            // obtained from a live header at insertion time; it remains
            // valid to dereference until the cycle's sweep runs.
            let key_header = unsafe { &*(entry.key_ptr as *const GcHeader) };
            if key_header.mark() != MarkColor::Black {
                continue;
            }
            if entry.value.len() < std::mem::size_of::<*const GcHeader>() {
                continue;
            }
            let value_header_ptr =
                unsafe { *(entry.value.as_ptr() as *const *const GcHeader) };
            if value_header_ptr.is_null() {
                continue;
            }
            // SAFETY: same contract as above, applied to the value slot.
            let value_header = unsafe { &*value_header_ptr };
            if value_header.mark() == MarkColor::White {
                newly_marked += 1;
            }
            tracer(value_header_ptr);
        }

        newly_marked
    }

    /// Tombstone every entry whose key did not survive marking (white).
    /// Does not free the tombstoned slots; a subsequent `compact` call (or
    /// table drop) does that. Returns the number of entries tombstoned.
    ///
    /// # Safety
    /// Must be called after marking has reached a fixpoint.
    pub unsafe fn sweep(&self) -> usize {
        let mut entries = self.entries.borrow_mut();
        let mut tombstoned = 0;

        for entry in entries.values_mut() {
            if entry.key_ptr == TOMBSTONE {
                continue;
            }
            // SAFETY: see `trace_live_entries`.
            let key_header = unsafe { &*(entry.key_ptr as *const GcHeader) };
            if key_header.mark() != MarkColor::Black {
                if let Some(drop_fn) = entry.drop_fn {
                    // SAFETY: see `delete`.
                    unsafe { drop_fn(entry.value.as_ptr() as *mut u8) };
                }
                entry.key_ptr = TOMBSTONE;
                entry.value.clear();
                tombstoned += 1;
            }
        }

        tombstoned
    }

    /// Physically remove every tombstoned slot. Separated from `sweep` so
    /// a domain unload can tombstone first, neutralize cross-domain
    /// references, and only then reclaim storage (spec §4.7).
    pub fn compact(&self) {
        self.entries
            .borrow_mut()
            .retain(|_, entry| entry.key_ptr != TOMBSTONE);
    }

    /// Number of entries, including tombstoned ones not yet compacted.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether the table holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Remove and drop every entry immediately.
    pub fn clear(&self) {
        let mut entries = self.entries.borrow_mut();
        for (_, entry) in entries.drain() {
            if entry.key_ptr != TOMBSTONE {
                if let Some(drop_fn) = entry.drop_fn {
                    // SAFETY: see `delete`.
                    unsafe { drop_fn(entry.value.as_ptr() as *mut u8) };
                }
            }
        }
    }
}

impl Default for EphemeronTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EphemeronTable {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tags;

    #[test]
    fn test_set_and_get() {
        let table = EphemeronTable::new();
        let key_header = GcHeader::new(tags::OBJECT, std::ptr::null());
        let key_ptr = &key_header as *const GcHeader;

        let value: u64 = 42;
        let value_bytes = value.to_le_bytes().to_vec();

        unsafe { table.set_raw(key_ptr, value_bytes.clone(), None) };

        assert_eq!(table.len(), 1);
        assert!(unsafe { table.has(key_ptr) });
        assert_eq!(unsafe { table.get_raw(key_ptr) }, Some(value_bytes));
    }

    #[test]
    fn test_delete() {
        let table = EphemeronTable::new();
        let key_header = GcHeader::new(tags::OBJECT, std::ptr::null());
        let key_ptr = &key_header as *const GcHeader;

        unsafe {
            table.set_raw(key_ptr, vec![1], None);
            assert!(table.delete(key_ptr));
            assert_eq!(table.len(), 0);
            assert!(!table.delete(key_ptr));
        }
    }

    #[test]
    fn test_sweep_tombstones_dead_keys_then_compact() {
        let table = EphemeronTable::new();
        let dead_key = GcHeader::new(tags::OBJECT, std::ptr::null());
        let live_key = GcHeader::new(tags::OBJECT, std::ptr::null());
        live_key.set_mark(MarkColor::Black);

        unsafe {
            table.set_raw(&dead_key, vec![1], None);
            table.set_raw(&live_key, vec![2], None);

            let tombstoned = table.sweep();
            assert_eq!(tombstoned, 1);
            assert_eq!(table.len(), 2); // tombstone still occupies a slot
            assert!(!table.has(&dead_key));
            assert!(table.has(&live_key));

            table.compact();
            assert_eq!(table.len(), 1);
        }
    }

    #[test]
    fn test_clear() {
        let table = EphemeronTable::new();
        for i in 0..10u8 {
            let key_header = GcHeader::new(i, std::ptr::null());
            let key_ptr = Box::leak(Box::new(key_header)) as *const GcHeader;
            unsafe { table.set_raw(key_ptr, vec![i], None) };
        }
        assert_eq!(table.len(), 10);
        table.clear();
        assert_eq!(table.len(), 0);
        assert!(table.is_empty());
    }
}
