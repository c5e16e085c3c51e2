//! Large object store: mark-and-sweep-only storage for oversized objects.
//!
//! Objects at or above `large_object_threshold` bypass the nursery and the
//! copying/mark-sweep major spaces entirely — they are allocated once,
//! never moved, and reclaimed only by sweeping this store. Grounded on the
//! teacher's `heap::LargeObjectSpace` (an unordered `Vec` of boxed
//! allocations) and generalized into an intrusive free-list the way
//! `mmtk-core`'s `policy::largeobjectspace` treads its object list each
//! collection.

use parking_lot::Mutex;

use crate::object::{GcHeader, MarkColor};

/// A single large-object allocation: a heap-owned buffer plus its header,
/// with caller-registered drop/trace callbacks so the store can reclaim
/// it generically.
pub struct LosObject {
    /// Raw buffer. The `GcHeader` lives at offset 0; the payload follows.
    buffer: Box<[u8]>,
    /// Size of the payload following the header, in bytes.
    payload_size: usize,
    /// Invoked with the payload pointer to trace outgoing references.
    trace_fn: Option<Box<dyn Fn(*const u8, &mut dyn FnMut(*const GcHeader))>>,
    /// Invoked with the payload pointer when the object is swept.
    drop_fn: Option<Box<dyn Fn(*mut u8)>>,
}

impl LosObject {
    fn header(&self) -> &GcHeader {
        // SAFETY: the header always occupies the first bytes of `buffer`.
        unsafe { &*(self.buffer.as_ptr() as *const GcHeader) }
    }

    fn payload_ptr(&self) -> *const u8 {
        unsafe { self.buffer.as_ptr().add(std::mem::size_of::<GcHeader>()) }
    }

    /// Total bytes occupied, including the header.
    pub fn total_size(&self) -> usize {
        self.buffer.len()
    }
}

/// Store of all live large objects, mark-and-swept only.
///
/// Locked as a whole during collection (the STW pause makes per-object
/// locking unnecessary); allocation takes the same lock, matching the
/// teacher's `RwLock<LargeObjectSpace>` pattern in `heap.rs` generalized
/// to a `Mutex` since both readers here (trace, sweep) also mutate state.
pub struct LargeObjectStore {
    objects: Mutex<Vec<LosObject>>,
}

impl Default for LargeObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LargeObjectStore {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
        }
    }

    /// Register a large allocation. The caller has already constructed the
    /// buffer with a valid `GcHeader` at offset 0.
    pub fn insert(
        &self,
        buffer: Box<[u8]>,
        payload_size: usize,
        trace_fn: Option<Box<dyn Fn(*const u8, &mut dyn FnMut(*const GcHeader))>>,
        drop_fn: Option<Box<dyn Fn(*mut u8)>>,
    ) -> *const GcHeader {
        let mut objects = self.objects.lock();
        objects.push(LosObject {
            buffer,
            payload_size,
            trace_fn,
            drop_fn,
        });
        objects.last().unwrap().header() as *const GcHeader
    }

    /// Number of live large objects.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Whether the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Total bytes held across all large objects.
    pub fn total_bytes(&self) -> usize {
        self.objects.lock().iter().map(LosObject::total_size).sum()
    }

    /// Resolve a whole-heap conservative candidate to the large object it
    /// falls within, if any (spec §4.5: "an LOS object is pinned if any
    /// candidate lies within `[data, data+size)`"). LOS storage never
    /// moves, so "pinning" one only means shading it reachable; there is no
    /// move-state to set.
    pub fn resolve_candidate(&self, addr: usize) -> Option<*const GcHeader> {
        let objects = self.objects.lock();
        objects.iter().find_map(|obj| {
            let payload = obj.payload_ptr() as usize;
            if addr >= payload && addr < payload + obj.payload_size {
                Some(obj.header() as *const GcHeader)
            } else {
                None
            }
        })
    }

    /// Whether `header` names a large object held by this store (as
    /// opposed to nursery or major-generation storage). Used by the major
    /// collection driver to route a traced pointer to the right
    /// mark-only-vs-evacuate handling before it ever reaches
    /// `MajorCollector::copy_or_mark_object`, which assumes ownership of
    /// whatever it's handed.
    pub fn contains(&self, header: *const GcHeader) -> bool {
        self.objects
            .lock()
            .iter()
            .any(|obj| obj.header() as *const GcHeader == header)
    }

    /// Trace every reachable large object's outgoing references into
    /// `visit`. Called for large objects already marked black (i.e. only
    /// reached from the gray queue, not as a root scan).
    pub fn trace_marked(&self, visit: &mut dyn FnMut(*const GcHeader)) {
        let objects = self.objects.lock();
        for obj in objects.iter() {
            if obj.header().mark() == MarkColor::Black {
                if let Some(trace_fn) = &obj.trace_fn {
                    trace_fn(obj.payload_ptr(), visit);
                }
            }
        }
    }

    /// Visit every live large object's header, in store order. Used by
    /// whole-heap enumeration (`walk_heap`) rather than tracing.
    pub fn for_each(&self, visit: &mut dyn FnMut(*const GcHeader)) {
        let objects = self.objects.lock();
        for obj in objects.iter() {
            visit(obj.header() as *const GcHeader);
        }
    }

    /// Trace a single large object's outgoing references, regardless of
    /// its mark color (used by the gray-stack finisher and domain-unload's
    /// reachability walks, which trace objects shaded mid-pass rather than
    /// only those already black). Returns whether `header` named a large
    /// object in this store.
    pub fn trace_one(&self, header: *const GcHeader, visit: &mut dyn FnMut(*const GcHeader)) -> bool {
        let objects = self.objects.lock();
        let Some(obj) = objects.iter().find(|obj| obj.header() as *const GcHeader == header) else {
            return false;
        };
        if let Some(trace_fn) = &obj.trace_fn {
            trace_fn(obj.payload_ptr(), visit);
        }
        true
    }

    /// Sweep: drop every object not marked black, keep the rest. Returns
    /// the number of bytes reclaimed.
    pub fn sweep(&self) -> usize {
        let mut objects = self.objects.lock();
        let mut reclaimed = 0usize;
        objects.retain(|obj| {
            let keep = obj.header().mark() == MarkColor::Black;
            if !keep {
                reclaimed += obj.total_size();
                if let Some(drop_fn) = &obj.drop_fn {
                    drop_fn(obj.payload_ptr() as *mut u8);
                }
            }
            keep
        });
        reclaimed
    }

    /// Drop every object for which `keep` returns false, regardless of
    /// mark color (domain unload's LOS pass, spec §4.7 step 6 — teardown
    /// there is driven by domain ownership, not reachability). Returns
    /// the number of bytes reclaimed.
    pub fn sweep_matching(&self, keep: &dyn Fn(*const GcHeader) -> bool) -> usize {
        let mut objects = self.objects.lock();
        let mut reclaimed = 0usize;
        objects.retain(|obj| {
            let header = obj.header() as *const GcHeader;
            let keep = keep(header);
            if !keep {
                reclaimed += obj.total_size();
                if let Some(drop_fn) = &obj.drop_fn {
                    drop_fn(obj.payload_ptr() as *mut u8);
                }
            }
            keep
        });
        reclaimed
    }

    /// Drop every large object unconditionally (used by domain unload).
    pub fn clear(&self) -> usize {
        let mut objects = self.objects.lock();
        let reclaimed = objects.iter().map(LosObject::total_size).sum();
        for obj in objects.iter() {
            if let Some(drop_fn) = &obj.drop_fn {
                drop_fn(obj.payload_ptr() as *mut u8);
            }
        }
        objects.clear();
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tags;

    fn make_buffer(payload_size: usize) -> Box<[u8]> {
        let total = std::mem::size_of::<GcHeader>() + payload_size;
        let mut buffer = vec![0u8; total].into_boxed_slice();
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        unsafe {
            std::ptr::write(buffer.as_mut_ptr() as *mut GcHeader, header);
        }
        buffer
    }

    #[test]
    fn test_insert_and_total_bytes() {
        let store = LargeObjectStore::new();
        let buffer = make_buffer(8192);
        let total = buffer.len();
        store.insert(buffer, 8192, None, None);
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_bytes(), total);
    }

    #[test]
    fn test_sweep_reclaims_unmarked() {
        let store = LargeObjectStore::new();
        store.insert(make_buffer(1024), 1024, None, None);
        store.insert(make_buffer(2048), 2048, None, None);
        let reclaimed = store.sweep();
        assert!(reclaimed > 0);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_sweep_keeps_marked() {
        let store = LargeObjectStore::new();
        let ptr = store.insert(make_buffer(512), 512, None, None);
        unsafe {
            (*ptr).set_mark(MarkColor::Black);
        }
        let reclaimed = store.sweep();
        assert_eq!(reclaimed, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sweep_matching_drops_selected() {
        let store = LargeObjectStore::new();
        let target = store.insert(make_buffer(128), 128, None, None);
        store.insert(make_buffer(128), 128, None, None);
        let reclaimed = store.sweep_matching(&|h| h != target);
        assert!(reclaimed > 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_clear_drops_everything() {
        let store = LargeObjectStore::new();
        store.insert(make_buffer(64), 64, None, None);
        store.insert(make_buffer(64), 64, None, None);
        let reclaimed = store.clear();
        assert!(reclaimed > 0);
        assert!(store.is_empty());
    }
}
