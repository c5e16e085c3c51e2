//! Gray queue: the tracing worklist shared between root scanning, the
//! minor/major collectors, and the parallel worker pool.
//!
//! Objects enter Gray when first reached, and leave (turn Black) once
//! their outgoing references have been pushed. A `parking_lot::Mutex`
//! around a `VecDeque` is enough here — the worker pool contends on it far
//! less than on the per-worker local batches it drains into (see
//! `worker.rs`).

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::object::{GcHeader, MarkColor};

/// Shared gray worklist.
#[derive(Default)]
pub struct GrayQueue {
    queue: Mutex<VecDeque<*const GcHeader>>,
}

// Headers are pushed/popped only while the world is stopped or by worker
// threads cooperating through this queue's own lock.
unsafe impl Send for GrayQueue {}
unsafe impl Sync for GrayQueue {}

impl GrayQueue {
    /// An empty gray queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `header` if it is non-null, unmarked, and not already black —
    /// i.e. the standard tri-color "shade" operation. Marks it Gray and
    /// enqueues it. Returns whether it was actually pushed.
    pub fn shade(&self, header: *const GcHeader) -> bool {
        if header.is_null() {
            return false;
        }
        // SAFETY: callers only pass pointers obtained from root/field
        // tracing, which always point at live headers.
        let header_ref = unsafe { &*header };
        if header_ref.mark() != MarkColor::White {
            return false;
        }
        header_ref.set_mark(MarkColor::Gray);
        self.queue.lock().push_back(header);
        true
    }

    /// Pop one item for tracing, if any.
    pub fn pop(&self) -> Option<*const GcHeader> {
        self.queue.lock().pop_front()
    }

    /// Pop up to `n` items at once, for a worker to take as a local batch.
    pub fn pop_batch(&self, n: usize) -> Vec<*const GcHeader> {
        let mut queue = self.queue.lock();
        let take = n.min(queue.len());
        queue.drain(..take).collect()
    }

    /// Push a batch back (used by a worker that traced objects and
    /// discovered further gray candidates).
    pub fn push_batch(&self, items: impl IntoIterator<Item = *const GcHeader>) {
        self.queue.lock().extend(items);
    }

    /// Whether the queue (and by extension, this phase of tracing) is
    /// drained.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drain and discard everything (used when aborting a cycle).
    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tags;

    #[test]
    fn test_shade_marks_gray_once() {
        let queue = GrayQueue::new();
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        let ptr: *const GcHeader = &header;

        assert!(queue.shade(ptr));
        assert_eq!(header.mark(), MarkColor::Gray);
        assert_eq!(queue.len(), 1);

        // Shading an already-gray object is a no-op.
        assert!(!queue.shade(ptr));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_shade_ignores_null() {
        let queue = GrayQueue::new();
        assert!(!queue.shade(std::ptr::null()));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_batch() {
        let queue = GrayQueue::new();
        let headers: Vec<GcHeader> = (0..5)
            .map(|_| GcHeader::new(tags::OBJECT, std::ptr::null()))
            .collect();
        for h in &headers {
            queue.shade(h as *const GcHeader);
        }
        let batch = queue.pop_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(queue.len(), 2);
    }
}
