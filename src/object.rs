//! GC object layout: headers, descriptors, and forwarding.
//!
//! Two orthogonal concerns share the header: tri-color marking for the
//! mark-sweep major collector (tag/mark/mark_version, as before) and the
//! pin/forward state the copying nursery minor collector needs. A pinned
//! object is never moved; a forwarded object's second word holds the new
//! address instead of object data. The two states are mutually exclusive
//! per object, enforced by `GcHeader::pin` refusing to pin an already
//! forwarded header and vice versa.

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};

/// Global mark version counter.
/// Bumped at the start of each GC cycle instead of iterating all objects
/// to reset marks to White. An object is "white" (unmarked) if its
/// `mark_version` doesn't match this global counter — O(1) phase reset.
///
/// u32 (4 billion cycles) prevents the wrap-around correctness bug that
/// u8 had after 256 incremental GC cycles.
static MARK_VERSION: AtomicU32 = AtomicU32::new(0);

/// Get the current global mark version.
#[inline]
pub fn current_mark_version() -> u32 {
    MARK_VERSION.load(Ordering::Acquire)
}

/// Bump the global mark version (O(1) mark reset).
///
/// After bumping, all objects are effectively "white" because their
/// `mark_version` no longer matches the new global version.
#[inline]
pub fn bump_mark_version() -> u32 {
    MARK_VERSION.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
}

/// Mark color for tri-color marking.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkColor {
    /// Not yet visited.
    White = 0,
    /// In worklist, not yet scanned.
    Gray = 1,
    /// Fully scanned.
    Black = 2,
}

/// Per-object move state, tracked alongside the mark color.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveState {
    /// Object has not been pinned or forwarded.
    Normal = 0,
    /// Object is pinned for this cycle; the copying collector must not move it.
    Pinned = 1,
    /// Object has been evacuated; `forward` holds the new address.
    Forwarded = 2,
}

/// Precise-scanning descriptor for an object's shape.
///
/// Real runtimes attach one of these per class/shape rather than per
/// instance; the collector only ever sees it through the header's
/// `descriptor` pointer, so any layout that can answer "how big, and
/// which words are pointers" satisfies the contract.
pub struct GcDescriptor {
    /// Object size in bytes (header excluded), or 0 if variable-length
    /// (the object's own fields carry the length; see `ArrayDescriptor`
    /// convention in callers).
    pub size: usize,
    /// Runtime class id, opaque to the collector.
    pub class_id: u32,
    /// Whether this class participates in bridge (cross-runtime) cycle
    /// detection.
    pub is_bridge: bool,
    /// Whether instances require ordinary finalization.
    pub has_finalizer: bool,
    /// Whether instances require critical finalization (spec §9).
    pub has_critical_finalizer: bool,
    /// Precise trace function: invoked with a callback for each outgoing
    /// pointer field, given that field's *address* rather than its value,
    /// so a copying collector can overwrite it in place once the referent
    /// has been evacuated. `None` means "conservatively scan the whole
    /// object", used only under `StackMark::Conservative`-style degraded
    /// descriptors.
    pub trace: Option<fn(*const u8, &mut dyn FnMut(*mut *const GcHeader))>,
}

/// GC object header.
///
/// `descriptor` doubles as the forwarding-pointer slot: once `move_state`
/// is `Forwarded`, `descriptor` no longer points at a `GcDescriptor` but at
/// the object's new location, exactly the convention a copying collector
/// needs to leave a single forwarding word behind in evacuated space.
#[repr(C)]
pub struct GcHeader {
    /// Object/class descriptor, or forwarding address once forwarded.
    descriptor: AtomicPtr<GcDescriptor>,
    /// Mark bits for tri-color marking (White=0, Gray=1, Black=2).
    mark: AtomicU8,
    /// Pin/forward state.
    move_state: AtomicU8,
    /// Object type tag (coarse category, distinct from `class_id`).
    tag: u8,
    /// Explicit padding to align `mark_version` to a 4-byte boundary.
    _pad: u8,
    /// Logical mark version. Object is "white" if this doesn't match
    /// `MARK_VERSION`. u32 prevents the wrap-around bug a u8 counter has
    /// after 256 GC cycles.
    mark_version: AtomicU32,
    /// Forwarding address, valid only when `move_state == Forwarded`.
    forward: AtomicUsize,
}

impl GcHeader {
    /// Create a new header for an object described by `descriptor`.
    pub fn new(tag: u8, descriptor: *const GcDescriptor) -> Self {
        Self {
            descriptor: AtomicPtr::new(descriptor as *mut GcDescriptor),
            mark: AtomicU8::new(MarkColor::White as u8),
            move_state: AtomicU8::new(MoveState::Normal as u8),
            tag,
            _pad: 0,
            mark_version: AtomicU32::new(0),
            forward: AtomicUsize::new(0),
        }
    }

    /// Get mark color, taking logical versioning into account.
    ///
    /// If this object's `mark_version` doesn't match the global version,
    /// it's considered White (unmarked) regardless of the mark byte.
    #[inline]
    pub fn mark(&self) -> MarkColor {
        if self.mark_version.load(Ordering::Acquire) != current_mark_version() {
            return MarkColor::White;
        }
        match self.mark.load(Ordering::Acquire) {
            1 => MarkColor::Gray,
            2 => MarkColor::Black,
            _ => MarkColor::White,
        }
    }

    /// Set mark color.
    ///
    /// Also stamps the current global `mark_version` so the object is
    /// recognized as belonging to the current GC cycle.
    #[inline]
    pub fn set_mark(&self, color: MarkColor) {
        self.mark.store(color as u8, Ordering::Release);
        self.mark_version
            .store(current_mark_version(), Ordering::Release);
    }

    /// Get object tag.
    #[inline]
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// Descriptor pointer. Invalid to call once `is_forwarded()`.
    #[inline]
    pub fn descriptor(&self) -> *const GcDescriptor {
        self.descriptor.load(Ordering::Acquire)
    }

    /// Whether this object is pinned for the current cycle.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.move_state.load(Ordering::Acquire) == MoveState::Pinned as u8
    }

    /// Whether this object has been forwarded (evacuated).
    #[inline]
    pub fn is_forwarded(&self) -> bool {
        self.move_state.load(Ordering::Acquire) == MoveState::Forwarded as u8
    }

    /// Pin this object, preventing the copying collector from moving it.
    ///
    /// A no-op if already pinned. Panics (debug-only invariant) if the
    /// object has already been forwarded this cycle — pinning and
    /// forwarding are mutually exclusive per cycle.
    pub fn pin(&self) {
        let prev = self.move_state.load(Ordering::Acquire);
        debug_assert_ne!(
            prev,
            MoveState::Forwarded as u8,
            "cannot pin an already-forwarded object"
        );
        self.move_state
            .store(MoveState::Pinned as u8, Ordering::Release);
    }

    /// Record the forwarding address for an evacuated object.
    ///
    /// Panics (debug-only invariant) if the object is pinned.
    pub fn set_forward(&self, new_address: usize) {
        debug_assert_ne!(
            self.move_state.load(Ordering::Acquire),
            MoveState::Pinned as u8,
            "cannot forward a pinned object"
        );
        self.forward.store(new_address, Ordering::Release);
        self.move_state
            .store(MoveState::Forwarded as u8, Ordering::Release);
    }

    /// The forwarding address, if forwarded.
    #[inline]
    pub fn forward_address(&self) -> Option<usize> {
        if self.is_forwarded() {
            Some(self.forward.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Reset per-cycle move state back to `Normal` (called by the
    /// generation-0 reset at the start of a minor collection, once
    /// forwarded objects from the prior cycle have been fully promoted).
    pub fn reset_move_state(&self) {
        self.move_state
            .store(MoveState::Normal as u8, Ordering::Release);
    }
}

impl Clone for GcHeader {
    fn clone(&self) -> Self {
        // Cloned header starts fresh: unmarked, unpinned, unforwarded.
        Self {
            descriptor: AtomicPtr::new(self.descriptor.load(Ordering::Acquire)),
            mark: AtomicU8::new(MarkColor::White as u8),
            move_state: AtomicU8::new(MoveState::Normal as u8),
            tag: self.tag,
            _pad: 0,
            mark_version: AtomicU32::new(0),
            forward: AtomicUsize::new(0),
        }
    }
}

/// Trait for GC-managed objects.
pub trait GcObject {
    /// Get the GC header.
    fn header(&self) -> &GcHeader;

    /// Trace references to other objects.
    fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader));
}

/// Object type tags.
pub mod tags {
    /// String object.
    pub const STRING: u8 = 1;
    /// Array object.
    pub const ARRAY: u8 = 2;
    /// Plain object.
    pub const OBJECT: u8 = 3;
    /// Function object.
    pub const FUNCTION: u8 = 4;
    /// Closure object.
    pub const CLOSURE: u8 = 5;
    /// Nursery array-fill filler object (spec §3 "fragment list").
    pub const FILLER: u8 = 255;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_marking() {
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        assert_eq!(header.mark(), MarkColor::White);

        header.set_mark(MarkColor::Gray);
        assert_eq!(header.mark(), MarkColor::Gray);

        header.set_mark(MarkColor::Black);
        assert_eq!(header.mark(), MarkColor::Black);
    }

    #[test]
    fn test_logical_versioning() {
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());

        header.set_mark(MarkColor::Black);
        assert_eq!(header.mark(), MarkColor::Black);

        bump_mark_version();
        assert_eq!(header.mark(), MarkColor::White);

        header.set_mark(MarkColor::Gray);
        assert_eq!(header.mark(), MarkColor::Gray);
    }

    #[test]
    fn test_pin_forward_exclusive() {
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        assert!(!header.is_pinned());
        assert!(!header.is_forwarded());

        header.pin();
        assert!(header.is_pinned());
        assert_eq!(header.forward_address(), None);

        header.reset_move_state();
        header.set_forward(0xdead_beef);
        assert!(header.is_forwarded());
        assert!(!header.is_pinned());
        assert_eq!(header.forward_address(), Some(0xdead_beef));
    }
}
