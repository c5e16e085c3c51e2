//! Weak references and disappearing links (spec §3 "disappearing link",
//! §4.6 steps 7-8).
//!
//! `WeakRefCell` backs a simple `WeakRef`-style handle: it never traces
//! its target, so the target can die independent of how many weak
//! references point at it. `DisappearingLink` generalizes this to the
//! tracked/untracked distinction a managed runtime's GC handle table
//! needs: a *tracking* link is cleared and the runtime notified the
//! instant its target dies (used for resurrection-sensitive handles,
//! e.g. finalization callbacks); a *non-tracking* link is simply cleared
//! with no further signal.

use std::cell::Cell;

use crate::object::GcHeader;

/// A single weak reference cell, as used by a `WeakRef`-shaped handle.
pub struct WeakRefCell {
    target_header: Cell<*const GcHeader>,
    alive: Cell<bool>,
}

// Confined to the thread that owns the handle; the GC only ever clears it
// during a collection the owning thread is suspended for.
unsafe impl Send for WeakRefCell {}
unsafe impl Sync for WeakRefCell {}

impl WeakRefCell {
    /// A new weak reference to `target_header`.
    pub fn new(target_header: *const GcHeader) -> Self {
        Self {
            target_header: Cell::new(target_header),
            alive: Cell::new(true),
        }
    }

    /// The target header pointer, if still alive.
    pub fn target(&self) -> Option<*const GcHeader> {
        if self.alive.get() {
            let ptr = self.target_header.get();
            (!ptr.is_null()).then_some(ptr)
        } else {
            None
        }
    }

    /// Whether the target is still alive.
    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    /// Clear the reference. Called by the collector once the target has
    /// been confirmed dead during the gray-stack finisher's weak-link
    /// pass.
    pub fn clear(&self) {
        self.target_header.set(std::ptr::null());
        self.alive.set(false);
    }
}

impl std::fmt::Debug for WeakRefCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakRefCell")
            .field("alive", &self.alive.get())
            .finish()
    }
}

/// Whether a disappearing link additionally tracks resurrection, i.e.
/// whether the runtime must be notified the moment the target is
/// confirmed dead (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Cleared silently when the target dies.
    NonTracking,
    /// Cleared, and the owning runtime slot is queued for notification.
    Tracking,
}

/// A disappearing link: a weak slot whose address is stored
/// bitwise-negated while live (so a stray conservative scan can't
/// mistake it for a strong root) and zeroed once the target is
/// confirmed dead.
pub struct DisappearingLink {
    /// Bitwise-negated target address, or `0` once cleared.
    negated_target: Cell<usize>,
    kind: LinkKind,
}

unsafe impl Send for DisappearingLink {}
unsafe impl Sync for DisappearingLink {}

impl DisappearingLink {
    /// Register a new disappearing link to `target`.
    pub fn new(target: *const GcHeader, kind: LinkKind) -> Self {
        Self {
            negated_target: Cell::new(!(target as usize)),
            kind,
        }
    }

    /// The link's tracking mode.
    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    /// The target header, if the link has not yet been cleared.
    pub fn target(&self) -> Option<*const GcHeader> {
        let negated = self.negated_target.get();
        if negated == 0 {
            None
        } else {
            Some((!negated) as *const GcHeader)
        }
    }

    /// Whether the link's target is still registered (not yet cleared).
    /// Does not by itself imply the target is live — the collector calls
    /// `clear` exactly when it determines the target is dead.
    pub fn is_registered(&self) -> bool {
        self.negated_target.get() != 0
    }

    /// Clear the link (spec §4.6 step 7: called once the target is
    /// confirmed unreachable).
    pub fn clear(&self) {
        self.negated_target.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tags;

    #[test]
    fn test_weak_ref_cell_clear() {
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        let cell = WeakRefCell::new(&header);
        assert!(cell.is_alive());
        assert_eq!(cell.target(), Some(&header as *const GcHeader));

        cell.clear();
        assert!(!cell.is_alive());
        assert_eq!(cell.target(), None);
    }

    #[test]
    fn test_disappearing_link_negation_roundtrip() {
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        let ptr: *const GcHeader = &header;
        let link = DisappearingLink::new(ptr, LinkKind::Tracking);

        assert_eq!(link.target(), Some(ptr));
        assert!(link.is_registered());
        assert_eq!(link.kind(), LinkKind::Tracking);

        link.clear();
        assert_eq!(link.target(), None);
        assert!(!link.is_registered());
    }
}
