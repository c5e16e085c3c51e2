//! Finalization: ordinary and critical finalizer scheduling (spec §3
//! "finalize-ready entry", §4.6 step 9, §9 critical-finalizer ordering).
//!
//! Targets are tracked weakly — a registration does not keep its target
//! alive. Once a target is confirmed dead, its entry moves to a pending
//! queue for the runtime to drain and run outside the collector. Critical
//! finalizers are kept in a separate list and drained after ordinary ones:
//! SGen runs them last so a critical finalizer can safely touch
//! runtime-owned resources ordinary finalizers may have already released
//! indirectly.

use std::cell::RefCell;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::object::{GcHeader, MarkColor};

/// A single registered finalization target.
struct FinalizeEntry {
    /// Weak pointer to the target's header (not traced).
    target_header: *const GcHeader,
    /// Index into the runtime's held-values array for this registration.
    entry_index: u32,
}

/// Weak target-tracking state for one `FinalizationRegistry`-shaped
/// object. Held values, unregister tokens, and the cleanup callback live
/// on the runtime's own wrapper object and are traced there; this struct
/// only tracks which targets have died.
pub struct FinalizationRegistryData {
    entries: RefCell<Vec<FinalizeEntry>>,
    critical_entries: RefCell<Vec<FinalizeEntry>>,
    pending_indices: RefCell<Vec<u32>>,
    pending_critical_indices: RefCell<Vec<u32>>,
    next_index: RefCell<u32>,
}

unsafe impl Send for FinalizationRegistryData {}
unsafe impl Sync for FinalizationRegistryData {}

impl FinalizationRegistryData {
    /// A new, empty registry.
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            critical_entries: RefCell::new(Vec::new()),
            pending_indices: RefCell::new(Vec::new()),
            pending_critical_indices: RefCell::new(Vec::new()),
            next_index: RefCell::new(0),
        }
    }

    fn next(&self) -> u32 {
        let idx = *self.next_index.borrow();
        *self.next_index.borrow_mut() = idx + 1;
        idx
    }

    /// Register an ordinary finalization target, returning its entry
    /// index.
    pub fn register(&self, target_header: *const GcHeader) -> u32 {
        let idx = self.next();
        self.entries.borrow_mut().push(FinalizeEntry {
            target_header,
            entry_index: idx,
        });
        idx
    }

    /// Register a critical finalization target, returning its entry
    /// index. Critical finalizers run in their own pass, after every
    /// ordinary finalizer has run (spec §9).
    pub fn register_critical(&self, target_header: *const GcHeader) -> u32 {
        let idx = self.next();
        self.critical_entries.borrow_mut().push(FinalizeEntry {
            target_header,
            entry_index: idx,
        });
        idx
    }

    /// Remove every entry (ordinary and critical) registered for
    /// `target_header`. Returns whether anything was removed.
    pub fn unregister_by_target(&self, target_header: *const GcHeader) -> bool {
        let before = self.entries.borrow().len() + self.critical_entries.borrow().len();
        self.entries
            .borrow_mut()
            .retain(|e| e.target_header != target_header);
        self.critical_entries
            .borrow_mut()
            .retain(|e| e.target_header != target_header);
        self.entries.borrow().len() + self.critical_entries.borrow().len() != before
    }

    /// Remove entries by index (from an unregister-token lookup). Returns
    /// whether anything was removed.
    pub fn unregister_indices(&self, indices: &[u32]) -> bool {
        let before = self.entries.borrow().len() + self.critical_entries.borrow().len();
        self.entries
            .borrow_mut()
            .retain(|e| !indices.contains(&e.entry_index));
        self.critical_entries
            .borrow_mut()
            .retain(|e| !indices.contains(&e.entry_index));
        self.entries.borrow().len() + self.critical_entries.borrow().len() != before
    }

    /// Check every registered target and queue dead ones for cleanup.
    /// Ordinary and critical entries are queued into separate pending
    /// lists so the runtime can drain ordinary finalizers to completion
    /// before starting critical ones.
    ///
    /// # Safety
    /// Must be called during the gray-stack finisher, once marking has
    /// reached a fixpoint so every header's mark color is final for this
    /// cycle.
    pub unsafe fn sweep_dead_targets(&self) {
        sweep_list(&self.entries, &self.pending_indices);
        sweep_list(&self.critical_entries, &self.pending_critical_indices);
    }

    /// Drain pending ordinary-finalizer entry indices.
    pub fn drain_pending(&self) -> Vec<u32> {
        self.pending_indices.borrow_mut().drain(..).collect()
    }

    /// Drain pending critical-finalizer entry indices. The runtime must
    /// ensure every `drain_pending` callback has finished running before
    /// calling this, to preserve SGen's ordinary-before-critical ordering.
    pub fn drain_pending_critical(&self) -> Vec<u32> {
        self.pending_critical_indices.borrow_mut().drain(..).collect()
    }

    /// Whether any ordinary finalizer is pending.
    pub fn has_pending(&self) -> bool {
        !self.pending_indices.borrow().is_empty()
    }

    /// Whether any critical finalizer is pending.
    pub fn has_pending_critical(&self) -> bool {
        !self.pending_critical_indices.borrow().is_empty()
    }

    /// Gray-stack finisher step 6: resurrect and queue every entry whose
    /// target is currently unreachable. Unlike `sweep_dead_targets`, this
    /// shades the target *before* testing reachability of anything else,
    /// so the object and everything it references stays alive long enough
    /// for the finalizer to run, per spec §4.6 step 6 ("mark it reachable
    /// by treating it as a root and tracing from it"). Returns whether any
    /// entry was resurrected this call, so the finisher can loop to a
    /// fixpoint (resurrecting one object can be what makes another
    /// finalizable object's target reachable).
    ///
    /// # Safety
    /// Must be called only while a collection's mark phase is active, with
    /// every registered target still a valid header.
    pub unsafe fn process_finish(&self, shade: &mut dyn FnMut(*const GcHeader)) -> bool {
        let ordinary = unsafe { resurrect_dead(&self.entries, &self.pending_indices, shade) };
        let critical =
            unsafe { resurrect_dead(&self.critical_entries, &self.pending_critical_indices, shade) };
        ordinary || critical
    }
}

unsafe fn resurrect_dead(
    entries: &RefCell<Vec<FinalizeEntry>>,
    pending: &RefCell<Vec<u32>>,
    shade: &mut dyn FnMut(*const GcHeader),
) -> bool {
    let mut entries = entries.borrow_mut();
    let mut pending = pending.borrow_mut();
    let before = entries.len();

    entries.retain(|entry| {
        if entry.target_header.is_null() {
            return false;
        }
        // SAFETY: caller guarantees targets remain valid headers until
        // this pass runs.
        let header = unsafe { &*entry.target_header };
        if header.mark() == MarkColor::White {
            shade(entry.target_header);
            pending.push(entry.entry_index);
            false
        } else {
            true
        }
    });

    entries.len() != before
}

unsafe fn sweep_list(
    entries: &RefCell<Vec<FinalizeEntry>>,
    pending: &RefCell<Vec<u32>>,
) {
    let mut entries = entries.borrow_mut();
    let mut pending = pending.borrow_mut();

    entries.retain(|entry| {
        if entry.target_header.is_null() {
            return false;
        }
        // SAFETY: caller guarantees this runs once mark bits are final
        // for the cycle, and that registered targets remain valid headers
        // until this sweep runs.
        let header = unsafe { &*entry.target_header };
        if header.mark() == MarkColor::White {
            pending.push(entry.entry_index);
            false
        } else {
            true
        }
    });
}

impl Default for FinalizationRegistryData {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a single finalizer entry. Installed on the collector by the
/// embedder (mirrors `BridgeCallback`/`ToggleRefCallback` in
/// [`crate::bridge`]/[`crate::finisher`]) so the collector can drive the
/// background finalizer thread without knowing how a registry's held
/// values or cleanup callback are represented on the runtime side.
pub trait FinalizerCallback: Send + Sync {
    /// Run the finalizer for `entry_index` in `registry`. `critical`
    /// distinguishes a critical finalizer, which the caller guarantees
    /// runs only after every non-critical entry across every registry has
    /// already run this drain.
    fn run(&self, registry: &Arc<FinalizationRegistryData>, entry_index: u32, critical: bool);
}

/// Wake signal sent to a running [`FinalizerThread`].
enum Signal {
    /// New finalizers may be pending; drain and run them.
    Wake,
    /// Drain whatever is pending one last time, then exit.
    Shutdown,
}

/// A dedicated background thread that drains and runs finalizers as they
/// become pending, so the mutator and collector never block waiting for
/// runtime-supplied finalizer code to return. The collector only ever
/// queues entry indices (`sweep_dead_targets`/`process_finish`); running
/// the callbacks themselves happens here, off the STW path, matching how
/// SGen's `finalizer-thread.c` runs independently of the collector.
///
/// The thread blocks on a `crossbeam_channel` receiver between wakeups
/// rather than polling, so an idle runtime costs nothing.
pub struct FinalizerThread {
    sender: Sender<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl FinalizerThread {
    /// Spawn the thread. `drain` is called after every wake-up (and once
    /// more on shutdown) and should run every currently pending finalizer
    /// to completion across every registry the runtime knows about.
    pub fn spawn<F>(drain: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (sender, receiver): (Sender<Signal>, Receiver<Signal>) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("gc-finalizer".to_string())
            .spawn(move || {
                let drain = drain;
                loop {
                    match receiver.recv() {
                        Ok(Signal::Wake) => {
                            // Coalesce any further wakeups queued while we
                            // were already about to drain.
                            while let Ok(Signal::Wake) = receiver.try_recv() {}
                            drain();
                        }
                        Ok(Signal::Shutdown) | Err(_) => {
                            drain();
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn gc-finalizer thread");

        Self {
            sender,
            handle: Some(handle),
        }
    }

    /// Notify the thread that new finalizers may be pending. Never blocks;
    /// safe to call from within a stop-the-world pause. A full channel
    /// (unbounded, so never full in practice) or a dead receiver is not an
    /// error — the thread either already will or never will drain again.
    pub fn notify(&self) {
        let _ = self.sender.send(Signal::Wake);
    }

    /// Ask the thread to drain one last time and exit, then block until it
    /// has. Called from `Drop` if the owner never calls it explicitly.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.send(Signal::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for FinalizerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FinalizerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizerThread")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

/// Drains pending ordinary and critical finalizer entry indices from every
/// known registry and invokes `run` for each, preserving the
/// ordinary-before-critical ordering `FinalizationRegistryData` already
/// enforces per-registry. Intended as the `drain` closure body passed to
/// [`FinalizerThread::spawn`] by the owner that holds the registry list
/// (the collector keeps registries behind a lock, so this takes an owned
/// snapshot rather than borrowing).
pub fn drain_registries(
    registries: &[Arc<FinalizationRegistryData>],
    mut run: impl FnMut(&Arc<FinalizationRegistryData>, u32, bool),
) {
    for registry in registries {
        for idx in registry.drain_pending() {
            run(registry, idx, false);
        }
    }
    for registry in registries {
        for idx in registry.drain_pending_critical() {
            run(registry, idx, true);
        }
    }
}

impl std::fmt::Debug for FinalizationRegistryData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizationRegistryData")
            .field("entries", &self.entries.borrow().len())
            .field("critical_entries", &self.critical_entries.borrow().len())
            .field("pending", &self.pending_indices.borrow().len())
            .field("pending_critical", &self.pending_critical_indices.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tags;

    #[test]
    fn test_process_finish_resurrects_before_queuing() {
        let registry = FinalizationRegistryData::new();
        let target = GcHeader::new(tags::OBJECT, std::ptr::null());
        registry.register(&target);

        let mut shaded = Vec::new();
        let changed = unsafe { registry.process_finish(&mut |h| shaded.push(h)) };

        assert!(changed);
        assert_eq!(shaded, vec![&target as *const GcHeader]);
        assert_eq!(registry.drain_pending(), vec![0]);

        let again = unsafe { registry.process_finish(&mut |_| {}) };
        assert!(!again);
    }

    #[test]
    fn test_register_and_unregister_by_target() {
        let registry = FinalizationRegistryData::new();
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        registry.register(&header);
        assert!(registry.unregister_by_target(&header));
        assert!(!registry.unregister_by_target(&header));
    }

    #[test]
    fn test_sweep_queues_dead_targets() {
        let registry = FinalizationRegistryData::new();
        let dead = GcHeader::new(tags::OBJECT, std::ptr::null());
        let live = GcHeader::new(tags::OBJECT, std::ptr::null());
        live.set_mark(MarkColor::Black);

        registry.register(&dead);
        registry.register(&live);

        unsafe { registry.sweep_dead_targets() };
        assert!(registry.has_pending());
        assert_eq!(registry.drain_pending(), vec![0]);
        assert!(!registry.has_pending());
    }

    #[test]
    fn test_critical_finalizers_pend_separately() {
        let registry = FinalizationRegistryData::new();
        let ordinary = GcHeader::new(tags::OBJECT, std::ptr::null());
        let critical = GcHeader::new(tags::OBJECT, std::ptr::null());

        registry.register(&ordinary);
        registry.register_critical(&critical);

        unsafe { registry.sweep_dead_targets() };

        assert!(registry.has_pending());
        assert!(registry.has_pending_critical());

        let ordinary_pending = registry.drain_pending();
        assert_eq!(ordinary_pending.len(), 1);
        assert!(registry.has_pending_critical());

        let critical_pending = registry.drain_pending_critical();
        assert_eq!(critical_pending.len(), 1);
        assert!(!registry.has_pending_critical());
    }

    #[test]
    fn test_finalizer_thread_drains_on_notify() {
        let ran = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ran_in_thread = ran.clone();
        let mut thread = FinalizerThread::spawn(move || {
            ran_in_thread.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        thread.notify();
        thread.shutdown();

        assert!(ran.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_finalizer_thread_drains_on_shutdown_without_notify() {
        let ran = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ran_in_thread = ran.clone();
        let mut thread = FinalizerThread::spawn(move || {
            ran_in_thread.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        thread.shutdown();

        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drain_registries_runs_ordinary_before_critical() {
        let registry = Arc::new(FinalizationRegistryData::new());
        let ordinary = GcHeader::new(tags::OBJECT, std::ptr::null());
        let critical = GcHeader::new(tags::OBJECT, std::ptr::null());
        registry.register(&ordinary);
        registry.register_critical(&critical);
        unsafe { registry.sweep_dead_targets() };

        let mut order = Vec::new();
        drain_registries(std::slice::from_ref(&registry), |_, idx, is_critical| {
            order.push((idx, is_critical));
        });

        assert_eq!(order, vec![(0, false), (1, true)]);
    }
}
