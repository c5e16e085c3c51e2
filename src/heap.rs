//! Heap: the shared state a collection operates over — bounds, the root
//! table, the large object store, and the STW controller. Generation-
//! specific storage (the nursery's sections, the major collector's
//! blocks/sections) is owned by `nursery.rs` and `major.rs` respectively
//! and reached through here.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::GcConfig;
use crate::los::LargeObjectStore;
use crate::root::RootTable;
use crate::stw::StwController;

/// Shared heap state, reference-counted so mutator threads, the
/// collector, and the worker pool can all hold a handle.
pub struct GcHeap {
    config: GcConfig,
    /// Bytes allocated since the last major collection, across nursery
    /// promotion, direct old-gen allocation, and large objects — the
    /// input to the allowance heuristic (spec §4.8).
    allocated: AtomicUsize,
    /// Bytes reclaimed by the most recent major collection.
    last_major_reclaimed: AtomicUsize,
    /// Current minor-collection allowance (spec §4.8), recomputed after
    /// every major collection from `allowance::recompute`. Starts at the
    /// soft heap limit so the first major collection isn't triggered
    /// purely by an uninitialized allowance of zero.
    allowance: AtomicUsize,
    roots: RwLock<RootTable>,
    large_objects: LargeObjectStore,
    stw: StwController,
    /// Set when a minor collection's nursery rebuild finds no usable
    /// capacity left after pinning (every byte up to the high-water mark
    /// is occupied by survivors). Cleared the next time a rebuild finds
    /// room again.
    degraded: AtomicBool,
}

impl GcHeap {
    /// Create a heap with default configuration.
    pub fn new() -> Arc<Self> {
        Self::with_config(GcConfig::default())
    }

    /// Create a heap with the given configuration. Panics if the
    /// configuration failed validation; callers that parsed configuration
    /// from strings should call `GcConfig::validate` themselves and handle
    /// `GcError` before reaching this constructor.
    pub fn with_config(config: GcConfig) -> Arc<Self> {
        config
            .validate()
            .expect("GcConfig must be validated before constructing a GcHeap");
        let initial_allowance = config.soft_heap_limit;
        Arc::new(Self {
            config,
            allocated: AtomicUsize::new(0),
            last_major_reclaimed: AtomicUsize::new(0),
            allowance: AtomicUsize::new(initial_allowance),
            roots: RwLock::new(RootTable::new()),
            large_objects: LargeObjectStore::new(),
            stw: StwController::new(),
            degraded: AtomicBool::new(false),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// The large object store.
    pub fn large_objects(&self) -> &LargeObjectStore {
        &self.large_objects
    }

    /// The root table.
    pub fn roots(&self) -> &RwLock<RootTable> {
        &self.roots
    }

    /// The stop-the-world controller.
    pub fn stw(&self) -> &StwController {
        &self.stw
    }

    /// Bytes allocated since the last major collection.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Record newly allocated bytes (called by the nursery, old-gen
    /// direct allocation, and LOS allocation paths).
    pub fn record_allocated(&self, bytes: usize) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Reset the allocation counter (called once a major collection has
    /// run and the allowance has been recomputed from it).
    pub fn reset_allocated(&self) {
        self.allocated.store(0, Ordering::Relaxed);
    }

    /// Bytes reclaimed by the most recent major collection.
    pub fn last_major_reclaimed(&self) -> usize {
        self.last_major_reclaimed.load(Ordering::Relaxed)
    }

    /// Record the outcome of the most recent major collection.
    pub fn set_last_major_reclaimed(&self, bytes: usize) {
        self.last_major_reclaimed.store(bytes, Ordering::Relaxed);
    }

    /// Current minor-collection allowance (spec §4.8).
    pub fn allowance(&self) -> usize {
        self.allowance.load(Ordering::Relaxed)
    }

    /// Replace the allowance with a freshly recomputed value.
    pub fn set_allowance(&self, allowance: usize) {
        self.allowance.store(allowance, Ordering::Relaxed);
    }

    /// Whether the nursery is currently degraded: the last minor
    /// collection's rebuild found no usable capacity after pinning.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Record whether the nursery is degraded, per the outcome of the most
    /// recent rebuild.
    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }

    /// Whether accumulated allocation exceeds the configured soft limit,
    /// a coarse trigger independent of the allowance heuristic.
    pub fn exceeds_soft_limit(&self) -> bool {
        self.allocated() as f64 > self.config.soft_heap_limit as f64 * 0.9
    }
}

// GcHeap's fields are all individually synchronized (atomics, RwLock,
// internally-locked stores); the struct as a whole is safe to share.
unsafe impl Send for GcHeap {}
unsafe impl Sync for GcHeap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_creation_defaults() {
        let heap = GcHeap::new();
        assert_eq!(heap.allocated(), 0);
        assert_eq!(heap.last_major_reclaimed(), 0);
    }

    #[test]
    fn test_record_and_reset_allocated() {
        let heap = GcHeap::new();
        heap.record_allocated(1024);
        assert_eq!(heap.allocated(), 1024);
        heap.reset_allocated();
        assert_eq!(heap.allocated(), 0);
    }

    #[test]
    fn test_exceeds_soft_limit() {
        let mut config = GcConfig::default();
        config.soft_heap_limit = 1000;
        let heap = GcHeap::with_config(config);
        assert!(!heap.exceeds_soft_limit());
        heap.record_allocated(950);
        assert!(heap.exceeds_soft_limit());
    }
}
