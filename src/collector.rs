//! Top-level orchestration: wires every component together and drives the
//! minor/major collection cycles. `api.rs`'s public `Gc` handle is a thin
//! wrapper around [`GcCollector`] — this module owns the actual state and
//! sequencing; `api.rs` owns naming the entry points spec §6 requires.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::bridge::{BridgeCallback, BridgeRegistry};
use crate::config::{GcConfig, MajorKind, WriteBarrierKind};
use crate::ephemeron::EphemeronTable;
use crate::error::GcResult;
use crate::finalization::{FinalizationRegistryData, FinalizerCallback, FinalizerThread};
use crate::finisher::{FinishInputs, FinishScope, GrayStackFinisher, ToggleRefCallback};
use crate::gray::GrayQueue;
use crate::heap::GcHeap;
use crate::los::LargeObjectStore;
use crate::major::copying::CopyingMajor;
use crate::major::mark_sweep::MarkSweepMajor;
use crate::major::{self, MajorCollectionReason, MajorCollector, MajorCycle, MajorOutcome};
use crate::minor::{MinorCollector, MinorOutcome};
use crate::nursery::Nursery;
use crate::object::GcHeader;
use crate::pin::PinQueue;
use crate::remset::{CardTableRemset, Remset, SsbRemset};
use crate::weak_ref::{DisappearingLink, WeakRefCell};
use crate::worker::WorkerPool;

#[cfg(feature = "gc_logging")]
use tracing::info;

/// Every weak/finalizable-structure registry the gray-stack finisher needs
/// to sweep each cycle, plus the bridge and toggle-ref callbacks an
/// embedder may have installed. Kept behind one lock apiece since each is
/// touched independently by registration calls between collections.
struct Registries {
    ephemerons: Mutex<Vec<Arc<EphemeronTable>>>,
    finalizers: Mutex<Vec<Arc<FinalizationRegistryData>>>,
    weak_refs: Mutex<Vec<Arc<WeakRefCell>>>,
    links: Mutex<Vec<Arc<DisappearingLink>>>,
    bridge: Mutex<BridgeRegistry>,
    bridge_callback: Mutex<Option<Box<dyn BridgeCallback>>>,
    toggle_refs: Mutex<Vec<*const GcHeader>>,
    toggle_callback: Mutex<Option<Box<dyn ToggleRefCallback>>>,
    finalizer_callback: Mutex<Option<Box<dyn FinalizerCallback>>>,
}

impl Default for Registries {
    fn default() -> Self {
        Self {
            ephemerons: Mutex::new(Vec::new()),
            finalizers: Mutex::new(Vec::new()),
            weak_refs: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
            bridge: Mutex::new(BridgeRegistry::new()),
            bridge_callback: Mutex::new(None),
            toggle_refs: Mutex::new(Vec::new()),
            toggle_callback: Mutex::new(None),
            finalizer_callback: Mutex::new(None),
        }
    }
}

/// Collection-count introspection (spec §6 `get_collection_count`).
#[derive(Default)]
struct Counters {
    minor: AtomicUsize,
    major: AtomicUsize,
}

/// Owns every collector component and drives a collection cycle end to
/// end: pin, scan, drain, finish weak structures, rebuild, recompute the
/// allowance. Constructed once per heap; `Gc` (in `api.rs`) holds it
/// behind an `Arc`.
pub struct GcCollector {
    heap: Arc<GcHeap>,
    nursery: Nursery,
    gray: Arc<GrayQueue>,
    pins: PinQueue,
    remset: Arc<dyn Remset>,
    major: Arc<dyn MajorCollector>,
    workers: Option<WorkerPool>,
    registries: Registries,
    counters: Counters,
    finalizer_thread: Mutex<Option<FinalizerThread>>,
}

impl GcCollector {
    /// Build a collector from a parsed, validated configuration.
    pub fn new(config: GcConfig) -> GcResult<Arc<Self>> {
        config.validate()?;
        let heap = GcHeap::with_config(config);
        let nursery = Nursery::new(heap.clone());
        let gray = Arc::new(GrayQueue::new());
        let pins = PinQueue::new();

        let major: Arc<dyn MajorCollector> = build_major(&heap);
        let remset: Arc<dyn Remset> = build_remset(&heap);

        let workers = build_worker_pool(&heap, &gray, &major, &remset);

        Ok(Arc::new(Self {
            heap,
            nursery,
            gray,
            pins,
            remset,
            major,
            workers,
            registries: Registries::default(),
            counters: Counters::default(),
            finalizer_thread: Mutex::new(None),
        }))
    }

    /// Start the background finalizer thread (spec §9 "Supplemented
    /// Features"). Idempotent: a second call replaces (and joins) any
    /// previously running thread. The thread holds only a [`Weak`]
    /// reference back to this collector, so it never keeps the collector
    /// alive past the last `Gc` handle dropping it.
    pub fn start_finalizer_thread(self: &Arc<Self>) {
        let weak: Weak<GcCollector> = Arc::downgrade(self);
        let thread = FinalizerThread::spawn(move || {
            if let Some(collector) = weak.upgrade() {
                collector.drain_finalizers();
            }
        });
        *self.finalizer_thread.lock() = Some(thread);
    }

    /// Stop the background finalizer thread, draining whatever is pending
    /// one last time before it exits. A no-op if none is running.
    pub fn stop_finalizer_thread(&self) {
        if let Some(mut thread) = self.finalizer_thread.lock().take() {
            thread.shutdown();
        }
    }

    /// Install the embedder's finalizer-execution callback, replacing any
    /// previously installed one.
    pub fn set_finalizer_callback(&self, callback: Box<dyn FinalizerCallback>) {
        *self.registries.finalizer_callback.lock() = Some(callback);
    }

    /// Run every currently pending finalizer (ordinary before critical,
    /// across every registry) via the installed [`FinalizerCallback`]. A
    /// no-op if no callback has been installed. Safe to call from the
    /// background finalizer thread or directly by an embedder that wants
    /// synchronous draining instead.
    pub fn drain_finalizers(&self) {
        let callback = self.registries.finalizer_callback.lock();
        let Some(callback) = callback.as_deref() else {
            return;
        };
        let registries = self.registries.finalizers.lock().clone();
        crate::finalization::drain_registries(&registries, |registry, idx, critical| {
            callback.run(registry, idx, critical);
        });
    }

    /// Wake the background finalizer thread so it re-drains pending
    /// entries. A no-op if the thread was never started.
    fn notify_finalizer_thread(&self) {
        if let Some(thread) = self.finalizer_thread.lock().as_ref() {
            thread.notify();
        }
    }

    pub fn heap(&self) -> &Arc<GcHeap> {
        &self.heap
    }

    pub fn nursery(&self) -> &Nursery {
        &self.nursery
    }

    pub fn gray(&self) -> &Arc<GrayQueue> {
        &self.gray
    }

    pub fn pins(&self) -> &PinQueue {
        &self.pins
    }

    pub fn remset(&self) -> &Arc<dyn Remset> {
        &self.remset
    }

    pub fn major(&self) -> &Arc<dyn MajorCollector> {
        &self.major
    }

    pub fn minor_collection_count(&self) -> usize {
        self.counters.minor.load(Ordering::Relaxed)
    }

    pub fn major_collection_count(&self) -> usize {
        self.counters.major.load(Ordering::Relaxed)
    }

    // -- weak-structure registration -------------------------------------

    pub fn register_ephemeron_table(&self, table: Arc<EphemeronTable>) {
        self.registries.ephemerons.lock().push(table);
    }

    pub fn register_finalization_registry(&self, registry: Arc<FinalizationRegistryData>) {
        self.registries.finalizers.lock().push(registry);
    }

    pub fn register_weak_ref(&self, weak_ref: Arc<WeakRefCell>) {
        self.registries.weak_refs.lock().push(weak_ref);
    }

    pub fn register_disappearing_link(&self, link: Arc<DisappearingLink>) {
        self.registries.links.lock().push(link);
    }

    pub fn register_bridge_candidate(&self, header: *const GcHeader) {
        self.registries.bridge.lock().add_candidate(header);
    }

    pub fn register_bridge_edge(&self, from: *const GcHeader, to: *const GcHeader) {
        self.registries.bridge.lock().add_edge(from, to);
    }

    pub fn register_toggle_ref(&self, header: *const GcHeader) {
        self.registries.toggle_refs.lock().push(header);
    }

    /// Install the embedder's bridge processor callback (replacing any
    /// previously installed one), consulted by the gray-stack finisher once
    /// per collection that found candidate bridge objects.
    pub fn set_bridge_callback(&self, callback: Box<dyn BridgeCallback>) {
        *self.registries.bridge_callback.lock() = Some(callback);
    }

    /// Install the embedder's toggle-ref callback (replacing any previously
    /// installed one).
    pub fn set_toggle_callback(&self, callback: Box<dyn ToggleRefCallback>) {
        *self.registries.toggle_callback.lock() = Some(callback);
    }

    /// Snapshot of the currently registered ephemeron tables, for callers
    /// (e.g. domain unload) that need the list outside a collection cycle.
    pub fn ephemeron_tables(&self) -> Vec<Arc<EphemeronTable>> {
        self.registries.ephemerons.lock().clone()
    }

    /// Snapshot of the currently registered finalization registries.
    pub fn finalization_registries(&self) -> Vec<Arc<FinalizationRegistryData>> {
        self.registries.finalizers.lock().clone()
    }

    /// Snapshot of the currently registered weak references.
    pub fn weak_refs(&self) -> Vec<Arc<WeakRefCell>> {
        self.registries.weak_refs.lock().clone()
    }

    /// Snapshot of the currently registered disappearing links.
    pub fn disappearing_links(&self) -> Vec<Arc<DisappearingLink>> {
        self.registries.links.lock().clone()
    }

    // -- collection --------------------------------------------------------

    /// Run one minor collection, escalating to a major collection
    /// afterward if the allowance heuristic (or a degraded rebuild)
    /// demands it. Returns the minor outcome; the major outcome, if any,
    /// is folded into the heap's own counters and accessible via
    /// `last_major_reclaimed`.
    pub fn collect_nursery(&self) -> MinorOutcome {
        let outcome = self.run_minor_cycle();
        if outcome.major_due {
            let reason = if outcome.degraded {
                MajorCollectionReason::NurseryDegraded
            } else {
                MajorCollectionReason::AllowanceExceeded
            };
            self.run_major_cycle(reason);
        }
        outcome
    }

    /// Run one major collection unconditionally.
    pub fn collect_major(&self, reason: MajorCollectionReason) -> MajorOutcome {
        self.run_major_cycle(reason)
    }

    fn run_minor_cycle(&self) -> MinorOutcome {
        let guard = self.heap.stw().stop_the_world();

        let minor = MinorCollector::new(
            &self.heap,
            &self.nursery,
            &self.gray,
            &self.pins,
            self.remset.as_ref(),
            self.major.as_ref(),
        );

        let nursery_range = (
            self.nursery.section().base(),
            self.nursery.section().base() + self.nursery.section().capacity(),
        );

        let outcome = minor.collect_with_finish(|| self.run_finisher(FinishScope::Minor, nursery_range));

        self.counters.minor.fetch_add(1, Ordering::Relaxed);
        self.log_debug_knobs();
        self.heap.stw().resume_the_world(guard);
        self.notify_finalizer_thread();
        outcome
    }

    fn run_major_cycle(&self, reason: MajorCollectionReason) -> MajorOutcome {
        let guard = self.heap.stw().stop_the_world();

        let old_num_major_sections = self.major.get_num_major_sections();
        let old_los_memory_usage = self.heap.large_objects().total_bytes();
        let minor_sections_alloced = self.heap.allocated() / self.major.section_size().max(1);

        let cycle = MajorCycle::new(
            &self.heap,
            &self.nursery,
            &self.gray,
            &self.pins,
            self.remset.as_ref(),
            self.major.as_ref(),
            self.heap.large_objects(),
            self.workers.as_ref(),
        );
        let mut outcome = cycle.run(reason);

        let nursery_range = (
            self.nursery.section().base(),
            self.nursery.section().base() + self.nursery.section().capacity(),
        );
        let resurrected = self.run_finisher(FinishScope::Major, nursery_range);
        outcome.pinned_nursery.extend(resurrected);
        outcome.pinned_nursery.sort_unstable();
        outcome.pinned_nursery.dedup();

        let degraded = if outcome.pinned_nursery.is_empty() {
            self.nursery.reset();
            false
        } else {
            self.nursery.rebuild_fragments(&outcome.pinned_nursery)
        };
        self.heap.set_degraded(degraded);

        let inputs = crate::allowance::AllowanceInputs {
            old_num_major_sections,
            num_major_sections: self.major.get_num_major_sections(),
            section_size: self.major.section_size(),
            old_los_memory_usage,
            los_memory_usage: self.heap.large_objects().total_bytes(),
            minor_collection_sections_alloced: minor_sections_alloced,
            last_collection_los_memory_alloced: old_los_memory_usage
                .saturating_sub(self.heap.large_objects().total_bytes()),
            soft_heap_limit: self.heap.config().soft_heap_limit,
        };
        let allowance = crate::allowance::recompute(&inputs);
        self.heap.set_allowance(allowance);

        self.counters.major.fetch_add(1, Ordering::Relaxed);
        self.log_debug_knobs();
        self.heap.stw().resume_the_world(guard);
        self.notify_finalizer_thread();
        outcome
    }

    /// Run the gray-stack finisher over the current cycle's registries,
    /// then scan the nursery for any object it resurrected but left
    /// un-evacuated (a finalization target or ephemeron value that was
    /// otherwise unreached during the main trace). Returns those
    /// addresses, already pinned, for the caller to fold into its rebuild.
    fn run_finisher(&self, scope: FinishScope, nursery_range: (usize, usize)) -> Vec<usize> {
        let ephemerons = self.registries.ephemerons.lock();
        let finalizers = self.registries.finalizers.lock();
        let weak_refs = self.registries.weak_refs.lock();
        let links = self.registries.links.lock();
        let mut bridge = self.registries.bridge.lock();
        let toggle_refs = self.registries.toggle_refs.lock();
        let bridge_callback = self.registries.bridge_callback.lock();
        let toggle_callback = self.registries.toggle_callback.lock();

        let major = self.major.as_ref();
        let large_objects = self.heap.large_objects();
        let gray = self.gray.as_ref();

        let mut trace_fn = |header: *const GcHeader, visit: &mut dyn FnMut(*const GcHeader)| {
            if large_objects.contains(header) {
                large_objects.trace_one(header, visit);
            } else {
                // SAFETY: every header reaching the finisher was shaded
                // from a live object reachable this cycle.
                unsafe { major.minor_scan_object(header, visit) };
            }
        };

        let inputs = FinishInputs {
            gray,
            scope,
            nursery_range,
            ephemerons: &ephemerons,
            finalizers: &finalizers,
            weak_refs: &weak_refs,
            links: &links,
            bridge: &mut bridge,
            bridge_callback: bridge_callback.as_deref(),
            toggle_refs: &toggle_refs,
            toggle_callback: toggle_callback.as_deref(),
        };

        // SAFETY: the finisher's precondition (world stopped, main trace
        // already drained once) is upheld by both `run_minor_cycle` and
        // `run_major_cycle`, which call this only after their own drain.
        unsafe { GrayStackFinisher::run(inputs, &mut trace_fn) };

        // SAFETY: the world is still stopped and nothing has allocated
        // into the nursery since the finisher ran.
        unsafe { self.nursery.collect_unforwarded_black_survivors() }
    }

    fn log_debug_knobs(&self) {
        #[cfg(feature = "gc_logging")]
        {
            let debug = &self.heap.config().debug;
            if debug.print_allowance {
                info!(allowance = self.heap.allowance(), "allowance recomputed");
            }
            if debug.print_pinning {
                info!(pins = self.pins.len(), "pin queue drained");
            }
        }
    }
}

fn build_major(heap: &Arc<GcHeap>) -> Arc<dyn MajorCollector> {
    let config = heap.config();
    let section_size = config.nursery_size;
    match config.major {
        MajorKind::MarkSweep => Arc::new(MarkSweepMajor::new(section_size, config.max_heap_size, false, false)),
        MajorKind::MarkSweepFixed => Arc::new(MarkSweepMajor::new(section_size, config.max_heap_size, true, false)),
        MajorKind::MarkSweepParallel => Arc::new(MarkSweepMajor::new(section_size, config.max_heap_size, false, true)),
        MajorKind::MarkSweepFixedParallel => {
            Arc::new(MarkSweepMajor::new(section_size, config.max_heap_size, true, true))
        }
        MajorKind::Copying => Arc::new(CopyingMajor::new(section_size, config.max_heap_size)),
    }
}

fn build_remset(heap: &Arc<GcHeap>) -> Arc<dyn Remset> {
    let config = heap.config();
    match config.wbarrier {
        WriteBarrierKind::Remset => Arc::new(SsbRemset::default()),
        WriteBarrierKind::CardTable => Arc::new(CardTableRemset::new(0, config.max_heap_size)),
    }
}

/// Build the worker pool, if configured, with a trace closure equivalent
/// to [`major::trace_and_shade`] over the shared major backend, large
/// object store, and gray queue. Mirrors the sequential drain exactly so
/// parallel and sequential major collections produce the same graph.
fn build_worker_pool(
    heap: &Arc<GcHeap>,
    gray: &Arc<GrayQueue>,
    major: &Arc<dyn MajorCollector>,
    _remset: &Arc<dyn Remset>,
) -> Option<WorkerPool> {
    let workers = heap.config().workers;
    if workers == 0 {
        return None;
    }
    let major = major.clone();
    let heap_for_los = heap.clone();
    Some(WorkerPool::new(workers, gray.clone(), move |header, gray| {
        // SAFETY: the gray queue only ever holds live headers shaded by
        // this cycle's root/remset/gray-queue tracing.
        unsafe { (*header).set_mark(crate::object::MarkColor::Black) };
        let large_objects: &LargeObjectStore = heap_for_los.large_objects();
        // SAFETY: see above; `major`/`large_objects`/`gray` are the same
        // triple the sequential drain uses.
        unsafe { major::trace_and_shade(header, major.as_ref(), large_objects, gray) };
    }))
}
