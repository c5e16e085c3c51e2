//! Gray-stack finisher (spec §4.6, component C9) — order is load-bearing.
//!
//! Runs once the main trace's gray queue has drained for the first time,
//! at the end of both a minor and a major collection. Fixes the
//! reachability definition for every weak structure the straightforward
//! tri-color trace can't resolve on its own: ephemerons need a fixed
//! point (a value only stays live as long as its key does, and marking
//! the value can in turn keep other keys alive), bridge objects need an
//! embedder round-trip, and finalizable objects must be resurrected
//! before anything can safely run a finalizer over them.
//!
//! New relative to the teacher, which had no cross-module orchestration
//! of `ephemeron.rs`/`weak_ref.rs`/`finalization.rs`/`bridge.rs` — built
//! in their idiom (raw-pointer headers, `unsafe impl Send`, closures for
//! tracing) by composing the primitives those modules already provide.

use std::sync::Arc;

use crate::bridge::{BridgeCallback, BridgeRegistry, BridgeScc};
use crate::ephemeron::EphemeronTable;
use crate::finalization::FinalizationRegistryData;
use crate::gray::GrayQueue;
use crate::object::{GcHeader, MarkColor};
use crate::weak_ref::{DisappearingLink, LinkKind, WeakRefCell};

/// Whether this finish pass covers the nursery only (a minor collection)
/// or the whole heap (a major collection) — spec §4.6's "generational
/// note": weak-structure processing must not treat an untraced, still-live
/// old-generation object as dead just because a minor never retraced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishScope {
    Minor,
    Major,
}

/// Embedder callback for toggle-ref objects (spec §4.6 step 3): objects
/// whose strong/weak-from-the-runtime's-perspective status the embedder,
/// not the collector, decides each cycle. Mirrors `BridgeCallback`'s shape
/// since both hand the collector's tentative candidate set to outside
/// code for a liveness verdict.
pub trait ToggleRefCallback: Send + Sync {
    /// Given this cycle's toggle-ref candidates, return which should be
    /// treated as strongly reachable (same length and order as `candidates`).
    fn toggle(&self, candidates: &[*const GcHeader]) -> Vec<bool>;
}

/// Everything the finisher needs for one pass, gathered by the caller
/// (the top-level collector) from its long-lived registries.
pub struct FinishInputs<'a> {
    pub gray: &'a GrayQueue,
    pub scope: FinishScope,
    pub nursery_range: (usize, usize),
    pub ephemerons: &'a [Arc<EphemeronTable>],
    pub finalizers: &'a [Arc<FinalizationRegistryData>],
    pub weak_refs: &'a [Arc<WeakRefCell>],
    pub links: &'a [Arc<DisappearingLink>],
    pub bridge: &'a mut BridgeRegistry,
    pub bridge_callback: Option<&'a dyn BridgeCallback>,
    pub toggle_refs: &'a [*const GcHeader],
    pub toggle_callback: Option<&'a dyn ToggleRefCallback>,
}

/// What the finisher decided, for the caller's logging/bookkeeping.
#[derive(Default)]
pub struct FinishOutcome {
    pub bridge_sccs: Vec<BridgeScc>,
    pub bridge_verdicts: Vec<bool>,
    pub resurrected: usize,
}

/// Drives the nine-step sequence. Holds no state of its own between
/// cycles; `run` is the only entry point.
pub struct GrayStackFinisher;

impl GrayStackFinisher {
    /// Run the full nine-step sequence. `trace_fn` is the generation-
    /// appropriate object scanner (the minor collector's copy function or
    /// the major collector's `minor_scan_object`) used to drain the gray
    /// queue whenever a step resurrects something.
    ///
    /// # Safety
    /// Every header reachable from `inputs`' registries must be a live,
    /// currently-valid `GcHeader`; must be called only while the world is
    /// stopped and the main trace has already drained the gray queue once.
    pub unsafe fn run(
        inputs: FinishInputs<'_>,
        trace_fn: &mut dyn FnMut(*const GcHeader, &mut dyn FnMut(*const GcHeader)),
    ) -> FinishOutcome {
        let FinishInputs {
            gray,
            scope,
            nursery_range,
            ephemerons,
            finalizers,
            weak_refs,
            links,
            bridge,
            bridge_callback,
            toggle_refs,
            toggle_callback,
        } = inputs;

        let mut outcome = FinishOutcome::default();

        Self::step1_reset_bridge(bridge);
        Self::step2_ephemeron_fixed_point(gray, ephemerons, trace_fn);
        Self::step3_toggle_refs(gray, toggle_refs, toggle_callback, trace_fn);
        Self::step4_bridge_sccs(gray, bridge, bridge_callback, trace_fn, &mut outcome);
        Self::step5_null_non_tracking_links(scope, nursery_range, links, weak_refs);
        outcome.resurrected = Self::step6_finalization_queue(gray, finalizers, trace_fn);
        Self::step7_second_ephemeron_fixed_point(gray, ephemerons, trace_fn);
        Self::step8_clear_unreachable_ephemerons(ephemerons);
        Self::step9_null_tracking_links(scope, nursery_range, links);

        outcome
    }

    fn step1_reset_bridge(bridge: &mut BridgeRegistry) {
        bridge.clear();
    }

    fn step2_ephemeron_fixed_point(
        gray: &GrayQueue,
        ephemerons: &[Arc<EphemeronTable>],
        trace_fn: &mut dyn FnMut(*const GcHeader, &mut dyn FnMut(*const GcHeader)),
    ) {
        loop {
            let mut newly_marked = 0;
            for table in ephemerons {
                // SAFETY: caller guarantees marking is in progress and
                // every entry's key/value header is valid.
                newly_marked += unsafe { table.trace_live_entries(&mut |h| { gray.shade(h); }) };
            }
            drain_gray(gray, trace_fn);
            if newly_marked == 0 {
                break;
            }
        }
    }

    fn step3_toggle_refs(
        gray: &GrayQueue,
        candidates: &[*const GcHeader],
        callback: Option<&dyn ToggleRefCallback>,
        trace_fn: &mut dyn FnMut(*const GcHeader, &mut dyn FnMut(*const GcHeader)),
    ) {
        let Some(callback) = callback else { return };
        if candidates.is_empty() {
            return;
        }
        let verdicts = callback.toggle(candidates);
        for (&header, &strong) in candidates.iter().zip(verdicts.iter()) {
            if strong {
                gray.shade(header);
            }
        }
        drain_gray(gray, trace_fn);
    }

    fn step4_bridge_sccs(
        gray: &GrayQueue,
        bridge: &mut BridgeRegistry,
        callback: Option<&dyn BridgeCallback>,
        trace_fn: &mut dyn FnMut(*const GcHeader, &mut dyn FnMut(*const GcHeader)),
        outcome: &mut FinishOutcome,
    ) {
        if bridge.is_empty() {
            return;
        }
        let sccs = bridge.compute_sccs();
        let verdicts = match callback {
            Some(cb) => cb.cross_reference(&sccs),
            None => vec![true; sccs.len()],
        };
        for (scc, &alive) in sccs.iter().zip(verdicts.iter()) {
            if alive {
                for &member in &scc.members {
                    gray.shade(member);
                }
            }
        }
        drain_gray(gray, trace_fn);
        outcome.bridge_sccs = sccs;
        outcome.bridge_verdicts = verdicts;
    }

    fn step5_null_non_tracking_links(
        scope: FinishScope,
        nursery_range: (usize, usize),
        links: &[Arc<DisappearingLink>],
        weak_refs: &[Arc<WeakRefCell>],
    ) {
        for link in links {
            if link.kind() != LinkKind::NonTracking {
                continue;
            }
            clear_if_unreachable(scope, nursery_range, link.target(), || link.clear());
        }
        for weak_ref in weak_refs {
            clear_if_unreachable(scope, nursery_range, weak_ref.target(), || weak_ref.clear());
        }
    }

    fn step6_finalization_queue(
        gray: &GrayQueue,
        finalizers: &[Arc<FinalizationRegistryData>],
        trace_fn: &mut dyn FnMut(*const GcHeader, &mut dyn FnMut(*const GcHeader)),
    ) -> usize {
        let mut total_resurrected = 0;
        loop {
            let mut changed = false;
            for registry in finalizers {
                // SAFETY: caller guarantees marking is in progress and
                // registered targets remain valid headers.
                let this_changed = unsafe {
                    registry.process_finish(&mut |h| {
                        total_resurrected += 1;
                        gray.shade(h);
                    })
                };
                changed |= this_changed;
            }
            drain_gray(gray, trace_fn);
            if !changed {
                break;
            }
        }
        total_resurrected
    }

    fn step7_second_ephemeron_fixed_point(
        gray: &GrayQueue,
        ephemerons: &[Arc<EphemeronTable>],
        trace_fn: &mut dyn FnMut(*const GcHeader, &mut dyn FnMut(*const GcHeader)),
    ) {
        // Finalization in step 6 may have resurrected keys; re-run the
        // same fixed point.
        Self::step2_ephemeron_fixed_point(gray, ephemerons, trace_fn);
    }

    fn step8_clear_unreachable_ephemerons(ephemerons: &[Arc<EphemeronTable>]) {
        for table in ephemerons {
            // SAFETY: marking has reached a fixpoint by this step.
            unsafe { table.sweep() };
        }
        // Note: this crate's `EphemeronTable` does not track each entry's
        // containing section, so the "promoted array with a nursery-
        // resident key/value left over" remset addition spec §4.6 step 8
        // describes is not separately emitted here — any such reference is
        // still caught the ordinary way, through the write barrier that
        // fired when the entry was first installed. See `DESIGN.md`.
    }

    fn step9_null_tracking_links(
        scope: FinishScope,
        nursery_range: (usize, usize),
        links: &[Arc<DisappearingLink>],
    ) {
        loop {
            let mut cleared_any = false;
            for link in links {
                if link.kind() != LinkKind::Tracking {
                    continue;
                }
                let was_registered = link.is_registered();
                clear_if_unreachable(scope, nursery_range, link.target(), || link.clear());
                if was_registered && !link.is_registered() {
                    cleared_any = true;
                }
            }
            if !cleared_any {
                break;
            }
        }
    }
}

fn in_scope(scope: FinishScope, nursery_range: (usize, usize), addr: usize) -> bool {
    match scope {
        FinishScope::Major => true,
        FinishScope::Minor => addr >= nursery_range.0 && addr < nursery_range.1,
    }
}

fn clear_if_unreachable(
    scope: FinishScope,
    nursery_range: (usize, usize),
    target: Option<*const GcHeader>,
    clear: impl FnOnce(),
) {
    let Some(target) = target else { return };
    if !in_scope(scope, nursery_range, target as usize) {
        return;
    }
    // SAFETY: targets are only ever set from live headers at registration
    // time and remain valid until explicitly cleared.
    let mark = unsafe { (*target).mark() };
    if mark == MarkColor::White {
        clear();
    }
}

fn drain_gray(
    gray: &GrayQueue,
    trace_fn: &mut dyn FnMut(*const GcHeader, &mut dyn FnMut(*const GcHeader)),
) {
    while let Some(ptr) = gray.pop() {
        // SAFETY: gray-queue entries always come from shading a live
        // header.
        let header = unsafe { &*ptr };
        header.set_mark(MarkColor::Black);
        trace_fn(ptr, &mut |child| {
            gray.shade(child);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tags;

    fn no_trace(_header: *const GcHeader, _visit: &mut dyn FnMut(*const GcHeader)) {}

    #[test]
    fn test_step5_clears_unreachable_non_tracking_link() {
        let target = GcHeader::new(tags::OBJECT, std::ptr::null());
        let link = Arc::new(DisappearingLink::new(&target, LinkKind::NonTracking));
        let links = [link.clone()];

        GrayStackFinisher::step5_null_non_tracking_links(
            FinishScope::Major,
            (0, 0),
            &links,
            &[],
        );

        assert!(!link.is_registered());
    }

    #[test]
    fn test_step5_keeps_reachable_link() {
        let target = GcHeader::new(tags::OBJECT, std::ptr::null());
        target.set_mark(MarkColor::Black);
        let link = Arc::new(DisappearingLink::new(&target, LinkKind::NonTracking));
        let links = [link.clone()];

        GrayStackFinisher::step5_null_non_tracking_links(
            FinishScope::Major,
            (0, 0),
            &links,
            &[],
        );

        assert!(link.is_registered());
    }

    #[test]
    fn test_ephemeron_fixed_point_marks_value_when_key_reachable() {
        let key = GcHeader::new(tags::OBJECT, std::ptr::null());
        key.set_mark(MarkColor::Black);
        let value = GcHeader::new(tags::OBJECT, std::ptr::null());
        let value_ptr: *const GcHeader = &value;

        let table = Arc::new(EphemeronTable::new());
        unsafe {
            table.set_raw(&key, (value_ptr as usize).to_le_bytes().to_vec(), None);
        }
        let tables = [table];
        let gray = GrayQueue::new();

        GrayStackFinisher::step2_ephemeron_fixed_point(&gray, &tables, &mut no_trace);

        assert_eq!(value.mark(), MarkColor::Black);
    }

    #[test]
    fn test_step6_resurrects_and_queues() {
        let target = GcHeader::new(tags::OBJECT, std::ptr::null());
        let registry = Arc::new(FinalizationRegistryData::new());
        registry.register(&target);
        let registries = [registry.clone()];
        let gray = GrayQueue::new();

        let resurrected =
            GrayStackFinisher::step6_finalization_queue(&gray, &registries, &mut no_trace);

        assert_eq!(resurrected, 1);
        assert_eq!(target.mark(), MarkColor::Black);
        assert_eq!(registry.drain_pending(), vec![0]);
    }

    #[test]
    fn test_step9_nulls_tracking_links_to_dead_targets() {
        let target = GcHeader::new(tags::OBJECT, std::ptr::null());
        let link = Arc::new(DisappearingLink::new(&target, LinkKind::Tracking));
        let links = [link.clone()];

        GrayStackFinisher::step9_null_tracking_links(FinishScope::Major, (0, 0), &links);

        assert!(!link.is_registered());
    }
}
