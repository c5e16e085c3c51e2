//! Bridge: cross-runtime cycle collection for objects with external
//! reference counts (spec §4.6 step 4, glossary "bridge object").
//!
//! Some objects are referenced from outside this allocator entirely (e.g.
//! a COM-style reference count held by embedding code). Such an object
//! can be part of a garbage cycle that's only garbage because every
//! member is *also* only reachable via other bridge objects — deciding
//! that requires the embedder's help, since the collector alone can't see
//! the external reference counts. The collector's job is limited to:
//! finding candidate bridge objects reachable only through other bridge
//! objects, grouping them into strongly-connected components, and asking
//! the registered callback which components are alive.

use rustc_hash::FxHashMap;

use crate::object::GcHeader;

/// One strongly-connected component of candidate bridge objects, plus the
/// other SCCs it references (by index into the slice passed to the
/// callback) — the embedder needs this edge information to run its own
/// liveness analysis alongside its external reference counts.
pub struct BridgeScc {
    /// Member objects of this component.
    pub members: Vec<*const GcHeader>,
    /// Indices of other SCCs this component references.
    pub references: Vec<usize>,
}

// SCCs are only constructed and consumed within a single STW pause.
unsafe impl Send for BridgeScc {}

/// Embedder-supplied liveness decision, invoked once per collection that
/// found any candidate bridge objects.
pub trait BridgeCallback: Send + Sync {
    /// Given the SCCs found this cycle, return which are alive (same
    /// length and order as `sccs`). An SCC judged dead has every member
    /// treated as unreachable for the remainder of this cycle.
    fn cross_reference(&self, sccs: &[BridgeScc]) -> Vec<bool>;
}

/// Registry of candidate bridge objects discovered during a single
/// collection's mark phase, and their edges to other bridge objects.
#[derive(Default)]
pub struct BridgeRegistry {
    candidates: Vec<*const GcHeader>,
    edges: FxHashMap<usize, Vec<usize>>,
}

// Populated only while the world is stopped and drained before mutators
// resume.
unsafe impl Send for BridgeRegistry {}

impl BridgeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a candidate bridge object reached during tracing.
    pub fn add_candidate(&mut self, header: *const GcHeader) {
        self.candidates.push(header);
    }

    /// Record that bridge object `from` references bridge object `to`.
    pub fn add_edge(&mut self, from: *const GcHeader, to: *const GcHeader) {
        self.edges
            .entry(from as usize)
            .or_default()
            .push(to as usize);
    }

    /// Whether any candidates were found this cycle (the fast path: skip
    /// SCC computation and the callback entirely).
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Compute strongly-connected components via Tarjan's algorithm over
    /// the recorded candidate/edge graph.
    pub fn compute_sccs(&self) -> Vec<BridgeScc> {
        let mut index_of: FxHashMap<usize, usize> = FxHashMap::default();
        let mut lowlink: FxHashMap<usize, usize> = FxHashMap::default();
        let mut on_stack: FxHashMap<usize, bool> = FxHashMap::default();
        let mut stack = Vec::new();
        let mut next_index = 0usize;
        let mut sccs: Vec<Vec<usize>> = Vec::new();

        for &candidate in &self.candidates {
            let addr = candidate as usize;
            if !index_of.contains_key(&addr) {
                self.strong_connect(
                    addr,
                    &mut index_of,
                    &mut lowlink,
                    &mut on_stack,
                    &mut stack,
                    &mut next_index,
                    &mut sccs,
                );
            }
        }

        let member_index: FxHashMap<usize, usize> = sccs
            .iter()
            .enumerate()
            .flat_map(|(scc_idx, members)| members.iter().map(move |&m| (m, scc_idx)))
            .collect();

        sccs.into_iter()
            .enumerate()
            .map(|(scc_idx, members)| {
                let mut references: Vec<usize> = members
                    .iter()
                    .filter_map(|m| self.edges.get(m))
                    .flatten()
                    .filter_map(|target| member_index.get(target).copied())
                    .filter(|&target_scc| target_scc != scc_idx)
                    .collect();
                references.sort_unstable();
                references.dedup();
                BridgeScc {
                    members: members.into_iter().map(|m| m as *const GcHeader).collect(),
                    references,
                }
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn strong_connect(
        &self,
        v: usize,
        index_of: &mut FxHashMap<usize, usize>,
        lowlink: &mut FxHashMap<usize, usize>,
        on_stack: &mut FxHashMap<usize, bool>,
        stack: &mut Vec<usize>,
        next_index: &mut usize,
        sccs: &mut Vec<Vec<usize>>,
    ) {
        index_of.insert(v, *next_index);
        lowlink.insert(v, *next_index);
        *next_index += 1;
        stack.push(v);
        on_stack.insert(v, true);

        if let Some(successors) = self.edges.get(&v).cloned() {
            for w in successors {
                if !index_of.contains_key(&w) {
                    self.strong_connect(w, index_of, lowlink, on_stack, stack, next_index, sccs);
                    let w_low = lowlink[&w];
                    let v_low = lowlink[&v];
                    lowlink.insert(v, v_low.min(w_low));
                } else if *on_stack.get(&w).unwrap_or(&false) {
                    let w_idx = index_of[&w];
                    let v_low = lowlink[&v];
                    lowlink.insert(v, v_low.min(w_idx));
                }
            }
        }

        if lowlink[&v] == index_of[&v] {
            let mut component = Vec::new();
            loop {
                let w = stack.pop().expect("SCC stack underflow");
                on_stack.insert(w, false);
                component.push(w);
                if w == v {
                    break;
                }
            }
            sccs.push(component);
        }
    }

    /// Discard all recorded candidates/edges (called once the bridge pass
    /// for this cycle has completed).
    pub fn clear(&mut self) {
        self.candidates.clear();
        self.edges.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tags;

    #[test]
    fn test_no_candidates_is_empty() {
        let registry = BridgeRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.compute_sccs().is_empty());
    }

    #[test]
    fn test_single_cycle_forms_one_scc() {
        let a = GcHeader::new(tags::OBJECT, std::ptr::null());
        let b = GcHeader::new(tags::OBJECT, std::ptr::null());
        let a_ptr: *const GcHeader = &a;
        let b_ptr: *const GcHeader = &b;

        let mut registry = BridgeRegistry::new();
        registry.add_candidate(a_ptr);
        registry.add_candidate(b_ptr);
        registry.add_edge(a_ptr, b_ptr);
        registry.add_edge(b_ptr, a_ptr);

        let sccs = registry.compute_sccs();
        assert_eq!(sccs.len(), 1);
        assert_eq!(sccs[0].members.len(), 2);
        assert!(sccs[0].references.is_empty());
    }

    #[test]
    fn test_acyclic_chain_forms_separate_sccs_with_edges() {
        let a = GcHeader::new(tags::OBJECT, std::ptr::null());
        let b = GcHeader::new(tags::OBJECT, std::ptr::null());
        let a_ptr: *const GcHeader = &a;
        let b_ptr: *const GcHeader = &b;

        let mut registry = BridgeRegistry::new();
        registry.add_candidate(a_ptr);
        registry.add_candidate(b_ptr);
        registry.add_edge(a_ptr, b_ptr);

        let sccs = registry.compute_sccs();
        assert_eq!(sccs.len(), 2);
        let total_references: usize = sccs.iter().map(|s| s.references.len()).sum();
        assert_eq!(total_references, 1);
    }
}
