//! Minor-collection-allowance heuristic (spec §4.8), ported verbatim from
//! SGen's `try_calculate_minor_collection_allowance`.
//!
//! The allowance bounds how much nursery traffic (promoted major-section
//! bytes plus LOS growth) is allowed to accumulate before a minor
//! collection must escalate to a major one. It's recomputed once per
//! major collection from how much memory that collection actually
//! reclaimed, aiming to let through "about as much garbage next time as
//! we just proved we can reclaim."

/// Floor under which the allowance is never clamped down further.
pub const MIN_MINOR_COLLECTION_ALLOWANCE: usize = 4 * 1024 * 1024;

/// Inputs to one allowance recomputation, gathered immediately after a
/// major collection completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowanceInputs {
    /// Major-heap sections in use before this major collection.
    pub old_num_major_sections: usize,
    /// Major-heap sections in use after this major collection.
    pub num_major_sections: usize,
    /// Bytes per major section.
    pub section_size: usize,
    /// LOS bytes in use before this major collection.
    pub old_los_memory_usage: usize,
    /// LOS bytes in use after this major collection.
    pub los_memory_usage: usize,
    /// Bytes allocated into major sections by minor collections since the
    /// previous major collection (drives the "ratio won't change"
    /// extrapolation).
    pub minor_collection_sections_alloced: usize,
    /// LOS bytes allocated since the previous major collection.
    pub last_collection_los_memory_alloced: usize,
    /// Soft heap limit (spec §6 `soft-heap-limit`).
    pub soft_heap_limit: usize,
}

/// Recompute the minor-collection allowance from the outcome of a major
/// collection.
///
/// The `save_target` formula below is preserved exactly as SGen computes
/// it, FIXME included: the original's own comment questions why
/// `save_target` is half of (major memory + LOS *saved*) rather than half
/// of (major memory *saved* + LOS saved), or half the whole heap. This
/// crate keeps the formula as-is rather than "fixing" it, since changing
/// it would change collection-trigger behavior in ways the contract this
/// crate is preserving doesn't sanction — see `DESIGN.md`.
pub fn recompute(inputs: &AllowanceInputs) -> usize {
    let num_major_sections_saved = inputs
        .old_num_major_sections
        .saturating_sub(inputs.num_major_sections);
    let los_memory_saved = inputs
        .old_los_memory_usage
        .saturating_sub(inputs.los_memory_usage)
        .max(1);

    let new_major = inputs.num_major_sections * inputs.section_size;
    let new_heap_size = new_major + inputs.los_memory_usage;

    // FIXME (preserved from the original): why half the major memory plus
    // half the LOS memory *saved*, rather than half the major memory
    // *saved* plus half the LOS memory saved, or half the whole heap?
    let save_target = (new_major + los_memory_saved) / 2;

    let numerator = save_target as f64
        * (inputs.minor_collection_sections_alloced * inputs.section_size
            + inputs.last_collection_los_memory_alloced) as f64;
    let denominator =
        (num_major_sections_saved * inputs.section_size + los_memory_saved) as f64;
    let allowance_target = if denominator == 0.0 {
        0
    } else {
        (numerator / denominator) as usize
    };

    let mut allowance = allowance_target
        .min(inputs.num_major_sections * inputs.section_size + inputs.los_memory_usage)
        .max(MIN_MINOR_COLLECTION_ALLOWANCE);

    if new_heap_size + allowance > inputs.soft_heap_limit {
        allowance = if new_heap_size > inputs.soft_heap_limit {
            MIN_MINOR_COLLECTION_ALLOWANCE
        } else {
            (inputs.soft_heap_limit - new_heap_size).max(MIN_MINOR_COLLECTION_ALLOWANCE)
        };
    }

    allowance
}

/// Whether a major collection should be triggered, given bytes allocated
/// into major sections and LOS since the last major collection plus the
/// current allowance (SGen's `need_major_collection`, minus the
/// `space_needed > available_free_space()` disjunct, which this crate
/// models as a separate direct check at the allocation site).
pub fn exceeds_allowance(
    minor_collection_sections_alloced: usize,
    section_size: usize,
    los_alloced: usize,
    allowance: usize,
) -> bool {
    minor_collection_sections_alloced * section_size + los_alloced > allowance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowance_floors_at_minimum() {
        let inputs = AllowanceInputs {
            old_num_major_sections: 0,
            num_major_sections: 0,
            section_size: 1_000_000,
            old_los_memory_usage: 0,
            los_memory_usage: 0,
            minor_collection_sections_alloced: 0,
            last_collection_los_memory_alloced: 0,
            soft_heap_limit: 1_000_000_000,
        };
        assert_eq!(recompute(&inputs), MIN_MINOR_COLLECTION_ALLOWANCE);
    }

    #[test]
    fn test_allowance_clamped_by_soft_limit() {
        let inputs = AllowanceInputs {
            old_num_major_sections: 100,
            num_major_sections: 10,
            section_size: 1024 * 1024,
            old_los_memory_usage: 10 * 1024 * 1024,
            los_memory_usage: 1024 * 1024,
            minor_collection_sections_alloced: 50,
            last_collection_los_memory_alloced: 2 * 1024 * 1024,
            soft_heap_limit: 12 * 1024 * 1024,
        };
        let allowance = recompute(&inputs);
        let new_heap_size = inputs.num_major_sections * inputs.section_size + inputs.los_memory_usage;
        assert!(new_heap_size + allowance <= inputs.soft_heap_limit || allowance == MIN_MINOR_COLLECTION_ALLOWANCE);
    }

    #[test]
    fn test_exceeds_allowance() {
        assert!(exceeds_allowance(10, 1024, 0, 5000));
        assert!(!exceeds_allowance(1, 1024, 0, 5000));
    }
}
