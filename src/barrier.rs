//! Write barrier entry points (spec §4.3, component C5, §6 "Barrier ABI").
//!
//! Every managed pointer-field write must funnel through one of these
//! before it retires, so the remembered set sees every old-to-young
//! pointer a minor collection needs to re-scan. The collector is
//! stop-the-world only (spec §5): there is no concurrent marker to keep a
//! tri-color invariant for, so the only thing a barrier records is
//! "old slot now points into the nursery" — the generational half of
//! spec §4.3, dispatched through whichever `Remset` backend `config.rs`
//! selected.
//!
//! Every function here is **post-barrier**: the record happens before the
//! store retires, so a GC that preempts between the two still finds the
//! remembered-set entry already in place (spec §4.3's "pre-actions
//! happen-before the store" contract, realized without needing a true
//! pre-barrier since recording is idempotent and the store itself can't
//! race a stop-the-world pause).
//!
//! Generalizes the teacher's single hard-coded `RememberedSet`/`CardTable`
//! barrier pair into dispatch over the `Remset` trait (`remset.rs`).

use crate::object::{GcDescriptor, GcHeader};
use crate::remset::Remset;

/// The nursery's address extent, as `[start, end)`. Every barrier
/// function takes this so it can fast-path "slot is itself in the
/// nursery" without recording — the nursery is scanned in full every
/// minor collection, so a remembered-set entry for it would be pure
/// overhead (spec §4.3 "Each fast-paths a nursery-target check").
pub type NurseryRange = (usize, usize);

#[inline]
fn in_range(addr: usize, range: NurseryRange) -> bool {
    addr >= range.0 && addr < range.1
}

/// Record `field` into the remembered set if it needs recording: `value`
/// is non-null, lands in the nursery, and `field` itself is *not* in the
/// nursery (an in-nursery slot is already covered by the next minor scan).
///
/// # Safety
/// `field` must be a valid, currently-writable `*const GcHeader` slot;
/// `value` must be null or a live header.
unsafe fn record_if_needed<R: Remset + ?Sized>(
    remset: &R,
    nursery: NurseryRange,
    field: *mut *const GcHeader,
    value: *const GcHeader,
) {
    if value.is_null() || in_range(field as usize, nursery) {
        return;
    }
    if in_range(value as usize, nursery) {
        // SAFETY: forwarded from caller's contract.
        unsafe { remset.record(field) };
    }
}

/// `wbarrier_set_field`: a single managed pointer-field store.
///
/// # Safety
/// `field` must be a valid, writable slot inside a live object; `value`
/// must be null or a live header.
pub unsafe fn wbarrier_set_field<R: Remset + ?Sized>(
    remset: &R,
    nursery: NurseryRange,
    field: *mut *const GcHeader,
    value: *const GcHeader,
) {
    // SAFETY: forwarded from caller's contract.
    unsafe {
        record_if_needed(remset, nursery, field, value);
        *field = value;
    }
}

/// `wbarrier_set_arrayref`: store into a single array element slot. Same
/// contract as `wbarrier_set_field` — arrays carry no extra bookkeeping
/// the barrier needs beyond the slot address.
///
/// # Safety
/// Same as `wbarrier_set_field`.
pub unsafe fn wbarrier_set_arrayref<R: Remset + ?Sized>(
    remset: &R,
    nursery: NurseryRange,
    slot: *mut *const GcHeader,
    value: *const GcHeader,
) {
    // SAFETY: forwarded from caller's contract.
    unsafe { wbarrier_set_field(remset, nursery, slot, value) };
}

/// `wbarrier_arrayref_copy`: copy `count` reference slots from `src` to
/// `dst`, recording each element whose new value lands in the nursery.
///
/// # Safety
/// `dst`/`src` must each point at `count` valid, non-overlapping
/// `*const GcHeader` slots (an overlapping copy should read all of `src`
/// before writing `dst`, as done here).
pub unsafe fn wbarrier_arrayref_copy<R: Remset + ?Sized>(
    remset: &R,
    nursery: NurseryRange,
    dst: *mut *const GcHeader,
    src: *const *const GcHeader,
    count: usize,
) {
    // Read every source value up front so an overlapping copy (the same
    // array sliding over itself) never reads an already-overwritten slot.
    let values: Vec<*const GcHeader> = (0..count)
        .map(|i| unsafe { *src.add(i) })
        .collect();
    for (i, value) in values.into_iter().enumerate() {
        let slot = unsafe { dst.add(i) };
        // SAFETY: `slot` is one of `count` valid slots the caller vouched
        // for; `value` was read from a live source slot.
        unsafe {
            record_if_needed(remset, nursery, slot, value);
            *slot = value;
        }
    }
}

/// `wbarrier_generic_store`: store through a slot whose container type
/// (object field vs. array element vs. boxed value) isn't known to the
/// caller — same recording rule either way.
///
/// # Safety
/// Same as `wbarrier_set_field`.
pub unsafe fn wbarrier_generic_store<R: Remset + ?Sized>(
    remset: &R,
    nursery: NurseryRange,
    slot: *mut *const GcHeader,
    value: *const GcHeader,
) {
    // SAFETY: forwarded from caller's contract.
    unsafe { wbarrier_set_field(remset, nursery, slot, value) };
}

/// `wbarrier_generic_nostore`: the caller already performed the store
/// itself (e.g. through a non-pointer-typed write that happens to alias a
/// reference slot); just record the slot if its current contents warrant
/// it.
///
/// # Safety
/// `slot` must be a valid, readable `*const GcHeader` slot whose current
/// contents are either null or a live header.
pub unsafe fn wbarrier_generic_nostore<R: Remset + ?Sized>(
    remset: &R,
    nursery: NurseryRange,
    slot: *mut *const GcHeader,
) {
    let value = unsafe { *slot };
    // SAFETY: forwarded from caller's contract.
    unsafe { record_if_needed(remset, nursery, slot, value) };
}

/// `wbarrier_value_copy`: copy a value type's raw bytes (a struct that
/// embeds reference fields inline, e.g. a tuple or fixed array of
/// `GcHeader*`) from `src` to `dst`, then record every embedded reference
/// slot that now points into the nursery, using `descriptor`'s precise
/// trace function to find them.
///
/// # Safety
/// `dst`/`src` must each be valid for `byte_len` bytes and non-overlapping;
/// `descriptor`, if non-null, must describe the value's embedded reference
/// layout via its `trace` function, with slot addresses computed relative
/// to `dst`.
pub unsafe fn wbarrier_value_copy<R: Remset + ?Sized>(
    remset: &R,
    nursery: NurseryRange,
    dst: *mut u8,
    src: *const u8,
    byte_len: usize,
    descriptor: *const GcDescriptor,
) {
    // SAFETY: caller guarantees `byte_len` bytes are valid and disjoint.
    unsafe { std::ptr::copy_nonoverlapping(src, dst, byte_len) };

    if in_range(dst as usize, nursery) || descriptor.is_null() {
        return;
    }
    // SAFETY: non-null descriptor is valid for the lifetime of the copy.
    let trace = unsafe { (*descriptor).trace };
    if let Some(trace_fn) = trace {
        trace_fn(dst, &mut |slot| {
            let value = unsafe { *slot };
            // SAFETY: `slot` came from the descriptor's own trace of
            // memory we just wrote; `remset`/`nursery` are this call's.
            unsafe { record_if_needed(remset, nursery, slot, value) };
        });
    }
}

/// `wbarrier_object_copy`: clone a whole object (header + payload) from
/// `src_obj` to `dst_obj` — used by clone/`Object.assign`-style
/// operations — then record every reference field that now points into
/// the nursery.
///
/// # Safety
/// `dst_obj` must have room for `total_size` bytes (header included);
/// `src_obj` must be a live, readable object of exactly that size.
pub unsafe fn wbarrier_object_copy<R: Remset + ?Sized>(
    remset: &R,
    nursery: NurseryRange,
    dst_obj: *const GcHeader,
    src_obj: *const GcHeader,
    total_size: usize,
) {
    // SAFETY: caller guarantees `total_size` bytes are valid and disjoint.
    unsafe {
        std::ptr::copy_nonoverlapping(src_obj as *const u8, dst_obj as *mut u8, total_size);
    }

    if in_range(dst_obj as usize, nursery) {
        return;
    }
    // SAFETY: the copy above gave `dst_obj` the same descriptor `src_obj`
    // had, which the caller guarantees is valid.
    let descriptor = unsafe { (*dst_obj).descriptor() };
    if descriptor.is_null() {
        return;
    }
    let payload = unsafe { (dst_obj as *const u8).add(std::mem::size_of::<GcHeader>()) } as *mut u8;
    let trace = unsafe { (*descriptor).trace };
    if let Some(trace_fn) = trace {
        trace_fn(payload, &mut |slot| {
            let value = unsafe { *slot };
            // SAFETY: see `wbarrier_value_copy`.
            unsafe { record_if_needed(remset, nursery, slot, value) };
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tags;
    use crate::remset::SsbRemset;

    fn nursery_range() -> NurseryRange {
        (0x1000, 0x2000)
    }

    fn nursery_header() -> GcHeader {
        GcHeader::new(tags::OBJECT, std::ptr::null())
    }

    #[test]
    fn test_set_field_records_nursery_target_from_old_slot() {
        let remset = SsbRemset::new(16);
        let target = nursery_header();
        let target_ptr = &target as *const GcHeader;
        // A real nursery range would cover a whole section; for the
        // barrier's address-membership check all that matters is that
        // `target_ptr` falls inside it and the slot doesn't.
        let range = (target_ptr as usize, target_ptr as usize + 1);
        let mut slot: *const GcHeader = std::ptr::null();
        // Put the slot itself outside the nursery range by offsetting it
        // far away on the stack; a local on the stack is never inside an
        // arbitrary heap range like `range`.
        let slot_ptr: *mut *const GcHeader = &mut slot;
        assert!(!in_range(slot_ptr as usize, range));

        unsafe { wbarrier_set_field(&remset, range, slot_ptr, target_ptr) };

        assert_eq!(slot, target_ptr);
        let mut seen = Vec::new();
        remset.scan_and_clear(&mut |p| seen.push(p));
        assert_eq!(seen, vec![slot_ptr]);
    }

    #[test]
    fn test_set_field_skips_recording_for_in_nursery_slot() {
        let remset = SsbRemset::new(16);
        let target = nursery_header();
        let target_ptr = &target as *const GcHeader;

        let mut slot: *const GcHeader = std::ptr::null();
        let slot_ptr: *mut *const GcHeader = &mut slot;
        // Range covering the slot itself: the fast path should skip
        // recording even though the value "looks like" a nursery pointer
        // under this same range.
        let range = (slot_ptr as usize, slot_ptr as usize + std::mem::size_of::<usize>());

        unsafe { wbarrier_set_field(&remset, range, slot_ptr, target_ptr) };

        assert_eq!(slot, target_ptr);
        assert!(remset.is_empty());
    }

    #[test]
    fn test_set_field_skips_null_value() {
        let remset = SsbRemset::new(16);
        let mut slot: *const GcHeader = std::ptr::null();
        let slot_ptr: *mut *const GcHeader = &mut slot;
        unsafe { wbarrier_set_field(&remset, nursery_range(), slot_ptr, std::ptr::null()) };
        assert!(remset.is_empty());
    }

    #[test]
    fn test_arrayref_copy_records_each_nursery_element() {
        let remset = SsbRemset::new(16);
        let target = nursery_header();
        let target_ptr = &target as *const GcHeader;
        let range = (target_ptr as usize, target_ptr as usize + 1);

        let src: [*const GcHeader; 2] = [target_ptr, std::ptr::null()];
        let mut dst: [*const GcHeader; 2] = [std::ptr::null(), std::ptr::null()];

        unsafe {
            wbarrier_arrayref_copy(&remset, range, dst.as_mut_ptr(), src.as_ptr(), 2);
        }

        assert_eq!(dst[0], target_ptr);
        assert_eq!(dst[1], std::ptr::null());
        assert_eq!(remset.len(), 1);
    }

    #[test]
    fn test_generic_nostore_records_existing_nursery_value() {
        let remset = SsbRemset::new(16);
        let target = nursery_header();
        let target_ptr = &target as *const GcHeader;
        let range = (target_ptr as usize, target_ptr as usize + 1);

        let mut slot: *const GcHeader = target_ptr;
        let slot_ptr: *mut *const GcHeader = &mut slot;

        unsafe { wbarrier_generic_nostore(&remset, range, slot_ptr) };
        assert_eq!(remset.len(), 1);
    }
}
