//! Auxiliary pointer-tracking memory.
//!
//! Every word of an ordinary object's payload has a 16-byte shadow slot at
//! the same offset from the object's `aux` pointer. The first 8 bytes of the
//! slot hold a tagged `LowerOrBox` value: null when the word holds no
//! pointer, the `lower` of the pointee's object for plain pointer stores, or
//! a tagged reference to an `AtomicBox` when the slot has been the target of
//! an atomic pointer operation.
//!
//! In payload memory a pointer occupies one full word: the raw address in
//! the low 8 bytes, the high 8 bytes zeroed. The capability half lives only
//! in the shadow, so integer reads of pointer memory see the raw address and
//! nothing else.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::check::{check_read, check_write};
use crate::object::{Object, WORD_SIZE};
use crate::origin::Origin;
use crate::ptr::{AtomicPtrPair, Ptr};
use crate::thread::Mutator;

pub const AUX_BOX_TAG: u64 = 1;

/// The indirection cell backing atomic pointer operations: the full `Ptr` is
/// held here and updated with a 128-bit atomic, so the (raw, shadow) pair
/// can be changed in one step without a universal 128-bit CAS on payload
/// memory.
#[repr(C, align(16))]
pub struct AtomicBox {
    pub value: AtomicPtrPair,
}

/// Decoded form of a shadow slot.
#[derive(Clone, Copy)]
pub enum AuxEntry {
    Empty,
    Lower(*mut u8),
    Box(*mut AtomicBox),
}

#[inline(always)]
pub fn decode_entry(bits: u64) -> AuxEntry {
    if bits == 0 {
        AuxEntry::Empty
    } else if bits & AUX_BOX_TAG != 0 {
        AuxEntry::Box((bits & !AUX_BOX_TAG) as *mut AtomicBox)
    } else {
        AuxEntry::Lower(bits as *mut u8)
    }
}

/// Shadow slot for payload word `word_index` of an object whose shadow base
/// is `aux_base`.
#[inline(always)]
pub unsafe fn entry_at(aux_base: *mut u8, word_index: usize) -> &'static AtomicU64 {
    &*(aux_base.add(word_index * WORD_SIZE) as *const AtomicU64)
}

/// Lazily create the pointer-tracking shadow for `object`.
///
/// The shadow is zero-filled, allocated from the raw side of the managed
/// heap, marked black if a collection is running, and installed with a CAS;
/// a losing concurrent installer abandons its shadow to the next sweep.
pub fn ensure_aux(thread: &Mutator, object: *mut Object) -> *mut u8 {
    unsafe {
        let existing = (*object).aux_ptr();
        if !existing.is_null() {
            return existing;
        }
        internal_check!(
            !(*object).is_special(),
            "ensure_aux on special object {:p}",
            object
        );
        let size = (*object).size();
        let shadow = crate::allocation::allocate_raw_zeroed(thread, size);
        let winner = (*object).install_aux(shadow);
        // The allocation may have raced the barrier turning on: an owner
        // scanned before this install would never mark the shadow, so
        // re-check now that the install is visible.
        if winner == shadow && crate::collector::is_marking() {
            crate::runtime().heap.set_is_marked_relaxed(shadow);
        }
        winner
    }
}

/// Allocate a box holding `value`, black if a collection is running.
pub fn allocate_box(thread: &Mutator, value: Ptr) -> *mut AtomicBox {
    unsafe {
        let cell =
            crate::allocation::allocate_raw_zeroed(thread, std::mem::size_of::<AtomicBox>())
                as *mut AtomicBox;
        (*cell).value = AtomicPtrPair::new(value);
        cell
    }
}

#[inline(always)]
unsafe fn raw_halves(addr: *mut u8) -> (&'static AtomicU64, &'static AtomicU64) {
    (
        &*(addr as *const AtomicU64),
        &*(addr.add(8) as *const AtomicU64),
    )
}

/// Reconstruct the `Ptr` currently stored at `addr` inside `object`,
/// assuming checks already passed. Does not run the load barrier.
unsafe fn load_ptr_unbarriered(object: *mut Object, addr: *mut u8) -> Ptr {
    let aux_base = (*object).aux_ptr();
    let (raw_lo, _) = raw_halves(addr);
    let raw = raw_lo.load(Ordering::Relaxed) as *mut u8;
    if aux_base.is_null() {
        return Ptr::from_int(raw as usize);
    }
    let entry = entry_at(aux_base, (*object).word_index(addr)).load(Ordering::Acquire);
    match decode_entry(entry) {
        AuxEntry::Empty => Ptr::from_int(raw as usize),
        AuxEntry::Lower(lower) => {
            let pointee = Object::from_lower(lower);
            if (*pointee).is_free() {
                Ptr::from_int(raw as usize)
            } else {
                Ptr::with_parts(pointee, raw)
            }
        }
        AuxEntry::Box(cell) => {
            let value = (*cell).value.load_relaxed();
            let pointee = value.object();
            if pointee.is_null() || (*pointee).is_free() {
                Ptr::from_int(value.addr())
            } else {
                value
            }
        }
    }
}

/// Load a pointer from memory. Dangling references come back as boxed
/// integers with the raw address preserved.
pub fn load_ptr(thread: &Mutator, source: Ptr, origin: Option<&Origin>) -> Ptr {
    check_read(source, WORD_SIZE, WORD_SIZE, origin);
    unsafe {
        let value = load_ptr_unbarriered(source.object(), source.raw());
        crate::collector::load_barrier(thread, value.object());
        value
    }
}

/// Store a pointer to memory: record the capability in the shadow, the raw
/// address in the payload word, and run the store barrier on the stored
/// object.
pub fn store_ptr(thread: &Mutator, dest: Ptr, value: Ptr, origin: Option<&Origin>) {
    check_write(dest, WORD_SIZE, WORD_SIZE, origin);
    unsafe {
        store_ptr_unchecked(thread, dest.object(), dest.raw(), value);
    }
}

/// The store path without access checks, for runtime-internal writes into
/// objects whose validity the caller has already established.
pub unsafe fn store_ptr_unchecked(
    thread: &Mutator,
    object: *mut Object,
    addr: *mut u8,
    value: Ptr,
) {
    crate::collector::store_barrier(thread, value.object());
    let entry_bits = match value.object() {
        object if object.is_null() => 0u64,
        pointee => (*pointee).lower() as u64,
    };
    let aux_base = if entry_bits == 0 {
        (*object).aux_ptr()
    } else {
        ensure_aux(thread, object)
    };
    if !aux_base.is_null() {
        entry_at(aux_base, (*object).word_index(addr)).store(entry_bits, Ordering::Release);
    }
    let (raw_lo, raw_hi) = raw_halves(addr);
    raw_lo.store(value.addr() as u64, Ordering::Relaxed);
    raw_hi.store(0, Ordering::Relaxed);
}

/// Atomic compare-and-swap of a pointer slot. Only `raw` is compared, per
/// the capability model: integers that compare equal name the same location
/// whatever capability they arrived with. Returns the witnessed value on
/// failure.
pub fn ptr_cas(
    thread: &Mutator,
    dest: Ptr,
    expected: Ptr,
    new: Ptr,
    weak: bool,
    origin: Option<&Origin>,
) -> Result<Ptr, Ptr> {
    check_write(dest, WORD_SIZE, WORD_SIZE, origin);
    unsafe {
        let object = dest.object();
        let addr = dest.raw();
        let aux_base = ensure_aux(thread, object);
        let slot = entry_at(aux_base, (*object).word_index(addr));
        let (raw_lo, raw_hi) = raw_halves(addr);
        loop {
            let entry = slot.load(Ordering::Acquire);
            match decode_entry(entry) {
                AuxEntry::Box(cell) => loop {
                    let current = (*cell).value.load_relaxed();
                    if current.raw() != expected.raw() {
                        crate::collector::load_barrier(thread, current.object());
                        return Err(current);
                    }
                    crate::collector::store_barrier(thread, new.object());
                    crate::collector::load_barrier(thread, current.object());
                    match (*cell).value.compare_exchange(current, new) {
                        Ok(old) => {
                            raw_lo.store(new.addr() as u64, Ordering::Relaxed);
                            raw_hi.store(0, Ordering::Relaxed);
                            return Ok(old);
                        }
                        Err(_) if weak => {
                            let witnessed = (*cell).value.load_relaxed();
                            return Err(witnessed);
                        }
                        Err(_) => continue,
                    }
                },
                entry_kind => {
                    let current_raw = raw_lo.load(Ordering::SeqCst) as *mut u8;
                    let current = match entry_kind {
                        AuxEntry::Lower(lower) => {
                            let pointee = Object::from_lower(lower);
                            if (*pointee).is_free() {
                                Ptr::from_int(current_raw as usize)
                            } else {
                                Ptr::with_parts(pointee, current_raw)
                            }
                        }
                        _ => Ptr::from_int(current_raw as usize),
                    };
                    if current.raw() != expected.raw() {
                        crate::collector::load_barrier(thread, current.object());
                        return Err(current);
                    }
                    // Promote the slot to a box holding the new value; the
                    // box is the slot's truth from now on.
                    crate::collector::store_barrier(thread, new.object());
                    crate::collector::load_barrier(thread, current.object());
                    let cell = allocate_box(thread, new);
                    let new_bits = cell as u64 | AUX_BOX_TAG;
                    if slot
                        .compare_exchange(entry, new_bits, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        if crate::collector::is_marking() {
                            crate::runtime().heap.set_is_marked_relaxed(cell as *const u8);
                        }
                        raw_lo.store(new.addr() as u64, Ordering::Relaxed);
                        raw_hi.store(0, Ordering::Relaxed);
                        return Ok(current);
                    }
                    if weak {
                        return Err(load_ptr_unbarriered(object, addr));
                    }
                    // Lost a race to another installer; retry against the
                    // winner's slot state.
                }
            }
        }
    }
}

/// Atomic exchange, in terms of load + weak CAS.
pub fn ptr_xchg(thread: &Mutator, dest: Ptr, new: Ptr, origin: Option<&Origin>) -> Ptr {
    loop {
        let current = load_ptr(thread, dest, origin);
        match ptr_cas(thread, dest, current, new, true, origin) {
            Ok(old) => return old,
            Err(_) => continue,
        }
    }
}
