//! The access check engine.
//!
//! Every mutator access to the managed heap funnels through these checks.
//! A failed check is a safety panic naming the exact condition and the
//! printable form of the pointer; there is no recovery path.

use crate::object::{SpecialType, WORD_SIZE};
use crate::origin::Origin;
use crate::ptr::Ptr;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    fn verb(self) -> &'static str {
        match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
        }
    }
}

/// Alignment a native access of `bytes` must satisfy: the power of two
/// rounding of the size, capped at one word.
#[inline(always)]
pub fn native_alignment(bytes: usize) -> usize {
    bytes.next_power_of_two().min(WORD_SIZE).max(1)
}

/// The common bounds/aliveness/alignment check. `bytes` may be zero, in
/// which case only the capability conditions apply.
#[inline]
pub fn check_access(
    ptr: Ptr,
    bytes: usize,
    alignment: usize,
    kind: AccessKind,
    origin: Option<&Origin>,
) {
    let object = ptr.object();
    safety_check!(
        !object.is_null(),
        origin,
        "cannot {} {} bytes: pointer has no object (boxed int): {}",
        kind.verb(),
        bytes,
        ptr
    );
    unsafe {
        let object = &*object;
        safety_check!(
            !object.is_free(),
            origin,
            "cannot {} {} bytes: object is free: {}",
            kind.verb(),
            bytes,
            ptr
        );
        safety_check!(
            !object.is_special(),
            origin,
            "cannot {} {} bytes: object is special: {}",
            kind.verb(),
            bytes,
            ptr
        );
        let raw = ptr.raw() as usize;
        let lower = object.lower() as usize;
        let upper = object.upper() as usize;
        safety_check!(
            raw >= lower,
            origin,
            "cannot {} {} bytes: ptr < lower: {}",
            kind.verb(),
            bytes,
            ptr
        );
        safety_check!(
            raw < upper || (bytes == 0 && raw == upper),
            origin,
            "cannot {} {} bytes: ptr >= upper: {}",
            kind.verb(),
            bytes,
            ptr
        );
        safety_check!(
            upper - raw >= bytes,
            origin,
            "cannot {} {} bytes: ptr + size > upper: {}",
            kind.verb(),
            bytes,
            ptr
        );
        if kind == AccessKind::Write {
            safety_check!(
                !object.is_readonly(),
                origin,
                "cannot write {} bytes: object is readonly: {}",
                bytes,
                ptr
            );
        }
        safety_check!(
            crate::util::is_aligned(raw, alignment),
            origin,
            "cannot {} {} bytes: ptr not aligned to {}: {}",
            kind.verb(),
            bytes,
            alignment,
            ptr
        );
    }
}

#[inline]
pub fn check_read(ptr: Ptr, bytes: usize, alignment: usize, origin: Option<&Origin>) {
    check_access(ptr, bytes, alignment, AccessKind::Read, origin);
}

#[inline]
pub fn check_write(ptr: Ptr, bytes: usize, alignment: usize, origin: Option<&Origin>) {
    check_access(ptr, bytes, alignment, AccessKind::Write, origin);
}

/// Native-access form: the alignment requirement is derived from the access
/// size.
#[inline]
pub fn check_read_native(ptr: Ptr, bytes: usize, origin: Option<&Origin>) {
    check_read(ptr, bytes, native_alignment(bytes), origin);
}

#[inline]
pub fn check_write_native(ptr: Ptr, bytes: usize, origin: Option<&Origin>) {
    check_write(ptr, bytes, native_alignment(bytes), origin);
}

/// Compiler-specialized check: the compiler proved a fixed extent
/// `[offset, offset + bytes)` relative to the pointer and attached the
/// alignment it needs.
#[inline]
pub fn optimized_access_check(
    ptr: Ptr,
    offset: isize,
    bytes: usize,
    alignment: usize,
    kind: AccessKind,
    origin: Option<&Origin>,
) {
    check_access(ptr.with_offset(offset), bytes, alignment, kind, origin);
}

/// Check that `ptr` is a live special object of the expected kind, pointing
/// exactly at its payload.
pub fn check_special(ptr: Ptr, expected: SpecialType, origin: Option<&Origin>) {
    let object = ptr.object();
    safety_check!(
        !object.is_null(),
        origin,
        "expected {:?}: pointer has no object (boxed int): {}",
        expected,
        ptr
    );
    unsafe {
        let object = &*object;
        safety_check!(
            !object.is_free(),
            origin,
            "expected {:?}: object is free: {}",
            expected,
            ptr
        );
        safety_check!(
            object.special_type() == expected,
            origin,
            "expected {:?}: object is not that kind: {}",
            expected,
            ptr
        );
        safety_check!(
            ptr.raw() == object.special_payload(),
            origin,
            "expected {:?}: pointer does not point at the payload: {}",
            expected,
            ptr
        );
    }
}

/// Specialization of `check_special` used at every indirect call.
#[inline]
pub fn check_function_call(ptr: Ptr, origin: Option<&Origin>) {
    check_special(ptr, SpecialType::Function, origin);
}

/// Recover the object behind a special pointer after checking it.
pub unsafe fn special_payload_of(ptr: Ptr, expected: SpecialType, origin: Option<&Origin>) -> *mut u8 {
    check_special(ptr, expected, origin);
    (*ptr.object()).special_payload()
}
