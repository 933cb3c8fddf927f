//! The allocation API.
//!
//! Sizes round up to whole words. Small requests come from the thread's
//! inline allocators, large ones from whole heap pages. Payloads are zeroed
//! before the object is returned; when marking is on, new objects and new
//! shadows are born black. Zeroing beyond the pollcheck budget happens with
//! the mutator exited and the allocation pinned as an allocation root.

use crate::check::{check_read, check_write};
use crate::heap::{class_for, SIZE_CLASSES};
use crate::object::{
    Object, ObjectFlags, SpecialType, MAX_ALLOCATION_SIZE, OBJECT_HEADER_SIZE, WORD_SIZE,
};
use crate::origin::Origin;
use crate::ptr::Ptr;
use crate::thread::Mutator;
use crate::util::align_up;
use crate::MAX_BYTES_BETWEEN_POLLCHECKS;

/// Alignment beyond this is refused; the page allocator cannot center a
/// header past the first page of a run.
pub const MAX_ALIGNMENT: usize = crate::heap::PAGE_SIZE;

fn charged_size(total: usize) -> usize {
    match class_for(total) {
        Some(class) => SIZE_CLASSES[class],
        None => align_up(total, crate::heap::PAGE_SIZE),
    }
}

/// Grab a cell of at least `total` bytes.
fn obtain_cell(thread: &Mutator, total: usize, raw: bool) -> *mut u8 {
    let cell = match class_for(total) {
        Some(class) => {
            if raw {
                crate::runtime().heap.allocate_cell(class, true)
            } else {
                unsafe { (*thread.allocators.get()).allocate(class) }
            }
        }
        None => crate::runtime().heap.allocate_large(total, raw),
    };
    if cell.is_null() {
        crate::panic::safety_panic(
            None,
            format_args!("out of memory allocating {} bytes", total),
        );
    }
    cell
}

/// Zero `size` bytes at `at`. Beyond the pollcheck budget, the zeroing runs
/// exited with `root` pinned as an allocation root.
unsafe fn zero_payload(thread: &Mutator, root: *mut u8, at: *mut u8, size: usize) {
    if size <= MAX_BYTES_BETWEEN_POLLCHECKS {
        std::ptr::write_bytes(at, 0, size);
        return;
    }
    thread.push_allocation_root(root);
    {
        let _exited = thread.exited();
        std::ptr::write_bytes(at, 0, size);
    }
    thread.pop_allocation_root(root);
}

fn allocate_impl(thread: &Mutator, size: usize, alignment: usize) -> Ptr {
    safety_check!(
        size <= MAX_ALLOCATION_SIZE,
        None,
        "allocation of {} bytes exceeds the allocation cap",
        size
    );
    safety_check!(
        alignment.is_power_of_two() && alignment <= MAX_ALIGNMENT,
        None,
        "unsupported allocation alignment {}",
        alignment
    );
    let asize = align_up(size, WORD_SIZE);
    let pad_allowance = if alignment > WORD_SIZE { alignment } else { 0 };
    let total = OBJECT_HEADER_SIZE + asize + pad_allowance;

    let cell = obtain_cell(thread, total, false);
    unsafe {
        let payload = align_up(cell as usize + OBJECT_HEADER_SIZE, alignment) as *mut u8;
        let header = payload.sub(OBJECT_HEADER_SIZE) as *mut Object;
        let base_offset = header as usize - cell as usize;
        let mut flags = ObjectFlags::new();
        if alignment > WORD_SIZE {
            flags = flags.with_align_shift(alignment.trailing_zeros() as u8);
        }
        Object::write_header(header, payload, payload.add(asize), flags, base_offset);
        let heap = &crate::runtime().heap;
        heap.note_allocated(header as *mut u8, charged_size(total));
        if crate::collector::black_allocation() {
            heap.set_is_marked_relaxed(header as *const u8);
        }
        zero_payload(thread, header as *mut u8, payload, asize);
        Ptr::new(header)
    }
}

/// Allocate `size` bytes of word-aligned payload.
pub fn allocate(thread: &Mutator, size: usize) -> Ptr {
    allocate_impl(thread, size, WORD_SIZE)
}

/// Allocate with a stronger alignment; the alignment is recorded in the
/// object's flags and the header placed so the cell base can be recovered.
pub fn allocate_aligned(thread: &Mutator, size: usize, alignment: usize) -> Ptr {
    allocate_impl(thread, size, alignment.max(WORD_SIZE))
}

/// Allocate a special object: a one-word dummy payload for the bounds, the
/// real payload directly after it, reachable through the aux pointer.
pub fn allocate_special(thread: &Mutator, payload_size: usize, special: SpecialType) -> Ptr {
    internal_check!(special != SpecialType::None, "allocating non-special special");
    let psize = align_up(payload_size, WORD_SIZE);
    let total = OBJECT_HEADER_SIZE + WORD_SIZE + psize;
    let cell = obtain_cell(thread, total, false);
    unsafe {
        let header = cell as *mut Object;
        let dummy = cell.add(OBJECT_HEADER_SIZE);
        let payload = dummy.add(WORD_SIZE);
        let flags = ObjectFlags::new().with_special(special);
        Object::write_header(header, dummy, dummy.add(WORD_SIZE), flags, 0);
        (*header).set_aux_ptr(payload);
        let heap = &crate::runtime().heap;
        heap.note_allocated(cell, charged_size(total));
        if crate::collector::black_allocation() {
            heap.set_is_marked_relaxed(cell);
        }
        zero_payload(thread, cell, dummy, WORD_SIZE + psize);
        Ptr::for_special(header)
    }
}

/// Raw (headerless) heap memory for aux shadows and atomic boxes. Zeroed,
/// and born black while marking is on.
pub fn allocate_raw_zeroed(thread: &Mutator, size: usize) -> *mut u8 {
    let asize = align_up(size.max(WORD_SIZE), WORD_SIZE);
    let cell = obtain_cell(thread, asize, true);
    unsafe {
        let heap = &crate::runtime().heap;
        heap.note_allocated(cell, charged_size(asize));
        if crate::collector::is_marking() {
            heap.set_is_marked_relaxed(cell);
        }
        zero_payload(thread, cell, cell, asize);
    }
    cell
}

/// Free an object. The transition is terminal: bounds collapse, every
/// subsequent access check fails, and the memory goes back to the allocator
/// at the next collection once nothing references it.
pub fn free(thread: &Mutator, ptr: Ptr, origin: Option<&Origin>) {
    let _ = thread;
    if ptr.object().is_null() && ptr.raw().is_null() {
        return;
    }
    safety_check!(
        !ptr.object().is_null(),
        origin,
        "cannot free pointer with no object: {}",
        ptr
    );
    unsafe {
        let object = &*ptr.object();
        safety_check!(
            ptr.raw() == object.lower(),
            origin,
            "cannot free non-base pointer: {}",
            ptr
        );
        safety_check!(!object.is_free(), origin, "double free: {}", ptr);
        safety_check!(!object.is_special(), origin, "cannot free special object: {}", ptr);
        safety_check!(!object.is_global(), origin, "cannot free global object: {}", ptr);
        let flags = object.flags();
        safety_check!(!flags.mmap(), origin, "cannot free mmap object: {}", ptr);
        safety_check!(!flags.sysv_shm(), origin, "cannot free SysV shm object: {}", ptr);
        object.set_free();
    }
}

/// Grow or shrink by moving: allocate, copy the common prefix with its
/// shadow, free the old object. Never shrinks in place.
pub fn reallocate(thread: &Mutator, old: Ptr, new_size: usize, origin: Option<&Origin>) -> Ptr {
    if old.object().is_null() && old.raw().is_null() {
        return allocate(thread, new_size);
    }
    safety_check!(
        !old.object().is_null(),
        origin,
        "cannot reallocate pointer with no object: {}",
        old
    );
    unsafe {
        let object = &*old.object();
        safety_check!(
            old.raw() == object.lower(),
            origin,
            "cannot reallocate non-base pointer: {}",
            old
        );
        safety_check!(!object.is_free(), origin, "reallocate of freed object: {}", old);
        safety_check!(
            !object.is_special(),
            origin,
            "cannot reallocate special object: {}",
            old
        );

        let new = allocate(thread, new_size);
        let common = object.size().min(align_up(new_size, WORD_SIZE));

        let mut native = crate::frame::NativeFrame::new();
        let guard = crate::frame::NativeFrameGuard::push(thread, &mut native);
        let src_handle = guard.frame().track(old.object());
        let dst_handle = guard.frame().track(new.object());

        copy_words_with_pollchecks(
            thread,
            dst_handle.object(),
            src_handle.object(),
            common / WORD_SIZE,
            origin,
        );

        drop(guard);
        free(thread, old, origin);
        new
    }
}

/// Word-by-word copy of payload and shadow from the base of `src` to the
/// base of `dst`, pollchecking between windows and re-asserting that the
/// source has not been freed across each suspension.
unsafe fn copy_words_with_pollchecks(
    thread: &Mutator,
    dst: *mut Object,
    src: *mut Object,
    words: usize,
    origin: Option<&Origin>,
) {
    let words_per_window = MAX_BYTES_BETWEEN_POLLCHECKS / WORD_SIZE;
    let mut index = 0;
    while index < words {
        let window_end = (index + words_per_window).min(words);
        copy_words(thread, dst, src, index, window_end);
        index = window_end;
        if index < words {
            thread.pollcheck();
            safety_check!(
                !(*src).is_free(),
                origin,
                "object freed during reallocation: {:p}",
                src
            );
        }
    }
}

/// Copy `[from, to)` payload words plus their shadow entries, with a
/// barrier on each carried capability.
unsafe fn copy_words(
    thread: &Mutator,
    dst: *mut Object,
    src: *mut Object,
    from: usize,
    to: usize,
) {
    let src_lower = (*src).lower();
    let dst_lower = (*dst).lower();
    std::ptr::copy_nonoverlapping(
        src_lower.add(from * WORD_SIZE),
        dst_lower.add(from * WORD_SIZE),
        (to - from) * WORD_SIZE,
    );
    let src_aux = (*src).aux_ptr();
    if src_aux.is_null() {
        return;
    }
    for word in from..to {
        let entry = crate::aux::entry_at(src_aux, word).load(atomic::Ordering::Acquire);
        match crate::aux::decode_entry(entry) {
            crate::aux::AuxEntry::Empty => {}
            crate::aux::AuxEntry::Lower(lower) => {
                let pointee = Object::from_lower(lower);
                crate::collector::store_barrier(thread, pointee);
                let dst_aux = crate::aux::ensure_aux(thread, dst);
                crate::aux::entry_at(dst_aux, word).store(entry, atomic::Ordering::Release);
            }
            crate::aux::AuxEntry::Box(cell) => {
                let value = (*cell).value.load_relaxed();
                crate::aux::store_ptr_unchecked(
                    thread,
                    dst,
                    dst_lower.add(word * WORD_SIZE),
                    value,
                );
            }
        }
    }
}

/// Store an integer of `N` bytes. The covered shadow word loses any
/// capability it held; integers never carry one.
pub fn store_int(thread: &Mutator, dst: Ptr, bytes: &[u8], origin: Option<&Origin>) {
    check_write(dst, bytes.len(), crate::check::native_alignment(bytes.len()), origin);
    unsafe {
        clear_aux_range(dst.object(), dst.raw(), bytes.len());
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.raw(), bytes.len());
        let _ = thread;
    }
}

/// Read an integer of `N` bytes.
pub fn load_int(_thread: &Mutator, src: Ptr, bytes: &mut [u8], origin: Option<&Origin>) {
    check_read(src, bytes.len(), crate::check::native_alignment(bytes.len()), origin);
    unsafe {
        std::ptr::copy_nonoverlapping(src.raw(), bytes.as_mut_ptr(), bytes.len());
    }
}

/// Null the shadow entries of every word overlapping `[addr, addr+len)`.
/// An integer write that touches any part of a pointer word demotes the
/// word to integer data.
pub(crate) unsafe fn clear_aux_range(object: *mut Object, addr: *mut u8, len: usize) {
    if len == 0 {
        return;
    }
    let aux = (*object).aux_ptr();
    if aux.is_null() || (*object).is_special() {
        return;
    }
    let first = (*object).word_index(addr);
    let last = (*object).word_index(addr.add(len - 1));
    for word in first..=last {
        crate::aux::entry_at(aux, word).store(0, atomic::Ordering::Release);
    }
}

/// memset across the capability model: checked, shadow-demoting, and
/// pollcheck-chunked for large spans with aliveness re-checks.
pub fn zmemset(thread: &Mutator, dst: Ptr, value: u8, len: usize, origin: Option<&Origin>) {
    check_write(dst, len, 1, origin);
    unsafe {
        clear_aux_range(dst.object(), dst.raw(), len);
        if len <= MAX_BYTES_BETWEEN_POLLCHECKS {
            std::ptr::write_bytes(dst.raw(), value, len);
            return;
        }
        let mut native = crate::frame::NativeFrame::new();
        let guard = crate::frame::NativeFrameGuard::push(thread, &mut native);
        let _pin = guard.frame().track(dst.object());
        let mut offset = 0;
        while offset < len {
            let window = (len - offset).min(MAX_BYTES_BETWEEN_POLLCHECKS);
            {
                let _exited = thread.exited();
                std::ptr::write_bytes(dst.raw().add(offset), value, window);
            }
            offset += window;
            safety_check!(
                !(*dst.object()).is_free(),
                origin,
                "object freed during memset: {}",
                dst
            );
        }
        drop(guard);
    }
}

/// memmove across the capability model. Word-aligned spans carry their
/// capabilities; unaligned spans demote the destination words to integers.
/// Large spans exit across each window and re-assert both objects alive.
pub fn zmemmove(thread: &Mutator, dst: Ptr, src: Ptr, len: usize, origin: Option<&Origin>) {
    check_read(src, len, 1, origin);
    check_write(dst, len, 1, origin);
    if len == 0 {
        return;
    }
    unsafe {
        let aligned = crate::util::is_aligned(dst.addr(), WORD_SIZE)
            && crate::util::is_aligned(src.addr(), WORD_SIZE)
            && crate::util::is_aligned(len, WORD_SIZE);

        let mut native = crate::frame::NativeFrame::new();
        let guard = crate::frame::NativeFrameGuard::push(thread, &mut native);
        let _src_pin = guard.frame().track(src.object());
        let _dst_pin = guard.frame().track(dst.object());

        if !aligned {
            clear_aux_range(dst.object(), dst.raw(), len);
        }

        // Copy back-to-front when the ranges overlap with dst above src, so
        // windows never read bytes a previous window wrote.
        let backward = (dst.addr() > src.addr()) && src.addr() + len > dst.addr();
        let mut remaining = len;
        while remaining > 0 {
            let window = remaining.min(MAX_BYTES_BETWEEN_POLLCHECKS);
            let offset = if backward { remaining - window } else { len - remaining };
            if aligned {
                copy_shadow_window(thread, dst, src, offset, window, backward);
            }
            if len > MAX_BYTES_BETWEEN_POLLCHECKS {
                let _exited = thread.exited();
                std::ptr::copy(src.raw().add(offset), dst.raw().add(offset), window);
            } else {
                std::ptr::copy(src.raw().add(offset), dst.raw().add(offset), window);
            }
            remaining -= window;
            if remaining > 0 {
                safety_check!(
                    !(*src.object()).is_free(),
                    origin,
                    "source freed during memmove: {}",
                    src
                );
                safety_check!(
                    !(*dst.object()).is_free(),
                    origin,
                    "destination freed during memmove: {}",
                    dst
                );
            }
        }
        drop(guard);
    }
}

/// Move one window's worth of shadow entries, barriering each carried
/// capability. Iterates in the same direction as the byte copy so
/// overlapping shadow ranges move correctly.
unsafe fn copy_shadow_window(
    thread: &Mutator,
    dst: Ptr,
    src: Ptr,
    offset: usize,
    len: usize,
    backward: bool,
) {
    let src_object = src.object();
    let dst_object = dst.object();
    let src_aux = (*src_object).aux_ptr();
    let first_src = (*src_object).word_index(src.raw().add(offset));
    let first_dst = (*dst_object).word_index(dst.raw().add(offset));
    let words = len / WORD_SIZE;
    for step in 0..words {
        let word = if backward { words - 1 - step } else { step };
        let entry = if src_aux.is_null() {
            0
        } else {
            crate::aux::entry_at(src_aux, first_src + word).load(atomic::Ordering::Acquire)
        };
        let resolved = match crate::aux::decode_entry(entry) {
            crate::aux::AuxEntry::Empty => 0,
            crate::aux::AuxEntry::Lower(lower) => {
                crate::collector::store_barrier(thread, Object::from_lower(lower));
                lower as u64
            }
            crate::aux::AuxEntry::Box(cell) => {
                let value = (*cell).value.load_relaxed();
                crate::collector::store_barrier(thread, value.object());
                if value.object().is_null() {
                    0
                } else {
                    (*value.object()).lower() as u64
                }
            }
        };
        if resolved == 0 {
            let dst_aux = (*dst_object).aux_ptr();
            if !dst_aux.is_null() {
                crate::aux::entry_at(dst_aux, first_dst + word).store(0, atomic::Ordering::Release);
            }
        } else {
            let dst_aux = crate::aux::ensure_aux(thread, dst_object);
            crate::aux::entry_at(dst_aux, first_dst + word)
                .store(resolved, atomic::Ordering::Release);
        }
    }
}

/// The calling-convention spill buffer: a reused, readonly, word-aligned
/// object pinned by the thread record. Grows geometrically.
pub fn ensure_cc_buffer(thread: &Mutator, bytes: usize, aux: bool) -> Ptr {
    unsafe {
        let existing = if aux {
            thread.cc_aux_buffer_object()
        } else {
            thread.cc_buffer_object()
        };
        if !existing.is_null() && (*existing).size() >= bytes {
            return Ptr::new(existing);
        }
        let capacity = align_up(bytes.max(256), WORD_SIZE).next_power_of_two();
        let ptr = allocate(thread, capacity);
        let object = ptr.object();
        (*object).or_flag_bits(crate::object::FLAG_READONLY);
        if aux {
            crate::aux::ensure_aux(thread, object);
            thread.set_cc_aux_buffer_object(object);
        } else {
            thread.set_cc_buffer_object(object);
        }
        crate::collector::store_barrier(thread, object);
        ptr
    }
}
