//! Special-object payloads.
//!
//! Special objects are runtime-managed handles: their bounds cover a single
//! dummy word, the real payload hangs off the aux pointer, and user code can
//! only reach them through `check_special`-guarded operations. Payloads that
//! own native memory get a destructor, run by the sweep when the object
//! dies.

use std::cell::UnsafeCell;
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::check::special_payload_of;
use crate::object::{Object, SpecialType};
use crate::origin::Origin;
use crate::ptr::{AtomicPtrPair, Ptr};
use crate::thread::Mutator;

/// Payload of a Function special object: the callable the capability
/// guards.
#[repr(C)]
pub struct FunctionPayload {
    pub address: fn(i32),
}

/// Payload of a Thread special object: the user-visible handle to a
/// mutator record.
#[repr(C)]
pub struct ThreadPayload {
    pub mutator: *mut Mutator,
}

/// Payload of a DlHandle special object. The dynamic-loading shims
/// themselves live outside the core; the capability kind is defined here so
/// they have something safe to hand out.
#[repr(C)]
pub struct DlHandlePayload {
    pub handle: usize,
}

/// Non-exact pointer tables obfuscate their encoding so table indices do
/// not look like addresses.
pub const PTR_TABLE_OFFSET: usize = 66666;
pub const PTR_TABLE_SHIFT: usize = 4;

pub struct PtrTableInner {
    lock: Mutex<()>,
    entries: UnsafeCell<Vec<Ptr>>,
    free_indices: UnsafeCell<Vec<usize>>,
}

unsafe impl Send for PtrTableInner {}
unsafe impl Sync for PtrTableInner {}

#[repr(C)]
pub struct PtrTablePayload {
    pub inner: *mut PtrTableInner,
}

pub struct ExactPtrTableInner {
    lock: Mutex<()>,
    entries: UnsafeCell<HashMap<usize, Ptr>>,
}

unsafe impl Send for ExactPtrTableInner {}
unsafe impl Sync for ExactPtrTableInner {}

#[repr(C)]
pub struct ExactPtrTablePayload {
    pub inner: *mut ExactPtrTableInner,
}

pub fn allocate_function(thread: &Mutator, address: fn(i32)) -> Ptr {
    let ptr = crate::allocation::allocate_special(
        thread,
        std::mem::size_of::<FunctionPayload>(),
        SpecialType::Function,
    );
    unsafe {
        let payload = (*ptr.object()).special_payload() as *mut FunctionPayload;
        (*payload).address = address;
    }
    ptr
}

pub fn allocate_signal_handler(thread: &Mutator, function: Ptr, mask: u64) -> Ptr {
    crate::check::check_function_call(function, None);
    let ptr = crate::allocation::allocate_special(
        thread,
        std::mem::size_of::<crate::signal::SignalHandlerPayload>(),
        SpecialType::SignalHandler,
    );
    unsafe {
        let payload =
            (*ptr.object()).special_payload() as *mut crate::signal::SignalHandlerPayload;
        std::ptr::write(
            &mut (*payload).function as *mut AtomicPtrPair,
            AtomicPtrPair::new(function),
        );
        (*payload).mask = mask;
        crate::collector::store_barrier(thread, function.object());
    }
    ptr
}

/// Expose `target` as a Thread special object. One per mutator, created on
/// first request; the record is released by the sweep once the object dies
/// and the thread has terminated.
pub fn thread_object_for(thread: &Mutator, target: *mut Mutator) -> Ptr {
    unsafe {
        let existing = (*target).thread_object();
        if !existing.is_null() {
            return Ptr::for_special(existing);
        }
        let ptr = crate::allocation::allocate_special(
            thread,
            std::mem::size_of::<ThreadPayload>(),
            SpecialType::Thread,
        );
        let payload = (*ptr.object()).special_payload() as *mut ThreadPayload;
        (*payload).mutator = target;
        (*target).set_thread_object(ptr.object());
        ptr
    }
}

pub fn allocate_dl_handle(thread: &Mutator, handle: usize) -> Ptr {
    let ptr = crate::allocation::allocate_special(
        thread,
        std::mem::size_of::<DlHandlePayload>(),
        SpecialType::DlHandle,
    );
    unsafe {
        let payload = (*ptr.object()).special_payload() as *mut DlHandlePayload;
        (*payload).handle = handle;
    }
    ptr
}

pub fn ptr_table_new(thread: &Mutator) -> Ptr {
    let ptr = crate::allocation::allocate_special(
        thread,
        std::mem::size_of::<PtrTablePayload>(),
        SpecialType::PtrTable,
    );
    unsafe {
        let inner = Box::into_raw(Box::new(PtrTableInner {
            lock: Mutex::new(()),
            entries: UnsafeCell::new(Vec::new()),
            free_indices: UnsafeCell::new(Vec::new()),
        }));
        let payload = (*ptr.object()).special_payload() as *mut PtrTablePayload;
        (*payload).inner = inner;
    }
    ptr
}

/// Hand out an integer that can later recover `target`'s capability.
pub fn ptr_table_encode(
    thread: &Mutator,
    table: Ptr,
    target: Ptr,
    origin: Option<&Origin>,
) -> usize {
    unsafe {
        let payload = special_payload_of(table, SpecialType::PtrTable, origin)
            as *const PtrTablePayload;
        let inner = &*(*payload).inner;
        crate::collector::store_barrier(thread, target.object());
        let _guard = inner.lock.lock();
        let entries = &mut *inner.entries.get();
        let free_indices = &mut *inner.free_indices.get();
        let index = match free_indices.pop() {
            Some(index) => {
                entries[index] = target;
                index
            }
            None => {
                entries.push(target);
                entries.len() - 1
            }
        };
        ((index + 1) << PTR_TABLE_SHIFT) + PTR_TABLE_OFFSET
    }
}

/// Recover the capability behind an encoded integer. Unknown encodings come
/// back as boxed integers.
pub fn ptr_table_decode(
    thread: &Mutator,
    table: Ptr,
    encoded: usize,
    origin: Option<&Origin>,
) -> Ptr {
    unsafe {
        let payload = special_payload_of(table, SpecialType::PtrTable, origin)
            as *const PtrTablePayload;
        let inner = &*(*payload).inner;
        if encoded < PTR_TABLE_OFFSET || (encoded - PTR_TABLE_OFFSET) % (1 << PTR_TABLE_SHIFT) != 0
        {
            return Ptr::from_int(encoded);
        }
        let index = ((encoded - PTR_TABLE_OFFSET) >> PTR_TABLE_SHIFT).wrapping_sub(1);
        let _guard = inner.lock.lock();
        let entries = &*inner.entries.get();
        match entries.get(index) {
            Some(&value) => {
                crate::collector::load_barrier(thread, value.object());
                value
            }
            None => Ptr::from_int(encoded),
        }
    }
}

pub fn exact_ptr_table_new(thread: &Mutator) -> Ptr {
    let ptr = crate::allocation::allocate_special(
        thread,
        std::mem::size_of::<ExactPtrTablePayload>(),
        SpecialType::ExactPtrTable,
    );
    unsafe {
        let inner = Box::into_raw(Box::new(ExactPtrTableInner {
            lock: Mutex::new(()),
            entries: UnsafeCell::new(HashMap::new()),
        }));
        let payload = (*ptr.object()).special_payload() as *mut ExactPtrTablePayload;
        (*payload).inner = inner;
    }
    ptr
}

/// The exact table maps a raw address to itself; decode recovers the
/// capability stored for that exact address.
pub fn exact_ptr_table_encode(
    thread: &Mutator,
    table: Ptr,
    target: Ptr,
    origin: Option<&Origin>,
) -> usize {
    unsafe {
        let payload = special_payload_of(table, SpecialType::ExactPtrTable, origin)
            as *const ExactPtrTablePayload;
        let inner = &*(*payload).inner;
        crate::collector::store_barrier(thread, target.object());
        let _guard = inner.lock.lock();
        (*inner.entries.get()).insert(target.addr(), target);
        target.addr()
    }
}

pub fn exact_ptr_table_decode(
    thread: &Mutator,
    table: Ptr,
    addr: usize,
    origin: Option<&Origin>,
) -> Ptr {
    unsafe {
        let payload = special_payload_of(table, SpecialType::ExactPtrTable, origin)
            as *const ExactPtrTablePayload;
        let inner = &*(*payload).inner;
        let _guard = inner.lock.lock();
        match (*inner.entries.get()).get(&addr) {
            Some(&value) => {
                crate::collector::load_barrier(thread, value.object());
                value
            }
            None => Ptr::from_int(addr),
        }
    }
}

/// Mark everything a special object's payload keeps alive. Runs on the
/// collector with the object already marked.
pub(crate) unsafe fn scan_special(object: *mut Object, mark: &mut dyn FnMut(*mut Object)) {
    match (*object).special_type() {
        SpecialType::SignalHandler => {
            let payload = (*object).special_payload() as *const crate::signal::SignalHandlerPayload;
            let function = (*payload).function.load_relaxed();
            mark(function.object());
        }
        SpecialType::Thread => {
            let payload = (*object).special_payload() as *const ThreadPayload;
            let mutator = (*payload).mutator;
            if !mutator.is_null() {
                for index in 0..crate::thread::NUM_UNWIND_REGISTERS {
                    mark((*mutator).unwind_register(index).object());
                }
                mark((*mutator).cc_buffer_object());
                mark((*mutator).cc_aux_buffer_object());
            }
        }
        SpecialType::PtrTable => {
            let payload = (*object).special_payload() as *const PtrTablePayload;
            let inner = &*(*payload).inner;
            let _guard = inner.lock.lock();
            for entry in (*inner.entries.get()).iter() {
                mark(entry.object());
            }
        }
        SpecialType::ExactPtrTable => {
            let payload = (*object).special_payload() as *const ExactPtrTablePayload;
            let inner = &*(*payload).inner;
            let _guard = inner.lock.lock();
            for (_, entry) in (*inner.entries.get()).iter() {
                mark(entry.object());
            }
        }
        SpecialType::JmpBuf => {
            crate::jmpbuf::scan_jmp_buf(object, mark);
        }
        _ => {}
    }
}

/// Release native memory owned by a dead special object. Runs on the
/// collector during sweep.
pub(crate) unsafe fn destruct(object: *mut Object) {
    if !(*object).is_special() {
        return;
    }
    match (*object).special_type() {
        SpecialType::Thread => {
            let payload = (*object).special_payload() as *mut ThreadPayload;
            let mutator = (*payload).mutator;
            if !mutator.is_null() && (*mutator).is_terminated.get() {
                (*payload).mutator = std::ptr::null_mut();
                drop(Box::from_raw(mutator));
            }
        }
        SpecialType::PtrTable => {
            let payload = (*object).special_payload() as *mut PtrTablePayload;
            if !(*payload).inner.is_null() {
                drop(Box::from_raw((*payload).inner));
                (*payload).inner = std::ptr::null_mut();
            }
        }
        SpecialType::ExactPtrTable => {
            let payload = (*object).special_payload() as *mut ExactPtrTablePayload;
            if !(*payload).inner.is_null() {
                drop(Box::from_raw((*payload).inner));
                (*payload).inner = std::ptr::null_mut();
            }
        }
        _ => {}
    }
}
