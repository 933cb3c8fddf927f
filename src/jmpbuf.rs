//! Non-local exits.
//!
//! A jmp_buf is a special object capturing enough of the mutator's stack
//! machinery (frame pointer, native frame pointer, allocation root depth,
//! the frame's object slots, optionally the signal mask) to restore a
//! consistent view on long-jump. The platform register area is an opaque
//! blob the compiler intrinsic fills; the runtime only unwinds its own
//! structures and hands the delivered value back.

use crate::frame::{Frame, NativeFrame};
use crate::object::{Object, SpecialType};
use crate::origin::Origin;
use crate::ptr::Ptr;
use crate::thread::Mutator;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum SetjmpKind {
    /// `setjmp`: saves the signal mask on platforms where setjmp does.
    Setjmp = 0,
    /// `_setjmp`: never saves the signal mask.
    BareSetjmp = 1,
    /// `sigsetjmp`: saves the mask when asked to.
    Sigsetjmp = 2,
}

pub const SYSTEM_JMP_BUF_WORDS: usize = 32;

#[repr(C)]
pub struct JmpBufPayload {
    pub kind: SetjmpKind,
    saved_top_frame: *mut Frame,
    saved_top_native_frame: *mut NativeFrame,
    saved_allocation_roots: usize,
    has_sigmask: bool,
    #[cfg(unix)]
    sigmask: libc::sigset_t,
    /// Written by the compiler-emitted setjmp intrinsic; opaque here.
    pub system: [usize; SYSTEM_JMP_BUF_WORDS],
    num_lowers: usize,
    lowers: [*mut u8; 0],
}

impl JmpBufPayload {
    #[inline]
    unsafe fn lower_slot(&self, index: usize) -> *mut *mut u8 {
        (self.lowers.as_ptr() as *mut *mut u8).add(index)
    }
}

/// Capture the current frame state into a fresh JmpBuf special object.
pub fn setjmp_create(thread: &Mutator, kind: SetjmpKind, save_sigmask: bool) -> Ptr {
    unsafe {
        let frame = thread.top_frame();
        let num_lowers = if frame.is_null() {
            0
        } else {
            (*frame).num_lowers()
        };
        let size = std::mem::size_of::<JmpBufPayload>()
            + num_lowers * std::mem::size_of::<*mut u8>();
        let ptr = crate::allocation::allocate_special(thread, size, SpecialType::JmpBuf);
        let payload = (*ptr.object()).special_payload() as *mut JmpBufPayload;
        (*payload).kind = kind;
        (*payload).saved_top_frame = frame;
        (*payload).saved_top_native_frame = thread.top_native_frame();
        (*payload).saved_allocation_roots = thread.allocation_roots_len();
        (*payload).num_lowers = num_lowers;
        for index in 0..num_lowers {
            let lower = (*frame).get_lower(index);
            (*payload).lower_slot(index).write(lower);
            if !lower.is_null() {
                crate::collector::store_barrier(thread, Object::from_lower(lower));
            }
        }
        let want_mask = match kind {
            SetjmpKind::Setjmp => true,
            SetjmpKind::BareSetjmp => false,
            SetjmpKind::Sigsetjmp => save_sigmask,
        };
        (*payload).has_sigmask = want_mask;
        #[cfg(unix)]
        {
            if want_mask {
                (*payload).sigmask = crate::signal::current_sigmask();
            }
        }
        ptr
    }
}

/// Unwind to a captured jmp_buf. Pops frames, native frames (unlocking and
/// releasing them on the way), and allocation roots back to the snapshot,
/// restores the frame's object slots and the signal mask, and returns the
/// value the setjmp site must observe. The register restore itself belongs
/// to the compiler intrinsic that runs after this returns.
pub fn longjmp_unwind(thread: &Mutator, buf: Ptr, value: i32, origin: Option<&Origin>) -> i32 {
    unsafe {
        let payload =
            crate::check::special_payload_of(buf, SpecialType::JmpBuf, origin) as *mut JmpBufPayload;
        let target = (*payload).saved_top_frame;

        // The target frame must still be on this thread's stack; jumping to
        // a returned frame is undefined in C and fatal here.
        let mut cursor = thread.top_frame();
        let mut found = target.is_null();
        while !cursor.is_null() {
            if cursor == target {
                found = true;
                break;
            }
            cursor = (*cursor).parent;
        }
        safety_check!(
            found,
            origin,
            "longjmp to a frame that already returned: {}",
            buf
        );

        let saved_native = (*payload).saved_top_native_frame;
        let mut native = thread.top_native_frame();
        while native != saved_native {
            safety_check!(
                !native.is_null(),
                origin,
                "longjmp past the bottom of the native frame stack: {}",
                buf
            );
            if (*native).is_locked() {
                (*native).unlock();
            }
            (*native).release();
            native = (*native).parent;
        }
        thread.set_top_native_frame(saved_native);

        thread.truncate_allocation_roots((*payload).saved_allocation_roots);
        thread.set_top_frame(target);

        if !target.is_null() {
            for index in 0..(*payload).num_lowers.min((*target).num_lowers()) {
                (*target).set_lower(index, (*payload).lower_slot(index).read());
            }
        }

        #[cfg(unix)]
        {
            if (*payload).has_sigmask {
                crate::signal::set_sigmask(&(*payload).sigmask);
            }
        }

        if value == 0 {
            1
        } else {
            value
        }
    }
}

/// A jmp_buf's captured lowers are collector roots for as long as the
/// buffer lives.
pub(crate) unsafe fn scan_jmp_buf(object: *mut Object, mark: &mut dyn FnMut(*mut Object)) {
    let payload = (*object).special_payload() as *const JmpBufPayload;
    for index in 0..(*payload).num_lowers {
        let lower = (*payload).lower_slot(index).read();
        if !lower.is_null() {
            mark(Object::from_lower(lower));
        }
    }
}
