//! Deferred user-signal delivery.
//!
//! A user signal handler is managed code: it cannot run while its thread is
//! mid-transition in the runtime. The handler entry point therefore runs the
//! handler directly only when the receiving mutator is exited; otherwise it
//! bumps a per-signal counter, sets the DEFERRED_SIGNAL bit, and the next
//! pollcheck or exit delivers the handler with the signal's mask blocked.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::check::check_function_call;
use crate::object::{Object, SpecialType};
use crate::ptr::{AtomicPtrPair, Ptr};
use crate::thread::{Mutator, MAX_SIGNUM, THREAD_STATE_DEFERRED_SIGNAL, THREAD_STATE_ENTERED};

/// Payload of a SignalHandler special object.
#[repr(C)]
pub struct SignalHandlerPayload {
    /// The user handler, a Function special object.
    pub function: AtomicPtrPair,
    /// Signals blocked while the handler runs, as a bitmask over 1..=31.
    pub mask: u64,
}

/// The installed-handler table; a process-global collector root.
pub struct SignalTable {
    handlers: [AtomicPtr<Object>; MAX_SIGNUM + 1],
}

impl SignalTable {
    pub fn new() -> SignalTable {
        const NULL: AtomicPtr<Object> = AtomicPtr::new(std::ptr::null_mut());
        SignalTable {
            handlers: [NULL; MAX_SIGNUM + 1],
        }
    }

    pub fn handler(&self, signum: usize) -> *mut Object {
        self.handlers[signum].load(Ordering::Acquire)
    }

    pub(crate) unsafe fn for_each(&self, mut f: impl FnMut(*mut Object)) {
        for slot in self.handlers.iter() {
            let handler = slot.load(Ordering::Acquire);
            if !handler.is_null() {
                f(handler);
            }
        }
    }
}

/// Install a SignalHandler special object for `signum`. Returns the
/// previous handler object, if any.
pub fn install_handler(thread: &Mutator, signum: usize, handler: Ptr) -> *mut Object {
    internal_check!(signum >= 1 && signum <= MAX_SIGNUM, "bad signum {}", signum);
    crate::check::check_special(handler, SpecialType::SignalHandler, None);
    crate::collector::store_barrier(thread, handler.object());
    crate::runtime().signal_table.handlers[signum].swap(handler.object(), Ordering::AcqRel)
}

/// Entry point from the OS signal trampoline (and from tests). Runs the
/// handler now when the mutator is exited and deferral is off; defers it to
/// the next safepoint otherwise.
pub fn deliver_signal(signum: usize) {
    internal_check!(signum >= 1 && signum <= MAX_SIGNUM, "bad signum {}", signum);
    unsafe {
        let mutator = Mutator::current();
        internal_check!(!mutator.is_null(), "signal delivered to unmanaged thread");
        let mutator = &*mutator;
        let entered = mutator.state_bits() & THREAD_STATE_ENTERED != 0;
        let deferral = mutator.special_deferral_depth.load(Ordering::Relaxed) != 0;
        if entered || deferral {
            mutator.num_deferred_signals[signum].fetch_add(1, Ordering::Relaxed);
            mutator
                .state
                .fetch_or(THREAD_STATE_DEFERRED_SIGNAL, Ordering::Release);
        } else {
            mutator.enter();
            invoke_handler(mutator, signum);
            mutator.exit();
        }
    }
}

/// Deliver every deferred signal. Called from `exit` while the mutator is
/// still entered; handlers run as managed code.
pub(crate) fn run_deferred_signals(mutator: &Mutator) {
    mutator
        .state
        .fetch_and(!THREAD_STATE_DEFERRED_SIGNAL, Ordering::AcqRel);
    for signum in 1..=MAX_SIGNUM {
        loop {
            let pending = mutator.num_deferred_signals[signum].load(Ordering::Relaxed);
            if pending == 0 {
                break;
            }
            if mutator.num_deferred_signals[signum]
                .compare_exchange(pending, pending - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            unsafe {
                let handler = crate::runtime().signal_table.handler(signum);
                if handler.is_null() {
                    break;
                }
                let payload = (*handler).special_payload() as *const SignalHandlerPayload;
                let saved = block_mask((*payload).mask);
                invoke_handler(mutator, signum);
                restore_signals(saved);
            }
        }
    }
}

unsafe fn invoke_handler(mutator: &Mutator, signum: usize) {
    let handler = crate::runtime().signal_table.handler(signum);
    if handler.is_null() {
        return;
    }
    let payload = (*handler).special_payload() as *const SignalHandlerPayload;
    let function = (*payload).function.load_relaxed();
    crate::collector::load_barrier(mutator, function.object());
    check_function_call(function, None);
    let code = (*function.object()).special_payload() as *const crate::special::FunctionPayload;
    ((*code).address)(signum as i32);
}

/// Forces deferral even while exited; used for runtime critical sections.
pub struct SignalDeferralScope<'a> {
    mutator: &'a Mutator,
}

impl<'a> SignalDeferralScope<'a> {
    pub fn new(mutator: &'a Mutator) -> SignalDeferralScope<'a> {
        mutator
            .special_deferral_depth
            .fetch_add(1, Ordering::Relaxed);
        SignalDeferralScope { mutator }
    }
}

impl<'a> Drop for SignalDeferralScope<'a> {
    fn drop(&mut self) {
        self.mutator
            .special_deferral_depth
            .fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(unix)]
pub type SavedSigset = libc::sigset_t;
#[cfg(windows)]
pub type SavedSigset = ();

/// Block every signal a handler could reasonably fire for, leaving the
/// crash-reporting set alone. Returns the previous mask.
#[cfg(unix)]
pub fn block_reasonable_signals() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigfillset(set.as_mut_ptr());
        for crash in [
            libc::SIGSEGV,
            libc::SIGBUS,
            libc::SIGILL,
            libc::SIGFPE,
            libc::SIGABRT,
            libc::SIGTRAP,
        ]
        .iter()
        {
            libc::sigdelset(set.as_mut_ptr(), *crash);
        }
        let mut old = MaybeUninit::<libc::sigset_t>::uninit();
        libc::pthread_sigmask(libc::SIG_BLOCK, set.as_ptr(), old.as_mut_ptr());
        old.assume_init()
    }
}

#[cfg(unix)]
pub fn restore_signals(saved: libc::sigset_t) {
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, &saved, std::ptr::null_mut());
    }
}

/// Block the signals in a handler's `sa_mask`-style bitmask.
#[cfg(unix)]
fn block_mask(mask: u64) -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        for signum in 1..=MAX_SIGNUM {
            if mask & (1 << signum) != 0 {
                libc::sigaddset(set.as_mut_ptr(), signum as i32);
            }
        }
        let mut old = MaybeUninit::<libc::sigset_t>::uninit();
        libc::pthread_sigmask(libc::SIG_BLOCK, set.as_ptr(), old.as_mut_ptr());
        old.assume_init()
    }
}

#[cfg(unix)]
pub fn current_sigmask() -> libc::sigset_t {
    unsafe {
        let mut old = MaybeUninit::<libc::sigset_t>::uninit();
        libc::pthread_sigmask(libc::SIG_SETMASK, std::ptr::null(), old.as_mut_ptr());
        old.assume_init()
    }
}

#[cfg(unix)]
pub fn set_sigmask(mask: &libc::sigset_t) {
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, mask, std::ptr::null_mut());
    }
}

#[cfg(windows)]
pub fn block_reasonable_signals() -> SavedSigset {}
#[cfg(windows)]
pub fn restore_signals(_saved: SavedSigset) {}
#[cfg(windows)]
fn block_mask(_mask: u64) -> SavedSigset {}
