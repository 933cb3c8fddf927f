//! Mutator thread records.
//!
//! One record per thread running managed code. The `state` byte is the
//! rendezvous point between the thread and the collector: ENTERED gates all
//! access to per-thread data, and the CHECK/STOP/DEFERRED bits force the
//! thread through its pollcheck slow path, where handshake callbacks, world
//! stops and deferred signals are all serviced at one well-defined point.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::frame::{Frame, NativeFrame};
use crate::heap::InlineAllocators;
use crate::object::Object;
use crate::ptr::{AtomicPtrPair, Ptr};

pub const THREAD_STATE_ENTERED: u8 = 1;
pub const THREAD_STATE_CHECK_REQUESTED: u8 = 2;
pub const THREAD_STATE_STOP_REQUESTED: u8 = 4;
pub const THREAD_STATE_DEFERRED_SIGNAL: u8 = 8;

/// Highest signal number the deferral machinery tracks.
pub const MAX_SIGNUM: usize = 31;

pub const NUM_UNWIND_REGISTERS: usize = 2;

/// A pending soft-handshake callback: function plus opaque argument. Plain
/// function pointers so the same callback can run on any thread without
/// capturing.
pub type PollcheckCallback = unsafe fn(*mut Mutator, *mut u8);

pub struct Mutator {
    pub(crate) state: AtomicU8,
    pub(crate) lock: Mutex<()>,
    pub(crate) cond: Condvar,

    top_frame: Cell<*mut Frame>,
    top_native_frame: Cell<*mut NativeFrame>,
    allocation_roots: UnsafeCell<Vec<*mut u8>>,

    /// Thread-local grey set; drained to the global stack at handshakes.
    pub(crate) mark_stack: UnsafeCell<Vec<*mut Object>>,
    pub(crate) allocators: UnsafeCell<InlineAllocators>,

    cc_buffer: Cell<*mut Object>,
    cc_aux_buffer: Cell<*mut Object>,

    pub(crate) num_deferred_signals: [AtomicU32; MAX_SIGNUM + 1],
    pub(crate) special_deferral_depth: AtomicU32,

    /// Landing-pad protocol slots; scanned as roots.
    pub(crate) unwind_registers: [AtomicPtrPair; NUM_UNWIND_REGISTERS],

    callback: Cell<Option<(PollcheckCallback, *mut u8)>>,

    pub(crate) prev: Cell<*mut Mutator>,
    pub(crate) next: Cell<*mut Mutator>,
    pub(crate) has_started: Cell<bool>,
    pub(crate) is_terminated: Cell<bool>,

    /// The Thread special object exposing this record to user code; null
    /// until first requested.
    thread_object: Cell<*mut Object>,

    join: Arc<JoinDataInternal>,
}

unsafe impl Send for Mutator {}
unsafe impl Sync for Mutator {}

thread_local! {
    static CURRENT: Cell<*mut Mutator> = Cell::new(std::ptr::null_mut());
}

impl Mutator {
    pub fn new() -> Box<Mutator> {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Box::new(Mutator {
            state: AtomicU8::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            top_frame: Cell::new(std::ptr::null_mut()),
            top_native_frame: Cell::new(std::ptr::null_mut()),
            allocation_roots: UnsafeCell::new(Vec::new()),
            mark_stack: UnsafeCell::new(Vec::new()),
            allocators: UnsafeCell::new(InlineAllocators::new()),
            cc_buffer: Cell::new(std::ptr::null_mut()),
            cc_aux_buffer: Cell::new(std::ptr::null_mut()),
            num_deferred_signals: [ZERO; MAX_SIGNUM + 1],
            special_deferral_depth: AtomicU32::new(0),
            unwind_registers: [
                AtomicPtrPair::new(Ptr::null()),
                AtomicPtrPair::new(Ptr::null()),
            ],
            callback: Cell::new(None),
            prev: Cell::new(std::ptr::null_mut()),
            next: Cell::new(std::ptr::null_mut()),
            has_started: Cell::new(false),
            is_terminated: Cell::new(false),
            thread_object: Cell::new(std::ptr::null_mut()),
            join: Arc::new(JoinDataInternal::new()),
        })
    }

    #[inline(always)]
    pub fn current() -> *mut Mutator {
        CURRENT.with(|cell| cell.get())
    }

    pub(crate) fn make_current(this: *mut Mutator) {
        CURRENT.with(|cell| cell.set(this));
    }

    #[inline(always)]
    pub fn state_bits(&self) -> u8 {
        self.state.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn is_entered(&self) -> bool {
        self.state_bits() & THREAD_STATE_ENTERED != 0
    }

    // Frame list accessors; written only by the owning thread, read by the
    // collector while the thread is held at a safepoint.
    #[inline(always)]
    pub fn top_frame(&self) -> *mut Frame {
        self.top_frame.get()
    }
    #[inline(always)]
    pub fn set_top_frame(&self, frame: *mut Frame) {
        self.top_frame.set(frame);
    }
    #[inline(always)]
    pub fn top_native_frame(&self) -> *mut NativeFrame {
        self.top_native_frame.get()
    }
    #[inline(always)]
    pub fn set_top_native_frame(&self, frame: *mut NativeFrame) {
        self.top_native_frame.set(frame);
    }

    pub fn push_allocation_root(&self, base: *mut u8) {
        unsafe {
            (*self.allocation_roots.get()).push(base);
        }
    }

    pub fn pop_allocation_root(&self, base: *mut u8) {
        unsafe {
            let roots = &mut *self.allocation_roots.get();
            let top = roots.pop();
            internal_check!(
                top == Some(base),
                "allocation root stack mismatch: popped {:?}, expected {:p}",
                top,
                base
            );
        }
    }

    pub fn allocation_roots_len(&self) -> usize {
        unsafe { (*self.allocation_roots.get()).len() }
    }

    pub(crate) fn truncate_allocation_roots(&self, len: usize) {
        unsafe {
            (*self.allocation_roots.get()).truncate(len);
        }
    }

    pub(crate) unsafe fn for_each_allocation_root(&self, mut f: impl FnMut(*mut u8)) {
        for &base in (*self.allocation_roots.get()).iter() {
            f(base);
        }
    }

    pub fn unwind_register(&self, index: usize) -> Ptr {
        self.unwind_registers[index].load_relaxed()
    }

    pub fn set_unwind_register(&self, index: usize, value: Ptr) {
        self.unwind_registers[index].store_relaxed(value);
    }

    /// Phase-2 landing of a two-phase unwind: park the exception and
    /// selector where the landing pad reads them. The registers are
    /// collector roots until consumed.
    pub fn landing_pad(&self, exception: Ptr, selector: Ptr) {
        crate::collector::store_barrier(self, exception.object());
        crate::collector::store_barrier(self, selector.object());
        self.set_unwind_register(0, exception);
        self.set_unwind_register(1, selector);
    }

    /// Consume the parked unwind values at the landing pad.
    pub fn resume_unwind(&self) -> (Ptr, Ptr) {
        let exception = self.unwind_register(0);
        let selector = self.unwind_register(1);
        crate::collector::load_barrier(self, exception.object());
        crate::collector::load_barrier(self, selector.object());
        self.set_unwind_register(0, Ptr::null());
        self.set_unwind_register(1, Ptr::null());
        (exception, selector)
    }

    pub(crate) fn thread_object(&self) -> *mut Object {
        self.thread_object.get()
    }

    pub(crate) fn set_thread_object(&self, object: *mut Object) {
        self.thread_object.set(object);
    }

    pub(crate) fn cc_buffer_object(&self) -> *mut Object {
        self.cc_buffer.get()
    }
    pub(crate) fn cc_aux_buffer_object(&self) -> *mut Object {
        self.cc_aux_buffer.get()
    }
    pub(crate) fn set_cc_buffer_object(&self, object: *mut Object) {
        self.cc_buffer.set(object);
    }
    pub(crate) fn set_cc_aux_buffer_object(&self, object: *mut Object) {
        self.cc_aux_buffer.set(object);
    }

    /// Enter managed execution. Must be exited. Services any pending stop or
    /// callback before the ENTERED bit goes on.
    pub fn enter(&self) {
        loop {
            let state = self.state_bits();
            debug_assert_eq!(state & THREAD_STATE_ENTERED, 0);
            if state & (THREAD_STATE_STOP_REQUESTED | THREAD_STATE_CHECK_REQUESTED) != 0 {
                self.enter_slow();
                continue;
            }
            if self
                .state
                .compare_exchange_weak(
                    state,
                    state | THREAD_STATE_ENTERED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    #[cold]
    fn enter_slow(&self) {
        let saved = crate::signal::block_reasonable_signals();
        {
            let mut guard = self.lock.lock();
            self.run_pending_callback(self as *const Mutator as *mut Mutator);
            while self.state_bits() & THREAD_STATE_STOP_REQUESTED != 0 {
                self.cond.wait(&mut guard);
            }
        }
        crate::signal::restore_signals(saved);
    }

    /// Leave managed execution. Services deferred signals and pending
    /// callbacks before the ENTERED bit goes off; wakes the collector if a
    /// stop was requested while we were entered.
    pub fn exit(&self) {
        loop {
            let state = self.state_bits();
            debug_assert_ne!(state & THREAD_STATE_ENTERED, 0);
            if state & THREAD_STATE_DEFERRED_SIGNAL != 0 {
                crate::signal::run_deferred_signals(self);
                continue;
            }
            if state & THREAD_STATE_CHECK_REQUESTED != 0 {
                let _guard = self.lock.lock();
                self.run_pending_callback(self as *const Mutator as *mut Mutator);
                continue;
            }
            if self
                .state
                .compare_exchange_weak(
                    state,
                    state & !THREAD_STATE_ENTERED,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                if state & THREAD_STATE_STOP_REQUESTED != 0 {
                    let _guard = self.lock.lock();
                    self.cond.notify_all();
                }
                return;
            }
        }
    }

    /// The compiler-emitted safepoint. Cheap when nothing is requested.
    #[inline(always)]
    pub fn pollcheck(&self) {
        if self.state_bits()
            & (THREAD_STATE_CHECK_REQUESTED
                | THREAD_STATE_STOP_REQUESTED
                | THREAD_STATE_DEFERRED_SIGNAL)
            != 0
        {
            self.pollcheck_slow();
        }
    }

    #[inline(never)]
    #[cold]
    pub fn pollcheck_slow(&self) {
        self.exit();
        self.enter();
    }

    /// Run and clear the pending handshake callback, if any. Caller holds
    /// the thread lock.
    pub(crate) fn run_pending_callback(&self, this: *mut Mutator) {
        if let Some((callback, arg)) = self.callback.take() {
            unsafe {
                callback(this, arg);
            }
            self.state
                .fetch_and(!THREAD_STATE_CHECK_REQUESTED, Ordering::Release);
            self.cond.notify_all();
        }
    }

    /// Post a handshake callback. Caller holds the thread lock and the
    /// handshake lock.
    pub(crate) fn post_callback(&self, callback: PollcheckCallback, arg: *mut u8) {
        self.callback.set(Some((callback, arg)));
        self.state
            .fetch_or(THREAD_STATE_CHECK_REQUESTED, Ordering::Release);
    }

    /// Exit for the duration of a blocking operation. The guard re-enters
    /// on drop.
    pub fn exited<'a>(&'a self) -> ExitedScope<'a> {
        self.exit();
        ExitedScope { mutator: self }
    }

    /// Donate the local grey set to the global mark stack.
    pub(crate) fn donate_mark_stack(&self) {
        unsafe {
            let local = &mut *self.mark_stack.get();
            if !local.is_empty() {
                crate::collector::donate(local);
            }
        }
    }

    pub(crate) unsafe fn stop_allocators(&self) {
        (*self.allocators.get()).stop();
    }

    pub fn join_data(&self) -> JoinData {
        JoinData {
            internal: self.join.clone(),
        }
    }

    pub(crate) fn signal_stopped(&self) {
        let mut running = self.join.running.lock();
        *running = false;
        self.join.cv_stopped.notify_all();
    }
}

pub struct ExitedScope<'a> {
    mutator: &'a Mutator,
}

impl<'a> Drop for ExitedScope<'a> {
    fn drop(&mut self) {
        self.mutator.enter();
    }
}

pub(crate) struct JoinDataInternal {
    running: Mutex<bool>,
    cv_stopped: Condvar,
}

impl JoinDataInternal {
    fn new() -> JoinDataInternal {
        JoinDataInternal {
            running: Mutex::new(true),
            cv_stopped: Condvar::new(),
        }
    }
}

/// Handle for waiting on a spawned mutator, in the manner of thread join.
pub struct JoinData {
    pub(crate) internal: Arc<JoinDataInternal>,
}

impl JoinData {
    /// Wait for the mutator to stop. The calling mutator exits across the
    /// wait so it cannot hold up a handshake.
    pub fn join(self, waiter: &Mutator) {
        let _exited = waiter.exited();
        let mut running = self.internal.running.lock();
        while *running {
            self.internal.cv_stopped.wait(&mut running);
        }
    }
}

/// Attach the calling OS thread as a mutator: register, start, enter.
/// Detaches (exits and unregisters) when the handle drops.
pub struct MutatorHandle {
    mutator: *mut Mutator,
}

impl MutatorHandle {
    pub fn mutator(&self) -> &Mutator {
        unsafe { &*self.mutator }
    }
}

impl std::ops::Deref for MutatorHandle {
    type Target = Mutator;
    fn deref(&self) -> &Mutator {
        unsafe { &*self.mutator }
    }
}

impl Drop for MutatorHandle {
    fn drop(&mut self) {
        unsafe {
            detach_thread(self.mutator);
        }
    }
}

pub fn attach_current_thread() -> MutatorHandle {
    let mutator = Box::into_raw(Mutator::new());
    unsafe {
        crate::handshake::register_thread(mutator);
        crate::handshake::start_thread(mutator);
        Mutator::make_current(mutator);
        (*mutator).enter();
    }
    MutatorHandle { mutator }
}

/// Tear down the calling thread's mutator: exit, stop allocators, donate
/// any barrier-accumulated greys, unregister, and release the record (the
/// sweep releases it instead if a Thread object still references it).
pub(crate) unsafe fn detach_thread(mutator: *mut Mutator) {
    (*mutator).exit();
    {
        let _guard = (*mutator).lock.lock();
        (*mutator).stop_allocators();
    }
    (*mutator).donate_mark_stack();
    crate::handshake::unregister_thread(mutator);
    (*mutator).is_terminated.set(true);
    (*mutator).signal_stopped();
    Mutator::make_current(std::ptr::null_mut());
    if (*mutator).thread_object().is_null() {
        drop(Box::from_raw(mutator));
    }
}

/// Spawn a new mutator thread running `f`. The record is registered before
/// the thread starts (manually tracked), and started under the stop-the-
/// world and handshake locks so a concurrent collector cannot miss it.
pub fn spawn_mutator<F>(f: F) -> JoinData
where
    F: FnOnce(&Mutator) + Send + 'static,
{
    let mutator = Box::into_raw(Mutator::new());
    unsafe {
        // Registration takes the thread-list lock, which a stop-the-world
        // holds for its whole duration; an entered spawner must not block
        // on it.
        let spawner = Mutator::current();
        if !spawner.is_null() && (*spawner).is_entered() {
            let _exited = (*spawner).exited();
            crate::handshake::register_thread(mutator);
        } else {
            crate::handshake::register_thread(mutator);
        }
    }
    let join = unsafe { (*mutator).join_data() };
    let mutator_addr = mutator as usize;
    std::thread::spawn(move || {
        let mutator = mutator_addr as *mut Mutator;
        unsafe {
            crate::handshake::start_thread(mutator);
            Mutator::make_current(mutator);
            (*mutator).enter();
            f(&*mutator);
            detach_thread(mutator);
        }
    });
    join
}
