//! The mutator/collector rendezvous protocol.
//!
//! A soft handshake posts a callback to every started mutator and returns
//! once each has run it: inline by the requester when the target is exited,
//! at the target's next pollcheck otherwise. Stop-the-world is the heavier
//! cousin used only by fork and similar operations; it holds every mutator
//! exited until the world resumes.

use std::cell::UnsafeCell;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::thread::{Mutator, PollcheckCallback, THREAD_STATE_STOP_REQUESTED};

pub struct ThreadList {
    head: UnsafeCell<*mut Mutator>,
    pub(crate) lock: Mutex<u32>,
    cv_join: Condvar,
}

unsafe impl Send for ThreadList {}
unsafe impl Sync for ThreadList {}

impl ThreadList {
    pub fn new() -> ThreadList {
        ThreadList {
            head: UnsafeCell::new(std::ptr::null_mut()),
            lock: Mutex::new(0),
            cv_join: Condvar::new(),
        }
    }

    /// Walk every registered record. Caller holds the list lock.
    pub(crate) unsafe fn iterate_locked(&self, mut f: impl FnMut(*mut Mutator)) {
        let mut cursor = *self.head.get();
        while !cursor.is_null() {
            let next = (*cursor).next.get();
            f(cursor);
            cursor = next;
        }
    }

    fn snapshot(&self) -> Vec<*mut Mutator> {
        let guard = self.lock.lock();
        let mut threads = Vec::new();
        unsafe {
            self.iterate_locked(|mutator| {
                if (*mutator).has_started.get() && !(*mutator).is_terminated.get() {
                    threads.push(mutator);
                }
            });
        }
        drop(guard);
        threads
    }

    /// Wait until only the calling mutator remains registered.
    pub fn join_all(&self) {
        let mut count = self.lock.lock();
        while *count > 1 {
            self.cv_join.wait(&mut count);
        }
    }
}

/// Add a record to the global list. The thread is "manually tracked" at
/// this point: visible to the runtime, not yet participating in handshakes.
pub unsafe fn register_thread(mutator: *mut Mutator) {
    let list = &crate::runtime().threads;
    let mut count = list.lock.lock();
    let head = &mut *list.head.get();
    if !head.is_null() {
        (**head).prev.set(mutator);
    }
    (*mutator).prev.set(std::ptr::null_mut());
    (*mutator).next.set(*head);
    *head = mutator;
    *count += 1;
}

/// Flip `has_started` under both the stop-the-world and handshake locks, so
/// a collector in either protocol cannot miss the thread.
pub unsafe fn start_thread(mutator: *mut Mutator) {
    let rt = crate::runtime();
    let mut stw_depth = rt.stw_depth.lock();
    while *stw_depth > 0 {
        rt.stw_cond.wait(&mut stw_depth);
    }
    let _handshake = rt.handshake_lock.lock();
    (*mutator).has_started.set(true);
}

/// Unlink a record. Serialized against any in-flight handshake so snapshot
/// pointers stay valid for the handshake's full duration.
pub unsafe fn unregister_thread(mutator: *mut Mutator) {
    let rt = crate::runtime();
    let _handshake = rt.handshake_lock.lock();
    let list = &rt.threads;
    let mut count = list.lock.lock();
    let head = &mut *list.head.get();
    let prev = (*mutator).prev.get();
    let next = (*mutator).next.get();
    if !next.is_null() {
        (*next).prev.set(prev);
    }
    if !prev.is_null() {
        (*prev).next.set(next);
    } else {
        *head = next;
    }
    *count -= 1;
    list.cv_join.notify_all();
}

/// Post `callback` to every started mutator and wait until each has run it.
///
/// The caller must not be an entered mutator: a mutator calls this only
/// from an exited section (syscall-style), and the collector is never
/// entered. An exited caller's own callback runs inline in the first pass.
pub fn soft_handshake(callback: PollcheckCallback, arg: *mut u8) {
    let rt = crate::runtime();
    let _handshake = rt.handshake_lock.lock();
    let threads = rt.threads.snapshot();

    for &mutator in &threads {
        unsafe {
            let _guard = (*mutator).lock.lock();
            (*mutator).post_callback(callback, arg);
        }
    }

    // First pass: run inline for every thread observed exited.
    for &mutator in &threads {
        unsafe {
            let _guard = (*mutator).lock.lock();
            if !(*mutator).is_entered() {
                (*mutator).run_pending_callback(mutator);
            }
        }
    }

    // Second pass: wait out the rest; they run the callback at their next
    // pollcheck or exit.
    for &mutator in &threads {
        unsafe {
            let mut guard = (*mutator).lock.lock();
            while (*mutator).state_bits() & crate::thread::THREAD_STATE_CHECK_REQUESTED != 0 {
                (*mutator).cond.wait(&mut guard);
            }
        }
    }
}

unsafe fn noop_callback(_mutator: *mut Mutator, _arg: *mut u8) {}

/// A no-op handshake: forces every mutator past a store-store fence between
/// request and observation.
pub fn noop_handshake() {
    soft_handshake(noop_callback, std::ptr::null_mut());
}

/// Stop every started mutator. Reentrant by count; the matching
/// `resume_the_world` releases the stop. The caller must be exited.
pub fn stop_the_world() {
    let rt = crate::runtime();
    let mut depth = rt.stw_depth.lock();
    *depth += 1;
    if *depth > 1 {
        return;
    }
    drop(depth);

    let start = if rt.config.verbose_stw {
        Some(Instant::now())
    } else {
        None
    };
    let saved = crate::signal::block_reasonable_signals();
    rt.stw_saved_signals.lock().replace(saved);

    let list_guard = rt.threads.lock.lock();
    std::mem::forget(list_guard);

    let current = Mutator::current();
    unsafe {
        rt.threads.iterate_locked(|mutator| {
            if !(*mutator).has_started.get() || mutator == current {
                return;
            }
            let _guard = (*mutator).lock.lock();
            (*mutator)
                .state
                .fetch_or(THREAD_STATE_STOP_REQUESTED, atomic::Ordering::SeqCst);
        });
        rt.threads.iterate_locked(|mutator| {
            if !(*mutator).has_started.get() || mutator == current {
                return;
            }
            let mut guard = (*mutator).lock.lock();
            while (*mutator).is_entered() {
                (*mutator).cond.wait(&mut guard);
            }
        });
    }

    if let Some(start) = start {
        rt_log!(
            "[stw] world stopped in {:.4}ms",
            start.elapsed().as_micros() as f64 / 1000.0
        );
    }
}

/// Release a stop. The last release clears every STOP bit and wakes the
/// blocked mutators.
pub fn resume_the_world() {
    let rt = crate::runtime();
    let mut depth = rt.stw_depth.lock();
    internal_check!(*depth > 0, "resume_the_world without stop_the_world");
    *depth -= 1;
    if *depth > 0 {
        return;
    }
    rt.stw_cond.notify_all();
    drop(depth);

    let current = Mutator::current();
    unsafe {
        rt.threads.iterate_locked(|mutator| {
            if !(*mutator).has_started.get() || mutator == current {
                return;
            }
            let _guard = (*mutator).lock.lock();
            (*mutator)
                .state
                .fetch_and(!THREAD_STATE_STOP_REQUESTED, atomic::Ordering::SeqCst);
            (*mutator).cond.notify_all();
        });
        rt.threads.lock.force_unlock();
    }

    if let Some(saved) = rt.stw_saved_signals.lock().take() {
        crate::signal::restore_signals(saved);
    }
    if rt.config.verbose_stw {
        rt_log!("[stw] world resumed");
    }
}

/// Fork integration: stop the collector and the world, take every thread
/// lock, run fork(2), then unwind the machinery on both sides. In the child
/// every other mutator's record is destroyed and the collector thread is
/// respawned.
#[cfg(unix)]
pub fn fork(thread: &Mutator) -> libc::pid_t {
    let _exited = thread.exited();
    crate::collector::suspend();
    stop_the_world();

    let rt = crate::runtime();
    let current = Mutator::current();
    let mut locked: Vec<*mut Mutator> = Vec::new();
    unsafe {
        rt.threads.iterate_locked(|mutator| {
            if mutator != current {
                std::mem::forget((*mutator).lock.lock());
                locked.push(mutator);
            }
        });
    }

    let pid = unsafe { libc::fork() };

    unsafe {
        for &mutator in &locked {
            (*mutator).lock.force_unlock();
        }
    }

    if pid == 0 {
        unsafe {
            // Only the forking thread survives in the child; every other
            // record is unlinked and dropped without running its thread.
            let list = &rt.threads;
            let mut count = list.lock.lock();
            let mut doomed = Vec::new();
            list.iterate_locked(|mutator| {
                if mutator != current {
                    doomed.push(mutator);
                }
            });
            for mutator in doomed {
                let prev = (*mutator).prev.get();
                let next = (*mutator).next.get();
                if !next.is_null() {
                    (*next).prev.set(prev);
                }
                if !prev.is_null() {
                    (*prev).next.set(next);
                } else {
                    *list.head.get() = next;
                }
                *count -= 1;
                (*mutator).is_terminated.set(true);
                if (*mutator).thread_object().is_null() {
                    drop(Box::from_raw(mutator));
                }
            }
        }
        resume_the_world();
        crate::collector::respawn_in_child();
    } else {
        resume_the_world();
        crate::collector::resume();
    }
    pid
}
