//! # fugc
//!
//! A concurrent, non-moving garbage collector and the pointer-capability
//! machinery that makes C-like code memory safe. Every pointer carries its
//! capability (the enclosing object's header); every access is checked; the
//! collector runs concurrently with the mutators, rendezvousing only
//! through soft handshakes at pollchecks.
//!
//! The crate's surface is the set of calls a compiler for a safe C dialect
//! emits: allocation, checked access, pointer load/store with shadow
//! tracking, setjmp/longjmp, enter/exit/pollcheck, and the collector's
//! request/wait scheduling API.

#[macro_use]
pub mod config;
#[macro_use]
pub mod panic;
#[macro_use]
pub mod origin;
pub mod allocation;
pub mod aux;
pub mod bitmap;
pub mod check;
pub mod collector;
pub mod frame;
pub mod global;
pub mod handshake;
pub mod heap;
pub mod jmpbuf;
pub mod mmap;
pub mod object;
pub mod ptr;
pub mod signal;
pub mod special;
pub mod thread;
pub mod util;

#[cfg(test)]
mod tests;

use parking_lot::{Condvar, Mutex, Once};

/// Bulk operations longer than this exit across the work and re-validate
/// aliveness window by window.
pub const MAX_BYTES_BETWEEN_POLLCHECKS: usize = 1000;

/// Cap on the probing fallback that doubles its buffer on fault; consumed
/// by the syscall shims layered above this crate.
pub const MAX_FAULT_PROBE_BYTES: usize = 1 << 20;

pub use crate::object::WORD_SIZE;
pub use crate::ptr::Ptr;
pub use crate::thread::{attach_current_thread, spawn_mutator, JoinData, Mutator, MutatorHandle};

pub struct Runtime {
    pub config: config::Config,
    pub heap: heap::GlobalHeap,
    pub threads: handshake::ThreadList,
    pub(crate) handshake_lock: Mutex<()>,
    pub(crate) stw_depth: Mutex<u32>,
    pub(crate) stw_cond: Condvar,
    pub(crate) stw_saved_signals: Mutex<Option<signal::SavedSigset>>,
    pub signal_table: signal::SignalTable,
    pub collector: collector::CollectorState,
    pub globals: global::GlobalState,
}

static INIT: Once = Once::new();
static mut RUNTIME: *mut Runtime = std::ptr::null_mut();

/// Bring the runtime up: configuration, the heap reservation, the free
/// singleton, and the collector thread. Idempotent; everything that can be
/// a collector root is built here, never lazily.
pub fn initialize() {
    INIT.call_once(|| {
        let config = config::Config::from_env();
        if config.log_to_file {
            config::open_log_file();
        }
        let boxed = Box::new(Runtime {
            heap: heap::GlobalHeap::new(config.heap_reservation),
            threads: handshake::ThreadList::new(),
            handshake_lock: Mutex::new(()),
            stw_depth: Mutex::new(0),
            stw_cond: Condvar::new(),
            stw_saved_signals: Mutex::new(None),
            signal_table: signal::SignalTable::new(),
            collector: collector::CollectorState::new(),
            globals: global::GlobalState::new(),
            config,
        });
        unsafe {
            object::init_free_singleton();
            RUNTIME = Box::into_raw(boxed);
            let rt = &*RUNTIME;
            rt.heap
                .set_live_bytes_trigger(rt.config.min_trigger, collector::live_bytes_trigger);
        }
        collector::spawn_collector_thread();
        if runtime().config.dump_setup {
            collector::dump_setup();
        }
    });
}

#[inline(always)]
pub fn runtime() -> &'static Runtime {
    unsafe {
        debug_assert!(!RUNTIME.is_null(), "runtime not initialized");
        &*RUNTIME
    }
}

#[inline(always)]
pub fn runtime_initialized() -> bool {
    unsafe { !RUNTIME.is_null() }
}
