//! The collector loop.
//!
//! A concurrent, on-the-fly, non-moving mark-sweep collector with
//! snapshot-at-the-beginning semantics. It never stops the world for its
//! own work; every rendezvous with the mutators is a soft handshake. Much
//! of what makes it work lives elsewhere (pollchecks, enter/exit, the
//! store barrier, black allocation in the allocator); this module drives
//! the phases and owns the global grey set.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::handshake::{noop_handshake, soft_handshake};
use crate::object::{free_singleton, Object};
use crate::thread::Mutator;

pub struct CollectorState {
    is_marking: CachePadded<AtomicBool>,
    black_allocation: CachePadded<AtomicBool>,
    global_mark_stack: Mutex<Vec<*mut Object>>,
    cycle: Mutex<CycleState>,
    cycle_cond: Condvar,
}

unsafe impl Send for CollectorState {}
unsafe impl Sync for CollectorState {}

struct CycleState {
    requested: u64,
    completed: u64,
    running: bool,
    suspend_depth: u32,
}

impl CollectorState {
    pub fn new() -> CollectorState {
        CollectorState {
            is_marking: CachePadded::new(AtomicBool::new(false)),
            black_allocation: CachePadded::new(AtomicBool::new(false)),
            global_mark_stack: Mutex::new(Vec::new()),
            cycle: Mutex::new(CycleState {
                requested: 0,
                completed: 0,
                running: false,
                suspend_depth: 0,
            }),
            cycle_cond: Condvar::new(),
        }
    }
}

#[inline(always)]
pub fn is_marking() -> bool {
    crate::runtime().collector.is_marking.load(Ordering::Relaxed)
}

#[inline(always)]
pub fn black_allocation() -> bool {
    crate::runtime()
        .collector
        .black_allocation
        .load(Ordering::Relaxed)
}

/// The store barrier: while marking, the object whose pointer is being
/// stored gets marked and greyed on the storing thread.
#[inline(always)]
pub fn store_barrier(thread: &Mutator, object: *mut Object) {
    if !is_marking() || object.is_null() {
        return;
    }
    store_barrier_slow(thread, object);
}

/// The fused load barrier: pointers loaded from memory are greyed the same
/// way, which catches loads whose source slot is then overwritten.
#[inline(always)]
pub fn load_barrier(thread: &Mutator, object: *mut Object) {
    if !is_marking() || object.is_null() {
        return;
    }
    store_barrier_slow(thread, object);
}

#[cold]
fn store_barrier_slow(thread: &Mutator, object: *mut Object) {
    unsafe {
        if (*object).is_global() {
            return;
        }
        if crate::runtime()
            .heap
            .set_is_marked_relaxed(object as *const u8)
        {
            (*thread.mark_stack.get()).push(object);
        }
    }
}

/// Donate a local grey set to the global mark stack.
pub(crate) fn donate(local: &mut Vec<*mut Object>) {
    let mut global = crate::runtime().collector.global_mark_stack.lock();
    global.append(local);
}

/// Mark an object and push it to `stack`. Global objects are permanent
/// roots and carry no mark bit.
unsafe fn mark(stack: &mut Vec<*mut Object>, object: *mut Object) {
    if object.is_null() {
        return;
    }
    if (*object).is_global() {
        return;
    }
    if crate::runtime()
        .heap
        .set_is_marked_relaxed(object as *const u8)
    {
        stack.push(object);
    }
}

/// Mark the pointee of a shadow slot, or retire the slot to the free
/// singleton when the pointee has been freed, so dangling references stop
/// retaining dead objects.
unsafe fn mark_or_free_slot(
    stack: &mut Vec<*mut Object>,
    slot: &std::sync::atomic::AtomicU64,
    mut entry: u64,
) {
    loop {
        match crate::aux::decode_entry(entry) {
            crate::aux::AuxEntry::Empty => return,
            crate::aux::AuxEntry::Lower(lower) => {
                let object = Object::from_lower(lower);
                if !(*object).is_free() {
                    mark(stack, object);
                    return;
                }
                if object == free_singleton() {
                    return;
                }
                let replacement = (*free_singleton()).lower() as u64;
                match slot.compare_exchange(
                    entry,
                    replacement,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => entry = actual,
                }
            }
            crate::aux::AuxEntry::Box(cell) => {
                // The box cell itself must survive as long as the slot.
                crate::runtime()
                    .heap
                    .set_is_marked_relaxed(cell as *const u8);
                let value = (*cell).value.load_relaxed();
                let object = value.object();
                if object.is_null() {
                    return;
                }
                if !(*object).is_free() {
                    mark(stack, object);
                    return;
                }
                if object == free_singleton() {
                    return;
                }
                // Replace the dead capability, keeping the raw address.
                let _ = (*cell).value.compare_exchange(
                    value,
                    crate::ptr::Ptr::with_parts(free_singleton(), value.raw()),
                );
                return;
            }
        }
    }
}

/// Trace one grey object: mark its shadow cell and every capability its
/// payload holds.
unsafe fn scan_object(stack: &mut Vec<*mut Object>, object: *mut Object) {
    if (*object).is_special() {
        crate::special::scan_special(object, &mut |pointee| mark(stack, pointee));
        return;
    }
    let aux = (*object).aux_ptr();
    if aux.is_null() {
        return;
    }
    let flags = (*object).flags();
    if !flags.global_aux() {
        crate::runtime().heap.set_is_marked_relaxed(aux);
    }
    // A freed object's bounds have collapsed; there are no words to scan.
    for word in 0..(*object).word_count() {
        let slot = crate::aux::entry_at(aux, word);
        let entry = slot.load(Ordering::Acquire);
        mark_or_free_slot(stack, slot, entry);
    }
}

/// Phase 3 callback: runs on (or on behalf of) each mutator with its lock
/// held. Stops the inline allocators and contributes every per-thread root
/// to the grey set.
unsafe fn root_scan_callback(mutator: *mut Mutator, _arg: *mut u8) {
    let mutator = &mut *mutator;
    mutator.stop_allocators();

    let heap = &crate::runtime().heap;
    let stack = &mut *mutator.mark_stack.get();

    let mut frame = mutator.top_frame();
    while !frame.is_null() {
        for index in 0..(*frame).num_lowers() {
            let lower = (*frame).get_lower(index);
            if !lower.is_null() {
                mark(stack, Object::from_lower(lower));
            }
        }
        frame = (*frame).parent;
    }

    let mut native = mutator.top_native_frame();
    while !native.is_null() {
        (*native).for_each_tracked(|object| mark(stack, object));
        native = (*native).parent;
    }

    // Allocation roots are unfinished objects: marked so the sweep keeps
    // them, never enqueued for tracing.
    mutator.for_each_allocation_root(|base| {
        heap.set_is_marked_relaxed(base);
    });

    for index in 0..crate::thread::NUM_UNWIND_REGISTERS {
        mark(stack, mutator.unwind_register(index).object());
    }
    mark(stack, mutator.cc_buffer_object());
    mark(stack, mutator.cc_aux_buffer_object());

    mutator.donate_mark_stack();
}

/// Drain-phase callback: each mutator hands its barrier-accumulated greys
/// to the global stack.
unsafe fn donate_callback(mutator: *mut Mutator, _arg: *mut u8) {
    (*mutator).donate_mark_stack();
}

/// Phase 5 callback: marking is over; any grey leftovers in the local
/// stacks are floating garbage for the next cycle, not this one.
unsafe fn clear_local_stack_callback(mutator: *mut Mutator, _arg: *mut u8) {
    (*(*mutator).mark_stack.get()).clear();
}

/// Mark the process-global roots: installed signal handlers, the global
/// variable array, and every registered thread's handle object.
fn mark_global_roots(stack: &mut Vec<*mut Object>) {
    let rt = crate::runtime();
    unsafe {
        rt.signal_table.for_each(|handler| mark(stack, handler));
        crate::global::for_each_global_root(|object| mark(stack, object));
        let guard = rt.threads.lock.lock();
        rt.threads.iterate_locked(|mutator| {
            mark(stack, (*mutator).thread_object());
            for index in 0..crate::thread::NUM_UNWIND_REGISTERS {
                mark(stack, (*mutator).unwind_register(index).object());
            }
            mark(stack, (*mutator).cc_buffer_object());
            mark(stack, (*mutator).cc_aux_buffer_object());
        });
        drop(guard);
    }
}

fn run_cycle() {
    let rt = crate::runtime();
    let heap = &rt.heap;
    let start = std::time::Instant::now();

    heap.clear_mark_bits();

    // Phase 1: every mutator observes the barrier before any marking.
    rt.collector.is_marking.store(true, Ordering::SeqCst);
    noop_handshake();

    // Phase 2: allocation turns black.
    rt.collector.black_allocation.store(true, Ordering::SeqCst);
    noop_handshake();

    // Phase 3: per-thread roots, then process globals.
    soft_handshake(root_scan_callback, std::ptr::null_mut());
    {
        let mut stack = Vec::new();
        mark_global_roots(&mut stack);
        donate(&mut stack);
    }

    // Phase 4: drain to SATB termination: the global stack is empty and a
    // handshake collected nothing new from any mutator.
    let mut stack: Vec<*mut Object> = Vec::new();
    loop {
        loop {
            {
                let mut global = rt.collector.global_mark_stack.lock();
                if global.is_empty() {
                    break;
                }
                std::mem::swap(&mut stack, &mut *global);
            }
            unsafe {
                while let Some(object) = stack.pop() {
                    scan_object(&mut stack, object);
                }
            }
            donate(&mut stack);
            // Everything traced went back through donate; loop to pick up
            // concurrent contributions.
        }
        soft_handshake(donate_callback, std::ptr::null_mut());
        if rt.collector.global_mark_stack.lock().is_empty() {
            break;
        }
    }

    // Phase 5: sweep, then dismantle the barrier.
    let freed = heap.sweep(|object| unsafe { crate::special::destruct(object) });

    rt.collector.is_marking.store(false, Ordering::SeqCst);
    soft_handshake(clear_local_stack_callback, std::ptr::null_mut());
    rt.collector.black_allocation.store(false, Ordering::SeqCst);

    let live = heap.live_bytes();
    heap.set_trigger_threshold(
        ((live as f64) * 1.82).max(rt.config.min_trigger as f64) as usize,
    );

    if rt.config.verbose_stw {
        rt_log!(
            "[gc] cycle freed {} live {} in {:.4}ms",
            crate::util::formatted_size(freed),
            crate::util::formatted_size(live),
            start.elapsed().as_micros() as f64 / 1000.0
        );
    }
}

fn collector_thread_main() {
    let rt = crate::runtime();
    loop {
        {
            let mut cycle = rt.collector.cycle.lock();
            while cycle.requested <= cycle.completed || cycle.suspend_depth > 0 {
                rt.collector.cycle_cond.wait(&mut cycle);
            }
            cycle.running = true;
        }

        run_cycle();

        let mut cycle = rt.collector.cycle.lock();
        cycle.completed += 1;
        cycle.running = false;
        rt.collector.cycle_cond.notify_all();
    }
}

pub(crate) fn spawn_collector_thread() {
    std::thread::Builder::new()
        .name("fugc".to_string())
        .spawn(collector_thread_main)
        .expect("failed to spawn collector thread");
}

/// The live-bytes trigger registered with the heap.
pub(crate) fn live_bytes_trigger() {
    request();
}

/// Request a collection cycle; if one is running, that is the one you get.
/// Returns the cycle number `wait` accepts.
pub fn request() -> u64 {
    let rt = crate::runtime();
    let mut cycle = rt.collector.cycle.lock();
    let target = cycle.completed + 1;
    if cycle.requested < target {
        cycle.requested = target;
        rt.collector.cycle_cond.notify_all();
    }
    target
}

/// Request a cycle that starts strictly after this call.
pub fn request_fresh() -> u64 {
    let rt = crate::runtime();
    let mut cycle = rt.collector.cycle.lock();
    let target = if cycle.running {
        cycle.completed + 2
    } else {
        cycle.completed + 1
    };
    if cycle.requested < target {
        cycle.requested = target;
        rt.collector.cycle_cond.notify_all();
    }
    target
}

/// Wait for `target` to complete. An entered caller exits across the wait.
pub fn wait(target: u64) {
    let mutator = Mutator::current();
    if !mutator.is_null() && unsafe { (*mutator).is_entered() } {
        let exited = unsafe { (*mutator).exited() };
        wait_exited(target);
        drop(exited);
    } else {
        wait_exited(target);
    }
}

fn wait_exited(target: u64) {
    let rt = crate::runtime();
    let mut cycle = rt.collector.cycle.lock();
    while cycle.completed < target {
        rt.collector.cycle_cond.wait(&mut cycle);
    }
}

/// Park the collector between cycles; exists for fork. Waits out any cycle
/// already in flight.
pub fn suspend() {
    let rt = crate::runtime();
    let mut cycle = rt.collector.cycle.lock();
    cycle.suspend_depth += 1;
    while cycle.running {
        rt.collector.cycle_cond.wait(&mut cycle);
    }
}

pub fn resume() {
    let rt = crate::runtime();
    let mut cycle = rt.collector.cycle.lock();
    internal_check!(cycle.suspend_depth > 0, "collector resume without suspend");
    cycle.suspend_depth -= 1;
    if cycle.suspend_depth == 0 {
        rt.collector.cycle_cond.notify_all();
    }
}

/// The child after fork has no collector thread; restart it.
pub(crate) fn respawn_in_child() {
    resume();
    spawn_collector_thread();
}

/// An exposed no-op handshake, for operations like munmap that must know
/// every mutator has passed a fence. The caller must be exited.
pub fn handshake() {
    noop_handshake();
}

/// Log the collector configuration at startup.
pub(crate) fn dump_setup() {
    let rt = crate::runtime();
    rt_log!(
        "[gc] fugc ready: reservation {}, trigger {}, {} size classes",
        crate::util::formatted_size(rt.config.heap_reservation),
        crate::util::formatted_size(rt.config.min_trigger),
        crate::heap::NUM_SIZE_CLASSES
    );
}

