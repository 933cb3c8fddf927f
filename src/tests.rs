use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::allocation::{
    allocate, allocate_aligned, ensure_cc_buffer, free, load_int, reallocate, store_int, zmemmove,
    zmemset,
};
use crate::aux::{load_ptr, ptr_cas, ptr_xchg, store_ptr};
use crate::frame::{FrameGuard, FrameWithSlots, NativeFrame, NativeFrameGuard};
use crate::jmpbuf::{longjmp_unwind, setjmp_create, SetjmpKind};
use crate::object::WORD_SIZE;
use crate::ptr::Ptr;
use crate::thread::{attach_current_thread, spawn_mutator, Mutator};

// Collections are process-global; tests that touch the heap serialize on
// one lock so a cycle triggered by one test cannot sweep another test's
// unrooted locals.
static TEST_LOCK: Mutex<()> = parking_lot::const_mutex(());

fn with_mutator(f: impl FnOnce(&Mutator)) {
    crate::initialize();
    let _serial = TEST_LOCK.lock();
    let handle = attach_current_thread();
    f(&handle);
}

fn expect_safety_panic(f: impl FnOnce()) -> String {
    crate::panic::test_hook::arm();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    let message = crate::panic::test_hook::disarm_and_take();
    assert!(result.is_err(), "expected a safety panic");
    message.expect("expected a captured safety panic message")
}

fn load_u8(thread: &Mutator, at: Ptr) -> u8 {
    let mut byte = [0u8; 1];
    load_int(thread, at, &mut byte, None);
    byte[0]
}

#[test]
fn offset_keeps_the_capability() {
    with_mutator(|thread| {
        let p = allocate(thread, 64);
        let q = p.with_offset(12345678);
        assert_eq!(q.object(), p.object());
        assert_eq!(q.addr(), p.addr() + 12345678);
        let back = q.with_offset(-12345678);
        assert_eq!(back, p);
    });
}

#[test]
fn store_then_load_returns_the_same_pointer() {
    with_mutator(|thread| {
        let a = allocate(thread, 32);
        let b = allocate(thread, 32);
        store_ptr(thread, a, b, None);
        let loaded = load_ptr(thread, a, None);
        assert_eq!(loaded, b);
    });
}

#[test]
fn loads_without_shadow_are_boxed_ints() {
    with_mutator(|thread| {
        let a = allocate(thread, 32);
        store_int(thread, a, &0x1122334455667788u64.to_le_bytes(), None);
        let loaded = load_ptr(thread, a, None);
        assert!(loaded.is_boxed_int());
        assert_eq!(loaded.addr(), 0x1122334455667788);
    });
}

#[test]
fn bounds_are_enforced_out_and_back() {
    with_mutator(|thread| {
        let p = allocate(thread, 24);
        store_int(thread, p.with_offset(10), &[0x2a], None);
        store_int(thread, p.with_offset(22), &[0x2a], None);

        let wild = p.with_offset(26208);
        let message = expect_safety_panic(|| {
            let mut byte = [0u8; 1];
            load_int(thread, wild.with_offset(10), &mut byte, None);
        });
        assert!(message.contains("ptr >= upper"), "got: {}", message);
        let message = expect_safety_panic(|| {
            let mut byte = [0u8; 1];
            load_int(thread, wild.with_offset(22), &mut byte, None);
        });
        assert!(message.contains("ptr >= upper"), "got: {}", message);

        let home = wild.with_raw(p.raw());
        assert_eq!(load_u8(thread, home.with_offset(10)), 0x2a);
        assert_eq!(load_u8(thread, home.with_offset(22)), 0x2a);
    });
}

#[test]
fn freed_objects_fail_every_access() {
    with_mutator(|thread| {
        let p = allocate(thread, 48);
        free(thread, p, None);
        let message = expect_safety_panic(|| {
            let mut byte = [0u8; 1];
            load_int(thread, p, &mut byte, None);
        });
        assert!(message.contains("free"), "got: {}", message);
        let message = expect_safety_panic(|| {
            store_int(thread, p, &[1], None);
        });
        assert!(message.contains("free"), "got: {}", message);
    });
}

#[test]
fn dangling_loads_become_boxed_ints() {
    with_mutator(|thread| {
        let a = allocate(thread, 16);
        let b = allocate(thread, 16);
        store_ptr(thread, b, a, None);
        let a_addr = a.addr();
        free(thread, a, None);
        let loaded = load_ptr(thread, b, None);
        assert!(loaded.is_boxed_int());
        assert_eq!(loaded.addr(), a_addr);
    });
}

#[test]
fn double_free_is_fatal() {
    with_mutator(|thread| {
        let p = allocate(thread, 16);
        free(thread, p, None);
        let message = expect_safety_panic(|| free(thread, p, None));
        assert!(message.contains("double free"), "got: {}", message);
    });
}

#[test]
fn interior_free_is_fatal() {
    with_mutator(|thread| {
        let p = allocate(thread, 64);
        let message = expect_safety_panic(|| free(thread, p.with_offset(16), None));
        assert!(message.contains("non-base"), "got: {}", message);
    });
}

#[test]
fn aligned_allocation_respects_alignment() {
    with_mutator(|thread| {
        for &alignment in [32usize, 128, 4096].iter() {
            let p = allocate_aligned(thread, 40, alignment);
            assert_eq!(p.addr() % alignment, 0, "alignment {}", alignment);
            unsafe {
                assert_eq!((*p.object()).alignment(), alignment);
            }
            store_int(thread, p, &[7], None);
            assert_eq!(load_u8(thread, p), 7);
        }
    });
}

#[test]
fn reallocate_carries_data_and_capabilities() {
    with_mutator(|thread| {
        let a = allocate(thread, 48);
        let target = allocate(thread, 16);
        store_int(thread, a, &0xfeedfacecafebeefu64.to_le_bytes(), None);
        store_ptr(thread, a.with_offset(WORD_SIZE as isize), target, None);

        let b = reallocate(thread, a, 96, None);
        assert_ne!(b.raw(), a.raw());
        let mut word = [0u8; 8];
        load_int(thread, b, &mut word, None);
        assert_eq!(u64::from_le_bytes(word), 0xfeedfacecafebeef);
        let carried = load_ptr(thread, b.with_offset(WORD_SIZE as isize), None);
        assert_eq!(carried, target);

        unsafe {
            assert!((*a.object()).is_free());
        }
        let message = expect_safety_panic(|| {
            let mut byte = [0u8; 1];
            load_int(thread, a, &mut byte, None);
        });
        assert!(message.contains("free"), "got: {}", message);
    });
}

#[test]
fn memset_demotes_pointer_words() {
    with_mutator(|thread| {
        let a = allocate(thread, 32);
        let b = allocate(thread, 16);
        store_ptr(thread, a, b, None);
        zmemset(thread, a, 0, WORD_SIZE, None);
        let loaded = load_ptr(thread, a, None);
        assert!(loaded.is_boxed_int());
        assert_eq!(loaded.addr(), 0);
    });
}

#[test]
fn memmove_carries_capabilities_when_aligned() {
    with_mutator(|thread| {
        let a = allocate(thread, 64);
        let b = allocate(thread, 64);
        let target = allocate(thread, 16);
        store_ptr(thread, a.with_offset(16), target, None);
        store_int(thread, a, &[9], None);
        zmemmove(thread, b, a, 64, None);
        assert_eq!(load_u8(thread, b), 9);
        let carried = load_ptr(thread, b.with_offset(16), None);
        assert_eq!(carried, target);
    });
}

#[test]
fn pointer_cas_compares_raw_only() {
    with_mutator(|thread| {
        let slot = allocate(thread, 16);
        let b = allocate(thread, 16);
        let c = allocate(thread, 16);
        store_ptr(thread, slot, b, None);

        let old = ptr_cas(thread, slot, b, c, false, None).expect("cas should succeed");
        assert_eq!(old.raw(), b.raw());
        assert_eq!(load_ptr(thread, slot, None), c);

        let witnessed = ptr_cas(thread, slot, b, b, false, None).expect_err("cas should fail");
        assert_eq!(witnessed.raw(), c.raw());

        let previous = ptr_xchg(thread, slot, b, None);
        assert_eq!(previous.raw(), c.raw());
        assert_eq!(load_ptr(thread, slot, None).raw(), b.raw());
    });
}

#[test]
fn cc_buffers_are_readonly_and_reused() {
    with_mutator(|thread| {
        let buffer = ensure_cc_buffer(thread, 64, false);
        let again = ensure_cc_buffer(thread, 64, false);
        assert_eq!(buffer.object(), again.object());
        let message = expect_safety_panic(|| {
            store_int(thread, buffer, &[1], None);
        });
        assert!(message.contains("readonly"), "got: {}", message);
        let grown = ensure_cc_buffer(thread, 64 * 1024, false);
        unsafe {
            assert!((*grown.object()).size() >= 64 * 1024);
        }
    });
}

static HANDSHAKE_COUNTS: Mutex<Vec<(usize, usize)>> = parking_lot::const_mutex(Vec::new());

unsafe fn count_handshake(mutator: *mut Mutator, _arg: *mut u8) {
    let mut counts = HANDSHAKE_COUNTS.lock();
    for entry in counts.iter_mut() {
        if entry.0 == mutator as usize {
            entry.1 += 1;
            return;
        }
    }
    counts.push((mutator as usize, 1));
}

#[test]
fn soft_handshake_runs_once_per_thread() {
    with_mutator(|thread| {
        const WORKERS: usize = 8;
        static STARTED: AtomicUsize = AtomicUsize::new(0);
        static STOP: AtomicBool = AtomicBool::new(false);
        STARTED.store(0, Ordering::SeqCst);
        STOP.store(false, Ordering::SeqCst);
        HANDSHAKE_COUNTS.lock().clear();

        let mut joins = Vec::new();
        for _ in 0..WORKERS {
            joins.push(spawn_mutator(|mutator| {
                STARTED.fetch_add(1, Ordering::SeqCst);
                while !STOP.load(Ordering::SeqCst) {
                    mutator.pollcheck();
                    std::thread::yield_now();
                }
            }));
        }
        while STARTED.load(Ordering::SeqCst) < WORKERS {
            std::thread::yield_now();
        }

        {
            let _exited = thread.exited();
            crate::handshake::soft_handshake(count_handshake, std::ptr::null_mut());
        }

        let counts = HANDSHAKE_COUNTS.lock();
        assert!(counts.len() >= WORKERS + 1);
        for &(_, count) in counts.iter() {
            assert_eq!(count, 1);
        }
        drop(counts);

        STOP.store(true, Ordering::SeqCst);
        for join in joins {
            join.join(thread);
        }
    });
}

#[test]
fn collection_reclaims_unreachable_objects() {
    with_mutator(|thread| {
        // Settle to a clean baseline first.
        crate::collector::wait(crate::collector::request_fresh());
        let baseline = crate::runtime().heap.live_bytes();

        for _ in 0..65536 {
            let _ = allocate(thread, 16);
        }
        let after_alloc = crate::runtime().heap.live_bytes();
        assert!(after_alloc > baseline + 2 * 1024 * 1024);

        crate::collector::wait(crate::collector::request_fresh());
        let after_gc = crate::runtime().heap.live_bytes();
        assert!(
            after_gc <= baseline + 512 * 1024,
            "baseline {} after {}",
            baseline,
            after_gc
        );
    });
}

crate::runtime_origin!(CHAIN_ORIGIN, "chain_survives_collection", 1);

#[test]
fn reachable_chain_survives_collection() {
    with_mutator(|thread| unsafe {
        let mut storage = FrameWithSlots::<1>::new(&CHAIN_ORIGIN);
        let guard = FrameGuard::push(thread, storage.as_frame());

        let head = allocate(thread, 32);
        (*guard.frame()).set_object(0, head.object());
        let mut cursor = head;
        for index in 0..64u64 {
            let next = allocate(thread, 32);
            store_int(thread, next.with_offset(16), &index.to_le_bytes(), None);
            store_ptr(thread, cursor, next, None);
            cursor = next;
        }

        crate::collector::wait(crate::collector::request_fresh());

        let mut cursor = head;
        for index in 0..64u64 {
            let next = load_ptr(thread, cursor, None);
            assert!(!next.is_boxed_int(), "link {} lost", index);
            let mut word = [0u8; 8];
            load_int(thread, next.with_offset(16), &mut word, None);
            assert_eq!(u64::from_le_bytes(word), index);
            cursor = next;
        }
        drop(guard);
    });
}

crate::runtime_origin!(CONCURRENT_ORIGIN, "allocation_during_collection", 1);

#[test]
fn allocation_during_collection_survives() {
    with_mutator(|thread| unsafe {
        let mut storage = FrameWithSlots::<1>::new(&CONCURRENT_ORIGIN);
        let guard = FrameGuard::push(thread, storage.as_frame());

        // A table of 64 pointer words, filled while a collection runs.
        let table = allocate(thread, 64 * WORD_SIZE);
        (*guard.frame()).set_object(0, table.object());

        let cycle = crate::collector::request_fresh();
        for index in 0..64 {
            let item = allocate(thread, 16);
            store_int(thread, item, &(index as u64).to_le_bytes(), None);
            store_ptr(thread, table.with_offset((index * WORD_SIZE) as isize), item, None);
            thread.pollcheck();
        }
        crate::collector::wait(cycle);
        crate::collector::wait(crate::collector::request_fresh());

        for index in 0..64 {
            let item = load_ptr(thread, table.with_offset((index * WORD_SIZE) as isize), None);
            assert!(!item.is_boxed_int(), "entry {} lost", index);
            let mut word = [0u8; 8];
            load_int(thread, item, &mut word, None);
            assert_eq!(u64::from_le_bytes(word), index as u64);
        }
        drop(guard);
    });
}

crate::runtime_origin!(LONGOP_ORIGIN, "collection_during_bulk_copy", 2);

#[test]
fn collection_during_bulk_copy_preserves_both_sides() {
    with_mutator(|thread| unsafe {
        const SIZE: usize = 4 * 1024 * 1024;
        let mut storage = FrameWithSlots::<2>::new(&LONGOP_ORIGIN);
        let guard = FrameGuard::push(thread, storage.as_frame());

        let src = allocate(thread, SIZE);
        let dst = allocate(thread, SIZE);
        (*guard.frame()).set_object(0, src.object());
        (*guard.frame()).set_object(1, dst.object());
        zmemset(thread, src, 0x5a, SIZE, None);

        let gc = spawn_mutator(|_mutator| {
            crate::collector::wait(crate::collector::request_fresh());
        });
        zmemmove(thread, dst, src, SIZE, None);
        gc.join(thread);

        assert_eq!(load_u8(thread, dst), 0x5a);
        assert_eq!(load_u8(thread, dst.with_offset((SIZE / 2) as isize)), 0x5a);
        assert_eq!(load_u8(thread, dst.with_offset((SIZE - 1) as isize)), 0x5a);
        assert_eq!(load_u8(thread, src.with_offset((SIZE - 1) as isize)), 0x5a);
        drop(guard);
    });
}

crate::runtime_origin!(JMP_ORIGIN, "longjmp_restores_stacks", 2);

#[test]
fn longjmp_restores_stacks_and_delivers_value() {
    with_mutator(|thread| unsafe {
        let mut storage = FrameWithSlots::<2>::new(&JMP_ORIGIN);
        let guard = FrameGuard::push(thread, storage.as_frame());

        let a = allocate(thread, 16);
        (*guard.frame()).set_object(0, a.object());
        let buf = setjmp_create(thread, SetjmpKind::Sigsetjmp, false);
        (*guard.frame()).set_object(1, buf.object());

        let saved_frame = thread.top_frame();
        let saved_native = thread.top_native_frame();
        let saved_roots = thread.allocation_roots_len();

        // A callee pushes a native frame with tracked handles, then jumps.
        let mut nf = NativeFrame::new();
        let nguard = NativeFrameGuard::push(thread, &mut nf);
        let _pin = nguard.frame().track(a.object());
        assert_ne!(thread.top_native_frame(), saved_native);

        let value = longjmp_unwind(thread, buf, 0, None);
        assert_eq!(value, 1);
        assert_eq!(thread.top_frame(), saved_frame);
        assert_eq!(thread.top_native_frame(), saved_native);
        assert_eq!(thread.allocation_roots_len(), saved_roots);
        assert_eq!((*guard.frame()).get_object(0), a.object());

        // The unwind already popped the native frame.
        std::mem::forget(nguard);

        store_int(thread, a, &[3], None);
        assert_eq!(load_u8(thread, a), 3);
        drop(guard);
    });
}

crate::runtime_origin!(JMP_DEAD_ORIGIN, "longjmp_after_return", 0);

#[test]
fn longjmp_to_a_returned_frame_is_fatal() {
    with_mutator(|thread| unsafe {
        let buf = {
            let mut storage = FrameWithSlots::<0>::new(&JMP_DEAD_ORIGIN);
            let _guard = FrameGuard::push(thread, storage.as_frame());
            setjmp_create(thread, SetjmpKind::BareSetjmp, false)
        };
        let message = expect_safety_panic(|| {
            longjmp_unwind(thread, buf, 1, None);
        });
        assert!(message.contains("already returned"), "got: {}", message);
    });
}

crate::runtime_origin!(JMP_ROOT_ORIGIN, "jmpbuf_roots", 2);

#[test]
fn jmpbuf_captures_are_collector_roots() {
    with_mutator(|thread| unsafe {
        let mut storage = FrameWithSlots::<2>::new(&JMP_ROOT_ORIGIN);
        let guard = FrameGuard::push(thread, storage.as_frame());

        let a = allocate(thread, 16);
        store_int(thread, a, &[42], None);
        (*guard.frame()).set_object(0, a.object());
        let buf = setjmp_create(thread, SetjmpKind::BareSetjmp, false);
        (*guard.frame()).set_object(1, buf.object());

        // Drop the only frame reference to `a`; the jmp_buf's captured
        // snapshot must keep it alive.
        (*guard.frame()).set_object(0, std::ptr::null_mut());
        crate::collector::wait(crate::collector::request_fresh());

        let value = longjmp_unwind(thread, buf, 5, None);
        assert_eq!(value, 5);
        assert_eq!((*guard.frame()).get_object(0), a.object());
        assert_eq!(load_u8(thread, a), 42);
        drop(guard);
    });
}

#[test]
fn pointer_tables_round_trip() {
    with_mutator(|thread| {
        let table = crate::special::ptr_table_new(thread);
        let target = allocate(thread, 32);
        let encoded = crate::special::ptr_table_encode(thread, table, target, None);
        assert_ne!(encoded, target.addr());
        let decoded = crate::special::ptr_table_decode(thread, table, encoded, None);
        assert_eq!(decoded, target);
        let miss = crate::special::ptr_table_decode(thread, table, 12345, None);
        assert!(miss.is_boxed_int());

        let exact = crate::special::exact_ptr_table_new(thread);
        let encoded = crate::special::exact_ptr_table_encode(thread, exact, target, None);
        assert_eq!(encoded, target.addr());
        let decoded = crate::special::exact_ptr_table_decode(thread, exact, encoded, None);
        assert_eq!(decoded, target);
    });
}

#[test]
fn function_capability_gates_calls() {
    fn the_function(_sig: i32) {}
    with_mutator(|thread| {
        let function = crate::special::allocate_function(thread, the_function);
        crate::check::check_function_call(function, None);
        let data = allocate(thread, 16);
        let message = expect_safety_panic(|| {
            crate::check::check_function_call(data, None);
        });
        assert!(message.contains("Function"), "got: {}", message);
    });
}

static SIGNAL_HITS: AtomicUsize = AtomicUsize::new(0);

fn signal_hit(_sig: i32) {
    SIGNAL_HITS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn entered_signals_defer_to_the_next_pollcheck() {
    with_mutator(|thread| {
        SIGNAL_HITS.store(0, Ordering::SeqCst);
        let function = crate::special::allocate_function(thread, signal_hit);
        let handler = crate::special::allocate_signal_handler(thread, function, 0);
        crate::signal::install_handler(thread, 10, handler);

        crate::signal::deliver_signal(10);
        assert_eq!(SIGNAL_HITS.load(Ordering::SeqCst), 0);

        thread.pollcheck();
        assert_eq!(SIGNAL_HITS.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn global_roots_survive_without_frames() {
    with_mutator(|thread| {
        let object = allocate(thread, 32);
        store_int(thread, object, &[99], None);
        crate::global::add_global_root(thread, object.object());
        crate::collector::wait(crate::collector::request_fresh());
        assert_eq!(load_u8(thread, object), 99);
    });
}

#[test]
fn stop_the_world_freezes_pollchecking_threads() {
    with_mutator(|thread| {
        static TICKS: AtomicUsize = AtomicUsize::new(0);
        static STOP: AtomicBool = AtomicBool::new(false);
        TICKS.store(0, Ordering::SeqCst);
        STOP.store(false, Ordering::SeqCst);

        let join = spawn_mutator(|mutator| {
            while !STOP.load(Ordering::SeqCst) {
                mutator.pollcheck();
                TICKS.fetch_add(1, Ordering::SeqCst);
            }
        });
        while TICKS.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }

        {
            let _exited = thread.exited();
            crate::handshake::stop_the_world();
            let frozen = TICKS.load(Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert_eq!(TICKS.load(Ordering::SeqCst), frozen);
            crate::handshake::resume_the_world();
        }

        let resumed_at = TICKS.load(Ordering::SeqCst);
        while TICKS.load(Ordering::SeqCst) == resumed_at {
            std::thread::yield_now();
        }
        STOP.store(true, Ordering::SeqCst);
        join.join(thread);
    });
}

#[test]
fn size_classes_cover_the_small_range() {
    assert_eq!(crate::heap::class_for(1), Some(0));
    assert_eq!(crate::heap::class_for(16), Some(0));
    assert_eq!(crate::heap::class_for(17), Some(1));
    assert_eq!(crate::heap::class_for(128), Some(7));
    assert_eq!(crate::heap::class_for(129), Some(8));
    assert_eq!(crate::heap::class_for(3584), Some(26));
    assert_eq!(crate::heap::class_for(3585), None);
    for window in crate::heap::SIZE_CLASSES.windows(2) {
        assert!(window[0] < window[1]);
    }
}

#[test]
fn granule_bitmap_set_test_and_visit() {
    let base = 0x4000_0000 as *mut u8;
    let bitmap = crate::bitmap::GranuleBitmap::create("test", base, 1024 * 1024);
    unsafe {
        let a = base.add(16);
        let b = base.add(4096);
        let c = base.add(1024 * 1024 - 16);
        assert!(!bitmap.test(a));
        assert!(!bitmap.atomic_test_and_set(a));
        assert!(bitmap.atomic_test_and_set(a));
        bitmap.set(b);
        bitmap.set(c);

        let mut seen = Vec::new();
        bitmap.visit_set_range(base, base.add(1024 * 1024), |addr| seen.push(addr as usize));
        assert_eq!(
            seen,
            vec![a as usize, b as usize, c as usize]
        );

        bitmap.clear(b);
        assert!(!bitmap.test(b));
        assert!(bitmap.test(c));
    }
}

#[test]
fn boxed_int_pointers_never_dereference() {
    with_mutator(|thread| {
        let p = Ptr::from_int(0xdeadbeef);
        assert!(p.is_boxed_int());
        let message = expect_safety_panic(|| {
            let mut byte = [0u8; 1];
            load_int(thread, p, &mut byte, None);
        });
        assert!(message.contains("boxed int"), "got: {}", message);
    });
}
