//! Global variable roots and batched global initialization.
//!
//! Heap objects backing program globals are permanent collector roots once
//! installed. First-touch initialization of a global (and its constant
//! relocations) runs inside a ref-counted init context under the global
//! init lock, so a batch of mutually referential globals becomes visible to
//! the collector atomically: either none of the batch is rooted, or all of
//! it is.

use parking_lot::Mutex;

use crate::object::Object;
use crate::thread::Mutator;

pub struct GlobalState {
    roots: Mutex<Vec<*mut Object>>,
    init: Mutex<InitState>,
}

struct InitState {
    depth: u32,
    batch: Vec<*mut Object>,
}

unsafe impl Send for GlobalState {}
unsafe impl Sync for GlobalState {}

impl GlobalState {
    pub fn new() -> GlobalState {
        GlobalState {
            roots: Mutex::new(Vec::new()),
            init: Mutex::new(InitState {
                depth: 0,
                batch: Vec::new(),
            }),
        }
    }
}

/// Immediately install a permanent root.
pub fn add_global_root(thread: &Mutator, object: *mut Object) {
    crate::collector::store_barrier(thread, object);
    crate::runtime().globals.roots.lock().push(object);
}

pub(crate) fn for_each_global_root(mut f: impl FnMut(*mut Object)) {
    let roots = crate::runtime().globals.roots.lock();
    for &object in roots.iter() {
        f(object);
    }
}

/// Enter an init context. Re-entrant: a global constructor touching another
/// uninitialized global joins the open batch.
pub fn global_init_enter() {
    let mut init = crate::runtime().globals.init.lock();
    init.depth += 1;
}

/// Add an object to the open batch. It stays unrooted (pinned only by its
/// creator's frames) until the outermost leave publishes the batch.
pub fn global_init_track(object: *mut Object) {
    let mut init = crate::runtime().globals.init.lock();
    internal_check!(init.depth > 0, "global_init_track outside init context");
    init.batch.push(object);
}

/// Leave an init context; the outermost leave publishes the whole batch as
/// roots.
pub fn global_init_leave(thread: &Mutator) {
    let batch = {
        let mut init = crate::runtime().globals.init.lock();
        internal_check!(init.depth > 0, "global_init_leave without enter");
        init.depth -= 1;
        if init.depth > 0 {
            return;
        }
        std::mem::replace(&mut init.batch, Vec::new())
    };
    let mut roots = crate::runtime().globals.roots.lock();
    for object in batch {
        crate::collector::store_barrier(thread, object);
        roots.push(object);
    }
}

/// RAII form of the init context.
pub struct GlobalInitScope<'a> {
    thread: &'a Mutator,
}

impl<'a> GlobalInitScope<'a> {
    pub fn new(thread: &'a Mutator) -> GlobalInitScope<'a> {
        global_init_enter();
        GlobalInitScope { thread }
    }

    pub fn track(&self, object: *mut Object) {
        global_init_track(object);
    }
}

impl<'a> Drop for GlobalInitScope<'a> {
    fn drop(&mut self) {
        global_init_leave(self.thread);
    }
}
