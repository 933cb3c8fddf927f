//! The backing heap consumed by the collector and the allocator.
//!
//! One big reservation, carved into 128 KiB pages. Each page is dedicated to
//! one size class in one space (object headers or raw shadow/box memory),
//! or to a run of pages for a large allocation. Two side bitmaps cover the
//! reservation at 16-byte granularity: the allocation bitmap records every
//! live header (giving live-object iteration that is safe against
//! concurrent allocation), and the mark bitmap carries the collector's mark
//! bits. Per-thread inline allocators hold small private free lists per
//! size class and return them to the global lists when stopped.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::bitmap::GranuleBitmap;
use crate::mmap::Mmap;
use crate::object::{Object, WORD_SIZE};
use crate::util::align_up;

pub const PAGE_SIZE: usize = 128 * 1024;

pub const NUM_SIZE_CLASSES: usize = 27;

/// Cell sizes: word-stepped to 128, then progressively coarser. Requests
/// above the last class take whole pages.
pub const SIZE_CLASSES: [usize; NUM_SIZE_CLASSES] = [
    16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640, 768, 896,
    1024, 1280, 1536, 1792, 2048, 2560, 3072, 3584,
];

pub const LARGE_CUTOFF: usize = SIZE_CLASSES[NUM_SIZE_CLASSES - 1];

/// Granule count covered by the class lookup table.
const LUT_GRANULES: usize = LARGE_CUTOFF / WORD_SIZE;

const CLASS_LUT: [u8; LUT_GRANULES + 1] = build_class_lut();

const fn build_class_lut() -> [u8; LUT_GRANULES + 1] {
    let mut lut = [0u8; LUT_GRANULES + 1];
    let mut granules = 0;
    while granules <= LUT_GRANULES {
        let size = granules * WORD_SIZE;
        let mut class = 0;
        while SIZE_CLASSES[class] < size {
            class += 1;
        }
        lut[granules] = class as u8;
        granules += 1;
    }
    lut
}

/// Size class for `size`, or None for the large path.
#[inline(always)]
pub fn class_for(size: usize) -> Option<usize> {
    if size > LARGE_CUTOFF {
        return None;
    }
    Some(CLASS_LUT[(size + WORD_SIZE - 1) / WORD_SIZE] as usize)
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Free,
    ObjectClass(u8),
    RawClass(u8),
    LargeObject(u32),
    LargeRaw(u32),
    LargeCont,
}

/// Intrusive free list: free cells link through their first word.
struct FreeList {
    head: *mut u8,
    count: usize,
}

impl FreeList {
    const fn new() -> FreeList {
        FreeList {
            head: std::ptr::null_mut(),
            count: 0,
        }
    }

    #[inline]
    unsafe fn push(&mut self, cell: *mut u8) {
        (cell as *mut *mut u8).write(self.head);
        self.head = cell;
        self.count += 1;
    }

    #[inline]
    unsafe fn pop(&mut self) -> *mut u8 {
        let cell = self.head;
        if !cell.is_null() {
            self.head = (cell as *const *mut u8).read();
            self.count -= 1;
        }
        cell
    }
}

struct HeapCore {
    meta: Vec<PageKind>,
    object_free: [FreeList; NUM_SIZE_CLASSES],
    raw_free: [FreeList; NUM_SIZE_CLASSES],
    /// Pages above this index are virgin.
    next_page: usize,
    free_pages: Vec<usize>,
}

unsafe impl Send for HeapCore {}

pub struct GlobalHeap {
    map: Mmap,
    base: usize,
    n_pages: usize,
    pub live_bitmap: GranuleBitmap,
    pub mark_bitmap: GranuleBitmap,
    core: Mutex<HeapCore>,
    live_bytes: AtomicUsize,
    trigger_threshold: AtomicUsize,
    trigger_callback: AtomicUsize,
}

impl GlobalHeap {
    pub fn new(reservation: usize) -> GlobalHeap {
        let reservation = align_up(reservation, PAGE_SIZE);
        let map = Mmap::new(reservation + PAGE_SIZE);
        let base = align_up(map.start() as usize, PAGE_SIZE);
        let n_pages = reservation / PAGE_SIZE;
        const EMPTY: FreeList = FreeList::new();
        GlobalHeap {
            live_bitmap: GranuleBitmap::create("heap-live", base as *mut u8, reservation),
            mark_bitmap: GranuleBitmap::create("heap-mark", base as *mut u8, reservation),
            map,
            base,
            n_pages,
            core: Mutex::new(HeapCore {
                meta: vec![PageKind::Free; n_pages],
                object_free: [EMPTY; NUM_SIZE_CLASSES],
                raw_free: [EMPTY; NUM_SIZE_CLASSES],
                next_page: 0,
                free_pages: Vec::new(),
            }),
            live_bytes: AtomicUsize::new(0),
            trigger_threshold: AtomicUsize::new(usize::MAX),
            trigger_callback: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn contains(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        addr >= self.base && addr < self.base + self.n_pages * PAGE_SIZE
    }

    #[inline]
    fn page_base(&self, index: usize) -> *mut u8 {
        (self.base + index * PAGE_SIZE) as *mut u8
    }

    /// The collector's mark bit, keyed by object header (or raw cell)
    /// address. Returns true when this call set the bit.
    #[inline]
    pub fn set_is_marked_relaxed(&self, header: *const u8) -> bool {
        !self.mark_bitmap.atomic_test_and_set(header)
    }

    #[inline]
    pub fn is_marked(&self, header: *const u8) -> bool {
        self.mark_bitmap.test(header)
    }

    pub fn clear_mark_bits(&self) {
        self.mark_bitmap.clear_all();
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Register the callback fired when live bytes cross the threshold;
    /// the collector uses this to schedule itself.
    pub fn set_live_bytes_trigger(&self, threshold: usize, callback: fn()) {
        self.trigger_callback
            .store(callback as usize, Ordering::Release);
        self.trigger_threshold.store(threshold, Ordering::Release);
    }

    pub fn set_trigger_threshold(&self, threshold: usize) {
        self.trigger_threshold.store(threshold, Ordering::Release);
    }

    /// Account a fresh allocation: live bit, live bytes, trigger. The
    /// trigger disarms itself until the collector re-arms it.
    pub fn note_allocated(&self, header: *mut u8, bytes: usize) {
        self.live_bitmap.set(header);
        let now = self.live_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if now > self.trigger_threshold.load(Ordering::Relaxed) {
            let callback = self.trigger_callback.load(Ordering::Acquire);
            if callback != 0 {
                self.trigger_threshold.store(usize::MAX, Ordering::Relaxed);
                let callback: fn() = unsafe { std::mem::transmute(callback) };
                callback();
            }
        }
    }

    fn take_free_page(&self, core: &mut HeapCore) -> Option<usize> {
        if let Some(index) = core.free_pages.pop() {
            return Some(index);
        }
        if core.next_page < self.n_pages {
            let index = core.next_page;
            core.next_page += 1;
            self.map.commit(self.page_base(index), PAGE_SIZE);
            return Some(index);
        }
        None
    }

    /// Carve a page into cells of `class` and splice them onto the global
    /// free list.
    fn carve_page(&self, core: &mut HeapCore, class: usize, raw: bool) -> bool {
        let index = match self.take_free_page(core) {
            Some(index) => index,
            None => return false,
        };
        core.meta[index] = if raw {
            PageKind::RawClass(class as u8)
        } else {
            PageKind::ObjectClass(class as u8)
        };
        let cell_size = SIZE_CLASSES[class];
        let base = self.page_base(index);
        let list = if raw {
            &mut core.raw_free[class]
        } else {
            &mut core.object_free[class]
        };
        let mut offset = 0;
        while offset + cell_size <= PAGE_SIZE {
            unsafe {
                list.push(base.add(offset));
            }
            offset += cell_size;
        }
        true
    }

    /// Pop one cell of `class` from the global lists.
    pub fn allocate_cell(&self, class: usize, raw: bool) -> *mut u8 {
        let mut core = self.core.lock();
        loop {
            let list = if raw {
                &mut core.raw_free[class]
            } else {
                &mut core.object_free[class]
            };
            let cell = unsafe { list.pop() };
            if !cell.is_null() {
                return cell;
            }
            if !self.carve_page(&mut core, class, raw) {
                return std::ptr::null_mut();
            }
        }
    }

    /// Move up to `batch` cells of `class` into a local free list.
    pub fn refill_local(&self, class: usize, local: &mut LocalList, batch: usize) -> bool {
        let mut core = self.core.lock();
        loop {
            let list = &mut core.object_free[class];
            while local.count < batch as u32 {
                let cell = unsafe { list.pop() };
                if cell.is_null() {
                    break;
                }
                unsafe {
                    local.push(cell);
                }
            }
            if local.count > 0 {
                return true;
            }
            if !self.carve_page(&mut core, class, false) {
                return false;
            }
        }
    }

    pub(crate) fn return_local(&self, class: usize, local: &mut LocalList) {
        if local.count == 0 {
            return;
        }
        let mut core = self.core.lock();
        let list = &mut core.object_free[class];
        unsafe {
            loop {
                let cell = local.pop();
                if cell.is_null() {
                    break;
                }
                list.push(cell);
            }
        }
    }

    /// Allocate a run of pages for a large allocation. Returns the base of
    /// the run.
    pub fn allocate_large(&self, bytes: usize, raw: bool) -> *mut u8 {
        let pages = align_up(bytes, PAGE_SIZE) / PAGE_SIZE;
        let mut core = self.core.lock();
        // First fit over the recycled pages; the common case extends at the
        // virgin tail.
        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..core.next_page {
            if core.meta[index] == PageKind::Free {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == pages {
                    break;
                }
            } else {
                run_len = 0;
            }
        }
        let start = if run_len == pages {
            core.free_pages
                .retain(|&p| p < run_start || p >= run_start + pages);
            run_start
        } else {
            if core.next_page + pages > self.n_pages {
                return std::ptr::null_mut();
            }
            let start = core.next_page;
            core.next_page += pages;
            self.map.commit(self.page_base(start), pages * PAGE_SIZE);
            start
        };
        core.meta[start] = if raw {
            PageKind::LargeRaw(pages as u32)
        } else {
            PageKind::LargeObject(pages as u32)
        };
        for index in start + 1..start + pages {
            core.meta[index] = PageKind::LargeCont;
        }
        self.page_base(start)
    }

    /// Sweep every page: anything live but unmarked is returned to the
    /// allocator. `destruct` runs for each dead object header before its
    /// memory is reused. Returns freed bytes.
    pub fn sweep(&self, mut destruct: impl FnMut(*mut Object)) -> usize {
        let mut freed = 0;
        let n_used = self.core.lock().next_page;
        for index in 0..n_used {
            let kind = {
                let core = self.core.lock();
                core.meta[index]
            };
            let page = self.page_base(index);
            match kind {
                PageKind::Free | PageKind::LargeCont => {}
                PageKind::ObjectClass(class) | PageKind::RawClass(class) => {
                    let raw = matches!(kind, PageKind::RawClass(_));
                    let cell_size = SIZE_CLASSES[class as usize];
                    let mut dead: Vec<*mut u8> = Vec::new();
                    unsafe {
                        self.live_bitmap
                            .visit_set_range(page, page.add(PAGE_SIZE), |header| {
                                if !self.mark_bitmap.test(header) {
                                    dead.push(header);
                                }
                            });
                        if dead.is_empty() {
                            continue;
                        }
                        let mut core = self.core.lock();
                        for header in dead {
                            self.live_bitmap.clear(header);
                            let cell = if raw {
                                header
                            } else {
                                let object = header as *mut Object;
                                destruct(object);
                                (*object).cell_base()
                            };
                            let list = if raw {
                                &mut core.raw_free[class as usize]
                            } else {
                                &mut core.object_free[class as usize]
                            };
                            list.push(cell);
                            freed += cell_size;
                        }
                    }
                }
                PageKind::LargeObject(pages) | PageKind::LargeRaw(pages) => {
                    let raw = matches!(kind, PageKind::LargeRaw(_));
                    unsafe {
                        // The header sits in the run's first granules; find
                        // its live bit.
                        let mut header: *mut u8 = std::ptr::null_mut();
                        self.live_bitmap
                            .visit_set_range(page, page.add(PAGE_SIZE), |found| {
                                if header.is_null() {
                                    header = found;
                                }
                            });
                        if header.is_null() || self.mark_bitmap.test(header) {
                            continue;
                        }
                        if !raw {
                            destruct(header as *mut Object);
                        }
                        self.live_bitmap.clear(header);
                        let mut core = self.core.lock();
                        for page_index in index..index + pages as usize {
                            core.meta[page_index] = PageKind::Free;
                            core.free_pages.push(page_index);
                        }
                        self.map.dontneed(page, pages as usize * PAGE_SIZE);
                        freed += pages as usize * PAGE_SIZE;
                    }
                }
            }
        }
        self.live_bytes.fetch_sub(freed, Ordering::Relaxed);
        freed
    }
}

unsafe impl Send for GlobalHeap {}
unsafe impl Sync for GlobalHeap {}

/// A thread-private run of free cells for one size class.
pub struct LocalList {
    head: *mut u8,
    count: u32,
}

impl LocalList {
    const fn new() -> LocalList {
        LocalList {
            head: std::ptr::null_mut(),
            count: 0,
        }
    }

    #[inline]
    unsafe fn push(&mut self, cell: *mut u8) {
        (cell as *mut *mut u8).write(self.head);
        self.head = cell;
        self.count += 1;
    }

    #[inline]
    unsafe fn pop(&mut self) -> *mut u8 {
        let cell = self.head;
        if !cell.is_null() {
            self.head = (cell as *const *mut u8).read();
            self.count -= 1;
        }
        cell
    }
}

const REFILL_BATCH: usize = 16;

/// The mutator's inline allocators: one local list per size class, stopped
/// (returned to the global heap) at every collection's root scan.
pub struct InlineAllocators {
    classes: [LocalList; NUM_SIZE_CLASSES],
}

impl InlineAllocators {
    pub fn new() -> InlineAllocators {
        const EMPTY: LocalList = LocalList::new();
        InlineAllocators {
            classes: [EMPTY; NUM_SIZE_CLASSES],
        }
    }

    /// Fast path for object cells; falls back to the global heap.
    #[inline]
    pub fn allocate(&mut self, class: usize) -> *mut u8 {
        unsafe {
            let cell = self.classes[class].pop();
            if !cell.is_null() {
                return cell;
            }
        }
        self.allocate_slow(class)
    }

    #[cold]
    fn allocate_slow(&mut self, class: usize) -> *mut u8 {
        let heap = &crate::runtime().heap;
        if !heap.refill_local(class, &mut self.classes[class], REFILL_BATCH) {
            return std::ptr::null_mut();
        }
        unsafe { self.classes[class].pop() }
    }

    /// Return every cached cell to the global heap.
    pub fn stop(&mut self) {
        let heap = &crate::runtime().heap;
        for class in 0..NUM_SIZE_CLASSES {
            heap.return_local(class, &mut self.classes[class]);
        }
    }
}
