//! Side bitmaps over the heap reservation, one bit per 16-byte granule.
//!
//! Two of these back the heap: the allocation bitmap (which cell bases are
//! live allocations) and the mark bitmap (which cells the current collection
//! cycle has marked).

use atomic::{Atomic, Ordering};
use memmap2::MmapMut;
use std::mem::size_of;

use crate::object::WORD_SIZE;

const BITS_PER_INTPTR: usize = size_of::<usize>() * 8;

pub struct GranuleBitmap {
    mem_map: MmapMut,
    bitmap_begin: *mut Atomic<usize>,
    bitmap_size: usize,
    heap_begin: usize,
    heap_limit: usize,
    name: &'static str,
}

impl GranuleBitmap {
    pub fn compute_bitmap_size(capacity: usize) -> usize {
        let bytes_covered_per_word = WORD_SIZE * BITS_PER_INTPTR;
        crate::util::align_up(capacity, bytes_covered_per_word) / bytes_covered_per_word
            * size_of::<usize>()
    }

    pub fn create(name: &'static str, heap_begin: *mut u8, heap_capacity: usize) -> Self {
        let bitmap_size = Self::compute_bitmap_size(heap_capacity);
        let mem_map = MmapMut::map_anon(bitmap_size).expect("failed to map bitmap");
        let bitmap_begin = mem_map.as_ptr() as *mut Atomic<usize>;
        Self {
            name,
            mem_map,
            bitmap_begin,
            bitmap_size,
            heap_begin: heap_begin as usize,
            heap_limit: heap_begin as usize + heap_capacity,
        }
    }

    #[inline]
    pub fn get_name(&self) -> &'static str {
        self.name
    }
    #[inline]
    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }
    #[inline]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }
    #[inline]
    pub fn has_address(&self, obj: *const u8) -> bool {
        (obj as usize) >= self.heap_begin && (obj as usize) < self.heap_limit
    }

    #[inline]
    fn index_to_offset(index: usize) -> usize {
        index * WORD_SIZE * BITS_PER_INTPTR
    }
    #[inline]
    fn offset_to_index(offset: usize) -> usize {
        offset / WORD_SIZE / BITS_PER_INTPTR
    }
    #[inline]
    fn offset_bit_index(offset: usize) -> usize {
        (offset / WORD_SIZE) % BITS_PER_INTPTR
    }
    #[inline]
    fn offset_to_mask(offset: usize) -> usize {
        1 << Self::offset_bit_index(offset)
    }

    /// Atomically set the bit for `obj`. Returns true if it was already set.
    #[inline]
    pub fn atomic_test_and_set(&self, obj: *const u8) -> bool {
        let addr = obj as usize;
        debug_assert!(addr >= self.heap_begin, "{}: {:p}", self.name, obj);
        let offset = addr.wrapping_sub(self.heap_begin);
        let index = Self::offset_to_index(offset);
        let mask = Self::offset_to_mask(offset);
        debug_assert!(index < self.bitmap_size / size_of::<usize>());
        unsafe {
            let atomic_entry = &*self.bitmap_begin.add(index);
            let mut old_word;
            while {
                old_word = atomic_entry.load(Ordering::Relaxed);
                if (old_word & mask) != 0 {
                    return true;
                }
                atomic_entry
                    .compare_exchange_weak(
                        old_word,
                        old_word | mask,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_err()
            } {}
            false
        }
    }

    #[inline]
    pub fn test(&self, obj: *const u8) -> bool {
        let addr = obj as usize;
        debug_assert!(self.has_address(obj), "{}: {:p}", self.name, obj);
        let offset = addr.wrapping_sub(self.heap_begin);
        let index = Self::offset_to_index(offset);
        unsafe {
            ((*self.bitmap_begin.add(index)).load(Ordering::Relaxed) & Self::offset_to_mask(offset))
                != 0
        }
    }

    #[inline]
    fn modify<const SET_BIT: bool>(&self, obj: *const u8) -> bool {
        let addr = obj as usize;
        debug_assert!(self.has_address(obj), "{}: {:p}", self.name, obj);
        let offset = addr.wrapping_sub(self.heap_begin);
        let index = Self::offset_to_index(offset);
        let mask = Self::offset_to_mask(offset);
        let atomic_entry = unsafe { &*self.bitmap_begin.add(index) };
        let old_word = atomic_entry.load(Ordering::Relaxed);
        if SET_BIT {
            if (old_word & mask) == 0 {
                atomic_entry.store(old_word | mask, Ordering::Relaxed);
            }
        } else {
            atomic_entry.store(old_word & !mask, Ordering::Relaxed);
        }
        (old_word & mask) != 0
    }

    #[inline]
    pub fn set(&self, obj: *const u8) -> bool {
        self.modify::<true>(obj)
    }

    #[inline]
    pub fn clear(&self, obj: *const u8) -> bool {
        self.modify::<false>(obj)
    }

    /// Zero every bit covering `[begin, end)`. Both bounds must be granule
    /// and bitmap-word aligned with respect to the heap base; pages satisfy
    /// this by construction.
    pub fn clear_whole_range(&self, begin: *const u8, end: *const u8) {
        let begin_offset = (begin as usize) - self.heap_begin;
        let end_offset = (end as usize) - self.heap_begin;
        debug_assert_eq!(Self::offset_bit_index(begin_offset), 0);
        debug_assert_eq!(Self::offset_bit_index(end_offset), 0);
        for index in Self::offset_to_index(begin_offset)..Self::offset_to_index(end_offset) {
            unsafe {
                (*self.bitmap_begin.add(index)).store(0, Ordering::Relaxed);
            }
        }
    }

    pub fn clear_all(&self) {
        for index in 0..self.bitmap_size / size_of::<usize>() {
            unsafe {
                (*self.bitmap_begin.add(index)).store(0, Ordering::Relaxed);
            }
        }
    }

    /// Visit the address of every set bit in `[visit_begin, visit_end)`.
    ///
    /// Loads a word at a time, so bits may be concurrently set during the
    /// visit without invalidating it.
    pub fn visit_set_range(
        &self,
        visit_begin: *const u8,
        visit_end: *const u8,
        mut visitor: impl FnMut(*mut u8),
    ) {
        let offset_start = visit_begin as usize - self.heap_begin;
        let offset_end = visit_end as usize - self.heap_begin;

        let index_start = Self::offset_to_index(offset_start);
        let index_end = Self::offset_to_index(offset_end);
        let bit_start = Self::offset_bit_index(offset_start);
        let bit_end = Self::offset_bit_index(offset_end);

        unsafe {
            let mut left_edge = (*self.bitmap_begin.add(index_start)).load(Ordering::Relaxed);
            left_edge &= !((1usize << bit_start) - 1);
            let mut right_edge;
            if index_start < index_end {
                if left_edge != 0 {
                    let ptr_base = Self::index_to_offset(index_start) + self.heap_begin;
                    while {
                        let shift = left_edge.trailing_zeros();
                        visitor((ptr_base + shift as usize * WORD_SIZE) as *mut u8);
                        left_edge ^= 1 << shift as usize;
                        left_edge != 0
                    } {}
                }
                for i in index_start + 1..index_end {
                    let mut w = (*self.bitmap_begin.add(i)).load(Ordering::Relaxed);
                    if w != 0 {
                        let ptr_base = Self::index_to_offset(i) + self.heap_begin;
                        while {
                            let shift = w.trailing_zeros();
                            visitor((ptr_base + shift as usize * WORD_SIZE) as *mut u8);
                            w ^= 1 << shift as usize;
                            w != 0
                        } {}
                    }
                }
                if bit_end == 0 {
                    right_edge = 0;
                } else {
                    right_edge = (*self.bitmap_begin.add(index_end)).load(Ordering::Relaxed);
                }
            } else {
                right_edge = left_edge;
            }

            if bit_end != 0 {
                right_edge &= (1usize << bit_end) - 1;
                if right_edge != 0 {
                    let ptr_base = Self::index_to_offset(index_end) + self.heap_begin;
                    while {
                        let shift = right_edge.trailing_zeros();
                        visitor((ptr_base + shift as usize * WORD_SIZE) as *mut u8);
                        right_edge ^= 1 << shift as usize;
                        right_edge != 0
                    } {}
                }
            }
        }
    }
}

unsafe impl Send for GranuleBitmap {}
unsafe impl Sync for GranuleBitmap {}
