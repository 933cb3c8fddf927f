//! The tagged pointer: a 16-byte (object, raw) pair.
//!
//! `object` names the capability, the header of the enclosing allocation,
//! and `raw` is the actual address. A null `object` makes the value a boxed
//! integer: it can be held, compared and offset, but never dereferenced.
//! Arithmetic only ever changes `raw`.

use atomic::{Atomic, Ordering};

use crate::object::{flags_dump, Object};

#[repr(C, align(16))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ptr {
    object: *mut Object,
    raw: *mut u8,
}

impl Ptr {
    #[inline(always)]
    pub fn null() -> Ptr {
        Ptr {
            object: std::ptr::null_mut(),
            raw: std::ptr::null_mut(),
        }
    }

    /// A boxed integer: carries an address without a capability.
    #[inline(always)]
    pub fn from_int(value: usize) -> Ptr {
        Ptr {
            object: std::ptr::null_mut(),
            raw: value as *mut u8,
        }
    }

    /// A pointer to the start of `object`'s payload.
    #[inline(always)]
    pub fn new(object: *mut Object) -> Ptr {
        debug_assert!(!object.is_null());
        Ptr {
            object,
            raw: unsafe { (*object).lower() },
        }
    }

    /// A pointer to the real payload of a special object, which is what
    /// `check_special` expects `raw` to be.
    #[inline(always)]
    pub fn for_special(object: *mut Object) -> Ptr {
        debug_assert!(unsafe { (*object).is_special() });
        Ptr {
            object,
            raw: unsafe { (*object).special_payload() },
        }
    }

    #[inline(always)]
    pub fn with_parts(object: *mut Object, raw: *mut u8) -> Ptr {
        Ptr { object, raw }
    }

    /// Same capability, different address.
    #[inline(always)]
    pub fn with_raw(self, raw: *mut u8) -> Ptr {
        Ptr {
            object: self.object,
            raw,
        }
    }

    /// Pointer arithmetic. Going out of bounds is legal; the result fails at
    /// access, not at creation.
    #[inline(always)]
    pub fn with_offset(self, delta: isize) -> Ptr {
        Ptr {
            object: self.object,
            raw: (self.raw as isize).wrapping_add(delta) as *mut u8,
        }
    }

    #[inline(always)]
    pub fn object(self) -> *mut Object {
        self.object
    }
    #[inline(always)]
    pub fn raw(self) -> *mut u8 {
        self.raw
    }
    #[inline(always)]
    pub fn addr(self) -> usize {
        self.raw as usize
    }
    #[inline(always)]
    pub fn is_boxed_int(self) -> bool {
        self.object.is_null()
    }

    /// Offset of `raw` from the payload start; meaningless for boxed ints.
    #[inline(always)]
    pub fn offset(self) -> isize {
        unsafe { (self.raw as isize) - ((*self.object).lower() as isize) }
    }
}

impl std::fmt::Display for Ptr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.object.is_null() {
            return write!(f, "{:p} (boxed int)", self.raw);
        }
        unsafe {
            let object = &*self.object;
            write!(
                f,
                "{:p} ({:p}..{:p}, {})",
                self.raw,
                object.lower(),
                object.upper(),
                flags_dump(object.flags())
            )
        }
    }
}

impl std::fmt::Debug for Ptr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// A 16-byte atomic cell of `Ptr`. Relaxed for ordinary loads and stores,
/// sequentially consistent for CAS and exchange.
#[repr(transparent)]
pub struct AtomicPtrPair {
    inner: Atomic<Ptr>,
}

impl AtomicPtrPair {
    pub fn new(value: Ptr) -> AtomicPtrPair {
        AtomicPtrPair {
            inner: Atomic::new(value),
        }
    }

    #[inline]
    pub fn load_relaxed(&self) -> Ptr {
        self.inner.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store_relaxed(&self, value: Ptr) {
        self.inner.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn compare_exchange(&self, current: Ptr, new: Ptr) -> Result<Ptr, Ptr> {
        self.inner
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    #[inline]
    pub fn compare_exchange_weak(&self, current: Ptr, new: Ptr) -> Result<Ptr, Ptr> {
        self.inner
            .compare_exchange_weak(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    #[inline]
    pub fn swap(&self, value: Ptr) -> Ptr {
        self.inner.swap(value, Ordering::SeqCst)
    }
}

unsafe impl Send for Ptr {}
unsafe impl Sync for Ptr {}
