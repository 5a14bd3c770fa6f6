//! Raw memory provider that arenas are carved out of
//!
//! Arenas themselves never call the global allocator directly. Chain links
//! and the dispatcher's two arenas are requested through a [Backing] so that
//! embedders can route them to their own pools.

use std::{
    alloc::{self, Layout},
    fmt::Debug,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
};

use crate::error::ArenaError;

/// Source of zeroed raw memory
///
/// # Safety
///
/// `allocate_zeroed` must return either `None` or a pointer to at least
/// `layout.size()` zeroed bytes aligned to `layout.align()`, which stays valid
/// until passed back to `deallocate` on a clone of the same provider.
pub unsafe trait Backing: Clone + Send + Sync {
    /// Allocate zeroed memory for `layout` (never called with a zero size)
    fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return memory obtained from [allocate_zeroed](Self::allocate_zeroed)
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this provider with the same `layout`,
    /// and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// [Backing] that forwards to the global allocator
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBacking;

// safety: std::alloc upholds the contract
unsafe impl Backing for SystemBacking {
    fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() != 0);
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::dealloc(ptr.as_ptr(), layout)
    }
}

/// Owning pointer to a `T` living in memory from a [Backing]
///
/// This is a `Box` that remembers which provider it came from.
pub(crate) struct Owned<T, A: Backing> {
    ptr: NonNull<T>,
    backing: A,
    _p: PhantomData<T>,
}
// safety: we uniquely own the T, same as Box
unsafe impl<T: Send, A: Backing> Send for Owned<T, A> {}
unsafe impl<T: Sync, A: Backing> Sync for Owned<T, A> {}

impl<T, A: Backing> Owned<T, A> {
    /// Move `value` into freshly allocated backing memory
    pub fn new_in(value: T, backing: A) -> Result<Self, ArenaError> {
        let layout = Layout::new::<T>();
        let raw = backing
            .allocate_zeroed(layout)
            .ok_or(ArenaError::BackingExhausted {
                size: layout.size(),
            })?;
        let ptr = raw.cast::<T>();
        unsafe {
            // safety: fresh allocation sized and aligned for T
            ptr.as_ptr().write(value);
        }
        Ok(Self {
            ptr,
            backing,
            _p: PhantomData,
        })
    }

    /// Allocate zeroed backing memory and let `init` build the `T` in place
    ///
    /// Nothing the size of `T` ever passes through the stack.
    ///
    /// # Safety
    ///
    /// `init` receives a pointer to all-zero bytes and must leave a fully
    /// initialized `T` behind.
    pub unsafe fn new_zeroed_in(
        backing: A,
        init: impl FnOnce(*mut T),
    ) -> Result<Self, ArenaError> {
        let layout = Layout::new::<T>();
        let raw = backing
            .allocate_zeroed(layout)
            .ok_or(ArenaError::BackingExhausted {
                size: layout.size(),
            })?;
        let ptr = raw.cast::<T>();
        init(ptr.as_ptr());
        Ok(Self {
            ptr,
            backing,
            _p: PhantomData,
        })
    }
}

impl<T, A: Backing> Deref for Owned<T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, A: Backing> DerefMut for Owned<T, A> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T, A: Backing> Drop for Owned<T, A> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            self.backing
                .deallocate(self.ptr.cast::<u8>(), Layout::new::<T>());
        }
    }
}

impl<T: Debug, A: Backing> Debug for Owned<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&**self, f)
    }
}
