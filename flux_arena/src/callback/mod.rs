//! Fixed-size, type-erased callables stored inline
//!
//! An [InlineCallable] owns a closure inside its own buffer, never on the
//! heap. The closure is type-erased to some `dyn FnMut(..)` shape `F`.
//!
//! Moving an `InlineCallable` is a plain byte copy of the buffer. So that
//! this stays sound, nothing ever stores the address of the buffer. Instead
//! binding records a monomorphised "erase" function that rebuilds the
//! `*mut F` (data pointer plus vtable) from wherever the buffer currently is.
//!
//! Closure size and alignment are checked at compile time. A closure that
//! doesn't fit is a build error, not a runtime one.

use std::{
    fmt::Debug,
    marker::PhantomData,
    mem::{align_of, size_of, MaybeUninit},
    ptr,
};

use crate::util::UsizePtr;

/// Buffer size of [SmallCallable]
pub const SMALL_CALLABLE_CAPACITY: usize = 24;
/// Buffer size of [LargeCallable]
pub const LARGE_CALLABLE_CAPACITY: usize = 64;
/// Alignment of the inline buffer; closures may not be more aligned than this
pub const CALLABLE_ALIGN: usize = 16;

const GUARD_VALUE: u64 = 0xF1A5_C0DE_CA11_AB1E;

#[repr(C, align(16))]
struct InlineStorage<const CAP: usize>([MaybeUninit<u8>; CAP]);

/// Unsizing from a concrete closure type `C` to the erased shape `Self`
///
/// Implemented for the `dyn FnMut` shapes that [InlineCallable] can hold.
///
/// # Safety
///
/// `erase` must return a pointer to the same object it was given.
pub unsafe trait Erase<C> {
    fn erase(ptr: *mut C) -> *mut Self;
}

/// Compile-time check that a closure fits the buffer
struct Fits<C, const CAP: usize>(PhantomData<C>);

impl<C, const CAP: usize> Fits<C, CAP> {
    const OK: () = assert!(
        size_of::<C>() <= CAP && align_of::<C>() <= CALLABLE_ALIGN,
        "closure does not fit in this InlineCallable, capture less or use a larger capacity"
    );
}

unsafe fn erase_at<C, F: ?Sized + Erase<C>>(base: *mut u8) -> *mut F {
    F::erase(base.cast::<C>())
}

unsafe fn clone_into<C: Clone>(src: *const u8, dst: *mut u8) {
    dst.cast::<C>().write((*src.cast::<C>()).clone());
}

#[cold]
#[inline(never)]
fn corruption_detected(guard: u64, addr: UsizePtr) -> ! {
    tracing::error!(guard, ?addr, "inline callable guard overwritten, aborting");
    std::process::abort()
}

/// A closure of erased shape `F`, stored in a `CAP`-byte inline buffer
///
/// `F` is a `dyn FnMut(..) -> R` type, optionally `+ Send`.
pub struct InlineCallable<F: ?Sized, const CAP: usize = SMALL_CALLABLE_CAPACITY> {
    guard: u64,
    /// Rebuilds the `dyn` pointer from the buffer base; `None` when unbound
    erase: Option<unsafe fn(*mut u8) -> *mut F>,
    /// Clones the bound closure into another buffer, if it was bound cloneable
    clone: Option<unsafe fn(*const u8, *mut u8)>,
    storage: InlineStorage<CAP>,
    _p: PhantomData<Box<F>>,
}

/// Callable with room for a few captured pointers
pub type SmallCallable<F> = InlineCallable<F, SMALL_CALLABLE_CAPACITY>;
/// Callable with room for larger captures
pub type LargeCallable<F> = InlineCallable<F, LARGE_CALLABLE_CAPACITY>;

impl<F: ?Sized, const CAP: usize> InlineCallable<F, CAP> {
    /// An unbound callable
    pub const fn new() -> Self {
        Self {
            guard: GUARD_VALUE,
            erase: None,
            clone: None,
            storage: InlineStorage([MaybeUninit::uninit(); CAP]),
            _p: PhantomData,
        }
    }

    /// A callable bound to `closure`
    pub fn from_fn<C>(closure: C) -> Self
    where
        F: Erase<C>,
    {
        let mut callable = Self::new();
        callable.bind(closure);
        callable
    }

    /// Store `closure`, dropping whatever was bound before
    pub fn bind<C>(&mut self, closure: C)
    where
        F: Erase<C>,
    {
        let () = Fits::<C, CAP>::OK;

        self.unbind();
        unsafe {
            // safety: size and alignment checked above
            self.base_mut().cast::<C>().write(closure);
        }
        self.erase = Some(erase_at::<C, F>);
    }

    /// Like [bind](Self::bind), additionally allowing [try_clone](Self::try_clone)
    pub fn bind_cloneable<C: Clone>(&mut self, closure: C)
    where
        F: Erase<C>,
    {
        self.bind(closure);
        self.clone = Some(clone_into::<C>);
    }

    /// Drop the bound closure, if any
    pub fn unbind(&mut self) {
        self.check_guard();
        if let Some(erase) = self.erase.take() {
            self.clone = None;
            unsafe {
                ptr::drop_in_place(erase(self.base_mut()));
            }
        }
    }

    pub fn is_bound(&self) -> bool {
        self.erase.is_some()
    }

    /// The bound closure as `&mut F`
    pub fn get_mut(&mut self) -> Option<&mut F> {
        self.check_guard();
        let erase = self.erase?;
        // safety: erase was recorded together with the closure now in the buffer
        Some(unsafe { &mut *erase(self.base_mut()) })
    }

    /// Copy the callable, if its closure was bound with [bind_cloneable](Self::bind_cloneable)
    ///
    /// Unbound callables clone to unbound callables.
    pub fn try_clone(&self) -> Option<Self> {
        self.check_guard();
        let mut copy = Self::new();
        if let Some(erase) = self.erase {
            let clone = self.clone?;
            unsafe {
                clone(self.base(), copy.base_mut());
            }
            copy.erase = Some(erase);
            copy.clone = Some(clone);
        }
        Some(copy)
    }

    fn base(&self) -> *const u8 {
        self.storage.0.as_ptr().cast()
    }

    fn base_mut(&mut self) -> *mut u8 {
        self.storage.0.as_mut_ptr().cast()
    }

    fn check_guard(&self) {
        if self.guard != GUARD_VALUE {
            corruption_detected(self.guard, UsizePtr::from(self));
        }
    }
}

impl<F: ?Sized, const CAP: usize> Default for InlineCallable<F, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized, const CAP: usize> Drop for InlineCallable<F, CAP> {
    fn drop(&mut self) {
        self.unbind();
    }
}

impl<F: ?Sized, const CAP: usize> Debug for InlineCallable<F, CAP> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineCallable")
            .field("@addr", &(self as *const Self))
            .field("capacity", &CAP)
            .field("bound", &self.is_bound())
            .field("cloneable", &self.clone.is_some())
            .finish()
    }
}

/// Implements [Erase] and `call` for one closure shape
macro_rules! callable_shape {
    (<$($gen:ident),*> ($($arg:ident: $argty:ty),*) $($shape:tt)+) => {
        unsafe impl<C, $($gen: ?Sized,)* R> Erase<C> for dyn $($shape)+
        where
            C: $($shape)+ + 'static,
        {
            fn erase(ptr: *mut C) -> *mut Self {
                ptr
            }
        }

        impl<$($gen: ?Sized,)* R, const CAP: usize> InlineCallable<dyn $($shape)+, CAP> {
            /// Invoke the bound closure, or do nothing and return `None` if unbound
            pub fn call(&mut self, $($arg: $argty),*) -> Option<R> {
                match self.get_mut() {
                    Some(f) => Some(f($($arg),*)),
                    None => None,
                }
            }
        }
    };
}

callable_shape!(<> () FnMut() -> R);
callable_shape!(<> () FnMut() -> R + Send);
callable_shape!(<A> (arg: &A) for<'a> FnMut(&'a A) -> R);
callable_shape!(<A> (arg: &A) for<'a> FnMut(&'a A) -> R + Send);
callable_shape!(<A, B> (a: &mut A, b: &B) for<'a, 'b> FnMut(&'a mut A, &'b B) -> R);
callable_shape!(<A, B> (a: &mut A, b: &B) for<'a, 'b> FnMut(&'a mut A, &'b B) -> R + Send);

/// Callables registered by several owners, invoked together
///
/// Owners are identified by an opaque `usize` key (typically an address or
/// an id) so that everything one owner registered can be removed at once.
pub struct CallbackList<F: ?Sized, const CAP: usize = SMALL_CALLABLE_CAPACITY> {
    callbacks: Vec<(usize, InlineCallable<F, CAP>)>,
}

impl<F: ?Sized, const CAP: usize> CallbackList<F, CAP> {
    pub const fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    pub fn register<C>(&mut self, owner: usize, closure: C)
    where
        F: Erase<C>,
    {
        self.callbacks.push((owner, InlineCallable::from_fn(closure)));
    }

    /// Remove every callback registered by `owner`, returning how many there were
    pub fn unregister(&mut self, owner: usize) -> usize {
        let before = self.callbacks.len();
        self.callbacks.retain(|(o, _)| *o != owner);
        before - self.callbacks.len()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut InlineCallable<F, CAP>> + '_ {
        self.callbacks.iter_mut().map(|(_, cb)| cb)
    }
}

impl<F: ?Sized, const CAP: usize> Default for CallbackList<F, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized, const CAP: usize> Debug for CallbackList<F, CAP> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.callbacks.iter().map(|(owner, _)| UsizePtr::from(*owner as *const ())))
            .finish()
    }
}

macro_rules! callback_list_shape {
    (<$($gen:ident),*> ($($arg:ident: $argty:ty),*) $($shape:tt)+) => {
        impl<$($gen: ?Sized,)* R, const CAP: usize> CallbackList<dyn $($shape)+, CAP> {
            /// Invoke every callback in registration order, returning how many ran
            pub fn call(&mut self, $($arg: $argty),*) -> usize {
                self.iter_mut()
                    .filter_map(|cb| cb.call($($arg),*))
                    .count()
            }
        }
    };
}

callback_list_shape!(<> () FnMut() -> R);
callback_list_shape!(<> () FnMut() -> R + Send);
callback_list_shape!(<A> (arg: &A) for<'a> FnMut(&'a A) -> R);
callback_list_shape!(<A> (arg: &A) for<'a> FnMut(&'a A) -> R + Send);
