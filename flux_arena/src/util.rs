use std::fmt;

/// Round `num` up to a multiple of `align` (which must be a power of two)
pub const fn roundto(num: usize, align: usize) -> usize {
    (num + align - 1) & !(align - 1)
}

/// Bytes needed to move `addr` up to the next multiple of `align`
///
/// `align` must be a power of two. This is the "mask off the low bits" form,
/// so an already-aligned address needs zero padding.
pub const fn align_padding(addr: usize, align: usize) -> usize {
    addr.wrapping_neg() & (align - 1)
}

/// Pointer wrapper that prints as a bare hex address
///
/// Used for `tracing` fields so that events don't carry type names around
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UsizePtr(usize);

impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<&T> for UsizePtr {
    fn from(value: &T) -> Self {
        Self(value as *const T as *const () as usize)
    }
}
