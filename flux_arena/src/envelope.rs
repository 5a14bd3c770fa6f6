//! Type-erased signal carrier

use std::{
    any::{type_name, TypeId},
    fmt::Debug,
    hash::Hasher,
    mem::{align_of, size_of},
    ptr::{self, addr_of},
};

use rustc_hash::FxHasher;

use crate::util::{roundto, UsizePtr};

/// Hash identifying a payload type, used as the dispatch key
///
/// Derived from the type's name, so it is stable for a given build.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(u64);

impl TypeTag {
    /// Tag for payload type `P`
    pub fn of<P: ?Sized>() -> Self {
        Self::from_name(type_name::<P>())
    }

    /// Tag for a type with the given `type_name`
    pub fn from_name(name: &str) -> Self {
        let mut hasher = FxHasher::default();
        hasher.write(name.as_bytes());
        Self(hasher.finish())
    }

    /// Raw hash value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Debug for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeTag({:#018x})", self.0)
    }
}

/// Header preceding every published payload
///
/// Handlers only ever see `&Envelope`. The payload itself sits right behind
/// the header in the same arena allocation.
#[repr(C)]
pub struct Envelope {
    /// Next envelope in publish order, null terminates
    pub(crate) next: *mut Envelope,
    tag: TypeTag,
    type_id: TypeId,
    payload: *const (),
}

impl Envelope {
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// Untyped pointer to the payload
    pub fn payload(&self) -> *const () {
        self.payload
    }

    /// Whether the payload is a `P`
    pub fn is<P: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<P>()
    }

    /// Typed view of the payload, if it is a `P`
    pub fn downcast_ref<P: 'static>(&self) -> Option<&P> {
        if self.is::<P>() {
            // safety: type checked above, and the payload lives at least as
            // long as the envelope
            Some(unsafe { &*self.payload.cast::<P>() })
        } else {
            None
        }
    }
}

impl Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("@addr", &(self as *const _))
            .field("tag", &self.tag)
            .field("payload", &UsizePtr::from(self.payload))
            .finish()
    }
}

/// Header and payload as laid out in the arena
#[repr(C)]
pub(crate) struct EnvelopeNode<P> {
    header: Envelope,
    payload: P,
}
// safety: the header pointers only refer into the dispatcher that owns the
// node, and are only followed under its lock or by the single drainer
unsafe impl<P: Send> Send for EnvelopeNode<P> {}

impl<P: 'static> EnvelopeNode<P> {
    pub(crate) const PAYLOAD_OFFSET: usize = roundto(size_of::<Envelope>(), align_of::<P>());

    pub fn new(payload: P) -> Self {
        Self {
            header: Envelope {
                next: ptr::null_mut(),
                tag: TypeTag::of::<P>(),
                type_id: TypeId::of::<P>(),
                payload: ptr::null(),
            },
            payload,
        }
    }

    /// Fill in the payload pointer once the node is at its final address
    ///
    /// # Safety
    ///
    /// `node` must be valid, and must not move for as long as the envelope is used.
    pub unsafe fn seal(node: *mut Self) -> *mut Envelope {
        (*node).header.payload = addr_of!((*node).payload).cast();
        debug_assert_eq!(
            (*node).header.payload as usize - node as usize,
            Self::PAYLOAD_OFFSET
        );
        node.cast()
    }
}
