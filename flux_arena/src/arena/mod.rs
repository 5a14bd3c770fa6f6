//! Fixed-capacity bump arena with deferred destruction
//!
//! An [Arena] is a single inline byte region. The front of the region holds a
//! small control block (deferred-list head, bump cursor, allocation count),
//! the rest is handed out by bumping the cursor. Nothing is ever freed
//! individually: [Arena::purge] runs pending destructors, zeroes the data
//! bytes, and rewinds the cursor.
//!
//! Objects that need drop glue are wrapped in a node that records a
//! teardown function and the *offset* (from the region base) of the next
//! such node. Offsets rather than addresses keep the region relocatable,
//! so moving an `Arena` value moves every object in it along with the list.
//!
//! Space reservation is serialized by the arena lock. Linking a node into the
//! deferred list happens after the lock is released, with a CAS loop on the
//! head offset, so producers only contend on the lock for the bump itself.
//!
//! When the region is full, requests spill into a chained arena of the same
//! shape. Chain links are created on demand from the [Backing] provider and
//! are only purged (never freed) until the parent arena is dropped.

use std::{
    alloc::Layout,
    cell::UnsafeCell,
    fmt::Debug,
    mem::{self, size_of, MaybeUninit},
    ptr::{self, addr_of, addr_of_mut, NonNull},
    sync::atomic::Ordering,
};

use tracing::Level;

use crate::{
    backing::{Backing, Owned, SystemBacking},
    error::ArenaError,
    lock::{ArenaLock, DefaultLock},
    loom_testing::*,
    util::{align_padding, UsizePtr},
};

/// Default number of data bytes in one arena
pub const DEFAULT_ARENA_CAPACITY: usize = 8 * 1024;
/// Alignment of the region base, and the strictest alignment an object may ask for
pub const REGION_ALIGN: usize = 16;

/// Bookkeeping stored at the very start of the region
#[repr(C, align(16))]
struct ControlBlock {
    /// Offset (from region base) of the most recently linked deferred node,
    /// or 0 if there are none. 0 is never a valid node offset because the
    /// control block itself lives there.
    head_offset: AtomicUsize,
    /// Bump cursor, as an offset from region base
    current_size: usize,
    /// Number of allocations served by this arena (not counting the chain)
    current_allocations: usize,
}
const _: () = assert!(mem::align_of::<ControlBlock>() == REGION_ALIGN);

/// Offset of the first data byte, which is also where the cursor rewinds to
const DATA_START: usize = size_of::<ControlBlock>();

#[repr(C)]
struct Region<const CAPACITY: usize> {
    control: ControlBlock,
    data: [MaybeUninit<u8>; CAPACITY],
}

/// Header of a deferred-destruction node
#[repr(C)]
struct DeferredHeader {
    /// Offset (from region base) of the next node, 0 terminates
    next_offset: usize,
    /// Drops the object that follows this header
    teardown: unsafe fn(*mut DeferredHeader),
}

#[repr(C)]
struct DeferredNode<T> {
    // DO NOT MOVE, purge casts node pointers to header pointers
    header: DeferredHeader,
    obj: T,
}

impl<T> DeferredNode<T> {
    fn new(obj: T) -> Self {
        Self {
            header: DeferredHeader {
                next_offset: 0,
                teardown: Self::teardown,
            },
            obj,
        }
    }

    unsafe fn teardown(header: *mut DeferredHeader) {
        let node = header.cast::<Self>();
        ptr::drop_in_place(addr_of_mut!((*node).obj));
    }
}

/// Usage totals across an arena and its chain
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Live allocations
    pub allocations: usize,
    /// Bytes consumed, including alignment padding and node headers
    pub bytes_used: usize,
    /// Number of chained arenas behind this one
    pub chain_depth: usize,
}

/// Fixed-capacity bump allocator that owns everything constructed in it
///
/// Intended usage is a repeating cycle of
/// "construct a batch of objects → process them → [purge](Arena::purge)".
pub struct Arena<
    L: ArenaLock = DefaultLock,
    A: Backing = SystemBacking,
    const CAPACITY: usize = DEFAULT_ARENA_CAPACITY,
> {
    /// Serializes bump allocation and purge
    lock: L,
    /// Control block and data bytes
    region: UnsafeCell<Region<CAPACITY>>,
    /// Overflow arena, only touched with the *top-level* lock held
    chain: UnsafeCell<Option<Owned<Arena<L, A, CAPACITY>, A>>>,
    /// Where chain links come from
    backing: A,
}
// safety: control state is only mutated under `lock` or through the atomic head,
// and only `Send` objects may be constructed inside the region
unsafe impl<L: ArenaLock, A: Backing, const CAPACITY: usize> Send for Arena<L, A, CAPACITY> {}
unsafe impl<L: ArenaLock, A: Backing, const CAPACITY: usize> Sync for Arena<L, A, CAPACITY> {}

impl<L: ArenaLock, A: Backing, const CAPACITY: usize> Debug for Arena<L, A, CAPACITY> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("@addr", &(self as *const _))
            .field("capacity", &CAPACITY)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<L: ArenaLock, A: Backing + Default, const CAPACITY: usize> Default
    for Arena<L, A, CAPACITY>
{
    fn default() -> Self {
        Self::with_backing(A::default())
    }
}

impl<L: ArenaLock, A: Backing + Default, const CAPACITY: usize> Arena<L, A, CAPACITY> {
    /// Create an empty arena using the default backing provider for chaining
    pub fn new() -> Self {
        Self::default()
    }

    /// Heap-allocated empty arena with the default backing provider
    pub fn boxed() -> Box<Self> {
        Self::boxed_with(A::default())
    }
}

impl<L: ArenaLock, A: Backing, const CAPACITY: usize> Arena<L, A, CAPACITY> {
    /// Largest single allocation an arena of this shape can serve
    pub const MAX_ALLOCATION: usize = CAPACITY;

    /// Create an empty arena that grows its chain from `backing`
    ///
    /// The value is built on the stack. For large capacities use
    /// [boxed_with](Self::boxed_with) instead.
    pub fn with_backing(backing: A) -> Self {
        Self {
            lock: L::default(),
            region: UnsafeCell::new(Region {
                control: ControlBlock {
                    head_offset: AtomicUsize::new(0),
                    current_size: DATA_START,
                    current_allocations: 0,
                },
                data: [MaybeUninit::zeroed(); CAPACITY],
            }),
            chain: UnsafeCell::new(None),
            backing,
        }
    }

    /// Create an empty arena directly on the heap, never on the stack
    pub fn boxed_with(backing: A) -> Box<Self> {
        let layout = Layout::new::<Self>();
        unsafe {
            let raw = std::alloc::alloc_zeroed(layout).cast::<Self>();
            if raw.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            Self::init_in_place(raw, backing);
            // safety: global allocator, Self's layout, fully initialized
            Box::from_raw(raw)
        }
    }

    /// Create an empty arena inside memory from `backing`
    pub(crate) fn new_in(backing: A) -> Result<Owned<Self, A>, ArenaError> {
        let link_backing = backing.clone();
        unsafe { Owned::new_zeroed_in(backing, |arena| Self::init_in_place(arena, link_backing)) }
    }

    /// Initialize everything except the data bytes
    ///
    /// `arena` must point to zeroed memory, which is what the data bytes of an
    /// empty arena look like anyway.
    unsafe fn init_in_place(arena: *mut Self, backing: A) {
        addr_of_mut!((*arena).lock).write(L::default());
        let region = UnsafeCell::raw_get(addr_of_mut!((*arena).region));
        addr_of_mut!((*region).control).write(ControlBlock {
            head_offset: AtomicUsize::new(0),
            current_size: DATA_START,
            current_allocations: 0,
        });
        addr_of_mut!((*arena).chain).write(UnsafeCell::new(None));
        addr_of_mut!((*arena).backing).write(backing);
    }

    /// Reject requests that no arena of this shape could ever satisfy
    fn check_layout(layout: Layout) -> Result<(), ArenaError> {
        if layout.align() > REGION_ALIGN {
            return Err(ArenaError::UnsupportedAlignment {
                align: layout.align(),
                max: REGION_ALIGN,
            });
        }
        if layout.size() > CAPACITY {
            return Err(ArenaError::OutOfCapacity {
                requested: layout.size(),
                capacity: CAPACITY,
            });
        }
        Ok(())
    }

    /// Reserve space for `layout`, spilling into the chain if needed
    ///
    /// Returns the storage along with the arena (this one or a chain link)
    /// whose region it lives in.
    ///
    /// Caller must hold the lock of the top-level arena.
    unsafe fn bump(&self, layout: Layout) -> Result<(NonNull<u8>, &Self), ArenaError> {
        let region = self.region.get();
        let base = region as *mut u8;
        let size = addr_of_mut!((*region).control.current_size);

        let head = base.add(*size);
        let padding = align_padding(head as usize, layout.align());
        let total = padding + layout.size();

        if *size + total <= DATA_START + CAPACITY {
            *size += total;
            *addr_of_mut!((*region).control.current_allocations) += 1;
            return Ok((NonNull::new_unchecked(head.add(padding)), self));
        }

        if *size == DATA_START {
            // already empty, a chain link wouldn't fit it either
            return Err(ArenaError::OutOfCapacity {
                requested: total,
                capacity: CAPACITY,
            });
        }

        // saturated, delegate to the chain
        let chain = self.chain.get();
        if (*chain).is_none() {
            let link = Self::new_in(self.backing.clone())?;
            tracing::event!(
                Level::TRACE,
                parent = ?UsizePtr::from(self),
                link = ?UsizePtr::from(&*link),
                "arena chained"
            );
            *chain = Some(link);
        }
        match &*chain {
            Some(next) => next.bump(layout),
            None => unreachable!(),
        }
    }

    /// Allocate raw, uninitialized storage
    ///
    /// Memory obtained this way is zeroed again on purge but never dropped.
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, ArenaError> {
        let trace_span = tracing::span!(
            Level::TRACE,
            "arena::allocate",
            size = layout.size(),
            align = layout.align()
        );
        let _span_enter = trace_span.enter();

        Self::check_layout(layout)?;
        let ptr = {
            let _guard = self.lock.acquire();
            unsafe { self.bump(layout)?.0 }
        };
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr.as_ptr()));
        Ok(ptr)
    }

    /// Move `value` into the arena
    ///
    /// If `T` has drop glue, it will run at the next purge (or when the arena
    /// is dropped). Otherwise the storage is simply zeroed.
    pub fn construct<T: Send + 'static>(&self, value: T) -> Result<&mut T, ArenaError> {
        let trace_span = tracing::span!(
            Level::TRACE,
            "arena::construct",
            "type" = std::any::type_name::<T>()
        );
        let _span_enter = trace_span.enter();

        if !mem::needs_drop::<T>() {
            let layout = Layout::new::<T>();
            Self::check_layout(layout)?;
            let obj = {
                let _guard = self.lock.acquire();
                unsafe {
                    let obj = self.bump(layout)?.0.cast::<T>().as_ptr();
                    obj.write(value);
                    obj
                }
            };
            tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(obj), deferred = false);
            // safety: fresh, initialized, and nobody else has this address
            return Ok(unsafe { &mut *obj });
        }

        let layout = Layout::new::<DeferredNode<T>>();
        Self::check_layout(layout)?;
        let (node, owner) = {
            let _guard = self.lock.acquire();
            unsafe {
                let (mem, owner) = self.bump(layout)?;
                let node = mem.cast::<DeferredNode<T>>().as_ptr();
                node.write(DeferredNode::new(value));
                (node, owner)
            }
        };
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(node), deferred = true);
        unsafe {
            // safety: node is initialized and lives in owner's region
            owner.link_deferred(node.cast::<DeferredHeader>());
            Ok(&mut (*node).obj)
        }
    }

    /// Prepend `node` onto this arena's deferred list
    ///
    /// `node` must point into this arena's own region (not a chain link's).
    unsafe fn link_deferred(&self, node: *mut DeferredHeader) {
        let region = self.region.get();
        let head = &(*region).control.head_offset;
        let my_offset = node as usize - region as usize;
        debug_assert!(my_offset >= DATA_START && my_offset < DATA_START + CAPACITY);

        let mut current = head.load(Ordering::Relaxed);
        loop {
            (*node).next_offset = current;
            // order: on success, release so that the node contents (and its
            // next_offset) happen-before the list walk in purge
            match head.compare_exchange_weak(
                current,
                my_offset,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => {
                    current = x;
                    spin_hint();
                }
            }
        }
    }

    /// Drop everything constructed so far and rewind the arena (and its chain)
    ///
    /// Destructors run most-recently-constructed first. Chain links are kept
    /// for reuse.
    pub fn purge(&mut self) {
        unsafe {
            // safety: &mut self means no outstanding objects or constructors
            self.purge_shared()
        }
    }

    /// [purge](Arena::purge) through a shared reference
    ///
    /// # Safety
    ///
    /// No references to objects in the arena may be used afterwards, and no
    /// `construct` on this arena may be in flight.
    pub(crate) unsafe fn purge_shared(&self) {
        let trace_span = tracing::span!(Level::TRACE, "arena::purge", arena = ?UsizePtr::from(self));
        let _span_enter = trace_span.enter();

        let _guard = self.lock.acquire();
        let region = self.region.get();

        // order: acquire pairs with the release CAS in link_deferred. We hold
        // the lock, but linking happens outside of it, so the lock alone
        // doesn't order us after the node writes.
        let head = (*region).control.head_offset.swap(0, Ordering::Acquire);
        let mut pass = PurgePass {
            region,
            offset: head,
            torn_down: 0,
        };
        pass.walk();
        drop(pass);

        if let Some(next) = &*self.chain.get() {
            next.purge_shared();
        }
    }

    /// Current usage, summed across the chain
    pub fn stats(&self) -> ArenaStats {
        let _guard = self.lock.acquire();
        let mut stats = ArenaStats::default();
        let mut level: &Self = self;
        loop {
            unsafe {
                let region = level.region.get();
                stats.allocations += *addr_of!((*region).control.current_allocations);
                stats.bytes_used += *addr_of!((*region).control.current_size) - DATA_START;
                match &*level.chain.get() {
                    Some(next) => {
                        stats.chain_depth += 1;
                        level = &**next;
                    }
                    None => break,
                }
            }
        }
        stats
    }
}

/// Tears down a detached deferred list, then rewinds the region
///
/// If a destructor panics, dropping the pass during the unwind finishes the
/// remaining teardowns and still rewinds, so every object is dropped exactly
/// once. A second panic from inside that drop aborts.
struct PurgePass<const CAPACITY: usize> {
    region: *mut Region<CAPACITY>,
    /// Next node to tear down, 0 when done
    offset: usize,
    torn_down: usize,
}

impl<const CAPACITY: usize> PurgePass<CAPACITY> {
    unsafe fn walk(&mut self) {
        let base = self.region as *mut u8;
        while self.offset != 0 {
            let node = base.add(self.offset).cast::<DeferredHeader>();
            // advance first, a panicking teardown must not be retried
            self.offset = (*node).next_offset;
            self.torn_down += 1;
            ((*node).teardown)(node);
        }
    }
}

impl<const CAPACITY: usize> Drop for PurgePass<CAPACITY> {
    fn drop(&mut self) {
        unsafe {
            self.walk();
            let region = self.region;
            ptr::write_bytes(addr_of_mut!((*region).data).cast::<u8>(), 0, CAPACITY);
            *addr_of_mut!((*region).control.current_size) = DATA_START;
            *addr_of_mut!((*region).control.current_allocations) = 0;
        }
        tracing::event!(Level::TRACE, torn_down = self.torn_down);
    }
}

impl<L: ArenaLock, A: Backing, const CAPACITY: usize> Drop for Arena<L, A, CAPACITY> {
    fn drop(&mut self) {
        self.purge();
    }
}
