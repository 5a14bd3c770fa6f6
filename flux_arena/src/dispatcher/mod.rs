//! Double-buffered signal queue
//!
//! Producers [publish](Dispatcher::publish) payloads into whichever of two
//! arenas is currently active; each payload is wrapped in an [Envelope] and
//! appended to a FIFO list. A single consumer [drains](Dispatcher::drain):
//! under the lock it detaches the list and flips the active arena, then walks
//! the detached list with the lock released and finally purges the arena it
//! came from. Anything published while a drain is running lands in the other
//! arena, so a drain only ever sees signals published before it started.

use std::{
    any::type_name,
    cell::UnsafeCell,
    fmt::Debug,
    mem,
    ptr,
    sync::atomic::Ordering,
};

use tracing::Level;

use crate::{
    arena::Arena,
    backing::{Backing, Owned, SystemBacking},
    envelope::{Envelope, EnvelopeNode},
    error::ArenaError,
    lock::{ArenaLock, DefaultLock},
    loom_testing::*,
    util::UsizePtr,
};

/// Default capacity of each of the dispatcher's two arenas
pub const DEFAULT_DISPATCH_CAPACITY: usize = 32 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ActiveArena {
    A,
    B,
}

impl ActiveArena {
    fn flip(self) -> Self {
        match self {
            ActiveArena::A => ActiveArena::B,
            ActiveArena::B => ActiveArena::A,
        }
    }

    fn index(self) -> usize {
        match self {
            ActiveArena::A => 0,
            ActiveArena::B => 1,
        }
    }
}

/// Intrusive FIFO of envelopes in one arena
struct SignalList {
    head: *mut Envelope,
    tail: *mut Envelope,
    len: usize,
}

impl Default for SignalList {
    fn default() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }
}

impl SignalList {
    unsafe fn push(&mut self, envelope: *mut Envelope) {
        if self.tail.is_null() {
            self.head = envelope;
        } else {
            (*self.tail).next = envelope;
        }
        self.tail = envelope;
        self.len += 1;
    }
}

struct DispatchState {
    active: ActiveArena,
    list: SignalList,
}

/// Result of one [drain](Dispatcher::drain)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Envelopes walked
    pub dispatched: usize,
    /// Sum of the handler's return values
    pub handled: usize,
}

/// Multi-producer, single-consumer signal queue over two arenas
///
/// Both arenas have the same shape: `CAPACITY` bytes each, which is also the
/// largest payload (plus envelope header) that can be published. They take
/// turns being the publish target, so sizing them differently would only
/// make the usable capacity depend on which one happens to be active.
pub struct Dispatcher<
    L: ArenaLock = DefaultLock,
    A: Backing = SystemBacking,
    const CAPACITY: usize = DEFAULT_DISPATCH_CAPACITY,
> {
    arenas: [Owned<Arena<L, A, CAPACITY>, A>; 2],
    /// Guards `state`, and serializes publish against the swap in drain
    lock: L,
    state: UnsafeCell<DispatchState>,
    draining: AtomicBool,
}
// safety: `state` is only touched with `lock` held, payloads are `Send`
unsafe impl<L: ArenaLock, A: Backing, const CAPACITY: usize> Send for Dispatcher<L, A, CAPACITY> {}
unsafe impl<L: ArenaLock, A: Backing, const CAPACITY: usize> Sync for Dispatcher<L, A, CAPACITY> {}

impl<L: ArenaLock, A: Backing, const CAPACITY: usize> Debug for Dispatcher<L, A, CAPACITY> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (active, pending) = {
            let _guard = self.lock.acquire();
            let state = unsafe { &*self.state.get() };
            (state.active, state.list.len)
        };
        f.debug_struct("Dispatcher")
            .field("@addr", &(self as *const _))
            .field("active", &active)
            .field("pending", &pending)
            .field("draining", &self.draining.load(Ordering::Relaxed))
            .finish()
    }
}

impl<L: ArenaLock, A: Backing + Default, const CAPACITY: usize> Dispatcher<L, A, CAPACITY> {
    /// Create a dispatcher whose arenas come from the default backing provider
    pub fn new() -> Result<Self, ArenaError> {
        Self::with_backing(A::default())
    }
}

impl<L: ArenaLock, A: Backing, const CAPACITY: usize> Dispatcher<L, A, CAPACITY> {
    /// Create a dispatcher whose arenas (and their chains) come from `backing`
    pub fn with_backing(backing: A) -> Result<Self, ArenaError> {
        let arena_a = Arena::new_in(backing.clone())?;
        let arena_b = Arena::new_in(backing)?;
        Ok(Self {
            arenas: [arena_a, arena_b],
            lock: L::default(),
            state: UnsafeCell::new(DispatchState {
                active: ActiveArena::A,
                list: SignalList::default(),
            }),
            draining: AtomicBool::new(false),
        })
    }

    /// Queue `payload` for the next drain
    pub fn publish<P: Send + 'static>(&self, payload: P) -> Result<(), ArenaError> {
        let trace_span = tracing::span!(
            Level::TRACE,
            "dispatcher::publish",
            "type" = type_name::<P>()
        );
        let _span_enter = trace_span.enter();

        // held across construct so a drain can't swap arenas in between
        let _guard = self.lock.acquire();
        unsafe {
            let state = &mut *self.state.get();
            let arena = &self.arenas[state.active.index()];
            let node: *mut EnvelopeNode<P> = arena.construct(EnvelopeNode::new(payload))?;
            let envelope = EnvelopeNode::seal(node);
            state.list.push(envelope);
            tracing::event!(Level::TRACE, envelope = ?UsizePtr::from(envelope), arena = ?state.active);
        }
        Ok(())
    }

    /// Number of envelopes waiting for the next drain
    pub fn pending(&self) -> usize {
        let _guard = self.lock.acquire();
        unsafe { (*self.state.get()).list.len }
    }

    fn swap_state(&self) -> (ActiveArena, SignalList) {
        let _guard = self.lock.acquire();
        unsafe {
            let state = &mut *self.state.get();
            let detached = state.active;
            state.active = detached.flip();
            (detached, mem::take(&mut state.list))
        }
    }

    /// Hand every pending envelope to `handler`, in publish order
    ///
    /// Payloads are dropped after the last one has been handled. `handler`
    /// may publish; those signals wait for the next drain.
    ///
    /// # Panics
    ///
    /// Panics if called while another drain is in progress (including from
    /// inside `handler`).
    pub fn drain<H>(&self, mut handler: H) -> DrainReport
    where
        H: FnMut(&Envelope) -> usize,
    {
        let trace_span = tracing::span!(Level::TRACE, "dispatcher::drain");
        let _span_enter = trace_span.enter();

        if self.draining.swap(true, Ordering::Acquire) {
            panic!("Dispatcher::drain called while a drain is already in progress");
        }

        let (detached, list) = self.swap_state();
        // purges even if handler unwinds
        let _pass = DrainPass {
            dispatcher: self,
            arena: detached,
        };

        let mut report = DrainReport::default();
        let mut current = list.head;
        while !current.is_null() {
            // safety: envelopes live until _pass purges their arena
            let envelope = unsafe { &*current };
            report.handled += handler(envelope);
            report.dispatched += 1;
            current = envelope.next;
        }
        debug_assert_eq!(report.dispatched, list.len);

        tracing::event!(
            Level::TRACE,
            arena = ?detached,
            dispatched = report.dispatched,
            handled = report.handled
        );
        report
    }
}

/// Purges the detached arena and ends the drain when dropped
struct DrainPass<'d, L: ArenaLock, A: Backing, const CAPACITY: usize> {
    dispatcher: &'d Dispatcher<L, A, CAPACITY>,
    arena: ActiveArena,
}

impl<L: ArenaLock, A: Backing, const CAPACITY: usize> Drop for DrainPass<'_, L, A, CAPACITY> {
    fn drop(&mut self) {
        // ends the drain even if a payload destructor panics in the purge
        let _end = EndDrain(&self.dispatcher.draining);
        unsafe {
            // safety: handler's borrows of envelopes have ended, and publishers
            // only construct into the other arena until the next drain
            self.dispatcher.arenas[self.arena.index()].purge_shared();
        }
    }
}

struct EndDrain<'d>(&'d AtomicBool);

impl Drop for EndDrain<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests;
