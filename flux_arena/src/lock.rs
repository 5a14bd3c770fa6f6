//! Mutual exclusion used around bump allocation and list hand-off
//!
//! The arena only needs "acquire, do a handful of pointer bumps, release", so
//! the lock is abstracted behind [ArenaLock] and picked at compile time.
//! [SpinLock] is the default since critical sections are tiny;
//! [OsMutex] parks instead of spinning for heavily oversubscribed machines.
//!
//! When built with `--cfg loom`, [DefaultLock] is a loom-visible mutex,
//! because loom can't schedule around a spinlock built on std atomics.

/// A lock with a scoped (RAII) guard
///
/// Dropping the guard releases the lock, so every exit path out of a
/// critical section (including `?` and panics) unlocks.
pub trait ArenaLock: Default + Send + Sync {
    /// Guard type; the lock is held for as long as this lives
    type Guard<'a>
    where
        Self: 'a;

    /// Block until the lock is acquired
    fn acquire(&self) -> Self::Guard<'_>;
}

/// Busy-waiting lock from the `spin` crate
pub type SpinLock = spin::Mutex<()>;

/// Parking lock from `parking_lot`
pub type OsMutex = parking_lot::Mutex<()>;

impl ArenaLock for spin::Mutex<()> {
    type Guard<'a> = spin::MutexGuard<'a, ()>;

    #[inline]
    fn acquire(&self) -> Self::Guard<'_> {
        self.lock()
    }
}

impl ArenaLock for parking_lot::Mutex<()> {
    type Guard<'a> = parking_lot::MutexGuard<'a, ()>;

    #[inline]
    fn acquire(&self) -> Self::Guard<'_> {
        self.lock()
    }
}

/// Mutex that loom can model
#[cfg(loom)]
pub struct LoomLock(loom::sync::Mutex<()>);

#[cfg(loom)]
impl Default for LoomLock {
    fn default() -> Self {
        Self(loom::sync::Mutex::new(()))
    }
}

#[cfg(loom)]
impl ArenaLock for LoomLock {
    type Guard<'a> = loom::sync::MutexGuard<'a, ()>;

    fn acquire(&self) -> Self::Guard<'_> {
        // poisoning only happens if a test already panicked
        self.0.lock().unwrap()
    }
}

/// Lock used when no lock type is specified
#[cfg(not(loom))]
pub type DefaultLock = SpinLock;
/// Lock used when no lock type is specified
#[cfg(loom)]
pub type DefaultLock = LoomLock;
