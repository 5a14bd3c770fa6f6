//! Arena-backed memory for short-lived objects and signals
//!
//! * [Arena] is a fixed-capacity bump allocator that owns what is built in
//!   it and tears everything down at once on [purge](Arena::purge).
//! * [Dispatcher] is a double-buffered signal queue on top of two arenas:
//!   many threads publish, one thread drains.
//! * [InlineCallable] is a heap-free, type-erased closure holder, used for
//!   callback lists and for [DispatchTable] handlers.
//!
//! Capacities, lock type, and backing allocator are all compile-time
//! parameters with defaults.

pub mod arena;
pub mod backing;
pub mod callback;
pub mod dispatch_table;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod lock;

mod loom_testing;
mod util;

pub use arena::{Arena, ArenaStats, DEFAULT_ARENA_CAPACITY, REGION_ALIGN};
pub use backing::{Backing, SystemBacking};
pub use callback::{
    CallbackList, InlineCallable, LargeCallable, SmallCallable, CALLABLE_ALIGN,
    LARGE_CALLABLE_CAPACITY, SMALL_CALLABLE_CAPACITY,
};
pub use dispatch_table::DispatchTable;
pub use dispatcher::{Dispatcher, DrainReport, DEFAULT_DISPATCH_CAPACITY};
pub use envelope::{Envelope, TypeTag};
pub use error::ArenaError;
pub use lock::{ArenaLock, DefaultLock, OsMutex, SpinLock};
