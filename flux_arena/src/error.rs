//! Error types for arena and dispatcher operations

use thiserror::Error;

/// Errors that can be returned by [Arena](crate::Arena) and
/// [Dispatcher](crate::Dispatcher) operations
///
/// An arena that is merely *full* is not an error: the request is served by a
/// chained arena instead. These are only the cases chaining cannot fix.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ArenaError {
    /// A single request is bigger than an empty arena can ever hold
    #[error("allocation of {requested} bytes exceeds arena capacity of {capacity} bytes")]
    OutOfCapacity {
        /// Number of bytes requested (including alignment padding)
        requested: usize,
        /// Data capacity of one arena in the chain
        capacity: usize,
    },
    /// The requested alignment is stricter than the region guarantees
    #[error("alignment of {align} bytes exceeds maximum supported alignment of {max} bytes")]
    UnsupportedAlignment {
        /// Alignment requested
        align: usize,
        /// Alignment of the arena region
        max: usize,
    },
    /// The backing memory provider could not supply a new arena
    #[error("backing allocator failed to provide {size} bytes")]
    BackingExhausted {
        /// Size of the failed backing allocation
        size: usize,
    },
}
