//! [`Error`] types reported by [`ReferenceMap`](super::ReferenceMap).

use thiserror::Error;

/// Errors returned by [`ReferenceMap`](super::ReferenceMap) constructors and iterators.
#[derive(Clone, Copy, Debug, Error, PartialEq)]
pub enum Error {
    /// The load factor is not a positive finite number.
    #[error("load factor must be positive, got {0}")]
    InvalidLoadFactor(f32),

    /// The concurrency level is zero.
    #[error("concurrency level must be positive")]
    InvalidConcurrencyLevel,

    /// [`Iter::remove`](crate::reference_map::Iter::remove) was called before
    /// [`Iterator::next`] yielded an entry, or twice for the same entry.
    #[error("no element to remove")]
    NoElementToRemove,
}
