#![doc = include_str!("../README.md")]

mod config;
pub use config::{
    Config, DEFAULT_CONCURRENCY_LEVEL, DEFAULT_INITIAL_CAPACITY, DEFAULT_LOAD_FACTOR,
    MAXIMUM_CONCURRENCY_LEVEL, MAXIMUM_SEGMENT_SIZE,
};

mod entry;
pub use entry::EntryRef;

mod error;
pub use error::Error;

mod reference;
pub use reference::{MemoryPressure, ReferenceKind};

pub mod reference_map;
pub use reference_map::ReferenceMap;

mod segment;

pub use equivalent::Equivalent;

#[cfg(feature = "serde")]
mod serde;
