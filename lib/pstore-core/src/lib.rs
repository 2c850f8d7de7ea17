//! The pstore core store.
//!
//! An append-only, memory-mapped, crash-consistent embedded data store: one writer at a time,
//! any number of concurrent readers, each immutable revision reachable by following a singly
//! linked chain of trailers back from the file's atomically published footer pointer.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

pub mod address;
pub mod database;
pub mod error;
pub mod file;
mod header;
mod mmap;
mod region;
mod sat;
pub mod shared_memory;
pub mod storage;
mod trailer;
pub mod transaction;
pub mod vacuum;
pub mod revision;

pub use address::{Address, Extent, TypedAddress, SEGMENT_SIZE};
pub use database::{AccessMode, Database, VacuumMode};
pub use error::{Error, Result};
pub use revision::Revision;
pub use storage::{ByteView, ByteViewMut};
pub use trailer::{Trailer, NUM_INDEXES};
pub use transaction::Transaction;
pub use vacuum::{VacuumEngine, VacuumOptions};
