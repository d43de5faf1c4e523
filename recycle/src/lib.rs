//! Recyclable, concurrently readable byte storage.
//!
//! This crate provides the buffer management layer for the cache:
//!
//! - [`Pool`]: a size-class freelist of raw byte chunks
//! - [`Data`]: an immutable byte sequence assembled from pool chunks,
//!   readable by many concurrent readers
//! - [`DataReader`]: a one-shot forward cursor over a [`Data`]
//!
//! A [`Data`] is created with a single owner reference. Every
//! [`Data::new_reader`] adds a reference; dropping a reader releases it.
//! The owner releases its own reference with [`Data::recycle`]. Once the
//! last reference is gone the chunks return to the pool, so storage reuse
//! is deterministic while reads stay zero-copy.

mod data;
mod pool;
mod reader;

pub use data::Data;
pub use pool::{LeakHook, Pool, default_chunk_sizes};
pub use reader::DataReader;
