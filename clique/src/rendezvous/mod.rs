//! Ready-made `CliqueIdCallback` implementations.
//!
//! - [`InMemoryRendezvous`]: all participants in one process.
//! - [`KvStoreCallback`]: exchange through any [`KeyValueStore`] (the usual
//!   coordination service of a multi-process job); [`MemoryKvStore`] is the
//!   in-process store.

mod kv;
mod memory;

pub use kv::{KeyValueStore, KvStoreCallback, MemoryKvStore};
pub use memory::InMemoryRendezvous;
