//! Object paging for Betula.
//!
//! This crate provides the swap space: a process-local object manager that
//! hands out reference-counted handles to heap objects, pins them for the
//! duration of dereferences, serializes them to a pluggable backing store
//! on eviction, reloads them on access, and bounds the resident set under
//! a cache-replacement policy. It also supports durable checkpoints of the
//! whole object graph, committed by atomically flipping the store's root
//! pointer.

mod cache;
mod codec;
mod space;
mod store;

pub use cache::{CacheManager, CacheOps, LruCacheManager};
pub use codec::{LoadStream, SaveStream};
pub use space::{Handle, Pin, SwapSpace, Swappable};
pub use store::{BackingStore, FileStore, FileStoreConfig, MemStore};
