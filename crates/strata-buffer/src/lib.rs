//! Tiered buffer pool management for StrataDB.
//!
//! This crate provides the in-memory chunk cache that sits between a slower
//! backing tier and consumers needing random access to keyed chunks:
//! - Preallocated fixed-size slabs carved into page-granular segments
//! - First-fit allocation with free-neighbor coalescing
//! - Pin-aware eviction of the cheapest contiguous window (LRU-proxy scoring)
//! - Fetch-through to an optional parent tier, write-back on checkpoint

mod buffer;
mod chunk_index;
mod pool;
mod segment;
mod slab;

pub use buffer::ChunkBuffer;
pub use pool::{BufferMgr, ParentMgr, PoolStats};
