//! Virtual filesystem abstraction.
//!
//! A uniform interface over heterogeneous storage, composed by stackable
//! decorators. Key components:
//!
//! - [`Vfs`] - Core trait for filesystem operations
//! - [`VfsFile`] - The open-handle contract (random I/O, enumeration,
//!   metadata, sync)
//! - [`MemoryFs`] / [`LocalFs`] - Concrete backends
//! - [`PrefixFs`] - Rewrites paths under a fixed root
//! - [`BufferFs`] - Write-buffering layer with union directory listings
//! - [`GzipFs`] - Transparent streaming compression
//! - [`SizeCacheFs`] - Two-tier cache with a byte budget and LRU eviction
//!
//! ## Design Decisions
//!
//! - **Handle-based**: `open` returns a [`VfsFile`]; overlays hook open
//!   and close to run their bookkeeping (the cache overlay pins entries
//!   for exactly the life of a handle).
//! - **Capability sets, not hierarchies**: backends and overlays implement
//!   the same two traits and compose behind `Arc<dyn Vfs>` in any order.
//! - **Caller-driven cleanup**: handles are closed explicitly; overlays
//!   hold no references to live handles.

pub mod backends;
mod buffer;
mod cache;
mod compress;
mod error;
mod file;
mod fs;
mod prefix;
mod types;
pub mod util;

pub use backends::{LocalFs, MemoryFs};
pub use buffer::BufferFs;
pub use cache::{CacheEntry, SizeCacheFs, INDEX_FILE};
pub use compress::{Compression, GzipFs};
pub use error::{VfsError, VfsResult};
pub use file::{SeekFrom, VfsFile};
pub use fs::Vfs;
pub use prefix::PrefixFs;
pub use types::{DirEntry, FileAttr, FileType, OpenFlags};
