//! Tile caches.
//!
//! Two layers share the same deterministic cache key:
//!
//! - [`MemoryCache`]: a byte-budgeted LRU of decoded pixel buffers that
//!   doubles as a pool of reusable backing allocations, so a steady pan does
//!   not allocate a fresh buffer per decode.
//! - [`DiskCache`]: a persistent, size-bounded LRU blob store, used when the
//!   byte supplier is expensive (network) or when composite tiles — costly to
//!   rebuild — are generated. Disk failures are downgraded to cache misses,
//!   never surfaced as errors.

mod disk;
mod memory;

pub use disk::{DiskCache, DiskCachePolicy};
pub use memory::{MemoryCache, DEFAULT_MEMORY_BUDGET};
