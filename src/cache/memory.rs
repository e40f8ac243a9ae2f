//! In-memory tile cache and buffer pool.
//!
//! A single structure serves two roles:
//!
//! - **Cache**: `get`/`put`/`remove` with recency tracking; inserting past
//!   the byte budget evicts least-recently-used entries until the resident
//!   total fits again.
//! - **Pool**: [`MemoryCache::acquire_reusable`] scans from the
//!   least-recently-used end for a buffer whose backing allocation is large
//!   enough for an upcoming decode, removes it from the cache, clears its
//!   contents and hands it to the decoder to fill in place.
//!
//! Byte accounting uses each buffer's actual backing size, not its logical
//! dimensions. All mutating operations serialize on one lock: decode workers
//! returning and acquiring buffers run concurrently with the control path
//! destroying tiles.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::tile::{PixelBuffer, TileKey};

/// Default memory cache budget: 64MB of decoded pixels.
pub const DEFAULT_MEMORY_BUDGET: usize = 64 * 1024 * 1024;

/// Maximum number of entries (to bound LRU overhead).
const DEFAULT_MAX_ENTRIES: usize = 10_000;

// =============================================================================
// Memory Cache
// =============================================================================

/// LRU store of decoded tiles bounded by a byte budget, doubling as a source
/// of reusable backing buffers.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    budget: usize,
}

struct Inner {
    cache: LruCache<TileKey, Arc<PixelBuffer>>,
    total_bytes: usize,
}

impl MemoryCache {
    /// Create a cache with the default budget.
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_MEMORY_BUDGET)
    }

    /// Create a cache with the given byte budget.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                cache: LruCache::new(
                    NonZeroUsize::new(DEFAULT_MAX_ENTRIES).expect("non-zero entry bound"),
                ),
                total_bytes: 0,
            }),
            budget,
        }
    }

    /// Get a decoded buffer, marking it most recently used.
    pub async fn get(&self, key: &TileKey) -> Option<Arc<PixelBuffer>> {
        let mut inner = self.inner.lock().await;
        inner.cache.get(key).cloned()
    }

    /// Insert a decoded buffer, then evict least-recently-used entries until
    /// the resident total fits the budget again.
    pub async fn put(&self, key: TileKey, buffer: Arc<PixelBuffer>) {
        let mut inner = self.inner.lock().await;

        if let Some(old) = inner.cache.peek(&key) {
            let old_size = old.byte_size();
            inner.total_bytes = inner.total_bytes.saturating_sub(old_size);
        }

        inner.total_bytes += buffer.byte_size();
        inner.cache.put(key, buffer);

        while inner.total_bytes > self.budget {
            match inner.cache.pop_lru() {
                Some((evicted_key, evicted)) => {
                    inner.total_bytes = inner.total_bytes.saturating_sub(evicted.byte_size());
                    debug!(key = %evicted_key, bytes = evicted.byte_size(), "evicting tile");
                }
                None => break,
            }
        }
    }

    /// Remove a buffer, returning it if present.
    pub async fn remove(&self, key: &TileKey) -> Option<Arc<PixelBuffer>> {
        let mut inner = self.inner.lock().await;
        let buffer = inner.cache.pop(key)?;
        inner.total_bytes = inner.total_bytes.saturating_sub(buffer.byte_size());
        Some(buffer)
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.cache.clear();
        inner.total_bytes = 0;
    }

    /// Take a reusable buffer for an upcoming `width x height` decode.
    ///
    /// Scans from the least-recently-used end for an entry whose backing
    /// allocation fits and whose buffer is not shared with a live tile,
    /// removes it from the cache and returns it cleared and resized — the
    /// decode fills it in place instead of allocating fresh.
    pub async fn acquire_reusable(&self, width: u32, height: u32) -> Option<PixelBuffer> {
        let mut inner = self.inner.lock().await;

        let key = inner
            .cache
            .iter()
            .rev()
            .find(|(_, buf)| Arc::strong_count(buf) == 1 && buf.fits(width, height))
            .map(|(key, _)| key.clone())?;

        let buffer = inner.cache.pop(&key)?;
        inner.total_bytes = inner.total_bytes.saturating_sub(buffer.byte_size());

        // Uniqueness was checked under the lock, so the unwrap cannot race
        // with a new clone.
        match Arc::try_unwrap(buffer) {
            Ok(mut buffer) => {
                buffer.reset_for(width, height).ok()?;
                debug!(key = %key, "reusing cached buffer for decode");
                Some(buffer)
            }
            Err(buffer) => {
                inner.total_bytes += buffer.byte_size();
                inner.cache.put(key, buffer);
                None
            }
        }
    }

    /// Emergency cleanup: evict least-recently-used entries until at most
    /// `target_bytes` remain resident. Used when an allocation fails during
    /// decode.
    pub async fn trim(&self, target_bytes: usize) {
        let mut inner = self.inner.lock().await;
        while inner.total_bytes > target_bytes {
            match inner.cache.pop_lru() {
                Some((_, evicted)) => {
                    inner.total_bytes = inner.total_bytes.saturating_sub(evicted.byte_size());
                }
                None => break,
            }
        }
    }

    /// Number of cached buffers.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.cache.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.cache.is_empty()
    }

    /// Current resident byte total.
    pub async fn resident_bytes(&self) -> usize {
        self.inner.lock().await.total_bytes
    }

    /// The configured byte budget.
    pub fn budget(&self) -> usize {
        self.budget
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
