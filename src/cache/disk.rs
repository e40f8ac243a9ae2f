//! Persistent tile cache.
//!
//! A size-bounded LRU blob store keyed by the same deterministic cache key as
//! the memory cache. Each entry is one file under the cache root: an 8-byte
//! little-endian header (width, height) followed by raw RGBA8 pixels.
//!
//! The store is deliberately forgiving: corruption or I/O failure on any
//! read or write is treated as a cache miss and logged, never propagated as
//! an error — a broken disk cache must not break the viewer.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::SystemTime;

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::tile::{PixelBuffer, TileKey, BYTES_PER_PIXEL};

/// Size of the blob header: width and height as little-endian u32.
const BLOB_HEADER_LEN: usize = 8;

/// File extension for tile blobs.
const BLOB_EXTENSION: &str = "tile";

/// Maximum number of indexed entries (to bound LRU overhead).
const DEFAULT_MAX_ENTRIES: usize = 100_000;

// =============================================================================
// Disk Cache Policy
// =============================================================================

/// Which decoded tiles are persisted to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskCachePolicy {
    /// Never cache to disk.
    #[default]
    Never,

    /// Cache only sub-sampled composite tiles — the expensive-to-rebuild
    /// case, since each one costs `sample x sample` fetches and decodes.
    CompositesOnly,

    /// Cache every decoded tile. Appropriate when the byte supplier is a
    /// network fetch and bytes should not be re-fetched.
    All,
}

impl DiskCachePolicy {
    /// Whether a tile at the given sampling factor should be written under
    /// this policy. Composite tiles are always eligible once a disk cache
    /// exists, whatever the policy says.
    pub fn should_cache(&self, sample: u32) -> bool {
        match self {
            DiskCachePolicy::Never => false,
            DiskCachePolicy::CompositesOnly => sample > 1,
            DiskCachePolicy::All => true,
        }
    }
}

// =============================================================================
// Disk Cache
// =============================================================================

/// Persistent, size-bounded LRU tile store.
pub struct DiskCache {
    root: PathBuf,
    budget: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Cache-key string -> blob size in bytes, in recency order.
    index: LruCache<String, u64>,
    total_bytes: u64,
}

impl DiskCache {
    /// Open (or create) a disk cache rooted at `root` with the given byte
    /// budget.
    ///
    /// Existing blobs are indexed in modification-time order so recency
    /// survives restarts; anything over budget is evicted immediately.
    pub async fn open(root: impl Into<PathBuf>, budget: u64) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut entries: Vec<(String, u64, SystemTime)> = Vec::new();
        let mut dir = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((stem.to_string(), meta.len(), modified));
        }

        // Oldest first, so the most recent blobs end up most recently used.
        entries.sort_by_key(|(_, _, modified)| *modified);

        let mut index = LruCache::new(
            NonZeroUsize::new(DEFAULT_MAX_ENTRIES).expect("non-zero entry bound"),
        );
        let mut total_bytes = 0u64;
        for (name, size, _) in entries {
            total_bytes += size;
            index.put(name, size);
        }

        let cache = Self {
            root,
            budget,
            inner: Mutex::new(Inner { index, total_bytes }),
        };
        cache.evict_over_budget().await;
        Ok(cache)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{BLOB_EXTENSION}"))
    }

    /// Read a tile blob. Any failure — missing file, short read, header
    /// mismatch — is a miss: the entry is dropped from the index and, for
    /// corruption, the file deleted.
    pub async fn get(&self, key: &TileKey) -> Option<PixelBuffer> {
        let name = key.to_string();

        {
            let mut inner = self.inner.lock().await;
            inner.index.get(&name)?;
        }

        let path = self.path_for(&name);
        let blob = match tokio::fs::read(&path).await {
            Ok(blob) => blob,
            Err(err) => {
                warn!(key = %name, error = %err, "disk cache read failed, treating as miss");
                self.forget(&name).await;
                return None;
            }
        };

        match decode_blob(&blob) {
            Some(buffer) => Some(buffer),
            None => {
                warn!(key = %name, "corrupt disk cache entry, discarding");
                self.forget(&name).await;
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
        }
    }

    /// Persist a decoded tile. A no-op when the key is already present (the
    /// blob on disk is as good as the one in hand). Write failures are
    /// logged and swallowed.
    pub async fn put(&self, key: &TileKey, buffer: &PixelBuffer) {
        let name = key.to_string();

        {
            let inner = self.inner.lock().await;
            if inner.index.contains(&name) {
                return;
            }
        }

        let blob = encode_blob(buffer);
        let size = blob.len() as u64;
        let path = self.path_for(&name);
        if let Err(err) = tokio::fs::write(&path, blob).await {
            warn!(key = %name, error = %err, "disk cache write failed, skipping");
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            inner.index.put(name, size);
            inner.total_bytes += size;
        }
        self.evict_over_budget().await;
    }

    /// Remove a single entry and its blob.
    pub async fn remove(&self, key: &TileKey) {
        let name = key.to_string();
        self.forget(&name).await;
        let _ = tokio::fs::remove_file(self.path_for(&name)).await;
    }

    /// Delete every blob and reset the index.
    pub async fn clear(&self) {
        let names: Vec<String> = {
            let mut inner = self.inner.lock().await;
            let names = inner.index.iter().map(|(name, _)| name.clone()).collect();
            inner.index.clear();
            inner.total_bytes = 0;
            names
        };
        for name in names {
            let _ = tokio::fs::remove_file(self.path_for(&name)).await;
        }
    }

    /// Whether a key is present, without touching recency.
    pub async fn contains(&self, key: &TileKey) -> bool {
        let name = key.to_string();
        self.inner.lock().await.index.contains(&name)
    }

    /// Number of indexed blobs.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.index.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.index.is_empty()
    }

    /// Total bytes on disk according to the index.
    pub async fn total_bytes(&self) -> u64 {
        self.inner.lock().await.total_bytes
    }

    /// The configured byte budget.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    async fn forget(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(size) = inner.index.pop(name) {
            inner.total_bytes = inner.total_bytes.saturating_sub(size);
        }
    }

    async fn evict_over_budget(&self) {
        loop {
            let victim = {
                let mut inner = self.inner.lock().await;
                if inner.total_bytes <= self.budget {
                    return;
                }
                match inner.index.pop_lru() {
                    Some((name, size)) => {
                        inner.total_bytes = inner.total_bytes.saturating_sub(size);
                        Some(name)
                    }
                    None => None,
                }
            };
            match victim {
                Some(name) => {
                    debug!(key = %name, "evicting disk cache entry");
                    let _ = tokio::fs::remove_file(self.path_for(&name)).await;
                }
                None => return,
            }
        }
    }
}

fn encode_blob(buffer: &PixelBuffer) -> Vec<u8> {
    let mut blob = Vec::with_capacity(BLOB_HEADER_LEN + buffer.data().len());
    blob.extend_from_slice(&buffer.width().to_le_bytes());
    blob.extend_from_slice(&buffer.height().to_le_bytes());
    blob.extend_from_slice(buffer.data());
    blob
}

fn decode_blob(blob: &[u8]) -> Option<PixelBuffer> {
    if blob.len() < BLOB_HEADER_LEN {
        return None;
    }
    let width = u32::from_le_bytes(blob[0..4].try_into().ok()?);
    let height = u32::from_le_bytes(blob[4..8].try_into().ok()?);
    let expected = width as usize * height as usize * BYTES_PER_PIXEL;
    let payload = &blob[BLOB_HEADER_LEN..];
    if payload.len() != expected {
        return None;
    }
    PixelBuffer::from_raw(width, height, payload.to_vec())
}

// =============================================================================
// Tests
// =============================================================================
