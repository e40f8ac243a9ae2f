//! Decode scheduling.
//!
//! The scheduler owns the "wanted set": the tiles of the current grid. On
//! every grid recomputation [`DecodeScheduler::reconcile`] diffs the previous
//! wanted set against the new one — surviving tiles keep their decode state,
//! new tiles are scheduled, and tiles that fell out are handed back to the
//! caller for release. Each scheduled batch is bracketed by render
//! start/complete events.
//!
//! Decode tasks run on the tokio runtime, bounded by a semaphore sized to the
//! configured worker count. A task checks the caches before touching the byte
//! supplier, and checks for cancellation between its expensive steps: a
//! superseded generation (detail level switch, shutdown) aborts the task
//! without storing anything. An in-flight set suppresses duplicate decodes of
//! the same key, and the tile's own state machine resolves the remaining
//! race with destruction.
//!
//! Composite tiles (`sample > 1`) are assembled from `sample x sample` base
//! cell fetches, each downscaled into its quadrant of one output buffer. A
//! missing base cell leaves its quadrant blank; any other fetch error fails
//! the whole composite.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use image::imageops::{self, FilterType};
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, warn};

use crate::cache::{DiskCache, DiskCachePolicy, MemoryCache};
use crate::error::{DecodeError, SourceError};
use crate::events::Listeners;
use crate::grid::GridCell;
use crate::level::DetailLevel;
use crate::source::TileSource;
use crate::tile::{PixelBuffer, Tile, TileKey, TileState};

/// Filter used when downscaling composite sub-pieces. Triangle is a good
/// trade-off for the transient patchwork these tiles render.
const COMPOSITE_FILTER: FilterType = FilterType::Triangle;

// =============================================================================
// Batch accounting
// =============================================================================

struct BatchState {
    /// Monotonic batch identifier; a new batch supersedes the previous one.
    id: u64,
    /// Tiles of the current batch that have not yet settled.
    outstanding: usize,
}

// =============================================================================
// DecodeScheduler
// =============================================================================

/// Owns the wanted tile set and drives decodes through a bounded worker pool.
pub struct DecodeScheduler {
    source: Arc<dyn TileSource>,
    memory: Arc<MemoryCache>,
    disk: Option<(Arc<DiskCache>, DiskCachePolicy)>,
    events: Arc<Listeners>,

    max_attempts: u32,
    permits: Arc<Semaphore>,

    wanted: Mutex<HashMap<TileKey, Arc<Tile>>>,
    in_flight: Mutex<HashSet<TileKey>>,
    batch: Mutex<BatchState>,

    /// Bumped on detail level switches; tasks spawned under an older
    /// generation abort at their next checkpoint.
    generation: AtomicU64,

    /// While set, queued tasks park before doing any work.
    suppressed: AtomicBool,

    /// Set once on shutdown; never cleared.
    cancelled: AtomicBool,

    resume: Notify,
}

impl DecodeScheduler {
    pub fn new(
        source: Arc<dyn TileSource>,
        memory: Arc<MemoryCache>,
        disk: Option<(Arc<DiskCache>, DiskCachePolicy)>,
        workers: usize,
        max_attempts: u32,
        events: Arc<Listeners>,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            memory,
            disk,
            events,
            max_attempts: max_attempts.max(1),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            wanted: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            batch: Mutex::new(BatchState {
                id: 0,
                outstanding: 0,
            }),
            generation: AtomicU64::new(0),
            suppressed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            resume: Notify::new(),
        })
    }

    // -------------------------------------------------------------------------
    // Wanted set
    // -------------------------------------------------------------------------

    /// Replace the wanted set with the tiles for `cells`.
    ///
    /// Tiles already wanted keep their identity and decode state; idle
    /// newcomers (and idle survivors with attempts left) are scheduled as one
    /// batch. Returns the tiles that fell out of the set, still intact, so
    /// the caller can retain their images and release them.
    pub async fn reconcile(
        self: &Arc<Self>,
        cells: &[GridCell],
        level: &DetailLevel,
    ) -> Vec<Arc<Tile>> {
        let mut to_schedule = Vec::new();
        let removed: Vec<Arc<Tile>> = {
            let mut wanted = self.wanted.lock().await;
            let mut next = HashMap::with_capacity(cells.len());
            for cell in cells {
                let key = TileKey::new(cell.column, cell.row, cell.sample, level.scale);
                let tile = wanted
                    .remove(&key)
                    .unwrap_or_else(|| Arc::new(Tile::new(*cell, level.clone())));
                if tile.state() == TileState::Idle && tile.attempts() < self.max_attempts {
                    to_schedule.push(Arc::clone(&tile));
                }
                next.insert(key, tile);
            }
            let removed = wanted.drain().map(|(_, tile)| tile).collect();
            *wanted = next;
            removed
        };

        if !to_schedule.is_empty() {
            self.schedule_batch(to_schedule).await;
        }

        removed
    }

    /// Whether a key is in the current wanted set.
    pub async fn is_wanted(&self, key: &TileKey) -> bool {
        self.wanted.lock().await.contains_key(key)
    }

    /// Snapshot of the current wanted tiles.
    pub async fn wanted_tiles(&self) -> Vec<Arc<Tile>> {
        self.wanted.lock().await.values().cloned().collect()
    }

    /// Empty the wanted set, returning every tile for release.
    pub async fn clear_wanted(&self) -> Vec<Arc<Tile>> {
        self.wanted.lock().await.drain().map(|(_, t)| t).collect()
    }

    /// Re-schedule a failed tile, provided it is still wanted, idle and has
    /// attempts left. Returns whether a decode was scheduled.
    pub async fn retry(self: &Arc<Self>, key: &TileKey) -> bool {
        let tile = self.wanted.lock().await.get(key).cloned();
        let Some(tile) = tile else {
            return false;
        };
        if tile.state() != TileState::Idle {
            return false;
        }
        if tile.attempts() >= self.max_attempts {
            warn!(key = %key, attempts = tile.attempts(), "retry refused, attempt limit reached");
            return false;
        }
        self.schedule_batch(vec![tile]).await;
        true
    }

    // -------------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------------

    /// Park queued decode tasks before they do any work. Tasks already past
    /// the parking point run to completion.
    pub fn suppress(&self) {
        self.suppressed.store(true, Ordering::Release);
    }

    /// Release parked tasks.
    pub fn resume(&self) {
        self.suppressed.store(false, Ordering::Release);
        self.resume.notify_waiters();
    }

    /// Invalidate the current render pass: every task spawned so far aborts
    /// at its next checkpoint. Called on detail level switches.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Permanently stop the scheduler: queued tasks abort and no new permits
    /// are issued.
    pub fn shutdown(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.suppressed.store(false, Ordering::Release);
        self.resume.notify_waiters();
        self.permits.close();
    }

    fn should_abort(&self, generation: u64) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self.generation.load(Ordering::Acquire) != generation
    }

    // -------------------------------------------------------------------------
    // Decode tasks
    // -------------------------------------------------------------------------

    async fn schedule_batch(self: &Arc<Self>, tiles: Vec<Arc<Tile>>) {
        let batch = {
            let mut batch = self.batch.lock().await;
            batch.id += 1;
            batch.outstanding = tiles.len();
            batch.id
        };
        let generation = self.generation.load(Ordering::Acquire);
        debug!(tiles = tiles.len(), batch, "scheduling decode batch");
        self.events.notify_render_start().await;
        for tile in tiles {
            tokio::spawn(Arc::clone(self).run(tile, batch, generation));
        }
    }

    /// Settle one tile of a batch; the last settlement closes the batch.
    async fn settle(&self, batch_id: u64) {
        let complete = {
            let mut batch = self.batch.lock().await;
            if batch.id != batch_id || batch.outstanding == 0 {
                false
            } else {
                batch.outstanding -= 1;
                batch.outstanding == 0
            }
        };
        if complete {
            self.events.notify_render_complete().await;
        }
    }

    async fn run(self: Arc<Self>, tile: Arc<Tile>, batch: u64, generation: u64) {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            // Semaphore closed: shutdown raced the spawn.
            Err(_) => return,
        };

        loop {
            // Register for the wakeup before re-checking the flag, so a
            // resume between the check and the await is not lost.
            let resumed = self.resume.notified();
            if !self.suppressed.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
                break;
            }
            resumed.await;
        }

        let key = tile.key().clone();

        if self.should_abort(generation) || !self.is_wanted(&key).await {
            self.settle(batch).await;
            return;
        }

        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(key.clone()) {
                self.settle(batch).await;
                return;
            }
        }

        if tile.try_begin_decode() {
            tile.record_attempt();
            match self.decode(&tile, generation).await {
                Ok(Some(image)) => {
                    if tile.complete_decode(image).await {
                        self.events.notify_dirty().await;
                    } else {
                        debug!(key = %key, "tile destroyed mid-decode, result discarded");
                    }
                }
                Ok(None) => {
                    tile.abort_decode();
                    debug!(key = %key, "decode cancelled");
                }
                Err(error) => {
                    tile.abort_decode();
                    if let DecodeError::Allocation { requested } = &error {
                        warn!(
                            requested,
                            "allocation failure during decode, trimming memory cache"
                        );
                        self.memory.trim(self.memory.budget() / 2).await;
                    }
                    let attempts = tile.attempts();
                    warn!(key = %key, attempts, error = %error, "tile decode failed");
                    self.events.notify_decode_error(&key, attempts, &error).await;
                }
            }
        }

        self.in_flight.lock().await.remove(&key);
        self.settle(batch).await;
    }

    /// Resolve one tile's pixels: memory cache, then disk cache, then a full
    /// fetch-and-decode. The result lands in the memory cache either way.
    async fn decode(
        &self,
        tile: &Tile,
        generation: u64,
    ) -> Result<Option<Arc<PixelBuffer>>, DecodeError> {
        let key = tile.key();

        if let Some(hit) = self.memory.get(key).await {
            debug!(key = %key, "memory cache hit");
            return Ok(Some(hit));
        }

        // Composite tiles are always disk-eligible once a cache exists; they
        // cost sample x sample fetches to rebuild.
        let disk = match &self.disk {
            Some((disk, policy)) if tile.sample > 1 || policy.should_cache(tile.sample) => {
                Some(disk)
            }
            _ => None,
        };

        if let Some(disk) = disk {
            if let Some(buffer) = disk.get(key).await {
                debug!(key = %key, "disk cache hit");
                let image = Arc::new(buffer);
                self.memory.put(key.clone(), Arc::clone(&image)).await;
                return Ok(Some(image));
            }
        }

        if self.should_abort(generation) {
            return Ok(None);
        }

        let buffer = if tile.sample <= 1 {
            self.decode_single(tile, generation).await?
        } else {
            self.decode_composite(tile, generation).await?
        };
        let Some(buffer) = buffer else {
            return Ok(None);
        };

        if let Some(disk) = disk {
            disk.put(key, &buffer).await;
        }

        let image = Arc::new(buffer);
        self.memory.put(key.clone(), Arc::clone(&image)).await;
        Ok(Some(image))
    }

    async fn decode_single(
        &self,
        tile: &Tile,
        generation: u64,
    ) -> Result<Option<PixelBuffer>, DecodeError> {
        let bytes = self
            .source
            .fetch_tile(tile.column, tile.row, &tile.level.source)
            .await?;
        if self.should_abort(generation) {
            return Ok(None);
        }

        let image = image::load_from_memory(&bytes)?.into_rgba8();
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DecodeError::InvalidDimensions { width, height });
        }

        let mut buffer = match self.memory.acquire_reusable(width, height).await {
            Some(buffer) => buffer,
            None => PixelBuffer::try_new(width, height)?,
        };
        buffer.blit(&image, 0, 0);
        Ok(Some(buffer))
    }

    /// Assemble a composite tile from `sample x sample` base cells, each
    /// fetched at the level's native size and downscaled into its quadrant.
    async fn decode_composite(
        &self,
        tile: &Tile,
        generation: u64,
    ) -> Result<Option<PixelBuffer>, DecodeError> {
        let width = tile.level.tile_width;
        let height = tile.level.tile_height;
        let sample = tile.sample;
        let piece_w = (width / sample).max(1);
        let piece_h = (height / sample).max(1);

        let mut buffer = match self.memory.acquire_reusable(width, height).await {
            Some(buffer) => buffer,
            None => PixelBuffer::try_new(width, height)?,
        };

        for dy in 0..sample {
            for dx in 0..sample {
                if self.should_abort(generation) {
                    return Ok(None);
                }
                let column = tile.column + dx;
                let row = tile.row + dy;
                match self
                    .source
                    .fetch_tile(column, row, &tile.level.source)
                    .await
                {
                    Ok(bytes) => {
                        let image = image::load_from_memory(&bytes)?.into_rgba8();
                        let scaled = imageops::resize(&image, piece_w, piece_h, COMPOSITE_FILTER);
                        buffer.blit(&scaled, dx * piece_w, dy * piece_h);
                    }
                    // Base cells past the content edge simply leave their
                    // quadrant blank.
                    Err(SourceError::NotFound { .. }) => {
                        debug!(column, row, "composite sub-piece missing, leaving blank");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(Some(buffer))
    }
}

// =============================================================================
// Tests
// =============================================================================
