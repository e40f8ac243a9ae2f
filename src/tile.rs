//! Tile values, identity and decode state.
//!
//! A [`Tile`] describes one grid cell: its column, row, power-of-two sampling
//! factor and the detail level it belongs to, plus mutable decode state and a
//! reference to decoded pixel data. Two tiles describing the same cell are
//! interchangeable — identity is `(column, row, sample, level scale)` and the
//! derived [`TileKey`] is stable for the tile's lifetime.
//!
//! # State machine
//!
//! ```text
//! IDLE ──try_begin_decode──▶ DECODING ──complete_decode──▶ DECODED
//!  ▲                            │                            │
//!  └────────abort_decode────────┘                            │
//!  ◀──────────────────────────destroy────────────────────────┘
//! ```
//!
//! `IDLE -> DECODING` is a guarded compare-and-swap, so at most one worker
//! ever decodes a given tile. A decode completing after the tile was
//! destroyed observes the failed swap and discards its result instead of
//! storing a stale buffer.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use tokio::sync::RwLock;

use crate::error::DecodeError;
use crate::grid::GridCell;
use crate::level::DetailLevel;

/// Bytes per RGBA pixel.
pub const BYTES_PER_PIXEL: usize = 4;

// =============================================================================
// TileKey
// =============================================================================

/// Deterministic identity of a tile: `(column, row, sample, level scale)`.
///
/// The `Display` form is the cache-key string shared by the memory and disk
/// caches.
#[derive(Debug, Clone)]
pub struct TileKey {
    pub column: u32,
    pub row: u32,
    pub sample: u32,
    scale_bits: u64,
}

impl TileKey {
    pub fn new(column: u32, row: u32, sample: u32, scale: f64) -> Self {
        Self {
            column,
            row,
            sample,
            scale_bits: scale.to_bits(),
        }
    }

    /// The level scale this key was derived from.
    pub fn scale(&self) -> f64 {
        f64::from_bits(self.scale_bits)
    }
}

impl PartialEq for TileKey {
    fn eq(&self, other: &Self) -> bool {
        self.column == other.column
            && self.row == other.row
            && self.sample == other.sample
            && self.scale_bits == other.scale_bits
    }
}

impl Eq for TileKey {}

impl Hash for TileKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.column.hash(state);
        self.row.hash(state);
        self.sample.hash(state);
        self.scale_bits.hash(state);
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "z{:016x}_m{}_{}x{}",
            self.scale_bits, self.sample, self.column, self.row
        )
    }
}

// =============================================================================
// PixelBuffer
// =============================================================================

/// A decoded RGBA8 image with a reusable backing allocation.
///
/// Byte accounting uses the backing capacity rather than the logical
/// dimensions: a buffer recycled into a smaller tile still occupies its full
/// allocation.
#[derive(Debug)]
pub struct PixelBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl PixelBuffer {
    /// Allocate a zeroed buffer, failing softly when the allocation cannot be
    /// satisfied (the scheduler treats this as a transient decode failure).
    pub fn try_new(width: u32, height: u32) -> Result<Self, DecodeError> {
        let mut buffer = Self {
            data: Vec::new(),
            width: 0,
            height: 0,
        };
        buffer.reset_for(width, height)?;
        Ok(buffer)
    }

    /// Take ownership of a decoded image's pixels.
    pub fn from_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
        }
    }

    /// Wrap raw RGBA8 bytes, validating the length against the dimensions.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != width as usize * height as usize * BYTES_PER_PIXEL {
            return None;
        }
        Some(Self {
            data,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA8 pixel data, row-major, `width * height * 4` bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of the backing allocation in bytes.
    pub fn byte_size(&self) -> usize {
        self.data.capacity().max(self.data.len())
    }

    /// Whether the backing allocation can hold a `width x height` image
    /// without growing.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.data.capacity() >= width as usize * height as usize * BYTES_PER_PIXEL
    }

    /// Clear the pixel contents and resize for a new decode, reusing the
    /// existing allocation where possible.
    pub fn reset_for(&mut self, width: u32, height: u32) -> Result<(), DecodeError> {
        let len = width as usize * height as usize * BYTES_PER_PIXEL;
        self.data.clear();
        if len > self.data.capacity() {
            self.data
                .try_reserve_exact(len - self.data.capacity())
                .map_err(|_| DecodeError::Allocation { requested: len })?;
        }
        self.data.resize(len, 0);
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Copy a decoded image into this buffer at `(dst_x, dst_y)`.
    ///
    /// Rows falling outside the buffer are clipped; used by composite decode
    /// to patch each sub-piece into its quadrant.
    pub fn blit(&mut self, image: &RgbaImage, dst_x: u32, dst_y: u32) {
        let (src_w, src_h) = image.dimensions();
        let copy_w = src_w.min(self.width.saturating_sub(dst_x)) as usize;
        let copy_h = src_h.min(self.height.saturating_sub(dst_y)) as usize;
        if copy_w == 0 || copy_h == 0 {
            return;
        }

        let src = image.as_raw();
        let dst_stride = self.width as usize * BYTES_PER_PIXEL;
        let src_stride = src_w as usize * BYTES_PER_PIXEL;
        let row_bytes = copy_w * BYTES_PER_PIXEL;

        for row in 0..copy_h {
            let src_off = row * src_stride;
            let dst_off = (dst_y as usize + row) * dst_stride + dst_x as usize * BYTES_PER_PIXEL;
            self.data[dst_off..dst_off + row_bytes]
                .copy_from_slice(&src[src_off..src_off + row_bytes]);
        }
    }
}

// =============================================================================
// Tile State
// =============================================================================

const STATE_IDLE: u8 = 0;
const STATE_DECODING: u8 = 1;
const STATE_DECODED: u8 = 2;

/// Decode state of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Idle,
    Decoding,
    Decoded,
}

impl TileState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_DECODING => TileState::Decoding,
            STATE_DECODED => TileState::Decoded,
            _ => TileState::Idle,
        }
    }
}

// =============================================================================
// Tile
// =============================================================================

/// One grid cell with decode state and (once decoded) pixel data.
///
/// Shared between the control path (which creates and destroys tiles) and the
/// single worker decoding it; the state guards below resolve races on the
/// decode outcome.
#[derive(Debug)]
pub struct Tile {
    pub column: u32,
    pub row: u32,
    pub sample: u32,
    pub level: DetailLevel,

    key: TileKey,
    state: AtomicU8,
    image: RwLock<Option<Arc<PixelBuffer>>>,

    /// Decode attempts so far; consulted by the facade's bounded retry.
    attempts: AtomicU32,
}

impl Tile {
    pub fn new(cell: GridCell, level: DetailLevel) -> Self {
        let key = TileKey::new(cell.column, cell.row, cell.sample, level.scale);
        Self {
            column: cell.column,
            row: cell.row,
            sample: cell.sample,
            level,
            key,
            state: AtomicU8::new(STATE_IDLE),
            image: RwLock::new(None),
            attempts: AtomicU32::new(0),
        }
    }

    /// The stable cache key for this tile.
    pub fn key(&self) -> &TileKey {
        &self.key
    }

    pub fn state(&self) -> TileState {
        TileState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_decoded(&self) -> bool {
        self.state() == TileState::Decoded
    }

    /// Guarded `IDLE -> DECODING` transition. Returns `false` (decode is a
    /// no-op) when the tile is already decoding or decoded.
    pub fn try_begin_decode(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_IDLE,
                STATE_DECODING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Store a decode result: `DECODING -> DECODED`.
    ///
    /// Returns `false` when the tile is no longer decoding (it was destroyed
    /// mid-flight); the caller must discard the result for this tile.
    pub async fn complete_decode(&self, image: Arc<PixelBuffer>) -> bool {
        let mut slot = self.image.write().await;
        let swapped = self
            .state
            .compare_exchange(
                STATE_DECODING,
                STATE_DECODED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if swapped {
            *slot = Some(image);
        }
        swapped
    }

    /// Failure path: `DECODING -> IDLE` so the tile can be retried.
    pub fn abort_decode(&self) {
        let _ = self.state.compare_exchange(
            STATE_DECODING,
            STATE_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Release the tile: reset to IDLE and hand back the image reference so
    /// the caller can return it to the memory cache. Idempotent.
    pub async fn destroy(&self) -> Option<Arc<PixelBuffer>> {
        let mut slot = self.image.write().await;
        self.state.store(STATE_IDLE, Ordering::Release);
        slot.take()
    }

    /// The decoded image, if this tile has completed a decode.
    pub async fn image(&self) -> Option<Arc<PixelBuffer>> {
        self.image.read().await.clone()
    }

    /// Record a decode attempt, returning the new attempt count.
    pub fn record_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl PartialEq for Tile {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Tile {}

impl Hash for Tile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

// =============================================================================
// Tests
// =============================================================================
