//! Draw-pass compositing.
//!
//! During a zoom or pan transition the freshly wanted tiles are still
//! decoding, so drawing only them would flash background through the gaps.
//! The compositor keeps the previously decoded tiles (from a prior detail
//! level or prior viewport) and, on every draw pass, computes the "unfilled
//! region" — the scaled viewport minus the bounding rectangles of all
//! currently decoded wanted tiles. Retained tiles that no longer intersect
//! that region are fully occluded and retired; the rest are drawn first,
//! beneath the fresh tiles, so the viewport never shows a hole.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::grid::{tile_bounds, Rect, Viewport};
use crate::tile::{PixelBuffer, Tile};

// =============================================================================
// TileCanvas
// =============================================================================

/// The drawing contract the engine produces to.
///
/// `dest` is in scaled (on-screen) pixels; the image should be stretched to
/// fill it. Implemented by the host's drawing surface, not by this crate.
pub trait TileCanvas {
    fn draw_tile(&mut self, image: &Arc<PixelBuffer>, dest: Rect);
}

// =============================================================================
// Retained tiles
// =============================================================================

/// A previously decoded tile kept alive to paper over gaps while the fresh
/// tile set completes. Bounds are in unscaled content pixels.
#[derive(Debug, Clone)]
pub struct RetainedTile {
    pub image: Arc<PixelBuffer>,
    pub bounds: Rect,
}

// =============================================================================
// Compositor
// =============================================================================

/// Decides which stale tiles must still be drawn beneath fresh ones, and
/// retires them once they are fully occluded.
pub struct Compositor {
    retained: Mutex<Vec<RetainedTile>>,
}

impl Compositor {
    pub fn new() -> Self {
        Self {
            retained: Mutex::new(Vec::new()),
        }
    }

    /// Keep a decoded tile from a replaced grid as underlay for upcoming
    /// draw passes.
    pub async fn retain(&self, tile: RetainedTile) {
        if tile.bounds.is_empty() {
            return;
        }
        let mut retained = self.retained.lock().await;
        // A replaced grid can re-retain the same cell; keep the newest.
        retained.retain(|t| t.bounds != tile.bounds);
        retained.push(tile);
    }

    /// Number of retained underlay tiles.
    pub async fn retained_count(&self) -> usize {
        self.retained.lock().await.len()
    }

    /// Drop every retained tile.
    pub async fn clear(&self) {
        self.retained.lock().await.clear();
    }

    /// Run one draw pass.
    ///
    /// Fresh (decoded, wanted) tiles are drawn last; retained tiles that
    /// still intersect the unfilled region are drawn beneath them; retained
    /// tiles that do not are discarded. Once the fresh set fully covers the
    /// viewport the retained set is cleared.
    pub async fn compose(
        &self,
        wanted: &[Arc<Tile>],
        viewport: &Viewport,
        scale: f64,
        extent: (u64, u64),
        canvas: &mut dyn TileCanvas,
    ) {
        let scaled_viewport = viewport.rect().clamped(extent.0, extent.1).scaled(scale);
        if scaled_viewport.is_empty() {
            return;
        }

        // Fresh layer: every decoded wanted tile with its on-screen rect.
        let mut fresh: Vec<(Arc<PixelBuffer>, Rect)> = Vec::new();
        for tile in wanted {
            if let Some(image) = tile.image().await {
                let bounds = tile_bounds(tile.column, tile.row, tile.sample, &tile.level, extent);
                fresh.push((image, bounds.scaled(scale)));
            }
        }

        // Unfilled region: scaled viewport minus the fresh rectangles.
        let mut unfilled = vec![scaled_viewport];
        for (_, rect) in &fresh {
            unfilled = unfilled.iter().flat_map(|r| r.subtract(rect)).collect();
            if unfilled.is_empty() {
                break;
            }
        }

        let mut retained = self.retained.lock().await;
        if unfilled.is_empty() {
            if !retained.is_empty() {
                debug!(count = retained.len(), "viewport covered, retiring stale tiles");
                retained.clear();
            }
        } else {
            let before = retained.len();
            retained.retain(|tile| {
                let dest = tile.bounds.scaled(scale);
                unfilled.iter().any(|gap| dest.intersects(gap))
            });
            if retained.len() < before {
                debug!(retired = before - retained.len(), "retiring occluded stale tiles");
            }
            for tile in retained.iter() {
                canvas.draw_tile(&tile.image, tile.bounds.scaled(scale));
            }
        }
        drop(retained);

        for (image, dest) in &fresh {
            canvas.draw_tile(image, *dest);
        }
    }
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
