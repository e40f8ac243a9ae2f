//! Viewport grid computation.
//!
//! Given a viewport rectangle, a detail level and a sampling step, this
//! module derives the integer row/column ranges of the tiles intersecting the
//! viewport. All coordinates are unscaled content pixels: a tile from a level
//! at scale `s` covers `tile_width / s` content pixels per axis, so grid math
//! is pure floor/ceil division once the viewport is clamped to the content
//! extent.
//!
//! When no detail level is registered at or below the requested scale, the
//! grid is enumerated with a power-of-two sampling step: `sample x sample`
//! base cells collapse into one composite drawn tile, stepping the column and
//! row ranges by `sample` so each composite cell appears exactly once.

use crate::level::{zoom_for_scale, DetailLevel};

// =============================================================================
// Rect
// =============================================================================

/// An axis-aligned rectangle in content pixels, inclusive-exclusive on both
/// axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl Rect {
    pub fn new(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i64 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.bottom - self.top).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }

    /// The overlapping region of two rectangles, or `None` when disjoint.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let r = Rect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        );
        if r.is_empty() {
            None
        } else {
            Some(r)
        }
    }

    /// Clamp this rectangle to `[0, width] x [0, height]`.
    pub fn clamped(&self, width: u64, height: u64) -> Rect {
        Rect::new(
            self.left.clamp(0, width as i64),
            self.top.clamp(0, height as i64),
            self.right.clamp(0, width as i64),
            self.bottom.clamp(0, height as i64),
        )
    }

    /// Scale all edges by `factor`, rounding outward so the scaled rectangle
    /// covers at least the original area.
    pub fn scaled(&self, factor: f64) -> Rect {
        Rect::new(
            (self.left as f64 * factor).floor() as i64,
            (self.top as f64 * factor).floor() as i64,
            (self.right as f64 * factor).ceil() as i64,
            (self.bottom as f64 * factor).ceil() as i64,
        )
    }

    /// Subtract `other` from this rectangle, returning the up-to-four
    /// rectangles covering the remainder.
    pub fn subtract(&self, other: &Rect) -> Vec<Rect> {
        let Some(overlap) = self.intersection(other) else {
            return vec![*self];
        };

        let mut parts = Vec::with_capacity(4);

        // Band above and below the overlap, full width.
        if overlap.top > self.top {
            parts.push(Rect::new(self.left, self.top, self.right, overlap.top));
        }
        if overlap.bottom < self.bottom {
            parts.push(Rect::new(
                self.left,
                overlap.bottom,
                self.right,
                self.bottom,
            ));
        }
        // Left and right slivers, limited to the overlap's vertical span.
        if overlap.left > self.left {
            parts.push(Rect::new(self.left, overlap.top, overlap.left, overlap.bottom));
        }
        if overlap.right < self.right {
            parts.push(Rect::new(
                overlap.right,
                overlap.top,
                self.right,
                overlap.bottom,
            ));
        }

        parts
    }
}

// =============================================================================
// Viewport
// =============================================================================

/// The currently visible window into the content, in unscaled content pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl Viewport {
    pub fn new(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Expand the viewport by `margin` on every side, so tiles begin decoding
    /// slightly before they scroll into view.
    pub fn padded(&self, margin: u32) -> Viewport {
        let m = margin as i64;
        Viewport::new(self.left - m, self.top - m, self.right + m, self.bottom + m)
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.left, self.top, self.right, self.bottom)
    }
}

// =============================================================================
// Grid computation
// =============================================================================

/// One cell of a computed grid: a tile position at a sampling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridCell {
    pub column: u32,
    pub row: u32,
    pub sample: u32,
}

/// Derive the power-of-two sampling step for rendering `scale` from `level`.
///
/// `1` when the level natively covers the requested scale (it was registered
/// at or below it); otherwise one composite tile merges
/// `2^(zoom(scale) - zoom(level.scale))` base cells per axis, producing the
/// degraded patchwork expected when zooming out past the least detailed
/// registered level.
pub fn sample_for_scale(level: &DetailLevel, scale: f64) -> u32 {
    if scale >= level.scale {
        return 1;
    }
    let delta = zoom_for_scale(scale).saturating_sub(zoom_for_scale(level.scale));
    1u32 << delta.min(31)
}

/// Content pixels covered per axis by one base cell of `level`.
fn cell_size(level: &DetailLevel) -> (f64, f64) {
    (
        level.tile_width as f64 / level.scale,
        level.tile_height as f64 / level.scale,
    )
}

/// Compute the grid cells whose tiles intersect the viewport.
///
/// The viewport is clamped to `[0, extent]` first; ranges are derived with
/// floor/ceil division and stepped by `sample`, so composite cells are
/// enumerated once per composite rather than once per base cell. Every
/// returned cell's bounds intersect the clamped viewport, and together they
/// cover it.
pub fn compute_grid(
    viewport: &Viewport,
    level: &DetailLevel,
    sample: u32,
    extent: (u64, u64),
) -> Vec<GridCell> {
    let clamped = viewport.rect().clamped(extent.0, extent.1);
    if clamped.is_empty() {
        return Vec::new();
    }

    let (cell_w, cell_h) = cell_size(level);
    let sample = sample.max(1);

    let max_col = (extent.0 as f64 / cell_w).ceil() as i64;
    let max_row = (extent.1 as f64 / cell_h).ceil() as i64;

    let first_col = (clamped.left as f64 / cell_w).floor() as i64;
    let end_col = ((clamped.right as f64 / cell_w).ceil() as i64).min(max_col);
    let first_row = (clamped.top as f64 / cell_h).floor() as i64;
    let end_row = ((clamped.bottom as f64 / cell_h).ceil() as i64).min(max_row);

    // Snap starts down to the sampling step so composite cells stay aligned
    // to the base grid.
    let step = sample as i64;
    let first_col = first_col - first_col.rem_euclid(step);
    let first_row = first_row - first_row.rem_euclid(step);

    let mut cells = Vec::new();
    let mut row = first_row.max(0);
    while row < end_row {
        let mut col = first_col.max(0);
        while col < end_col {
            cells.push(GridCell {
                column: col as u32,
                row: row as u32,
                sample,
            });
            col += step;
        }
        row += step;
    }
    cells
}

/// Bounding rectangle of a tile in content pixels, clamped to the extent so
/// edge tiles report only the area they actually cover.
pub fn tile_bounds(
    column: u32,
    row: u32,
    sample: u32,
    level: &DetailLevel,
    extent: (u64, u64),
) -> Rect {
    let (cell_w, cell_h) = cell_size(level);
    let sample = sample.max(1) as f64;

    let left = (column as f64 * cell_w).floor() as i64;
    let top = (row as f64 * cell_h).floor() as i64;
    let right = ((column as f64 + sample) * cell_w).ceil() as i64;
    let bottom = ((row as f64 + sample) * cell_h).ceil() as i64;

    Rect::new(
        left,
        top,
        right.min(extent.0 as i64),
        bottom.min(extent.1 as i64),
    )
}

// =============================================================================
// Tests
// =============================================================================
