//! Detail level registry and selection.
//!
//! A deep-zoom pyramid is registered as an ordered set of detail levels, one
//! per native tile scale. For every requested zoom the registry selects the
//! level to decode from, using a pluggable policy, and can be locked so the
//! selection stays frozen while an animated zoom gesture is in progress
//! (detail levels must not thrash mid-animation).
//!
//! Levels are identified by their scale: registering the same scale twice is
//! a no-op.

use std::sync::Arc;

// =============================================================================
// DetailLevel
// =============================================================================

/// One registered pyramid layer.
///
/// Immutable once registered. Identity is the scale at which this level's
/// tiles are natively sized: `scale == 1.0` is full resolution, `0.5` is a
/// half-resolution layer, and so on.
#[derive(Debug, Clone)]
pub struct DetailLevel {
    /// Native scale of this level's tiles relative to full resolution.
    pub scale: f64,

    /// Tile width in pixels at this level's native scale.
    pub tile_width: u32,

    /// Tile height in pixels at this level's native scale.
    pub tile_height: u32,

    /// Opaque per-level data handed to the byte supplier to build tile
    /// identifiers (e.g. a URL template or directory name).
    pub source: Arc<str>,
}

impl DetailLevel {
    /// Create a new detail level.
    pub fn new(scale: f64, tile_width: u32, tile_height: u32, source: impl Into<Arc<str>>) -> Self {
        Self {
            scale,
            tile_width,
            tile_height,
            source: source.into(),
        }
    }
}

impl PartialEq for DetailLevel {
    fn eq(&self, other: &Self) -> bool {
        self.scale.to_bits() == other.scale.to_bits()
    }
}

impl Eq for DetailLevel {}

// =============================================================================
// Selection Policy
// =============================================================================

/// How [`DetailLevelRegistry::select_for_scale`] maps a requested scale to a
/// registered level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// The level with the greatest scale not exceeding the request; when no
    /// such level exists, the smallest registered scale.
    #[default]
    AtOrBelow,

    /// The level whose scale is numerically closest to the request.
    Closest,

    /// Each level owns the scale range `[its scale, next level's scale)`;
    /// the most detailed level owns everything above its scale, the least
    /// detailed everything below. A request exactly on a boundary selects
    /// the level whose own scale it equals (inclusive lower bound).
    Ranged,
}

/// Number of power-of-two zoom steps between full resolution and the given
/// scale: `ceil(log2(1/scale))`, clamped at zero for scales >= 1.
pub fn zoom_for_scale(scale: f64) -> u32 {
    if scale >= 1.0 || scale <= 0.0 {
        return 0;
    }
    (1.0 / scale).log2().ceil() as u32
}

// =============================================================================
// DetailLevelRegistry
// =============================================================================

/// Ordered, de-duplicated collection of detail levels plus the currently
/// selected level and a lock flag.
///
/// The registry itself is plain data; the engine facade wraps it in a lock
/// and reacts to selection changes by invalidating the current render pass.
#[derive(Debug)]
pub struct DetailLevelRegistry {
    /// Registered levels, sorted by scale ascending.
    levels: Vec<DetailLevel>,

    /// Index of the currently selected level, if any selection happened yet.
    selected: Option<usize>,

    /// While locked, `select_for_scale` returns the previous selection
    /// regardless of input.
    locked: bool,

    policy: SelectionPolicy,
}

impl DetailLevelRegistry {
    /// Create an empty registry with the given selection policy.
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            levels: Vec::new(),
            selected: None,
            locked: false,
            policy,
        }
    }

    /// Register a detail level, keeping the set sorted by scale.
    ///
    /// Returns `false` (and changes nothing) when a level with the exact same
    /// scale is already registered.
    pub fn register(
        &mut self,
        scale: f64,
        tile_width: u32,
        tile_height: u32,
        source: impl Into<Arc<str>>,
    ) -> bool {
        if self
            .levels
            .iter()
            .any(|l| l.scale.to_bits() == scale.to_bits())
        {
            return false;
        }

        let level = DetailLevel::new(scale, tile_width, tile_height, source);
        let pos = self
            .levels
            .partition_point(|l| l.scale < level.scale);

        // Keep the selected index pointing at the same level across inserts.
        if let Some(sel) = self.selected {
            if pos <= sel {
                self.selected = Some(sel + 1);
            }
        }

        self.levels.insert(pos, level);
        true
    }

    /// All registered levels, sorted by scale ascending.
    pub fn levels(&self) -> &[DetailLevel] {
        &self.levels
    }

    /// The currently selected level, if a selection has been made.
    pub fn current(&self) -> Option<&DetailLevel> {
        self.selected.map(|i| &self.levels[i])
    }

    /// Freeze the current selection. While locked, `select_for_scale`
    /// returns the previously selected level regardless of the requested
    /// scale.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Release the selection lock.
    pub fn unlock(&mut self) {
        self.locked = false;
    }

    /// Whether the selection is currently frozen.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Select the best level for the requested scale.
    ///
    /// Returns the selected level and whether the selection changed; a change
    /// must invalidate the scheduler's current render pass. While locked the
    /// previous selection is returned unchanged (provided one exists).
    pub fn select_for_scale(&mut self, scale: f64) -> Option<(&DetailLevel, bool)> {
        if self.levels.is_empty() {
            return None;
        }

        if self.locked {
            if let Some(i) = self.selected {
                return Some((&self.levels[i], false));
            }
        }

        let index = match self.policy {
            SelectionPolicy::AtOrBelow | SelectionPolicy::Ranged => {
                // Greatest scale <= requested; both policies resolve an exact
                // boundary hit to the level owning that scale.
                let above = self.levels.partition_point(|l| l.scale <= scale);
                above.saturating_sub(1)
            }
            SelectionPolicy::Closest => {
                let mut best = 0;
                let mut best_dist = f64::INFINITY;
                for (i, level) in self.levels.iter().enumerate() {
                    let dist = (level.scale - scale).abs();
                    if dist < best_dist {
                        best = i;
                        best_dist = dist;
                    }
                }
                best
            }
        };

        let changed = self.selected != Some(index);
        self.selected = Some(index);
        Some((&self.levels[index], changed))
    }
}

impl Default for DetailLevelRegistry {
    fn default() -> Self {
        Self::new(SelectionPolicy::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
