//! Engine configuration.
//!
//! This module provides the configuration for a [`TileEngine`](crate::engine::TileEngine):
//! content dimensions, cache budgets, worker pool sizing, viewport padding
//! and recompute throttling, with sensible defaults for everything except
//! the content extent.
//!
//! # Example
//!
//! ```
//! use tilevista::config::EngineConfig;
//!
//! let config = EngineConfig::new(46920, 33600);
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::{DiskCachePolicy, DEFAULT_MEMORY_BUDGET};
use crate::level::SelectionPolicy;

// =============================================================================
// Default Values
// =============================================================================

/// Default disk cache budget: 256MB of tile blobs.
pub const DEFAULT_DISK_BUDGET: u64 = 256 * 1024 * 1024;

/// Default viewport padding in content pixels.
///
/// Tiles inside the padded margin begin decoding slightly before they scroll
/// into view.
pub const DEFAULT_VIEWPORT_PADDING: u32 = 128;

/// Default throttle interval for viewport-driven grid recomputation.
///
/// A burst of scroll/scale events inside one interval produces a single
/// recomputation, not one per event.
pub const DEFAULT_RECOMPUTE_THROTTLE: Duration = Duration::from_millis(50);

/// Default number of decode attempts per tile (initial try + retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// =============================================================================
// Engine Configuration
// =============================================================================

/// Configuration for a tile engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Full-resolution content width in unscaled pixels.
    pub content_width: u64,

    /// Full-resolution content height in unscaled pixels.
    pub content_height: u64,

    /// Memory cache budget in bytes (decoded pixel buffers).
    pub memory_budget: usize,

    /// Number of decode workers. `0` means available hardware parallelism.
    pub workers: usize,

    /// Margin added to every viewport before grid computation, in unscaled
    /// content pixels.
    pub viewport_padding: u32,

    /// Minimum interval between viewport-driven grid recomputations.
    pub recompute_throttle: Duration,

    /// Maximum decode attempts per tile before a failure becomes permanent
    /// for that tile (until it leaves and re-enters the wanted set).
    pub max_attempts: u32,

    /// Detail level selection policy.
    pub selection_policy: SelectionPolicy,

    /// Disk cache policy.
    pub disk_policy: DiskCachePolicy,

    /// Root directory for the disk cache. Required unless `disk_policy` is
    /// [`DiskCachePolicy::Never`].
    pub disk_root: Option<PathBuf>,

    /// Disk cache budget in bytes.
    pub disk_budget: u64,
}

impl EngineConfig {
    /// Create a configuration for the given content extent with defaults for
    /// everything else (no disk cache).
    pub fn new(content_width: u64, content_height: u64) -> Self {
        Self {
            content_width,
            content_height,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            workers: 0,
            viewport_padding: DEFAULT_VIEWPORT_PADDING,
            recompute_throttle: DEFAULT_RECOMPUTE_THROTTLE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            selection_policy: SelectionPolicy::AtOrBelow,
            disk_policy: DiskCachePolicy::Never,
            disk_root: None,
            disk_budget: DEFAULT_DISK_BUDGET,
        }
    }

    /// Enable the disk cache with the given root directory and policy.
    pub fn with_disk_cache(mut self, root: impl Into<PathBuf>, policy: DiskCachePolicy) -> Self {
        self.disk_root = Some(root.into());
        self.disk_policy = policy;
        self
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.content_width == 0 || self.content_height == 0 {
            return Err("content dimensions must be greater than 0".to_string());
        }

        if self.memory_budget == 0 {
            return Err("memory_budget must be greater than 0".to_string());
        }

        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }

        if self.disk_policy != DiskCachePolicy::Never {
            if self.disk_root.is_none() {
                return Err(
                    "disk cache is enabled but no disk_root provided. \
                     Set disk_root or use DiskCachePolicy::Never"
                        .to_string(),
                );
            }
            if self.disk_budget == 0 {
                return Err("disk_budget must be greater than 0".to_string());
            }
        }

        Ok(())
    }

    /// Resolve the decode worker count, falling back to available hardware
    /// parallelism when unset.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EngineConfig {
        EngineConfig::new(4096, 4096)
    }

    #[test]
    fn test_valid_config() {
        let config = test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_extent() {
        let mut config = test_config();
        config.content_width = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.content_height = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_memory_budget() {
        let mut config = test_config();
        config.memory_budget = 0;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("memory_budget"));
    }

    #[test]
    fn test_zero_max_attempts() {
        let mut config = test_config();
        config.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disk_policy_requires_root() {
        let mut config = test_config();
        config.disk_policy = DiskCachePolicy::All;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("disk_root"));

        let config = test_config().with_disk_cache("/tmp/tiles", DiskCachePolicy::All);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_disk_budget_checked_when_enabled() {
        let mut config = test_config().with_disk_cache("/tmp/tiles", DiskCachePolicy::All);
        config.disk_budget = 0;
        assert!(config.validate().is_err());

        // Irrelevant when the disk cache is off.
        let mut config = test_config();
        config.disk_budget = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_count_fallback() {
        let mut config = test_config();
        config.workers = 3;
        assert_eq!(config.worker_count(), 3);

        config.workers = 0;
        assert!(config.worker_count() >= 1);
    }
}
