//! Engine facade.
//!
//! [`TileEngine`] ties the registry, grid computer, caches, scheduler and
//! compositor together behind the surface a viewer integrates against:
//! register detail levels, feed it viewport and scale changes, draw, and
//! listen for repaint/batch/error events.
//!
//! Viewport and scale changes are throttled: a burst of events inside one
//! throttle interval produces a single grid recomputation (a trailing one, so
//! the latest view state always wins). Pausing parks decode work without
//! losing it; destroying the engine is terminal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::cache::{DiskCache, DiskCachePolicy, MemoryCache};
use crate::compositor::{Compositor, RetainedTile, TileCanvas};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{DecodeErrorListener, DrawSurface, Listeners, RenderListener};
use crate::grid::{compute_grid, sample_for_scale, tile_bounds, Viewport};
use crate::level::{DetailLevel, DetailLevelRegistry};
use crate::scheduler::DecodeScheduler;
use crate::source::TileSource;
use crate::tile::TileKey;

struct ViewState {
    viewport: Option<Viewport>,
    scale: f64,
}

struct ThrottleState {
    last: Option<Instant>,
    /// A trailing recomputation is already scheduled.
    pending: bool,
}

// =============================================================================
// TileEngine
// =============================================================================

/// The top-level tile pyramid engine.
///
/// Construct with [`TileEngine::new`], register at least one detail level,
/// then drive it with [`set_viewport`](Self::set_viewport),
/// [`set_scale`](Self::set_scale) and [`draw`](Self::draw).
pub struct TileEngine {
    config: EngineConfig,
    extent: (u64, u64),

    registry: RwLock<DetailLevelRegistry>,
    memory: Arc<MemoryCache>,
    scheduler: Arc<DecodeScheduler>,
    compositor: Compositor,
    listeners: Arc<Listeners>,

    view: Mutex<ViewState>,
    throttle: Mutex<ThrottleState>,

    paused: AtomicBool,
    destroyed: AtomicBool,
}

impl TileEngine {
    /// Validate the configuration, open the disk cache if one is configured,
    /// and assemble the engine.
    pub async fn new(
        config: EngineConfig,
        source: Arc<dyn TileSource>,
    ) -> Result<Arc<Self>, EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;

        let disk = match (&config.disk_root, config.disk_policy) {
            (Some(root), policy) if policy != DiskCachePolicy::Never => {
                let cache = DiskCache::open(root.clone(), config.disk_budget).await?;
                info!(root = %root.display(), budget = config.disk_budget, "disk cache enabled");
                Some((Arc::new(cache), policy))
            }
            _ => None,
        };

        let memory = Arc::new(MemoryCache::with_budget(config.memory_budget));
        let listeners = Arc::new(Listeners::new());
        let scheduler = DecodeScheduler::new(
            source,
            Arc::clone(&memory),
            disk,
            config.worker_count(),
            config.max_attempts,
            Arc::clone(&listeners),
        );

        info!(
            width = config.content_width,
            height = config.content_height,
            workers = config.worker_count(),
            "tile engine created"
        );

        Ok(Arc::new(Self {
            extent: (config.content_width, config.content_height),
            registry: RwLock::new(DetailLevelRegistry::new(config.selection_policy)),
            memory,
            scheduler,
            compositor: Compositor::new(),
            listeners,
            view: Mutex::new(ViewState {
                viewport: None,
                scale: 1.0,
            }),
            throttle: Mutex::new(ThrottleState {
                last: None,
                pending: false,
            }),
            paused: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            config,
        }))
    }

    // -------------------------------------------------------------------------
    // Detail levels
    // -------------------------------------------------------------------------

    /// Register a pyramid layer. Returns `false` when a level at the same
    /// scale already exists.
    pub async fn register_detail_level(
        self: &Arc<Self>,
        scale: f64,
        tile_width: u32,
        tile_height: u32,
        source: impl Into<Arc<str>>,
    ) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }
        let registered = self
            .registry
            .write()
            .await
            .register(scale, tile_width, tile_height, source);
        if registered {
            debug!(scale, tile_width, tile_height, "detail level registered");
            self.schedule_recompute().await;
        }
        registered
    }

    /// The detail level currently selected for decoding, if any.
    pub async fn current_detail_level(&self) -> Option<DetailLevel> {
        self.registry.read().await.current().cloned()
    }

    /// Freeze level selection while an animated zoom gesture is running.
    pub async fn lock_detail_level(&self) {
        self.registry.write().await.lock();
    }

    /// Release the selection freeze and re-select for the current scale.
    pub async fn unlock_detail_level(self: &Arc<Self>) {
        self.registry.write().await.unlock();
        self.schedule_recompute().await;
    }

    pub async fn is_detail_level_locked(&self) -> bool {
        self.registry.read().await.is_locked()
    }

    // -------------------------------------------------------------------------
    // View state
    // -------------------------------------------------------------------------

    /// Update the visible viewport (unscaled content pixels) and schedule a
    /// throttled grid recomputation.
    pub async fn set_viewport(self: &Arc<Self>, viewport: Viewport) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        self.view.lock().await.viewport = Some(viewport);
        self.schedule_recompute().await;
    }

    /// Update the rendering scale and schedule a throttled grid
    /// recomputation. Non-positive scales are ignored.
    pub async fn set_scale(self: &Arc<Self>, scale: f64) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        if !(scale > 0.0) || !scale.is_finite() {
            warn!(scale, "ignoring non-positive scale");
            return;
        }
        self.view.lock().await.scale = scale;
        self.schedule_recompute().await;
    }

    /// The current rendering scale.
    pub async fn scale(&self) -> f64 {
        self.view.lock().await.scale
    }

    // -------------------------------------------------------------------------
    // Drawing
    // -------------------------------------------------------------------------

    /// Run one draw pass against the current view state.
    pub async fn draw(&self, canvas: &mut dyn TileCanvas) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let (viewport, scale) = {
            let view = self.view.lock().await;
            match view.viewport {
                Some(viewport) => (viewport, view.scale),
                None => return,
            }
        };
        let wanted = self.scheduler.wanted_tiles().await;
        self.compositor
            .compose(&wanted, &viewport, scale, self.extent, canvas)
            .await;
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Park decode work (e.g. the view went off screen). Wanted tiles and
    /// caches are kept.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            debug!("engine paused");
            self.scheduler.suppress();
        }
    }

    /// Release parked decode work and recompute for the current view.
    pub async fn resume(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        if self.paused.swap(false, Ordering::AcqRel) {
            debug!("engine resumed");
            self.scheduler.resume();
            self.schedule_recompute().await;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Tear the engine down: cancel decodes, release every tile and empty
    /// the caches. Terminal and idempotent; every subsequent call on the
    /// engine is a no-op.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("destroying tile engine");
        self.scheduler.shutdown();
        for tile in self.scheduler.clear_wanted().await {
            tile.destroy().await;
        }
        self.compositor.clear().await;
        self.memory.clear().await;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Listeners and recovery
    // -------------------------------------------------------------------------

    pub async fn set_draw_surface(&self, surface: Arc<dyn DrawSurface>) {
        self.listeners.set_surface(surface).await;
    }

    pub async fn add_render_listener(&self, listener: Arc<dyn RenderListener>) {
        self.listeners.add_render_listener(listener).await;
    }

    pub async fn add_decode_error_listener(&self, listener: Arc<dyn DecodeErrorListener>) {
        self.listeners.add_error_listener(listener).await;
    }

    /// Re-schedule a failed tile reported through the decode-error listener.
    /// Returns whether a decode was actually scheduled.
    pub async fn retry(&self, key: &TileKey) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }
        self.scheduler.retry(key).await
    }

    /// The in-memory tile cache (read-only access for instrumentation).
    pub fn memory_cache(&self) -> &Arc<MemoryCache> {
        &self.memory
    }

    // -------------------------------------------------------------------------
    // Grid recomputation
    // -------------------------------------------------------------------------

    /// Throttled entry point: recompute immediately when outside the
    /// throttle window, otherwise schedule one trailing recomputation that
    /// picks up the latest view state.
    async fn schedule_recompute(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let interval = self.config.recompute_throttle;

        let delay = {
            let mut throttle = self.throttle.lock().await;
            let now = Instant::now();
            match throttle.last {
                Some(last) if now.duration_since(last) < interval => {
                    if throttle.pending {
                        return;
                    }
                    throttle.pending = true;
                    Some(interval - now.duration_since(last))
                }
                _ => {
                    throttle.last = Some(now);
                    None
                }
            }
        };

        match delay {
            None => self.recompute().await,
            Some(delay) => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    sleep(delay).await;
                    {
                        let mut throttle = engine.throttle.lock().await;
                        throttle.pending = false;
                        throttle.last = Some(Instant::now());
                    }
                    engine.recompute().await;
                });
            }
        }
    }

    /// Recompute the wanted grid for the current view state and reconcile
    /// the scheduler against it. Removed tiles donate their images to the
    /// compositor's underlay before being released.
    async fn recompute(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }

        let (viewport, scale) = {
            let view = self.view.lock().await;
            match view.viewport {
                Some(viewport) => (viewport, view.scale),
                None => return,
            }
        };

        let (level, changed) = {
            let mut registry = self.registry.write().await;
            match registry.select_for_scale(scale) {
                Some((level, changed)) => (level.clone(), changed),
                None => return,
            }
        };

        if changed {
            debug!(level_scale = level.scale, scale, "detail level switched");
            self.scheduler.invalidate();
        }

        let sample = sample_for_scale(&level, scale);
        let padded = viewport.padded(self.config.viewport_padding);
        let cells = compute_grid(&padded, &level, sample, self.extent);
        debug!(
            tiles = cells.len(),
            sample,
            level_scale = level.scale,
            "grid recomputed"
        );

        let removed = self.scheduler.reconcile(&cells, &level).await;
        for tile in removed {
            if let Some(image) = tile.image().await {
                let bounds =
                    tile_bounds(tile.column, tile.row, tile.sample, &tile.level, self.extent);
                self.compositor.retain(RetainedTile { image, bounds }).await;
            }
            // The image stays cached, so a tile scrolling back into view is
            // a decode-free cache hit.
            if let Some(image) = tile.destroy().await {
                self.memory.put(tile.key().clone(), image).await;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use image::RgbaImage;

    use crate::error::SourceError;

    struct CountingSource {
        fetches: AtomicUsize,
    }

    impl CountingSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TileSource for CountingSource {
        async fn fetch_tile(
            &self,
            _column: u32,
            _row: u32,
            _source: &str,
        ) -> Result<Bytes, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let img = RgbaImage::from_pixel(8, 8, image::Rgba([7, 7, 7, 255]));
            let mut out = Vec::new();
            img.write_to(
                &mut std::io::Cursor::new(&mut out),
                image::ImageFormat::Png,
            )
            .map_err(|e| SourceError::Other(e.to_string()))?;
            Ok(Bytes::from(out))
        }
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::new(64, 64);
        config.workers = 2;
        config.viewport_padding = 0;
        config.recompute_throttle = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = EngineConfig::new(0, 64);
        let result = TileEngine::new(config, CountingSource::new()).await;
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_duplicate_level_rejected() {
        let engine = TileEngine::new(fast_config(), CountingSource::new())
            .await
            .unwrap();
        assert!(engine.register_detail_level(1.0, 8, 8, "full").await);
        assert!(!engine.register_detail_level(1.0, 16, 16, "dup").await);
    }

    #[tokio::test]
    async fn test_viewport_burst_coalesces_recomputes() {
        let source = CountingSource::new();
        let engine = TileEngine::new(fast_config(), source.clone())
            .await
            .unwrap();
        engine.register_detail_level(1.0, 8, 8, "full").await;

        // A burst of viewport updates inside one throttle window: the first
        // recomputes immediately, the rest coalesce into one trailing pass.
        for i in 0..10 {
            engine.set_viewport(Viewport::new(i, 0, i + 8, 8)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 64x64 content of 8px tiles: never more than the viewport needs,
        // far fewer than ten bursts' worth.
        assert!(source.fetches.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_destroy_is_terminal() {
        let source = CountingSource::new();
        let engine = TileEngine::new(fast_config(), source.clone())
            .await
            .unwrap();
        engine.register_detail_level(1.0, 8, 8, "full").await;

        engine.destroy().await;
        assert!(engine.is_destroyed());
        assert!(engine.memory_cache().is_empty().await);

        // Every call after destruction is a no-op.
        engine.destroy().await;
        engine.set_viewport(Viewport::new(0, 0, 8, 8)).await;
        engine.set_scale(0.5).await;
        assert!(!engine.register_detail_level(0.5, 8, 8, "half").await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let source = CountingSource::new();
        let engine = TileEngine::new(fast_config(), source.clone())
            .await
            .unwrap();
        engine.register_detail_level(1.0, 8, 8, "full").await;

        engine.pause();
        assert!(engine.is_paused());
        engine.set_viewport(Viewport::new(0, 0, 8, 8)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);

        engine.resume().await;
        assert!(!engine.is_paused());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(source.fetches.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_invalid_scale_ignored() {
        let engine = TileEngine::new(fast_config(), CountingSource::new())
            .await
            .unwrap();
        engine.set_scale(0.0).await;
        engine.set_scale(-1.0).await;
        engine.set_scale(f64::NAN).await;
        assert_eq!(engine.scale().await, 1.0);
    }
}
