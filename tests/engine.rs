//! End-to-end engine tests: a synthetic pyramid served from memory, driven
//! through the public facade the way a viewer would drive it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::RgbaImage;
use tokio::sync::Mutex;

use tilevista::{
    DecodeError, DecodeErrorListener, DiskCachePolicy, DrawSurface, EngineConfig, PixelBuffer,
    Rect, RenderListener, SourceError, TileCanvas, TileEngine, TileKey, TileSource, Viewport,
};

const TILE_SIDE: u32 = 8;
const CONTENT: u64 = 64;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Serves lossless PNG tiles colored by `(level source, column, row)`, so a
/// drawn pixel identifies exactly which tile produced it.
struct PyramidSource {
    fetches: AtomicUsize,
    fail: AtomicBool,
    extent_tiles: HashMap<String, u32>,
}

impl PyramidSource {
    fn new(levels: &[(&str, u32)]) -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            extent_tiles: levels
                .iter()
                .map(|(name, tiles)| (name.to_string(), *tiles))
                .collect(),
        })
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn color_for(source: &str, column: u32, row: u32) -> [u8; 4] {
        let level_tag = match source {
            "full" => 100,
            "half" => 200,
            _ => 50,
        };
        [level_tag, column as u8 + 1, row as u8 + 1, 255]
    }
}

#[async_trait]
impl TileSource for PyramidSource {
    async fn fetch_tile(&self, column: u32, row: u32, source: &str) -> Result<Bytes, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SourceError::Connection("injected outage".into()));
        }
        let tiles = self
            .extent_tiles
            .get(source)
            .copied()
            .ok_or_else(|| SourceError::Other(format!("unknown level '{source}'")))?;
        if column >= tiles || row >= tiles {
            return Err(SourceError::NotFound {
                column,
                row,
                level_source: source.to_string(),
            });
        }

        let img = RgbaImage::from_pixel(
            TILE_SIDE,
            TILE_SIDE,
            image::Rgba(Self::color_for(source, column, row)),
        );
        let mut out = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut out),
            image::ImageFormat::Png,
        )
        .map_err(|e| SourceError::Other(e.to_string()))?;
        Ok(Bytes::from(out))
    }
}

/// Captures draw calls so tests can assert coverage and pixel provenance.
#[derive(Default)]
struct RecordingCanvas {
    draws: Vec<(Arc<PixelBuffer>, Rect)>,
}

impl TileCanvas for RecordingCanvas {
    fn draw_tile(&mut self, image: &Arc<PixelBuffer>, dest: Rect) {
        self.draws.push((Arc::clone(image), dest));
    }
}

impl RecordingCanvas {
    /// Whether the union of draw destinations covers `target`.
    fn covers(&self, target: Rect) -> bool {
        let mut uncovered = vec![target];
        for (_, dest) in &self.draws {
            uncovered = uncovered.iter().flat_map(|r| r.subtract(dest)).collect();
        }
        uncovered.is_empty()
    }

    /// First pixel of the topmost tile drawn over the given point.
    fn top_pixel_at(&self, x: i64, y: i64) -> Option<[u8; 4]> {
        self.draws
            .iter()
            .rev()
            .find(|(_, dest)| {
                x >= dest.left && x < dest.right && y >= dest.top && y < dest.bottom
            })
            .map(|(image, _)| {
                let mut px = [0u8; 4];
                px.copy_from_slice(&image.data()[0..4]);
                px
            })
    }
}

#[derive(Default)]
struct Events {
    started: AtomicUsize,
    completed: AtomicUsize,
    dirty: AtomicUsize,
    failures: Mutex<Vec<(TileKey, u32)>>,
}

impl RenderListener for Events {
    fn render_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }
    fn render_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

impl DrawSurface for Events {
    fn mark_dirty(&self) {
        self.dirty.fetch_add(1, Ordering::SeqCst);
    }
}

impl DecodeErrorListener for Events {
    fn decode_failed(&self, key: &TileKey, attempts: u32, _error: &DecodeError) {
        // Listener callbacks must not block; try_lock is enough for tests.
        if let Ok(mut failures) = self.failures.try_lock() {
            failures.push((key.clone(), attempts));
        }
    }
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::new(CONTENT, CONTENT);
    config.workers = 2;
    config.viewport_padding = 0;
    config.recompute_throttle = Duration::from_millis(5);
    config
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

async fn engine_with_events(
    source: Arc<PyramidSource>,
    config: EngineConfig,
) -> (Arc<TileEngine>, Arc<Events>) {
    let engine = TileEngine::new(config, source).await.unwrap();
    let events = Arc::new(Events::default());
    engine.add_render_listener(events.clone()).await;
    engine.add_decode_error_listener(events.clone()).await;
    engine.set_draw_surface(events.clone()).await;
    (engine, events)
}

#[tokio::test]
async fn test_full_resolution_view_decodes_and_draws() {
    init_tracing();
    let source = PyramidSource::new(&[("full", 8)]);
    let (engine, events) = engine_with_events(source.clone(), test_config()).await;

    engine.register_detail_level(1.0, TILE_SIDE, TILE_SIDE, "full").await;
    engine.set_viewport(Viewport::new(0, 0, 32, 32)).await;

    wait_until(|| events.completed.load(Ordering::SeqCst) >= 1).await;

    // 32x32 viewport of 8px tiles: a 4x4 grid, each fetched exactly once.
    assert_eq!(source.fetch_count(), 16);
    assert!(events.started.load(Ordering::SeqCst) >= 1);
    assert!(events.dirty.load(Ordering::SeqCst) >= 16);

    let mut canvas = RecordingCanvas::default();
    engine.draw(&mut canvas).await;
    assert_eq!(canvas.draws.len(), 16);
    assert!(canvas.covers(Rect::new(0, 0, 32, 32)));

    // Pixel at (17, 9) comes from full-level tile (2, 1).
    assert_eq!(canvas.top_pixel_at(17, 9), Some([100, 3, 2, 255]));
}

#[tokio::test]
async fn test_zoom_out_switches_level_and_keeps_coverage() {
    init_tracing();
    let source = PyramidSource::new(&[("full", 8), ("half", 4)]);
    let (engine, events) = engine_with_events(source.clone(), test_config()).await;

    engine.register_detail_level(1.0, TILE_SIDE, TILE_SIDE, "full").await;
    engine.register_detail_level(0.5, TILE_SIDE, TILE_SIDE, "half").await;

    engine.set_viewport(Viewport::new(0, 0, 32, 32)).await;
    wait_until(|| events.completed.load(Ordering::SeqCst) >= 1).await;
    let full_fetches = source.fetch_count();

    // Zoom out to half scale: the half level takes over. An 8px tile at
    // scale 0.5 covers 16 content px, so the 32px viewport needs 2x2 tiles.
    engine.set_scale(0.5).await;
    let before = events.completed.load(Ordering::SeqCst);
    wait_until(|| events.completed.load(Ordering::SeqCst) > before).await;

    assert_eq!(engine.current_detail_level().await.unwrap().scale, 0.5);
    assert_eq!(source.fetch_count(), full_fetches + 4);

    let mut canvas = RecordingCanvas::default();
    engine.draw(&mut canvas).await;
    // The scaled viewport (32 content px at 0.5) is fully covered.
    assert!(canvas.covers(Rect::new(0, 0, 16, 16)));
    // Topmost pixels now come from the half level.
    assert_eq!(canvas.top_pixel_at(4, 4), Some([200, 1, 1, 255]));
}

#[tokio::test]
async fn test_stale_tiles_drawn_while_new_level_decodes() {
    init_tracing();
    let source = PyramidSource::new(&[("full", 8), ("half", 4)]);
    let (engine, events) = engine_with_events(source.clone(), test_config()).await;

    engine.register_detail_level(1.0, TILE_SIDE, TILE_SIDE, "full").await;
    engine.register_detail_level(0.5, TILE_SIDE, TILE_SIDE, "half").await;

    engine.set_viewport(Viewport::new(0, 0, 32, 32)).await;
    wait_until(|| events.completed.load(Ordering::SeqCst) >= 1).await;

    // Switch levels while decodes are parked: the old level's tiles must
    // still cover the viewport on the next draw.
    engine.pause();
    engine.set_scale(0.5).await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    let mut canvas = RecordingCanvas::default();
    engine.draw(&mut canvas).await;
    assert!(canvas.covers(Rect::new(0, 0, 16, 16)));
    // Coverage comes from retained full-level tiles.
    assert_eq!(canvas.top_pixel_at(2, 2), Some([100, 1, 1, 255]));

    // Once the new level lands, the underlay retires. Each of the four
    // half-level tiles marks the surface dirty as it completes.
    let dirty_before = events.dirty.load(Ordering::SeqCst);
    engine.resume().await;
    wait_until(|| events.dirty.load(Ordering::SeqCst) >= dirty_before + 4).await;
    let mut canvas = RecordingCanvas::default();
    engine.draw(&mut canvas).await;
    assert!(canvas.covers(Rect::new(0, 0, 16, 16)));
    assert_eq!(canvas.top_pixel_at(2, 2), Some([200, 1, 1, 255]));
}

#[tokio::test]
async fn test_zoom_past_coarsest_level_renders_composites() {
    init_tracing();
    let source = PyramidSource::new(&[("half", 4)]);
    let (engine, events) = engine_with_events(source.clone(), test_config()).await;

    engine.register_detail_level(0.5, TILE_SIDE, TILE_SIDE, "half").await;

    // Scale 0.125 is two power-of-two steps below the coarsest level, so
    // composites merge 4x4 base cells; the whole 64px content is one
    // composite tile built from the half level's 4x4 grid.
    engine.set_scale(0.125).await;
    engine.set_viewport(Viewport::new(0, 0, CONTENT as i64, CONTENT as i64)).await;
    wait_until(|| events.completed.load(Ordering::SeqCst) >= 1).await;

    assert_eq!(source.fetch_count(), 16);

    let mut canvas = RecordingCanvas::default();
    engine.draw(&mut canvas).await;
    assert_eq!(canvas.draws.len(), 1);
    // 64 content px at scale 0.125 -> 8 screen px.
    assert!(canvas.covers(Rect::new(0, 0, 8, 8)));
}

#[tokio::test]
async fn test_scrolling_back_hits_memory_cache() {
    init_tracing();
    let source = PyramidSource::new(&[("full", 8)]);
    let (engine, events) = engine_with_events(source.clone(), test_config()).await;

    engine.register_detail_level(1.0, TILE_SIDE, TILE_SIDE, "full").await;

    engine.set_viewport(Viewport::new(0, 0, 16, 16)).await;
    wait_until(|| events.completed.load(Ordering::SeqCst) >= 1).await;
    assert_eq!(source.fetch_count(), 4);

    // Scroll away, then back: the original tiles come from the cache.
    engine.set_viewport(Viewport::new(32, 32, 48, 48)).await;
    wait_until(|| source.fetch_count() == 8).await;

    engine.set_viewport(Viewport::new(0, 0, 16, 16)).await;
    let before = events.completed.load(Ordering::SeqCst);
    wait_until(|| events.completed.load(Ordering::SeqCst) > before).await;
    assert_eq!(source.fetch_count(), 8);

    let mut canvas = RecordingCanvas::default();
    engine.draw(&mut canvas).await;
    assert!(canvas.covers(Rect::new(0, 0, 16, 16)));
}

#[tokio::test]
async fn test_decode_failure_reported_and_retried() {
    init_tracing();
    let source = PyramidSource::new(&[("full", 8)]);
    let (engine, events) = engine_with_events(source.clone(), test_config()).await;

    engine.register_detail_level(1.0, TILE_SIDE, TILE_SIDE, "full").await;

    source.fail.store(true, Ordering::SeqCst);
    engine.set_viewport(Viewport::new(0, 0, 8, 8)).await;

    wait_until(|| !events.failures.try_lock().map(|f| f.is_empty()).unwrap_or(true)).await;
    let (key, attempts) = events.failures.try_lock().unwrap()[0].clone();
    assert_eq!(attempts, 1);

    // The outage ends; an explicit retry recovers the tile.
    source.fail.store(false, Ordering::SeqCst);
    assert!(engine.retry(&key).await);
    let before = events.dirty.load(Ordering::SeqCst);
    wait_until(|| events.dirty.load(Ordering::SeqCst) > before).await;

    let mut canvas = RecordingCanvas::default();
    engine.draw(&mut canvas).await;
    assert!(canvas.covers(Rect::new(0, 0, 8, 8)));
}

#[tokio::test]
async fn test_disk_cache_survives_engine_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let source = PyramidSource::new(&[("full", 8)]);
    let config = test_config().with_disk_cache(dir.path(), DiskCachePolicy::All);
    let (engine, events) = engine_with_events(source.clone(), config.clone()).await;

    engine.register_detail_level(1.0, TILE_SIDE, TILE_SIDE, "full").await;
    engine.set_viewport(Viewport::new(0, 0, 16, 16)).await;
    wait_until(|| events.completed.load(Ordering::SeqCst) >= 1).await;
    assert_eq!(source.fetch_count(), 4);
    engine.destroy().await;

    // A second engine over the same cache directory never touches the
    // supplier for the same tiles.
    let source2 = PyramidSource::new(&[("full", 8)]);
    let (engine2, events2) = engine_with_events(source2.clone(), config).await;
    engine2.register_detail_level(1.0, TILE_SIDE, TILE_SIDE, "full").await;
    engine2.set_viewport(Viewport::new(0, 0, 16, 16)).await;
    wait_until(|| events2.completed.load(Ordering::SeqCst) >= 1).await;

    assert_eq!(source2.fetch_count(), 0);

    let mut canvas = RecordingCanvas::default();
    engine2.draw(&mut canvas).await;
    assert!(canvas.covers(Rect::new(0, 0, 16, 16)));
    assert_eq!(canvas.top_pixel_at(1, 1), Some([100, 1, 1, 255]));
}

#[tokio::test]
async fn test_locked_level_does_not_thrash_during_gesture() {
    init_tracing();
    let source = PyramidSource::new(&[("full", 8), ("half", 4)]);
    let (engine, events) = engine_with_events(source.clone(), test_config()).await;

    engine.register_detail_level(1.0, TILE_SIDE, TILE_SIDE, "full").await;
    engine.register_detail_level(0.5, TILE_SIDE, TILE_SIDE, "half").await;

    engine.set_viewport(Viewport::new(0, 0, 32, 32)).await;
    wait_until(|| events.completed.load(Ordering::SeqCst) >= 1).await;

    // An animated zoom gesture: lock, sweep the scale, unlock. The full
    // level stays selected throughout the sweep.
    engine.lock_detail_level().await;
    for scale in [0.9, 0.7, 0.5, 0.4] {
        engine.set_scale(scale).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.current_detail_level().await.unwrap().scale, 1.0);
    }

    // Unlocking re-selects for the final scale.
    engine.unlock_detail_level().await;
    for _ in 0..500 {
        if engine.current_detail_level().await.unwrap().scale == 0.5 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("half level was not selected after unlock");
}
