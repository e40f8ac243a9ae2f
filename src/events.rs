//! Engine event surface.
//!
//! The engine reports progress through three host-implemented traits:
//! [`DrawSurface`] receives dirty notifications whenever a draw pass would
//! now produce different output, [`RenderListener`] brackets each decode
//! batch (first tile scheduled / last tile settled), and
//! [`DecodeErrorListener`] receives per-tile decode failures, which the host
//! may answer with a bounded retry.
//!
//! All callbacks fire on decode worker tasks; implementations must be cheap
//! and non-blocking.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::DecodeError;
use crate::tile::TileKey;

// =============================================================================
// Listener traits
// =============================================================================

/// Receives repaint requests.
///
/// Fired whenever a tile finishes decoding, so a subsequent draw pass would
/// produce different output.
pub trait DrawSurface: Send + Sync + 'static {
    fn mark_dirty(&self);
}

/// Observes decode batches.
///
/// A batch opens when a grid recomputation schedules at least one decode and
/// closes when every tile in it has settled (decoded, failed, or cancelled).
/// A newer batch supersedes an unfinished older one, whose completion is then
/// never reported.
pub trait RenderListener: Send + Sync + 'static {
    fn render_started(&self) {}
    fn render_completed(&self) {}
}

/// Observes per-tile decode failures.
pub trait DecodeErrorListener: Send + Sync + 'static {
    /// A decode attempt for `key` failed. `attempts` counts every attempt so
    /// far, including this one.
    fn decode_failed(&self, key: &TileKey, attempts: u32, error: &DecodeError);
}

// =============================================================================
// Listener registry
// =============================================================================

/// Fan-out registry shared by the engine facade and the decode scheduler.
#[derive(Default)]
pub struct Listeners {
    render: RwLock<Vec<Arc<dyn RenderListener>>>,
    errors: RwLock<Vec<Arc<dyn DecodeErrorListener>>>,
    surface: RwLock<Option<Arc<dyn DrawSurface>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_render_listener(&self, listener: Arc<dyn RenderListener>) {
        self.render.write().await.push(listener);
    }

    pub async fn add_error_listener(&self, listener: Arc<dyn DecodeErrorListener>) {
        self.errors.write().await.push(listener);
    }

    pub async fn set_surface(&self, surface: Arc<dyn DrawSurface>) {
        *self.surface.write().await = Some(surface);
    }

    pub async fn notify_render_start(&self) {
        for listener in self.render.read().await.iter() {
            listener.render_started();
        }
    }

    pub async fn notify_render_complete(&self) {
        for listener in self.render.read().await.iter() {
            listener.render_completed();
        }
    }

    pub async fn notify_decode_error(&self, key: &TileKey, attempts: u32, error: &DecodeError) {
        for listener in self.errors.read().await.iter() {
            listener.decode_failed(key, attempts, error);
        }
    }

    pub async fn notify_dirty(&self) {
        if let Some(surface) = self.surface.read().await.as_ref() {
            surface.mark_dirty();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
