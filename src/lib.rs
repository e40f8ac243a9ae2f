//! # tilevista
//!
//! A tile pyramid caching and scheduling engine for deep-zoom image viewers.
//!
//! The engine turns a stream of viewport and scale changes into a bounded
//! set of decoded tiles ready to draw: it selects the best registered detail
//! level for the current zoom, computes the grid of tiles intersecting the
//! (padded) viewport, decodes them through a bounded worker pool fed by a
//! pluggable byte supplier, and composites stale-but-covering tiles beneath
//! fresh ones so the view never flashes empty during transitions.
//!
//! ## Features
//!
//! - **Detail level registry**: an ordered pyramid of levels with pluggable
//!   selection policies, lockable during animated zoom gestures
//! - **Composite tiles**: zooming out past the least detailed level renders
//!   a degraded patchwork assembled from `sample x sample` base cells
//! - **Memory cache / buffer pool**: decoded tiles live in a byte-bounded
//!   LRU that also recycles backing allocations into new decodes
//! - **Optional disk cache**: a size-bounded, corruption-tolerant blob store
//!   that survives restarts
//! - **Decode scheduling**: batched, deduplicated, cancellable decodes with
//!   render start/complete bracketing and per-tile failure reporting
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use tilevista::{EngineConfig, SourceError, TileEngine, TileSource, Viewport};
//!
//! struct DirSource;
//!
//! #[async_trait]
//! impl TileSource for DirSource {
//!     async fn fetch_tile(&self, column: u32, row: u32, source: &str) -> Result<Bytes, SourceError> {
//!         let path = format!("{source}/{column}_{row}.jpg");
//!         tokio::fs::read(&path)
//!             .await
//!             .map(Bytes::from)
//!             .map_err(|_| SourceError::NotFound { column, row, level_source: source.into() })
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = TileEngine::new(EngineConfig::new(46920, 33600), Arc::new(DirSource)).await?;
//! engine.register_detail_level(1.0, 256, 256, "tiles/full").await;
//! engine.register_detail_level(0.25, 256, 256, "tiles/quarter").await;
//!
//! engine.set_scale(0.5).await;
//! engine.set_viewport(Viewport::new(0, 0, 1920, 1080)).await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod compositor;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod grid;
pub mod level;
pub mod scheduler;
pub mod source;
pub mod tile;

pub use cache::{DiskCache, DiskCachePolicy, MemoryCache};
pub use compositor::{Compositor, RetainedTile, TileCanvas};
pub use config::EngineConfig;
pub use engine::TileEngine;
pub use error::{DecodeError, EngineError, SourceError};
pub use events::{DecodeErrorListener, DrawSurface, RenderListener};
pub use grid::{GridCell, Rect, Viewport};
pub use level::{DetailLevel, SelectionPolicy};
pub use source::TileSource;
pub use tile::{PixelBuffer, Tile, TileKey, TileState};
