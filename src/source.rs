//! Byte supplier contract.
//!
//! The engine never performs transport itself: given a tile coordinate and
//! the opaque per-level source string, a [`TileSource`] returns a decodable
//! byte stream (local file, bundled asset, network fetch — the engine does
//! not care). Failures surface as decode-error events delivered to the
//! registered listeners, which may request a bounded retry.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SourceError;

/// Supplies encoded image bytes for base-resolution tile cells.
///
/// Implementations must be cheap to share across decode workers; expensive
/// suppliers (network fetches) should be paired with a disk cache policy of
/// [`DiskCachePolicy::All`](crate::cache::DiskCachePolicy::All) so bytes are
/// never fetched twice.
#[async_trait]
pub trait TileSource: Send + Sync + 'static {
    /// Fetch the encoded bytes for the base cell `(column, row)` of the
    /// level identified by `source`.
    ///
    /// # Errors
    ///
    /// [`SourceError::NotFound`] when no backing data exists for the cell;
    /// for composite sub-pieces past the content edge this is tolerated and
    /// leaves the quadrant blank. Any other error fails the tile's decode.
    async fn fetch_tile(&self, column: u32, row: u32, source: &str) -> Result<Bytes, SourceError>;
}
