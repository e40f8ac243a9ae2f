use thiserror::Error;

/// Errors produced by a [`TileSource`](crate::source::TileSource) when
/// fetching the encoded bytes for a tile.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// No backing data exists for the requested cell.
    ///
    /// For composite tiles this is tolerated per sub-piece: cells past the
    /// content extent have no data and leave their quadrant blank.
    #[error("Tile not found: column {column}, row {row} in '{level_source}'")]
    NotFound {
        column: u32,
        row: u32,
        /// The per-level source string the fetch was issued against. Not
        /// named `source` so the derive does not treat it as a cause chain.
        level_source: String,
    },

    /// Network or connection error while fetching tile bytes.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The fetch did not complete within the supplier's deadline.
    #[error("Timed out fetching tile: {0}")]
    Timeout(String),

    /// Any other supplier-specific failure.
    #[error("Source error: {0}")]
    Other(String),
}

/// Errors that can occur while turning an idle tile into a decoded tile.
///
/// All variants are transient from the engine's point of view: a failed tile
/// is reported to the registered decode-error listeners and may be retried,
/// but never crashes the engine or blocks other tiles.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// The byte supplier failed to produce bytes for the tile.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// The supplied bytes could not be decoded as an image.
    #[error("Invalid image data: {0}")]
    InvalidImage(String),

    /// The decoded image has unusable dimensions (zero on either axis).
    #[error("Invalid decoded dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Buffer allocation failed during decode.
    ///
    /// The scheduler runs an emergency cache trim and treats the tile as a
    /// transient failure.
    #[error("Allocation of {requested} bytes failed during decode")]
    Allocation { requested: usize },
}

impl From<image::ImageError> for DecodeError {
    fn from(err: image::ImageError) -> Self {
        DecodeError::InvalidImage(err.to_string())
    }
}

/// Errors raised while constructing a [`TileEngine`](crate::engine::TileEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The disk cache directory could not be opened or created.
    #[error("Failed to open disk cache: {0}")]
    DiskCache(#[from] std::io::Error),
}
