//! Tile producer contract
//!
//! The reservoir never computes pixels itself. An upstream producer (a
//! decoder, a render pipeline, a remote tile server) supplies the tile grid
//! geometry and computes one tile at a time on request.

use crate::geometry::{Rect, TileKey, TileLayout};
use std::sync::Arc;

/// Immutable block of pixel data for one grid cell
///
/// Pixel data is shared: cloning a `Tile` or holding it in several caches
/// never copies pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    key: TileKey,
    bounds: Rect,
    pixels: Arc<[u8]>,
}

impl Tile {
    /// Create a new tile
    ///
    /// # Arguments
    ///
    /// * `key` - Grid position of the tile
    /// * `bounds` - Pixel bounds covered by `pixels`
    /// * `pixels` - Raw pixel data (RGBA, row-major)
    pub fn new(key: TileKey, bounds: Rect, pixels: impl Into<Arc<[u8]>>) -> Self {
        Self {
            key,
            bounds,
            pixels: pixels.into(),
        }
    }

    /// Grid position of the tile
    pub fn key(&self) -> TileKey {
        self.key
    }

    /// Pixel bounds covered by the tile
    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    /// Raw pixel data
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Width in pixels
    pub fn width(&self) -> i32 {
        self.bounds.width
    }

    /// Height in pixels
    pub fn height(&self) -> i32 {
        self.bounds.height
    }

    /// Size of the pixel data in bytes
    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }
}

/// Errors a producer reports for a single tile
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    /// The key lies outside the source's tile grid
    #[error("tile {0} lies outside the source tile grid")]
    OutOfRange(TileKey),

    /// Reading the source failed
    #[error("tile source I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The source data could not be decoded
    #[error("tile decode failed: {0}")]
    Decode(String),

    /// Any other producer-specific failure
    #[error("{0}")]
    Other(String),
}

/// Upstream source of tiles
///
/// Implementations must be safe to call from several threads at once; the
/// background prefetcher fetches tiles concurrently.
pub trait TileProducer: Send + Sync {
    /// Tile grid geometry of the source
    ///
    /// Must return the same value for the lifetime of the producer.
    fn layout(&self) -> TileLayout;

    /// Compute or load one tile
    fn fetch_tile(&self, key: TileKey) -> Result<Tile, ProducerError>;
}

impl<P: TileProducer + ?Sized> TileProducer for Arc<P> {
    fn layout(&self) -> TileLayout {
        (**self).layout()
    }

    fn fetch_tile(&self, key: TileKey) -> Result<Tile, ProducerError> {
        (**self).fetch_tile(key)
    }
}

impl<P: TileProducer + ?Sized> TileProducer for Box<P> {
    fn layout(&self) -> TileLayout {
        (**self).layout()
    }

    fn fetch_tile(&self, key: TileKey) -> Result<Tile, ProducerError> {
        (**self).fetch_tile(key)
    }
}
