//! Pixel rectangles and tile grid geometry
//!
//! A source image is divided into a fixed grid of `tile_width` x `tile_height`
//! cells whose origin is shifted by the grid offsets. This module maps between
//! pixel coordinates and tile indices, and enumerates the tiles covering a
//! rectangle.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer rectangle in source pixel coordinates
///
/// A rectangle with a non-positive width or height is empty: it has zero
/// area and intersects nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge
    pub x: i32,

    /// Top edge
    pub y: i32,

    /// Width in pixels
    pub width: i32,

    /// Height in pixels
    pub height: i32,
}

impl Rect {
    /// Create a new rectangle
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Returns true if the rectangle has no pixels
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Exclusive right edge
    pub fn right(&self) -> i64 {
        i64::from(self.x) + i64::from(self.width)
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i64 {
        i64::from(self.y) + i64::from(self.height)
    }

    /// Area in square pixels, 0 for empty rectangles
    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            i64::from(self.width) * i64::from(self.height)
        }
    }

    /// Returns true if both rectangles are non-empty and share at least one pixel
    pub fn intersects(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && i64::from(self.x) < other.right()
            && i64::from(other.x) < self.right()
            && i64::from(self.y) < other.bottom()
            && i64::from(other.y) < self.bottom()
    }

    /// Geometric intersection of two rectangles
    ///
    /// Disjoint rectangles yield an empty rectangle (area 0) anchored at the
    /// clamped origin.
    pub fn intersection(&self, other: &Rect) -> Rect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());

        let width = (x1 - i64::from(x0)).max(0);
        let height = (y1 - i64::from(y0)).max(0);

        if self.is_empty() || other.is_empty() || width == 0 || height == 0 {
            return Rect::new(x0, y0, 0, 0);
        }

        Rect::new(x0, y0, saturate(width), saturate(height))
    }

    /// Grow the rectangle by `margin` pixels on every side
    ///
    /// A negative margin shrinks it.
    pub fn grow(&self, margin: i32) -> Rect {
        let margin = i64::from(margin);
        Rect::new(
            saturate(i64::from(self.x) - margin),
            saturate(i64::from(self.y) - margin),
            saturate(i64::from(self.width) + 2 * margin),
            saturate(i64::from(self.height) + 2 * margin),
        )
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}x{}]", self.x, self.y, self.width, self.height)
    }
}

/// Tile index within a source image's tile grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileKey {
    /// Tile column
    pub column: i32,

    /// Tile row
    pub row: i32,
}

impl TileKey {
    /// Create a new tile key
    pub const fn new(column: i32, row: i32) -> Self {
        Self { column, row }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.column, self.row)
    }
}

/// Inclusive range of tile columns and rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    /// First column
    pub min_column: i32,

    /// Last column (inclusive)
    pub max_column: i32,

    /// First row
    pub min_row: i32,

    /// Last row (inclusive)
    pub max_row: i32,
}

impl TileRange {
    /// Number of columns in the range
    pub fn columns(&self) -> usize {
        (i64::from(self.max_column) - i64::from(self.min_column) + 1).max(0) as usize
    }

    /// Number of rows in the range
    pub fn rows(&self) -> usize {
        (i64::from(self.max_row) - i64::from(self.min_row) + 1).max(0) as usize
    }

    /// Total number of tiles in the range
    pub fn len(&self) -> usize {
        self.columns() * self.rows()
    }

    /// Returns true if the range holds no tiles
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `key` lies inside the range
    pub fn contains(&self, key: TileKey) -> bool {
        (self.min_column..=self.max_column).contains(&key.column)
            && (self.min_row..=self.max_row).contains(&key.row)
    }

    /// Iterate over the keys in row-major order
    pub fn keys(&self) -> impl Iterator<Item = TileKey> {
        let range = *self;
        (range.min_row..=range.max_row).flat_map(move |row| {
            (range.min_column..=range.max_column).map(move |column| TileKey::new(column, row))
        })
    }
}

/// Static tile geometry of a source image
///
/// Tile width, height, and grid offsets never change for a given source.
/// Tile dimensions are always positive: every constructor, including
/// deserialization, rejects anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTileLayout", into = "RawTileLayout")]
pub struct TileLayout {
    tile_width: i32,
    tile_height: i32,
    tile_grid_x_offset: i32,
    tile_grid_y_offset: i32,
    bounds: Rect,
}

/// Invalid tile geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("tile dimensions must be positive, got {width}x{height}")]
    NonPositiveTileSize { width: i32, height: i32 },
}

/// Unvalidated wire form of [`TileLayout`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawTileLayout {
    tile_width: i32,
    tile_height: i32,
    #[serde(default)]
    tile_grid_x_offset: i32,
    #[serde(default)]
    tile_grid_y_offset: i32,
    bounds: Rect,
}

impl TryFrom<RawTileLayout> for TileLayout {
    type Error = LayoutError;

    fn try_from(raw: RawTileLayout) -> Result<Self, Self::Error> {
        Ok(TileLayout::try_new(raw.tile_width, raw.tile_height, raw.bounds)?
            .with_grid_offset(raw.tile_grid_x_offset, raw.tile_grid_y_offset))
    }
}

impl From<TileLayout> for RawTileLayout {
    fn from(layout: TileLayout) -> Self {
        Self {
            tile_width: layout.tile_width,
            tile_height: layout.tile_height,
            tile_grid_x_offset: layout.tile_grid_x_offset,
            tile_grid_y_offset: layout.tile_grid_y_offset,
            bounds: layout.bounds,
        }
    }
}

impl TileLayout {
    /// Create a layout with the grid anchored at the pixel origin
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::NonPositiveTileSize`] if `tile_width` or
    /// `tile_height` is not positive.
    pub fn try_new(tile_width: i32, tile_height: i32, bounds: Rect) -> Result<Self, LayoutError> {
        if tile_width <= 0 || tile_height <= 0 {
            return Err(LayoutError::NonPositiveTileSize {
                width: tile_width,
                height: tile_height,
            });
        }

        Ok(Self {
            tile_width,
            tile_height,
            tile_grid_x_offset: 0,
            tile_grid_y_offset: 0,
            bounds,
        })
    }

    /// Create a layout with the grid anchored at the pixel origin
    ///
    /// # Panics
    ///
    /// Panics if `tile_width` or `tile_height` is not positive. Use
    /// [`try_new`](Self::try_new) for untrusted sizes.
    pub fn new(tile_width: i32, tile_height: i32, bounds: Rect) -> Self {
        match Self::try_new(tile_width, tile_height, bounds) {
            Ok(layout) => layout,
            Err(err) => panic!("{err}"),
        }
    }

    /// Width of one grid cell in pixels
    pub fn tile_width(&self) -> i32 {
        self.tile_width
    }

    /// Height of one grid cell in pixels
    pub fn tile_height(&self) -> i32 {
        self.tile_height
    }

    /// Pixel position of the top-left corner of tile (0, 0)
    pub fn grid_offset(&self) -> (i32, i32) {
        (self.tile_grid_x_offset, self.tile_grid_y_offset)
    }

    /// Pixel bounds of the source image
    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    /// Shift the grid origin
    pub fn with_grid_offset(mut self, x_offset: i32, y_offset: i32) -> Self {
        self.tile_grid_x_offset = x_offset;
        self.tile_grid_y_offset = y_offset;
        self
    }

    /// Area of one grid cell in square pixels
    pub fn tile_area(&self) -> i64 {
        i64::from(self.tile_width) * i64::from(self.tile_height)
    }

    /// Column of the tile containing pixel column `x`
    pub fn tile_column_for_x(&self, x: i32) -> i32 {
        floor_div(
            i64::from(x) - i64::from(self.tile_grid_x_offset),
            self.tile_width,
        )
    }

    /// Row of the tile containing pixel row `y`
    pub fn tile_row_for_y(&self, y: i32) -> i32 {
        floor_div(
            i64::from(y) - i64::from(self.tile_grid_y_offset),
            self.tile_height,
        )
    }

    /// Left edge of tile column `column`
    pub fn x_for_tile_column(&self, column: i32) -> i32 {
        saturate(
            i64::from(column) * i64::from(self.tile_width) + i64::from(self.tile_grid_x_offset),
        )
    }

    /// Top edge of tile row `row`
    pub fn y_for_tile_row(&self, row: i32) -> i32 {
        saturate(i64::from(row) * i64::from(self.tile_height) + i64::from(self.tile_grid_y_offset))
    }

    /// Full grid cell of a tile
    ///
    /// This is not clipped to the image bounds.
    pub fn tile_bounds(&self, key: TileKey) -> Rect {
        Rect::new(
            self.x_for_tile_column(key.column),
            self.y_for_tile_row(key.row),
            self.tile_width,
            self.tile_height,
        )
    }

    /// Tiles whose grid cells intersect `rect`, without clipping to the image
    pub fn tile_range(&self, rect: &Rect) -> Option<TileRange> {
        if rect.is_empty() {
            return None;
        }

        Some(TileRange {
            min_column: self.tile_column_for_x(rect.x),
            max_column: self.tile_column_for_x(saturate(rect.right() - 1)),
            min_row: self.tile_row_for_y(rect.y),
            max_row: self.tile_row_for_y(saturate(rect.bottom() - 1)),
        })
    }

    /// Tiles of the source image, i.e. those covering its pixel bounds
    pub fn image_tile_range(&self) -> Option<TileRange> {
        self.tile_range(&self.bounds)
    }

    /// Returns true if the key names a tile inside the image's tile range
    pub fn contains_key(&self, key: TileKey) -> bool {
        self.image_tile_range()
            .is_some_and(|range| range.contains(key))
    }

    /// Image tiles whose grid cells intersect `rect`
    ///
    /// `rect` is clipped to the image bounds first, so keys outside the
    /// source never appear.
    pub fn tiles_intersecting(&self, rect: &Rect) -> Vec<TileKey> {
        let clipped = rect.intersection(&self.bounds);
        self.tile_range(&clipped)
            .map(|range| range.keys().collect())
            .unwrap_or_default()
    }
}

/// Floor division of `value` by a positive divisor
fn floor_div(value: i64, divisor: i32) -> i32 {
    saturate(value.div_euclid(i64::from(divisor)))
}

fn saturate(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}
