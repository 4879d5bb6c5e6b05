//! Tile Reservoir Cache Library
//!
//! Viewport-driven tile cache that sits between a scrollable display and an
//! expensive tile producer. Tiles around the visible window (the "corona")
//! are prefetched after large viewport jumps, and tiles that fall outside the
//! corona are evicted on every viewport change.
//!
//! # Example
//!
//! ```
//! use tile_reservoir_cache::{Rect, ReservoirConfig, SyntheticProducer, TileKey, TileLayout, TileReservoir};
//!
//! let layout = TileLayout::new(128, 128, Rect::new(0, 0, 4096, 4096));
//! let reservoir = TileReservoir::new(SyntheticProducer::new(layout), ReservoirConfig::default());
//!
//! // The viewport owner announces the visible region before painting it.
//! let report = reservoir.set_viewport(Rect::new(0, 0, 800, 600));
//! assert!(report.decision.is_prefetch());
//!
//! // Painting pulls tiles; corona tiles are already cached.
//! let tile = reservoir.get_tile(TileKey::new(2, 1)).unwrap();
//! assert_eq!(tile.width(), 128);
//! ```

pub mod config;
pub mod geometry;
pub mod producer;
pub mod reservoir;
pub mod synthetic;

pub use config::{ConfigError, ReservoirConfig};
pub use geometry::{LayoutError, Rect, TileKey, TileLayout, TileRange};
pub use producer::{ProducerError, Tile, TileProducer};
pub use reservoir::{
    PrefetchDecision, PrefetchOutcome, PrefetchReport, ReservoirError, ReservoirStats,
    TileReservoir, ViewportPlan,
};
pub use synthetic::SyntheticProducer;
