//! Tile Reservoir Scheduler Library
//!
//! Background corona prefetching for a [`TileReservoir`](tile_reservoir_cache::TileReservoir).
//!
//! A viewport change is split in two. Eviction and the prefetch decision run
//! on the caller's thread, so no stale tile outlives the call. The corona
//! tiles are queued and fetched by a pool of worker threads, visible tiles
//! before margin tiles. A newer viewport supersedes the queued remainder of
//! the previous one, keeping only the keys its own corona still needs.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tile_reservoir_cache::{Rect, SyntheticProducer, TileKey, TileLayout, TileReservoir};
//! use tile_reservoir_scheduler::{BackgroundPrefetcher, PrefetcherConfig};
//!
//! let layout = TileLayout::new(256, 256, Rect::new(0, 0, 4096, 4096));
//! let reservoir = Arc::new(TileReservoir::with_default_config(SyntheticProducer::new(layout)));
//! let prefetcher = BackgroundPrefetcher::new(reservoir, PrefetcherConfig::new(2)).unwrap();
//!
//! prefetcher.request_viewport(Rect::new(0, 0, 1024, 768));
//!
//! // Painting does not have to wait; a miss is fetched on demand
//! let tile = prefetcher.get_tile(TileKey::new(1, 1)).unwrap();
//! assert_eq!(tile.width(), 256);
//!
//! prefetcher.wait_idle(Duration::from_secs(5));
//! ```

mod prefetcher;
mod queue;
mod worker;

// Re-export public API
pub use prefetcher::{BackgroundPrefetcher, PrefetcherConfig, SchedulerError};
pub use queue::{BatchSummary, FetchPriority};
pub use worker::BatchCallback;
