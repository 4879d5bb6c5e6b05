//! Synthetic tile producer
//!
//! Generates deterministic gradient tiles without any real image source.
//! Used by the CLI simulator and by tests: it counts every fetch, can be
//! told to fail specific keys, and can simulate a slow upstream.

use crate::geometry::{TileKey, TileLayout};
use crate::producer::{ProducerError, Tile, TileProducer};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Producer that renders a gradient for every tile of a layout
///
/// # Example
///
/// ```
/// use tile_reservoir_cache::{Rect, SyntheticProducer, TileKey, TileLayout, TileProducer};
///
/// let producer = SyntheticProducer::new(TileLayout::new(64, 64, Rect::new(0, 0, 256, 256)))
///     .with_failing_key(TileKey::new(1, 1));
///
/// assert!(producer.fetch_tile(TileKey::new(0, 0)).is_ok());
/// assert!(producer.fetch_tile(TileKey::new(1, 1)).is_err());
/// assert_eq!(producer.fetch_count(), 2);
/// ```
#[derive(Debug)]
pub struct SyntheticProducer {
    layout: TileLayout,
    latency: Duration,
    failing: HashSet<TileKey>,
    fetches: AtomicU64,
    per_key: Mutex<HashMap<TileKey, u32>>,
}

impl SyntheticProducer {
    /// Create a producer for `layout` with no latency and no failures
    pub fn new(layout: TileLayout) -> Self {
        Self {
            layout,
            latency: Duration::ZERO,
            failing: HashSet::new(),
            fetches: AtomicU64::new(0),
            per_key: Mutex::new(HashMap::new()),
        }
    }

    /// Sleep for `latency` on every fetch
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every fetch of `key`
    pub fn with_failing_key(mut self, key: TileKey) -> Self {
        self.failing.insert(key);
        self
    }

    /// Total number of fetch calls, successful or not
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of fetch calls for one key
    pub fn fetch_count_for(&self, key: TileKey) -> u32 {
        let per_key = self.per_key.lock().unwrap_or_else(PoisonError::into_inner);
        per_key.get(&key).copied().unwrap_or(0)
    }

    /// Keys that were fetched more than once
    pub fn refetched_keys(&self) -> Vec<TileKey> {
        let per_key = self.per_key.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = per_key
            .iter()
            .filter(|&(_, &count)| count > 1)
            .map(|(key, _)| *key)
            .collect();
        keys.sort();
        keys
    }

    /// Reset all fetch counters
    pub fn reset_counts(&self) {
        self.fetches.store(0, Ordering::SeqCst);
        self.per_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn render(&self, key: TileKey) -> Vec<u8> {
        let bounds = self.layout.tile_bounds(key);
        let mut pixels = Vec::with_capacity(bounds.area().max(0) as usize * 4);

        for y in bounds.y..bounds.y.saturating_add(bounds.height) {
            for x in bounds.x..bounds.x.saturating_add(bounds.width) {
                pixels.push(x as u8);
                pixels.push(y as u8);
                pixels.push(key.column.wrapping_add(key.row) as u8);
                pixels.push(255);
            }
        }

        pixels
    }
}

impl TileProducer for SyntheticProducer {
    fn layout(&self) -> TileLayout {
        self.layout
    }

    fn fetch_tile(&self, key: TileKey) -> Result<Tile, ProducerError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self
            .per_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert(0) += 1;

        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        if !self.layout.contains_key(key) {
            return Err(ProducerError::OutOfRange(key));
        }
        if self.failing.contains(&key) {
            return Err(ProducerError::Other(format!("synthetic failure for tile {key}")));
        }

        Ok(Tile::new(key, self.layout.tile_bounds(key), self.render(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;

    fn layout() -> TileLayout {
        TileLayout::new(8, 8, Rect::new(0, 0, 32, 32))
    }

    #[test]
    fn test_renders_full_tile() {
        let producer = SyntheticProducer::new(layout());
        let tile = producer.fetch_tile(TileKey::new(1, 2)).unwrap();

        assert_eq!(tile.bounds(), Rect::new(8, 16, 8, 8));
        assert_eq!(tile.byte_size(), 8 * 8 * 4);
        // First pixel encodes its own coordinates
        assert_eq!(&tile.pixels()[..4], &[8, 16, 3, 255]);
    }

    #[test]
    fn test_counts_fetches() {
        let producer = SyntheticProducer::new(layout());
        producer.fetch_tile(TileKey::new(0, 0)).unwrap();
        producer.fetch_tile(TileKey::new(0, 0)).unwrap();
        producer.fetch_tile(TileKey::new(1, 0)).unwrap();

        assert_eq!(producer.fetch_count(), 3);
        assert_eq!(producer.fetch_count_for(TileKey::new(0, 0)), 2);
        assert_eq!(producer.refetched_keys(), vec![TileKey::new(0, 0)]);

        producer.reset_counts();
        assert_eq!(producer.fetch_count(), 0);
        assert!(producer.refetched_keys().is_empty());
    }

    #[test]
    fn test_out_of_range_and_failing_keys() {
        let producer = SyntheticProducer::new(layout()).with_failing_key(TileKey::new(2, 2));

        assert!(matches!(
            producer.fetch_tile(TileKey::new(4, 0)),
            Err(ProducerError::OutOfRange(_))
        ));
        assert!(matches!(
            producer.fetch_tile(TileKey::new(2, 2)),
            Err(ProducerError::Other(_))
        ));
        // Failed attempts are still counted
        assert_eq!(producer.fetch_count(), 2);
    }
}
