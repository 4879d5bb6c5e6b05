//! Viewport-driven tile reservoir
//!
//! Caches tiles between a scrolling display and an expensive producer. Every
//! viewport change re-establishes the corona invariant: tiles whose grid
//! cells no longer intersect the viewport grown by the corona margin are
//! evicted. When the viewport jumps far enough (low overlap with the previous
//! viewport) and covers enough tiles, the whole corona is fetched eagerly.
//! Otherwise tiles are filled lazily through [`TileReservoir::get_tile`].

use crate::config::ReservoirConfig;
use crate::geometry::{Rect, TileKey, TileLayout};
use crate::producer::{ProducerError, Tile, TileProducer};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Errors surfaced by the reservoir
#[derive(Debug, thiserror::Error)]
pub enum ReservoirError {
    /// The producer could not supply a tile. Nothing was cached for the key.
    #[error("failed to fetch tile {key}: {source}")]
    TileFetch {
        key: TileKey,
        #[source]
        source: ProducerError,
    },
}

impl ReservoirError {
    /// Key of the tile the error belongs to
    pub fn key(&self) -> TileKey {
        match self {
            ReservoirError::TileFetch { key, .. } => *key,
        }
    }
}

/// What a viewport change decided about prefetching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchDecision {
    /// The new viewport has a non-positive width or height
    InvalidViewport,

    /// Old and new viewports together cover too few tiles to bother
    BelowTileThreshold,

    /// The new viewport overlaps the old one enough that the cached corona
    /// already covers most of it
    HighOverlap,

    /// The viewport jumped; the whole corona is fetched
    Prefetch,
}

impl PrefetchDecision {
    /// Decide whether moving from `old` to `new` warrants a corona prefetch
    ///
    /// Returns the decision and the overlap ratio
    /// `area(old ∩ new) / (area(old) + area(new) + 1)`.
    pub fn evaluate(
        config: &ReservoirConfig,
        layout: &TileLayout,
        old: &Rect,
        new: &Rect,
    ) -> (Self, f64) {
        let overlap_area = old.intersection(new).area();
        let total_area = old.area() + new.area();
        let ratio = overlap_area as f64 / (total_area as f64 + 1.0);

        if new.is_empty() {
            return (PrefetchDecision::InvalidViewport, ratio);
        }

        let threshold_area = i64::from(config.tile_threshold).saturating_mul(layout.tile_area());
        if total_area < threshold_area {
            return (PrefetchDecision::BelowTileThreshold, ratio);
        }

        if ratio < config.area_threshold {
            (PrefetchDecision::Prefetch, ratio)
        } else {
            (PrefetchDecision::HighOverlap, ratio)
        }
    }

    /// Returns true if the corona is fetched eagerly
    pub fn is_prefetch(self) -> bool {
        self == PrefetchDecision::Prefetch
    }

    /// Short machine-readable name
    pub fn as_str(self) -> &'static str {
        match self {
            PrefetchDecision::InvalidViewport => "invalid_viewport",
            PrefetchDecision::BelowTileThreshold => "below_tile_threshold",
            PrefetchDecision::HighOverlap => "high_overlap",
            PrefetchDecision::Prefetch => "prefetch",
        }
    }
}

impl fmt::Display for PrefetchDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics about reservoir usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReservoirStats {
    /// Number of tiles currently cached
    pub tile_count: usize,

    /// `get_tile` calls answered from the cache
    pub hits: u64,

    /// `get_tile` calls that had to go to the producer
    pub misses: u64,

    /// Successful producer fetches
    pub fetches: u64,

    /// Failed producer fetches
    pub fetch_failures: u64,

    /// Tiles dropped because they left the corona
    pub evictions: u64,

    /// Viewport changes that triggered a corona prefetch
    pub prefetch_batches: u64,

    /// Tiles inserted by prefetching
    pub prefetched: u64,

    /// Fetched tiles not cached because the corona moved away while they were in flight
    pub stale_discards: u64,
}

impl ReservoirStats {
    /// Fraction of `get_tile` calls served from the cache (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Result of the synchronous part of a viewport change
///
/// Eviction has already happened when a plan is returned; `to_fetch` lists
/// the corona tiles still missing from the cache (empty unless the decision
/// is [`PrefetchDecision::Prefetch`]).
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportPlan {
    /// Monotonic counter, incremented on every viewport change
    pub generation: u64,

    /// The new viewport
    pub viewport: Rect,

    /// The new corona window
    pub corona: Rect,

    /// Prefetch decision
    pub decision: PrefetchDecision,

    /// Overlap ratio between the previous and the new viewport
    pub overlap_ratio: f64,

    /// Number of tiles evicted
    pub evicted: usize,

    /// Corona tiles that still need fetching, in row-major order
    pub to_fetch: Vec<TileKey>,
}

/// Outcome of a completed [`TileReservoir::set_viewport`] call
#[derive(Debug)]
pub struct PrefetchReport {
    /// Generation of the viewport change
    pub generation: u64,

    /// The new viewport
    pub viewport: Rect,

    /// The new corona window
    pub corona: Rect,

    /// Prefetch decision
    pub decision: PrefetchDecision,

    /// Overlap ratio between the previous and the new viewport
    pub overlap_ratio: f64,

    /// Number of tiles evicted
    pub evicted: usize,

    /// Number of tiles fetched and inserted by the prefetch
    pub fetched: usize,

    /// Tiles the producer failed to supply
    pub failures: Vec<ReservoirError>,
}

impl PrefetchReport {
    fn from_plan(plan: &ViewportPlan) -> Self {
        Self {
            generation: plan.generation,
            viewport: plan.viewport,
            corona: plan.corona,
            decision: plan.decision,
            overlap_ratio: plan.overlap_ratio,
            evicted: plan.evicted,
            fetched: 0,
            failures: Vec::new(),
        }
    }

    /// Returns true if no tile failed
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Keys of the tiles that failed
    pub fn failed_keys(&self) -> Vec<TileKey> {
        self.failures.iter().map(ReservoirError::key).collect()
    }
}

/// What happened to a single prefetched key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchOutcome {
    /// The tile was fetched and inserted
    Inserted,

    /// The key was already cached; nothing was fetched or replaced
    AlreadyCached,

    /// The tile does not intersect the current corona, so it was not kept
    OutsideCorona,
}

/// Internal reservoir state, guarded by a single lock
struct ReservoirState {
    /// Cached tiles
    tiles: HashMap<TileKey, Arc<Tile>>,

    /// Last viewport set, `None` before the first call
    viewport: Option<Rect>,

    /// Current corona window
    corona: Rect,

    /// Viewport change counter
    generation: u64,

    /// Statistics
    stats: ReservoirStats,
}

impl ReservoirState {
    fn new() -> Self {
        Self {
            tiles: HashMap::new(),
            viewport: None,
            corona: Rect::default(),
            generation: 0,
            stats: ReservoirStats::default(),
        }
    }

    /// Drop every tile whose grid cell misses `corona`
    fn evict_outside(&mut self, layout: &TileLayout, corona: &Rect) -> usize {
        let before = self.tiles.len();
        self.tiles
            .retain(|key, _| layout.tile_bounds(*key).intersects(corona));
        let evicted = before - self.tiles.len();

        self.stats.evictions += evicted as u64;
        self.stats.tile_count = self.tiles.len();
        evicted
    }
}

/// Geometric tile cache around a moving viewport
///
/// Thread-safe: all cache reads, inserts, and evictions go through one
/// mutex. Producer calls run outside the lock, and the first tile inserted
/// for a key is the instance every later lookup returns. Both fill paths
/// re-check the corona when a viewport change overlapped their fetch, so
/// the corona invariant holds even with lookups racing `set_viewport`.
///
/// # Example
///
/// ```
/// use tile_reservoir_cache::{PrefetchDecision, Rect, ReservoirConfig, SyntheticProducer, TileKey, TileLayout, TileReservoir};
///
/// let layout = TileLayout::new(128, 128, Rect::new(0, 0, 8192, 8192));
/// let reservoir = TileReservoir::new(SyntheticProducer::new(layout), ReservoirConfig::default());
///
/// let first = reservoir.set_viewport(Rect::new(0, 0, 800, 600));
/// assert_eq!(first.decision, PrefetchDecision::Prefetch);
///
/// // A small scroll keeps the cached corona and fetches nothing
/// let scroll = reservoir.set_viewport(Rect::new(5, 5, 800, 600));
/// assert_eq!(scroll.decision, PrefetchDecision::HighOverlap);
/// assert_eq!(scroll.fetched, 0);
///
/// assert_eq!(reservoir.loaded_extent(), Rect::new(-295, -295, 1400, 1200));
/// ```
pub struct TileReservoir<P: TileProducer> {
    producer: P,
    layout: TileLayout,
    config: ReservoirConfig,
    state: Mutex<ReservoirState>,
}

impl<P: TileProducer> TileReservoir<P> {
    /// Create a reservoir in front of `producer`
    ///
    /// The tile layout is read from the producer once.
    pub fn new(producer: P, config: ReservoirConfig) -> Self {
        let layout = producer.layout();
        Self {
            producer,
            layout,
            config,
            state: Mutex::new(ReservoirState::new()),
        }
    }

    /// Create a reservoir with the default policy constants
    pub fn with_default_config(producer: P) -> Self {
        Self::new(producer, ReservoirConfig::default())
    }

    fn lock(&self) -> MutexGuard<'_, ReservoirState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a tile, fetching it from the producer on a miss
    ///
    /// A fetched tile is inserted regardless of the corona; the next
    /// viewport change evicts it if it lies outside. If a viewport change
    /// lands while the fetch is in flight and moves the corona away from the
    /// tile, the tile is returned but not cached. Failures are not cached
    /// either, so the next call for the same key asks the producer again.
    ///
    /// # Errors
    ///
    /// Returns [`ReservoirError::TileFetch`] if the producer fails.
    pub fn get_tile(&self, key: TileKey) -> Result<Arc<Tile>, ReservoirError> {
        let generation = {
            let mut state = self.lock();
            if let Some(tile) = state.tiles.get(&key).cloned() {
                state.stats.hits += 1;
                trace!(%key, "tile cache hit");
                return Ok(tile);
            }
            state.stats.misses += 1;
            state.generation
        };

        trace!(%key, "tile cache miss");
        let tile = self.fetch(key)?;

        let mut state = self.lock();
        if state.generation != generation
            && !self.layout.tile_bounds(key).intersects(&state.corona)
        {
            state.stats.stale_discards += 1;
            trace!(%key, "not caching tile fetched across a viewport change");
            return Ok(tile);
        }

        let tile = state.tiles.entry(key).or_insert(tile).clone();
        state.stats.tile_count = state.tiles.len();
        Ok(tile)
    }

    /// Get a cached tile without fetching or touching statistics
    pub fn peek(&self, key: TileKey) -> Option<Arc<Tile>> {
        self.lock().tiles.get(&key).cloned()
    }

    /// Announce a new viewport, evict, and prefetch if warranted
    ///
    /// Blocks until every planned corona tile has been fetched. A failing
    /// tile is logged and recorded in the report; the remaining tiles are
    /// still fetched.
    pub fn set_viewport(&self, viewport: Rect) -> PrefetchReport {
        let plan = self.plan_viewport(viewport);
        let mut report = PrefetchReport::from_plan(&plan);

        for &key in &plan.to_fetch {
            match self.fetch_into_cache(key) {
                Ok(PrefetchOutcome::Inserted) => report.fetched += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(%key, error = %err, "corona prefetch failed for tile");
                    report.failures.push(err);
                }
            }
        }

        if !plan.to_fetch.is_empty() {
            debug!(
                generation = plan.generation,
                fetched = report.fetched,
                failed = report.failures.len(),
                "corona prefetch finished"
            );
        }

        report
    }

    /// Run eviction and the prefetch decision for a new viewport
    ///
    /// This is the synchronous half of [`set_viewport`](Self::set_viewport):
    /// once it returns, every cached tile intersects the new corona. The
    /// returned plan lists the corona tiles that still need fetching; the
    /// caller fetches them with [`fetch_into_cache`](Self::fetch_into_cache),
    /// on this thread or elsewhere.
    pub fn plan_viewport(&self, viewport: Rect) -> ViewportPlan {
        let corona = viewport.grow(self.config.corona_margin);

        let mut state = self.lock();
        let old = state.viewport.unwrap_or_default();
        state.viewport = Some(viewport);
        state.corona = corona;
        state.generation += 1;

        let evicted = state.evict_outside(&self.layout, &corona);
        let (decision, overlap_ratio) =
            PrefetchDecision::evaluate(&self.config, &self.layout, &old, &viewport);

        let to_fetch: Vec<TileKey> = if decision.is_prefetch() {
            state.stats.prefetch_batches += 1;
            self.layout
                .tiles_intersecting(&corona)
                .into_iter()
                .filter(|key| !state.tiles.contains_key(key))
                .collect()
        } else {
            Vec::new()
        };

        debug!(
            generation = state.generation,
            %viewport,
            %corona,
            %decision,
            overlap_ratio,
            evicted,
            to_fetch = to_fetch.len(),
            "viewport changed"
        );

        ViewportPlan {
            generation: state.generation,
            viewport,
            corona,
            decision,
            overlap_ratio,
            evicted,
            to_fetch,
        }
    }

    /// Fetch one corona tile and insert it if it still belongs
    ///
    /// The corona check runs both before fetching (skipping work for a
    /// superseded viewport) and again at insertion, so a fetch that was in
    /// flight across a viewport change never resurrects an evicted tile.
    ///
    /// # Errors
    ///
    /// Returns [`ReservoirError::TileFetch`] if the producer fails.
    pub fn fetch_into_cache(&self, key: TileKey) -> Result<PrefetchOutcome, ReservoirError> {
        let bounds = self.layout.tile_bounds(key);
        {
            let state = self.lock();
            if state.tiles.contains_key(&key) {
                return Ok(PrefetchOutcome::AlreadyCached);
            }
            if !bounds.intersects(&state.corona) {
                return Ok(PrefetchOutcome::OutsideCorona);
            }
        }

        let tile = self.fetch(key)?;

        let mut state = self.lock();
        if !bounds.intersects(&state.corona) {
            state.stats.stale_discards += 1;
            trace!(%key, "discarding prefetched tile outside the current corona");
            return Ok(PrefetchOutcome::OutsideCorona);
        }

        let outcome = match state.tiles.entry(key) {
            Entry::Occupied(_) => PrefetchOutcome::AlreadyCached,
            Entry::Vacant(entry) => {
                entry.insert(tile);
                PrefetchOutcome::Inserted
            }
        };
        if outcome == PrefetchOutcome::Inserted {
            state.stats.prefetched += 1;
            state.stats.tile_count = state.tiles.len();
        }
        Ok(outcome)
    }

    /// Current corona window
    ///
    /// Empty (at the origin) until the first viewport is set.
    pub fn loaded_extent(&self) -> Rect {
        self.lock().corona
    }

    /// Last viewport set, if any
    pub fn viewport(&self) -> Option<Rect> {
        self.lock().viewport
    }

    /// Number of viewport changes so far
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Check if a tile is cached without touching statistics
    pub fn contains(&self, key: TileKey) -> bool {
        self.lock().tiles.contains_key(&key)
    }

    /// Number of cached tiles
    pub fn tile_count(&self) -> usize {
        self.lock().tiles.len()
    }

    /// Cached keys in sorted order
    pub fn cached_keys(&self) -> Vec<TileKey> {
        let mut keys: Vec<_> = self.lock().tiles.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Drop every cached tile
    ///
    /// The viewport and corona are kept.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.tiles.clear();
        state.stats.tile_count = 0;
    }

    /// Current statistics
    pub fn stats(&self) -> ReservoirStats {
        self.lock().stats
    }

    /// Tile geometry of the source
    pub fn layout(&self) -> &TileLayout {
        &self.layout
    }

    /// Policy constants
    pub fn config(&self) -> &ReservoirConfig {
        &self.config
    }

    /// The upstream producer
    pub fn producer(&self) -> &P {
        &self.producer
    }

    fn fetch(&self, key: TileKey) -> Result<Arc<Tile>, ReservoirError> {
        let result = self.producer.fetch_tile(key);

        let mut state = self.lock();
        match result {
            Ok(tile) => {
                state.stats.fetches += 1;
                Ok(Arc::new(tile))
            }
            Err(source) => {
                state.stats.fetch_failures += 1;
                Err(ReservoirError::TileFetch { key, source })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticProducer;

    fn reservoir() -> TileReservoir<SyntheticProducer> {
        let layout = TileLayout::new(128, 128, Rect::new(0, 0, 8192, 8192));
        TileReservoir::with_default_config(SyntheticProducer::new(layout))
    }

    #[test]
    fn test_get_tile_miss_then_hit() {
        let reservoir = reservoir();
        let key = TileKey::new(3, 3);

        let first = reservoir.get_tile(key).unwrap();
        let second = reservoir.get_tile(key).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reservoir.producer().fetch_count(), 1);

        let stats = reservoir.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.tile_count, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_get_tile_failure_is_not_cached() {
        let layout = TileLayout::new(128, 128, Rect::new(0, 0, 1024, 1024));
        let producer = SyntheticProducer::new(layout).with_failing_key(TileKey::new(1, 1));
        let reservoir = TileReservoir::with_default_config(producer);

        let err = reservoir.get_tile(TileKey::new(1, 1)).unwrap_err();
        assert_eq!(err.key(), TileKey::new(1, 1));
        assert!(!reservoir.contains(TileKey::new(1, 1)));

        // No negative caching: the producer is asked again
        assert!(reservoir.get_tile(TileKey::new(1, 1)).is_err());
        assert_eq!(reservoir.producer().fetch_count(), 2);
        assert_eq!(reservoir.stats().fetch_failures, 2);
    }

    #[test]
    fn test_loaded_extent_before_any_viewport() {
        let reservoir = reservoir();
        assert!(reservoir.loaded_extent().is_empty());
        assert!(reservoir.viewport().is_none());
        assert_eq!(reservoir.generation(), 0);
    }

    #[test]
    fn test_loaded_extent_tracks_new_viewport() {
        let reservoir = reservoir();
        reservoir.set_viewport(Rect::new(100, 200, 640, 480));
        assert_eq!(reservoir.loaded_extent(), Rect::new(-200, -100, 1240, 1080));
        assert_eq!(reservoir.viewport(), Some(Rect::new(100, 200, 640, 480)));
        assert_eq!(reservoir.generation(), 1);
    }

    #[test]
    fn test_decision_below_tile_threshold() {
        let config = ReservoirConfig::default();
        let layout = TileLayout::new(128, 128, Rect::new(0, 0, 8192, 8192));

        // 10 tiles of 128x128 = 163840 px; 200x200 + 200x200 = 80000
        let (decision, _) = PrefetchDecision::evaluate(
            &config,
            &layout,
            &Rect::new(0, 0, 200, 200),
            &Rect::new(4000, 4000, 200, 200),
        );
        assert_eq!(decision, PrefetchDecision::BelowTileThreshold);
    }

    #[test]
    fn test_decision_overlap_ratio() {
        let config = ReservoirConfig::default();
        let layout = TileLayout::new(128, 128, Rect::new(0, 0, 8192, 8192));
        let old = Rect::new(0, 0, 800, 600);

        let (decision, ratio) =
            PrefetchDecision::evaluate(&config, &layout, &old, &Rect::new(5, 5, 800, 600));
        assert_eq!(decision, PrefetchDecision::HighOverlap);
        assert!((ratio - 473_025.0 / 960_001.0).abs() < 1e-12);

        let (decision, ratio) =
            PrefetchDecision::evaluate(&config, &layout, &old, &Rect::new(5000, 5000, 800, 600));
        assert_eq!(decision, PrefetchDecision::Prefetch);
        assert_eq!(ratio, 0.0);
    }

    #[test]
    fn test_decision_invalid_viewport() {
        let config = ReservoirConfig::default();
        let layout = TileLayout::new(128, 128, Rect::new(0, 0, 8192, 8192));

        let (decision, _) = PrefetchDecision::evaluate(
            &config,
            &layout,
            &Rect::new(0, 0, 800, 600),
            &Rect::new(0, 0, 0, 600),
        );
        assert_eq!(decision, PrefetchDecision::InvalidViewport);
    }

    #[test]
    fn test_invalid_viewport_still_evicts() {
        let reservoir = reservoir();
        reservoir.set_viewport(Rect::new(0, 0, 800, 600));
        assert!(reservoir.tile_count() > 0);
        let fetches = reservoir.producer().fetch_count();

        // Zero-width viewport far away: corona is 600x1200 around (5000, 5000)
        let report = reservoir.set_viewport(Rect::new(5000, 5000, 0, 600));
        assert_eq!(report.decision, PrefetchDecision::InvalidViewport);
        assert_eq!(reservoir.tile_count(), 0);
        assert_eq!(reservoir.producer().fetch_count(), fetches);
    }

    #[test]
    fn test_plan_viewport_does_not_fetch() {
        let reservoir = reservoir();
        let plan = reservoir.plan_viewport(Rect::new(0, 0, 800, 600));

        assert_eq!(plan.decision, PrefetchDecision::Prefetch);
        assert_eq!(plan.to_fetch.len(), 9 * 8);
        assert_eq!(reservoir.producer().fetch_count(), 0);
        assert_eq!(reservoir.tile_count(), 0);
    }

    #[test]
    fn test_fetch_into_cache_outcomes() {
        let reservoir = reservoir();
        reservoir.plan_viewport(Rect::new(0, 0, 800, 600));

        let key = TileKey::new(0, 0);
        assert_eq!(reservoir.fetch_into_cache(key).unwrap(), PrefetchOutcome::Inserted);
        assert_eq!(
            reservoir.fetch_into_cache(key).unwrap(),
            PrefetchOutcome::AlreadyCached
        );

        // Far outside the corona: skipped without a fetch
        let far = TileKey::new(60, 60);
        assert_eq!(
            reservoir.fetch_into_cache(far).unwrap(),
            PrefetchOutcome::OutsideCorona
        );
        assert_eq!(reservoir.producer().fetch_count(), 1);
        assert_eq!(reservoir.stats().prefetched, 1);
    }

    #[test]
    fn test_clear_keeps_viewport() {
        let reservoir = reservoir();
        reservoir.set_viewport(Rect::new(0, 0, 800, 600));
        assert!(reservoir.tile_count() > 0);

        reservoir.clear();
        assert_eq!(reservoir.tile_count(), 0);
        assert_eq!(reservoir.stats().tile_count, 0);
        assert_eq!(reservoir.viewport(), Some(Rect::new(0, 0, 800, 600)));
    }

    #[test]
    fn test_cached_keys_sorted() {
        let reservoir = reservoir();
        reservoir.get_tile(TileKey::new(2, 0)).unwrap();
        reservoir.get_tile(TileKey::new(0, 5)).unwrap();
        reservoir.get_tile(TileKey::new(1, 1)).unwrap();

        assert_eq!(
            reservoir.cached_keys(),
            vec![TileKey::new(0, 5), TileKey::new(1, 1), TileKey::new(2, 0)]
        );
    }

    #[test]
    fn test_peek_does_not_fetch() {
        let reservoir = reservoir();
        assert!(reservoir.peek(TileKey::new(0, 0)).is_none());
        assert_eq!(reservoir.producer().fetch_count(), 0);

        let tile = reservoir.get_tile(TileKey::new(0, 0)).unwrap();
        let peeked = reservoir.peek(TileKey::new(0, 0)).unwrap();
        assert!(Arc::ptr_eq(&tile, &peeked));
        assert_eq!(reservoir.stats().hits, 0);
    }

    #[test]
    fn test_decision_display() {
        assert_eq!(PrefetchDecision::Prefetch.to_string(), "prefetch");
        assert_eq!(PrefetchDecision::HighOverlap.to_string(), "high_overlap");
        assert!(PrefetchDecision::Prefetch.is_prefetch());
        assert!(!PrefetchDecision::BelowTileThreshold.is_prefetch());
    }

    /// Producer that holds one key's fetch until the test releases it
    struct HeldProducer {
        inner: SyntheticProducer,
        held: TileKey,
        entered: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl TileProducer for HeldProducer {
        fn layout(&self) -> TileLayout {
            self.inner.layout()
        }

        fn fetch_tile(&self, key: TileKey) -> Result<Tile, ProducerError> {
            if key == self.held {
                let _ = self.entered.lock().unwrap().send(());
                let _ = self.release.lock().unwrap().recv();
            }
            self.inner.fetch_tile(key)
        }
    }

    #[test]
    fn test_lazy_fill_across_viewport_change_is_not_cached() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let held = TileKey::new(0, 0);
        let layout = TileLayout::new(128, 128, Rect::new(0, 0, 8192, 8192));
        let reservoir = TileReservoir::with_default_config(HeldProducer {
            inner: SyntheticProducer::new(layout),
            held,
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        reservoir.set_viewport(Rect::new(0, 0, 100, 100));

        std::thread::scope(|scope| {
            let lookup = scope.spawn(|| reservoir.get_tile(held));
            entered_rx.recv().unwrap();

            // Jump away while the lookup is still fetching
            let new_viewport = Rect::new(5000, 5000, 800, 600);
            reservoir.set_viewport(new_viewport);
            release_tx.send(()).unwrap();

            let tile = lookup.join().unwrap().unwrap();
            assert_eq!(tile.key(), held);
        });

        assert!(!reservoir.contains(held));
        assert_eq!(reservoir.stats().stale_discards, 1);
        let corona = reservoir.loaded_extent();
        for key in reservoir.cached_keys() {
            assert!(reservoir.layout().tile_bounds(key).intersects(&corona));
        }
    }

    #[test]
    fn test_lazy_fill_across_viewport_change_kept_inside_corona() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let held = TileKey::new(1, 1);
        let layout = TileLayout::new(128, 128, Rect::new(0, 0, 8192, 8192));
        let reservoir = TileReservoir::with_default_config(HeldProducer {
            inner: SyntheticProducer::new(layout),
            held,
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });

        std::thread::scope(|scope| {
            let lookup = scope.spawn(|| reservoir.get_tile(held));
            entered_rx.recv().unwrap();

            // Small viewport: no prefetch, and the held tile stays in the corona
            reservoir.set_viewport(Rect::new(10, 10, 100, 100));
            release_tx.send(()).unwrap();

            lookup.join().unwrap().unwrap();
        });

        assert!(reservoir.contains(held));
        assert_eq!(reservoir.stats().stale_discards, 0);
    }
}
