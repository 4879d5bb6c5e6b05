//! Background corona prefetching
//!
//! [`BackgroundPrefetcher`] moves the fetch half of a viewport change off
//! the caller's thread. Eviction and the prefetch decision still run
//! synchronously in [`request_viewport`](BackgroundPrefetcher::request_viewport),
//! so the corona invariant holds as soon as it returns; the corona tiles are
//! then fetched by a pool of worker threads.

use crate::queue::{FetchPriority, FetchQueue};
use crate::worker::{self, BatchCallback, WorkerContext};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tile_reservoir_cache::{
    Rect, ReservoirError, Tile, TileKey, TileProducer, TileReservoir, ViewportPlan,
};
use tracing::{debug, info, warn};

/// Errors from the background prefetcher
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A worker thread could not be spawned
    #[error("failed to spawn prefetch worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// The pool was configured without workers
    #[error("prefetcher needs at least one worker")]
    NoWorkers,
}

/// Configuration for the prefetch worker pool.
#[derive(Debug, Clone)]
pub struct PrefetcherConfig {
    /// Number of worker threads to spawn.
    /// Default: number of logical CPU cores.
    pub num_workers: usize,

    /// Maximum time a worker waits for a job before checking for shutdown.
    /// Default: 100ms.
    pub poll_interval: Duration,
}

impl Default for PrefetcherConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl PrefetcherConfig {
    /// Create a configuration with a fixed number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Set the poll interval for workers.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Tile reservoir with asynchronous corona prefetching
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tile_reservoir_cache::{Rect, SyntheticProducer, TileLayout, TileReservoir};
/// use tile_reservoir_scheduler::{BackgroundPrefetcher, PrefetcherConfig};
///
/// let layout = TileLayout::new(128, 128, Rect::new(0, 0, 8192, 8192));
/// let reservoir = Arc::new(TileReservoir::with_default_config(SyntheticProducer::new(layout)));
/// let prefetcher = BackgroundPrefetcher::new(reservoir, PrefetcherConfig::new(2)).unwrap();
///
/// // Returns as soon as eviction is done; tiles arrive in the background
/// let plan = prefetcher.request_viewport(Rect::new(0, 0, 800, 600));
/// assert!(prefetcher.wait_idle(Duration::from_secs(5)));
/// assert_eq!(prefetcher.reservoir().tile_count(), plan.to_fetch.len());
///
/// prefetcher.shutdown();
/// ```
pub struct BackgroundPrefetcher<P: TileProducer + 'static> {
    reservoir: Arc<TileReservoir<P>>,
    queue: Arc<FetchQueue>,
    submit: Mutex<()>,
    workers: Vec<JoinHandle<()>>,
}

impl<P: TileProducer + 'static> BackgroundPrefetcher<P> {
    /// Start a worker pool in front of `reservoir`
    ///
    /// # Errors
    ///
    /// Returns an error if `config.num_workers` is zero or a thread cannot
    /// be spawned.
    pub fn new(
        reservoir: Arc<TileReservoir<P>>,
        config: PrefetcherConfig,
    ) -> Result<Self, SchedulerError> {
        Self::start(reservoir, config, None)
    }

    /// Start a worker pool that reports every finished batch to `callback`
    ///
    /// The callback runs on the worker thread that finished the batch's last
    /// job. Batches superseded by a newer viewport are never reported.
    ///
    /// # Errors
    ///
    /// Returns an error if `config.num_workers` is zero or a thread cannot
    /// be spawned.
    pub fn with_callback(
        reservoir: Arc<TileReservoir<P>>,
        config: PrefetcherConfig,
        callback: BatchCallback,
    ) -> Result<Self, SchedulerError> {
        Self::start(reservoir, config, Some(callback))
    }

    fn start(
        reservoir: Arc<TileReservoir<P>>,
        config: PrefetcherConfig,
        on_batch_complete: Option<BatchCallback>,
    ) -> Result<Self, SchedulerError> {
        if config.num_workers == 0 {
            return Err(SchedulerError::NoWorkers);
        }

        let queue = Arc::new(FetchQueue::new());
        let context = WorkerContext {
            reservoir: reservoir.clone(),
            queue: queue.clone(),
            on_batch_complete,
            poll_interval: config.poll_interval,
        };

        let mut prefetcher = Self {
            reservoir,
            queue,
            submit: Mutex::new(()),
            workers: Vec::with_capacity(config.num_workers),
        };

        for id in 0..config.num_workers {
            // On failure, dropping `prefetcher` stops the workers already running
            let handle = worker::spawn(id, context.clone())?;
            prefetcher.workers.push(handle);
        }

        info!(workers = config.num_workers, "prefetch worker pool started");
        Ok(prefetcher)
    }

    /// Announce a new viewport
    ///
    /// Evicts and decides synchronously, then queues the corona tiles for
    /// the workers. Keys still queued for an earlier viewport stay queued if
    /// they intersect the new corona and are not cached yet, so a small
    /// scroll that arrives before a prefetch finished still ends up with the
    /// same tiles as the synchronous [`TileReservoir::set_viewport`]. Other
    /// queued keys are dropped.
    ///
    /// Returns the plan with those carried keys appended to `to_fetch`.
    pub fn request_viewport(&self, viewport: Rect) -> ViewportPlan {
        // Held across plan and submit so concurrent callers queue in plan order
        let _submit = self.submit.lock().unwrap_or_else(PoisonError::into_inner);

        let mut plan = self.reservoir.plan_viewport(viewport);
        let layout = self.reservoir.layout();
        let corona = plan.corona;
        let jobs: Vec<_> = plan
            .to_fetch
            .iter()
            .map(|&key| (key, FetchPriority::for_tile(layout, &viewport, key)))
            .collect();

        // Takes the reservoir lock under the queue lock; nothing nests them the other way
        let superseded = self.queue.submit_batch(plan.generation, jobs, |key| {
            let wanted =
                layout.tile_bounds(key).intersects(&corona) && !self.reservoir.contains(key);
            wanted.then(|| FetchPriority::for_tile(layout, &viewport, key))
        });

        if !superseded.carried.is_empty() || superseded.dropped > 0 {
            debug!(
                generation = plan.generation,
                carried = superseded.carried.len(),
                dropped = superseded.dropped,
                "superseded prefetch jobs"
            );
        }
        plan.to_fetch.extend(superseded.carried);

        plan
    }

    /// Get a tile through the reservoir, fetching it on a miss
    ///
    /// # Errors
    ///
    /// Returns [`ReservoirError::TileFetch`] if the producer fails.
    pub fn get_tile(&self, key: TileKey) -> Result<Arc<Tile>, ReservoirError> {
        self.reservoir.get_tile(key)
    }

    /// Current corona window
    pub fn loaded_extent(&self) -> Rect {
        self.reservoir.loaded_extent()
    }

    /// The wrapped reservoir
    pub fn reservoir(&self) -> &Arc<TileReservoir<P>> {
        &self.reservoir
    }

    /// Number of worker threads
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Keys queued or being fetched
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Block until every queued key has been processed
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.queue.wait_idle(timeout)
    }

    /// Stop the workers and wait for them to exit
    ///
    /// Queued keys are dropped; fetches already in flight complete first.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        self.queue.shutdown();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("prefetch worker panicked");
            }
        }
        info!("prefetch worker pool stopped");
    }
}

impl<P: TileProducer + 'static> Drop for BackgroundPrefetcher<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Get the number of logical CPU cores.
fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
