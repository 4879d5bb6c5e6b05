//! Prefetch worker threads.
//!
//! Workers pull corona keys from the shared fetch queue and push them
//! through [`TileReservoir::fetch_into_cache`], which checks the corona
//! both before fetching and at insertion time.

use crate::queue::{BatchSummary, FetchQueue, JobResult};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tile_reservoir_cache::{TileProducer, TileReservoir};
use tracing::{debug, warn};

/// Callback invoked on a worker thread when a prefetch batch finishes.
pub type BatchCallback = Arc<dyn Fn(&BatchSummary) + Send + Sync>;

/// Everything a worker thread needs.
pub(crate) struct WorkerContext<P: TileProducer + 'static> {
    pub(crate) reservoir: Arc<TileReservoir<P>>,
    pub(crate) queue: Arc<FetchQueue>,
    pub(crate) on_batch_complete: Option<BatchCallback>,
    pub(crate) poll_interval: Duration,
}

impl<P: TileProducer + 'static> Clone for WorkerContext<P> {
    fn clone(&self) -> Self {
        Self {
            reservoir: self.reservoir.clone(),
            queue: self.queue.clone(),
            on_batch_complete: self.on_batch_complete.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

/// Spawn one named worker thread.
pub(crate) fn spawn<P: TileProducer + 'static>(
    id: usize,
    context: WorkerContext<P>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("tile-prefetch-worker-{}", id))
        .spawn(move || run(id, context))
}

/// Main worker loop.
///
/// Runs until the queue is shut down. Waiting for work is bounded by the
/// poll interval so a shutdown is noticed promptly even without a wake-up.
fn run<P: TileProducer + 'static>(id: usize, context: WorkerContext<P>) {
    debug!(worker = id, "prefetch worker started");

    loop {
        let Some(job) = context.queue.pop(context.poll_interval) else {
            if context.queue.is_shutdown() {
                break;
            }
            continue;
        };

        // Keys that left the corona since they were queued are skipped here
        let result = match context.reservoir.fetch_into_cache(job.key) {
            Ok(outcome) => JobResult::Finished(outcome),
            Err(err) => {
                warn!(worker = id, key = %job.key, error = %err, "background prefetch failed");
                JobResult::Failed
            }
        };

        if let Some(summary) = context.queue.complete(&job, result) {
            debug!(
                worker = id,
                generation = summary.generation,
                inserted = summary.inserted,
                failed = summary.failed,
                "prefetch batch finished"
            );
            if let Some(callback) = &context.on_batch_complete {
                callback(&summary);
            }
        }
    }

    debug!(worker = id, "prefetch worker stopped");
}
