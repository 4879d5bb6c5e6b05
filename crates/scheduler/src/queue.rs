//! Prefetch fetch queue
//!
//! Holds the corona keys of the most recent viewport change. Tiles inside
//! the viewport itself are handed out before margin tiles, FIFO within each
//! priority. Submitting a new batch supersedes whatever is still queued:
//! keys the new viewport still wants move into the new batch, the rest are
//! dropped. That is how bursts of viewport changes coalesce onto the latest
//! one.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tile_reservoir_cache::{PrefetchOutcome, Rect, TileKey, TileLayout};

/// Fetch priority of a corona tile
///
/// Higher values are fetched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FetchPriority {
    /// Tile in the corona margin, needed only after further scrolling
    Margin = 0,

    /// Tile intersecting the viewport, needed for the next paint
    Visible = 1,
}

impl FetchPriority {
    /// Priority of `key` for a viewport
    pub fn for_tile(layout: &TileLayout, viewport: &Rect, key: TileKey) -> Self {
        if layout.tile_bounds(key).intersects(viewport) {
            FetchPriority::Visible
        } else {
            FetchPriority::Margin
        }
    }
}

/// One queued corona tile
#[derive(Debug, Clone)]
pub(crate) struct FetchJob {
    /// Tile to fetch
    pub(crate) key: TileKey,

    /// Viewport generation the job was queued for
    pub(crate) generation: u64,

    /// Fetch priority
    pub(crate) priority: FetchPriority,

    /// Insertion order, for FIFO within a priority
    sequence: u64,
}

impl PartialEq for FetchJob {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for FetchJob {}

impl PartialOrd for FetchJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FetchJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence first (max-heap)
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Counts for one finished prefetch batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Viewport generation of the batch
    pub generation: u64,

    /// Tiles fetched and inserted
    pub inserted: usize,

    /// Keys that needed no fetch: already cached by another caller, or no
    /// longer inside the corona
    pub skipped: usize,

    /// Tiles the producer failed to supply
    pub failed: usize,
}

/// How a worker finished a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobResult {
    Finished(PrefetchOutcome),
    Failed,
}

/// What happened to the queued jobs of a superseded batch
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Superseded {
    /// Keys moved into the new batch, in their original queue order
    pub(crate) carried: Vec<TileKey>,

    /// Jobs dropped unfetched
    pub(crate) dropped: usize,
}

struct BatchProgress {
    remaining: usize,
    summary: BatchSummary,
}

struct QueueState {
    jobs: BinaryHeap<FetchJob>,
    next_sequence: u64,
    in_flight: usize,
    shutdown: bool,
    batch: Option<BatchProgress>,
}

/// Blocking job queue shared by the prefetcher and its workers
pub(crate) struct FetchQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    idle: Condvar,
}

impl FetchQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: BinaryHeap::new(),
                next_sequence: 0,
                in_flight: 0,
                shutdown: false,
                batch: None,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the queued jobs with a new batch
    ///
    /// Every still-queued job of the previous batch is offered to `carry`.
    /// If it returns a priority, the key joins the new batch (once, even if
    /// `keys` already lists it); otherwise the job is dropped unfetched.
    /// `carry` runs under the queue lock.
    pub(crate) fn submit_batch<F>(
        &self,
        generation: u64,
        keys: Vec<(TileKey, FetchPriority)>,
        carry: F,
    ) -> Superseded
    where
        F: Fn(TileKey) -> Option<FetchPriority>,
    {
        let mut state = self.lock();

        let mut previous = std::mem::take(&mut state.jobs).into_vec();
        previous.sort_unstable_by_key(|job| job.sequence);

        let mut batch = keys;
        let mut seen: HashSet<TileKey> = batch.iter().map(|&(key, _)| key).collect();
        let mut superseded = Superseded::default();
        for job in previous {
            match carry(job.key) {
                Some(priority) => {
                    if seen.insert(job.key) {
                        superseded.carried.push(job.key);
                        batch.push((job.key, priority));
                    }
                }
                None => superseded.dropped += 1,
            }
        }

        if batch.is_empty() {
            state.batch = None;
            if state.in_flight == 0 {
                self.idle.notify_all();
            }
            return superseded;
        }

        state.batch = Some(BatchProgress {
            remaining: batch.len(),
            summary: BatchSummary {
                generation,
                ..BatchSummary::default()
            },
        });

        for (key, priority) in batch {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.jobs.push(FetchJob {
                key,
                generation,
                priority,
                sequence,
            });
        }

        self.available.notify_all();
        superseded
    }

    /// Take the next job, waiting up to `timeout` for one to arrive
    ///
    /// Returns `None` on timeout or once the queue is shut down.
    pub(crate) fn pop(&self, timeout: Duration) -> Option<FetchJob> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if state.shutdown {
                return None;
            }
            if let Some(job) = state.jobs.pop() {
                state.in_flight += 1;
                return Some(job);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Record a finished job
    ///
    /// Returns the batch summary if this was the last job of the current
    /// batch. Jobs from superseded batches only release their in-flight slot.
    pub(crate) fn complete(&self, job: &FetchJob, result: JobResult) -> Option<BatchSummary> {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);

        let mut finished = None;
        if let Some(batch) = state.batch.as_mut() {
            if batch.summary.generation == job.generation {
                match result {
                    JobResult::Finished(PrefetchOutcome::Inserted) => batch.summary.inserted += 1,
                    JobResult::Finished(
                        PrefetchOutcome::AlreadyCached | PrefetchOutcome::OutsideCorona,
                    ) => batch.summary.skipped += 1,
                    JobResult::Failed => batch.summary.failed += 1,
                }
                batch.remaining -= 1;
                if batch.remaining == 0 {
                    finished = Some(batch.summary);
                }
            }
        }
        if finished.is_some() {
            state.batch = None;
        }

        if state.jobs.is_empty() && state.in_flight == 0 {
            self.idle.notify_all();
        }
        finished
    }

    /// Queued plus in-flight jobs
    pub(crate) fn pending(&self) -> usize {
        let state = self.lock();
        state.jobs.len() + state.in_flight
    }

    /// Block until nothing is queued or in flight
    ///
    /// Returns false if `timeout` elapsed first.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        while !(state.jobs.is_empty() && state.in_flight == 0) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .idle
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Drop queued jobs and wake every waiting worker
    pub(crate) fn shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        state.jobs.clear();
        state.batch = None;
        self.available.notify_all();
        self.idle.notify_all();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(10);

    fn keys(list: &[(i32, i32, FetchPriority)]) -> Vec<(TileKey, FetchPriority)> {
        list.iter()
            .map(|&(c, r, p)| (TileKey::new(c, r), p))
            .collect()
    }

    fn drop_all(_: TileKey) -> Option<FetchPriority> {
        None
    }

    #[test]
    fn test_priority_for_tile() {
        let layout = TileLayout::new(128, 128, Rect::new(0, 0, 4096, 4096));
        let viewport = Rect::new(256, 256, 800, 600);

        assert_eq!(
            FetchPriority::for_tile(&layout, &viewport, TileKey::new(2, 2)),
            FetchPriority::Visible
        );
        assert_eq!(
            FetchPriority::for_tile(&layout, &viewport, TileKey::new(1, 2)),
            FetchPriority::Margin
        );
        assert!(FetchPriority::Visible > FetchPriority::Margin);
    }

    #[test]
    fn test_visible_before_margin_then_fifo() {
        let queue = FetchQueue::new();
        queue.submit_batch(
            1,
            keys(&[
                (0, 0, FetchPriority::Margin),
                (1, 0, FetchPriority::Visible),
                (2, 0, FetchPriority::Margin),
                (3, 0, FetchPriority::Visible),
            ]),
            drop_all,
        );

        let order: Vec<_> = std::iter::from_fn(|| queue.pop(SHORT))
            .map(|job| job.key.column)
            .collect();
        assert_eq!(order, vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_submit_drops_unwanted_jobs() {
        let queue = FetchQueue::new();
        queue.submit_batch(
            1,
            keys(&[(0, 0, FetchPriority::Margin), (1, 0, FetchPriority::Margin)]),
            drop_all,
        );

        let superseded = queue.submit_batch(2, keys(&[(9, 9, FetchPriority::Visible)]), drop_all);
        assert_eq!(superseded, Superseded { carried: Vec::new(), dropped: 2 });

        let job = queue.pop(SHORT).unwrap();
        assert_eq!(job.key, TileKey::new(9, 9));
        assert_eq!(job.generation, 2);
        assert!(queue.pop(SHORT).is_none());
    }

    #[test]
    fn test_submit_carries_wanted_jobs() {
        let queue = FetchQueue::new();
        queue.submit_batch(
            1,
            keys(&[
                (0, 0, FetchPriority::Visible),
                (1, 0, FetchPriority::Margin),
                (2, 0, FetchPriority::Margin),
            ]),
            drop_all,
        );

        // Column 0 is already in the new batch, column 2 is no longer wanted
        let superseded = queue.submit_batch(
            2,
            keys(&[(0, 0, FetchPriority::Margin)]),
            |key| (key.column < 2).then_some(FetchPriority::Visible),
        );
        assert_eq!(
            superseded,
            Superseded { carried: vec![TileKey::new(1, 0)], dropped: 1 }
        );

        let jobs: Vec<_> = std::iter::from_fn(|| queue.pop(SHORT)).collect();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].key, TileKey::new(1, 0));
        assert_eq!(jobs[0].priority, FetchPriority::Visible);
        assert_eq!(jobs[1].key, TileKey::new(0, 0));
        assert!(jobs.iter().all(|job| job.generation == 2));

        let first = queue.complete(&jobs[0], JobResult::Finished(PrefetchOutcome::Inserted));
        assert!(first.is_none());
        let summary = queue
            .complete(&jobs[1], JobResult::Finished(PrefetchOutcome::Inserted))
            .unwrap();
        assert_eq!(summary.generation, 2);
        assert_eq!(summary.inserted, 2);
    }

    #[test]
    fn test_carried_jobs_alone_form_a_batch() {
        let queue = FetchQueue::new();
        queue.submit_batch(1, keys(&[(4, 4, FetchPriority::Margin)]), drop_all);

        let superseded =
            queue.submit_batch(2, Vec::new(), |_| Some(FetchPriority::Margin));
        assert_eq!(superseded.carried, vec![TileKey::new(4, 4)]);
        assert_eq!(queue.pending(), 1);

        let job = queue.pop(SHORT).unwrap();
        let summary = queue
            .complete(&job, JobResult::Finished(PrefetchOutcome::AlreadyCached))
            .unwrap();
        assert_eq!(summary.generation, 2);
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn test_summary_on_last_job() {
        let queue = FetchQueue::new();
        queue.submit_batch(
            7,
            keys(&[
                (0, 0, FetchPriority::Visible),
                (1, 0, FetchPriority::Visible),
                (2, 0, FetchPriority::Margin),
            ]),
            drop_all,
        );

        let a = queue.pop(SHORT).unwrap();
        let b = queue.pop(SHORT).unwrap();
        let c = queue.pop(SHORT).unwrap();
        assert_eq!(queue.pending(), 3);

        assert!(queue
            .complete(&a, JobResult::Finished(PrefetchOutcome::Inserted))
            .is_none());
        assert!(queue.complete(&b, JobResult::Failed).is_none());
        let summary = queue
            .complete(&c, JobResult::Finished(PrefetchOutcome::AlreadyCached))
            .unwrap();

        assert_eq!(
            summary,
            BatchSummary {
                generation: 7,
                inserted: 1,
                skipped: 1,
                failed: 1,
            }
        );
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_superseded_job_does_not_count() {
        let queue = FetchQueue::new();
        queue.submit_batch(1, keys(&[(0, 0, FetchPriority::Visible)]), drop_all);
        let stale = queue.pop(SHORT).unwrap();

        queue.submit_batch(2, keys(&[(5, 5, FetchPriority::Visible)]), drop_all);
        let outcome = JobResult::Finished(PrefetchOutcome::OutsideCorona);
        assert!(queue.complete(&stale, outcome).is_none());

        let fresh = queue.pop(SHORT).unwrap();
        let summary = queue
            .complete(&fresh, JobResult::Finished(PrefetchOutcome::Inserted))
            .unwrap();
        assert_eq!(summary.generation, 2);
        assert_eq!(summary.inserted, 1);
    }

    #[test]
    fn test_wait_idle() {
        let queue = FetchQueue::new();
        assert!(queue.wait_idle(SHORT));

        queue.submit_batch(1, keys(&[(0, 0, FetchPriority::Visible)]), drop_all);
        assert!(!queue.wait_idle(SHORT));

        let job = queue.pop(SHORT).unwrap();
        assert!(!queue.wait_idle(SHORT));
        queue.complete(&job, JobResult::Finished(PrefetchOutcome::Inserted));
        assert!(queue.wait_idle(SHORT));
    }

    #[test]
    fn test_pop_after_shutdown() {
        let queue = FetchQueue::new();
        queue.submit_batch(1, keys(&[(0, 0, FetchPriority::Visible)]), drop_all);

        queue.shutdown();
        assert!(queue.is_shutdown());
        assert!(queue.pop(SHORT).is_none());
        assert_eq!(queue.pending(), 0);
    }
}
