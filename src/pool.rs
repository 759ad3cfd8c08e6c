//! Fixed-capacity worker pools

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::gate::{BusyGate, ReleaseSignal};

/// A unit of work
pub type Work = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Capability set of a pool the manager can hand out.
///
/// Custom pools compose a [`BaseWorkerPool`] with whatever shared state they
/// need and expose it through [`WorkerPool::base`]. Reservation, aging and
/// worker growth always go through the base pool.
pub trait WorkerPool: Send + Sync + 'static {
    fn base(&self) -> &BaseWorkerPool;

    /// Submit a unit of work, waiting while the queue is full.
    fn submit<F>(&self, work: F) -> impl Future<Output = ()> + Send
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.base().submit(work)
    }

    /// Dispose the pool.
    ///
    /// Overrides must release their own resources first and then call
    /// [`BaseWorkerPool::dispose`], which is what actually waits out
    /// reservations and stops the workers.
    fn dispose(&self) -> impl Future<Output = ()> + Send {
        self.base().dispose()
    }
}

/// Worker pool with at most `max_size` workers draining one bounded queue.
///
/// Workers are spawned lazily by the manager and live until the pool is
/// disposed.
pub struct BaseWorkerPool {
    max_size: usize,
    worker_count: AtomicUsize,
    live_workers: Arc<AtomicUsize>,
    send: Sender<Work>,
    recv: Receiver<Work>,
    /// each active user holds this open; disposal closes and drains it
    gate: Arc<BusyGate>,
    created_at: Instant,
}

impl BaseWorkerPool {
    /// Create an empty pool. This is the default pool factory.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` is zero.
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "worker pool needs room for at least one worker");
        let (send, recv) = async_channel::bounded(max_size);
        BaseWorkerPool {
            max_size,
            worker_count: AtomicUsize::new(0),
            live_workers: Arc::new(AtomicUsize::new(0)),
            send,
            recv,
            gate: Arc::new(BusyGate::new()),
            created_at: Instant::now(),
        }
    }

    /// Submit a unit of work to be executed.
    ///
    /// Once every worker is busy and another `max_size` units are queued, this
    /// waits until a worker frees up. Submitting to a disposed pool is a caller
    /// error: the work is dropped without running.
    pub async fn submit<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.send.send(Box::pin(work)).await.is_err() {
            warn!("work submitted to a disposed worker pool was dropped");
        }
    }

    /// Spawn one worker per requested unit of work, up to `max_size` in total.
    ///
    /// A caller that only ever sends one unit at a time ends up with a single
    /// worker; a caller bursting `max_size` units scales the pool to capacity
    /// at once. Returns the number of workers actually spawned.
    pub(crate) fn spawn_workers(&self, send_size: usize) -> usize {
        let max_size = self.max_size;
        let Ok(prev) =
            self.worker_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                    let new_workers = send_size.min(max_size - count);
                    (new_workers > 0).then_some(count + new_workers)
                })
        else {
            return 0;
        };

        let new_workers = send_size.min(max_size - prev);
        for _ in 0..new_workers {
            let worker = LiveWorker::new(&self.live_workers);
            tokio::spawn(run_worker(self.recv.clone(), worker));
        }
        trace!(
            new_workers,
            worker_count = prev + new_workers,
            "spawned pool workers"
        );
        new_workers
    }

    /// Mark the pool as in use, or `None` if it has been disposed.
    pub(crate) fn reserve(&self) -> Option<ReleaseSignal> {
        ReleaseSignal::acquire(&self.gate)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// number of workers spawned so far
    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::Acquire)
    }

    /// number of worker tasks that have not exited yet
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Acquire)
    }

    /// number of callers currently holding a reservation
    pub fn reservations(&self) -> usize {
        self.gate.holders()
    }

    pub fn is_disposed(&self) -> bool {
        self.send.is_closed()
    }

    /// Dispose the pool, shutting down its workers.
    ///
    /// Waits until every outstanding reservation has been released. Safe to
    /// call more than once. Workers drain the queue before exiting, so every
    /// unit submitted before disposal runs, not only the ones already picked
    /// up by a worker.
    pub async fn dispose(&self) {
        self.gate.close().await;
        if self.send.close() {
            debug!(
                workers = self.worker_count(),
                age = ?self.age(),
                "disposed worker pool"
            );
        }
    }
}

impl WorkerPool for BaseWorkerPool {
    fn base(&self) -> &BaseWorkerPool {
        self
    }
}

impl std::fmt::Debug for BaseWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseWorkerPool")
            .field("max_size", &self.max_size)
            .field("worker_count", &self.worker_count())
            .field("reservations", &self.reservations())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Tracks one running worker task.
struct LiveWorker {
    live: Arc<AtomicUsize>,
}

impl LiveWorker {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        LiveWorker {
            live: Arc::clone(live),
        }
    }
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn run_worker(queue: Receiver<Work>, _worker: LiveWorker) {
    // recv only fails once the pool is disposed and the queue is empty
    while let Ok(work) = queue.recv().await {
        // run on its own task so a panicking unit does not take the worker down
        if let Err(error) = tokio::spawn(work).await {
            warn!(%error, "pool work did not complete");
        }
    }
    trace!("pool worker exiting");
}
