//! Self-expiring, lazily constructed map of worker pools

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use eyre::{Context, ensure};
use moka::future::Cache;
use moka::notification::RemovalCause;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::gate::ReleaseSignal;
use crate::pool::{BaseWorkerPool, WorkerPool};

/// Bounds on how often the background sweep evicts idle pools.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Manager settings, fixed at construction
#[derive(Debug, Clone)]
pub struct PoolManagerConfig {
    /// max number of workers for each key
    pub max_pool_size: usize,
    /// how long to cache unused pools for
    pub stale_pool_expiration: Duration,
    /// max time to allow a pool to live, even while in use
    pub max_pool_lifetime: Duration,
}

impl PoolManagerConfig {
    pub fn new(
        max_pool_size: usize,
        stale_pool_expiration: Duration,
        max_pool_lifetime: Duration,
    ) -> Self {
        PoolManagerConfig {
            max_pool_size,
            stale_pool_expiration,
            max_pool_lifetime,
        }
    }

    pub fn validate(&self) -> eyre::Result<()> {
        ensure!(self.max_pool_size > 0, "max pool size must be at least 1");
        ensure!(
            !self.stale_pool_expiration.is_zero(),
            "stale pool expiration must be non-zero"
        );
        ensure!(
            !self.max_pool_lifetime.is_zero(),
            "max pool lifetime must be non-zero"
        );
        Ok(())
    }

    /// how often the background sweep applies idle expiry
    pub fn sweep_interval(&self) -> Duration {
        (self.stale_pool_expiration / 10).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
    }
}

/// Keyed cache of worker pools, safe for concurrent use.
///
/// Pools are built on first request for a key, grown as callers ask for more
/// workers, evicted after sitting idle for `stale_pool_expiration`, and forcibly
/// retired once older than `max_pool_lifetime`. A pool handed out by the
/// manager is never disposed until its caller releases it.
pub struct PoolManager<P: WorkerPool = BaseWorkerPool> {
    cache: Cache<String, Arc<P>>,
    config: PoolManagerConfig,
    /// serializes lookup-or-create-then-reserve across all keys
    reservation_lock: tokio::sync::Mutex<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<P: WorkerPool> PoolManager<P> {
    /// Create a manager and start its background sweep.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PoolManagerConfig) -> eyre::Result<Self> {
        config.validate().wrap_err("invalid pool manager config")?;
        let runtime =
            Handle::try_current().wrap_err("pool manager must be created inside a tokio runtime")?;

        let disposer = runtime.clone();
        let cache = Cache::builder()
            .time_to_idle(config.stale_pool_expiration)
            .eviction_listener(move |key: Arc<String>, pool: Arc<P>, cause: RemovalCause| {
                debug!(key = %key, ?cause, "evicting worker pool");
                // dispose blocks on reservations, so never run it on the evicting thread
                disposer.spawn(async move { pool.dispose().await });
            })
            .build();

        let sweeper = runtime.spawn(sweep(cache.clone(), config.sweep_interval()));

        info!(
            max_pool_size = config.max_pool_size,
            stale_pool_expiration = ?config.stale_pool_expiration,
            max_pool_lifetime = ?config.max_pool_lifetime,
            "pool manager started"
        );

        Ok(PoolManager {
            cache,
            config,
            reservation_lock: tokio::sync::Mutex::new(()),
            sweeper: Mutex::new(Some(sweeper)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PoolManagerConfig {
        &self.config
    }

    /// Return the pool for this key, building it with `factory` if necessary.
    ///
    /// Spawns up to `send_size` new workers, capped at the manager's max pool
    /// size. The pool comes back reserved: it will not be disposed until the
    /// returned [`ReleaseSignal`] is released or dropped. Errors from the
    /// factory are returned as-is and leave the cache untouched.
    pub async fn get_pool_with_factory<F>(
        &self,
        key: &str,
        send_size: usize,
        factory: F,
    ) -> eyre::Result<(Arc<P>, ReleaseSignal)>
    where
        F: Fn(usize) -> eyre::Result<P>,
    {
        self.acquire(key, send_size, factory).await
    }

    #[instrument(level = "trace", skip(self, factory))]
    async fn acquire<F, E>(
        &self,
        key: &str,
        send_size: usize,
        factory: F,
    ) -> Result<(Arc<P>, ReleaseSignal), E>
    where
        F: Fn(usize) -> Result<P, E>,
    {
        if self.is_disposed() {
            warn!(key, "worker pool requested from a disposed manager");
        }

        let mut attempts = 0usize;
        loop {
            let _reservation = self.reservation_lock.lock().await;

            let pool = match self.cache.get(key).await {
                Some(pool) => pool,
                None => {
                    let pool = Arc::new(factory(self.config.max_pool_size)?);
                    self.cache.insert(key.to_owned(), Arc::clone(&pool)).await;
                    debug!(key, "created worker pool");
                    pool
                }
            };

            // holding a reservation guarantees the pool outlives our use of it;
            // failing to get one means it was disposed after we found it
            let Some(release) = pool.base().reserve() else {
                attempts += 1;
                debug!(key, attempts, "worker pool disposed before reservation, retrying");
                self.cache.invalidate(key).await;
                continue;
            };

            pool.base().spawn_workers(send_size);

            // retire old pools; disposal waits until every holder, including
            // this caller, has released
            let age = pool.base().age();
            if age > self.config.max_pool_lifetime {
                debug!(key, ?age, "worker pool exceeded max lifetime");
                self.cache.invalidate(key).await;
                let expired = Arc::clone(&pool);
                tokio::spawn(async move { expired.dispose().await });
            }

            return Ok((pool, release));
        }
    }

    /// whether [`PoolManager::dispose`] has been called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// number of cached pools, after applying any pending expiry
    pub async fn pool_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    /// Stop the background sweep and dispose every cached pool.
    ///
    /// Waits for outstanding reservations on those pools to be released. Only
    /// the removal from the cache happens under the manager lock, so holders
    /// can keep requesting other pools while their own drains. Requesting pools
    /// after this is a caller error: they still work but nothing sweeps them.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        let pools: Vec<Arc<P>> = {
            let _reservation = self.reservation_lock.lock().await;
            let pools = self.cache.iter().map(|(_, pool)| pool).collect();
            self.cache.invalidate_all();
            self.cache.run_pending_tasks().await;
            pools
        };
        for pool in &pools {
            pool.dispose().await;
        }
        info!(pools = pools.len(), "pool manager disposed");
    }
}

impl PoolManager<BaseWorkerPool> {
    /// Return the pool for this key, building a [`BaseWorkerPool`] if necessary.
    ///
    /// See [`PoolManager::get_pool_with_factory`].
    pub async fn get_pool(
        &self,
        key: &str,
        send_size: usize,
    ) -> (Arc<BaseWorkerPool>, ReleaseSignal) {
        let Ok(pool) = self
            .acquire(key, send_size, |max_size| {
                Ok::<_, Infallible>(BaseWorkerPool::new(max_size))
            })
            .await;
        pool
    }
}

impl<P: WorkerPool> Drop for PoolManager<P> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

/// Apply idle expiry on a fixed period; the cache only does so when poked.
async fn sweep<P: WorkerPool>(cache: Cache<String, Arc<P>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        cache.run_pending_tasks().await;
    }
}
