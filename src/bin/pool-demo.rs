use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use eyre::Context;
use keyed_worker_pools::{PoolManager, PoolManagerConfig, common};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::info;

/// Push simulated jobs for several keys through a pool manager
#[derive(Debug, Parser)]
struct Args {
    /// max number of workers per key
    #[arg(long, default_value_t = 8)]
    pool_size: usize,
    /// milliseconds an unused pool stays cached
    #[arg(long, default_value_t = 500)]
    stale_ms: u64,
    /// milliseconds a pool may live regardless of use
    #[arg(long, default_value_t = 2000)]
    lifetime_ms: u64,
    /// number of distinct keys
    #[arg(long, default_value_t = 3)]
    keys: usize,
    /// jobs submitted per key
    #[arg(long, default_value_t = 32)]
    jobs: usize,
    /// simulated duration of each job in milliseconds
    #[arg(long, default_value_t = 10)]
    job_ms: u64,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    common::initialize_logging()?;
    let args = Args::parse();

    let config = PoolManagerConfig::new(
        args.pool_size,
        Duration::from_millis(args.stale_ms),
        Duration::from_millis(args.lifetime_ms),
    );
    let manager = Arc::new(PoolManager::new(config).wrap_err("starting pool manager")?);

    let started = Instant::now();
    let mut callers = JoinSet::new();
    for key in 0..args.keys {
        let manager = Arc::clone(&manager);
        let key = format!("client-{key}");
        let (jobs, job_time) = (args.jobs, Duration::from_millis(args.job_ms));
        callers.spawn(async move {
            let (pool, release) = manager.get_pool(&key, jobs).await;
            let mut finished = Vec::with_capacity(jobs);
            for _ in 0..jobs {
                let (done, finish) = oneshot::channel();
                pool.submit(async move {
                    tokio::time::sleep(job_time).await;
                    let _ = done.send(());
                })
                .await;
                finished.push(finish);
            }
            let mut completed = 0usize;
            for finish in finished {
                if finish.await.is_ok() {
                    completed += 1;
                }
            }
            release.release();
            info!(key = %key, completed, workers = pool.worker_count(), "finished jobs");
            completed
        });
    }

    let mut completed = 0;
    while let Some(result) = callers.join_next().await {
        completed += result.wrap_err("caller task failed")?;
    }
    info!(completed, elapsed = ?started.elapsed(), "all jobs done");

    tokio::time::sleep(Duration::from_millis(args.stale_ms * 2)).await;
    info!(cached = manager.pool_count().await, "after stale expiration");

    manager.dispose().await;
    Ok(())
}
