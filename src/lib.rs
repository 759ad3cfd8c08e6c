//! Lazily grown worker pools keyed by name, with idle and max-age expiry

pub mod common;
pub mod gate;
pub mod manager;
pub mod pool;

pub use gate::ReleaseSignal;
pub use manager::{PoolManager, PoolManagerConfig};
pub use pool::{BaseWorkerPool, Work, WorkerPool};
