// Bounded worker pools for blocking tool bodies
//
// Pools isolate blocking I/O from the cooperative scheduler. They are
// keyed by configured size, created lazily, and never shrunk. The
// provider is injected (rather than process-wide mutable state) so
// tests get a fresh, resettable registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use tokio::sync::Semaphore;

use crate::error::{Result, RuntimeError};

/// Default pool size when a turn enables pooling without a size.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// A bounded pool running blocking closures on worker threads.
///
/// Backed by tokio's blocking thread pool with a semaphore enforcing
/// the configured concurrency bound.
#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs a blocking closure on a worker thread, waiting for a permit
    /// when the pool is saturated.
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| RuntimeError::Internal(anyhow!("worker pool closed: {e}")))?;
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| RuntimeError::Internal(anyhow!("worker thread panicked: {e}")))
    }
}

/// Capability that hands out worker pools by size.
pub trait PoolProvider: Send + Sync {
    /// Returns the pool for `size`, creating it on first use.
    fn pool(&self, size: usize) -> Arc<WorkerPool>;
}

/// Size-keyed pool registry shared across an agent's turns.
#[derive(Default)]
pub struct SharedPoolProvider {
    pools: Mutex<HashMap<usize, Arc<WorkerPool>>>,
}

impl SharedPoolProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pools created so far.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().expect("pool registry poisoned").len()
    }
}

impl PoolProvider for SharedPoolProvider {
    fn pool(&self, size: usize) -> Arc<WorkerPool> {
        let mut pools = self.pools.lock().expect("pool registry poisoned");
        Arc::clone(
            pools
                .entry(size)
                .or_insert_with(|| Arc::new(WorkerPool::new(size))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_blocking_returns_closure_result() {
        let pool = WorkerPool::new(2);
        let result = pool.run_blocking(|| 40 + 2).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn test_pools_are_keyed_by_size_and_reused() {
        let provider = SharedPoolProvider::new();
        assert_eq!(provider.pool_count(), 0);

        let a = provider.pool(4);
        let b = provider.pool(4);
        let c = provider.pool(8);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(provider.pool_count(), 2);
        assert_eq!(c.size(), 8);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let pool = Arc::new(WorkerPool::new(1));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                pool.run_blocking(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
