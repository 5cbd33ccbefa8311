//! Bounded-parallelism task admission for outbound history fetches.
//!
//! Up to `limit` tasks run at once; the rest wait in FIFO order on a fair
//! `tokio::sync::Semaphore`. There is no priority. A waiter that is dropped
//! gives up its place in the queue.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub limit: usize,
    pub active: usize,
    pub queued: usize,
    pub peak_concurrency: usize,
    pub total_submitted: u64,
    pub total_completed: u64,
    pub avg_queue_wait_ms: f64,
}

#[derive(Default)]
struct PoolStats {
    active: AtomicUsize,
    queued: AtomicUsize,
    peak: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    admitted: AtomicU64,
    total_wait_us: AtomicU64,
}

#[derive(Clone)]
pub struct ConcurrencyPool {
    permits: Arc<Semaphore>,
    limit: usize,
    stats: Arc<PoolStats>,
}

/// Releases the running slot on drop, so bookkeeping survives panics and
/// dropped futures alike.
struct RunningGuard {
    stats: Arc<PoolStats>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        self.stats.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Holds a queue slot until admission or until the waiting future is dropped.
struct QueuedGuard {
    stats: Arc<PoolStats>,
}

impl Drop for QueuedGuard {
    fn drop(&mut self) {
        self.stats.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyPool {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Run `task` once a slot is free. The task's output, success or error,
    /// is handed back unchanged.
    pub async fn submit<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let stats = &self.stats;
        stats.submitted.fetch_add(1, Ordering::SeqCst);
        stats.queued.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedGuard {
            stats: Arc::clone(stats),
        };
        let enqueued_at = Instant::now();

        // The semaphore is never closed, so acquisition only fails if that changes.
        let _permit = self.permits.acquire().await.ok();

        drop(queued);
        let waited = enqueued_at.elapsed().as_micros() as u64;
        stats.total_wait_us.fetch_add(waited, Ordering::SeqCst);
        stats.admitted.fetch_add(1, Ordering::SeqCst);

        let running = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak.fetch_max(running, Ordering::SeqCst);
        let _guard = RunningGuard {
            stats: Arc::clone(stats),
        };

        task.await
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let s = &self.stats;
        let admitted = s.admitted.load(Ordering::SeqCst);
        let avg_queue_wait_ms = if admitted == 0 {
            0.0
        } else {
            s.total_wait_us.load(Ordering::SeqCst) as f64 / admitted as f64 / 1000.0
        };
        PoolSnapshot {
            limit: self.limit,
            active: s.active.load(Ordering::SeqCst),
            queued: s.queued.load(Ordering::SeqCst),
            peak_concurrency: s.peak.load(Ordering::SeqCst),
            total_submitted: s.submitted.load(Ordering::SeqCst),
            total_completed: s.completed.load(Ordering::SeqCst),
            avg_queue_wait_ms,
        }
    }
}
