//! Execution data manager: the façade the dashboard talks to.
//!
//! Per call it resolves the job's peer-data classification, serves from the
//! own cache or a fresh peer entry when it can, and otherwise asks the worker,
//! merging the result into the own store. Concurrent calls for the same job
//! and window share one load.

pub mod classify;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, CacheConfig};
use crate::fetcher::{FetchSettings, FetchWindow, HostTarget, RemoteFetcherFactory};
use crate::model::{filter_executions_by_date, DateRange, ExecutionCacheEntry, ExecutionRecord};
use crate::store::peer::{open_peer_store, PeerStore};
use crate::store::{OwnStore, StoreError, StoreStats};
use crate::worker::protocol::{JobProcessed, WorkerHealth};
use crate::worker::{SupervisorPolicy, WorkerError, WorkerSettings, WorkerSupervisor};

pub use self::classify::{ClassSource, Classification};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManagerError {
    #[error("own store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("load task failed: {0}")]
    Task(String),
}

/// Diagnostics returned by [`ExecutionDataManager::metrics`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub peer_hits: u64,
    pub worker_fetches: u64,
    pub coalesced: u64,
    pub fallbacks: u64,
    pub errors: u64,
    pub store: StoreStats,
    /// `None` when no worker is running.
    pub worker: Option<WorkerHealth>,
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    peer_hits: AtomicU64,
    worker_fetches: AtomicU64,
    coalesced: AtomicU64,
    fallbacks: AtomicU64,
    errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

type LoadResult = Result<Vec<ExecutionRecord>, ManagerError>;
type InFlight = Shared<BoxFuture<'static, LoadResult>>;

/// Clears a load's in-flight entry when the load task ends, panics included.
struct InFlightSlot {
    inner: Arc<ManagerInner>,
    key: (String, u32),
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.inner.in_flight.lock() {
            in_flight.remove(&self.key);
        }
    }
}

/// Failure inside the cached path, split by how it is handled.
enum LoadFailure {
    /// Cache-layer trouble: fall back to a direct worker fetch.
    Cache(StoreError),
    /// The worker already failed; surfaced as-is.
    Worker(WorkerError),
}

#[derive(Clone)]
pub struct ExecutionDataManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    cache: CacheConfig,
    own: OwnStore,
    peer: Option<Arc<dyn PeerStore>>,
    worker: WorkerSupervisor,
    memo: classify::ClassMemo,
    in_flight: Mutex<HashMap<(String, u32), InFlight>>,
    job_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    counters: Counters,
}

impl ExecutionDataManager {
    /// `peer` is `None` when the companion plugin is not installed.
    pub fn new(
        cache: CacheConfig,
        own: OwnStore,
        peer: Option<Arc<dyn PeerStore>>,
        worker: WorkerSupervisor,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                cache,
                own,
                peer,
                worker,
                memo: classify::ClassMemo::default(),
                in_flight: Mutex::new(HashMap::new()),
                job_locks: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Wire up the real stores and an HTTP-backed worker from configuration.
    pub fn from_config(cfg: &AppConfig) -> Self {
        let factory = RemoteFetcherFactory::new(FetchSettings::from_config(&cfg.host, &cfg.worker));
        let target = HostTarget {
            rd_base: cfg.host.rd_base.clone(),
            project: cfg.host.project.clone(),
        };
        let settings = WorkerSettings {
            max_concurrent: cfg.worker.max_concurrent,
            ..WorkerSettings::default()
        };
        let worker = WorkerSupervisor::new(
            Arc::new(factory),
            target,
            settings,
            SupervisorPolicy::from_config(&cfg.worker),
        );

        Self::new(
            cfg.cache.clone(),
            OwnStore::new(&cfg.cache.db_path),
            open_peer_store(&cfg.peer),
            worker,
        )
    }

    pub fn default_days(&self) -> u32 {
        self.inner.cache.default_days
    }

    pub fn peer_enabled(&self) -> bool {
        self.inner.peer.is_some()
    }

    /// Executions of `job_id` that started on or after `today - days`.
    pub async fn get_job_executions(&self, job_id: &str, days: u32) -> LoadResult {
        let key = (job_id.to_string(), days);

        let shared = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .map_err(|_| ManagerError::Task("in-flight table poisoned".to_string()))?;
            match in_flight.get(&key) {
                Some(existing) => {
                    bump(&self.inner.counters.coalesced);
                    debug!(%job_id, days, "joining in-flight load");
                    existing.clone()
                }
                None => {
                    let fut = self.spawn_load(key.clone());
                    in_flight.insert(key, fut.clone());
                    fut
                }
            }
        };

        shared.await
    }

    /// Run the load as its own task so it completes even if every caller
    /// stops waiting.
    fn spawn_load(&self, key: (String, u32)) -> InFlight {
        let this = self.clone();
        let task = tokio::spawn(async move {
            let _slot = InFlightSlot {
                inner: Arc::clone(&this.inner),
                key: key.clone(),
            };
            let (job_id, days) = &key;
            let result = this.load(job_id, *days).await;
            if result.is_err() {
                bump(&this.inner.counters.errors);
            }
            result
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(ManagerError::Task(e.to_string())))
        }
        .boxed()
        .shared()
    }

    async fn load(&self, job_id: &str, days: u32) -> LoadResult {
        let now = Utc::now();
        let requested = DateRange::trailing(now.date_naive(), days);

        if let Err(e) = self.inner.own.open().await {
            warn!(%job_id, error = %e, "own store unavailable");
            return Err(ManagerError::StoreUnavailable(e.to_string()));
        }

        match self.load_cached(job_id, requested, now).await {
            Ok(records) => Ok(records),
            Err(LoadFailure::Worker(e)) => Err(ManagerError::Worker(e)),
            Err(LoadFailure::Cache(e)) => {
                bump(&self.inner.counters.fallbacks);
                warn!(%job_id, error = %e, "cache path failed, fetching directly");
                let processed = self.fetch(job_id, FetchWindow::Range(requested)).await?;
                Ok(filter_executions_by_date(
                    &processed.executions,
                    requested.begin,
                ))
            }
        }
    }

    async fn load_cached(
        &self,
        job_id: &str,
        requested: DateRange,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, LoadFailure> {
        let inner = &self.inner;
        let cutoff = requested.begin;

        // Read-merge-write for one job happens under its lock.
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;

        let class = self.classify(job_id, now).await.map_err(LoadFailure::Cache)?;
        let cached: Option<ExecutionCacheEntry> =
            inner.own.get(job_id).await.map_err(LoadFailure::Cache)?;

        if class.has_peer_data {
            if let Some(found) = self.fresh_peer_entry(job_id, now).await {
                bump(&inner.counters.peer_hits);
                let own_stale = cached
                    .as_ref()
                    .map_or(true, |c| !c.is_fresh(now, inner.cache.peer_copy_stale()));
                if own_stale {
                    let copy = match cached {
                        Some(mut entry) => {
                            entry.merge(
                                found.executions.clone(),
                                found.covered,
                                true,
                                found.last_fetched,
                            );
                            entry
                        }
                        None => {
                            let mut copy = found.clone();
                            copy.job_id = job_id.to_string();
                            copy
                        }
                    };
                    inner.own.set(&copy).await.map_err(LoadFailure::Cache)?;
                    debug!(%job_id, covered = %copy.covered, "copied peer entry into own store");
                }
                return Ok(filter_executions_by_date(&found.executions, cutoff));
            }
        }

        if let Some(entry) = &cached {
            if entry.is_fresh(now, inner.cache.ttl()) && entry.covers(&requested) {
                bump(&inner.counters.cache_hits);
                debug!(%job_id, covered = %entry.covered, "own cache hit");
                return Ok(filter_executions_by_date(&entry.executions, cutoff));
            }
        }

        bump(&inner.counters.cache_misses);
        let processed = self
            .fetch(job_id, FetchWindow::Range(requested))
            .await
            .map_err(LoadFailure::Worker)?;

        let class = match self
            .reclassify_from_sample(job_id, class, &processed.executions, now)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(%job_id, error = %e, "could not record classification");
                class
            }
        };
        let has_peer_data = class.has_peer_data || processed.has_peer_data;

        let entry = match cached {
            Some(mut entry) => {
                entry.merge(processed.executions, requested, has_peer_data, now);
                entry
            }
            None => ExecutionCacheEntry::new(
                job_id,
                processed.executions,
                requested,
                has_peer_data,
                now,
            ),
        };

        // Best effort: the data is still good if it can't be cached.
        if let Err(e) = inner.own.set(&entry).await {
            bump(&inner.counters.errors);
            warn!(%job_id, error = %e, "failed to persist merged executions");
        } else {
            info!(%job_id, total = entry.executions.len(), covered = %entry.covered, "execution cache updated");
        }

        Ok(filter_executions_by_date(&entry.executions, cutoff))
    }

    async fn fresh_peer_entry(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Option<ExecutionCacheEntry> {
        let peer = self.inner.peer.as_ref()?;
        let entry = peer.try_get_executions(job_id).await?;
        if entry.is_fresh(now, self.inner.cache.peer_fresh()) {
            Some(entry)
        } else {
            debug!(%job_id, age_min = entry.age(now).num_minutes(), "peer entry too old");
            None
        }
    }

    async fn fetch(&self, job_id: &str, window: FetchWindow) -> Result<JobProcessed, WorkerError> {
        bump(&self.inner.counters.worker_fetches);
        self.inner.worker.fetch_and_process(job_id, window).await
    }

    fn job_lock(&self, job_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.inner.job_locks.lock() {
            Ok(mut locks) => Arc::clone(locks.entry(job_id.to_string()).or_default()),
            // Poisoned table: unshared lock.
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Every cached job, for maintenance listings.
    pub async fn cached_jobs(&self) -> Result<Vec<ExecutionCacheEntry>, ManagerError> {
        self.inner
            .own
            .get_all()
            .await
            .map_err(|e| ManagerError::StoreUnavailable(e.to_string()))
    }

    pub async fn metrics(&self) -> ManagerMetrics {
        let c = &self.inner.counters;
        ManagerMetrics {
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            peer_hits: c.peer_hits.load(Ordering::Relaxed),
            worker_fetches: c.worker_fetches.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            store: self.inner.own.stats(),
            worker: self.inner.worker.health().await,
        }
    }

    pub fn start_health_monitor(&self) {
        self.inner.worker.start_health_monitor();
    }

    /// Allow worker initialization again after the failure budget ran out.
    pub fn reset_worker(&self) {
        self.inner.worker.reset();
    }

    /// Terminate the worker (rejecting pending requests) and close the own
    /// store.
    pub async fn shutdown(&self) {
        self.inner.worker.shutdown().await;
        self.inner.own.close();
        info!("execution data manager shut down");
    }
}
