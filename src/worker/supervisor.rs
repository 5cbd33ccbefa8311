//! Worker lifecycle: serialized initialization with a bounded failure budget,
//! periodic health probing, restart with exponential backoff, and shutdown.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::fetcher::{FetchWindow, HostTarget, SourceFactory};
use crate::worker::protocol::{JobProcessed, WorkerHealth};
use crate::worker::{WorkerError, WorkerHandle, WorkerSettings};

/// Timing and retry policy for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    pub request_timeout: Duration,
    pub init_timeout: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub max_init_failures: u32,
    pub restart_backoff: Duration,
    pub restart_backoff_cap: Duration,
}

impl SupervisorPolicy {
    pub fn from_config(cfg: &WorkerConfig) -> Self {
        Self {
            request_timeout: cfg.request_timeout(),
            init_timeout: cfg.health_timeout(),
            health_interval: cfg.health_interval(),
            health_timeout: cfg.health_timeout(),
            max_init_failures: cfg.max_init_failures.max(1),
            restart_backoff: Duration::from_millis(cfg.restart_backoff_ms),
            restart_backoff_cap: Duration::from_millis(cfg.restart_backoff_cap_ms),
        }
    }

    /// Delay before restart attempt `attempt` (0-based): doubling, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.restart_backoff
            .saturating_mul(factor)
            .min(self.restart_backoff_cap)
    }
}

#[derive(Clone)]
pub struct WorkerSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    factory: Arc<dyn SourceFactory>,
    target: HostTarget,
    settings: WorkerSettings,
    policy: SupervisorPolicy,
    /// Held across spawn + init so concurrent callers share one attempt.
    slot: Mutex<Option<WorkerHandle>>,
    init_failures: AtomicU32,
    restarts: AtomicU64,
    shut_down: AtomicBool,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new(
        factory: Arc<dyn SourceFactory>,
        target: HostTarget,
        settings: WorkerSettings,
        policy: SupervisorPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                factory,
                target,
                settings,
                policy,
                slot: Mutex::new(None),
                init_failures: AtomicU32::new(0),
                restarts: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
                monitor: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn init_failures(&self) -> u32 {
        self.inner.init_failures.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u64 {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    /// Clear the failure budget so initialization may be attempted again.
    pub fn reset(&self) {
        self.inner.init_failures.store(0, Ordering::SeqCst);
        info!("worker failure budget reset");
    }

    /// Return a running, initialized worker, starting one if needed.
    pub async fn ensure_ready(&self) -> Result<WorkerHandle, WorkerError> {
        let mut slot = self.inner.slot.lock().await;
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(WorkerError::Terminated);
        }
        if let Some(handle) = slot.as_ref() {
            if handle.is_alive() {
                return Ok(handle.clone());
            }
            warn!("worker found dead, reinitializing");
            *slot = None;
        }

        let failures = self.init_failures();
        if failures >= self.inner.policy.max_init_failures {
            return Err(WorkerError::Unavailable(format!(
                "initialization refused after {} failed attempts",
                failures
            )));
        }

        let handle = self.start_worker().await?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Spawn and initialize a worker, charging the failure budget on error.
    async fn start_worker(&self) -> Result<WorkerHandle, WorkerError> {
        let inner = &self.inner;
        let attempt = async {
            let handle = WorkerHandle::spawn(Arc::clone(&inner.factory), inner.settings.clone())?;
            if let Err(e) = handle.init(&inner.target, inner.policy.init_timeout).await {
                handle.terminate();
                return Err(e);
            }
            Ok::<_, WorkerError>(handle)
        };

        match attempt.await {
            Ok(handle) => {
                inner.init_failures.store(0, Ordering::SeqCst);
                info!(rd_base = %inner.target.rd_base, project = %inner.target.project, "worker ready");
                Ok(handle)
            }
            Err(e) => {
                let failures = inner.init_failures.fetch_add(1, Ordering::SeqCst) + 1;
                error!(error = %e, failures, "worker initialization failed");
                Err(e)
            }
        }
    }

    pub async fn fetch_and_process(
        &self,
        job_id: &str,
        window: FetchWindow,
    ) -> Result<JobProcessed, WorkerError> {
        let handle = self.ensure_ready().await?;
        handle
            .fetch_and_process(job_id, window, self.inner.policy.request_timeout)
            .await
    }

    /// Health of the running worker, if any. Never starts one.
    pub async fn health(&self) -> Option<WorkerHealth> {
        let handle = self.current().await?;
        handle.get_metrics(self.inner.policy.health_timeout).await.ok()
    }

    async fn current(&self) -> Option<WorkerHandle> {
        let slot = self.inner.slot.lock().await;
        slot.as_ref().filter(|h| h.is_alive()).cloned()
    }

    /// Probe the worker once; an unresponsive worker is replaced.
    pub async fn check_health(&self) -> Result<(), WorkerError> {
        let Some(handle) = self.current().await else {
            return Ok(());
        };
        match handle.get_metrics(self.inner.policy.health_timeout).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "worker health check failed, restarting");
                self.restart(&handle).await
            }
        }
    }

    /// Terminate `failed` and bring up a replacement, backing off between
    /// attempts. Gives up once the failure budget is spent.
    async fn restart(&self, failed: &WorkerHandle) -> Result<(), WorkerError> {
        let mut slot = self.inner.slot.lock().await;
        failed.terminate();
        if let Some(current) = slot.as_ref() {
            if current.is_alive() {
                // Someone else already replaced it.
                return Ok(());
            }
        }
        *slot = None;

        let mut attempt = 0;
        while self.init_failures() < self.inner.policy.max_init_failures {
            if self.inner.shut_down.load(Ordering::SeqCst) {
                return Err(WorkerError::Terminated);
            }
            let delay = self.inner.policy.backoff(attempt);
            info!(attempt, ?delay, "restarting worker");
            tokio::time::sleep(delay).await;

            if let Ok(handle) = self.start_worker().await {
                self.inner.restarts.fetch_add(1, Ordering::SeqCst);
                *slot = Some(handle);
                return Ok(());
            }
            attempt += 1;
        }

        Err(WorkerError::Unavailable(
            "worker restart gave up after repeated failures".to_string(),
        ))
    }

    /// Start the periodic health probe. Calling it again is a no-op.
    pub fn start_health_monitor(&self) {
        let Ok(mut monitor) = self.inner.monitor.lock() else {
            return;
        };
        if monitor.is_some() {
            return;
        }

        let sup = self.clone();
        let every = self.inner.policy.health_interval;
        *monitor = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                if sup.inner.shut_down.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = sup.check_health().await {
                    error!(error = %e, "worker health monitor could not recover worker");
                }
            }
        }));
        info!(?every, "worker health monitor started");
    }

    /// Stop monitoring and terminate the worker, rejecting pending requests.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        if let Ok(mut monitor) = self.inner.monitor.lock() {
            if let Some(task) = monitor.take() {
                task.abort();
            }
        }
        let mut slot = self.inner.slot.lock().await;
        if let Some(handle) = slot.take() {
            handle.terminate();
        }
        info!("worker supervisor shut down");
    }
}
