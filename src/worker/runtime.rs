//! The worker side: a dedicated OS thread with its own current-thread tokio
//! runtime, hosting the execution source and the concurrency pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::fetcher::metrics::compute_metrics;
use crate::fetcher::{ExecutionSource, FetchWindow, HostTarget, SourceFactory};
use crate::pool::ConcurrencyPool;
use crate::worker::protocol::{
    ErrorResponse, JobProcessed, RequestPayload, ResponsePayload, WorkerHealth, WorkerRequest,
    WorkerResponse,
};

/// Fixed at construction; the worker holds no process-wide state.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_concurrent: usize,
    pub thread_name: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            thread_name: "jobcache-worker".to_string(),
        }
    }
}

/// Start the worker thread. It runs until it receives `Shutdown` or the
/// request channel closes.
pub(crate) fn spawn_thread(
    factory: Arc<dyn SourceFactory>,
    settings: WorkerSettings,
    requests: mpsc::UnboundedReceiver<WorkerRequest>,
    responses: mpsc::UnboundedSender<WorkerResponse>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(settings.thread_name.clone())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "failed to build worker runtime");
                    return;
                }
            };
            let state = WorkerState::new(factory, &settings);
            rt.block_on(state.run(requests, responses));
            info!("worker thread exiting");
        })
}

struct WorkerState {
    factory: Arc<dyn SourceFactory>,
    pool: ConcurrencyPool,
    target: Option<HostTarget>,
    source: Option<Arc<dyn ExecutionSource>>,
    started_at: Instant,
    processed: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
}

impl WorkerState {
    fn new(factory: Arc<dyn SourceFactory>, settings: &WorkerSettings) -> Self {
        Self {
            factory,
            pool: ConcurrencyPool::new(settings.max_concurrent),
            target: None,
            source: None,
            started_at: Instant::now(),
            processed: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
        responses: mpsc::UnboundedSender<WorkerResponse>,
    ) {
        info!("worker started");
        while let Some(req) = requests.recv().await {
            let request_id = req.request_id;
            debug!(%request_id, kind = req.payload.kind(), "worker request");

            let reply = match req.payload {
                RequestPayload::Init { rd_base, project } => {
                    Some(self.init(HostTarget { rd_base, project }))
                }
                RequestPayload::FetchAndProcessJob { job_id, window } => {
                    match self.source.clone() {
                        Some(source) => {
                            self.spawn_fetch(request_id, source, job_id, window, responses.clone());
                            None
                        }
                        None => {
                            self.errors.fetch_add(1, Ordering::SeqCst);
                            Some(error_payload("worker not initialized"))
                        }
                    }
                }
                RequestPayload::GetMetrics => Some(ResponsePayload::Metrics(self.health())),
                RequestPayload::Shutdown => {
                    info!("worker shutdown requested");
                    break;
                }
            };

            if let Some(payload) = reply {
                if responses.send(WorkerResponse { request_id, payload }).is_err() {
                    warn!("response channel closed, stopping worker");
                    break;
                }
            }
        }
    }

    fn init(&mut self, target: HostTarget) -> ResponsePayload {
        if let Some(current) = &self.target {
            if *current == target {
                return ResponsePayload::Initialized;
            }
            self.errors.fetch_add(1, Ordering::SeqCst);
            return error_payload(&format!(
                "worker already initialized for {} / {}",
                current.rd_base, current.project
            ));
        }

        match self.factory.build(&target) {
            Ok(source) => {
                info!(rd_base = %target.rd_base, project = %target.project, "worker initialized");
                self.source = Some(source);
                self.target = Some(target);
                ResponsePayload::Initialized
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::SeqCst);
                error_payload(&format!("initialization failed: {}", e))
            }
        }
    }

    fn spawn_fetch(
        &self,
        request_id: uuid::Uuid,
        source: Arc<dyn ExecutionSource>,
        job_id: String,
        window: FetchWindow,
        responses: mpsc::UnboundedSender<WorkerResponse>,
    ) {
        let pool = self.pool.clone();
        let processed = Arc::clone(&self.processed);
        let errors = Arc::clone(&self.errors);

        tokio::spawn(async move {
            let result = pool.submit(source.fetch_executions(&job_id, &window)).await;
            let payload = match result {
                Ok(executions) => {
                    processed.fetch_add(1, Ordering::SeqCst);
                    let metrics = compute_metrics(&executions);
                    let has_peer_data = metrics.has_peer_metric;
                    ResponsePayload::JobProcessed(JobProcessed {
                        job_id,
                        executions,
                        metrics,
                        has_peer_data,
                    })
                }
                Err(e) => {
                    errors.fetch_add(1, Ordering::SeqCst);
                    warn!(%job_id, error = %e, "job fetch failed");
                    error_payload(&e.to_string())
                }
            };
            // The caller may have given up; nobody listening is fine.
            let _ = responses.send(WorkerResponse { request_id, payload });
        });
    }

    fn health(&self) -> WorkerHealth {
        WorkerHealth {
            uptime_sec: self.started_at.elapsed().as_secs(),
            initialized: self.source.is_some(),
            jobs_processed: self.processed.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            pool: self.pool.snapshot(),
        }
    }
}

fn error_payload(message: &str) -> ResponsePayload {
    ResponsePayload::Error(ErrorResponse {
        message: message.to_string(),
    })
}
