//! Background worker: runs the fetcher and concurrency pool off the caller's
//! runtime and speaks a correlated request/response protocol.

pub mod protocol;
mod runtime;
pub mod supervisor;

pub use self::runtime::WorkerSettings;
pub use self::supervisor::{SupervisorPolicy, WorkerSupervisor};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fetcher::{FetchWindow, HostTarget, SourceFactory};
use self::protocol::{
    JobProcessed, RequestPayload, ResponsePayload, WorkerHealth, WorkerRequest, WorkerResponse,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkerError {
    #[error("worker terminated")]
    Terminated,

    #[error("worker disconnected")]
    Disconnected,

    #[error("{request} request timed out after {after:?}")]
    Timeout {
        request: &'static str,
        after: Duration,
    },

    #[error("worker error: {0}")]
    Remote(String),

    #[error("failed to start worker: {0}")]
    Spawn(String),

    #[error("worker unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected {got} response to {request}")]
    Protocol {
        request: &'static str,
        got: &'static str,
    },
}

type Pending = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<ResponsePayload, WorkerError>>>>>;

/// Caller-side handle to one worker thread. Cheap to clone.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    pending: Pending,
    terminated: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Start a worker thread and the response dispatcher. Must be called from
    /// inside a tokio runtime.
    pub fn spawn(
        factory: Arc<dyn SourceFactory>,
        settings: WorkerSettings,
    ) -> Result<Self, WorkerError> {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();

        runtime::spawn_thread(factory, settings, req_rx, resp_tx)
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let terminated = Arc::new(AtomicBool::new(false));
        let dispatcher = tokio::spawn(dispatch(
            resp_rx,
            Arc::clone(&pending),
            Arc::clone(&terminated),
        ));

        Ok(Self {
            inner: Arc::new(HandleInner {
                requests: req_tx,
                pending,
                terminated,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        })
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.terminated.load(Ordering::SeqCst) && !self.inner.requests.is_closed()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Send one request and wait for its correlated response. On timeout the
    /// local bookkeeping is dropped; the worker may still answer later and
    /// that answer is discarded.
    pub async fn request(
        &self,
        payload: RequestPayload,
        timeout: Duration,
    ) -> Result<ResponsePayload, WorkerError> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(WorkerError::Terminated);
        }

        let kind = payload.kind();
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.insert_pending(request_id, tx)?;

        if self
            .inner
            .requests
            .send(WorkerRequest {
                request_id,
                payload,
            })
            .is_err()
        {
            self.remove_pending(&request_id);
            return Err(WorkerError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkerError::Terminated),
            Err(_) => {
                self.remove_pending(&request_id);
                warn!(%request_id, request = kind, ?timeout, "worker request timed out");
                Err(WorkerError::Timeout {
                    request: kind,
                    after: timeout,
                })
            }
        }
    }

    pub async fn init(&self, target: &HostTarget, timeout: Duration) -> Result<(), WorkerError> {
        let payload = RequestPayload::Init {
            rd_base: target.rd_base.clone(),
            project: target.project.clone(),
        };
        match self.request(payload, timeout).await? {
            ResponsePayload::Initialized => Ok(()),
            other => Err(unexpected("init", other)),
        }
    }

    pub async fn fetch_and_process(
        &self,
        job_id: &str,
        window: FetchWindow,
        timeout: Duration,
    ) -> Result<JobProcessed, WorkerError> {
        let payload = RequestPayload::FetchAndProcessJob {
            job_id: job_id.to_string(),
            window,
        };
        match self.request(payload, timeout).await? {
            ResponsePayload::JobProcessed(processed) => Ok(processed),
            other => Err(unexpected("fetch_and_process_job", other)),
        }
    }

    pub async fn get_metrics(&self, timeout: Duration) -> Result<WorkerHealth, WorkerError> {
        match self.request(RequestPayload::GetMetrics, timeout).await? {
            ResponsePayload::Metrics(health) => Ok(health),
            other => Err(unexpected("get_metrics", other)),
        }
    }

    /// Stop the worker. Every pending request is rejected with
    /// [`WorkerError::Terminated`]. Idempotent.
    pub fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.requests.send(WorkerRequest {
            request_id: Uuid::new_v4(),
            payload: RequestPayload::Shutdown,
        });

        let rejected = reject_all(&self.inner.pending, WorkerError::Terminated);
        if let Ok(mut guard) = self.inner.dispatcher.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
        info!(rejected, "worker terminated");
    }

    fn insert_pending(
        &self,
        id: Uuid,
        tx: oneshot::Sender<Result<ResponsePayload, WorkerError>>,
    ) -> Result<(), WorkerError> {
        let mut pending = self
            .inner
            .pending
            .lock()
            .map_err(|_| WorkerError::Unavailable("pending table poisoned".to_string()))?;
        pending.insert(id, tx);
        Ok(())
    }

    fn remove_pending(&self, id: &Uuid) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(id);
        }
    }
}

/// Route worker responses to their waiting callers.
async fn dispatch(
    mut responses: mpsc::UnboundedReceiver<WorkerResponse>,
    pending: Pending,
    terminated: Arc<AtomicBool>,
) {
    while let Some(resp) = responses.recv().await {
        let waiter = pending
            .lock()
            .ok()
            .and_then(|mut p| p.remove(&resp.request_id));
        match waiter {
            Some(tx) => {
                let result = match resp.payload {
                    ResponsePayload::Error(e) => Err(WorkerError::Remote(e.message)),
                    payload => Ok(payload),
                };
                let _ = tx.send(result);
            }
            None => {
                debug!(request_id = %resp.request_id, kind = resp.payload.kind(), "dropping response with no pending request");
            }
        }
    }

    // The worker thread is gone.
    if !terminated.swap(true, Ordering::SeqCst) {
        let rejected = reject_all(&pending, WorkerError::Disconnected);
        warn!(rejected, "worker exited unexpectedly");
    }
}

fn reject_all(pending: &Pending, err: WorkerError) -> usize {
    let drained: Vec<_> = match pending.lock() {
        Ok(mut p) => p.drain().collect(),
        Err(_) => return 0,
    };
    let count = drained.len();
    for (_, tx) in drained {
        let _ = tx.send(Err(err.clone()));
    }
    count
}

fn unexpected(request: &'static str, got: ResponsePayload) -> WorkerError {
    WorkerError::Protocol {
        request,
        got: got.kind(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fetcher::{ExecutionSource, FetchError};
    use crate::model::{ExecutionRecord, ExecutionStatus};
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    /// Test source: answers after `delay`, optionally blocking the worker
    /// thread outright for jobs named "hang".
    pub(crate) struct FakeSource {
        pub calls: Arc<AtomicUsize>,
        pub delay: Duration,
        pub executions: Vec<ExecutionRecord>,
    }

    #[async_trait::async_trait]
    impl ExecutionSource for FakeSource {
        async fn fetch_executions(
            &self,
            job_id: &str,
            _window: &FetchWindow,
        ) -> Result<Vec<ExecutionRecord>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if job_id == "hang" {
                std::thread::sleep(Duration::from_millis(600));
            }
            if job_id == "broken" {
                return Err(FetchError::Exhausted {
                    offset: 0,
                    attempts: 3,
                    last: "connection refused".to_string(),
                });
            }
            tokio::time::sleep(self.delay).await;
            Ok(self.executions.clone())
        }
    }

    pub(crate) struct FakeFactory {
        pub calls: Arc<AtomicUsize>,
        pub builds: Arc<AtomicUsize>,
        pub fail_builds: bool,
        pub delay: Duration,
        pub executions: Vec<ExecutionRecord>,
    }

    impl FakeFactory {
        pub(crate) fn new(executions: Vec<ExecutionRecord>) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                builds: Arc::new(AtomicUsize::new(0)),
                fail_builds: false,
                delay: Duration::from_millis(0),
                executions,
            }
        }
    }

    impl SourceFactory for FakeFactory {
        fn build(&self, target: &HostTarget) -> Result<Arc<dyn ExecutionSource>, FetchError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail_builds {
                return Err(FetchError::InvalidUrl {
                    url: target.rd_base.clone(),
                    reason: "refused by test".to_string(),
                });
            }
            Ok(Arc::new(FakeSource {
                calls: Arc::clone(&self.calls),
                delay: self.delay,
                executions: self.executions.clone(),
            }))
        }
    }

    pub(crate) fn target() -> HostTarget {
        HostTarget {
            rd_base: "http://host".to_string(),
            project: "proj".to_string(),
        }
    }

    fn exec(id: &str) -> ExecutionRecord {
        ExecutionRecord {
            id: id.to_string(),
            started_at: Utc::now(),
            status: ExecutionStatus::Succeeded,
            duration_ms: Some(1000),
            job_average_duration_ms: None,
            peer_metric: None,
        }
    }

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_fetch_requires_init() {
        let factory = Arc::new(FakeFactory::new(vec![exec("1")]));
        let handle = WorkerHandle::spawn(factory, WorkerSettings::default()).unwrap();

        let err = handle
            .fetch_and_process("job", FetchWindow::Recent, T)
            .await
            .unwrap_err();
        assert_eq!(err, WorkerError::Remote("worker not initialized".to_string()));

        handle.init(&target(), T).await.unwrap();
        let processed = handle
            .fetch_and_process("job", FetchWindow::Days(7), T)
            .await
            .unwrap();
        assert_eq!(processed.job_id, "job");
        assert_eq!(processed.executions.len(), 1);
        assert_eq!(processed.metrics.total, 1);
        assert!(!processed.has_peer_data);
        handle.terminate();
    }

    #[tokio::test]
    async fn test_reinit_same_target_idempotent_other_target_rejected() {
        let factory = Arc::new(FakeFactory::new(Vec::new()));
        let builds = Arc::clone(&factory.builds);
        let handle = WorkerHandle::spawn(factory, WorkerSettings::default()).unwrap();

        handle.init(&target(), T).await.unwrap();
        handle.init(&target(), T).await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        let other = HostTarget {
            rd_base: "http://elsewhere".to_string(),
            project: "proj".to_string(),
        };
        assert!(matches!(
            handle.init(&other, T).await,
            Err(WorkerError::Remote(_))
        ));
        handle.terminate();
    }

    #[tokio::test]
    async fn test_fetch_error_surfaces_as_remote() {
        let factory = Arc::new(FakeFactory::new(Vec::new()));
        let handle = WorkerHandle::spawn(factory, WorkerSettings::default()).unwrap();
        handle.init(&target(), T).await.unwrap();

        let err = handle
            .fetch_and_process("broken", FetchWindow::Recent, T)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Remote(msg) if msg.contains("connection refused")));

        let health = handle.get_metrics(T).await.unwrap();
        assert!(health.initialized);
        assert_eq!(health.errors, 1);
        handle.terminate();
    }

    #[tokio::test]
    async fn test_timeout_cleans_up_and_late_response_is_ignored() {
        let mut factory = FakeFactory::new(vec![exec("1")]);
        factory.delay = Duration::from_millis(200);
        let handle = WorkerHandle::spawn(Arc::new(factory), WorkerSettings::default()).unwrap();
        handle.init(&target(), T).await.unwrap();

        let err = handle
            .fetch_and_process("slow", FetchWindow::Recent, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Timeout { .. }));
        assert_eq!(handle.pending_count(), 0);

        // Let the late answer arrive and get dropped.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let processed = handle
            .fetch_and_process("slow", FetchWindow::Recent, T)
            .await
            .unwrap();
        assert_eq!(processed.executions.len(), 1);
        assert_eq!(handle.get_metrics(T).await.unwrap().jobs_processed, 2);
        handle.terminate();
    }

    #[tokio::test]
    async fn test_responses_correlate_out_of_order() {
        let mut factory = FakeFactory::new(vec![exec("1")]);
        factory.delay = Duration::from_millis(100);
        let handle = WorkerHandle::spawn(Arc::new(factory), WorkerSettings::default()).unwrap();
        handle.init(&target(), T).await.unwrap();

        let slow = handle.fetch_and_process("a", FetchWindow::Recent, T);
        let health = handle.get_metrics(T);
        let (slow, health) = tokio::join!(slow, health);
        assert_eq!(slow.unwrap().job_id, "a");
        assert_eq!(health.unwrap().jobs_processed, 0);
        handle.terminate();
    }

    #[tokio::test]
    async fn test_terminate_rejects_pending() {
        let mut factory = FakeFactory::new(Vec::new());
        factory.delay = Duration::from_secs(10);
        let handle = WorkerHandle::spawn(Arc::new(factory), WorkerSettings::default()).unwrap();
        handle.init(&target(), T).await.unwrap();

        let h = handle.clone();
        let waiting =
            tokio::spawn(async move { h.fetch_and_process("job", FetchWindow::Recent, T).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.pending_count(), 1);

        handle.terminate();
        assert_eq!(waiting.await.unwrap().unwrap_err(), WorkerError::Terminated);
        assert!(!handle.is_alive());
        assert_eq!(
            handle.get_metrics(T).await.unwrap_err(),
            WorkerError::Terminated
        );
    }
}
