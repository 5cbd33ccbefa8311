//! Request/response messages exchanged with the background worker.
//!
//! Every request carries a caller-generated `request_id`; the matching
//! response echoes it. Responses may arrive in any order.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fetcher::metrics::JobMetrics;
use crate::fetcher::FetchWindow;
use crate::model::ExecutionRecord;
use crate::pool::PoolSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub request_id: Uuid,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestPayload {
    Init {
        rd_base: String,
        project: String,
    },
    FetchAndProcessJob {
        job_id: String,
        window: FetchWindow,
    },
    GetMetrics,
    Shutdown,
}

impl RequestPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestPayload::Init { .. } => "init",
            RequestPayload::FetchAndProcessJob { .. } => "fetch_and_process_job",
            RequestPayload::GetMetrics => "get_metrics",
            RequestPayload::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub request_id: Uuid,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Initialized,
    JobProcessed(JobProcessed),
    Metrics(WorkerHealth),
    Error(ErrorResponse),
}

impl ResponsePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ResponsePayload::Initialized => "initialized",
            ResponsePayload::JobProcessed(_) => "job_processed",
            ResponsePayload::Metrics(_) => "metrics",
            ResponsePayload::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProcessed {
    pub job_id: String,
    pub executions: Vec<ExecutionRecord>,
    pub metrics: JobMetrics,
    pub has_peer_data: bool,
}

/// Worker health snapshot returned by `GetMetrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub uptime_sec: u64,
    pub initialized: bool,
    pub jobs_processed: u64,
    pub errors: u64,
    pub pool: PoolSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}
