//! Remote fetcher: paginated, retrying reads of the host execution-history endpoint.

pub mod metrics;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, TimeZone, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{HostConfig, WorkerConfig};
use crate::model::{DateRange, ExecutionRecord};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid host url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build http client: {0}")]
    Client(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("host returned status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("malformed response envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("page at offset {offset} failed after {attempts} attempts: {last}")]
    Exhausted {
        offset: usize,
        attempts: u32,
        last: String,
    },
}

/// API origin plus the project that scopes every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTarget {
    pub rd_base: String,
    pub project: String,
}

/// Which slice of history to ask the host for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchWindow {
    /// Host-side relative filter of the configured default length.
    Recent,
    /// Host-side relative filter of `n` days.
    Days(u32),
    /// Explicit inclusive calendar-day bounds.
    Range(DateRange),
}

/// Anything that can produce a job's executions. The worker owns one.
#[async_trait::async_trait]
pub trait ExecutionSource: Send + Sync {
    async fn fetch_executions(
        &self,
        job_id: &str,
        window: &FetchWindow,
    ) -> Result<Vec<ExecutionRecord>, FetchError>;
}

/// Builds the source once the worker learns its host target.
pub trait SourceFactory: Send + Sync {
    fn build(&self, target: &HostTarget) -> Result<Arc<dyn ExecutionSource>, FetchError>;
}

/// Request tuning shared by every fetch.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub api_version: u32,
    pub auth_token: Option<String>,
    pub peer_metric_field: String,
    pub page_size: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub default_recent_days: u32,
    pub request_timeout: Duration,
}

impl FetchSettings {
    pub fn from_config(host: &HostConfig, worker: &WorkerConfig) -> Self {
        Self {
            api_version: host.api_version,
            auth_token: host.auth_token.clone(),
            peer_metric_field: host.peer_metric_field.clone(),
            page_size: worker.page_size.max(1),
            max_attempts: worker.max_attempts.max(1),
            retry_backoff: Duration::from_millis(worker.retry_backoff_ms),
            default_recent_days: worker.default_recent_days,
            request_timeout: worker.request_timeout(),
        }
    }
}

/// HTTP implementation of [`ExecutionSource`].
pub struct RemoteFetcher {
    client: Client,
    endpoint: Url,
    settings: FetchSettings,
}

impl RemoteFetcher {
    pub fn new(target: &HostTarget, settings: FetchSettings) -> Result<Self, FetchError> {
        let invalid = |reason: String| FetchError::InvalidUrl {
            url: target.rd_base.clone(),
            reason,
        };

        let mut endpoint = Url::parse(&target.rd_base).map_err(|e| invalid(e.to_string()))?;
        let version = settings.api_version.to_string();
        endpoint
            .path_segments_mut()
            .map_err(|_| invalid("not a base url".to_string()))?
            .pop_if_empty()
            .extend([
                "api",
                version.as_str(),
                "project",
                target.project.as_str(),
                "executions",
            ]);

        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            settings,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn window_params(&self, window: &FetchWindow) -> Vec<(&'static str, String)> {
        match window {
            FetchWindow::Recent => {
                vec![("recentFilter", format!("{}d", self.settings.default_recent_days))]
            }
            FetchWindow::Days(days) => vec![("recentFilter", format!("{}d", days))],
            FetchWindow::Range(range) => {
                let (begin, end) = range_to_millis(range);
                vec![("begin", begin.to_string()), ("end", end.to_string())]
            }
        }
    }

    async fn fetch_page_once(
        &self,
        job_id: &str,
        window: &FetchWindow,
        offset: usize,
    ) -> Result<wire::ParsedPage, FetchError> {
        let mut query = vec![
            ("jobIdListFilter", job_id.to_string()),
            ("max", self.settings.page_size.to_string()),
            ("offset", offset.to_string()),
        ];
        query.extend(self.window_params(window));

        let mut req = self
            .client
            .get(self.endpoint.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&query);
        if let Some(token) = &self.settings.auth_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: self.endpoint.to_string(),
            });
        }
        let body = resp.bytes().await?;
        Ok(wire::parse_page(&body, &self.settings.peer_metric_field)?)
    }

    async fn fetch_page(
        &self,
        job_id: &str,
        window: &FetchWindow,
        offset: usize,
    ) -> Result<wire::ParsedPage, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_page_once(job_id, window, offset).await {
                Ok(page) => return Ok(page),
                Err(e) if attempt < self.settings.max_attempts => {
                    let delay = self.settings.retry_backoff * attempt;
                    warn!(job_id, offset, attempt, error = %e, ?delay, "page fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(FetchError::Exhausted {
                        offset,
                        attempts: attempt,
                        last: e.to_string(),
                    })
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ExecutionSource for RemoteFetcher {
    /// Walk pages until one comes back short. A page that exhausts its retries
    /// ends the walk: whatever was gathered so far is returned, and only a
    /// failure on the very first page is an error.
    async fn fetch_executions(
        &self,
        job_id: &str,
        window: &FetchWindow,
    ) -> Result<Vec<ExecutionRecord>, FetchError> {
        let mut executions = Vec::new();
        let mut offset = 0usize;

        loop {
            let page = match self.fetch_page(job_id, window, offset).await {
                Ok(page) => page,
                Err(e) if offset == 0 => return Err(e),
                Err(e) => {
                    warn!(job_id, offset, kept = executions.len(), error = %e, "returning partial execution history");
                    break;
                }
            };

            let raw = page.raw_count;
            executions.extend(page.records);
            debug!(job_id, offset, raw, "fetched page");

            if raw < self.settings.page_size {
                break;
            }
            offset += raw;
        }

        info!(job_id, count = executions.len(), "fetched executions");
        Ok(executions)
    }
}

/// [`SourceFactory`] producing [`RemoteFetcher`]s.
pub struct RemoteFetcherFactory {
    settings: FetchSettings,
}

impl RemoteFetcherFactory {
    pub fn new(settings: FetchSettings) -> Self {
        Self { settings }
    }
}

impl SourceFactory for RemoteFetcherFactory {
    fn build(&self, target: &HostTarget) -> Result<Arc<dyn ExecutionSource>, FetchError> {
        Ok(Arc::new(RemoteFetcher::new(target, self.settings.clone())?))
    }
}

/// Epoch-millisecond bounds: start of the first day through the last
/// millisecond of the final day, both UTC.
pub fn range_to_millis(range: &DateRange) -> (i64, i64) {
    let begin = Utc
        .from_utc_datetime(&range.begin.and_time(NaiveTime::MIN))
        .timestamp_millis();
    let end = Utc
        .from_utc_datetime(&(range.end + chrono::Duration::days(1)).and_time(NaiveTime::MIN))
        .timestamp_millis()
        - 1;
    (begin, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn settings() -> FetchSettings {
        FetchSettings::from_config(&HostConfig::default(), &WorkerConfig::default())
    }

    #[test]
    fn test_endpoint_includes_project() {
        let target = HostTarget {
            rd_base: "http://host:4440/".to_string(),
            project: "ops tools".to_string(),
        };
        let f = RemoteFetcher::new(&target, settings()).unwrap();
        assert_eq!(
            f.endpoint().as_str(),
            "http://host:4440/api/41/project/ops%20tools/executions"
        );
    }

    #[test]
    fn test_bad_base_rejected() {
        let target = HostTarget {
            rd_base: "not a url".to_string(),
            project: "p".to_string(),
        };
        assert!(matches!(
            RemoteFetcher::new(&target, settings()),
            Err(FetchError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_range_to_millis_covers_whole_days() {
        let d = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let (begin, end) = range_to_millis(&DateRange::new(d, d));
        assert_eq!(begin, 1_714_521_600_000);
        assert_eq!(end, 1_714_521_600_000 + 86_400_000 - 1);
    }

    #[test]
    fn test_window_params() {
        let target = HostTarget {
            rd_base: "http://host".to_string(),
            project: "p".to_string(),
        };
        let f = RemoteFetcher::new(&target, settings()).unwrap();
        assert_eq!(
            f.window_params(&FetchWindow::Recent),
            vec![("recentFilter", "10d".to_string())]
        );
        assert_eq!(
            f.window_params(&FetchWindow::Days(3)),
            vec![("recentFilter", "3d".to_string())]
        );
        let d = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let params = f.window_params(&FetchWindow::Range(DateRange::new(d, d)));
        assert_eq!(params[0].0, "begin");
        assert_eq!(params[1].0, "end");
    }
}
