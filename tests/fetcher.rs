//! Remote fetcher and full-stack tests against an in-process fake host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use serde_json::{json, Value};

use jobcache::config::AppConfig;
use jobcache::fetcher::{
    range_to_millis, ExecutionSource, FetchError, FetchSettings, FetchWindow, HostTarget,
    RemoteFetcher,
};
use jobcache::manager::ExecutionDataManager;
use jobcache::model::{DateRange, ExecutionStatus};

#[derive(Default)]
struct FakeHost {
    /// Executions the job has in total.
    total: usize,
    /// Fail this many requests before answering.
    fail_first: AtomicUsize,
    /// Fail every request at or beyond this offset.
    fail_from_offset: Option<usize>,
    requests: AtomicUsize,
    seen: Mutex<Vec<(String, HashMap<String, String>, Option<String>)>>,
}

async fn executions(
    State(host): State<Arc<FakeHost>>,
    Path((_version, project)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    host.requests.fetch_add(1, Ordering::SeqCst);
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    host.seen
        .lock()
        .unwrap()
        .push((project, query.clone(), auth));

    let offset: usize = query.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let max: usize = query.get("max").and_then(|v| v.parse().ok()).unwrap_or(20);

    let failing_first = host
        .fail_first
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    let failing_offset = host.fail_from_offset.is_some_and(|o| offset >= o);
    if failing_first || failing_offset {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "boom" })),
        );
    }

    let now_ms = Utc::now().timestamp_millis();
    let items: Vec<Value> = (offset..host.total.min(offset + max))
        .map(|i| {
            json!({
                "id": i,
                "date-started": { "unixtime": now_ms - (i as i64) * 60_000 },
                "status": if i % 3 == 2 { "failed" } else { "succeeded" },
                "duration": 1000 + i,
                "job": { "averageDuration": 900 }
            })
        })
        .collect();

    (
        StatusCode::OK,
        Json(json!({
            "paging": { "count": items.len(), "total": host.total, "offset": offset, "max": max },
            "executions": items
        })),
    )
}

async fn spawn_host(host: Arc<FakeHost>) -> String {
    let app = Router::new()
        .route("/api/{version}/project/{project}/executions", get(executions))
        .with_state(host);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn settings(page_size: usize) -> FetchSettings {
    FetchSettings {
        api_version: 41,
        auth_token: None,
        peer_metric_field: "peerMetric".to_string(),
        page_size,
        max_attempts: 3,
        retry_backoff: Duration::from_millis(10),
        default_recent_days: 10,
        request_timeout: Duration::from_secs(5),
    }
}

fn fetcher(base: &str, settings: FetchSettings) -> RemoteFetcher {
    let target = HostTarget {
        rd_base: base.to_string(),
        project: "ops".to_string(),
    };
    RemoteFetcher::new(&target, settings).unwrap()
}

#[tokio::test]
async fn test_paginates_until_short_page() {
    let host = Arc::new(FakeHost {
        total: 7,
        ..FakeHost::default()
    });
    let base = spawn_host(Arc::clone(&host)).await;

    let records = fetcher(&base, settings(3))
        .fetch_executions("job-1", &FetchWindow::Recent)
        .await
        .unwrap();

    assert_eq!(records.len(), 7);
    assert_eq!(host.requests.load(Ordering::SeqCst), 3);
    let offsets: Vec<String> = host
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|(_, q, _)| q["offset"].clone())
        .collect();
    assert_eq!(offsets, vec!["0", "3", "6"]);
    assert_eq!(records[2].status, ExecutionStatus::Failed);
    assert_eq!(records[0].job_average_duration_ms, Some(900));
}

#[tokio::test]
async fn test_exact_multiple_ends_on_empty_page() {
    let host = Arc::new(FakeHost {
        total: 6,
        ..FakeHost::default()
    });
    let base = spawn_host(Arc::clone(&host)).await;

    let records = fetcher(&base, settings(3))
        .fetch_executions("job-1", &FetchWindow::Recent)
        .await
        .unwrap();
    assert_eq!(records.len(), 6);
    assert_eq!(host.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let host = Arc::new(FakeHost {
        total: 2,
        fail_first: AtomicUsize::new(2),
        ..FakeHost::default()
    });
    let base = spawn_host(Arc::clone(&host)).await;

    let records = fetcher(&base, settings(10))
        .fetch_executions("job-1", &FetchWindow::Days(7))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(host.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_later_page_exhaustion_returns_partial() {
    let host = Arc::new(FakeHost {
        total: 10,
        fail_from_offset: Some(4),
        ..FakeHost::default()
    });
    let base = spawn_host(Arc::clone(&host)).await;

    let records = fetcher(&base, settings(4))
        .fetch_executions("job-1", &FetchWindow::Recent)
        .await
        .unwrap();
    assert_eq!(records.len(), 4);
    // One good page, then three attempts at offset 4.
    assert_eq!(host.requests.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_first_page_exhaustion_is_error() {
    let host = Arc::new(FakeHost {
        total: 10,
        fail_from_offset: Some(0),
        ..FakeHost::default()
    });
    let base = spawn_host(Arc::clone(&host)).await;

    let err = fetcher(&base, settings(4))
        .fetch_executions("job-1", &FetchWindow::Recent)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FetchError::Exhausted {
            offset: 0,
            attempts: 3,
            ..
        }
    ));
    assert_eq!(host.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_query_parameters_and_token() {
    let host = Arc::new(FakeHost {
        total: 1,
        ..FakeHost::default()
    });
    let base = spawn_host(Arc::clone(&host)).await;

    let mut s = settings(500);
    s.auth_token = Some("secret".to_string());
    let f = fetcher(&base, s);

    let range = DateRange::new(
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
    );
    f.fetch_executions("job 9", &FetchWindow::Range(range))
        .await
        .unwrap();
    f.fetch_executions("job 9", &FetchWindow::Recent).await.unwrap();

    let seen = host.seen.lock().unwrap();
    let (project, q, auth) = &seen[0];
    assert_eq!(project, "ops");
    assert_eq!(q["jobIdListFilter"], "job 9");
    assert_eq!(q["max"], "500");
    let (begin, end) = range_to_millis(&range);
    assert_eq!(q["begin"], begin.to_string());
    assert_eq!(q["end"], end.to_string());
    assert!(!q.contains_key("recentFilter"));
    assert_eq!(auth.as_deref(), Some("Bearer secret"));

    let (_, q, _) = &seen[1];
    assert_eq!(q["recentFilter"], "10d");
    assert!(!q.contains_key("begin"));
}

#[tokio::test]
async fn test_manager_end_to_end_caches_host_results() {
    let host = Arc::new(FakeHost {
        total: 5,
        ..FakeHost::default()
    });
    let base = spawn_host(Arc::clone(&host)).await;
    let dir = tempfile::tempdir().unwrap();

    let mut cfg = AppConfig::default();
    cfg.host.rd_base = base;
    cfg.host.project = "ops".to_string();
    cfg.cache.db_path = dir.path().join("own.db");
    cfg.peer.installed = false;
    cfg.peer.db_path = dir.path().join("peer.db");
    cfg.worker.retry_backoff_ms = 10;

    let manager = ExecutionDataManager::from_config(&cfg);
    let first = manager.get_job_executions("job-1", 7).await.unwrap();
    assert_eq!(first.len(), 5);
    let after_first = host.requests.load(Ordering::SeqCst);

    let second = manager.get_job_executions("job-1", 7).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(host.requests.load(Ordering::SeqCst), after_first);

    let cached = manager.cached_jobs().await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].job_id, "job-1");
    assert!(!cfg.peer.db_path.exists());

    let metrics = manager.metrics().await;
    assert_eq!(metrics.worker_fetches, 1);
    assert_eq!(metrics.worker.unwrap().jobs_processed, 1);

    manager.shutdown().await;
}
