//! Read-only port onto the companion plugin's database.
//!
//! The peer database is owned elsewhere. It is opened with
//! `SQLITE_OPEN_READ_ONLY` and `query_only`, every operation is bounded by
//! the open timeout, and every failure reads as "nothing there".

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{LazyDb, Opener, Pool, StoreError, StoreName};
use crate::config::PeerConfig;
use crate::model::ExecutionCacheEntry;

/// What the peer registry says about one job.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerJobEntry {
    pub job_id: String,
    pub has_peer_data: bool,
}

#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn try_get_job(&self, job_id: &str) -> Option<PeerJobEntry>;
    async fn try_get_executions(&self, job_id: &str) -> Option<ExecutionCacheEntry>;
    async fn try_get_all_executions(&self) -> Vec<ExecutionCacheEntry>;
}

/// `None` unless the companion plugin is installed. Nothing is opened here.
pub fn open_peer_store(cfg: &PeerConfig) -> Option<Arc<dyn PeerStore>> {
    if !cfg.installed {
        debug!("peer plugin not installed, peer store disabled");
        return None;
    }
    Some(Arc::new(SqlitePeerStore::new(&cfg.db_path, cfg.open_timeout())))
}

#[derive(Deserialize)]
struct PeerJobRow {
    #[serde(alias = "hasPeerData")]
    has_peer_data: Option<bool>,
}

pub struct SqlitePeerStore {
    path: PathBuf,
    timeout: Duration,
    db: LazyDb,
}

impl SqlitePeerStore {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let path = path.into();
        let open_path = path.clone();
        let opener: Arc<Opener> = Arc::new(move || open_peer_pool(&open_path, timeout));
        Self {
            path,
            timeout,
            db: LazyDb::new("peer", opener),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of times the database has been (re)opened.
    pub fn opens(&self) -> u64 {
        self.db.opens()
    }

    pub fn close(&self) {
        self.db.close();
    }

    /// Run `f` against the peer database, bounded by the open timeout.
    /// Errors are logged and flattened to `None`.
    async fn read<F, T>(&self, op: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let task = tokio::task::spawn_blocking(move || {
            let conn = db.acquire()?;
            f(&*conn)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(value))) => Some(value),
            Ok(Ok(Err(e))) => {
                debug!(op, error = %e, "peer store read failed");
                None
            }
            Ok(Err(e)) => {
                warn!(op, error = %e, "peer store task failed");
                None
            }
            Err(_) => {
                warn!(op, timeout = ?self.timeout, "peer store timed out");
                None
            }
        }
    }
}

#[async_trait]
impl PeerStore for SqlitePeerStore {
    async fn try_get_job(&self, job_id: &str) -> Option<PeerJobEntry> {
        let key = job_id.to_string();
        let json = self
            .read("get_job", move |conn| select_one(conn, StoreName::JobRegistry, &key))
            .await??;

        let row: PeerJobRow = serde_json::from_str(&json)
            .map_err(|e| debug!(%job_id, error = %e, "unreadable peer registry row"))
            .ok()?;
        Some(PeerJobEntry {
            job_id: job_id.to_string(),
            has_peer_data: row.has_peer_data?,
        })
    }

    async fn try_get_executions(&self, job_id: &str) -> Option<ExecutionCacheEntry> {
        let key = job_id.to_string();
        let json = self
            .read("get_executions", move |conn| {
                select_one(conn, StoreName::ExecutionCache, &key)
            })
            .await??;

        serde_json::from_str(&json)
            .map_err(|e| debug!(%job_id, error = %e, "unreadable peer cache row"))
            .ok()
    }

    async fn try_get_all_executions(&self) -> Vec<ExecutionCacheEntry> {
        let rows = self
            .read("get_all_executions", |conn| {
                let sql = format!("SELECT value_json FROM {}", StoreName::ExecutionCache.table());
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .unwrap_or_default();

        rows.iter()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect()
    }
}

fn select_one(
    conn: &Connection,
    store: StoreName,
    key: &str,
) -> Result<Option<String>, StoreError> {
    let sql = format!("SELECT value_json FROM {} WHERE job_id = ?1", store.table());
    Ok(conn
        .query_row(&sql, params![key], |row| row.get(0))
        .optional()?)
}

fn open_peer_pool(path: &Path, timeout: Duration) -> Result<Pool, StoreError> {
    if !path.exists() {
        return Err(StoreError::Unavailable(format!(
            "peer database {} not found",
            path.display()
        )));
    }

    let manager = SqliteConnectionManager::file(path)
        .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
        .with_init(|c| c.execute_batch("PRAGMA query_only = ON;"));

    r2d2::Pool::builder()
        .max_size(2)
        .connection_timeout(timeout)
        .build(manager)
        .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))
}
