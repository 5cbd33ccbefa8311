//! Embedded store adapter -- the own SQLite database (read/write) and a
//! read-only port onto the companion plugin's database.
//!
//! Both databases are opened lazily on first access. When a database's
//! `user_version` changes underneath us the held pool is dropped and the
//! next access reopens it.

pub mod peer;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use r2d2::{Pool as R2D2Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{ExecutionCacheEntry, JobCacheEntry};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;
type Conn = PooledConnection<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("failed to encode or decode record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("store task failed: {0}")]
    Task(String),
}

/// The two record stores, both keyed by job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreName {
    JobRegistry,
    ExecutionCache,
}

impl StoreName {
    pub fn table(&self) -> &'static str {
        match self {
            StoreName::JobRegistry => "job_registry",
            StoreName::ExecutionCache => "execution_cache",
        }
    }
}

/// A value that lives in one of the stores.
pub trait StoredRecord: Serialize + DeserializeOwned + Send + 'static {
    const STORE: StoreName;
    fn key(&self) -> &str;
}

impl StoredRecord for JobCacheEntry {
    const STORE: StoreName = StoreName::JobRegistry;
    fn key(&self) -> &str {
        &self.job_id
    }
}

impl StoredRecord for ExecutionCacheEntry {
    const STORE: StoreName = StoreName::ExecutionCache;
    fn key(&self) -> &str {
        &self.job_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub opens: u64,
    pub reads: u64,
    pub writes: u64,
}

type Opener = dyn Fn() -> Result<Pool, StoreError> + Send + Sync;

struct OpenDb {
    pool: Pool,
    user_version: i64,
}

/// Lazily opened pool that reopens itself after a schema version change.
#[derive(Clone)]
pub(crate) struct LazyDb {
    label: &'static str,
    slot: Arc<Mutex<Option<OpenDb>>>,
    opener: Arc<Opener>,
    opens: Arc<AtomicU64>,
}

impl LazyDb {
    pub(crate) fn new(label: &'static str, opener: Arc<Opener>) -> Self {
        Self {
            label,
            slot: Arc::new(Mutex::new(None)),
            opener,
            opens: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.slot.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Drop the held pool; the next access reopens.
    pub(crate) fn close(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            if slot.take().is_some() {
                info!(db = self.label, "closed database connection");
            }
        }
    }

    /// Blocking. Run from `spawn_blocking`.
    pub(crate) fn acquire(&self) -> Result<Conn, StoreError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| StoreError::Unavailable(format!("{} slot poisoned", self.label)))?;

        if let Some(db) = slot.as_ref() {
            let conn = db.pool.get()?;
            let version = schema::user_version(&conn)?;
            if version == db.user_version {
                return Ok(conn);
            }
            info!(
                db = self.label,
                held = db.user_version,
                found = version,
                "schema version changed, reopening"
            );
            drop(conn);
            *slot = None;
        }

        let pool = (self.opener)()?;
        let conn = pool.get()?;
        let user_version = schema::user_version(&conn)?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        debug!(db = self.label, user_version, "opened database");
        *slot = Some(OpenDb { pool, user_version });
        Ok(conn)
    }
}

/// This system's own database. The only store it ever writes.
pub struct OwnStore {
    path: PathBuf,
    db: LazyDb,
    reads: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
}

impl OwnStore {
    /// Nothing touches the filesystem until the first access.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let open_path = path.clone();
        let opener: Arc<Opener> = Arc::new(move || open_own_pool(&open_path));
        Self {
            path,
            db: LazyDb::new("own", opener),
            reads: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.db.is_open()
    }

    pub fn close(&self) {
        self.db.close();
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            opens: self.db.opens(),
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
        }
    }

    /// Open now instead of on first use, surfacing any failure.
    pub async fn open(&self) -> Result<(), StoreError> {
        self.with_conn(|_| Ok(())).await
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.acquire()?;
            f(&*conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    pub async fn get<R: StoredRecord>(&self, key: &str) -> Result<Option<R>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let key = key.to_string();
        let json: Option<String> = self
            .with_conn(move |conn| {
                let sql = format!("SELECT value_json FROM {} WHERE job_id = ?1", R::STORE.table());
                Ok(conn
                    .query_row(&sql, params![key], |row| row.get(0))
                    .optional()?)
            })
            .await?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }

    pub async fn get_all<R: StoredRecord>(&self) -> Result<Vec<R>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let rows: Vec<String> = self
            .with_conn(|conn| {
                let sql = format!(
                    "SELECT value_json FROM {} ORDER BY job_id",
                    R::STORE.table()
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(StoreError::from))
            .collect()
    }

    /// Insert or replace the row for `value.key()`.
    pub async fn set<R: StoredRecord>(&self, value: &R) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = value.key().to_string();
        let json = serde_json::to_string(value)?;
        self.with_conn(move |conn| {
            let sql = format!(
                "INSERT INTO {} (job_id, value_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(job_id) DO UPDATE SET
                    value_json = excluded.value_json,
                    updated_at = excluded.updated_at",
                R::STORE.table()
            );
            conn.execute(&sql, params![key, json, Utc::now().to_rfc3339()])?;
            Ok(())
        })
        .await
    }
}

/// Open (or create) the own database and run migrations.
fn open_own_pool(path: &Path) -> Result<Pool, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            StoreError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
        })?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::builder()
        .max_size(4)
        .connection_timeout(Duration::from_secs(5))
        .build(manager)
        .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}
