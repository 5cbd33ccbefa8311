//! TOML configuration for jobcache.
//!
//! Layered model: the file named by `JOBCACHE_CONFIG`, then `./jobcache.toml`,
//! then compiled-in defaults. Every section is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "JOBCACHE_CONFIG";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try `JOBCACHE_CONFIG`, then `./jobcache.toml`, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "JOBCACHE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new("jobcache.toml");
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Host application API coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// API origin, e.g. `http://localhost:4440`.
    pub rd_base: String,
    /// Project that scopes every history request.
    pub project: String,
    pub api_version: u32,
    /// Optional bearer token sent with every request.
    pub auth_token: Option<String>,
    /// Wire key of the companion plugin's numeric annotation.
    pub peer_metric_field: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            rd_base: "http://localhost:4440".to_string(),
            project: "default".to_string(),
            api_version: 41,
            auth_token: None,
            peer_metric_field: "peerMetric".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Own-store location and freshness rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub db_path: PathBuf,
    /// Execution cache TTL.
    pub ttl_hours: i64,
    /// How long a confirmed peer-data classification stays authoritative.
    pub classification_stale_hours: i64,
    /// Peer cache entries younger than this are served without a fetch.
    pub peer_fresh_minutes: i64,
    /// Own copy older than this is replaced by a fresh peer entry.
    pub peer_copy_stale_hours: i64,
    /// Minimum fetched executions needed to classify from a sample.
    pub classification_sample: usize,
    /// Time window used when the caller gives none.
    pub default_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/jobcache.db"),
            ttl_hours: 24,
            classification_stale_hours: 8,
            peer_fresh_minutes: 60,
            peer_copy_stale_hours: 8,
            classification_sample: 5,
            default_days: 7,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours)
    }

    pub fn classification_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.classification_stale_hours)
    }

    pub fn peer_fresh(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.peer_fresh_minutes)
    }

    pub fn peer_copy_stale(&self) -> chrono::Duration {
        chrono::Duration::hours(self.peer_copy_stale_hours)
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// Companion plugin's database. Read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Whether the companion plugin is installed. When false the peer
    /// database is never opened.
    pub installed: bool,
    pub db_path: PathBuf,
    pub open_timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            installed: false,
            db_path: PathBuf::from("data/peer.db"),
            open_timeout_ms: 3_000,
        }
    }
}

impl PeerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Background worker tuning and lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_concurrent: usize,
    pub page_size: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Recent-window fallback (days) when a fetch carries no date range.
    pub default_recent_days: u32,
    pub request_timeout_secs: u64,
    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
    pub max_init_failures: u32,
    pub restart_backoff_ms: u64,
    pub restart_backoff_cap_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            page_size: 500,
            max_attempts: 3,
            retry_backoff_ms: 500,
            default_recent_days: 10,
            request_timeout_secs: 30,
            health_interval_secs: 60,
            health_timeout_secs: 5,
            max_init_failures: 3,
            restart_backoff_ms: 1_000,
            restart_backoff_cap_ms: 4_000,
        }
    }
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
