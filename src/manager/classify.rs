//! Per-job peer-data classification.
//!
//! Resolution order, first match wins:
//! memo / own registry (confirmed and fresh), peer registry, sample of
//! fetched executions, known-absent peer plugin, then an assumed `false`
//! that is re-checked on the next pass.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use super::ExecutionDataManager;
use crate::model::{ExecutionRecord, JobCacheEntry};
use crate::store::StoreError;

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassSource {
    Memo,
    OwnRegistry,
    PeerRegistry,
    Sample,
    PeerAbsent,
    Assumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub has_peer_data: bool,
    pub assumed: bool,
    pub source: ClassSource,
}

/// In-memory front of the own job registry.
#[derive(Default)]
pub(crate) struct ClassMemo {
    entries: Mutex<HashMap<String, JobCacheEntry>>,
}

impl ClassMemo {
    fn authoritative(&self, job_id: &str, now: DateTime<Utc>, window: Duration) -> Option<bool> {
        let entries = self.entries.lock().ok()?;
        entries.get(job_id)?.authoritative(now, window)
    }

    fn remember(&self, entry: JobCacheEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(entry.job_id.clone(), entry);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

impl ExecutionDataManager {
    /// Resolve whether `job_id` carries peer data, before any fetch.
    pub async fn classify(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Classification, StoreError> {
        let inner = &self.inner;
        let window = inner.cache.classification_window();

        if let Some(has_peer_data) = inner.memo.authoritative(job_id, now, window) {
            return Ok(Classification {
                has_peer_data,
                assumed: false,
                source: ClassSource::Memo,
            });
        }

        let own: Option<JobCacheEntry> = inner.own.get(job_id).await?;
        if let Some(entry) = own {
            if let Some(has_peer_data) = entry.authoritative(now, window) {
                inner.memo.remember(entry);
                return Ok(Classification {
                    has_peer_data,
                    assumed: false,
                    source: ClassSource::OwnRegistry,
                });
            }
        }

        if let Some(peer) = &inner.peer {
            if let Some(found) = peer.try_get_job(job_id).await {
                debug!(%job_id, has_peer_data = found.has_peer_data, "classified from peer registry");
                self.record(JobCacheEntry::confirmed(job_id, found.has_peer_data, now))
                    .await?;
                return Ok(Classification {
                    has_peer_data: found.has_peer_data,
                    assumed: false,
                    source: ClassSource::PeerRegistry,
                });
            }
            // Installed but silent: assume absent, look again next pass.
            self.record(JobCacheEntry::assumed_absent(job_id, now)).await?;
            return Ok(Classification {
                has_peer_data: false,
                assumed: true,
                source: ClassSource::Assumed,
            });
        }

        self.record(JobCacheEntry::confirmed(job_id, false, now))
            .await?;
        Ok(Classification {
            has_peer_data: false,
            assumed: false,
            source: ClassSource::PeerAbsent,
        })
    }

    /// Revisit a classification against freshly fetched executions. A large
    /// enough sample confirms an assumed entry either way; a sample showing
    /// peer data overrides a confirmed `false`. Absence never overrides a
    /// confirmed `true`.
    pub(crate) async fn reclassify_from_sample(
        &self,
        job_id: &str,
        current: Classification,
        sample: &[ExecutionRecord],
        now: DateTime<Utc>,
    ) -> Result<Classification, StoreError> {
        if sample.len() < self.inner.cache.classification_sample {
            return Ok(current);
        }
        let observed = sample.iter().any(|e| e.peer_metric.is_some());
        let contradicts = observed && !current.has_peer_data;
        if !(current.assumed || contradicts) {
            return Ok(current);
        }

        info!(%job_id, has_peer_data = observed, sample = sample.len(), "classified from execution sample");
        self.record(JobCacheEntry::confirmed(job_id, observed, now))
            .await?;
        Ok(Classification {
            has_peer_data: observed,
            assumed: false,
            source: ClassSource::Sample,
        })
    }

    async fn record(&self, entry: JobCacheEntry) -> Result<(), StoreError> {
        self.inner.own.set(&entry).await?;
        self.inner.memo.remember(entry);
        Ok(())
    }
}
