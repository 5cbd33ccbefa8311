//! Core data model -- execution records, cache rows, and calendar-day ranges.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single job run, collapsed to the set the dashboard renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    Aborted,
    Other,
}

impl ExecutionStatus {
    /// Map a host status string onto the closed set.
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "succeeded" | "success" => ExecutionStatus::Succeeded,
            "failed" | "failed-with-retry" | "timedout" => ExecutionStatus::Failed,
            "aborted" => ExecutionStatus::Aborted,
            _ => ExecutionStatus::Other,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Succeeded => write!(f, "succeeded"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Aborted => write!(f, "aborted"),
            ExecutionStatus::Other => write!(f, "other"),
        }
    }
}

/// One job run. Immutable once fetched; `id` is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Job-level rolled-up average duration attached by the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_average_duration_ms: Option<u64>,
    /// Companion-plugin numeric annotation, when the job carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_metric: Option<f64>,
}

impl ExecutionRecord {
    /// Calendar day (UTC) the execution started on.
    pub fn start_day(&self) -> NaiveDate {
        self.started_at.date_naive()
    }
}

/// Inclusive range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub begin: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Build a range, normalizing reversed bounds.
    pub fn new(begin: NaiveDate, end: NaiveDate) -> Self {
        if begin <= end {
            Self { begin, end }
        } else {
            Self { begin: end, end: begin }
        }
    }

    /// The trailing `days` window ending today: `[today - days, today]`.
    pub fn trailing(today: NaiveDate, days: u32) -> Self {
        Self {
            begin: window_cutoff(today, days),
            end: today,
        }
    }

    pub fn contains(&self, other: &DateRange) -> bool {
        self.begin <= other.begin && self.end >= other.end
    }

    /// Outer bounds of both ranges. Gaps between disjoint ranges are absorbed.
    pub fn union(&self, other: &DateRange) -> DateRange {
        DateRange {
            begin: self.begin.min(other.begin),
            end: self.end.max(other.end),
        }
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.begin, self.end)
    }
}

/// First day included in a trailing window of `days` days. Windows reaching
/// past the calendar clamp to its first day.
pub fn window_cutoff(today: NaiveDate, days: u32) -> NaiveDate {
    today
        .checked_sub_signed(Duration::days(i64::from(days)))
        .unwrap_or(NaiveDate::MIN)
}

/// Job registry row: whether a job carries peer data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCacheEntry {
    pub job_id: String,
    pub last_checked: DateTime<Utc>,
    /// `None` while the job has never been classified.
    pub has_peer_data: Option<bool>,
    /// Set when `has_peer_data = false` was inferred from absence of evidence.
    #[serde(default)]
    pub assumed: bool,
}

impl JobCacheEntry {
    pub fn confirmed(job_id: &str, has_peer_data: bool, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.to_string(),
            last_checked: now,
            has_peer_data: Some(has_peer_data),
            assumed: false,
        }
    }

    pub fn assumed_absent(job_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.to_string(),
            last_checked: now,
            has_peer_data: Some(false),
            assumed: true,
        }
    }

    /// A confirmed classification still inside its authority window.
    pub fn authoritative(&self, now: DateTime<Utc>, window: Duration) -> Option<bool> {
        if self.assumed || now - self.last_checked >= window {
            return None;
        }
        self.has_peer_data
    }
}

/// Per-job execution cache row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCacheEntry {
    pub job_id: String,
    /// Arrival order, unique by `id`.
    pub executions: Vec<ExecutionRecord>,
    pub last_fetched: DateTime<Utc>,
    pub covered: DateRange,
    #[serde(default)]
    pub has_peer_data: bool,
}

impl ExecutionCacheEntry {
    pub fn new(
        job_id: &str,
        executions: Vec<ExecutionRecord>,
        covered: DateRange,
        has_peer_data: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            executions: merge_executions(Vec::new(), executions),
            last_fetched: now,
            covered,
            has_peer_data,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_fetched
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.age(now) < ttl
    }

    pub fn covers(&self, range: &DateRange) -> bool {
        self.covered.contains(range)
    }

    /// Fold a fresh fetch into this entry: fresh records win on id conflict and
    /// the covered range grows to the union.
    pub fn merge(
        &mut self,
        fresh: Vec<ExecutionRecord>,
        fetched: DateRange,
        has_peer_data: bool,
        now: DateTime<Utc>,
    ) {
        let existing = std::mem::take(&mut self.executions);
        self.executions = merge_executions(existing, fresh);
        self.covered = self.covered.union(&fetched);
        self.has_peer_data = has_peer_data;
        self.last_fetched = now;
    }
}

/// Union two record sets keeping arrival order. A later record with an id
/// already present replaces the earlier one in place.
pub fn merge_executions(
    existing: Vec<ExecutionRecord>,
    fresh: Vec<ExecutionRecord>,
) -> Vec<ExecutionRecord> {
    let mut out: Vec<ExecutionRecord> = Vec::with_capacity(existing.len() + fresh.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for rec in existing.into_iter().chain(fresh) {
        match index.get(&rec.id) {
            Some(&pos) => out[pos] = rec,
            None => {
                index.insert(rec.id.clone(), out.len());
                out.push(rec);
            }
        }
    }
    out
}

/// Executions whose start day is on or after `cutoff`.
pub fn filter_executions_by_date(
    executions: &[ExecutionRecord],
    cutoff: NaiveDate,
) -> Vec<ExecutionRecord> {
    executions
        .iter()
        .filter(|e| e.start_day() >= cutoff)
        .cloned()
        .collect()
}
