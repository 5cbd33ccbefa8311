//! Per-job aggregate metrics over a batch of fetched executions.

use std::collections::BTreeMap;

use chrono::{NaiveDate, Timelike};
use serde::{Deserialize, Serialize};

use crate::model::{ExecutionRecord, ExecutionStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DayBucket {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// Percentage, 0 when there are no executions.
    pub success_rate: f64,
    pub total_duration_ms: u64,
    pub avg_duration_ms: f64,
    pub by_day: BTreeMap<NaiveDate, DayBucket>,
    /// Executions per UTC start hour, index 0..24.
    pub by_hour: Vec<u64>,
    pub has_peer_metric: bool,
}

pub fn compute_metrics(executions: &[ExecutionRecord]) -> JobMetrics {
    let mut m = JobMetrics {
        by_hour: vec![0; 24],
        ..JobMetrics::default()
    };

    let mut timed = 0u64;
    for e in executions {
        m.total += 1;
        let bucket = m.by_day.entry(e.start_day()).or_default();
        bucket.total += 1;
        match e.status {
            ExecutionStatus::Succeeded => {
                m.successful += 1;
                bucket.successful += 1;
            }
            ExecutionStatus::Failed => {
                m.failed += 1;
                bucket.failed += 1;
            }
            _ => {}
        }
        m.by_hour[e.started_at.hour() as usize] += 1;

        if let Some(d) = e.duration_ms {
            m.total_duration_ms = m.total_duration_ms.saturating_add(d);
            timed += 1;
        }
        if e.peer_metric.is_some() {
            m.has_peer_metric = true;
        }
    }

    if m.total > 0 {
        m.success_rate = m.successful as f64 / m.total as f64 * 100.0;
    }

    // The host's rolled-up average on the newest run beats our own mean.
    let hint = executions
        .iter()
        .max_by_key(|e| e.started_at)
        .and_then(|e| e.job_average_duration_ms);
    m.avg_duration_ms = match hint {
        Some(avg) => avg as f64,
        None if timed > 0 => m.total_duration_ms as f64 / timed as f64,
        None => 0.0,
    };

    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn exec(id: &str, hour: u32, status: ExecutionStatus, secs: Option<u64>) -> ExecutionRecord {
        ExecutionRecord {
            id: id.to_string(),
            started_at: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            status,
            duration_ms: secs.map(|s| s * 1000),
            job_average_duration_ms: None,
            peer_metric: None,
        }
    }

    #[test]
    fn test_counts_rate_and_mean_duration() {
        let execs = vec![
            exec("1", 9, ExecutionStatus::Succeeded, Some(10)),
            exec("2", 9, ExecutionStatus::Succeeded, Some(20)),
            exec("3", 14, ExecutionStatus::Failed, Some(30)),
        ];
        let m = compute_metrics(&execs);
        assert_eq!(m.total, 3);
        assert_eq!(m.successful, 2);
        assert_eq!(m.failed, 1);
        assert!((m.success_rate - 66.666).abs() < 0.01);
        assert_eq!(m.total_duration_ms, 60_000);
        assert_eq!(m.avg_duration_ms, 20_000.0);
        assert_eq!(m.by_hour[9], 2);
        assert_eq!(m.by_hour[14], 1);
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(m.by_day[&day].total, 3);
        assert!(!m.has_peer_metric);
    }

    #[test]
    fn test_average_hint_from_newest_execution_wins() {
        let mut older = exec("1", 1, ExecutionStatus::Succeeded, Some(10));
        older.job_average_duration_ms = Some(99_000);
        let mut newest = exec("2", 23, ExecutionStatus::Succeeded, Some(10));
        newest.job_average_duration_ms = Some(45_000);

        let m = compute_metrics(&[older, newest]);
        assert_eq!(m.avg_duration_ms, 45_000.0);
    }

    #[test]
    fn test_empty_batch() {
        let m = compute_metrics(&[]);
        assert_eq!(m.total, 0);
        assert_eq!(m.success_rate, 0.0);
        assert_eq!(m.avg_duration_ms, 0.0);
        assert_eq!(m.by_hour.len(), 24);
    }

    #[test]
    fn test_peer_metric_detected() {
        let mut e = exec("1", 1, ExecutionStatus::Other, None);
        e.peer_metric = Some(0.0);
        assert!(compute_metrics(&[e]).has_peer_metric);
    }

    #[test]
    fn test_huge_durations_saturate() {
        let mut a = exec("1", 1, ExecutionStatus::Succeeded, None);
        a.duration_ms = Some(u64::MAX);
        let mut b = exec("2", 2, ExecutionStatus::Succeeded, None);
        b.duration_ms = Some(u64::MAX - 1);

        let m = compute_metrics(&[a, b]);
        assert_eq!(m.total_duration_ms, u64::MAX);
        assert!(m.avg_duration_ms > 0.0);
    }
}
