//! Host execution-history wire format and its mapping into [`ExecutionRecord`].
//!
//! The host envelope is loosely typed. Everything is optional on the wire; a
//! record is only produced when it has an id and a start timestamp.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::model::{ExecutionRecord, ExecutionStatus};

#[derive(Debug, Deserialize)]
pub struct ExecutionsEnvelope {
    #[serde(default)]
    pub executions: Vec<Value>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub max: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireExecution {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, rename = "date-started")]
    date_started: Option<WireDate>,
    #[serde(default, rename = "date-ended")]
    date_ended: Option<WireDate>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    duration: Option<Value>,
    #[serde(default)]
    job: Option<WireJob>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct WireDate {
    #[serde(default)]
    unixtime: Option<i64>,
    #[serde(default)]
    date: Option<String>,
}

impl WireDate {
    fn to_utc(&self) -> Option<DateTime<Utc>> {
        if let Some(ms) = self.unixtime {
            return Utc.timestamp_millis_opt(ms).single();
        }
        self.date
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[derive(Debug, Deserialize)]
struct WireJob {
    #[serde(default, rename = "averageDuration")]
    average_duration: Option<Value>,
}

/// One decoded page.
#[derive(Debug, Default)]
pub struct ParsedPage {
    /// Items on the wire, including rejected ones. Drives pagination.
    pub raw_count: usize,
    pub records: Vec<ExecutionRecord>,
    pub rejected: usize,
}

/// Decode a page body. Fails only when the envelope itself is not JSON of the
/// expected shape; individual bad executions are counted and skipped.
pub fn parse_page(body: &[u8], peer_metric_field: &str) -> Result<ParsedPage, serde_json::Error> {
    let envelope: ExecutionsEnvelope = serde_json::from_slice(body)?;
    let mut page = ParsedPage {
        raw_count: envelope.executions.len(),
        ..ParsedPage::default()
    };

    for raw in envelope.executions {
        match serde_json::from_value::<WireExecution>(raw)
            .ok()
            .and_then(|w| to_record(w, peer_metric_field))
        {
            Some(rec) => page.records.push(rec),
            None => page.rejected += 1,
        }
    }

    if page.rejected > 0 {
        tracing::warn!(rejected = page.rejected, "skipped executions missing id or start time");
    }
    Ok(page)
}

fn to_record(w: WireExecution, peer_metric_field: &str) -> Option<ExecutionRecord> {
    let id = match w.id? {
        Value::String(s) if !s.is_empty() => s,
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let started_at = w.date_started.as_ref()?.to_utc()?;

    let duration_ms = w
        .duration
        .as_ref()
        .and_then(as_non_negative_ms)
        .or_else(|| {
            let ended = w.date_ended.as_ref()?.to_utc()?;
            u64::try_from((ended - started_at).num_milliseconds()).ok()
        });

    let job_average_duration_ms = w
        .job
        .as_ref()
        .and_then(|j| j.average_duration.as_ref())
        .and_then(as_non_negative_ms);

    let peer_metric = w.extra.get(peer_metric_field).and_then(as_finite_f64);

    Some(ExecutionRecord {
        id,
        started_at,
        status: ExecutionStatus::from_wire(w.status.as_deref().unwrap_or("")),
        duration_ms,
        job_average_duration_ms,
        peer_metric,
    })
}

fn as_finite_f64(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Durations outside `0..2^64` ms are dropped rather than clamped.
fn as_non_negative_ms(v: &Value) -> Option<u64> {
    let n = as_finite_f64(v)?.round();
    (n >= 0.0 && n < u64::MAX as f64).then_some(n as u64)
}
