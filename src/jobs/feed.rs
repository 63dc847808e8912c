use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use super::attribution::{job_key, round_g};
use super::types::{ColorPart, JobRecord, JobStatus};
use crate::config::TrackingConfig;
use crate::slot::{normalize_color, normalize_material, FALLBACK_MATERIAL};

/// Values of `filament_used` below this are taken to be metres rather than mm.
const METRES_THRESHOLD: f64 = 200.0;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("History request failed: {0}")]
    Request(String),

    #[error("Malformed history response: {0}")]
    Malformed(String),

    #[error("Unparseable history entry: {0}")]
    Entry(String),
}

/// A pollable list of finished jobs.
#[async_trait]
pub trait HistoryFeed: Send + Sync {
    /// Raw job entries, newest first. Entries may repeat across calls.
    async fn fetch_jobs(&self, limit: usize) -> Result<Vec<Value>, FeedError>;
}

/// Parse one raw history entry.
///
/// Returns `Ok(None)` for jobs still in progress; they are picked up once finished.
pub fn parse_history_entry(
    raw: &Value,
    tracking: &TrackingConfig,
) -> Result<Option<JobRecord>, FeedError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| FeedError::Entry("entry is not an object".to_string()))?;

    let status = JobStatus::parse(obj.get("status").and_then(Value::as_str).unwrap_or(""));
    if status == JobStatus::InProgress {
        return Ok(None);
    }

    let job_id = ["job_id", "uid"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(id_string))
        .unwrap_or_default();
    let name = obj
        .get("filename")
        .and_then(Value::as_str)
        .map(|f| f.rsplit('/').next().unwrap_or(f).to_string())
        .unwrap_or_default();
    if job_id.is_empty() && name.is_empty() {
        return Err(FeedError::Entry("entry has neither job id nor filename".to_string()));
    }

    let start_ts = obj.get("start_time").and_then(number);
    let end_ts = obj.get("end_time").and_then(number);

    let meta = obj.get("metadata").and_then(Value::as_object);
    let material = meta
        .and_then(|m| m.get("filament_type"))
        .and_then(Value::as_str)
        .and_then(|t| t.split(';').next())
        .map(normalize_material);

    let total_mm = obj
        .get("filament_used")
        .and_then(number)
        .map(|used| if used < METRES_THRESHOLD { used * 1000.0 } else { used })
        .unwrap_or(0.0)
        .max(0.0);

    let colors = meta.map(colors_of).unwrap_or_default();
    let grams_list: Vec<f64> = meta
        .and_then(|m| m.get("filament_used_g"))
        .and_then(Value::as_array)
        .map(|list| list.iter().map(|v| number(v).unwrap_or(0.0)).collect())
        .unwrap_or_default();

    let parts: Vec<ColorPart> = grams_list
        .iter()
        .enumerate()
        .filter(|(_, g)| **g > 0.0)
        .map(|(index, g)| ColorPart {
            index,
            grams: round_g(*g),
            color_hex: colors.get(index).cloned().flatten(),
        })
        .collect();

    let total_g = if parts.is_empty() {
        tracking.mm_to_g(material.as_deref().unwrap_or(FALLBACK_MATERIAL), total_mm)
    } else {
        parts.iter().map(|p| p.grams).sum()
    };

    Ok(Some(JobRecord {
        key: job_key(&job_id, &name, end_ts),
        job_id,
        name,
        status,
        material,
        started_at: start_ts.and_then(timestamp),
        ended_at: end_ts.and_then(timestamp),
        total_g: round_g(total_g),
        total_mm,
        parts,
    }))
}

/// Unwrap the `result.jobs` array of a `server/history/list` response.
pub fn history_jobs(body: &Value) -> Result<Vec<Value>, FeedError> {
    body.get("result")
        .and_then(|r| r.get("jobs"))
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| FeedError::Malformed("missing result.jobs array".to_string()))
}

fn colors_of(meta: &Map<String, Value>) -> Vec<Option<String>> {
    let raw = meta
        .get("filament_colors")
        .or_else(|| meta.get("default_filament_colour"))
        .or_else(|| meta.get("filament_colour"));
    match raw {
        Some(Value::Array(list)) => list
            .iter()
            .map(|v| v.as_str().and_then(normalize_color))
            .collect(),
        Some(Value::String(s)) => s.split(';').map(normalize_color).collect(),
        _ => Vec::new(),
    }
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|f: &f64| f.is_finite())
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp(secs: f64) -> Option<DateTime<Utc>> {
    if secs <= 0.0 {
        return None;
    }
    DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
}
