use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::log::Keyed;
use crate::slot::SlotKey;

/// Final state of a job as reported by the history feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Cancelled,
    Error,
    Interrupted,
    InProgress,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "completed" | "complete" => JobStatus::Completed,
            "cancelled" | "canceled" => JobStatus::Cancelled,
            "error" => JobStatus::Error,
            "klippy_shutdown" | "klippy_disconnect" | "server_exit" | "interrupted" => {
                JobStatus::Interrupted
            }
            "in_progress" | "printing" => JobStatus::InProgress,
            _ => JobStatus::Unknown,
        }
    }
}

/// Usage of one filament colour within a multi-colour job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorPart {
    /// Position in the slicer's filament list.
    pub index: usize,
    pub grams: f64,
    #[serde(default)]
    pub color_hex: Option<String>,
}

/// A finished job observed in the history feed. Immutable once logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub key: String,
    #[serde(default)]
    pub job_id: String,
    pub name: String,
    pub status: JobStatus,
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_g: f64,
    #[serde(default)]
    pub total_mm: f64,
    /// Positive per-colour usage only.
    #[serde(default)]
    pub parts: Vec<ColorPart>,
}

impl Keyed for JobRecord {
    fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationOrigin {
    Manual,
    Automatic,
    /// Marker carried over from an older state file without per-slot amounts.
    Imported,
}

/// Grams charged to one slot, tagged with the roll epoch active at the time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Portion {
    pub grams: f64,
    pub epoch: u32,
}

/// The durable attribution of a job's usage to slots. At most one per job key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub job_key: String,
    #[serde(default)]
    pub portions: BTreeMap<SlotKey, Portion>,
    pub origin: AllocationOrigin,
    pub created_at: DateTime<Utc>,
}

impl Allocation {
    pub fn total_g(&self) -> f64 {
        self.portions.values().map(|p| p.grams).sum()
    }

    pub fn grams_by_slot(&self) -> BTreeMap<SlotKey, f64> {
        self.portions.iter().map(|(k, p)| (*k, p.grams)).collect()
    }
}

impl Keyed for Allocation {
    fn key(&self) -> &str {
        &self.job_key
    }
}

/// One thing the user can attribute to a slot: a colour part, or the whole job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributionTarget {
    pub part: Option<usize>,
    pub grams: f64,
    pub color_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingJob {
    pub key: String,
    pub name: String,
    pub status: JobStatus,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_g: f64,
    pub targets: Vec<AttributionTarget>,
}

/// A slot's share of one allocated job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotUsageRecord {
    pub job_key: String,
    pub job_name: String,
    pub grams: f64,
    pub epoch: u32,
    /// Recorded against the roll currently loaded in the slot.
    pub current_roll: bool,
    pub origin: AllocationOrigin,
    pub allocated_at: DateTime<Utc>,
}
