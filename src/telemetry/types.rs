use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::slot::SlotKey;

/// Physical state of one slot as reported by the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotTelemetry {
    pub present: bool,
    pub material: Option<String>,
    pub color_hex: Option<String>,
    pub tag_id: Option<String>,
    /// Remaining filament in percent, when the firmware reports it.
    pub percent_remaining: Option<f64>,
}

/// Box-level state: connection plus drying environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoxTelemetry {
    pub connected: bool,
    pub state: String,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintState {
    Standby,
    Printing,
    Paused,
    Complete,
    Cancelled,
    Error,
    Unknown,
}

impl PrintState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "standby" | "ready" | "idle" => PrintState::Standby,
            "printing" => PrintState::Printing,
            "paused" => PrintState::Paused,
            "complete" | "completed" => PrintState::Complete,
            "cancelled" | "canceled" => PrintState::Cancelled,
            "error" => PrintState::Error,
            _ => PrintState::Unknown,
        }
    }

    /// Printing or paused: filament may still be consumed for the current job.
    pub fn is_active(&self) -> bool {
        matches!(self, PrintState::Printing | PrintState::Paused)
    }
}

/// Progress of the job on the printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintStatus {
    pub state: PrintState,
    pub filename: String,
    /// Cumulative filament length fed for this job, in mm.
    pub filament_used_mm: f64,
    /// Planned totals from the sliced file, when the firmware exposes them.
    pub planned_g: Option<f64>,
    pub planned_mm: Option<f64>,
}

impl PrintStatus {
    /// Grams per mm derived from the job's planned totals.
    pub fn grams_per_mm(&self) -> Option<f64> {
        match (self.planned_g, self.planned_mm) {
            (Some(g), Some(mm)) if g > 0.0 && mm > 0.0 => Some(g / mm),
            _ => None,
        }
    }
}

/// One decoded telemetry frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub received_at: DateTime<Utc>,
    pub slots: BTreeMap<SlotKey, SlotTelemetry>,
    pub boxes: BTreeMap<u8, BoxTelemetry>,
    pub active_slot: Option<SlotKey>,
    pub print: Option<PrintStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// What the supervisor publishes: connectivity plus the latest snapshot.
///
/// The snapshot survives disconnects; `sequence` increments on every new snapshot.
#[derive(Debug, Clone, Default)]
pub struct TelemetryView {
    pub link: LinkState,
    pub snapshot: Option<Arc<TelemetrySnapshot>>,
    pub sequence: u64,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
}

impl TelemetryView {
    /// Connected and receiving.
    pub fn is_live(&self) -> bool {
        self.link == LinkState::Connected
    }
}
