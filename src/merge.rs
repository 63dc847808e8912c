//! Read-side join of device telemetry and the consumption ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ledger::{remaining_for, EpochLedger};
use crate::slot::SlotKey;
use crate::telemetry::{BoxTelemetry, PrintStatus, TelemetryView};

/// Where a merged slot's physical fields came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalSource {
    /// Latest snapshot, device connected.
    Live,
    /// Latest snapshot kept from before the connection dropped.
    Cached,
    /// Nothing in the snapshot; values last recorded in the ledger.
    LastKnown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedSlot {
    pub slot: SlotKey,
    pub present: bool,
    pub material: Option<String>,
    pub color_hex: Option<String>,
    pub tag_id: Option<String>,
    pub percent_remaining: Option<f64>,
    pub physical_source: PhysicalSource,
    pub active: bool,
    pub epoch: u32,
    pub reference_weight_g: Option<f64>,
    pub consumed_g_since_reference: f64,
    pub remaining_g: f64,
    pub linked_inventory_id: Option<i64>,
    pub spool_name: String,
    pub manufacturer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedState {
    pub connected: bool,
    /// Physical fields are not from a live connection.
    pub stale: bool,
    pub state_version: u64,
    pub telemetry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub active_slot: Option<SlotKey>,
    pub boxes: BTreeMap<u8, BoxTelemetry>,
    pub print: Option<PrintStatus>,
    pub slots: Vec<MergedSlot>,
}

/// Telemetry wins for physical fields; ownership fields come only from the ledger.
pub fn merge(ledger: &EpochLedger, view: &TelemetryView, full_roll_weight_g: f64) -> MergedState {
    let connected = view.is_live();
    let snapshot = view.snapshot.as_deref();
    let source = if connected {
        PhysicalSource::Live
    } else {
        PhysicalSource::Cached
    };
    let active_slot = snapshot.and_then(|s| s.active_slot);

    let slots = ledger
        .iter()
        .map(|(key, entry)| {
            let (present, material, color_hex, tag_id, percent_remaining, physical_source) =
                match snapshot.and_then(|s| s.slots.get(key)) {
                    Some(t) => (
                        t.present,
                        t.material.clone(),
                        t.color_hex.clone(),
                        t.tag_id.clone(),
                        t.percent_remaining,
                        source,
                    ),
                    None => (
                        entry.last_known.present,
                        entry.last_known.material.clone(),
                        entry.last_known.color_hex.clone(),
                        entry.last_known.tag_id.clone(),
                        None,
                        PhysicalSource::LastKnown,
                    ),
                };
            MergedSlot {
                slot: *key,
                present,
                material,
                color_hex,
                tag_id,
                percent_remaining,
                physical_source,
                active: active_slot == Some(*key),
                epoch: entry.epoch,
                reference_weight_g: entry.reference_weight_g,
                consumed_g_since_reference: entry.consumed_g_since_reference,
                remaining_g: remaining_for(entry, full_roll_weight_g),
                linked_inventory_id: entry.linked_inventory_id,
                spool_name: entry.spool_name.clone(),
                manufacturer: entry.manufacturer.clone(),
            }
        })
        .collect();

    MergedState {
        connected,
        stale: !connected,
        state_version: 0,
        telemetry_at: snapshot.map(|s| s.received_at),
        last_error: view.last_error.clone(),
        active_slot,
        boxes: snapshot.map(|s| s.boxes.clone()).unwrap_or_default(),
        print: snapshot.and_then(|s| s.print.clone()),
        slots,
    }
}
