use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical attributes last reported by the device for a slot.
///
/// Kept in the ledger so the merged view has something to show while the
/// printer is offline or after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicalFields {
    pub present: bool,
    pub material: Option<String>,
    pub color_hex: Option<String>,
    pub tag_id: Option<String>,
}

/// Bookkeeping for one slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotEntry {
    /// Roll counter; advanced only by a roll change.
    pub epoch: u32,
    /// Measured weight at the last reference point, `None` until measured.
    pub reference_weight_g: Option<f64>,
    pub reference_set_at: Option<DateTime<Utc>>,
    /// Grams attributed to the loaded roll. Only a roll change resets it.
    pub consumed_g_since_reference: f64,
    /// `consumed_g_since_reference` at the moment `reference_weight_g` was measured.
    pub consumed_g_at_measurement: f64,
    /// Remote inventory spool currently associated with this slot.
    pub linked_inventory_id: Option<i64>,
    /// Labels imported from the linked spool.
    pub spool_name: String,
    pub manufacturer: String,
    pub last_known: PhysicalFields,
}

impl SlotEntry {
    /// Grams consumed since the reference weight was last measured.
    pub fn consumed_since_measurement(&self) -> f64 {
        (self.consumed_g_since_reference - self.consumed_g_at_measurement).max(0.0)
    }
}
