//! Per-slot consumption ledger.
//!
//! Tracks, for every slot, which roll is loaded (the epoch), the reference
//! weight of that roll, and the grams consumed from it. Consumption only grows
//! until the next roll change; a re-measurement moves the offset that remaining
//! weight is computed from.
//! The ledger is plain data: it never performs I/O. Persistence and the
//! state-version bump are handled by the owner (`SpoolKeeper`), which applies
//! mutations to a working copy and only commits after a successful save.

mod types;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::KeeperError;
use crate::slot::SlotKey;

pub use types::{PhysicalFields, SlotEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochLedger {
    slots: BTreeMap<SlotKey, SlotEntry>,
}

impl Default for EpochLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochLedger {
    /// A ledger with an empty entry for every slot of the changer.
    pub fn new() -> Self {
        let mut ledger = Self {
            slots: BTreeMap::new(),
        };
        ledger.ensure_all_slots();
        ledger
    }

    /// Add empty entries for slots missing from a loaded snapshot.
    pub fn ensure_all_slots(&mut self) {
        for key in SlotKey::all() {
            self.slots.entry(key).or_default();
        }
    }

    pub fn entry(&self, slot: SlotKey) -> Result<&SlotEntry, KeeperError> {
        self.slots
            .get(&slot)
            .ok_or_else(|| KeeperError::UnknownSlot(slot.to_string()))
    }

    fn entry_mut(&mut self, slot: SlotKey) -> Result<&mut SlotEntry, KeeperError> {
        self.slots
            .get_mut(&slot)
            .ok_or_else(|| KeeperError::UnknownSlot(slot.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SlotKey, &SlotEntry)> {
        self.slots.iter()
    }

    pub fn contains(&self, slot: SlotKey) -> bool {
        self.slots.contains_key(&slot)
    }

    /// Establish a new consumption baseline for the roll already in place.
    ///
    /// The epoch and the roll's running consumption are unchanged; remaining weight
    /// is computed from the measured weight minus what is consumed after this point.
    pub fn set_reference(
        &mut self,
        slot: SlotKey,
        weight_g: f64,
        at: DateTime<Utc>,
    ) -> Result<(), KeeperError> {
        if !weight_g.is_finite() || weight_g < 0.0 {
            return Err(KeeperError::InvalidWeight {
                slot,
                grams: weight_g,
            });
        }
        let entry = self.entry_mut(slot)?;
        entry.reference_weight_g = Some(weight_g);
        entry.reference_set_at = Some(at);
        entry.consumed_g_at_measurement = entry.consumed_g_since_reference;
        info!("Slot {} reference set to {:.2}g (epoch {})", slot, weight_g, entry.epoch);
        Ok(())
    }

    /// Roll change: advance the epoch, clear reference and consumption, drop the link.
    ///
    /// This is the only operation that advances an epoch. Returns the new epoch.
    pub fn start_new_roll(&mut self, slot: SlotKey) -> Result<u32, KeeperError> {
        let entry = self.entry_mut(slot)?;
        entry.epoch = entry.epoch.saturating_add(1);
        entry.consumed_g_since_reference = 0.0;
        entry.consumed_g_at_measurement = 0.0;
        entry.reference_weight_g = None;
        entry.reference_set_at = None;
        entry.spool_name.clear();
        entry.manufacturer.clear();
        if let Some(previous) = entry.linked_inventory_id.take() {
            info!("Slot {} unlinked from spool {} on roll change", slot, previous);
        }
        info!("Slot {} started roll epoch {}", slot, entry.epoch);
        Ok(entry.epoch)
    }

    /// Add consumed grams to a slot. Negative or non-finite amounts are ignored.
    pub fn debit(&mut self, slot: SlotKey, grams: f64) -> Result<(), KeeperError> {
        let entry = self.entry_mut(slot)?;
        if !grams.is_finite() || grams < 0.0 {
            warn!("Ignoring debit of {} g on slot {}", grams, slot);
            return Ok(());
        }
        entry.consumed_g_since_reference += grams;
        Ok(())
    }

    /// Remaining grams for display: reference (or a full roll) minus consumption, floored at 0.
    pub fn derive_remaining(&self, slot: SlotKey, full_roll_weight_g: f64) -> Result<f64, KeeperError> {
        let entry = self.entry(slot)?;
        Ok(remaining_for(entry, full_roll_weight_g))
    }

    pub fn link(&mut self, slot: SlotKey, spool_id: i64) -> Result<(), KeeperError> {
        let entry = self.entry_mut(slot)?;
        entry.linked_inventory_id = Some(spool_id);
        Ok(())
    }

    /// Clear the inventory link, returning the spool that was linked.
    pub fn unlink(&mut self, slot: SlotKey) -> Result<Option<i64>, KeeperError> {
        let entry = self.entry_mut(slot)?;
        Ok(entry.linked_inventory_id.take())
    }

    /// Store spool labels imported from the inventory service.
    pub fn set_spool_labels(
        &mut self,
        slot: SlotKey,
        name: &str,
        manufacturer: &str,
    ) -> Result<(), KeeperError> {
        let entry = self.entry_mut(slot)?;
        entry.spool_name = name.to_string();
        entry.manufacturer = manufacturer.to_string();
        Ok(())
    }

    /// Slot currently linked to `spool_id`, if any.
    pub fn linked_slot(&self, spool_id: i64) -> Option<SlotKey> {
        self.slots
            .iter()
            .find(|(_, e)| e.linked_inventory_id == Some(spool_id))
            .map(|(k, _)| *k)
    }

    /// Record the latest physical fields reported for a slot. Returns whether anything changed.
    pub fn observe_physical(
        &mut self,
        slot: SlotKey,
        fields: PhysicalFields,
    ) -> Result<bool, KeeperError> {
        let entry = self.entry_mut(slot)?;
        if entry.last_known == fields {
            return Ok(false);
        }
        entry.last_known = fields;
        Ok(true)
    }
}

/// `max(0, reference or full roll − consumed since it)`.
pub fn remaining_for(entry: &SlotEntry, full_roll_weight_g: f64) -> f64 {
    match entry.reference_weight_g {
        Some(reference) => (reference - entry.consumed_since_measurement()).max(0.0),
        None => (full_roll_weight_g - entry.consumed_g_since_reference).max(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(s: &str) -> SlotKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_new_ledger_has_all_slots() {
        let ledger = EpochLedger::new();
        assert_eq!(ledger.iter().count(), 16);
        let entry = ledger.entry(slot("4D")).unwrap();
        assert_eq!(entry.epoch, 0);
        assert_eq!(entry.consumed_g_since_reference, 0.0);
        assert!(entry.reference_weight_g.is_none());
    }

    #[test]
    fn test_set_reference_rejects_negative() {
        let mut ledger = EpochLedger::new();
        let err = ledger.set_reference(slot("1A"), -1.0, Utc::now()).unwrap_err();
        assert!(matches!(err, KeeperError::InvalidWeight { .. }));
        let err = ledger.set_reference(slot("1A"), f64::NAN, Utc::now()).unwrap_err();
        assert!(matches!(err, KeeperError::InvalidWeight { .. }));
        assert!(ledger.entry(slot("1A")).unwrap().reference_weight_g.is_none());
    }

    #[test]
    fn test_set_reference_keeps_epoch_and_consumption() {
        let mut ledger = EpochLedger::new();
        ledger.start_new_roll(slot("1A")).unwrap();
        ledger.debit(slot("1A"), 40.0).unwrap();
        ledger.set_reference(slot("1A"), 700.0, Utc::now()).unwrap();

        let entry = ledger.entry(slot("1A")).unwrap();
        assert_eq!(entry.epoch, 1);
        assert_eq!(entry.reference_weight_g, Some(700.0));
        assert_eq!(entry.consumed_g_since_reference, 40.0);
        assert_eq!(entry.consumed_since_measurement(), 0.0);
        assert_eq!(ledger.derive_remaining(slot("1A"), 1000.0).unwrap(), 700.0);

        ledger.debit(slot("1A"), 25.0).unwrap();
        let entry = ledger.entry(slot("1A")).unwrap();
        assert_eq!(entry.consumed_g_since_reference, 65.0);
        assert_eq!(entry.consumed_since_measurement(), 25.0);
        assert_eq!(ledger.derive_remaining(slot("1A"), 1000.0).unwrap(), 675.0);
    }

    #[test]
    fn test_start_new_roll_increments_once_and_resets() {
        let mut ledger = EpochLedger::new();
        let s = slot("3C");
        ledger.set_reference(s, 800.0, Utc::now()).unwrap();
        ledger.debit(s, 120.0).unwrap();
        ledger.link(s, 17).unwrap();
        ledger.set_spool_labels(s, "Matte Black", "Polymaker").unwrap();

        for expected in 1..=3 {
            let epoch = ledger.start_new_roll(s).unwrap();
            assert_eq!(epoch, expected);
            let entry = ledger.entry(s).unwrap();
            assert_eq!(entry.consumed_g_since_reference, 0.0);
            assert_eq!(entry.consumed_g_at_measurement, 0.0);
            assert!(entry.reference_weight_g.is_none());
            assert!(entry.linked_inventory_id.is_none());
            assert!(entry.spool_name.is_empty());
        }
    }

    #[test]
    fn test_debit_never_decreases() {
        let mut ledger = EpochLedger::new();
        let s = slot("2B");
        ledger.debit(s, 10.0).unwrap();
        ledger.debit(s, -4.0).unwrap();
        ledger.debit(s, f64::INFINITY).unwrap();
        ledger.debit(s, 2.5).unwrap();
        assert_eq!(ledger.entry(s).unwrap().consumed_g_since_reference, 12.5);
    }

    #[test]
    fn test_consumption_monotonic_between_roll_changes() {
        let mut ledger = EpochLedger::new();
        let s = slot("1B");
        let amounts = [3.0, -1.0, 0.0, 7.25, -100.0, 1.0];
        let mut previous = 0.0;
        for (i, g) in amounts.into_iter().enumerate() {
            ledger.debit(s, g).unwrap();
            if i == 3 {
                ledger.set_reference(s, 600.0, Utc::now()).unwrap();
            }
            let now = ledger.entry(s).unwrap().consumed_g_since_reference;
            assert!(now >= previous);
            previous = now;
        }
    }

    #[test]
    fn test_derive_remaining() {
        let mut ledger = EpochLedger::new();
        let s = slot("2B");
        assert_eq!(ledger.derive_remaining(s, 1000.0).unwrap(), 1000.0);

        ledger.set_reference(s, 1000.0, Utc::now()).unwrap();
        ledger.debit(s, 90.0).unwrap();
        ledger.debit(s, 60.0).unwrap();
        assert_eq!(ledger.entry(s).unwrap().consumed_g_since_reference, 150.0);
        assert_eq!(ledger.derive_remaining(s, 1000.0).unwrap(), 850.0);

        ledger.debit(s, 5000.0).unwrap();
        assert_eq!(ledger.derive_remaining(s, 1000.0).unwrap(), 0.0);
    }

    #[test]
    fn test_link_and_linked_slot() {
        let mut ledger = EpochLedger::new();
        ledger.link(slot("1C"), 42).unwrap();
        assert_eq!(ledger.linked_slot(42), Some(slot("1C")));
        assert_eq!(ledger.unlink(slot("1C")).unwrap(), Some(42));
        assert_eq!(ledger.linked_slot(42), None);
        assert_eq!(ledger.unlink(slot("1C")).unwrap(), None);
    }

    #[test]
    fn test_observe_physical_reports_change() {
        let mut ledger = EpochLedger::new();
        let fields = PhysicalFields {
            present: true,
            material: Some("PLA".to_string()),
            color_hex: Some("#ffffff".to_string()),
            tag_id: None,
        };
        assert!(ledger.observe_physical(slot("1A"), fields.clone()).unwrap());
        assert!(!ledger.observe_physical(slot("1A"), fields).unwrap());
    }

    #[test]
    fn test_serializes_as_slot_map() {
        let ledger = EpochLedger::new();
        let value = serde_json::to_value(&ledger).unwrap();
        let map = value.as_object().unwrap();
        assert_eq!(map.len(), 16);
        assert!(map.contains_key("2B"));

        let back: EpochLedger = serde_json::from_value(value).unwrap();
        assert_eq!(back, ledger);
    }
}
