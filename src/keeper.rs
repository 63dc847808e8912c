//! The shared state object and the command surface.
//!
//! `SpoolKeeper` owns the persisted aggregate behind one mutex. Every mutating
//! command goes through [`SpoolKeeper::transact`]: the mutation is applied to a
//! working copy, the copy is saved, and only then does it replace the live
//! state. Remote inventory calls are made after the lock is released.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::TrackingConfig;
use crate::error::KeeperError;
use crate::inventory::{rank_candidates, InventorySync, RemoteSpool, SpoolCandidate, SyncOutcome};
use crate::jobs::{
    ingest, normalize_allocation, parse_history_entry, pending_jobs, round_g, slot_history,
    split_proportionally, Allocation, AllocationOrigin, JobRecord, PendingJob, Portion,
    SlotUsageRecord,
};
use crate::ledger::PhysicalFields;
use crate::merge::{merge, MergedState};
use crate::slot::{SlotKey, FALLBACK_MATERIAL};
use crate::store::{PersistedState, StateStore};
use crate::telemetry::{SlotTelemetry, TelemetryView};

/// Usage to report to the inventory service: `(spool id, grams)`.
type UsagePush = (i64, f64);

/// Per-slot grams of the job currently printing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveEstimate {
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub slot_g: BTreeMap<SlotKey, f64>,
}

/// What a reconciliation pass did beyond refreshing last-known fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
    pub auto_allocated: Vec<String>,
    pub auto_linked: Vec<(SlotKey, i64)>,
}

pub struct SpoolKeeper {
    state: Mutex<PersistedState>,
    store: StateStore,
    tracking: TrackingConfig,
    inventory: InventorySync,
    telemetry: watch::Receiver<TelemetryView>,
}

impl SpoolKeeper {
    pub fn new(
        state: PersistedState,
        store: StateStore,
        tracking: TrackingConfig,
        inventory: InventorySync,
        telemetry: watch::Receiver<TelemetryView>,
    ) -> Self {
        Self {
            state: Mutex::new(state),
            store,
            tracking,
            inventory,
            telemetry,
        }
    }

    /// Load the snapshot from `store`, falling back to an empty state if it is unreadable.
    pub fn open(
        store: StateStore,
        tracking: TrackingConfig,
        inventory: InventorySync,
        telemetry: watch::Receiver<TelemetryView>,
    ) -> Self {
        let state = store.load_or_recover();
        Self::new(state, store, tracking, inventory, telemetry)
    }

    /// Copy of the persisted aggregate.
    pub fn persisted(&self) -> PersistedState {
        self.state.lock().clone()
    }

    pub fn state_version(&self) -> u64 {
        self.state.lock().state_version
    }

    /// A new receiver for the telemetry view.
    pub fn subscribe(&self) -> watch::Receiver<TelemetryView> {
        self.telemetry.clone()
    }

    pub fn tracking(&self) -> &TrackingConfig {
        &self.tracking
    }

    /// Apply `op` to a working copy, save it, then commit.
    ///
    /// Nothing is written when `op` leaves the state unchanged. On a save
    /// failure the live state is left exactly as it was.
    fn transact<T>(
        &self,
        op: impl FnOnce(&mut PersistedState) -> Result<T, KeeperError>,
    ) -> Result<T, KeeperError> {
        let mut guard = self.state.lock();
        let mut working = guard.clone();
        let out = op(&mut working)?;
        if working == *guard {
            return Ok(out);
        }
        working.state_version = guard.state_version + 1;
        working.updated_at = Utc::now();
        if let Err(e) = self.store.save(&working) {
            error!("Failed to save state: {:#}", e);
            return Err(KeeperError::Persistence(format!("{:#}", e)));
        }
        *guard = working;
        Ok(out)
    }

    fn view(&self) -> TelemetryView {
        self.telemetry.borrow().clone()
    }

    /// Tag id seen in a slot: live telemetry first, then the last recorded one.
    fn tag_in(&self, slot: SlotKey) -> Option<String> {
        let view = self.view();
        let live = view
            .snapshot
            .as_ref()
            .and_then(|s| s.slots.get(&slot))
            .map(|t| t.tag_id.clone());
        match live {
            Some(tag) => tag,
            None => self
                .state
                .lock()
                .slots
                .entry(slot)
                .ok()
                .and_then(|e| e.last_known.tag_id.clone()),
        }
    }

    pub fn get_merged_state(&self) -> MergedState {
        let view = self.view();
        let state = self.state.lock();
        let mut merged = merge(&state.slots, &view, self.tracking.full_roll_weight_g);
        merged.state_version = state.state_version;
        merged
    }

    /// Mark a roll change. Returns the new epoch.
    pub fn start_new_roll(&self, slot: &str) -> Result<u32, KeeperError> {
        let key: SlotKey = slot.parse()?;
        self.transact(|s| s.slots.start_new_roll(key))
    }

    /// Re-measure the roll in a slot; mirrored to the linked spool when there is one.
    pub async fn set_reference_weight(&self, slot: &str, weight_g: f64) -> Result<(), KeeperError> {
        let key: SlotKey = slot.parse()?;
        let now = Utc::now();
        let linked = self.transact(|s| {
            s.slots.set_reference(key, weight_g, now)?;
            Ok(s.slots.entry(key)?.linked_inventory_id)
        })?;
        if let Some(spool_id) = linked {
            let _ = self.inventory.push_measurement(spool_id, weight_g).await;
        }
        Ok(())
    }

    /// Link a slot to an inventory spool.
    ///
    /// The local link always succeeds first. Afterwards the slot's tag is written
    /// to the spool and the spool's labels are imported; a slot with no reference
    /// weight adopts the spool's remaining weight.
    pub async fn link(&self, slot: &str, spool_id: i64) -> Result<(), KeeperError> {
        if spool_id <= 0 {
            return Err(KeeperError::InvalidSpoolId(spool_id));
        }
        let key: SlotKey = slot.parse()?;
        let tag = self.tag_in(key);

        self.transact(|s| {
            if let Some(other) = s.slots.linked_slot(spool_id).filter(|o| *o != key) {
                s.slots.unlink(other)?;
                info!("Spool {} moved from slot {} to {}", spool_id, other, key);
            }
            s.slots.link(key, spool_id)
        })?;
        info!("Slot {} linked to spool {}", key, spool_id);

        if let Some(tag) = tag {
            let _ = self.inventory.write_tag(spool_id, &tag).await;
        }
        if let SyncOutcome::Completed(spool) = self.inventory.fetch_spool(spool_id).await {
            self.import_spool_details(key, &spool);
        }
        Ok(())
    }

    /// Copy labels (and a missing reference) from a remote spool into a slot still linked to it.
    fn import_spool_details(&self, slot: SlotKey, spool: &RemoteSpool) {
        let name = spool.display_name();
        let vendor = spool.vendor_name();
        let now = Utc::now();
        let result = self.transact(|s| {
            let entry = s.slots.entry(slot)?;
            if entry.linked_inventory_id != Some(spool.id) {
                return Ok(());
            }
            let needs_reference = entry.reference_weight_g.is_none();
            s.slots.set_spool_labels(slot, &name, &vendor)?;
            if needs_reference {
                if let Some(grams) = spool.remaining_weight {
                    s.slots.set_reference(slot, grams, now)?;
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!("Could not import spool {} details into slot {}: {}", spool.id, slot, e);
        }
    }

    /// Clear a slot's inventory link. Returns the spool that was linked.
    pub fn unlink(&self, slot: &str) -> Result<Option<i64>, KeeperError> {
        let key: SlotKey = slot.parse()?;
        let previous = self.transact(|s| s.slots.unlink(key))?;
        if let Some(id) = previous {
            info!("Slot {} unlinked from spool {}", key, id);
        }
        Ok(previous)
    }

    /// Remaining weight the inventory reports for the spool linked to a slot.
    pub async fn remote_remaining(&self, slot: &str) -> Result<SyncOutcome<f64>, KeeperError> {
        let key: SlotKey = slot.parse()?;
        let linked = self.state.lock().slots.entry(key)?.linked_inventory_id;
        match linked {
            Some(spool_id) => Ok(self.inventory.pull_remaining(spool_id).await),
            None => Ok(SyncOutcome::Unavailable),
        }
    }

    /// Attribute a job's usage to slots by hand.
    ///
    /// Re-submitting the stored amounts returns the stored allocation without
    /// debiting again; different amounts for an allocated job are rejected.
    pub async fn allocate(
        &self,
        job_key: &str,
        per_slot_grams: &BTreeMap<String, f64>,
    ) -> Result<Allocation, KeeperError> {
        let grams = normalize_allocation(job_key, per_slot_grams)?;
        let now = Utc::now();
        let (allocation, pushes) =
            self.transact(|s| record_allocation(s, job_key, grams, AllocationOrigin::Manual, now))?;
        self.push_usage(pushes).await;
        Ok(allocation)
    }

    async fn push_usage(&self, pushes: Vec<UsagePush>) {
        for (spool_id, grams) in pushes {
            let _ = self.inventory.push_usage(spool_id, grams).await;
        }
    }

    pub fn get_pending_jobs(&self) -> Vec<PendingJob> {
        let state = self.state.lock();
        pending_jobs(&state.jobs, &state.allocations)
    }

    /// Everything charged to a slot, newest first, flagged by whether it belongs to the current roll.
    pub fn get_attributed_history(&self, slot: &str) -> Result<Vec<SlotUsageRecord>, KeeperError> {
        let key: SlotKey = slot.parse()?;
        let state = self.state.lock();
        let epoch = state.slots.entry(key)?.epoch;
        Ok(slot_history(key, epoch, &state.jobs, &state.allocations))
    }

    /// Add raw history entries (newest first) to the job log. Returns the keys added.
    ///
    /// Entries that cannot be parsed are dropped. With auto attribution on,
    /// newly logged jobs matching a tracked print are allocated right away.
    pub async fn ingest_history(&self, entries: &[Value]) -> Result<Vec<String>, KeeperError> {
        let records: Vec<JobRecord> = entries
            .iter()
            .filter_map(|raw| match parse_history_entry(raw, &self.tracking) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Dropping history entry: {}", e);
                    None
                }
            })
            .collect();

        let auto = self.tracking.auto_attribute;
        let now = Utc::now();
        let (added, pushes) = self.transact(|s| {
            let added = ingest(&mut s.jobs, records);
            let (_, pushes) = if auto {
                auto_attribute(s, now)?
            } else {
                (Vec::new(), Vec::new())
            };
            Ok((added, pushes))
        })?;
        if !added.is_empty() {
            info!("Logged {} new job(s)", added.len());
        }
        self.push_usage(pushes).await;
        Ok(added)
    }

    /// Fold the latest telemetry into the ledger.
    ///
    /// Records last-known physical fields, advances the live job tracker and
    /// auto-links unlinked slots whose tag resolves to exactly one spool.
    /// Does nothing while the device is not connected.
    pub async fn reconcile_telemetry(&self) -> Result<ReconcileSummary, KeeperError> {
        let view = self.view();
        let Some(snapshot) = view.snapshot.clone().filter(|_| view.is_live()) else {
            return Ok(ReconcileSummary::default());
        };

        let auto = self.tracking.auto_attribute;
        let tracking = &self.tracking;
        let now = Utc::now();
        let (auto_allocated, pushes, unlinked_tags) = self.transact(|s| {
            for (key, slot) in &snapshot.slots {
                if s.slots.contains(*key) {
                    s.slots.observe_physical(*key, physical_fields(slot))?;
                }
            }

            let material_of = |key: SlotKey| {
                snapshot
                    .slots
                    .get(&key)
                    .and_then(|t| t.material.clone())
                    .unwrap_or_else(|| FALLBACK_MATERIAL.to_string())
            };
            s.live_job.observe(
                snapshot.print.as_ref(),
                snapshot.active_slot,
                material_of,
                tracking,
                now,
            );

            let (allocated, pushes) = if auto {
                auto_attribute(s, now)?
            } else {
                (Vec::new(), Vec::new())
            };

            let unlinked_tags: Vec<(SlotKey, String)> = s
                .slots
                .iter()
                .filter(|(_, e)| e.linked_inventory_id.is_none() && e.last_known.present)
                .filter_map(|(k, e)| e.last_known.tag_id.clone().map(|t| (*k, t)))
                .collect();
            Ok((allocated, pushes, unlinked_tags))
        })?;
        self.push_usage(pushes).await;

        let mut auto_linked = Vec::new();
        if self.inventory.is_enabled() {
            for (key, tag) in unlinked_tags {
                let spool = match self.inventory.resolve_tag(&tag).await {
                    SyncOutcome::Completed(Some(spool)) => spool,
                    SyncOutcome::Unavailable => break,
                    _ => continue,
                };
                if self.auto_link(key, &tag, &spool)? {
                    auto_linked.push((key, spool.id));
                }
            }
        }

        Ok(ReconcileSummary {
            auto_allocated,
            auto_linked,
        })
    }

    /// Link `slot` to `spool` if the slot is still unlinked, still carries `tag`,
    /// and the spool is not already in another slot.
    fn auto_link(&self, slot: SlotKey, tag: &str, spool: &RemoteSpool) -> Result<bool, KeeperError> {
        let linked = self.transact(|s| {
            if let Some(other) = s.slots.linked_slot(spool.id) {
                debug!("Spool {} already linked to slot {}, not auto-linking", spool.id, other);
                return Ok(false);
            }
            let entry = s.slots.entry(slot)?;
            if entry.linked_inventory_id.is_some() || entry.last_known.tag_id.as_deref() != Some(tag) {
                return Ok(false);
            }
            s.slots.link(slot, spool.id)?;
            Ok(true)
        })?;
        if linked {
            info!("Slot {} auto-linked to spool {} by tag {}", slot, spool.id, tag);
            self.import_spool_details(slot, spool);
        }
        Ok(linked)
    }

    /// Per-slot grams of the job being printed, if one is being tracked.
    pub fn live_estimates(&self) -> Option<LiveEstimate> {
        let state = self.state.lock();
        state.live_job.current.as_ref().map(|job| LiveEstimate {
            job_name: job.name.clone(),
            started_at: job.started_at,
            slot_g: job
                .slot_g
                .iter()
                .map(|(k, g)| (*k, round_g(*g)))
                .collect(),
        })
    }

    /// Inventory spools ranked by how well they match what is loaded in a slot.
    pub async fn spool_candidates(
        &self,
        slot: &str,
    ) -> Result<SyncOutcome<Vec<SpoolCandidate>>, KeeperError> {
        let key: SlotKey = slot.parse()?;
        let merged = self.get_merged_state();
        let (material, color) = merged
            .slots
            .iter()
            .find(|s| s.slot == key)
            .map(|s| (s.material.clone(), s.color_hex.clone()))
            .unwrap_or_default();

        let spools = match self.inventory.list_spools().await {
            SyncOutcome::Completed(spools) => spools,
            SyncOutcome::Unavailable => return Ok(SyncOutcome::Unavailable),
            SyncOutcome::Failed(msg) => return Ok(SyncOutcome::Failed(msg)),
        };

        let links: HashMap<i64, SlotKey> = self
            .state
            .lock()
            .slots
            .iter()
            .filter_map(|(k, e)| e.linked_inventory_id.map(|id| (id, *k)))
            .collect();
        Ok(SyncOutcome::Completed(rank_candidates(
            spools,
            material.as_deref(),
            color.as_deref(),
            |id| links.get(&id).copied(),
        )))
    }
}

fn physical_fields(slot: &SlotTelemetry) -> PhysicalFields {
    PhysicalFields {
        present: slot.present,
        material: slot.material.clone(),
        color_hex: slot.color_hex.clone(),
        tag_id: slot.tag_id.clone(),
    }
}

/// Store an allocation and debit the ledger, returning the usage to push.
fn record_allocation(
    state: &mut PersistedState,
    job_key: &str,
    grams: BTreeMap<SlotKey, f64>,
    origin: AllocationOrigin,
    now: DateTime<Utc>,
) -> Result<(Allocation, Vec<UsagePush>), KeeperError> {
    if let Some(existing) = state.allocations.get(job_key) {
        if existing.grams_by_slot() == grams {
            debug!("Job {} already allocated with the same amounts", job_key);
            return Ok((existing.clone(), Vec::new()));
        }
        return Err(KeeperError::AlreadyAllocated(job_key.to_string()));
    }

    let mut portions = BTreeMap::new();
    let mut pushes = Vec::new();
    for (slot, g) in grams {
        state.slots.debit(slot, g)?;
        let entry = state.slots.entry(slot)?;
        portions.insert(
            slot,
            Portion {
                grams: g,
                epoch: entry.epoch,
            },
        );
        if let Some(spool_id) = entry.linked_inventory_id {
            pushes.push((spool_id, g));
        }
    }

    let allocation = Allocation {
        job_key: job_key.to_string(),
        portions,
        origin,
        created_at: now,
    };
    info!(
        "Allocated {:.2}g of job {} across {} slot(s)",
        allocation.total_g(),
        job_key,
        allocation.portions.len()
    );
    state.allocations.append(allocation.clone());
    Ok((allocation, pushes))
}

/// Allocate unallocated jobs that match a finished tracked print, newest first.
fn auto_attribute(
    state: &mut PersistedState,
    now: DateTime<Utc>,
) -> Result<(Vec<String>, Vec<UsagePush>), KeeperError> {
    if state.live_job.finished.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    let candidates: Vec<JobRecord> = state
        .jobs
        .iter()
        .rev()
        .filter(|j| j.total_g > 0.0 && !state.allocations.contains(&j.key))
        .cloned()
        .collect();

    let mut allocated = Vec::new();
    let mut pushes = Vec::new();
    for job in candidates {
        let Some(tracked) = state.live_job.take_match(&job) else {
            continue;
        };
        let split = split_proportionally(job.total_g, tracked.shares());
        if split.is_empty() {
            debug!("Tracked print {} has no slot usage, leaving it pending", job.name);
            continue;
        }
        let (_, job_pushes) = record_allocation(state, &job.key, split, AllocationOrigin::Automatic, now)?;
        allocated.push(job.key);
        pushes.extend(job_pushes);
    }
    Ok((allocated, pushes))
}
