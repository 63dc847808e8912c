use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;

use spoolkeeper::config::default_config;
use spoolkeeper::inventory::{InventoryError, InventoryService, InventorySync, RemoteSpool};
use spoolkeeper::jobs::AllocationOrigin;
use spoolkeeper::store::{PersistedState, StateStore};
use spoolkeeper::telemetry::{
    LinkState, PrintState, PrintStatus, SlotTelemetry, TelemetrySnapshot, TelemetryView,
};
use spoolkeeper::{KeeperError, SlotKey, SpoolKeeper};
use tempfile::TempDir;

/// In-memory inventory service recording what it was asked to do.
#[derive(Default)]
struct FakeInventory {
    spools: Vec<RemoteSpool>,
    unreachable: bool,
    used: Mutex<Vec<(i64, f64)>>,
    measured: Mutex<Vec<(i64, f64)>>,
    extras: Mutex<Vec<(i64, String, String)>>,
}

impl FakeInventory {
    fn check(&self) -> Result<(), InventoryError> {
        if self.unreachable {
            return Err(InventoryError::Unreachable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl InventoryService for FakeInventory {
    async fn list_spools(&self) -> Result<Vec<RemoteSpool>, InventoryError> {
        self.check()?;
        Ok(self.spools.clone())
    }

    async fn get_spool(&self, id: i64) -> Result<RemoteSpool, InventoryError> {
        self.check()?;
        self.spools
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(InventoryError::Status {
                status: 404,
                body: "not found".to_string(),
            })
    }

    async fn use_weight(&self, id: i64, grams: f64) -> Result<(), InventoryError> {
        self.check()?;
        self.used.lock().push((id, grams));
        Ok(())
    }

    async fn set_remaining(&self, id: i64, grams: f64) -> Result<(), InventoryError> {
        self.check()?;
        self.measured.lock().push((id, grams));
        Ok(())
    }

    async fn set_extra(&self, id: i64, field: &str, value: &str) -> Result<(), InventoryError> {
        self.check()?;
        self.extras.lock().push((id, field.to_string(), value.to_string()));
        Ok(())
    }
}

struct Harness {
    keeper: SpoolKeeper,
    telemetry: watch::Sender<TelemetryView>,
    dir: TempDir,
}

impl Harness {
    fn new(inventory: Option<Arc<FakeInventory>>, auto_attribute: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let config = default_config();
        let mut tracking = config.tracking.clone();
        tracking.auto_attribute = auto_attribute;
        let mut inventory_config = config.inventory.clone();
        inventory_config.timeout_ms = 500;
        let service = inventory.map(|s| s as Arc<dyn InventoryService>);

        let (telemetry, rx) = watch::channel(TelemetryView::default());
        let keeper = SpoolKeeper::new(
            PersistedState::default(),
            StateStore::new(dir.path().join("state.json")),
            tracking,
            InventorySync::new(service, &inventory_config),
            rx,
        );
        Self {
            keeper,
            telemetry,
            dir,
        }
    }

    fn state_path(&self) -> std::path::PathBuf {
        self.dir.path().join("state.json")
    }

    fn consumed(&self, s: &str) -> f64 {
        self.keeper
            .persisted()
            .slots
            .entry(slot(s))
            .unwrap()
            .consumed_g_since_reference
    }

    fn publish(&self, slots: &[(&str, SlotTelemetry)], active: Option<&str>, print: Option<PrintStatus>) {
        let snapshot = TelemetrySnapshot {
            received_at: Utc::now(),
            slots: slots.iter().map(|(k, t)| (slot(k), t.clone())).collect(),
            boxes: BTreeMap::new(),
            active_slot: active.map(slot),
            print,
        };
        self.telemetry.send_modify(|v| {
            v.link = LinkState::Connected;
            v.snapshot = Some(Arc::new(snapshot));
            v.sequence += 1;
        });
    }
}

fn slot(s: &str) -> SlotKey {
    s.parse().unwrap()
}

fn grams(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
    entries.iter().map(|(k, g)| (k.to_string(), *g)).collect()
}

fn loaded(material: &str, tag: Option<&str>) -> SlotTelemetry {
    SlotTelemetry {
        present: true,
        material: Some(material.to_string()),
        color_hex: Some("#ffffff".to_string()),
        tag_id: tag.map(str::to_string),
        percent_remaining: None,
    }
}

fn remote_spool(id: i64, tag: Option<&str>, remaining: f64) -> RemoteSpool {
    let mut value = json!({
        "id": id,
        "filament": {
            "name": "Basic White",
            "material": "PLA",
            "color_hex": "FFFFFF",
            "vendor": {"name": "Bambu"}
        },
        "remaining_weight": remaining
    });
    if let Some(tag) = tag {
        value["extra"] = json!({"rfid_tag": format!("\"{}\"", tag)});
    }
    serde_json::from_value(value).unwrap()
}

fn history_entry(job_id: &str, filename: &str, end_time: f64, used_g: Value) -> Value {
    json!({
        "job_id": job_id,
        "filename": filename,
        "status": "completed",
        "start_time": end_time - 3600.0,
        "end_time": end_time,
        "filament_used": 6900.0,
        "metadata": {
            "filament_used_g": used_g,
            "filament_type": "PLA",
            "filament_colors": ["#FF0000", "#00FF00", "#0000FF"]
        }
    })
}

#[test]
fn test_start_new_roll_increments_epoch_once() {
    let h = Harness::new(None, false);
    for expected in 1..=3 {
        assert_eq!(h.keeper.start_new_roll("3C").unwrap(), expected);
        let state = h.keeper.persisted();
        let entry = state.slots.entry(slot("3C")).unwrap();
        assert_eq!(entry.epoch, expected);
        assert_eq!(entry.consumed_g_since_reference, 0.0);
    }
    assert_eq!(h.keeper.state_version(), 3);

    // every mutation is already on disk
    let on_disk = StateStore::new(h.state_path()).load().unwrap();
    assert_eq!(on_disk, h.keeper.persisted());
}

#[test]
fn test_unknown_slot_is_rejected() {
    let h = Harness::new(None, false);
    let err = h.keeper.start_new_roll("5A").unwrap_err();
    assert_eq!(err.kind(), "unknown_slot");
    assert_eq!(h.keeper.state_version(), 0);
}

#[tokio::test]
async fn test_roll_change_resets_consumption_and_keeps_history() {
    let h = Harness::new(None, false);
    h.keeper.allocate("a:1", &grams(&[("1A", 10.0)])).await.unwrap();
    h.keeper.allocate("a:2", &grams(&[("1A", 5.0)])).await.unwrap();
    assert_eq!(h.consumed("1A"), 15.0);

    h.keeper.start_new_roll("1A").unwrap();
    assert_eq!(h.consumed("1A"), 0.0);
    h.keeper.allocate("a:3", &grams(&[("1A", 2.0)])).await.unwrap();

    let history = h.keeper.get_attributed_history("1A").unwrap();
    let rows: Vec<(&str, u32, bool)> = history
        .iter()
        .map(|r| (r.job_key.as_str(), r.epoch, r.current_roll))
        .collect();
    assert_eq!(
        rows,
        vec![("a:3", 1, true), ("a:2", 0, false), ("a:1", 0, false)]
    );
}

#[tokio::test]
async fn test_consumption_never_decreases_between_roll_changes() {
    let h = Harness::new(None, false);
    let mut previous = 0.0;
    let requests = [
        ("j:1", vec![("2A", 4.0)]),
        ("j:2", vec![("2A", -3.0)]),
        ("j:3", vec![("2A", 0.0)]),
        ("j:4", vec![("2A", 7.5), ("2B", 1.0)]),
        ("j:5", vec![("2A", f64::NAN)]),
    ];
    for (i, (key, request)) in requests.into_iter().enumerate() {
        let _ = h.keeper.allocate(key, &grams(&request)).await;
        if i == 1 {
            // a re-measurement moves the baseline, not the roll's consumption
            h.keeper.set_reference_weight("2A", 900.0).await.unwrap();
        }
        let now = h.consumed("2A");
        assert!(now >= previous, "consumption went from {} to {}", previous, now);
        previous = now;
    }
    assert_eq!(previous, 11.5);
    let state = h.keeper.persisted();
    assert_eq!(state.slots.entry(slot("2A")).unwrap().consumed_since_measurement(), 7.5);
    assert_eq!(state.slots.derive_remaining(slot("2A"), 1000.0).unwrap(), 892.5);
}

#[tokio::test]
async fn test_allocation_validation() {
    let h = Harness::new(None, false);
    let err = h.keeper.allocate("j:1", &grams(&[("9Z", 1.0)])).await.unwrap_err();
    assert!(matches!(err, KeeperError::UnknownSlot(_)));
    let err = h.keeper.allocate("j:1", &grams(&[("1A", -1.0)])).await.unwrap_err();
    assert!(matches!(err, KeeperError::InvalidWeight { .. }));
    let err = h.keeper.allocate("j:1", &grams(&[("1A", 0.0)])).await.unwrap_err();
    assert!(matches!(err, KeeperError::EmptyAllocation(_)));
    assert_eq!(h.keeper.state_version(), 0);
}

#[tokio::test]
async fn test_duplicate_allocation_is_rejected() {
    let h = Harness::new(None, false);
    let first = h
        .keeper
        .allocate("job:100", &grams(&[("2B", 10.0), ("1A", 0.0)]))
        .await
        .unwrap();
    let version = h.keeper.state_version();

    // identical resubmission is a no-op
    let again = h.keeper.allocate("job:100", &grams(&[("2B", 10.0)])).await.unwrap();
    assert_eq!(again, first);
    assert_eq!(h.keeper.state_version(), version);
    assert_eq!(h.consumed("2B"), 10.0);

    // different amounts are refused and nothing is debited
    let err = h
        .keeper
        .allocate("job:100", &grams(&[("2B", 25.0)]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "already_allocated");
    assert_eq!(h.consumed("2B"), 10.0);
    assert_eq!(h.keeper.persisted().allocations.len(), 1);
}

#[tokio::test]
async fn test_zero_part_never_becomes_a_target() {
    let h = Harness::new(None, false);
    let entry = history_entry("000123", "gcodes/cube.gcode", 1700003600.0, json!([12.5, 0, 8.0]));
    let added = h.keeper.ingest_history(&[entry.clone()]).await.unwrap();
    assert_eq!(added, vec!["000123:1700003600".to_string()]);

    let pending = h.keeper.get_pending_jobs();
    assert_eq!(pending.len(), 1);
    let targets: Vec<(Option<usize>, f64)> =
        pending[0].targets.iter().map(|t| (t.part, t.grams)).collect();
    assert_eq!(targets, vec![(Some(0), 12.5), (Some(2), 8.0)]);

    // the same entry in a later poll is not logged twice
    let added = h.keeper.ingest_history(&[entry]).await.unwrap();
    assert!(added.is_empty());
    assert_eq!(h.keeper.persisted().jobs.len(), 1);

    h.keeper
        .allocate("000123:1700003600", &grams(&[("1A", 12.5), ("1B", 8.0)]))
        .await
        .unwrap();
    assert!(h.keeper.get_pending_jobs().is_empty());
}

#[tokio::test]
async fn test_ingest_drops_unparseable_entries() {
    let h = Harness::new(None, false);
    let entries = vec![
        json!("not an object"),
        json!({"status": "completed"}),
        json!({"job_id": "7", "filename": "a.gcode", "status": "in_progress"}),
        history_entry("8", "b.gcode", 1700000000.0, json!([3.0])),
    ];
    let added = h.keeper.ingest_history(&entries).await.unwrap();
    assert_eq!(added, vec!["8:1700000000".to_string()]);
}

#[tokio::test]
async fn test_local_commands_succeed_when_inventory_unreachable() {
    let inventory = Arc::new(FakeInventory {
        unreachable: true,
        ..Default::default()
    });
    let h = Harness::new(Some(inventory), false);

    h.keeper.link("1A", 5).await.unwrap();
    assert_eq!(
        h.keeper.persisted().slots.entry(slot("1A")).unwrap().linked_inventory_id,
        Some(5)
    );

    let alloc = h.keeper.allocate("j:1", &grams(&[("1A", 12.0)])).await.unwrap();
    assert_eq!(alloc.total_g(), 12.0);
    assert_eq!(h.consumed("1A"), 12.0);

    assert_eq!(h.keeper.unlink("1A").unwrap(), Some(5));
    assert!(h
        .keeper
        .persisted()
        .slots
        .entry(slot("1A"))
        .unwrap()
        .linked_inventory_id
        .is_none());
}

#[tokio::test]
async fn test_two_allocations_on_measured_roll() {
    let h = Harness::new(None, false);
    h.keeper.set_reference_weight("2B", 1000.0).await.unwrap();
    h.keeper.allocate("j:1", &grams(&[("2B", 90.0)])).await.unwrap();
    h.keeper.allocate("j:2", &grams(&[("2B", 60.0)])).await.unwrap();

    assert_eq!(h.consumed("2B"), 150.0);
    let state = h.keeper.persisted();
    assert_eq!(state.slots.derive_remaining(slot("2B"), 1000.0).unwrap(), 850.0);

    let merged = h.keeper.get_merged_state();
    let b = merged.slots.iter().find(|s| s.slot == slot("2B")).unwrap();
    assert_eq!(b.remaining_g, 850.0);
    assert_eq!(merged.state_version, h.keeper.state_version());
}

#[tokio::test]
async fn test_linked_slot_pushes_usage_and_measurements() {
    let inventory = Arc::new(FakeInventory {
        spools: vec![remote_spool(9, None, 640.0)],
        ..Default::default()
    });
    let h = Harness::new(Some(inventory.clone()), false);

    h.keeper.set_reference_weight("1C", 700.0).await.unwrap();
    h.keeper.link("1C", 9).await.unwrap();
    h.keeper.allocate("j:1", &grams(&[("1C", 15.0), ("1D", 3.0)])).await.unwrap();
    h.keeper.set_reference_weight("1C", 680.0).await.unwrap();

    assert_eq!(inventory.used.lock().as_slice(), &[(9, 15.0)]);
    assert_eq!(inventory.measured.lock().as_slice(), &[(9, 680.0)]);

    // an existing reference is not replaced by the remote weight
    let entry = h.keeper.persisted().slots.entry(slot("1C")).unwrap().clone();
    assert_eq!(entry.reference_weight_g, Some(680.0));
    assert_eq!(entry.spool_name, "Basic White");
    assert_eq!(entry.manufacturer, "Bambu");
}

#[tokio::test]
async fn test_link_writes_tag_and_adopts_remote_weight() {
    let inventory = Arc::new(FakeInventory {
        spools: vec![remote_spool(11, None, 512.0)],
        ..Default::default()
    });
    let h = Harness::new(Some(inventory.clone()), false);
    h.publish(&[("2D", loaded("PLA", Some("TAG-7")))], None, None);

    h.keeper.link("2D", 11).await.unwrap();

    assert_eq!(
        inventory.extras.lock().as_slice(),
        &[(11, "rfid_tag".to_string(), "TAG-7".to_string())]
    );
    let entry = h.keeper.persisted().slots.entry(slot("2D")).unwrap().clone();
    assert_eq!(entry.linked_inventory_id, Some(11));
    assert_eq!(entry.reference_weight_g, Some(512.0));
}

#[tokio::test]
async fn test_link_rejects_invalid_spool_id() {
    let h = Harness::new(None, false);
    let err = h.keeper.link("1A", 0).await.unwrap_err();
    assert!(matches!(err, KeeperError::InvalidSpoolId(0)));
}

#[tokio::test]
async fn test_linking_a_spool_elsewhere_moves_it() {
    let h = Harness::new(None, false);
    h.keeper.link("1A", 3).await.unwrap();
    h.keeper.link("4B", 3).await.unwrap();
    let state = h.keeper.persisted();
    assert!(state.slots.entry(slot("1A")).unwrap().linked_inventory_id.is_none());
    assert_eq!(state.slots.linked_slot(3), Some(slot("4B")));
}

#[tokio::test]
async fn test_tag_auto_links_on_reconcile() {
    let inventory = Arc::new(FakeInventory {
        spools: vec![remote_spool(42, Some("TAG-42"), 730.0), remote_spool(43, Some("OTHER"), 100.0)],
        ..Default::default()
    });
    let h = Harness::new(Some(inventory), false);
    h.publish(&[("1A", loaded("PLA", Some("TAG-42")))], None, None);

    let summary = h.keeper.reconcile_telemetry().await.unwrap();
    assert_eq!(summary.auto_linked, vec![(slot("1A"), 42)]);

    let state = h.keeper.persisted();
    let entry = state.slots.entry(slot("1A")).unwrap();
    assert_eq!(entry.linked_inventory_id, Some(42));
    assert_eq!(entry.last_known.tag_id.as_deref(), Some("TAG-42"));
    assert_eq!(entry.reference_weight_g, Some(730.0));

    // already linked: a second pass changes nothing
    let summary = h.keeper.reconcile_telemetry().await.unwrap();
    assert!(summary.auto_linked.is_empty());
}

#[tokio::test]
async fn test_reconcile_waits_for_live_telemetry() {
    let h = Harness::new(None, false);
    let summary = h.keeper.reconcile_telemetry().await.unwrap();
    assert_eq!(summary, Default::default());
    assert_eq!(h.keeper.state_version(), 0);

    h.publish(&[("3A", loaded("PETG", None))], None, None);
    h.keeper.reconcile_telemetry().await.unwrap();
    h.telemetry.send_modify(|v| v.link = LinkState::Disconnected);

    let merged = h.keeper.get_merged_state();
    assert!(merged.stale);
    let a = merged.slots.iter().find(|s| s.slot == slot("3A")).unwrap();
    assert_eq!(a.material.as_deref(), Some("PETG"));
}

#[tokio::test]
async fn test_tracked_print_is_attributed_automatically() {
    let h = Harness::new(None, true);
    let slots = [("1A", loaded("PLA", None)), ("2B", loaded("PLA", None))];
    let printing = |used: f64| PrintStatus {
        state: PrintState::Printing,
        filename: "cube.gcode".to_string(),
        filament_used_mm: used,
        planned_g: None,
        planned_mm: None,
    };

    h.publish(&slots, Some("1A"), Some(printing(0.0)));
    h.keeper.reconcile_telemetry().await.unwrap();
    h.publish(&slots, Some("1A"), Some(printing(1000.0)));
    h.keeper.reconcile_telemetry().await.unwrap();
    h.publish(&slots, Some("2B"), Some(printing(1500.0)));
    h.keeper.reconcile_telemetry().await.unwrap();

    let live = h.keeper.live_estimates().unwrap();
    assert_eq!(live.job_name, "cube.gcode");
    assert_eq!(live.slot_g.len(), 2);
    assert!(live.slot_g[&slot("1A")] > live.slot_g[&slot("2B")]);

    let mut done = printing(1500.0);
    done.state = PrintState::Complete;
    h.publish(&slots, Some("2B"), Some(done));
    h.keeper.reconcile_telemetry().await.unwrap();
    assert!(h.keeper.live_estimates().is_none());

    let end = Utc::now().timestamp() as f64;
    let entry = history_entry("77", "cube.gcode", end, json!([30.0]));
    h.keeper.ingest_history(&[entry]).await.unwrap();

    let key = format!("77:{:.0}", end);
    let state = h.keeper.persisted();
    let alloc = state.allocations.get(&key).unwrap();
    assert_eq!(alloc.origin, AllocationOrigin::Automatic);
    assert_eq!(alloc.portions[&slot("1A")].grams, 20.0);
    assert_eq!(alloc.portions[&slot("2B")].grams, 10.0);
    assert_eq!(h.consumed("1A"), 20.0);
    assert!(h.keeper.get_pending_jobs().is_empty());
}

#[tokio::test]
async fn test_untracked_job_stays_pending() {
    let h = Harness::new(None, true);
    let entry = history_entry("5", "manual.gcode", 1700000000.0, json!([4.0]));
    h.keeper.ingest_history(&[entry]).await.unwrap();
    assert_eq!(h.keeper.get_pending_jobs().len(), 1);
    assert!(h.keeper.persisted().allocations.is_empty());
}

#[tokio::test]
async fn test_spool_candidates_rank_matching_material_first() {
    let mut petg = remote_spool(2, None, 300.0);
    petg.filament.material = Some("PETG".to_string());
    let inventory = Arc::new(FakeInventory {
        spools: vec![petg, remote_spool(1, None, 900.0)],
        ..Default::default()
    });
    let h = Harness::new(Some(inventory), false);
    h.publish(&[("1B", loaded("PLA", None))], None, None);
    h.keeper.link("3D", 1).await.unwrap();

    let ranked = h.keeper.spool_candidates("1B").await.unwrap().ok().unwrap();
    let ids: Vec<i64> = ranked.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(ranked[0].linked_slot, Some(slot("3D")));
}

#[tokio::test]
async fn test_persistence_failure_leaves_state_unchanged() {
    let h = Harness::new(None, false);
    h.keeper.allocate("j:1", &grams(&[("1A", 5.0)])).await.unwrap();
    let before = h.keeper.persisted();
    let file_before = std::fs::read_to_string(h.state_path()).unwrap();

    // a non-empty directory where the snapshot should go makes the rename fail
    let moved = h.dir.path().join("state.saved");
    std::fs::rename(h.state_path(), &moved).unwrap();
    std::fs::create_dir(h.state_path()).unwrap();
    std::fs::write(h.state_path().join("block"), "x").unwrap();

    let err = h.keeper.start_new_roll("1A").unwrap_err();
    assert_eq!(err.kind(), "persistence");
    let err = h.keeper.allocate("j:2", &grams(&[("1A", 3.0)])).await.unwrap_err();
    assert!(matches!(err, KeeperError::Persistence(_)));

    assert_eq!(h.keeper.persisted(), before);
    assert_eq!(std::fs::read_to_string(&moved).unwrap(), file_before);
}
