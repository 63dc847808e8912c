//! Upgrades of older `state.json` layouts.
//!
//! Each migration is a pure function over the raw JSON document. They run in
//! order on every load and are idempotent: a migration that finds nothing to
//! upgrade leaves the document untouched and reports no change.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{json, Map, Value};

use crate::jobs::{job_key, round_g};
use crate::slot::{normalize_color, normalize_material};

type Migration = fn(&mut Map<String, Value>) -> bool;

/// Ordered list of migrations.
pub const MIGRATIONS: &[(&str, Migration)] = &[
    ("timestamp_fields", timestamp_fields),
    ("slot_field_names", slot_field_names),
    ("slot_reference_model", slot_reference_model),
    ("job_history_log", job_history_log),
    ("allocation_markers", allocation_markers),
    ("live_job_tracker", live_job_tracker),
    ("slot_history_records", slot_history_records),
];

/// Run every migration in order. Returns the names of those that changed something.
pub fn migrate(doc: &mut Value) -> anyhow::Result<Vec<&'static str>> {
    let root = doc
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("State document is not a JSON object"))?;
    Ok(MIGRATIONS
        .iter()
        .filter_map(|(name, migration)| migration(root).then_some(*name))
        .collect())
}

/// Accepts RFC 3339, naive ISO (`2024-05-01T10:00:00`, assumed UTC) and unix seconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() || secs <= 0.0 {
                return None;
            }
            DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
                .or_else(|| s.parse::<f64>().ok().and_then(|f| parse_timestamp(&json!(f))))
        }
        _ => None,
    }
}

/// Timestamp in the exact form chrono's serde writes.
fn timestamp_value(dt: DateTime<Utc>) -> Value {
    serde_json::to_value(dt).unwrap_or(Value::Null)
}

/// Rewrite `key` in place as a canonical timestamp; drop it when unparseable.
/// Returns whether the value changed.
fn normalize_timestamp_field(obj: &mut Map<String, Value>, key: &str) -> bool {
    let Some(current) = obj.get(key) else {
        return false;
    };
    match parse_timestamp(current).map(timestamp_value) {
        Some(canonical) if &canonical == current => false,
        Some(canonical) => {
            obj.insert(key.to_string(), canonical);
            true
        }
        None => {
            obj.remove(key);
            true
        }
    }
}

fn rename(obj: &mut Map<String, Value>, from: &str, to: &str) -> bool {
    if obj.contains_key(to) {
        return obj.remove(from).is_some();
    }
    match obj.remove(from) {
        Some(value) => {
            obj.insert(to.to_string(), value);
            true
        }
        None => false,
    }
}

fn as_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|f: &f64| f.is_finite())
}

fn slot_objects(root: &mut Map<String, Value>) -> impl Iterator<Item = &mut Map<String, Value>> {
    root.get_mut("slots")
        .and_then(Value::as_object_mut)
        .into_iter()
        .flat_map(|slots| slots.values_mut())
        .filter_map(Value::as_object_mut)
}

/// `last_update` → `updated_at`; numeric or naive timestamps → RFC 3339.
fn timestamp_fields(root: &mut Map<String, Value>) -> bool {
    let mut changed = false;
    if let Some(legacy) = root.remove("last_update") {
        changed = true;
        if !root.contains_key("updated_at") && !legacy.is_null() {
            root.insert("updated_at".to_string(), legacy);
        }
    }
    changed |= normalize_timestamp_field(root, "updated_at");
    changed
}

/// Per-slot renames, placeholder materials and the physical fields block.
fn slot_field_names(root: &mut Map<String, Value>) -> bool {
    let mut changed = false;
    for slot in slot_objects(root) {
        changed |= rename(slot, "spool_epoch", "epoch");
        changed |= rename(slot, "spoolman_id", "linked_inventory_id");
        changed |= rename(slot, "vendor", "manufacturer");
        changed |= rename(slot, "name", "spool_name");
        changed |= slot.remove("slot").is_some();

        let material = slot.remove("material");
        let color = slot.remove("color_hex").or_else(|| slot.remove("color"));
        if material.is_some() || color.is_some() {
            changed = true;
            let physical = slot
                .entry("last_known")
                .or_insert_with(|| json!({"present": false}));
            if let Some(physical) = physical.as_object_mut() {
                if let Some(m) = material.as_ref().and_then(Value::as_str) {
                    physical
                        .entry("material")
                        .or_insert_with(|| Value::String(normalize_material(m)));
                }
                if let Some(c) = color.as_ref().and_then(Value::as_str).and_then(normalize_color) {
                    physical.entry("color_hex").or_insert(Value::String(c));
                }
            }
        }

        if let Some(material) = slot
            .get_mut("last_known")
            .and_then(|p| p.get_mut("material"))
        {
            if let Some(m) = material.as_str() {
                let normalized = normalize_material(m);
                if normalized != m {
                    *material = Value::String(normalized);
                    changed = true;
                }
            }
        }
    }
    changed
}

/// Legacy reference bookkeeping → `reference_weight_g`, `consumed_g_since_reference`
/// and `consumed_g_at_measurement`.
///
/// The old layout kept the roll's running consumption total and, at the last
/// measurement, the measured weight and the total at that moment. The running
/// total carries over unchanged; the total at measurement becomes the offset.
fn slot_reference_model(root: &mut Map<String, Value>) -> bool {
    const LEGACY: [&str; 6] = [
        "spool_ref_remaining_g",
        "spool_ref_consumed_g",
        "spool_ref_set_at",
        "spool_epoch_consumed_g_total",
        "spool_start_g",
        "remaining_g",
    ];
    let mut changed = false;
    for slot in slot_objects(root) {
        if !LEGACY.iter().any(|k| slot.contains_key(*k)) {
            continue;
        }
        changed = true;

        let ref_remaining = as_f64(slot.get("spool_ref_remaining_g"));
        let ref_consumed = as_f64(slot.get("spool_ref_consumed_g")).unwrap_or(0.0);
        let epoch_total = as_f64(slot.get("spool_epoch_consumed_g_total"))
            .unwrap_or(0.0)
            .max(0.0);
        let start = as_f64(slot.get("spool_start_g"));
        let remaining = as_f64(slot.get("remaining_g"));
        let set_at = slot.get("spool_ref_set_at").and_then(parse_timestamp);

        let (reference, offset) = match (ref_remaining, start, remaining) {
            (Some(r), _, _) => (Some(r), ref_consumed.clamp(0.0, epoch_total)),
            (None, Some(s), _) => (Some(s), 0.0),
            // a bare remaining weight was measured after everything consumed so far
            (None, None, Some(r)) => (Some(r), epoch_total),
            (None, None, None) => (None, 0.0),
        };

        if !slot.contains_key("reference_weight_g") {
            if let Some(r) = reference.filter(|r| *r >= 0.0) {
                slot.insert("reference_weight_g".to_string(), json!(r));
                if let Some(at) = set_at {
                    slot.insert("reference_set_at".to_string(), timestamp_value(at));
                }
            }
        }
        if !slot.contains_key("consumed_g_since_reference") {
            slot.insert(
                "consumed_g_since_reference".to_string(),
                json!(round_g(epoch_total)),
            );
            slot.insert(
                "consumed_g_at_measurement".to_string(),
                json!(round_g(offset)),
            );
        }
        for key in LEGACY {
            slot.remove(key);
        }
    }
    changed
}

/// `moonraker_history` (newest first, flat entries) → `jobs` (oldest first).
fn job_history_log(root: &mut Map<String, Value>) -> bool {
    let Some(legacy) = root.remove("moonraker_history") else {
        return false;
    };
    let mut jobs: Vec<Value> = legacy
        .as_array()
        .map(|entries| entries.iter().rev().filter_map(legacy_job).collect())
        .unwrap_or_default();
    if let Some(Value::Array(existing)) = root.remove("jobs") {
        jobs.extend(existing);
    }
    root.insert("jobs".to_string(), Value::Array(jobs));
    true
}

fn legacy_job(entry: &Value) -> Option<Value> {
    let obj = entry.as_object()?;
    let status = obj.get("status").and_then(Value::as_str).unwrap_or("");
    if status.eq_ignore_ascii_case("in_progress") {
        return None;
    }
    let job_id = obj.get("job_id").and_then(Value::as_str).unwrap_or("").trim().to_string();
    let name = obj.get("job").and_then(Value::as_str).unwrap_or("").trim().to_string();
    if job_id.is_empty() && name.is_empty() {
        return None;
    }
    let end_ts = as_f64(obj.get("ts_end"));
    let colors: Vec<Option<String>> = match obj.get("colors") {
        Some(Value::Array(list)) => list.iter().map(|c| c.as_str().and_then(normalize_color)).collect(),
        Some(Value::String(s)) => s.split(';').map(normalize_color).collect(),
        _ => Vec::new(),
    };
    let parts: Vec<Value> = obj
        .get("filament_used_g")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .enumerate()
                .filter_map(|(index, g)| {
                    let grams = as_f64(Some(g)).filter(|g| *g > 0.0)?;
                    Some(json!({
                        "index": index,
                        "grams": round_g(grams),
                        "color_hex": colors.get(index).cloned().flatten(),
                    }))
                })
                .collect()
        })
        .unwrap_or_default();

    Some(json!({
        "key": job_key(&job_id, &name, end_ts),
        "job_id": job_id,
        "name": name,
        "status": status.to_lowercase(),
        "material": obj.get("filament_type").and_then(Value::as_str).map(normalize_material),
        "started_at": obj.get("ts_start").and_then(parse_timestamp).map(timestamp_value),
        "ended_at": end_ts.and_then(|t| parse_timestamp(&json!(t))).map(timestamp_value),
        "total_g": as_f64(obj.get("filament_used_g_total")).unwrap_or(0.0),
        "total_mm": as_f64(obj.get("filament_used_mm")).unwrap_or(0.0),
        "parts": parts,
    }))
}

/// Current epoch of every slot, keyed by upper-case slot key.
fn slot_epochs(root: &Map<String, Value>) -> Map<String, Value> {
    root.get("slots")
        .and_then(Value::as_object)
        .map(|slots| {
            slots
                .iter()
                .map(|(k, v)| (k.to_uppercase(), v.get("epoch").cloned().unwrap_or(json!(0))))
                .collect()
        })
        .unwrap_or_default()
}

/// `moonraker_allocations` map → ordered `allocations` log.
///
/// Old markers carry no epoch; portions are tagged with the slot's epoch at upgrade time.
fn allocation_markers(root: &mut Map<String, Value>) -> bool {
    let Some(legacy) = root.remove("moonraker_allocations") else {
        return false;
    };
    let epochs = slot_epochs(root);

    let mut markers: Vec<(f64, Value)> = legacy
        .as_object()
        .into_iter()
        .flat_map(|m| m.iter())
        .map(|(key, marker)| {
            let ts = as_f64(marker.get("ts")).unwrap_or(0.0);
            let portions: Map<String, Value> = marker
                .get("alloc_g")
                .and_then(Value::as_object)
                .map(|alloc| {
                    alloc
                        .iter()
                        .filter_map(|(slot, g)| {
                            let grams = as_f64(Some(g)).filter(|g| *g > 0.0)?;
                            let slot = slot.trim().to_uppercase();
                            let epoch = epochs.get(&slot).cloned().unwrap_or(json!(0));
                            Some((slot, json!({"grams": round_g(grams), "epoch": epoch})))
                        })
                        .collect()
                })
                .unwrap_or_default();
            let created_at = parse_timestamp(&json!(ts))
                .unwrap_or(DateTime::<Utc>::default());
            (
                ts,
                json!({
                    "job_key": key,
                    "portions": portions,
                    "origin": "imported",
                    "created_at": timestamp_value(created_at),
                }),
            )
        })
        .collect();
    markers.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut allocations: Vec<Value> = markers.into_iter().map(|(_, v)| v).collect();
    if let Some(Value::Array(existing)) = root.remove("allocations") {
        allocations.extend(existing);
    }
    root.insert("allocations".to_string(), Value::Array(allocations));
    true
}

/// Flat `job_track_*` fields → `live_job.current`.
fn live_job_tracker(root: &mut Map<String, Value>) -> bool {
    const LEGACY: [&str; 6] = [
        "job_track_name",
        "job_track_started_at",
        "job_track_last_mm",
        "job_track_slot_mm",
        "job_track_slot_g",
        "job_track_last_state",
    ];
    if !LEGACY.iter().any(|k| root.contains_key(*k)) {
        return false;
    }
    let name = root
        .get("job_track_name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();

    if !name.is_empty() && !root.contains_key("live_job") {
        let started_at = root
            .get("job_track_started_at")
            .and_then(parse_timestamp)
            .unwrap_or(DateTime::<Utc>::default());
        let per_slot = |key: &str| -> Map<String, Value> {
            root.get(key)
                .and_then(Value::as_object)
                .map(|m| {
                    m.iter()
                        .filter_map(|(slot, v)| {
                            as_f64(Some(v)).map(|f| (slot.trim().to_uppercase(), json!(f)))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let current = json!({
            "name": name,
            "started_at": timestamp_value(started_at),
            "last_mm": as_f64(root.get("job_track_last_mm")).unwrap_or(0.0),
            "slot_mm": per_slot("job_track_slot_mm"),
            "slot_g": per_slot("job_track_slot_g"),
        });
        root.insert("live_job".to_string(), json!({"current": current, "finished": []}));
    }
    for key in LEGACY {
        root.remove(key);
    }
    true
}

/// Per-slot `slot_history` usage records → imported allocations.
///
/// Records of one print on several slots share a key and become one allocation.
/// Keys already in the allocation log are left alone so a print is never counted twice.
fn slot_history_records(root: &mut Map<String, Value>) -> bool {
    let Some(legacy) = root.remove("slot_history") else {
        return false;
    };
    let epochs = slot_epochs(root);
    let mut allocations = match root.remove("allocations") {
        Some(Value::Array(existing)) => existing,
        _ => Vec::new(),
    };
    let known: Vec<String> = allocations
        .iter()
        .filter_map(|a| a.get("job_key").and_then(Value::as_str).map(str::to_string))
        .collect();

    let mut imported: Vec<(f64, String, Map<String, Value>)> = Vec::new();
    let per_slot = legacy.as_object().into_iter().flat_map(|m| m.iter());
    for (slot, records) in per_slot {
        let slot = slot.trim().to_uppercase();
        let epoch = epochs.get(&slot).cloned().unwrap_or(json!(0));
        for record in records.as_array().into_iter().flatten() {
            let name = record.get("job").and_then(Value::as_str).unwrap_or("").trim();
            let ts = as_f64(record.get("ts")).filter(|t| *t > 0.0);
            let grams = as_f64(record.get("used_g")).filter(|g| *g > 0.0);
            let (Some(ts), Some(grams)) = (ts, grams) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let key = job_key("", name, Some(ts));
            if known.contains(&key) {
                continue;
            }
            let portion = json!({"grams": round_g(grams), "epoch": epoch.clone()});
            match imported.iter_mut().find(|(_, k, _)| *k == key) {
                Some((_, _, portions)) => {
                    portions.entry(slot.clone()).or_insert(portion);
                }
                None => {
                    let mut portions = Map::new();
                    portions.insert(slot.clone(), portion);
                    imported.push((ts, key, portions));
                }
            }
        }
    }
    imported.sort_by(|a, b| a.0.total_cmp(&b.0));

    allocations.extend(imported.into_iter().map(|(ts, key, portions)| {
        let created_at = parse_timestamp(&json!(ts)).unwrap_or(DateTime::<Utc>::default());
        json!({
            "job_key": key,
            "portions": portions,
            "origin": "imported",
            "created_at": timestamp_value(created_at),
        })
    }));
    root.insert("allocations".to_string(), Value::Array(allocations));
    true
}
