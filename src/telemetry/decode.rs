//! Decoding of Moonraker `printer/objects/query` responses into snapshots.
//!
//! Two layouts are understood:
//! - the Creality `box` object (`T1`..`T4` with per-position arrays) plus
//!   the `filament_rack` object used to locate the active slot;
//! - plain slot objects keyed by slot id (`"2B": {"material": ..}`) at the
//!   top level of the status map, used by simpler firmware and test rigs.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde_json::{Map, Value};

use super::types::{BoxTelemetry, PrintState, PrintStatus, SlotTelemetry, TelemetrySnapshot};
use super::TelemetryError;
use crate::slot::{normalize_color, normalize_material, SlotKey, POSITIONS};

/// Decode one response body. Fails only when the document has no status map
/// or a known object has the wrong shape.
pub fn decode_frame(frame: &Value) -> Result<TelemetrySnapshot, TelemetryError> {
    let status = frame
        .get("result")
        .and_then(|r| r.get("status"))
        .and_then(Value::as_object)
        .ok_or_else(|| TelemetryError::Malformed("missing result.status object".to_string()))?;

    let mut snapshot = TelemetrySnapshot {
        received_at: Utc::now(),
        slots: BTreeMap::new(),
        boxes: BTreeMap::new(),
        active_slot: None,
        print: decode_print(status),
    };

    match status.get("box") {
        Some(Value::Object(cfs)) => decode_box(cfs, status.get("filament_rack"), &mut snapshot),
        Some(Value::Null) | None => decode_plain_slots(status, &mut snapshot),
        Some(other) => {
            return Err(TelemetryError::Malformed(format!(
                "box object has unexpected type: {}",
                type_name(other)
            )))
        }
    }

    Ok(snapshot)
}

fn decode_print(status: &Map<String, Value>) -> Option<PrintStatus> {
    let stats = status.get("print_stats")?.as_object()?;
    let sdcard = status.get("virtual_sdcard").and_then(Value::as_object);

    let filename = stats
        .get("filename")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| sdcard.and_then(|s| s.get("file_path")).and_then(Value::as_str))
        .map(basename)
        .unwrap_or_default();

    let metadata = sdcard
        .and_then(|s| s.get("cur_print_data"))
        .and_then(|d| d.get("metadata"))
        .and_then(Value::as_object);

    let planned_g = metadata.and_then(|m| {
        m.get("filament_used_g")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(as_f64).filter(|g| *g > 0.0).sum::<f64>())
            .filter(|g| *g > 0.0)
            .or_else(|| m.get("filament_weight_total").and_then(as_f64))
    });
    let planned_mm = metadata.and_then(|m| m.get("filament_total")).and_then(as_f64);

    Some(PrintStatus {
        state: PrintState::parse(stats.get("state").and_then(Value::as_str).unwrap_or("")),
        filename,
        filament_used_mm: stats
            .get("filament_used")
            .and_then(as_f64)
            .unwrap_or(0.0)
            .max(0.0),
        planned_g,
        planned_mm,
    })
}

fn decode_box(cfs: &Map<String, Value>, rack: Option<&Value>, snapshot: &mut TelemetrySnapshot) {
    // same_material rows look like [material_code, color_code, ["T2D"], "ABS"]
    let mut material_names: HashMap<String, String> = HashMap::new();
    if let Some(rows) = cfs.get("same_material").and_then(Value::as_array) {
        for row in rows.iter().filter_map(Value::as_array) {
            if let (Some(code), Some(name)) = (
                row.first().and_then(Value::as_str),
                row.get(3).and_then(Value::as_str),
            ) {
                material_names.insert(code.to_string(), normalize_material(name));
            }
        }
    }
    let material_name = |raw: &str| {
        material_names
            .get(raw)
            .cloned()
            .unwrap_or_else(|| normalize_material(raw))
    };

    for unit in 1..=4u8 {
        let Some(t) = cfs.get(&format!("T{}", unit)).and_then(Value::as_object) else {
            continue;
        };

        let state = t.get("state").and_then(Value::as_str).unwrap_or("").to_string();
        let connected = state.eq_ignore_ascii_case("connect");
        snapshot.boxes.insert(
            unit,
            BoxTelemetry {
                connected,
                state,
                temperature_c: t.get("temperature").and_then(as_f64),
                humidity_pct: t.get("dry_and_humidity").and_then(as_f64),
            },
        );

        let keys = POSITIONS.iter().filter_map(|&p| SlotKey::new(unit, p).ok());
        if !connected {
            for key in keys {
                snapshot.slots.insert(key, SlotTelemetry::default());
            }
            continue;
        }

        let colors = t.get("color_value").and_then(Value::as_array);
        let materials = t.get("material_type").and_then(Value::as_array);
        let tags = t.get("rfid").and_then(Value::as_array);
        let remain = t.get("remain_len").and_then(Value::as_array);
        if colors.is_none() || materials.is_none() {
            continue;
        }

        for (idx, key) in keys.enumerate() {
            let raw_material = materials.and_then(|m| m.get(idx)).and_then(Value::as_str);
            // "-1" marks an empty position
            if raw_material.map(str::trim) == Some("-1") {
                snapshot.slots.insert(key, SlotTelemetry::default());
                continue;
            }
            snapshot.slots.insert(
                key,
                SlotTelemetry {
                    present: true,
                    material: raw_material.map(|m| material_name(m.trim())),
                    color_hex: colors
                        .and_then(|c| c.get(idx))
                        .and_then(scalar_string)
                        .and_then(|c| normalize_color(&c)),
                    tag_id: tags.and_then(|t| t.get(idx)).and_then(tag_value),
                    percent_remaining: remain
                        .and_then(|r| r.get(idx))
                        .and_then(as_f64)
                        .filter(|p| (0.0..=100.0).contains(p)),
                },
            );
        }

        if let Some(letter) = t.get("filament").and_then(Value::as_str) {
            if let Some(c) = letter.chars().next() {
                if let Ok(key) = SlotKey::new(unit, c) {
                    snapshot.active_slot = Some(key);
                }
            }
        }
    }

    // Fall back to the rack's loaded material/colour to locate the active slot.
    if snapshot.active_slot.is_none() {
        if let Some(rack) = rack.and_then(Value::as_object) {
            let color = rack
                .get("remain_material_color")
                .and_then(scalar_string)
                .and_then(|c| normalize_color(&c));
            let material = rack
                .get("remain_material_type")
                .and_then(Value::as_str)
                .map(|m| material_name(m.trim()));
            if let (Some(color), Some(material)) = (color, material) {
                snapshot.active_slot = snapshot
                    .slots
                    .iter()
                    .find(|(_, s)| {
                        s.present
                            && s.color_hex.as_deref() == Some(color.as_str())
                            && s.material.as_deref() == Some(material.as_str())
                    })
                    .map(|(k, _)| *k);
            }
        }
    }
}

fn decode_plain_slots(status: &Map<String, Value>, snapshot: &mut TelemetrySnapshot) {
    for (name, value) in status {
        let (Ok(key), Some(obj)) = (name.parse::<SlotKey>(), value.as_object()) else {
            continue;
        };
        let present = ["present", "loaded", "has_filament", "is_loaded"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(as_bool))
            .unwrap_or(true);
        snapshot.slots.insert(
            key,
            SlotTelemetry {
                present,
                material: ["material", "type", "filament_type"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(Value::as_str))
                    .map(normalize_material),
                color_hex: ["color", "color_hex", "colour"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(scalar_string))
                    .and_then(|c| normalize_color(&c)),
                tag_id: ["tag_id", "rfid", "tag"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(tag_value)),
                percent_remaining: obj
                    .get("percent_remaining")
                    .and_then(as_f64)
                    .filter(|p| (0.0..=100.0).contains(p)),
            },
        );
        if obj.get("active").and_then(as_bool) == Some(true) {
            snapshot.active_slot = Some(key);
        }
    }
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Numbers arrive both as JSON numbers and as strings ("32", "None").
fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn tag_value(v: &Value) -> Option<String> {
    let s = scalar_string(v)?;
    let s = s.trim();
    if s.is_empty() || s == "-1" || s == "0" || s.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(s.to_string())
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
