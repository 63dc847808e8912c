use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::slot::{normalize_color, SlotKey};

/// Result of a best-effort remote call.
///
/// Callers branch on it but never have to propagate it: local state is
/// authoritative whatever the remote side did.
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome<T> {
    Completed(T),
    /// Not configured, unreachable or timed out.
    Unavailable,
    /// The service answered with an error.
    Failed(String),
}

impl<T> SyncOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            SyncOutcome::Completed(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, SyncOutcome::Completed(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SyncOutcome<U> {
        match self {
            SyncOutcome::Completed(v) => SyncOutcome::Completed(f(v)),
            SyncOutcome::Unavailable => SyncOutcome::Unavailable,
            SyncOutcome::Failed(msg) => SyncOutcome::Failed(msg),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteVendor {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteFilament {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub material: Option<String>,
    /// Bare hex without `#`, as the service stores it.
    #[serde(default)]
    pub color_hex: Option<String>,
    #[serde(default)]
    pub vendor: Option<RemoteVendor>,
}

/// A spool record of the inventory service (Spoolman schema, unused fields ignored).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSpool {
    pub id: i64,
    #[serde(default)]
    pub filament: RemoteFilament,
    #[serde(default)]
    pub remaining_weight: Option<f64>,
    #[serde(default)]
    pub used_weight: Option<f64>,
    #[serde(default)]
    pub archived: bool,
    /// Custom fields; values are JSON-encoded strings.
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl RemoteSpool {
    /// Decoded value of the custom tag field, if set.
    pub fn tag(&self, field: &str) -> Option<String> {
        let decoded = match self.extra.get(field)? {
            Value::String(s) => serde_json::from_str::<String>(s).unwrap_or_else(|_| s.clone()),
            Value::Null => return None,
            other => other.to_string(),
        };
        let decoded = decoded.trim();
        (!decoded.is_empty()).then(|| decoded.to_string())
    }

    pub fn display_name(&self) -> String {
        self.filament
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Spool {}", self.id))
    }

    pub fn vendor_name(&self) -> String {
        self.filament
            .vendor
            .as_ref()
            .map(|v| v.name.clone())
            .unwrap_or_default()
    }

    pub fn material(&self) -> Option<String> {
        self.filament.material.clone()
    }

    pub fn color(&self) -> Option<String> {
        self.filament.color_hex.as_deref().and_then(normalize_color)
    }
}

/// A remote spool proposed for a slot, ordered by `score` (lower is better).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpoolCandidate {
    pub id: i64,
    pub name: String,
    pub vendor: String,
    pub material: Option<String>,
    pub color_hex: Option<String>,
    pub remaining_weight: Option<f64>,
    pub score: f64,
    /// Slot the spool is already linked to, if any.
    pub linked_slot: Option<SlotKey>,
}
