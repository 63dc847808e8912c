use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::client::{InventoryError, InventoryService, SpoolmanClient};
use super::types::{RemoteSpool, SpoolCandidate, SyncOutcome};
use crate::config::InventoryConfig;
use crate::slot::{color_distance, normalize_material, SlotKey};

/// Score bonus for a candidate of the slot's material.
const SAME_MATERIAL_BONUS: f64 = -1000.0;
/// Colour distance assumed when either colour is unknown.
const UNKNOWN_COLOR_DISTANCE: f64 = 500.0;

/// Best-effort, time-bounded access to the inventory service.
///
/// Every call returns a [`SyncOutcome`]; nothing here fails a local mutation.
/// With no service configured every call is `Unavailable`.
pub struct InventorySync {
    service: Option<Arc<dyn InventoryService>>,
    timeout: Duration,
    cache_ttl: Duration,
    tag_field: String,
    remaining: Mutex<HashMap<i64, (f64, Instant)>>,
    tag_misses: Mutex<HashMap<String, Instant>>,
}

impl InventorySync {
    pub fn new(service: Option<Arc<dyn InventoryService>>, config: &InventoryConfig) -> Self {
        Self {
            service,
            timeout: config.timeout(),
            cache_ttl: config.cache_ttl(),
            tag_field: config.tag_field.trim().to_string(),
            remaining: Mutex::new(HashMap::new()),
            tag_misses: Mutex::new(HashMap::new()),
        }
    }

    /// Spoolman client from config; local-only when no URL is set or it is invalid.
    pub fn from_config(config: &InventoryConfig) -> Self {
        if !config.enabled() {
            info!("No inventory service configured, tracking locally only");
            return Self::new(None, config);
        }
        match SpoolmanClient::new(&config.url, config.timeout()) {
            Ok(client) => {
                info!("Inventory service at {}", config.url.trim());
                Self::new(Some(Arc::new(client)), config)
            }
            Err(e) => {
                warn!("Inventory service disabled: {}", e);
                Self::new(None, config)
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.service.is_some()
    }

    pub fn tag_field(&self) -> &str {
        &self.tag_field
    }

    async fn call<T, F>(&self, what: &str, fut: F) -> SyncOutcome<T>
    where
        F: Future<Output = Result<T, InventoryError>>,
    {
        match timeout(self.timeout, fut).await {
            Err(_) => {
                warn!("Inventory {} timed out after {:?}", what, self.timeout);
                SyncOutcome::Unavailable
            }
            Ok(Err(e)) if e.is_unreachable() => {
                warn!("Inventory {} unavailable: {}", what, e);
                SyncOutcome::Unavailable
            }
            Ok(Err(e)) => {
                warn!("Inventory {} failed: {}", what, e);
                SyncOutcome::Failed(e.to_string())
            }
            Ok(Ok(v)) => SyncOutcome::Completed(v),
        }
    }

    /// Remaining grams of a spool, from the cache while fresh.
    pub async fn pull_remaining(&self, spool_id: i64) -> SyncOutcome<f64> {
        if let Some((grams, at)) = self.remaining.lock().get(&spool_id).copied() {
            if at.elapsed() < self.cache_ttl {
                return SyncOutcome::Completed(grams);
            }
        }
        match self.fetch_spool(spool_id).await {
            SyncOutcome::Completed(spool) => match spool.remaining_weight {
                Some(grams) => SyncOutcome::Completed(grams),
                None => SyncOutcome::Failed(format!("spool {} has no remaining weight", spool_id)),
            },
            SyncOutcome::Unavailable => SyncOutcome::Unavailable,
            SyncOutcome::Failed(msg) => SyncOutcome::Failed(msg),
        }
    }

    pub async fn fetch_spool(&self, spool_id: i64) -> SyncOutcome<RemoteSpool> {
        let Some(service) = self.service.as_ref() else {
            return SyncOutcome::Unavailable;
        };
        let outcome = self.call("fetch", service.get_spool(spool_id)).await;
        if let SyncOutcome::Completed(spool) = &outcome {
            if let Some(grams) = spool.remaining_weight {
                self.remaining.lock().insert(spool_id, (grams, Instant::now()));
            }
        }
        outcome
    }

    pub async fn list_spools(&self) -> SyncOutcome<Vec<RemoteSpool>> {
        let Some(service) = self.service.as_ref() else {
            return SyncOutcome::Unavailable;
        };
        self.call("list", service.list_spools()).await
    }

    /// Report consumption. A failed push is not retried.
    pub async fn push_usage(&self, spool_id: i64, grams: f64) -> SyncOutcome<()> {
        let Some(service) = self.service.as_ref() else {
            return SyncOutcome::Unavailable;
        };
        self.remaining.lock().remove(&spool_id);
        let outcome = self.call("usage push", service.use_weight(spool_id, grams)).await;
        if outcome.is_completed() {
            debug!("Reported {:.2}g used on spool {}", grams, spool_id);
        }
        outcome
    }

    /// Mirror a re-measured weight to the spool record.
    pub async fn push_measurement(&self, spool_id: i64, grams: f64) -> SyncOutcome<()> {
        let Some(service) = self.service.as_ref() else {
            return SyncOutcome::Unavailable;
        };
        let outcome = self
            .call("measurement push", service.set_remaining(spool_id, grams))
            .await;
        if outcome.is_completed() {
            self.remaining.lock().insert(spool_id, (grams, Instant::now()));
        }
        outcome
    }

    /// Store a physical tag id on the spool so it can be resolved later.
    pub async fn write_tag(&self, spool_id: i64, tag_id: &str) -> SyncOutcome<()> {
        let Some(service) = self.service.as_ref() else {
            return SyncOutcome::Unavailable;
        };
        let outcome = self
            .call("tag write", service.set_extra(spool_id, &self.tag_field, tag_id))
            .await;
        if outcome.is_completed() {
            self.tag_misses.lock().remove(tag_id);
            info!("Wrote tag {} to spool {}", tag_id, spool_id);
        }
        outcome
    }

    /// The single non-archived spool carrying `tag_id`, if exactly one does.
    ///
    /// Tags without a unique match are not looked up again until the cache TTL passes.
    pub async fn resolve_tag(&self, tag_id: &str) -> SyncOutcome<Option<RemoteSpool>> {
        if let Some(at) = self.tag_misses.lock().get(tag_id).copied() {
            if at.elapsed() < self.cache_ttl {
                return SyncOutcome::Completed(None);
            }
        }
        let spools = match self.list_spools().await {
            SyncOutcome::Completed(spools) => spools,
            SyncOutcome::Unavailable => return SyncOutcome::Unavailable,
            SyncOutcome::Failed(msg) => return SyncOutcome::Failed(msg),
        };
        let mut matches: Vec<RemoteSpool> = spools
            .into_iter()
            .filter(|s| !s.archived && s.tag(&self.tag_field).as_deref() == Some(tag_id))
            .collect();
        if matches.len() == 1 {
            return SyncOutcome::Completed(matches.pop());
        }
        if matches.len() > 1 {
            warn!("Tag {} matches {} spools, not linking", tag_id, matches.len());
        } else {
            debug!("Tag {} matches no spool", tag_id);
        }
        self.tag_misses.lock().insert(tag_id.to_string(), Instant::now());
        SyncOutcome::Completed(None)
    }
}

/// Order spools for a slot: same material first, then by RGB distance.
pub fn rank_candidates(
    spools: Vec<RemoteSpool>,
    material: Option<&str>,
    color_hex: Option<&str>,
    linked_slot: impl Fn(i64) -> Option<SlotKey>,
) -> Vec<SpoolCandidate> {
    let material = material.map(normalize_material);
    let mut candidates: Vec<SpoolCandidate> = spools
        .into_iter()
        .filter(|s| !s.archived)
        .map(|s| {
            let spool_material = s.material().map(|m| normalize_material(&m));
            let spool_color = s.color();
            let mut score = match (color_hex, spool_color.as_deref()) {
                (Some(a), Some(b)) => color_distance(a, b),
                _ => UNKNOWN_COLOR_DISTANCE,
            };
            if material.is_some() && spool_material == material {
                score += SAME_MATERIAL_BONUS;
            }
            SpoolCandidate {
                id: s.id,
                name: s.display_name(),
                vendor: s.vendor_name(),
                material: spool_material,
                color_hex: spool_color,
                remaining_weight: s.remaining_weight,
                score,
                linked_slot: linked_slot(s.id),
            }
        })
        .collect();
    candidates.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.id.cmp(&b.id)));
    candidates
}
