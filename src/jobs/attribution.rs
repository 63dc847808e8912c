//! Job keys, allocation validation and the pending/attributed views.

use std::collections::BTreeMap;

use tracing::debug;

use super::log::KeyedLog;
use super::types::{
    Allocation, AttributionTarget, JobRecord, PendingJob, SlotUsageRecord,
};
use crate::error::KeeperError;
use crate::slot::SlotKey;

/// Deterministic key for a history entry: `<job id or name>:<end time in whole seconds>`.
pub fn job_key(job_id: &str, name: &str, end_ts: Option<f64>) -> String {
    let id = if job_id.trim().is_empty() {
        name.trim()
    } else {
        job_id.trim()
    };
    let ts = end_ts.filter(|t| t.is_finite()).unwrap_or(0.0);
    format!("{}:{:.0}", id, ts)
}

/// Round grams to two decimals.
pub fn round_g(grams: f64) -> f64 {
    (grams * 100.0).round() / 100.0
}

/// Validate a per-slot request and drop zero entries.
///
/// Unknown slot keys fail first, then negative or non-finite amounts; an
/// allocation with nothing left fails with `EmptyAllocation`.
pub fn normalize_allocation(
    job_key: &str,
    per_slot_grams: &BTreeMap<String, f64>,
) -> Result<BTreeMap<SlotKey, f64>, KeeperError> {
    let parsed = per_slot_grams
        .iter()
        .map(|(slot, grams)| Ok((slot.parse::<SlotKey>()?, *grams)))
        .collect::<Result<Vec<_>, KeeperError>>()?;

    let mut out = BTreeMap::new();
    for (slot, grams) in parsed {
        if !grams.is_finite() || grams < 0.0 {
            return Err(KeeperError::InvalidWeight { slot, grams });
        }
        let grams = round_g(grams);
        if grams > 0.0 {
            *out.entry(slot).or_insert(0.0) += grams;
        }
    }

    if out.is_empty() {
        return Err(KeeperError::EmptyAllocation(job_key.to_string()));
    }
    Ok(out)
}

/// Split `total_g` across slots in proportion to `shares`. Non-positive shares get nothing.
pub fn split_proportionally(total_g: f64, shares: &BTreeMap<SlotKey, f64>) -> BTreeMap<SlotKey, f64> {
    let sum: f64 = shares.values().filter(|s| **s > 0.0).sum();
    if sum <= 0.0 || total_g <= 0.0 || !total_g.is_finite() {
        return BTreeMap::new();
    }
    shares
        .iter()
        .filter(|(_, s)| **s > 0.0)
        .map(|(slot, s)| (*slot, round_g(total_g * s / sum)))
        .filter(|(_, g)| *g > 0.0)
        .collect()
}

/// Append unseen records in chronological order. `newest_first` is the feed order.
///
/// Returns the keys that were added.
pub fn ingest(log: &mut KeyedLog<JobRecord>, newest_first: Vec<JobRecord>) -> Vec<String> {
    let mut added = Vec::new();
    for record in newest_first.into_iter().rev() {
        let key = record.key.clone();
        if log.append(record) {
            debug!("Logged job {}", key);
            added.push(key);
        }
    }
    added
}

/// Attribution targets of a job: its positive colour parts, else the whole job.
pub fn targets_of(job: &JobRecord) -> Vec<AttributionTarget> {
    let parts: Vec<AttributionTarget> = job
        .parts
        .iter()
        .filter(|p| p.grams > 0.0)
        .map(|p| AttributionTarget {
            part: Some(p.index),
            grams: p.grams,
            color_hex: p.color_hex.clone(),
        })
        .collect();
    if !job.parts.is_empty() {
        return parts;
    }
    if job.total_g > 0.0 {
        vec![AttributionTarget {
            part: None,
            grams: job.total_g,
            color_hex: None,
        }]
    } else {
        Vec::new()
    }
}

/// Unallocated jobs with positive usage, newest first.
pub fn pending_jobs(jobs: &KeyedLog<JobRecord>, allocations: &KeyedLog<Allocation>) -> Vec<PendingJob> {
    jobs.iter()
        .rev()
        .filter(|job| !allocations.contains(&job.key))
        .filter_map(|job| {
            let targets = targets_of(job);
            if targets.is_empty() {
                return None;
            }
            Some(PendingJob {
                key: job.key.clone(),
                name: job.name.clone(),
                status: job.status,
                ended_at: job.ended_at,
                total_g: job.total_g,
                targets,
            })
        })
        .collect()
}

/// Every allocation portion charged to `slot`, newest first.
pub fn slot_history(
    slot: SlotKey,
    current_epoch: u32,
    jobs: &KeyedLog<JobRecord>,
    allocations: &KeyedLog<Allocation>,
) -> Vec<SlotUsageRecord> {
    allocations
        .iter()
        .rev()
        .filter_map(|alloc| {
            let portion = alloc.portions.get(&slot)?;
            Some(SlotUsageRecord {
                job_key: alloc.job_key.clone(),
                job_name: jobs
                    .get(&alloc.job_key)
                    .map(|j| j.name.clone())
                    .unwrap_or_default(),
                grams: portion.grams,
                epoch: portion.epoch,
                current_roll: portion.epoch == current_epoch,
                origin: alloc.origin,
                allocated_at: alloc.created_at,
            })
        })
        .collect()
}
