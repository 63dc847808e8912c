use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::types::JobRecord;
use crate::config::TrackingConfig;
use crate::slot::SlotKey;
use crate::telemetry::PrintStatus;

/// Finished jobs kept while waiting for their history record.
const MAX_FINISHED: usize = 10;

/// How far a history record's end time may be from the tracker's finish time.
const MATCH_WINDOW_SECS: i64 = 15 * 60;

/// The job currently printing, with feed length attributed per slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveJob {
    pub name: String,
    pub started_at: DateTime<Utc>,
    /// Printer's cumulative filament counter at the last observation.
    pub last_mm: f64,
    #[serde(default)]
    pub slot_mm: BTreeMap<SlotKey, f64>,
    #[serde(default)]
    pub slot_g: BTreeMap<SlotKey, f64>,
}

/// A tracked job that stopped printing, kept until its history record arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedJob {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub slot_mm: BTreeMap<SlotKey, f64>,
    #[serde(default)]
    pub slot_g: BTreeMap<SlotKey, f64>,
}

impl TrackedJob {
    /// Shares used to split the job's reported total; grams when known, else length.
    pub fn shares(&self) -> &BTreeMap<SlotKey, f64> {
        if self.slot_g.values().any(|g| *g > 0.0) {
            &self.slot_g
        } else {
            &self.slot_mm
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveTracker {
    pub current: Option<LiveJob>,
    pub finished: Vec<TrackedJob>,
}

impl LiveTracker {
    /// Feed one telemetry observation. Returns whether the tracker changed.
    ///
    /// `material_of` names the material loaded in a slot, for the density
    /// fallback when the job carries no planned grams.
    pub fn observe(
        &mut self,
        print: Option<&PrintStatus>,
        active_slot: Option<SlotKey>,
        material_of: impl Fn(SlotKey) -> String,
        tracking: &TrackingConfig,
        now: DateTime<Utc>,
    ) -> bool {
        let printing = print.filter(|p| p.state.is_active() && !p.filename.is_empty());

        let Some(print) = printing else {
            return self.finish(now);
        };

        let mut changed = false;
        if self.current.as_ref().map(|j| j.name.as_str()) != Some(print.filename.as_str()) {
            self.finish(now);
            info!("Tracking job {}", print.filename);
            self.current = Some(LiveJob {
                name: print.filename.clone(),
                started_at: now,
                last_mm: 0.0,
                slot_mm: BTreeMap::new(),
                slot_g: BTreeMap::new(),
            });
            changed = true;
        }

        let Some(job) = self.current.as_mut() else {
            return changed;
        };
        let used = print.filament_used_mm.max(0.0);
        let delta = (used - job.last_mm).max(0.0);
        if delta > 0.0 {
            if let Some(slot) = active_slot {
                let grams = match print.grams_per_mm() {
                    Some(ratio) => delta * ratio,
                    None => tracking.mm_to_g(&material_of(slot), delta),
                };
                *job.slot_mm.entry(slot).or_insert(0.0) += delta;
                *job.slot_g.entry(slot).or_insert(0.0) += grams;
            }
        }
        if used != job.last_mm {
            job.last_mm = used;
            changed = true;
        }
        changed
    }

    /// Move the current job to the finished list.
    fn finish(&mut self, now: DateTime<Utc>) -> bool {
        let Some(job) = self.current.take() else {
            return false;
        };
        info!("Job {} finished, {} slot(s) tracked", job.name, job.slot_mm.len());
        self.finished.push(TrackedJob {
            name: job.name,
            started_at: job.started_at,
            finished_at: now,
            slot_mm: job.slot_mm,
            slot_g: job.slot_g,
        });
        if self.finished.len() > MAX_FINISHED {
            let excess = self.finished.len() - MAX_FINISHED;
            self.finished.drain(..excess);
        }
        true
    }

    /// Take the most recent finished job matching a history record by name and end time.
    pub fn take_match(&mut self, record: &JobRecord) -> Option<TrackedJob> {
        let window = Duration::seconds(MATCH_WINDOW_SECS);
        let idx = self.finished.iter().rposition(|t| {
            t.name == record.name
                && record
                    .ended_at
                    .map(|end| (end - t.finished_at).abs() <= window)
                    .unwrap_or(true)
        })?;
        debug!("Matched tracked job {} to {}", record.name, record.key);
        Some(self.finished.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::jobs::types::JobStatus;
    use crate::telemetry::PrintState;

    fn slot(s: &str) -> SlotKey {
        s.parse().unwrap()
    }

    fn status(state: PrintState, used: f64, planned: Option<(f64, f64)>) -> PrintStatus {
        PrintStatus {
            state,
            filename: "benchy.gcode".to_string(),
            filament_used_mm: used,
            planned_g: planned.map(|p| p.0),
            planned_mm: planned.map(|p| p.1),
        }
    }

    fn pla(_: SlotKey) -> String {
        "PLA".to_string()
    }

    #[test]
    fn test_attributes_deltas_to_active_slot() {
        let tracking = default_config().tracking;
        let mut tracker = LiveTracker::default();
        let now = Utc::now();
        let planned = Some((20.0, 10000.0));

        assert!(tracker.observe(Some(&status(PrintState::Printing, 1000.0, planned)), Some(slot("1A")), pla, &tracking, now));
        tracker.observe(Some(&status(PrintState::Printing, 1500.0, planned)), Some(slot("1B")), pla, &tracking, now);
        tracker.observe(Some(&status(PrintState::Paused, 1500.0, planned)), Some(slot("1B")), pla, &tracking, now);

        let job = tracker.current.as_ref().unwrap();
        assert_eq!(job.slot_mm[&slot("1A")], 1000.0);
        assert_eq!(job.slot_mm[&slot("1B")], 500.0);
        assert!((job.slot_g[&slot("1A")] - 2.0).abs() < 1e-9);
        assert!((job.slot_g[&slot("1B")] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_density_fallback_without_planned_grams() {
        let tracking = default_config().tracking;
        let mut tracker = LiveTracker::default();
        tracker.observe(Some(&status(PrintState::Printing, 1000.0, None)), Some(slot("2C")), pla, &tracking, Utc::now());
        let g = tracker.current.as_ref().unwrap().slot_g[&slot("2C")];
        assert!((g - 2.9825).abs() < 0.001);
    }

    #[test]
    fn test_finish_and_match() {
        let tracking = default_config().tracking;
        let mut tracker = LiveTracker::default();
        let start = Utc::now();
        tracker.observe(Some(&status(PrintState::Printing, 800.0, None)), Some(slot("3A")), pla, &tracking, start);
        let end = start + Duration::minutes(30);
        assert!(tracker.observe(Some(&status(PrintState::Complete, 800.0, None)), None, pla, &tracking, end));
        assert!(tracker.current.is_none());
        assert_eq!(tracker.finished.len(), 1);
        assert!(!tracker.observe(None, None, pla, &tracking, end));

        let record = JobRecord {
            key: "42:1".to_string(),
            job_id: "42".to_string(),
            name: "benchy.gcode".to_string(),
            status: JobStatus::Completed,
            material: None,
            started_at: None,
            ended_at: Some(end + Duration::seconds(20)),
            total_g: 2.5,
            total_mm: 800.0,
            parts: Vec::new(),
        };
        let tracked = tracker.take_match(&record).unwrap();
        assert_eq!(tracked.shares().len(), 1);
        assert!(tracker.take_match(&record).is_none());
    }

    #[test]
    fn test_finished_list_is_capped() {
        let tracking = default_config().tracking;
        let mut tracker = LiveTracker::default();
        let now = Utc::now();
        for i in 0..15 {
            let mut s = status(PrintState::Printing, 10.0, None);
            s.filename = format!("job{}.gcode", i);
            tracker.observe(Some(&s), Some(slot("1A")), pla, &tracking, now);
        }
        tracker.observe(None, None, pla, &tracking, now);
        assert_eq!(tracker.finished.len(), MAX_FINISHED);
        assert_eq!(tracker.finished.last().unwrap().name, "job14.gcode");
    }
}
