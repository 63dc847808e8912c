use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::{Allocation, JobRecord, KeyedLog, LiveTracker};
use crate::ledger::EpochLedger;

/// Everything written to `state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub updated_at: DateTime<Utc>,
    /// Bumped on every committed mutation.
    pub state_version: u64,
    pub slots: EpochLedger,
    /// Finished jobs in the order they were first seen.
    pub jobs: KeyedLog<JobRecord>,
    pub allocations: KeyedLog<Allocation>,
    pub live_job: LiveTracker,
}
