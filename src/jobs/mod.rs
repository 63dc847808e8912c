//! Job history ingestion and attribution of filament usage to slots.

mod attribution;
mod feed;
mod live;
mod log;
mod types;

pub use attribution::{
    ingest, job_key, normalize_allocation, pending_jobs, round_g, slot_history,
    split_proportionally, targets_of,
};
pub use feed::{history_jobs, parse_history_entry, FeedError, HistoryFeed};
pub use live::{LiveJob, LiveTracker, TrackedJob};
pub use log::{Keyed, KeyedLog};
pub use types::{
    Allocation, AllocationOrigin, AttributionTarget, ColorPart, JobRecord, JobStatus,
    PendingJob, Portion, SlotUsageRecord,
};
