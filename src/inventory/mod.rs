//! Remote spool inventory: REST client and the best-effort sync adapter.

mod client;
mod sync;
mod types;

pub use client::{InventoryError, InventoryService, SpoolmanClient};
pub use sync::{rank_candidates, InventorySync};
pub use types::{RemoteFilament, RemoteSpool, RemoteVendor, SpoolCandidate, SyncOutcome};
