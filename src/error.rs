use thiserror::Error;

use crate::slot::SlotKey;

/// Errors returned by the command surface.
///
/// Validation variants are raised before any mutation happens. `Persistence`
/// means the mutation was rolled back because the snapshot could not be written.
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("Unknown slot: {0}")]
    UnknownSlot(String),

    #[error("Invalid weight for slot {slot}: {grams}")]
    InvalidWeight { slot: SlotKey, grams: f64 },

    #[error("Invalid spool id: {0}")]
    InvalidSpoolId(i64),

    #[error("Allocation for job '{0}' contains no positive amount")]
    EmptyAllocation(String),

    #[error("Job '{0}' is already allocated")]
    AlreadyAllocated(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl KeeperError {
    /// Stable identifier the request layer can map to a status or message.
    pub fn kind(&self) -> &'static str {
        match self {
            KeeperError::UnknownSlot(_) => "unknown_slot",
            KeeperError::InvalidWeight { .. } => "invalid_weight",
            KeeperError::InvalidSpoolId(_) => "invalid_spool_id",
            KeeperError::EmptyAllocation(_) => "empty_allocation",
            KeeperError::AlreadyAllocated(_) => "already_allocated",
            KeeperError::Persistence(_) => "persistence",
        }
    }
}

impl From<KeeperError> for String {
    fn from(err: KeeperError) -> Self {
        err.to_string()
    }
}
