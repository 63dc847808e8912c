//! Durable snapshot of the ledger, job log and allocations.

mod file;
mod migrate;
mod state;

pub use file::StateStore;
pub use migrate::{migrate, MIGRATIONS};
pub use state::PersistedState;
