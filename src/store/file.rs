use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use super::migrate::migrate;
use super::state::PersistedState;

/// File-backed snapshot of [`PersistedState`].
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot, upgrading legacy layouts in memory.
    ///
    /// A missing file yields the empty initial state. The file itself is not
    /// rewritten until the next [`save`](Self::save).
    pub fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            info!("No state file at {:?}, starting fresh", self.path);
            return Ok(PersistedState::default());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file {:?}", self.path))?;
        let mut doc: Value = serde_json::from_str(&content)
            .with_context(|| format!("State file {:?} is not valid JSON", self.path))?;

        let applied = migrate(&mut doc)?;
        if !applied.is_empty() {
            info!("Upgraded state file fields: {}", applied.join(", "));
        }

        let mut state: PersistedState = serde_json::from_value(doc)
            .with_context(|| format!("State file {:?} has an unexpected shape", self.path))?;
        state.slots.ensure_all_slots();
        debug!(
            "Loaded state version {} ({} jobs, {} allocations)",
            state.state_version,
            state.jobs.len(),
            state.allocations.len()
        );
        Ok(state)
    }

    /// Load, or move an unreadable file aside and start from the empty state.
    pub fn load_or_recover(&self) -> PersistedState {
        match self.load() {
            Ok(state) => state,
            Err(e) => {
                error!("Failed to load state: {:#}", e);
                let backup = self.path.with_extension(format!(
                    "corrupt-{}.json",
                    Utc::now().format("%Y%m%d%H%M%S")
                ));
                match std::fs::copy(&self.path, &backup) {
                    Ok(_) => warn!("Kept unreadable state file as {:?}", backup),
                    Err(copy_err) => warn!("Could not back up state file: {}", copy_err),
                }
                PersistedState::default()
            }
        }
    }

    /// Write the snapshot atomically: temp file in the same directory, then rename.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let mut json = serde_json::to_string_pretty(state)?;
        json.push('\n');

        let parent = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("State path has no parent directory: {:?}", self.path))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory {:?}", parent))?;

        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(json.as_bytes())?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .with_context(|| format!("Failed to replace state file {:?}", self.path))?;

        debug!("Saved state version {} to {:?}", state.state_version, self.path);
        Ok(())
    }
}
