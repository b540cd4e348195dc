//! Best-effort state snapshots so a restart can pick up open positions.

use crate::error::{Result, TradingError};
use crate::exits::ExitPlan;
use crate::models::Position;
use crate::realtime::RecoveryState;
use crate::risk::RiskState;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything needed to resume the loop
///
/// Invalidation predicates are not serializable and are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub saved_at: DateTime<Utc>,
    pub total_loops: u64,
    pub positions: Vec<Position>,
    pub exit_plans: Vec<ExitPlan>,
    pub risk: RiskState,
    pub recovery: RecoveryState,
}

/// JSON file store with atomic replace
#[derive(Debug, Clone)]
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

    pub fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            TradingError::Persistence(format!(
                "rename {} -> {}: {}",
                tmp.display(),
                self.path.display(),
                e
            ))
        })?;
        info!(
            "Saved state ({} positions) to {}",
            snapshot.positions.len(),
            self.path.display()
        );
        Ok(())
    }

    /// `Ok(None)` when nothing has been saved yet
    pub fn load(&self) -> Result<Option<StateSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        match serde_json::from_str(&content) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!("State file {} is unreadable: {}", self.path.display(), e);
                Err(TradingError::Persistence(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        }
    }
}
