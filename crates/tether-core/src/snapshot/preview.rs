//! Read-only preview of a stored snapshot
//!
//! While a preview is open every mutating input path (terminal input,
//! resize, target selection) is refused. Leaving the preview touches
//! nothing on the live target.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewState {
    pub snapshot_id: u64,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PreviewGate {
    active: RwLock<Option<PreviewState>>,
}

impl PreviewGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or move) the preview onto `snapshot_id`
    pub fn enter(&self, snapshot_id: u64) -> PreviewState {
        let state = PreviewState {
            snapshot_id,
            entered_at: Utc::now(),
        };
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        info!(snapshot_id, "Preview entered");
        state
    }

    /// Close the preview; returns the snapshot that was shown
    pub fn exit(&self) -> Option<u64> {
        let previous = self
            .active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(|s| s.snapshot_id);
        if let Some(id) = previous {
            info!(snapshot_id = id, "Preview exited");
        }
        previous
    }

    pub fn current(&self) -> Option<PreviewState> {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_active(&self) -> bool {
        self.current().is_some()
    }

    /// `PreviewActive` while a preview is open
    pub fn ensure_writable(&self) -> Result<()> {
        match self.current() {
            Some(state) => Err(Error::PreviewActive(state.snapshot_id)),
            None => Ok(()),
        }
    }
}
