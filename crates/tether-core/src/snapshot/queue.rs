//! Pending-command queue
//!
//! The queue itself lives in an external collaborator; the relay only keeps
//! the latest copy it was given so snapshots can include it verbatim.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub pending: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct PendingQueue {
    state: RwLock<QueueState>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, pending: Vec<String>) -> QueueState {
        let state = QueueState {
            pending,
            updated_at: Some(Utc::now()),
        };
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state.clone();
        state
    }

    pub fn snapshot(&self) -> QueueState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Entries only, for hashing and snapshot bundles
    pub fn pending(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .clone()
    }
}
