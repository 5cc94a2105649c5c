//! Log correlation
//!
//! Finds the structured event log of the agent running in a pane. Manual
//! selections are pinned and always win; otherwise the strategy chain in
//! [`strategy`] runs against the logs recorded for the pane's cwd and the
//! result is cached unpinned.

mod store;
mod strategy;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hub::HubEvent;
use crate::mux::{find_pane, Multiplexer};
use crate::process::{find_agent_process, ProcessTable};
use crate::target::Target;

pub use store::{encode_project_dir, ClaudeLogStore, DebugFile, LogCandidate, LogStore};
pub use strategy::{pick, Confidence, CorrelationInput, Match, Strategy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogMapping {
    pub log_path: PathBuf,
    pub session_id: String,
    pub pinned: bool,
    pub confidence: Confidence,
    pub matched_at: DateTime<Utc>,
}

pub struct LogCorrelator {
    mux: Arc<dyn Multiplexer>,
    processes: Arc<dyn ProcessTable>,
    store: Arc<dyn LogStore>,
    strategies: Vec<Strategy>,
    /// pane_id -> mapping
    mappings: Mutex<HashMap<String, LogMapping>>,
}

impl LogCorrelator {
    pub fn new(
        mux: Arc<dyn Multiplexer>,
        processes: Arc<dyn ProcessTable>,
        store: Arc<dyn LogStore>,
        debug_tolerance_secs: i64,
        first_entry_tolerance_secs: i64,
    ) -> Self {
        Self {
            mux,
            processes,
            store,
            strategies: Strategy::chain(
                chrono::Duration::seconds(debug_tolerance_secs),
                chrono::Duration::seconds(first_entry_tolerance_secs),
            ),
            mappings: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn mapping(&self, pane_id: &str) -> Option<LogMapping> {
        self.mappings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(pane_id)
            .cloned()
    }

    pub fn mappings(&self) -> HashMap<String, LogMapping> {
        self.mappings.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn claimed_by_others(&self, pane_id: &str) -> HashSet<PathBuf> {
        self.mappings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(pane, _)| pane.as_str() != pane_id)
            .map(|(_, m)| m.log_path.clone())
            .collect()
    }

    /// Log for the agent in `target`'s pane
    pub async fn correlate(&self, target: &Target) -> Result<LogMapping> {
        let pane_id = target.pane_id.as_str();
        if let Some(pinned) = self.mapping(pane_id).filter(|m| m.pinned) {
            return Ok(pinned);
        }

        let pane = find_pane(self.mux.as_ref(), pane_id)
            .await?
            .ok_or_else(|| Error::StaleTarget {
                pane_id: pane_id.to_string(),
            })?;
        let entries = self.processes.snapshot().await?;
        let agent = find_agent_process(&entries, pane.pane_pid);
        if let Some(agent) = &agent {
            if agent.kind != self.store.agent() {
                debug!(pane_id, kind = ?agent.kind, "Agent keeps no session logs here");
                return Err(Error::NoLogCandidate(pane_id.to_string()));
            }
        }
        let started_at = agent.as_ref().map(|a| a.process.started_at);

        let candidates = self.store.candidates(&target.working_directory).await?;
        let debug_files = if started_at.is_some() {
            self.store.debug_files().await?
        } else {
            Vec::new()
        };
        let claimed = self.claimed_by_others(pane_id);
        let input = CorrelationInput {
            candidates: &candidates,
            debug_files: &debug_files,
            started_at,
            claimed: &claimed,
        };
        let Some(best) = pick(&self.strategies, &input) else {
            return Err(Error::NoLogCandidate(pane_id.to_string()));
        };

        let mapping = LogMapping {
            log_path: best.path,
            session_id: best.session_id,
            pinned: false,
            confidence: best.confidence,
            matched_at: Utc::now(),
        };

        let mut mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        // a manual pick made while we were scanning wins
        if let Some(existing) = mappings.get(pane_id).filter(|m| m.pinned) {
            return Ok(existing.clone());
        }
        let changed = mappings.get(pane_id).map(|m| &m.log_path) != Some(&mapping.log_path);
        if changed {
            info!(
                pane_id,
                log = %mapping.log_path.display(),
                confidence = ?mapping.confidence,
                delta_ms = best.delta.num_milliseconds(),
                "Log correlated"
            );
        }
        mappings.insert(pane_id.to_string(), mapping.clone());
        Ok(mapping)
    }

    /// Pin `path` for `pane_id` until unpinned or the pane dies
    pub async fn select_manual(&self, pane_id: &str, path: &Path) -> Result<LogMapping> {
        if find_pane(self.mux.as_ref(), pane_id).await?.is_none() {
            return Err(Error::StaleTarget {
                pane_id: pane_id.to_string(),
            });
        }
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(Error::NoLogCandidate(path.display().to_string()));
        }
        let mapping = LogMapping {
            log_path: path.to_path_buf(),
            session_id: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            pinned: true,
            confidence: Confidence::Manual,
            matched_at: Utc::now(),
        };
        info!(pane_id, log = %path.display(), "Log pinned");
        self.mappings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pane_id.to_string(), mapping.clone());
        Ok(mapping)
    }

    /// Drop the mapping so the next lookup re-detects
    pub fn unpin(&self, pane_id: &str) -> Option<LogMapping> {
        let removed = self
            .mappings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(pane_id);
        if removed.is_some() {
            info!(pane_id, "Log mapping cleared");
        }
        removed
    }

    /// The selection moved away from `previous`; unpinned mappings go
    pub fn on_target_changed(&self, previous: Option<&str>) {
        let Some(pane_id) = previous else {
            return;
        };
        let mut mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        if mappings.get(pane_id).is_some_and(|m| !m.pinned) {
            mappings.remove(pane_id);
            debug!(pane_id, "Unpinned log mapping dropped on target change");
        }
    }

    /// The pane is gone; its mapping goes even when pinned
    pub fn forget_pane(&self, pane_id: &str) {
        if self
            .mappings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(pane_id)
            .is_some()
        {
            info!(pane_id, "Log mapping dropped for dead pane");
        }
    }

    /// Drop every mapping whose pane is not in `live`, pinned or not
    pub fn retain_panes(&self, live: &[String]) -> Vec<String> {
        let mut mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        let gone: Vec<String> = mappings
            .keys()
            .filter(|pane| !live.contains(pane))
            .cloned()
            .collect();
        for pane_id in &gone {
            mappings.remove(pane_id);
            info!(pane_id = %pane_id, "Log mapping dropped for dead pane");
        }
        gone
    }

    /// Session logs for the target's cwd, newest first
    pub async fn list_sessions(&self, target: &Target) -> Result<Vec<LogCandidate>> {
        let mut candidates = self.store.candidates(&target.working_directory).await?;
        candidates.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(candidates)
    }
}

/// Keep the mapping cache in step with target switches and pane deaths
pub fn spawn_hub_listener(correlator: Arc<LogCorrelator>, mut events: broadcast::Receiver<HubEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(HubEvent::TargetChanged { previous, .. }) => {
                    correlator.on_target_changed(previous.as_deref());
                }
                Ok(HubEvent::PaneDied { pane_id }) => correlator.forget_pane(&pane_id),
                Ok(HubEvent::PanesListed { live }) => {
                    correlator.retain_panes(&live);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Log correlator missed hub events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
