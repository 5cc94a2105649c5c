//! Audit trail for mutating operations
//!
//! Append-only for the lifetime of the process. Each entry is also emitted
//! on the `audit` tracing target so it lands in the daemon log file.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SelectTarget,
    ClearTarget,
    SelectLog,
    UnpinLog,
    CaptureSnapshot,
    PinSnapshot,
    UnpinSnapshot,
    AnnotateSnapshot,
    EnterPreview,
    ExitPreview,
    UpdateQueue,
    SetVisibility,
    Input,
    Resize,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuditAction::SelectTarget => "select_target",
            AuditAction::ClearTarget => "clear_target",
            AuditAction::SelectLog => "select_log",
            AuditAction::UnpinLog => "unpin_log",
            AuditAction::CaptureSnapshot => "capture_snapshot",
            AuditAction::PinSnapshot => "pin_snapshot",
            AuditAction::UnpinSnapshot => "unpin_snapshot",
            AuditAction::AnnotateSnapshot => "annotate_snapshot",
            AuditAction::EnterPreview => "enter_preview",
            AuditAction::ExitPreview => "exit_preview",
            AuditAction::UpdateQueue => "update_queue",
            AuditAction::SetVisibility => "set_visibility",
            AuditAction::Input => "input",
            AuditAction::Resize => "resize",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub actor_ip: String,
    pub action: AuditAction,
    /// Pane the action applied to, if any
    pub target: Option<String>,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(
        &self,
        actor_ip: impl Into<String>,
        action: AuditAction,
        target: Option<&str>,
        detail: impl Into<String>,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            actor_ip: actor_ip.into(),
            action,
            target: target.map(str::to_string),
            detail: detail.into(),
        };
        info!(
            target: "audit",
            actor = %entry.actor_ip,
            action = %entry.action,
            pane = entry.target.as_deref().unwrap_or("-"),
            detail = %entry.detail,
            "audit"
        );
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    /// Newest `limit` entries, oldest first
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let skip = entries.len().saturating_sub(limit);
        entries[skip..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
