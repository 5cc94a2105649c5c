//! Snapshot ring buffer
//!
//! A snapshot bundles the log tail, a terminal excerpt and the pending-command
//! queue at one point in time. The buffer keeps them in insertion order with
//! a fixed capacity:
//!
//! - a capture whose normalized content hashes equal to the newest entry is
//!   skipped
//! - past capacity the oldest *unpinned* entry is evicted
//! - if every slot is pinned the capture is rejected with `CapacityExhausted`

mod preview;
mod queue;
mod service;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use similar::TextDiff;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub use preview::{PreviewGate, PreviewState};
pub use queue::{PendingQueue, QueueState};
pub use service::{spawn_boundary_watcher, SnapshotService, SnapshotSettings};

/// Diff context lines
const DIFF_CONTEXT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureTrigger {
    Manual,
    Periodic,
    TurnBoundary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBundle {
    pub log_excerpt: Vec<String>,
    pub terminal_text: String,
    pub queue_state: Vec<String>,
}

impl SnapshotBundle {
    /// SHA-256 over the normalized bundle, hex encoded.
    ///
    /// Trailing whitespace and trailing blank lines are ignored so a redraw
    /// that only pads the screen does not count as a change.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"log\0");
        for line in &self.log_excerpt {
            hasher.update(line.trim_end().as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(b"terminal\0");
        hasher.update(normalize_text(&self.terminal_text).as_bytes());
        hasher.update(b"queue\0");
        for item in &self.queue_state {
            hasher.update(item.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

fn normalize_text(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub label: Option<String>,
    pub trigger: CaptureTrigger,
    pub content_hash: String,
    pub pane_id: Option<String>,
    pub epoch: u64,
    #[serde(flatten)]
    pub bundle: SnapshotBundle,
    pub pinned: bool,
    pub annotation: Option<String>,
}

/// Listing row without the bundle
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub label: Option<String>,
    pub trigger: CaptureTrigger,
    pub content_hash: String,
    pub pane_id: Option<String>,
    pub pinned: bool,
    pub annotation: Option<String>,
}

impl From<&Snapshot> for SnapshotSummary {
    fn from(s: &Snapshot) -> Self {
        Self {
            id: s.id,
            timestamp: s.timestamp,
            label: s.label.clone(),
            trigger: s.trigger,
            content_hash: s.content_hash.clone(),
            pane_id: s.pane_id.clone(),
            pinned: s.pinned,
            annotation: s.annotation.clone(),
        }
    }
}

/// Everything a capture provides
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub trigger: CaptureTrigger,
    pub label: Option<String>,
    pub pane_id: Option<String>,
    pub epoch: u64,
    pub bundle: SnapshotBundle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaptureOutcome {
    Captured(Box<Snapshot>),
    /// Same content as the newest entry
    Unchanged { latest_id: u64 },
}

#[derive(Debug)]
pub struct SnapshotBuffer {
    capacity: usize,
    entries: VecDeque<Snapshot>,
    next_id: u64,
}

impl SnapshotBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            next_id: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.entries.back()
    }

    pub fn insert(&mut self, new: NewSnapshot) -> Result<CaptureOutcome> {
        let content_hash = new.bundle.content_hash();
        if let Some(latest) = self.latest() {
            if latest.content_hash == content_hash {
                debug!(latest_id = latest.id, "Snapshot content unchanged, skipped");
                return Ok(CaptureOutcome::Unchanged { latest_id: latest.id });
            }
        }

        if self.entries.len() >= self.capacity {
            let Some(index) = self.entries.iter().position(|s| !s.pinned) else {
                return Err(Error::CapacityExhausted {
                    capacity: self.capacity,
                });
            };
            if let Some(evicted) = self.entries.remove(index) {
                debug!(id = evicted.id, "Snapshot evicted");
            }
        }

        let snapshot = Snapshot {
            id: self.next_id,
            timestamp: Utc::now(),
            label: new.label,
            trigger: new.trigger,
            content_hash,
            pane_id: new.pane_id,
            epoch: new.epoch,
            bundle: new.bundle,
            pinned: false,
            annotation: None,
        };
        self.next_id += 1;
        info!(id = snapshot.id, trigger = ?snapshot.trigger, pane_id = ?snapshot.pane_id, "Snapshot captured");
        self.entries.push_back(snapshot.clone());
        Ok(CaptureOutcome::Captured(Box::new(snapshot)))
    }

    /// Oldest first
    pub fn list(&self) -> Vec<SnapshotSummary> {
        self.entries.iter().map(SnapshotSummary::from).collect()
    }

    pub fn get(&self, id: u64) -> Result<&Snapshot> {
        self.entries
            .iter()
            .find(|s| s.id == id)
            .ok_or(Error::SnapshotNotFound(id))
    }

    fn get_mut(&mut self, id: u64) -> Result<&mut Snapshot> {
        self.entries
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(Error::SnapshotNotFound(id))
    }

    pub fn pin(&mut self, id: u64) -> Result<()> {
        self.get_mut(id)?.pinned = true;
        Ok(())
    }

    pub fn unpin(&mut self, id: u64) -> Result<()> {
        self.get_mut(id)?.pinned = false;
        Ok(())
    }

    /// Set or clear (empty text) the annotation
    pub fn annotate(&mut self, id: u64, text: &str) -> Result<()> {
        let text = text.trim();
        self.get_mut(id)?.annotation = (!text.is_empty()).then(|| text.to_string());
        Ok(())
    }

    /// Self-contained JSON document for one snapshot
    pub fn export(&self, id: u64) -> Result<Value> {
        let snapshot = self.get(id)?;
        Ok(json!({
            "format": "tether-snapshot",
            "version": 1,
            "exported_at": Utc::now(),
            "snapshot": snapshot,
        }))
    }

    pub fn diff(&self, from: u64, to: u64) -> Result<SnapshotDiff> {
        Ok(diff_snapshots(self.get(from)?, self.get(to)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotDiff {
    pub from: u64,
    pub to: u64,
    pub identical: bool,
    /// Unified diff of the terminal excerpts
    pub terminal: String,
    /// Unified diff of the log excerpts
    pub log: String,
    pub queue_added: Vec<String>,
    pub queue_removed: Vec<String>,
}

fn unified(old: &str, new: &str, from: u64, to: u64) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(DIFF_CONTEXT)
        .header(&format!("snapshot-{}", from), &format!("snapshot-{}", to))
        .to_string()
}

/// Pure function of the two stored bundles
pub fn diff_snapshots(from: &Snapshot, to: &Snapshot) -> SnapshotDiff {
    let a = &from.bundle;
    let b = &to.bundle;

    let mut old_log = a.log_excerpt.join("\n");
    old_log.push('\n');
    let mut new_log = b.log_excerpt.join("\n");
    new_log.push('\n');

    let queue_added = b
        .queue_state
        .iter()
        .filter(|item| !a.queue_state.contains(item))
        .cloned()
        .collect();
    let queue_removed = a
        .queue_state
        .iter()
        .filter(|item| !b.queue_state.contains(item))
        .cloned()
        .collect();

    SnapshotDiff {
        from: from.id,
        to: to.id,
        identical: from.content_hash == to.content_hash,
        terminal: unified(&a.terminal_text, &b.terminal_text, from.id, to.id),
        log: unified(&old_log, &new_log, from.id, to.id),
        queue_added,
        queue_removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(terminal: &str) -> NewSnapshot {
        NewSnapshot {
            trigger: CaptureTrigger::Manual,
            label: None,
            pane_id: Some("%1".into()),
            epoch: 0,
            bundle: SnapshotBundle {
                log_excerpt: vec!["{\"type\":\"user\"}".into()],
                terminal_text: terminal.to_string(),
                queue_state: Vec::new(),
            },
        }
    }

    fn captured_id(outcome: CaptureOutcome) -> u64 {
        match outcome {
            CaptureOutcome::Captured(s) => s.id,
            other => panic!("expected a capture, got {other:?}"),
        }
    }

    #[test]
    fn test_unchanged_hash_adds_nothing() {
        let mut buffer = SnapshotBuffer::new(4);
        let first = captured_id(buffer.insert(capture("$ ls\nsrc\n")).unwrap());

        // trailing padding normalizes away
        let outcome = buffer.insert(capture("$ ls   \nsrc\n\n\n")).unwrap();
        assert_eq!(outcome, CaptureOutcome::Unchanged { latest_id: first });
        assert_eq!(buffer.len(), 1);

        captured_id(buffer.insert(capture("$ ls\nsrc\ntarget\n")).unwrap());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_only_newest_entry_dedupes() {
        let mut buffer = SnapshotBuffer::new(4);
        captured_id(buffer.insert(capture("a")).unwrap());
        captured_id(buffer.insert(capture("b")).unwrap());
        // same as an older entry but not the newest
        captured_id(buffer.insert(capture("a")).unwrap());
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_eviction_skips_pinned() {
        let mut buffer = SnapshotBuffer::new(3);
        let one = captured_id(buffer.insert(capture("1")).unwrap());
        let two = captured_id(buffer.insert(capture("2")).unwrap());
        captured_id(buffer.insert(capture("3")).unwrap());
        buffer.pin(one).unwrap();

        captured_id(buffer.insert(capture("4")).unwrap());
        let ids: Vec<u64> = buffer.list().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![one, 3, 4]);
        assert!(matches!(buffer.get(two), Err(Error::SnapshotNotFound(_))));
        // pinned entries stay listed and exportable
        assert!(buffer.list()[0].pinned);
        assert_eq!(buffer.export(one).unwrap()["snapshot"]["id"], one);
    }

    #[test]
    fn test_all_pinned_rejects_capture() {
        let mut buffer = SnapshotBuffer::new(2);
        let a = captured_id(buffer.insert(capture("a")).unwrap());
        let b = captured_id(buffer.insert(capture("b")).unwrap());
        buffer.pin(a).unwrap();
        buffer.pin(b).unwrap();

        let err = buffer.insert(capture("c")).unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted { capacity: 2 }));
        assert_eq!(buffer.len(), 2);

        buffer.unpin(a).unwrap();
        captured_id(buffer.insert(capture("c")).unwrap());
        assert!(buffer.get(a).is_err());
    }

    #[test]
    fn test_annotate_and_missing_ids() {
        let mut buffer = SnapshotBuffer::new(2);
        let id = captured_id(buffer.insert(capture("a")).unwrap());
        buffer.annotate(id, "  before refactor ").unwrap();
        assert_eq!(buffer.get(id).unwrap().annotation.as_deref(), Some("before refactor"));
        buffer.annotate(id, "").unwrap();
        assert!(buffer.get(id).unwrap().annotation.is_none());

        assert!(matches!(buffer.pin(99), Err(Error::SnapshotNotFound(99))));
        assert!(matches!(buffer.annotate(99, "x"), Err(Error::SnapshotNotFound(99))));
    }

    #[test]
    fn test_diff_is_pure() {
        let mut buffer = SnapshotBuffer::new(4);
        let mut first = capture("line one\nline two\n");
        first.bundle.queue_state = vec!["run tests".into(), "deploy".into()];
        let a = captured_id(buffer.insert(first).unwrap());
        let mut second = capture("line one\nline 2\n");
        second.bundle.queue_state = vec!["deploy".into(), "tag release".into()];
        let b = captured_id(buffer.insert(second).unwrap());

        let diff = buffer.diff(a, b).unwrap();
        assert!(!diff.identical);
        assert!(diff.terminal.contains("-line two"));
        assert!(diff.terminal.contains("+line 2"));
        assert!(diff.log.is_empty() || !diff.log.contains('+'));
        assert_eq!(diff.queue_added, vec!["tag release"]);
        assert_eq!(diff.queue_removed, vec!["run tests"]);
        assert_eq!(buffer.diff(a, b).unwrap(), diff);

        let same = buffer.diff(a, a).unwrap();
        assert!(same.identical);
        assert!(!same.terminal.contains("+line"));
    }
}
