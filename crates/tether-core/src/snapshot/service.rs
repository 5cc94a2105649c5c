//! Snapshot capture
//!
//! Composes bundles from the live target and feeds them into the buffer.
//! A capture captures the target epoch first and is discarded if the target
//! switched before it could be stored.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{
    CaptureOutcome, CaptureTrigger, NewSnapshot, PendingQueue, PreviewGate, SnapshotBuffer, SnapshotBundle,
};
use crate::agent::AgentDriver;
use crate::correlate::LogCorrelator;
use crate::error::{Error, Result};
use crate::relay::strip_ansi;
use crate::target::{Target, TargetResolver, TargetState};

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub capacity: usize,
    pub log_lines: usize,
    pub terminal_lines: usize,
}

/// Read position in the log being watched for turn boundaries
#[derive(Debug, Default)]
struct BoundaryCursor {
    log_path: Option<PathBuf>,
    offset: u64,
}

pub struct SnapshotService {
    buffer: Mutex<SnapshotBuffer>,
    resolver: Arc<TargetResolver>,
    state: Arc<TargetState>,
    correlator: Arc<LogCorrelator>,
    queue: Arc<PendingQueue>,
    preview: Arc<PreviewGate>,
    settings: SnapshotSettings,
    cursor: tokio::sync::Mutex<BoundaryCursor>,
}

impl SnapshotService {
    pub fn new(
        resolver: Arc<TargetResolver>,
        state: Arc<TargetState>,
        correlator: Arc<LogCorrelator>,
        queue: Arc<PendingQueue>,
        preview: Arc<PreviewGate>,
        settings: SnapshotSettings,
    ) -> Self {
        Self {
            buffer: Mutex::new(SnapshotBuffer::new(settings.capacity)),
            resolver,
            state,
            correlator,
            queue,
            preview,
            settings,
            cursor: tokio::sync::Mutex::new(BoundaryCursor::default()),
        }
    }

    /// Run `f` against the buffer
    pub fn with_buffer<T>(&self, f: impl FnOnce(&mut SnapshotBuffer) -> T) -> T {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut buffer)
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    pub fn preview(&self) -> &Arc<PreviewGate> {
        &self.preview
    }

    /// Enter preview of a stored snapshot
    pub fn enter_preview(&self, id: u64) -> Result<super::PreviewState> {
        self.with_buffer(|b| b.get(id).map(|_| ()))?;
        Ok(self.preview.enter(id))
    }

    async fn log_excerpt(&self, target: &Target) -> Vec<String> {
        let mapping = match self.correlator.correlate(target).await {
            Ok(mapping) => mapping,
            Err(Error::NoLogCandidate(_)) => return Vec::new(),
            Err(e) => {
                warn!(pane_id = %target.pane_id, error = %e, "Log correlation failed during capture");
                return Vec::new();
            }
        };
        match self
            .correlator
            .store()
            .read_tail(&mapping.log_path, self.settings.log_lines)
            .await
        {
            Ok(lines) => lines,
            Err(e) => {
                warn!(log = %mapping.log_path.display(), error = %e, "Cannot read log tail");
                Vec::new()
            }
        }
    }

    /// Capture the current target. With `pane_id`, the capture is refused
    /// unless that pane is the resolved one.
    pub async fn capture(
        &self,
        trigger: CaptureTrigger,
        label: Option<String>,
        pane_id: Option<&str>,
    ) -> Result<CaptureOutcome> {
        let (target, epoch) = match pane_id {
            Some(pane_id) => self.resolver.require_current(&self.state, pane_id).await?,
            None => self.resolver.attach_target(&self.state).await?,
        };

        let log_excerpt = self.log_excerpt(&target).await;
        let screen = self
            .resolver
            .multiplexer()
            .capture_pane(&target.pane_id, self.settings.terminal_lines)
            .await?;
        let bundle = SnapshotBundle {
            log_excerpt,
            terminal_text: strip_ansi(&screen),
            queue_state: self.queue.pending(),
        };

        // Discard if the target switched while we were reading
        self.state.check(epoch)?;
        self.with_buffer(|buffer| {
            buffer.insert(NewSnapshot {
                trigger,
                label,
                pane_id: Some(target.pane_id.clone()),
                epoch,
                bundle,
            })
        })
    }

    /// Scan log lines appended since the last pass; capture if one closes a turn
    pub async fn check_turn_boundary(&self) -> Result<Option<CaptureOutcome>> {
        let target = match self.resolver.attach_target(&self.state).await {
            Ok((target, _)) => target,
            Err(Error::NoTarget(_)) | Err(Error::StaleTarget { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mapping = match self.correlator.correlate(&target).await {
            Ok(mapping) => mapping,
            Err(Error::NoLogCandidate(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let store = self.correlator.store();
        let mut cursor = self.cursor.lock().await;
        if cursor.log_path.as_ref() != Some(&mapping.log_path) {
            // New log: start at its end, history is not a fresh boundary
            let (_, end) = store.read_lines_since(&mapping.log_path, 0).await?;
            debug!(log = %mapping.log_path.display(), offset = end, "Watching log for turn boundaries");
            cursor.log_path = Some(mapping.log_path.clone());
            cursor.offset = end;
            return Ok(None);
        }

        let (lines, next) = store.read_lines_since(&mapping.log_path, cursor.offset).await?;
        cursor.offset = next;
        drop(cursor);

        let driver = store.agent();
        let boundary = lines
            .iter()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .any(|entry| driver.is_turn_boundary(&entry));
        if !boundary {
            return Ok(None);
        }

        info!(pane_id = %target.pane_id, "Turn boundary detected");
        self.capture(CaptureTrigger::TurnBoundary, None, Some(&target.pane_id))
            .await
            .map(Some)
    }
}

/// Watch `watch_dir` for log writes and check for turn boundaries on every
/// change, with `poll` as a fallback when events are missed or unavailable.
pub fn spawn_boundary_watcher(
    service: Arc<SnapshotService>,
    watch_dir: Option<PathBuf>,
    poll: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (event_tx, mut event_rx) = mpsc::channel::<()>(1);

        let _watcher = watch_dir.and_then(|dir| {
            let tx = event_tx.clone();
            let watcher = RecommendedWatcher::new(
                move |res: std::result::Result<Event, notify::Error>| {
                    if res.is_ok() {
                        // a full channel already has a pending wakeup
                        let _ = tx.try_send(());
                    }
                },
                Config::default(),
            );
            match watcher {
                Ok(mut w) => match w.watch(&dir, RecursiveMode::Recursive) {
                    Ok(()) => {
                        info!(dir = %dir.display(), "Watching logs for turn boundaries");
                        Some(w)
                    }
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "Cannot watch log directory, polling only");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "File watcher unavailable, polling only");
                    None
                }
            }
        });

        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                event = event_rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                }
            }
            match service.check_turn_boundary().await {
                Ok(Some(CaptureOutcome::Captured(snapshot))) => {
                    debug!(id = snapshot.id, "Turn-boundary snapshot stored");
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Turn-boundary check failed"),
            }
        }
    })
}
