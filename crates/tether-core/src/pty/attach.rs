//! Live pairing of one PTY with one target pane

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{PtyControl, PtySpawner};
use crate::error::{Error, Result};
use crate::relay::{spawn_drain, spawn_tail_task, ByteRing, DrainEvent, DrainHandle, SharedRing, TailDigest};
use crate::target::Target;

/// Drain broadcast depth; receivers further behind than this resync from the ring
const EVENT_CHANNEL_SIZE: usize = 256;

/// Why an attachment was torn down on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    TargetChanged,
    PaneDied,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct AttachSettings {
    pub ring_capacity: usize,
    pub tail_lines: usize,
    pub tail_interval: Duration,
    pub cols: u16,
    pub rows: u16,
}

pub struct PaneAttachment {
    target: Target,
    epoch: u64,
    ring: SharedRing,
    events: broadcast::Sender<DrainEvent>,
    digests: watch::Receiver<Option<TailDigest>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    control: Mutex<Box<dyn PtyControl>>,
    drain: DrainHandle,
    tail_task: JoinHandle<()>,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
}

impl PaneAttachment {
    /// Spawn `program args` in a PTY and start draining it
    pub fn open(
        spawner: &dyn PtySpawner,
        program: &str,
        args: &[String],
        target: Target,
        epoch: u64,
        settings: &AttachSettings,
    ) -> Result<Arc<Self>> {
        let parts = spawner.spawn(program, args, settings.cols, settings.rows)?;

        let ring = ByteRing::shared(settings.ring_capacity);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let drain = spawn_drain(parts.reader, Arc::clone(&ring), events.clone(), target.pane_id.clone());

        let (digest_tx, digests) = watch::channel(None);
        let tail_task = spawn_tail_task(Arc::clone(&ring), settings.tail_lines, settings.tail_interval, digest_tx);

        info!(pane_id = %target.pane_id, epoch, "Pane attached");
        Ok(Arc::new(Self {
            target,
            epoch,
            ring,
            events,
            digests,
            writer: Arc::new(Mutex::new(parts.writer)),
            control: Mutex::new(parts.control),
            drain,
            tail_task,
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        }))
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn ring(&self) -> &SharedRing {
        &self.ring
    }

    pub fn ring_head(&self) -> u64 {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).head()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DrainEvent> {
        self.events.subscribe()
    }

    pub fn digests(&self) -> watch::Receiver<Option<TailDigest>> {
        self.digests.clone()
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.drain.is_running()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write client input to the pane
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Pty(format!("pane {} is detached", self.target.pane_id)));
        }
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
            writer.write_all(&data)?;
            writer.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Pty(e.to_string()))?
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(Error::Pty(format!("invalid size {}x{}", cols, rows)));
        }
        self.control
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resize(cols, rows)
    }

    /// Tear down the pairing. The drain loop sees EOF and reports `Closed`.
    pub fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.close_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
        self.tail_task.abort();
        if let Err(e) = self
            .control
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .kill()
        {
            warn!(pane_id = %self.target.pane_id, error = %e, "Failed to kill PTY client");
        }
        info!(pane_id = %self.target.pane_id, epoch = self.epoch, ?reason, "Pane detached");
    }
}

impl Drop for PaneAttachment {
    fn drop(&mut self) {
        self.close(CloseReason::Shutdown);
    }
}
