//! Relay hub
//!
//! Owns the single live PTY pairing for the active target. The pairing is
//! spawned lazily on the first client attach, replaced on target switch and
//! torn down when the pane disappears. Sessions learn about both through
//! [`HubEvent`]s.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditLog};
use crate::error::Result;
use crate::pty::{AttachSettings, CloseReason, PaneAttachment, PtySpawner};
use crate::target::{ActiveTarget, Target, TargetResolver, TargetState};

const HUB_EVENT_CHANNEL_SIZE: usize = 64;

/// Actor recorded for changes the daemon makes on its own
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// The explicit selection moved; sessions on an older epoch must reconnect
    TargetChanged {
        epoch: u64,
        previous: Option<String>,
        current: Option<String>,
    },
    /// The pane behind the pairing is gone
    PaneDied { pane_id: String },
    /// Panes that existed at the last health pass
    PanesListed { live: Vec<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub active: ActiveTarget,
    pub attached: Option<Target>,
    pub attached_epoch: Option<u64>,
    pub alive: bool,
    pub ring_head: Option<u64>,
    pub connections: usize,
}

pub struct RelayHub {
    resolver: Arc<TargetResolver>,
    state: Arc<TargetState>,
    spawner: Arc<dyn PtySpawner>,
    settings: AttachSettings,
    audit: Arc<AuditLog>,
    current: Mutex<Option<Arc<PaneAttachment>>>,
    events: broadcast::Sender<HubEvent>,
    connections: AtomicUsize,
}

/// Counts a live client connection until dropped
pub struct ConnectionGuard {
    hub: Arc<RelayHub>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RelayHub {
    pub fn new(
        resolver: Arc<TargetResolver>,
        state: Arc<TargetState>,
        spawner: Arc<dyn PtySpawner>,
        settings: AttachSettings,
        audit: Arc<AuditLog>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(HUB_EVENT_CHANNEL_SIZE);
        Arc::new(Self {
            resolver,
            state,
            spawner,
            settings,
            audit,
            current: Mutex::new(None),
            events,
            connections: AtomicUsize::new(0),
        })
    }

    pub fn state(&self) -> &Arc<TargetState> {
        &self.state
    }

    pub fn resolver(&self) -> &Arc<TargetResolver> {
        &self.resolver
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub fn connect(self: &Arc<Self>) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            hub: Arc::clone(self),
        }
    }

    /// Current pairing, spawning one for the resolved target if needed.
    ///
    /// The lock is not held while tmux is queried or the attach client is
    /// spawned. Two racing callers may both spawn; the loser's pairing is
    /// closed and the winner's is shared.
    pub async fn attach(&self) -> Result<Arc<PaneAttachment>> {
        if let Some(existing) = self.live_pairing().await {
            return Ok(existing);
        }

        let (target, epoch) = self.resolver.attach_target(&self.state).await?;
        let (program, args) = self.resolver.multiplexer().attach_command(&target.pane_id);
        let attachment =
            PaneAttachment::open(self.spawner.as_ref(), &program, &args, target, epoch, &self.settings)?;

        let mut current = self.current.lock().await;
        if let Some(existing) = current.as_ref() {
            if existing.is_alive() && existing.epoch() == self.state.epoch() {
                debug!(pane_id = %existing.target().pane_id, "Lost attach race, sharing existing pairing");
                attachment.close(CloseReason::TargetChanged);
                return Ok(Arc::clone(existing));
            }
        }
        if let Err(e) = self.state.check(epoch) {
            attachment.close(CloseReason::TargetChanged);
            return Err(e);
        }
        if let Some(old) = current.take() {
            debug!(pane_id = %old.target().pane_id, "Replacing stale pairing");
            old.close(CloseReason::TargetChanged);
        }
        *current = Some(Arc::clone(&attachment));
        Ok(attachment)
    }

    async fn live_pairing(&self) -> Option<Arc<PaneAttachment>> {
        let epoch = self.state.epoch();
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|a| a.is_alive() && a.epoch() == epoch)
            .map(Arc::clone)
    }

    /// Existing pairing without spawning
    pub async fn current(&self) -> Option<Arc<PaneAttachment>> {
        self.current.lock().await.as_ref().map(Arc::clone)
    }

    /// Explicitly select `pane_id` and force every session to reconnect
    pub async fn select_target(&self, pane_id: &str, actor: &str) -> Result<(Target, u64)> {
        let previous = self.state.selected().map(|t| t.pane_id);
        let (target, epoch) = self.resolver.select(&self.state, pane_id).await?;
        self.audit.record(
            actor,
            AuditAction::SelectTarget,
            Some(pane_id),
            format!("{}:{} epoch={}", target.session_id, target.display_id(), epoch),
        );
        self.switch(epoch, previous, Some(pane_id.to_string())).await;
        Ok((target, epoch))
    }

    /// Drop the explicit selection, falling back to the resolver chain
    pub async fn clear_target(&self, actor: &str) -> Option<u64> {
        let previous = self.state.selected().map(|t| t.pane_id);
        let epoch = self.state.clear()?;
        self.audit
            .record(actor, AuditAction::ClearTarget, previous.as_deref(), format!("epoch={}", epoch));
        self.switch(epoch, previous, None).await;
        Some(epoch)
    }

    async fn switch(&self, epoch: u64, previous: Option<String>, current: Option<String>) {
        info!(epoch, ?previous, ?current, "Active target changed");
        let _ = self.events.send(HubEvent::TargetChanged {
            epoch,
            previous,
            current,
        });
        // a client may already have attached on the new epoch
        let mut pairing = self.current.lock().await;
        if pairing.as_ref().is_some_and(|old| old.epoch() < epoch) {
            if let Some(old) = pairing.take() {
                old.close(CloseReason::TargetChanged);
            }
        }
    }

    /// One health pass. Returns the pane that vanished, if any.
    pub async fn check_health(&self) -> Result<Option<String>> {
        let panes = self.resolver.multiplexer().list_panes().await?;
        let exists = |id: &str| panes.iter().any(|p| p.pane_id == id);
        let _ = self.events.send(HubEvent::PanesListed {
            live: panes.iter().map(|p| p.pane_id.clone()).collect(),
        });

        let mut dead: Option<String> = None;
        if let Some(selected) = self.state.selected() {
            if !exists(&selected.pane_id) {
                if let Some(epoch) = self.state.clear_if(&selected.pane_id) {
                    self.audit.record(
                        SYSTEM_ACTOR,
                        AuditAction::ClearTarget,
                        Some(&selected.pane_id),
                        format!("pane vanished, epoch={}", epoch),
                    );
                }
                dead = Some(selected.pane_id);
            }
        }

        let mut current = self.current.lock().await;
        if let Some(attachment) = current.as_ref() {
            let pane_id = attachment.target().pane_id.clone();
            if !exists(&pane_id) {
                attachment.close(CloseReason::PaneDied);
                current.take();
                dead.get_or_insert(pane_id);
            }
        }
        drop(current);

        if let Some(pane_id) = &dead {
            warn!(%pane_id, "Target pane died");
            let _ = self.events.send(HubEvent::PaneDied {
                pane_id: pane_id.clone(),
            });
        }
        Ok(dead)
    }

    pub async fn status(&self) -> HubStatus {
        let current = self.current().await;
        HubStatus {
            active: self.state.snapshot(),
            attached: current.as_ref().map(|a| a.target().clone()),
            attached_epoch: current.as_ref().map(|a| a.epoch()),
            alive: current.as_ref().map(|a| a.is_alive()).unwrap_or(false),
            ring_head: current.as_ref().map(|a| a.ring_head()),
            connections: self.connections.load(Ordering::SeqCst),
        }
    }

    pub async fn shutdown(&self) {
        if let Some(attachment) = self.current.lock().await.take() {
            attachment.close(CloseReason::Shutdown);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mux::fake::{pane, FakeMux};
    use crate::mux::{Multiplexer, PaneInfo};
    use crate::pty::fake::FakeSpawner;
    use std::collections::HashMap;
    use std::time::Duration;

    pub(crate) fn settings() -> AttachSettings {
        AttachSettings {
            ring_capacity: 64 * 1024,
            tail_lines: 10,
            tail_interval: Duration::from_millis(200),
            cols: 80,
            rows: 24,
        }
    }

    fn setup() -> (Arc<FakeMux>, Arc<FakeSpawner>, Arc<RelayHub>, Arc<AuditLog>) {
        let mux = Arc::new(FakeMux::with_panes(vec![
            pane("work", 0, 0, "%1", "/srv/a"),
            pane("work", 0, 1, "%2", "/srv/b"),
        ]));
        mux.focus("%1");
        let spawner = Arc::new(FakeSpawner::default());
        let resolver = Arc::new(TargetResolver::new(mux.clone(), HashMap::new(), None));
        let audit = AuditLog::new();
        let hub = RelayHub::new(resolver, TargetState::new(), spawner.clone(), settings(), audit.clone());
        (mux, spawner, hub, audit)
    }

    #[tokio::test]
    async fn test_lazy_attach_is_shared() {
        let (_mux, spawner, hub, _) = setup();
        assert!(hub.current().await.is_none());

        let a = hub.attach().await.unwrap();
        let b = hub.attach().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.target().pane_id, "%1");
        assert_eq!(spawner.spawned.lock().unwrap().len(), 1);
        assert_eq!(spawner.spawned.lock().unwrap()[0], vec!["%1".to_string()]);

        hub.shutdown().await;
        spawner.close_all();
    }

    #[tokio::test]
    async fn test_select_target_replaces_pairing() {
        let (_mux, spawner, hub, audit) = setup();
        let first = hub.attach().await.unwrap();
        let mut events = hub.subscribe();

        let (target, epoch) = hub.select_target("%2", "10.0.0.5").await.unwrap();
        assert_eq!(target.pane_id, "%2");
        assert_eq!(epoch, 1);
        assert_eq!(first.close_reason(), Some(CloseReason::TargetChanged));
        assert_eq!(
            events.recv().await.unwrap(),
            HubEvent::TargetChanged {
                epoch: 1,
                previous: None,
                current: Some("%2".into())
            }
        );
        assert_eq!(audit.recent(1)[0].action, AuditAction::SelectTarget);

        let second = hub.attach().await.unwrap();
        assert_eq!(second.target().pane_id, "%2");
        assert_eq!(second.epoch(), 1);

        hub.shutdown().await;
        spawner.close_all();
    }

    #[tokio::test]
    async fn test_health_detects_vanished_pane() {
        let (mux, spawner, hub, _) = setup();
        hub.select_target("%2", "10.0.0.5").await.unwrap();
        let attachment = hub.attach().await.unwrap();
        let mut events = hub.subscribe();

        assert_eq!(hub.check_health().await.unwrap(), None);

        mux.remove("%2");
        assert_eq!(hub.check_health().await.unwrap(), Some("%2".to_string()));
        assert!(hub.state().selected().is_none());
        assert_eq!(hub.state().epoch(), 2);
        assert_eq!(attachment.close_reason(), Some(CloseReason::PaneDied));
        assert_eq!(
            events.recv().await.unwrap(),
            HubEvent::PanesListed {
                live: vec!["%1".into(), "%2".into()]
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            HubEvent::PanesListed {
                live: vec!["%1".into()]
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            HubEvent::PaneDied {
                pane_id: "%2".into()
            }
        );
        assert!(hub.status().await.attached.is_none());

        spawner.close_all();
    }

    #[tokio::test]
    async fn test_health_releases_pins_on_unselected_panes() {
        use crate::correlate::fake::FakeLogStore;
        use crate::correlate::{spawn_hub_listener, LogCorrelator};
        use crate::process::fake::FakeProcessTable;

        let (mux, spawner, hub, _) = setup();
        let correlator = Arc::new(LogCorrelator::new(
            mux.clone(),
            Arc::new(FakeProcessTable::with(Vec::new())),
            Arc::new(FakeLogStore::default()),
            5,
            60,
        ));
        let listener = spawn_hub_listener(correlator.clone(), hub.subscribe());

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("side.jsonl");
        std::fs::write(&log, "{}\n").unwrap();
        hub.select_target("%1", "10.0.0.5").await.unwrap();
        correlator.select_manual("%2", &log).await.unwrap();

        mux.remove("%2");
        // %2 was never selected or attached
        assert_eq!(hub.check_health().await.unwrap(), None);

        let released = async {
            while correlator.mapping("%2").is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), released)
            .await
            .expect("pin on a destroyed pane was kept");

        listener.abort();
        spawner.close_all();
    }

    /// Multiplexer whose pane listing takes a while
    struct SlowMux {
        inner: FakeMux,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Multiplexer for SlowMux {
        async fn list_panes(&self) -> Result<Vec<PaneInfo>> {
            tokio::time::sleep(self.delay).await;
            self.inner.list_panes().await
        }

        async fn capture_pane(&self, pane_id: &str, lines: usize) -> Result<String> {
            self.inner.capture_pane(pane_id, lines).await
        }

        fn attach_command(&self, pane_id: &str) -> (String, Vec<String>) {
            self.inner.attach_command(pane_id)
        }
    }

    #[tokio::test]
    async fn test_status_not_blocked_by_slow_attach() {
        let inner = FakeMux::with_panes(vec![pane("work", 0, 0, "%1", "/srv/a")]);
        inner.focus("%1");
        let mux = Arc::new(SlowMux {
            inner,
            delay: Duration::from_millis(800),
        });
        let spawner = Arc::new(FakeSpawner::default());
        let resolver = Arc::new(TargetResolver::new(mux, HashMap::new(), None));
        let hub = RelayHub::new(resolver, TargetState::new(), spawner.clone(), settings(), AuditLog::new());

        let attaching = tokio::spawn({
            let hub = hub.clone();
            async move { hub.attach().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        let status = hub.status().await;
        assert!(
            started.elapsed() < Duration::from_millis(200),
            "status waited {:?}",
            started.elapsed()
        );
        assert!(status.attached.is_none());

        let attachment = attaching.await.unwrap().unwrap();
        assert_eq!(attachment.target().pane_id, "%1");
        hub.shutdown().await;
        spawner.close_all();
    }

    #[tokio::test]
    async fn test_switch_keeps_pairing_on_new_epoch() {
        let (mux, spawner, hub, _) = setup();
        let panes = mux.list_panes().await.unwrap();
        let epoch = hub.state().select(Target::from_pane(&panes[1]));

        // a client attached between the epoch bump and the switch
        let fresh = hub.attach().await.unwrap();
        assert_eq!(fresh.epoch(), epoch);
        hub.switch(epoch, Some("%1".into()), Some("%2".into())).await;

        assert_eq!(fresh.close_reason(), None);
        assert!(Arc::ptr_eq(&hub.current().await.unwrap(), &fresh));

        hub.shutdown().await;
        spawner.close_all();
    }

    #[tokio::test]
    async fn test_connection_count() {
        let (_mux, _spawner, hub, _) = setup();
        let g1 = hub.connect();
        let g2 = hub.connect();
        assert_eq!(hub.status().await.connections, 2);
        drop(g1);
        drop(g2);
        assert_eq!(hub.status().await.connections, 0);
    }
}
