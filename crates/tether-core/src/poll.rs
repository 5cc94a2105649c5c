//! Cancellable periodic background tasks
//!
//! Polling that only matters while a dashboard is looking (health checks)
//! is started and stopped through an explicit visibility signal instead of
//! running forever.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

type TickFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub struct PeriodicTask {
    name: String,
    interval: Duration,
    tick: TickFn,
    running: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl PeriodicTask {
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            tick: Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(tick()) }),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start ticking; returns false if already running
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, handle)) = running.as_ref() {
            if !handle.is_finished() {
                return false;
            }
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let tick = Arc::clone(&self.tick);
        let interval = self.interval;
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => (tick)().await,
                }
            }
            debug!(task = %name, "Periodic task loop exited");
        });
        *running = Some((stop_tx, handle));
        info!(task = %self.name, interval_ms = self.interval.as_millis() as u64, "Periodic task started");
        true
    }

    /// Stop ticking; returns false if it was not running
    pub fn stop(&self) -> bool {
        let taken = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match taken {
            Some((stop_tx, _handle)) => {
                let _ = stop_tx.send(());
                info!(task = %self.name, "Periodic task stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(_, handle)| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Visibility signal: visible starts polling, hidden stops it
    pub fn set_visible(&self, visible: bool) {
        if visible {
            self.start();
        } else {
            self.stop();
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
