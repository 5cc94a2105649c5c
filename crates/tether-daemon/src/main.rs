//! tetherd - terminal relay daemon
//!
//! Responsibilities:
//! - Resolve the active tmux pane and relay its output over WebSocket
//! - Keep log correlation and the snapshot ring buffer current
//! - Expose the REST control API for dashboards and other collaborators

mod api;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};

use tether_core::config::default_home;
use tether_core::correlate::spawn_hub_listener;
use tether_core::pty::AttachSettings;
use tether_core::snapshot::{spawn_boundary_watcher, CaptureOutcome, CaptureTrigger, SnapshotSettings};
use tether_core::{
    AuditLog, ClaudeLogStore, Error, LogCorrelator, Multiplexer, NativePtySpawner, PeriodicTask, PreviewGate,
    PsProcessTable, RelayConfig, RelayHub, RelayServer, RelayServerOptions, SnapshotService, TargetResolver,
    TargetState, TmuxClient,
};

use crate::api::AppState;

#[derive(Debug, Parser)]
#[command(name = "tetherd", version, about = "Terminal relay daemon")]
struct Args {
    /// Config file (default: <home>/config.yaml)
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket relay port
    #[arg(long)]
    ws_port: Option<u16>,

    /// REST API port
    #[arg(long)]
    http_port: Option<u16>,

    /// Bind address for both listeners
    #[arg(long)]
    bind: Option<String>,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("TETHER_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

/// CLI beats env beats file beats defaults
fn load_config(args: &Args, home: &std::path::Path) -> RelayConfig {
    let path = args.config.clone().unwrap_or_else(|| home.join("config.yaml"));
    let mut config = RelayConfig::load_or_default(&path);
    config.apply_env();
    if let Some(port) = args.ws_port {
        config.ws_port = port;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(bind) = &args.bind {
        config.bind_host = bind.clone();
    }
    debug!(path = %path.display(), "Configuration resolved");
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let home = default_home();
    std::fs::create_dir_all(&home).ok();

    // Dual-layer logging: stderr + file (daily rotation)
    let log_dir = home.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tetherd.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {}: {}", location, payload);
        tracing::error!(location = %location, "DAEMON PANIC: {}", payload);
    }));

    let config = load_config(&args, &home);
    let retry = config.retry_policy();

    // Collaborators
    let mux: Arc<dyn Multiplexer> = Arc::new(TmuxClient::new(config.tmux_bin.clone(), retry.clone()));
    let processes = Arc::new(PsProcessTable::new(retry));
    let claude_home = config.claude_home();
    let store = Arc::new(ClaudeLogStore::new(&claude_home));

    // Target resolution + relay hub
    let resolver = Arc::new(TargetResolver::new(
        Arc::clone(&mux),
        config.session_dirs.clone(),
        config.default_project_root.clone(),
    ));
    let state = TargetState::new();
    let audit = AuditLog::new();
    let hub = RelayHub::new(
        Arc::clone(&resolver),
        Arc::clone(&state),
        Arc::new(NativePtySpawner),
        AttachSettings {
            ring_capacity: config.ring_capacity,
            tail_lines: config.tail_lines,
            tail_interval: config.tail_interval(),
            cols: config.pty_cols,
            rows: config.pty_rows,
        },
        Arc::clone(&audit),
    );

    // Log correlation follows target switches and pane deaths
    let correlator = Arc::new(LogCorrelator::new(
        Arc::clone(&mux),
        processes,
        store,
        config.debug_tolerance_secs,
        config.first_entry_tolerance_secs,
    ));
    let hub_listener = spawn_hub_listener(Arc::clone(&correlator), hub.subscribe());

    let preview = Arc::new(PreviewGate::new());
    let snapshots = Arc::new(SnapshotService::new(
        Arc::clone(&resolver),
        Arc::clone(&state),
        Arc::clone(&correlator),
        Arc::new(tether_core::snapshot::PendingQueue::new()),
        Arc::clone(&preview),
        SnapshotSettings {
            capacity: config.snapshot_capacity,
            log_lines: config.snapshot_log_lines,
            terminal_lines: config.snapshot_terminal_lines,
        },
    ));

    // Health poller: started here, then driven by dashboard visibility
    let health_poller = Arc::new(PeriodicTask::new("health", config.health_interval(), {
        let hub = Arc::clone(&hub);
        move || {
            let hub = Arc::clone(&hub);
            async move {
                match hub.check_health().await {
                    Ok(Some(pane_id)) => info!(%pane_id, "Health check cleared a dead pane"),
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "Health check failed"),
                }
            }
        }
    }));
    health_poller.start();

    let periodic_snapshots = PeriodicTask::new(
        "snapshot",
        Duration::from_secs(config.snapshot_interval_secs.max(1)),
        {
            let snapshots = Arc::clone(&snapshots);
            move || {
                let snapshots = Arc::clone(&snapshots);
                async move {
                    match snapshots.capture(CaptureTrigger::Periodic, None, None).await {
                        Ok(CaptureOutcome::Captured(s)) => debug!(id = s.id, "Periodic snapshot stored"),
                        Ok(CaptureOutcome::Unchanged { .. }) => {}
                        Err(Error::NoTarget(_)) => {}
                        Err(e) => warn!(error = %e, "Periodic snapshot failed"),
                    }
                }
            }
        },
    );
    if config.snapshot_interval_secs > 0 {
        periodic_snapshots.start();
    }

    let boundary_watcher = spawn_boundary_watcher(
        Arc::clone(&snapshots),
        Some(claude_home.join("projects")),
        Duration::from_millis(config.boundary_poll_ms),
    );

    // WebSocket relay
    let mut ws_server = RelayServer::new(RelayServerOptions::from_config(
        &config,
        Arc::clone(&hub),
        Arc::clone(&preview),
        Arc::clone(&audit),
    ));
    let ws_addr = ws_server.start().await.context("failed to start relay WebSocket server")?;

    // REST API
    let app = api::router(AppState {
        hub: Arc::clone(&hub),
        correlator,
        snapshots,
        audit,
        health_poller: Arc::clone(&health_poller),
    });
    let http_addr = format!("{}:{}", config.bind_host, config.http_port);
    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind REST API on {}", http_addr))?;
    info!(%ws_addr, http_addr = %listener.local_addr()?, "tetherd ready");

    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await;
    if let Err(e) = &served {
        error!(error = %e, "REST API server failed");
    }

    ws_server.stop().await;
    health_poller.stop();
    periodic_snapshots.stop();
    boundary_watcher.abort();
    hub_listener.abort();
    hub.shutdown().await;
    info!("tetherd stopped");

    served.map_err(Into::into)
}
