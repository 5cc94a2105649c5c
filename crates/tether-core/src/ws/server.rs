//! WebSocket relay server
//!
//! One route: `ws://host:port/relay[?mode=tail|full]`. Each connection is
//! a [`ConnectionSession`] bound to the hub's current pairing and epoch.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{Request as WsRequest, Response as WsResponse};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditAction, AuditLog};
use crate::config::RelayConfig;
use crate::error::Error;
use crate::hub::{HubEvent, RelayHub};
use crate::pty::{CloseReason, PaneAttachment};
use crate::relay::{DrainEvent, Outbound, RelayMode};
use crate::session::{
    parse_client_message, ClientMessage, ConnectionPhase, ConnectionSession, ServerMessage, CLOSE_ABNORMAL,
    CLOSE_GOING_AWAY, CLOSE_IDLE, CLOSE_INVALID_ROUTE, CLOSE_NO_TARGET, CLOSE_PANE_DIED, CLOSE_TARGET_CHANGED,
};
use crate::snapshot::PreviewGate;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Close reasons must fit a control frame
const MAX_CLOSE_REASON: usize = 120;

pub struct RelayServerOptions {
    pub bind_host: String,
    pub port: u16,
    pub hello_timeout: Duration,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub catchup_bytes: usize,
    pub hub: Arc<RelayHub>,
    pub preview: Arc<PreviewGate>,
    pub audit: Arc<AuditLog>,
}

impl RelayServerOptions {
    pub fn from_config(
        config: &RelayConfig,
        hub: Arc<RelayHub>,
        preview: Arc<PreviewGate>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            bind_host: config.bind_host.clone(),
            port: config.ws_port,
            hello_timeout: config.hello_timeout(),
            ping_interval: config.ping_interval(),
            idle_timeout: config.idle_timeout(),
            catchup_bytes: config.catchup_bytes,
            hub,
            preview,
            audit,
        }
    }
}

pub struct RelayServer {
    options: Arc<RelayServerOptions>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Relay { mode: RelayMode },
    Invalid,
}

fn parse_route(path: &str, query: Option<&str>) -> Route {
    if path != "/relay" {
        return Route::Invalid;
    }
    let mut mode = RelayMode::Full;
    for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
        if let Some(value) = pair.strip_prefix("mode=") {
            match value.parse() {
                Ok(m) => mode = m,
                Err(_) => return Route::Invalid,
            }
        }
    }
    Route::Relay { mode }
}

fn close_frame(code: u16, reason: impl Into<String>) -> CloseFrame<'static> {
    let mut reason: String = reason.into();
    if reason.len() > MAX_CLOSE_REASON {
        let mut cut = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }
}

async fn send_json(ws_tx: &mut WsSink, msg: &ServerMessage) -> anyhow::Result<()> {
    let text = serde_json::to_string(msg)?;
    ws_tx.send(Message::Text(text)).await?;
    Ok(())
}

async fn send_close(ws_tx: &mut WsSink, code: u16, reason: impl Into<String>) {
    let _ = ws_tx.send(Message::Close(Some(close_frame(code, reason)))).await;
}

/// How a session loop ended
enum Exit {
    Close(u16, String),
    Disconnected,
}

impl RelayServer {
    pub fn new(options: RelayServerOptions) -> Self {
        Self {
            options: Arc::new(options),
            shutdown_tx: None,
        }
    }

    /// Bind and start accepting; returns the bound address
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.options.bind_host, self.options.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        info!(%local_addr, "Relay WebSocket server started");

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        let options = Arc::clone(&self.options);

        tokio::spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let options = Arc::clone(&options);
                                let conn_shutdown = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    if let Err(e) = Self::handle_connection(stream, addr, options, conn_shutdown).await {
                                        error!(?e, ?addr, "WebSocket connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(?e, "Failed to accept connection");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Relay WebSocket server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every session
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        info!("Relay WebSocket server stopped");
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        options: Arc<RelayServerOptions>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        // Capture path and query from the handshake
        let uri_cell = Arc::new(StdMutex::new((String::new(), None::<String>)));
        let uri_cell2 = Arc::clone(&uri_cell);

        let ws_stream = accept_hdr_async(stream, move |req: &WsRequest, resp: WsResponse| {
            if let Ok(mut uri) = uri_cell2.lock() {
                *uri = (req.uri().path().to_string(), req.uri().query().map(str::to_string));
            }
            Ok(resp)
        })
        .await?;

        let (path, query) = uri_cell
            .lock()
            .map(|u| u.clone())
            .unwrap_or_else(|_| ("/".to_string(), None));

        match parse_route(&path, query.as_deref()) {
            Route::Relay { mode } => Self::handle_relay(addr, ws_stream, options, mode, shutdown_rx).await,
            Route::Invalid => {
                let (mut ws_tx, _ws_rx) = ws_stream.split();
                send_close(&mut ws_tx, CLOSE_INVALID_ROUTE, "Invalid URL. Use /relay?mode=full|tail").await;
                warn!(?addr, %path, "Invalid WebSocket URL");
                Ok(())
            }
        }
    }

    async fn handle_relay(
        addr: SocketAddr,
        ws_stream: WebSocketStream<TcpStream>,
        options: Arc<RelayServerOptions>,
        mode: RelayMode,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut session = ConnectionSession::new(mode, options.catchup_bytes);
        session.advance(ConnectionPhase::Handshaking);
        let _guard = options.hub.connect();

        let attachment = match timeout(options.hello_timeout, options.hub.attach()).await {
            Ok(Ok(attachment)) => attachment,
            Ok(Err(e)) => {
                let code = match e {
                    Error::NoTarget(_) | Error::StaleTarget { .. } => CLOSE_NO_TARGET,
                    Error::EpochChanged { .. } => CLOSE_TARGET_CHANGED,
                    _ => CLOSE_ABNORMAL,
                };
                warn!(?addr, error = %e, code, "Cannot attach relay session");
                send_close(&mut ws_tx, code, e.to_string()).await;
                return Ok(());
            }
            Err(_) => {
                warn!(?addr, "Attach exceeded hello budget");
                send_close(&mut ws_tx, CLOSE_ABNORMAL, "attach timed out").await;
                return Ok(());
            }
        };
        session.bind_epoch(attachment.epoch());

        // Subscribe before reading the ring so no chunk falls in between
        let mut drain_rx = attachment.subscribe();
        let mut digest_rx = attachment.digests();
        let mut hub_rx = options.hub.subscribe();

        let hello = ServerMessage::Hello {
            session_id: session.id.clone(),
            mode,
            epoch: attachment.epoch(),
            target: attachment.target().clone(),
            ring_head: attachment.ring_head(),
            server_time: chrono::Utc::now(),
        };
        send_json(&mut ws_tx, &hello).await?;
        session.next_sequence();
        session.advance(ConnectionPhase::Active);
        info!(?addr, session = %session.id, pane_id = %attachment.target().pane_id, ?mode, "Client attached to relay");

        let initial = {
            let ring = attachment.ring().lock().unwrap_or_else(|e| e.into_inner());
            session.router().on_attach(&ring)
        };
        if let Some(out) = initial {
            Self::send_outbound(&mut ws_tx, &mut session, out).await?;
        }
        if mode == RelayMode::Tail {
            let current = digest_rx.borrow_and_update().clone();
            if let Some(out) = current.and_then(|d| session.router().on_digest(&d)) {
                Self::send_outbound(&mut ws_tx, &mut session, out).await?;
            }
        }

        let mut ticker = interval_at(Instant::now() + options.ping_interval, options.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut digests_open = true;

        let exit = loop {
            tokio::select! {
                // PTY -> client (full)
                evt = drain_rx.recv() => {
                    let out = match evt {
                        Ok(DrainEvent::Data(chunk)) => {
                            let ring = attachment.ring().lock().unwrap_or_else(|e| e.into_inner());
                            session.router().on_chunk(&chunk, &ring)
                        }
                        Ok(DrainEvent::Closed { reason }) => {
                            let code = match attachment.close_reason() {
                                Some(CloseReason::TargetChanged) => CLOSE_TARGET_CHANGED,
                                Some(CloseReason::Shutdown) => CLOSE_GOING_AWAY,
                                Some(CloseReason::PaneDied) | None => CLOSE_PANE_DIED,
                            };
                            break Exit::Close(code, format!("pane output closed: {}", reason));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(?addr, skipped, "Relay receiver lagged, resyncing from ring");
                            let ring = attachment.ring().lock().unwrap_or_else(|e| e.into_inner());
                            session.router().resync(&ring)
                        }
                        Err(RecvError::Closed) => {
                            break Exit::Close(CLOSE_PANE_DIED, "pane output closed".to_string());
                        }
                    };
                    if let Some(out) = out {
                        if Self::send_outbound(&mut ws_tx, &mut session, out).await.is_err() {
                            break Exit::Disconnected;
                        }
                    }
                }

                // PTY -> client (tail)
                changed = digest_rx.changed(), if digests_open => {
                    match changed {
                        Ok(()) => {
                            let digest = digest_rx.borrow_and_update().clone();
                            if let Some(out) = digest.and_then(|d| session.router().on_digest(&d)) {
                                if Self::send_outbound(&mut ws_tx, &mut session, out).await.is_err() {
                                    break Exit::Disconnected;
                                }
                            }
                        }
                        Err(_) => digests_open = false,
                    }
                }

                evt = hub_rx.recv() => {
                    match evt {
                        Ok(HubEvent::TargetChanged { epoch, .. }) if epoch != session.epoch() => {
                            break Exit::Close(CLOSE_TARGET_CHANGED, format!("target changed (epoch {})", epoch));
                        }
                        Ok(HubEvent::PaneDied { pane_id }) if pane_id == attachment.target().pane_id => {
                            break Exit::Close(CLOSE_PANE_DIED, format!("pane {} died", pane_id));
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => {
                            break Exit::Close(CLOSE_ABNORMAL, "relay hub closed".to_string());
                        }
                    }
                }

                // client -> PTY
                msg = ws_rx.next() => {
                    let handled = match msg {
                        Some(Ok(Message::Text(text))) => {
                            session.touch();
                            match parse_client_message(&text) {
                                Some(msg) => Self::handle_client_message(addr, &options, &attachment, &mut session, &mut ws_tx, msg).await,
                                None => {
                                    warn!(?addr, session = %session.id, "Malformed client message skipped");
                                    Ok(None)
                                }
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            session.touch();
                            Self::handle_input(addr, &options, &attachment, &mut session, &mut ws_tx, data).await
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            session.touch();
                            Ok(None)
                        }
                        Some(Ok(Message::Close(_))) | None => Ok(Some(Exit::Disconnected)),
                        Some(Ok(Message::Frame(_))) => Ok(None),
                        Some(Err(e)) => {
                            warn!(?addr, error = %e, "WebSocket error");
                            Ok(Some(Exit::Disconnected))
                        }
                    };
                    match handled {
                        Ok(Some(exit)) => break exit,
                        Ok(None) => {}
                        Err(_) => break Exit::Disconnected,
                    }
                }

                _ = ticker.tick() => {
                    Self::flush_input(addr, &options, &attachment, &mut session);
                    if session.idle_for() >= options.idle_timeout {
                        break Exit::Close(CLOSE_IDLE, "idle, please reconnect".to_string());
                    }
                    let ping = ServerMessage::Ping { ts: chrono::Utc::now().timestamp_millis() };
                    if send_json(&mut ws_tx, &ping).await.is_err() {
                        break Exit::Disconnected;
                    }
                    session.next_sequence();
                }

                _ = shutdown_rx.recv() => {
                    break Exit::Close(CLOSE_GOING_AWAY, "server shutting down".to_string());
                }
            }
        };

        session.advance(ConnectionPhase::Closing);
        Self::flush_input(addr, &options, &attachment, &mut session);
        match exit {
            Exit::Close(code, reason) => {
                info!(?addr, session = %session.id, code, %reason, "Closing relay session");
                send_close(&mut ws_tx, code, reason).await;
            }
            Exit::Disconnected => {
                info!(?addr, session = %session.id, sent = session.sent(), "Client disconnected from relay");
            }
        }
        session.advance(ConnectionPhase::Closed);
        Ok(())
    }

    async fn send_outbound(ws_tx: &mut WsSink, session: &mut ConnectionSession, out: Outbound) -> anyhow::Result<()> {
        match out {
            Outbound::Raw { data, .. } => {
                ws_tx.send(Message::Binary(data)).await?;
            }
            Outbound::CatchUp { offset, data } => {
                send_json(ws_tx, &ServerMessage::CatchUp { offset, len: data.len() }).await?;
                session.next_sequence();
                ws_tx.send(Message::Binary(data)).await?;
            }
            Outbound::Tail(digest) => {
                send_json(
                    ws_tx,
                    &ServerMessage::Tail {
                        text: digest.text,
                        seq: digest.seq,
                    },
                )
                .await?;
            }
        }
        session.next_sequence();
        Ok(())
    }

    async fn handle_client_message(
        addr: SocketAddr,
        options: &RelayServerOptions,
        attachment: &PaneAttachment,
        session: &mut ConnectionSession,
        ws_tx: &mut WsSink,
        msg: ClientMessage,
    ) -> anyhow::Result<Option<Exit>> {
        match msg {
            ClientMessage::Input { data } => {
                return Self::handle_input(addr, options, attachment, session, ws_tx, data.into_bytes()).await;
            }
            ClientMessage::Resize { cols, rows } => {
                if let Err(e) = options.preview.ensure_writable() {
                    send_json(ws_tx, &ServerMessage::notice(e.kind(), e.to_string())).await?;
                    return Ok(None);
                }
                match attachment.resize(cols, rows) {
                    Ok(()) => options.audit.record(
                        addr.ip().to_string(),
                        AuditAction::Resize,
                        Some(&attachment.target().pane_id),
                        format!("{}x{}", cols, rows),
                    ),
                    Err(e) => {
                        warn!(?addr, error = %e, "Resize failed");
                        send_json(ws_tx, &ServerMessage::notice(e.kind(), e.to_string())).await?;
                    }
                }
            }
            ClientMessage::SetMode { mode } => {
                let out = {
                    let ring = attachment.ring().lock().unwrap_or_else(|e| e.into_inner());
                    session.router().set_mode(mode, &ring)
                };
                debug!(?addr, session = %session.id, ?mode, "Mode changed");
                if let Some(out) = out {
                    Self::send_outbound(ws_tx, session, out).await?;
                }
                if mode == RelayMode::Tail {
                    let current = attachment.digests().borrow().clone();
                    if let Some(out) = current.and_then(|d| session.router().on_digest(&d)) {
                        Self::send_outbound(ws_tx, session, out).await?;
                    }
                }
            }
            ClientMessage::Ping { ts } => {
                send_json(ws_tx, &ServerMessage::Pong { ts }).await?;
                session.next_sequence();
            }
            ClientMessage::Pong { .. } => {}
        }
        Ok(None)
    }

    /// Input is dropped while previewing and when the epoch moved under it
    async fn handle_input(
        addr: SocketAddr,
        options: &RelayServerOptions,
        attachment: &PaneAttachment,
        session: &mut ConnectionSession,
        ws_tx: &mut WsSink,
        data: Vec<u8>,
    ) -> anyhow::Result<Option<Exit>> {
        if let Err(e) = options.preview.ensure_writable() {
            send_json(ws_tx, &ServerMessage::notice(e.kind(), e.to_string())).await?;
            return Ok(None);
        }
        if let Err(e) = options.hub.state().check(session.epoch()) {
            send_json(ws_tx, &ServerMessage::notice(e.kind(), e.to_string())).await?;
            return Ok(Some(Exit::Close(CLOSE_TARGET_CHANGED, e.to_string())));
        }
        let len = data.len();
        if let Err(e) = attachment.write(data).await {
            warn!(?addr, error = %e, "PTY write failed");
            send_json(ws_tx, &ServerMessage::notice(e.kind(), e.to_string())).await?;
            return Ok(None);
        }
        session.note_input(len);
        Ok(None)
    }

    /// One audit entry per burst of input, not per frame
    fn flush_input(
        addr: SocketAddr,
        options: &RelayServerOptions,
        attachment: &PaneAttachment,
        session: &mut ConnectionSession,
    ) {
        if let Some(tally) = session.take_input() {
            options.audit.record(
                addr.ip().to_string(),
                AuditAction::Input,
                Some(&attachment.target().pane_id),
                format!("{} bytes in {} writes", tally.bytes, tally.writes),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::settings;
    use crate::mux::fake::{pane, FakeMux};
    use crate::pty::fake::FakeSpawner;
    use crate::target::{TargetResolver, TargetState};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Harness {
        addr: SocketAddr,
        server: RelayServer,
        hub: Arc<RelayHub>,
        spawner: Arc<FakeSpawner>,
        preview: Arc<PreviewGate>,
        audit: Arc<AuditLog>,
    }

    impl Harness {
        async fn start(panes: Vec<crate::mux::PaneInfo>, ping: Duration, idle: Duration) -> Self {
            let mux = Arc::new(FakeMux::with_panes(panes));
            mux.focus("%1");
            let spawner = Arc::new(FakeSpawner::default());
            let resolver = Arc::new(TargetResolver::new(mux, HashMap::new(), None));
            let audit = AuditLog::new();
            let hub = RelayHub::new(resolver, TargetState::new(), spawner.clone(), settings(), audit.clone());
            let preview = Arc::new(PreviewGate::new());
            let mut server = RelayServer::new(RelayServerOptions {
                bind_host: "127.0.0.1".into(),
                port: 0,
                hello_timeout: Duration::from_secs(2),
                ping_interval: ping,
                idle_timeout: idle,
                catchup_bytes: 16 * 1024,
                hub: hub.clone(),
                preview: preview.clone(),
                audit: audit.clone(),
            });
            let addr = server.start().await.unwrap();
            Self {
                addr,
                server,
                hub,
                spawner,
                preview,
                audit,
            }
        }

        async fn connect(&self, query: &str) -> Client {
            let url = format!("ws://{}/relay{}", self.addr, query);
            connect_async(url).await.unwrap().0
        }

        async fn stop(mut self) {
            self.server.stop().await;
            self.hub.shutdown().await;
            self.spawner.close_all();
        }
    }

    fn default_panes() -> Vec<crate::mux::PaneInfo> {
        vec![pane("work", 0, 0, "%1", "/srv/a"), pane("work", 0, 1, "%2", "/srv/b")]
    }

    async fn next_message(ws: &mut Client, wait: Duration) -> Option<Message> {
        match timeout(wait, ws.next()).await {
            Ok(Some(Ok(msg))) => Some(msg),
            _ => None,
        }
    }

    async fn next_json(ws: &mut Client) -> serde_json::Value {
        loop {
            match next_message(ws, Duration::from_secs(2)).await {
                Some(Message::Text(text)) => return serde_json::from_str(&text).unwrap(),
                Some(Message::Binary(_)) => continue,
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    async fn close_code(ws: &mut Client) -> u16 {
        loop {
            match next_message(ws, Duration::from_secs(3)).await {
                Some(Message::Close(Some(frame))) => return u16::from(frame.code),
                Some(_) => continue,
                None => panic!("connection ended without close frame"),
            }
        }
    }

    #[test]
    fn test_parse_route() {
        assert_eq!(parse_route("/relay", None), Route::Relay { mode: RelayMode::Full });
        assert_eq!(
            parse_route("/relay", Some("mode=tail")),
            Route::Relay { mode: RelayMode::Tail }
        );
        assert_eq!(parse_route("/relay", Some("mode=bogus")), Route::Invalid);
        assert_eq!(parse_route("/pty/1", None), Route::Invalid);
    }

    #[tokio::test]
    async fn test_invalid_route_closes_4000() {
        let harness = Harness::start(default_panes(), Duration::from_secs(30), Duration::from_secs(60)).await;
        let url = format!("ws://{}/elsewhere", harness.addr);
        let (mut ws, _) = connect_async(url).await.unwrap();
        assert_eq!(close_code(&mut ws).await, CLOSE_INVALID_ROUTE);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_no_target_closes_4002() {
        let harness = Harness::start(Vec::new(), Duration::from_secs(30), Duration::from_secs(60)).await;
        let mut ws = harness.connect("").await;
        assert_eq!(close_code(&mut ws).await, CLOSE_NO_TARGET);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_tail_rate_then_full_without_gap_or_duplicate() {
        let harness = Harness::start(default_panes(), Duration::from_secs(30), Duration::from_secs(60)).await;
        let mut ws = harness.connect("?mode=tail").await;

        let hello = next_json(&mut ws).await;
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["mode"], "tail");
        assert_eq!(hello["target"]["pane_id"], "%1");

        let feed = harness.spawner.feed();
        let sent = Arc::new(StdMutex::new(Vec::<u8>::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let flood = {
            let sent = Arc::clone(&sent);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut i = 0u32;
                while !stop.load(Ordering::SeqCst) {
                    let line = format!("\x1b[32mline {:06}\x1b[0m {}\r\n", i, "x".repeat(32)).into_bytes();
                    sent.lock().unwrap().extend_from_slice(&line);
                    if feed.send(line).is_err() {
                        break;
                    }
                    i += 1;
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        // tail phase: count digests over a window
        let window_start = std::time::Instant::now();
        let mut digests = 0u32;
        let mut last_seq = 0u64;
        while window_start.elapsed() < Duration::from_millis(1000) {
            match next_message(&mut ws, Duration::from_millis(300)).await {
                Some(Message::Text(text)) => {
                    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if v["type"] == "tail" {
                        let seq = v["seq"].as_u64().unwrap();
                        assert!(seq > last_seq);
                        last_seq = seq;
                        digests += 1;
                    }
                }
                Some(Message::Binary(_)) => panic!("raw bytes delivered in tail mode"),
                _ => {}
            }
        }
        let window_ms = window_start.elapsed().as_millis() as u32;
        assert!(digests >= 2, "only {digests} digests");
        assert!(digests <= window_ms / 200 + 2, "{digests} digests in {window_ms}ms");

        // switch to full: one catch-up block, then live frames
        ws.send(Message::Text(r#"{"type":"set_mode","mode":"full"}"#.to_string()))
            .await
            .unwrap();
        let (offset, len) = loop {
            let v = next_json(&mut ws).await;
            if v["type"] == "catch_up" {
                break (v["offset"].as_u64().unwrap(), v["len"].as_u64().unwrap() as usize);
            }
            assert_eq!(v["type"], "tail");
        };
        let mut stream = match next_message(&mut ws, Duration::from_secs(2)).await {
            Some(Message::Binary(data)) => data,
            other => panic!("expected catch-up block, got {other:?}"),
        };
        assert_eq!(stream.len(), len);

        let stop_at = std::time::Instant::now() + Duration::from_millis(300);
        loop {
            if std::time::Instant::now() >= stop_at {
                stop.store(true, Ordering::SeqCst);
            }
            match next_message(&mut ws, Duration::from_millis(500)).await {
                Some(Message::Binary(data)) => stream.extend_from_slice(&data),
                Some(Message::Text(text)) => panic!("unexpected text in full mode: {text}"),
                Some(other) => panic!("unexpected frame: {other:?}"),
                None if stop.load(Ordering::SeqCst) => break,
                None => {}
            }
        }
        flood.join().unwrap();

        let all = sent.lock().unwrap().clone();
        assert!(offset as usize + stream.len() == all.len(), "stream does not reach the end");
        assert!(&all[offset as usize..] == stream.as_slice(), "gap or duplicate in full stream");

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_target_change_closes_4004() {
        let harness = Harness::start(default_panes(), Duration::from_secs(30), Duration::from_secs(60)).await;
        let mut ws = harness.connect("").await;
        assert_eq!(next_json(&mut ws).await["type"], "hello");

        harness.hub.select_target("%2", "127.0.0.1").await.unwrap();
        assert_eq!(close_code(&mut ws).await, CLOSE_TARGET_CHANGED);

        // reconnecting follows the new target
        let mut ws = harness.connect("").await;
        let hello = next_json(&mut ws).await;
        assert_eq!(hello["target"]["pane_id"], "%2");
        assert_eq!(hello["epoch"], 1);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_pane_death_closes_4003() {
        let harness = Harness::start(default_panes(), Duration::from_secs(30), Duration::from_secs(60)).await;
        let mut ws = harness.connect("").await;
        assert_eq!(next_json(&mut ws).await["type"], "hello");

        // the attach client exits on its own
        harness.spawner.close_all();
        if let Some(attachment) = harness.hub.current().await {
            attachment.close(CloseReason::PaneDied);
        }
        assert_eq!(close_code(&mut ws).await, CLOSE_PANE_DIED);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_skipped_and_preview_blocks_input() {
        let harness = Harness::start(default_panes(), Duration::from_secs(30), Duration::from_secs(60)).await;
        let mut ws = harness.connect("").await;
        assert_eq!(next_json(&mut ws).await["type"], "hello");

        ws.send(Message::Text("{not json".to_string())).await.unwrap();
        ws.send(Message::Text(r#"{"type":"ping","ts":5}"#.to_string())).await.unwrap();
        let pong = loop {
            let v = next_json(&mut ws).await;
            if v["type"] == "pong" {
                break v;
            }
        };
        assert_eq!(pong["ts"], 5);

        harness.preview.enter(3);
        ws.send(Message::Text(r#"{"type":"input","data":"rm -rf /\r"}"#.to_string()))
            .await
            .unwrap();
        let notice = loop {
            let v = next_json(&mut ws).await;
            if v["type"] == "notice" {
                break v;
            }
        };
        assert_eq!(notice["code"], "preview_active");
        assert!(harness.spawner.input.0.lock().unwrap().is_empty());

        harness.preview.exit();
        ws.send(Message::Binary(b"ls\r".to_vec())).await.unwrap();
        // round-trip a ping so the write has been processed
        ws.send(Message::Text(r#"{"type":"ping","ts":6}"#.to_string())).await.unwrap();
        loop {
            let v = next_json(&mut ws).await;
            if v["type"] == "pong" {
                break;
            }
        }
        assert_eq!(harness.spawner.input.0.lock().unwrap().as_slice(), b"ls\r");
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_input_after_epoch_moved_is_dropped() {
        let harness = Harness::start(default_panes(), Duration::from_secs(30), Duration::from_secs(60)).await;
        let mut ws = harness.connect("").await;
        let hello = next_json(&mut ws).await;
        assert_eq!(hello["epoch"], 0);

        // selection moved but the hub has not announced it yet
        let other = crate::target::Target::from_pane(&default_panes()[1]);
        assert_eq!(harness.hub.state().select(other), 1);

        ws.send(Message::Binary(b"make deploy\r".to_vec())).await.unwrap();
        let notice = loop {
            let v = next_json(&mut ws).await;
            if v["type"] == "notice" {
                break v;
            }
        };
        assert_eq!(notice["code"], "epoch_changed");
        assert_eq!(close_code(&mut ws).await, CLOSE_TARGET_CHANGED);
        assert!(harness.spawner.input.0.lock().unwrap().is_empty());
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_input_burst_is_audited_once() {
        let harness = Harness::start(default_panes(), Duration::from_secs(30), Duration::from_secs(60)).await;
        let mut ws = harness.connect("").await;
        assert_eq!(next_json(&mut ws).await["type"], "hello");

        for key in ["l", "s", "\r"] {
            ws.send(Message::Binary(key.as_bytes().to_vec())).await.unwrap();
        }
        ws.close(None).await.unwrap();

        let audited = async {
            loop {
                let inputs: Vec<_> = harness
                    .audit
                    .recent(100)
                    .into_iter()
                    .filter(|e| e.action == AuditAction::Input)
                    .collect();
                if !inputs.is_empty() {
                    return inputs;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        let inputs = timeout(Duration::from_secs(2), audited).await.unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].detail, "3 bytes in 3 writes");
        assert_eq!(inputs[0].target.as_deref(), Some("%1"));
        assert_eq!(harness.spawner.input.0.lock().unwrap().as_slice(), b"ls\r");
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_idle_connection_closes_4001() {
        let harness = Harness::start(default_panes(), Duration::from_millis(50), Duration::from_millis(150)).await;
        let mut ws = harness.connect("").await;
        assert_eq!(close_code(&mut ws).await, CLOSE_IDLE);
        harness.stop().await;
    }
}
