//! Connection session protocol
//!
//! Messages (client -> server, JSON text frames):
//! - `{ type: "resize", cols, rows }`
//! - `{ type: "input", data }` (binary frames are raw input too)
//! - `{ type: "set_mode", mode: "full" | "tail" }`
//! - `{ type: "ping", ts? }` / `{ type: "pong", ts? }`
//!
//! Messages (server -> client):
//! - `{ type: "hello", session_id, mode, epoch, target, ring_head, server_time }`
//! - `{ type: "tail", text, seq }`
//! - `{ type: "catch_up", offset, len }` followed by one binary frame
//! - binary frames with live output (full mode only)
//! - `{ type: "ping", ts }` / `{ type: "pong", ts }`
//! - `{ type: "notice", code, message }`

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::relay::{ModeRouter, RelayMode};
use crate::target::Target;

/// Invalid URL
pub const CLOSE_INVALID_ROUTE: u16 = 4000;
/// No traffic and no keepalive reply; reconnect
pub const CLOSE_IDLE: u16 = 4001;
/// Nothing to attach to
pub const CLOSE_NO_TARGET: u16 = 4002;
/// The pane or its process died
pub const CLOSE_PANE_DIED: u16 = 4003;
/// Active target switched; reconnect to follow it
pub const CLOSE_TARGET_CHANGED: u16 = 4004;
pub const CLOSE_ABNORMAL: u16 = 1011;
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Resize {
        cols: u16,
        rows: u16,
    },
    Input {
        data: String,
    },
    SetMode {
        mode: RelayMode,
    },
    Ping {
        #[serde(default)]
        ts: Option<i64>,
    },
    Pong {
        #[serde(default)]
        ts: Option<i64>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        session_id: String,
        mode: RelayMode,
        epoch: u64,
        target: Target,
        ring_head: u64,
        server_time: DateTime<Utc>,
    },
    Tail {
        text: String,
        seq: u64,
    },
    CatchUp {
        offset: u64,
        len: usize,
    },
    Ping {
        ts: i64,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        ts: Option<i64>,
    },
    Notice {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn notice(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Notice {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Parse an inbound text frame. Malformed input is reported, not fatal.
pub fn parse_client_message(text: &str) -> Option<ClientMessage> {
    match serde_json::from_str(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!(error = %e, len = text.len(), "Unparseable client message");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl ConnectionPhase {
    /// Forward-only; any live phase may jump to `Closing`
    pub fn can_advance_to(self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, Active)
                | (Connecting | Handshaking | Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// Per-client state
#[derive(Debug)]
pub struct ConnectionSession {
    pub id: String,
    phase: ConnectionPhase,
    router: ModeRouter,
    epoch: u64,
    last_activity: Instant,
    /// Messages sent to the client
    sequence: u64,
    input: InputTally,
}

/// Input written since the last audit flush
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InputTally {
    pub bytes: usize,
    pub writes: usize,
}

impl ConnectionSession {
    pub fn new(mode: RelayMode, catchup_limit: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            phase: ConnectionPhase::Connecting,
            router: ModeRouter::new(mode, catchup_limit),
            epoch: 0,
            last_activity: Instant::now(),
            sequence: 0,
            input: InputTally::default(),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Move to `next`; illegal transitions are ignored and reported
    pub fn advance(&mut self, next: ConnectionPhase) -> bool {
        if self.phase.can_advance_to(next) {
            debug!(session = %self.id, from = ?self.phase, to = ?next, "Session phase");
            self.phase = next;
            true
        } else {
            false
        }
    }

    pub fn router(&mut self) -> &mut ModeRouter {
        &mut self.router
    }

    pub fn mode(&self) -> RelayMode {
        self.router.mode()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn bind_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    pub fn sent(&self) -> u64 {
        self.sequence
    }

    pub fn note_input(&mut self, bytes: usize) {
        self.input.bytes += bytes;
        self.input.writes += 1;
    }

    /// Pending input totals, reset on read
    pub fn take_input(&mut self) -> Option<InputTally> {
        if self.input.writes == 0 {
            return None;
        }
        Some(std::mem::take(&mut self.input))
    }
}
