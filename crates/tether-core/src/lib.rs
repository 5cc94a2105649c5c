//! tether-core
//!
//! Terminal relay and target resolution for agent panes running under tmux:
//! PTY drain loop and dual-mode router, WebSocket session protocol, target
//! resolver, log correlator and snapshot ring buffer.

pub mod agent;
pub mod audit;
pub mod config;
pub mod correlate;
pub mod error;
pub mod hub;
pub mod mux;
pub mod poll;
pub mod process;
pub mod pty;
pub mod relay;
pub mod retry;
pub mod session;
pub mod snapshot;
pub mod target;
pub mod ws;

pub use agent::{AgentDriver, AgentKind, AgentPhase};
pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use config::RelayConfig;
pub use correlate::{ClaudeLogStore, Confidence, LogCorrelator, LogMapping, LogStore};
pub use error::{Error, Result};
pub use hub::{HubEvent, RelayHub};
pub use mux::{Multiplexer, PaneInfo, TmuxClient};
pub use poll::PeriodicTask;
pub use process::{ProcessEntry, ProcessTable, PsProcessTable};
pub use pty::{NativePtySpawner, PtySpawner};
pub use relay::RelayMode;
pub use retry::RetryPolicy;
pub use snapshot::{PreviewGate, SnapshotBuffer, SnapshotService};
pub use target::{ActiveTarget, Target, TargetResolver, TargetState};
pub use ws::{RelayServer, RelayServerOptions};
