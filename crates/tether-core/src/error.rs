//! Error types for tether-core
//!
//! One variant per failure class the relay distinguishes. The REST boundary
//! maps these onto status codes through [`Error::kind`].

use thiserror::Error;

/// Result type alias for tether-core
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the relay core
#[derive(Debug, Error)]
pub enum Error {
    /// The requested pane was destroyed since it was last listed
    #[error("stale target: pane {pane_id} no longer exists")]
    StaleTarget { pane_id: String },

    /// A request referenced a target other than the currently resolved one
    #[error("target mismatch: expected {expected}, received {received}")]
    TargetMismatch { expected: String, received: String },

    /// The active target was switched while an operation was in flight
    #[error("target epoch moved from {captured} to {current}; result discarded")]
    EpochChanged { captured: u64, current: u64 },

    /// Every snapshot slot is pinned
    #[error("snapshot buffer full: all {capacity} entries are pinned")]
    CapacityExhausted { capacity: usize },

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(u64),

    /// Correlation had no candidate log at all
    #[error("no log file available for pane {0}")]
    NoLogCandidate(String),

    /// A mutating input path was used while a snapshot preview is open
    #[error("preview of snapshot {0} is active; live input is disabled")]
    PreviewActive(u64),

    /// No pane could be resolved to attach the relay to
    #[error("no target available: {0}")]
    NoTarget(String),

    /// The multiplexer command failed or returned unparseable output
    #[error("multiplexer error: {0}")]
    Multiplexer(String),

    /// A transient operation kept failing until the retry budget ran out
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Whether a retry has a reasonable chance of succeeding
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            Error::Multiplexer(_) => true,
            _ => false,
        }
    }

    /// Stable machine-readable name used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Error::StaleTarget { .. } => "stale_target",
            Error::TargetMismatch { .. } => "target_mismatch",
            Error::EpochChanged { .. } => "epoch_changed",
            Error::CapacityExhausted { .. } => "capacity_exhausted",
            Error::SnapshotNotFound(_) => "snapshot_not_found",
            Error::NoLogCandidate(_) => "no_log_candidate",
            Error::PreviewActive(_) => "preview_active",
            Error::NoTarget(_) => "no_target",
            Error::Multiplexer(_) => "multiplexer",
            Error::RetriesExhausted { .. } => "retries_exhausted",
            Error::Pty(_) => "pty",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Pty(e.to_string())
    }
}
