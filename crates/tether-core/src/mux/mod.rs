//! Terminal multiplexer collaborator
//!
//! The relay never talks to tmux directly outside this module; everything
//! else goes through the [`Multiplexer`] trait so tests can script panes.

mod tmux;

pub use tmux::{parse_pane_line, TmuxClient, PANE_FORMAT};

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One pane as reported by the multiplexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneInfo {
    pub session_name: String,
    pub window_index: u32,
    pub pane_index: u32,
    /// Stable identifier (`%12` for tmux)
    pub pane_id: String,
    /// Pid of the pane's root process (usually a shell)
    pub pane_pid: u32,
    pub current_path: PathBuf,
    pub pane_active: bool,
    pub window_active: bool,
    pub session_attached: bool,
    pub current_command: String,
}

impl PaneInfo {
    /// Active pane of the active window of an attached session
    pub fn has_focus(&self) -> bool {
        self.pane_active && self.window_active && self.session_attached
    }
}

#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Enumerate every pane of every session
    async fn list_panes(&self) -> Result<Vec<PaneInfo>>;

    /// Plain-text capture of the last `lines` lines of a pane
    async fn capture_pane(&self, pane_id: &str, lines: usize) -> Result<String>;

    /// Program and arguments that attach a PTY client to `pane_id`
    fn attach_command(&self, pane_id: &str) -> (String, Vec<String>);
}

/// Look up a single pane by id
pub async fn find_pane(mux: &dyn Multiplexer, pane_id: &str) -> Result<Option<PaneInfo>> {
    Ok(mux
        .list_panes()
        .await?
        .into_iter()
        .find(|p| p.pane_id == pane_id))
}

/// Focused pane: attached session first, then any active pane
pub fn focused_pane(panes: &[PaneInfo]) -> Option<&PaneInfo> {
    panes
        .iter()
        .find(|p| p.has_focus())
        .or_else(|| panes.iter().find(|p| p.pane_active && p.window_active))
}
