//! tmux adapter

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Multiplexer, PaneInfo};
use crate::error::{Error, Result};
use crate::retry::{with_retry, RetryPolicy};

/// `list-panes` format: one tab-separated record per pane
pub const PANE_FORMAT: &str = "#{session_name}\t#{window_index}\t#{pane_index}\t#{pane_id}\t#{pane_pid}\t#{pane_current_path}\t#{pane_active}\t#{window_active}\t#{session_attached}\t#{pane_current_command}";

/// Shells out to the `tmux` binary
pub struct TmuxClient {
    bin: String,
    retry: RetryPolicy,
}

impl TmuxClient {
    pub fn new(bin: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            bin: bin.into(),
            retry,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        with_retry(&self.retry, "tmux", || self.run_once(args)).await
    }

    async fn run_once(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.bin).args(args).output().await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!(?args, %stderr, "tmux command failed");
        Err(classify_failure(args, &stderr))
    }
}

/// Permanent failures must not burn the retry budget
fn classify_failure(args: &[&str], stderr: &str) -> Error {
    if stderr.contains("no server running") || stderr.contains("error connecting to") {
        return Error::NoTarget("tmux server not running".to_string());
    }
    if stderr.contains("can't find") {
        let pane_id = args
            .iter()
            .position(|a| *a == "-t")
            .and_then(|i| args.get(i + 1))
            .map(|s| s.to_string())
            .unwrap_or_default();
        return Error::StaleTarget { pane_id };
    }
    let sub = args.first().copied().unwrap_or("");
    Error::Multiplexer(format!("tmux {} failed: {}", sub, stderr))
}

fn flag(value: &str) -> bool {
    value.trim() == "1"
}

/// Parse one `PANE_FORMAT` line
pub fn parse_pane_line(line: &str) -> Option<PaneInfo> {
    let fields: Vec<&str> = line.splitn(10, '\t').collect();
    if fields.len() != 10 {
        return None;
    }
    Some(PaneInfo {
        session_name: fields[0].to_string(),
        window_index: fields[1].parse().ok()?,
        pane_index: fields[2].parse().ok()?,
        pane_id: fields[3].to_string(),
        pane_pid: fields[4].parse().ok()?,
        current_path: PathBuf::from(fields[5]),
        pane_active: flag(fields[6]),
        window_active: flag(fields[7]),
        session_attached: !matches!(fields[8].trim(), "" | "0"),
        current_command: fields[9].trim_end().to_string(),
    })
}

#[async_trait]
impl Multiplexer for TmuxClient {
    async fn list_panes(&self) -> Result<Vec<PaneInfo>> {
        let stdout = match self.run(&["list-panes", "-a", "-F", PANE_FORMAT]).await {
            Ok(out) => out,
            Err(Error::NoTarget(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(stdout.lines().filter_map(parse_pane_line).collect())
    }

    async fn capture_pane(&self, pane_id: &str, lines: usize) -> Result<String> {
        let start = format!("-{}", lines.max(1));
        self.run(&["capture-pane", "-p", "-J", "-t", pane_id, "-S", &start])
            .await
    }

    fn attach_command(&self, pane_id: &str) -> (String, Vec<String>) {
        (
            self.bin.clone(),
            vec![
                "attach-session".to_string(),
                "-t".to_string(),
                pane_id.to_string(),
            ],
        )
    }
}
