//! Relay configuration
//!
//! Loaded from `<home>/config.yaml`; every field has a default so a missing
//! file is a valid configuration. Environment variables override the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::retry::RetryPolicy;

/// Default WebSocket relay port
pub const DEFAULT_WS_PORT: u16 = 9130;
/// Default REST API port
pub const DEFAULT_HTTP_PORT: u16 = 9131;

/// Relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_host: String,
    pub ws_port: u16,
    pub http_port: u16,

    /// Ring buffer capacity in bytes (a few seconds of heavy output)
    pub ring_capacity: usize,
    /// Upper bound for the catch-up block sent on tail -> full
    pub catchup_bytes: usize,
    pub tail_interval_ms: u64,
    pub tail_lines: usize,

    pub hello_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub idle_timeout_ms: u64,

    pub pty_cols: u16,
    pub pty_rows: u16,
    pub tmux_bin: String,

    /// tmux session name -> project directory
    pub session_dirs: HashMap<String, PathBuf>,
    pub default_project_root: Option<PathBuf>,
    /// Defaults to ~/.claude
    pub claude_home: Option<PathBuf>,

    /// Debug-file vs. process start tolerance. Heuristic, observed behaviour.
    pub debug_tolerance_secs: i64,
    /// First log entry vs. process start tolerance. Heuristic, observed behaviour.
    pub first_entry_tolerance_secs: i64,

    pub snapshot_capacity: usize,
    pub snapshot_interval_secs: u64,
    pub boundary_poll_ms: u64,
    pub snapshot_log_lines: usize,
    pub snapshot_terminal_lines: usize,

    pub health_interval_ms: u64,

    pub retry_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            ws_port: DEFAULT_WS_PORT,
            http_port: DEFAULT_HTTP_PORT,
            ring_capacity: 64 * 1024,
            catchup_bytes: 16 * 1024,
            tail_interval_ms: 200,
            tail_lines: 40,
            hello_timeout_ms: 2_000,
            ping_interval_ms: 15_000,
            idle_timeout_ms: 45_000,
            pty_cols: 120,
            pty_rows: 40,
            tmux_bin: "tmux".to_string(),
            session_dirs: HashMap::new(),
            default_project_root: None,
            claude_home: None,
            debug_tolerance_secs: 5,
            first_entry_tolerance_secs: 60,
            snapshot_capacity: 50,
            snapshot_interval_secs: 300,
            boundary_poll_ms: 2_000,
            snapshot_log_lines: 40,
            snapshot_terminal_lines: 60,
            health_interval_ms: 2_000,
            retry_attempts: 3,
            retry_initial_ms: 100,
            retry_max_ms: 2_000,
        }
    }
}

impl RelayConfig {
    /// Parse a YAML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = serde_yaml::from_str(&content)?;
        debug!(path = %path.display(), "Relay config loaded");
        Ok(config)
    }

    /// Load the file if it exists, otherwise defaults. A broken file is
    /// reported and ignored.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Invalid relay config, using defaults");
                Self::default()
            }
        }
    }

    /// Apply `TETHER_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("TETHER_WS_PORT").and_then(|v| v.parse().ok()) {
            self.ws_port = port;
        }
        if let Some(port) = lookup("TETHER_HTTP_PORT").and_then(|v| v.parse().ok()) {
            self.http_port = port;
        }
        if let Some(host) = lookup("TETHER_BIND") {
            self.bind_host = host;
        }
        if let Some(root) = lookup("TETHER_PROJECT_ROOT") {
            self.default_project_root = Some(PathBuf::from(root));
        }
        if let Some(home) = lookup("TETHER_CLAUDE_HOME") {
            self.claude_home = Some(PathBuf::from(home));
        }
        if let Some(bin) = lookup("TETHER_TMUX") {
            self.tmux_bin = bin;
        }
    }

    /// Claude home directory (`~/.claude` unless configured)
    pub fn claude_home(&self) -> PathBuf {
        self.claude_home.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".claude"))
                .unwrap_or_else(|| PathBuf::from(".claude"))
        })
    }

    pub fn tail_interval(&self) -> Duration {
        Duration::from_millis(self.tail_interval_ms)
    }

    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.retry_initial_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            backoff_factor: 2.0,
            max_attempts: self.retry_attempts.max(1),
        }
    }
}

/// Daemon home directory (`TETHER_HOME` or `~/.tether`)
pub fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var("TETHER_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = RelayConfig::load_or_default(&dir.path().join("config.yaml"));
        assert_eq!(config.ws_port, DEFAULT_WS_PORT);
        assert_eq!(config.tail_interval_ms, 200);
        assert_eq!(config.debug_tolerance_secs, 5);
        assert_eq!(config.first_entry_tolerance_secs, 60);
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "ws_port: 7000\nsession_dirs:\n  api: /srv/api\ndefault_project_root: /srv\n",
        )
        .unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.ws_port, 7000);
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(config.session_dirs.get("api"), Some(&PathBuf::from("/srv/api")));
        assert_eq!(config.default_project_root, Some(PathBuf::from("/srv")));
    }

    #[test]
    fn test_broken_yaml_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "ws_port: [not a port").unwrap();
        let config = RelayConfig::load_or_default(&path);
        assert_eq!(config.ws_port, DEFAULT_WS_PORT);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RelayConfig::default();
        config.apply_overrides(|key| match key {
            "TETHER_WS_PORT" => Some("8100".to_string()),
            "TETHER_HTTP_PORT" => Some("not-a-number".to_string()),
            "TETHER_PROJECT_ROOT" => Some("/work".to_string()),
            _ => None,
        });
        assert_eq!(config.ws_port, 8100);
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(config.default_project_root, Some(PathBuf::from("/work")));
    }
}
