//! Agent drivers
//!
//! The set of supported interactive agents is closed: Claude Code, Codex, and
//! a generic fallback for anything else running in a pane. Each variant
//! answers the same questions about a screen excerpt or a structured log entry.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Screen region inspected for phase detection
const ACTIVE_LINES: usize = 15;

static OPTION_CONFIRM_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^[\s❯>]*1\.\s*(Yes|Allow)").unwrap());

static YES_NO_CONFIRM_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[Y/n\]|\(yes/no\)|\(y/n\)|Allow\?|Do you want to proceed").unwrap());

static CLAUDE_PROMPT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[❯>]\s*").unwrap());

static SPINNER_LINE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[·✻✽✶✳✢]\s+\S").unwrap());

static CODEX_APPROVAL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)allow command\?|approve this|would you like to run|\[a\]pprove").unwrap()
});

static CODEX_WORKING_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)esc to interrupt|working \(\d+s").unwrap());

static CODEX_PROMPT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[›▌>]\s*").unwrap());

static SHELL_PROMPT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[$#%>❯]\s*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    ClaudeCode,
    Codex,
    Generic,
}

/// Coarse lifecycle phase read off the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Idle,
    Working,
    WaitingPermission,
    Unknown,
}

/// Capabilities every agent variant provides
pub trait AgentDriver {
    /// Phase of the agent given plain (ANSI-stripped) screen text
    fn detect_phase(&self, screen: &str) -> AgentPhase;

    /// Whether the agent is blocked on a permission prompt
    fn detect_permission_wait(&self, screen: &str) -> bool;

    /// Whether a structured log entry closes a turn
    fn is_turn_boundary(&self, entry: &Value) -> bool;
}

impl AgentKind {
    /// Identify an agent from a process command line
    pub fn from_command(command: &str) -> Option<AgentKind> {
        for token in command.split_whitespace().take(3) {
            let base = token.rsplit('/').next().unwrap_or(token);
            match base {
                "claude" | "claude-code" => return Some(AgentKind::ClaudeCode),
                "codex" => return Some(AgentKind::Codex),
                _ => {}
            }
            if token.contains("@anthropic-ai/claude-code") {
                return Some(AgentKind::ClaudeCode);
            }
            if token.contains("@openai/codex") {
                return Some(AgentKind::Codex);
            }
        }
        None
    }

    /// Whether structured logs for this agent can be correlated
    pub fn has_session_logs(&self) -> bool {
        matches!(self, AgentKind::ClaudeCode)
    }
}

fn last_non_empty_lines(text: &str, n: usize) -> Vec<&str> {
    let mut lines: Vec<&str> = text
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(n)
        .collect();
    lines.reverse();
    lines
}

impl AgentDriver for AgentKind {
    fn detect_phase(&self, screen: &str) -> AgentPhase {
        if self.detect_permission_wait(screen) {
            return AgentPhase::WaitingPermission;
        }
        let lines = last_non_empty_lines(screen, ACTIVE_LINES);
        if lines.is_empty() {
            return AgentPhase::Unknown;
        }
        match self {
            AgentKind::ClaudeCode => {
                if lines.iter().any(|l| SPINNER_LINE_PATTERN.is_match(l)) {
                    AgentPhase::Working
                } else if lines.iter().any(|l| CLAUDE_PROMPT_PATTERN.is_match(l.trim())) {
                    AgentPhase::Idle
                } else {
                    AgentPhase::Unknown
                }
            }
            AgentKind::Codex => {
                if lines.iter().any(|l| CODEX_WORKING_PATTERN.is_match(l)) {
                    AgentPhase::Working
                } else if lines.iter().any(|l| CODEX_PROMPT_PATTERN.is_match(l.trim())) {
                    AgentPhase::Idle
                } else {
                    AgentPhase::Unknown
                }
            }
            AgentKind::Generic => match lines.last() {
                Some(last) if SHELL_PROMPT_PATTERN.is_match(last) => AgentPhase::Idle,
                _ => AgentPhase::Unknown,
            },
        }
    }

    fn detect_permission_wait(&self, screen: &str) -> bool {
        let region = last_non_empty_lines(screen, ACTIVE_LINES).join("\n");
        match self {
            AgentKind::ClaudeCode => {
                (OPTION_CONFIRM_PATTERN.is_match(&region) && region.contains("Esc to cancel"))
                    || YES_NO_CONFIRM_PATTERN.is_match(&region)
            }
            AgentKind::Codex => {
                CODEX_APPROVAL_PATTERN.is_match(&region) || YES_NO_CONFIRM_PATTERN.is_match(&region)
            }
            AgentKind::Generic => YES_NO_CONFIRM_PATTERN.is_match(&region),
        }
    }

    fn is_turn_boundary(&self, entry: &Value) -> bool {
        let entry_type = entry.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match self {
            AgentKind::ClaudeCode => match entry_type {
                "system" => entry.get("subtype").and_then(|v| v.as_str()) == Some("turn_duration"),
                "assistant" => {
                    let message = entry.get("message");
                    let end_turn = message
                        .and_then(|m| m.get("stop_reason"))
                        .and_then(|v| v.as_str())
                        == Some("end_turn");
                    let tool_use = message
                        .and_then(|m| m.get("content"))
                        .and_then(|c| c.as_array())
                        .map(|blocks| {
                            blocks
                                .iter()
                                .any(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"))
                        })
                        .unwrap_or(false);
                    end_turn || tool_use
                }
                _ => false,
            },
            AgentKind::Codex => {
                let payload_type = entry
                    .get("payload")
                    .and_then(|p| p.get("type"))
                    .and_then(|v| v.as_str());
                match entry_type {
                    "event_msg" => payload_type == Some("task_complete"),
                    "response_item" => payload_type == Some("function_call"),
                    _ => false,
                }
            }
            AgentKind::Generic => false,
        }
    }
}
