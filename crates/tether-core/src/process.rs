//! Process metadata lookup
//!
//! Finds the interactive agent running inside a pane and when it started.
//! Start times come from `ps` elapsed time, so they carry roughly one second
//! of jitter; correlation tolerances are far wider than that.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::process::Command;

use crate::agent::AgentKind;
use crate::error::{Error, Result};
use crate::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub started_at: DateTime<Utc>,
    pub command: String,
}

/// The agent found inside a pane
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentProcess {
    pub kind: AgentKind,
    pub process: ProcessEntry,
}

#[async_trait]
pub trait ProcessTable: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<ProcessEntry>>;
}

/// `ps`-backed process table
pub struct PsProcessTable {
    retry: RetryPolicy,
}

impl PsProcessTable {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    async fn run_ps() -> Result<String> {
        let output = Command::new("ps")
            .args(["-axo", "pid=,ppid=,etime=,command="])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ProcessTable for PsProcessTable {
    async fn snapshot(&self) -> Result<Vec<ProcessEntry>> {
        let stdout = with_retry(&self.retry, "ps", Self::run_ps).await?;
        Ok(parse_ps_output(&stdout, Utc::now()))
    }
}

/// Parse `ps` elapsed time (`[[dd-]hh:]mm:ss`) into seconds
pub fn parse_etime(etime: &str) -> Option<i64> {
    let (days, rest) = match etime.split_once('-') {
        Some((d, rest)) => (d.parse::<i64>().ok()?, rest),
        None => (0, etime),
    };
    let parts: Vec<i64> = rest
        .split(':')
        .map(|p| p.parse::<i64>().ok())
        .collect::<Option<Vec<_>>>()?;
    let (h, m, s) = match parts.as_slice() {
        [m, s] => (0, *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return None,
    };
    Some(days * 86_400 + h * 3_600 + m * 60 + s)
}

/// Parse `ps -axo pid=,ppid=,etime=,command=` output
pub fn parse_ps_output(text: &str, now: DateTime<Utc>) -> Vec<ProcessEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            let elapsed = parse_etime(fields.next()?)?;
            let command = fields.collect::<Vec<_>>().join(" ");
            Some(ProcessEntry {
                pid,
                ppid,
                started_at: now - ChronoDuration::seconds(elapsed),
                command,
            })
        })
        .collect()
}

/// Breadth-first search from `root_pid` for the first known agent
pub fn find_agent_process(entries: &[ProcessEntry], root_pid: u32) -> Option<AgentProcess> {
    let mut children: HashMap<u32, Vec<&ProcessEntry>> = HashMap::new();
    let mut by_pid: HashMap<u32, &ProcessEntry> = HashMap::new();
    for entry in entries {
        children.entry(entry.ppid).or_default().push(entry);
        by_pid.insert(entry.pid, entry);
    }
    for list in children.values_mut() {
        list.sort_by_key(|e| e.pid);
    }

    let mut queue = VecDeque::new();
    if let Some(root) = by_pid.get(&root_pid) {
        queue.push_back(*root);
    } else {
        queue.extend(children.get(&root_pid).into_iter().flatten().copied());
    }

    while let Some(entry) = queue.pop_front() {
        if let Some(kind) = AgentKind::from_command(&entry.command) {
            return Some(AgentProcess {
                kind,
                process: entry.clone(),
            });
        }
        if let Some(kids) = children.get(&entry.pid) {
            // ps lists pid 0 with ppid 0 on some platforms
            queue.extend(kids.iter().copied().filter(|k| k.pid != entry.pid));
        }
    }
    None
}


#[cfg(test)]
mod tests {
    use super::fake::proc;
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_etime() {
        assert_eq!(parse_etime("00:05"), Some(5));
        assert_eq!(parse_etime("12:34"), Some(754));
        assert_eq!(parse_etime("01:00:00"), Some(3600));
        assert_eq!(parse_etime("2-03:04:05"), Some(2 * 86_400 + 3 * 3600 + 4 * 60 + 5));
        assert_eq!(parse_etime("garbage"), None);
        assert_eq!(parse_etime("1:2:3:4"), None);
    }

    #[test]
    fn test_parse_ps_output() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let text = "    1     0 10-00:00:00 /sbin/init\n  4242     1       01:30 node /usr/bin/claude --resume\nbad line\n";
        let entries = parse_ps_output(text, now);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].pid, 4242);
        assert_eq!(entries[1].command, "node /usr/bin/claude --resume");
        assert_eq!(entries[1].started_at, now - ChronoDuration::seconds(90));
    }

    #[test]
    fn test_find_agent_breadth_first() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let entries = vec![
            proc(100, 1, t, "-zsh"),
            proc(200, 100, t, "bash run.sh"),
            proc(300, 200, t, "codex"),
            proc(210, 100, t, "claude"),
            proc(900, 1, t, "claude"),
        ];
        let found = find_agent_process(&entries, 100).unwrap();
        assert_eq!(found.process.pid, 210);
        assert_eq!(found.kind, AgentKind::ClaudeCode);

        assert!(find_agent_process(&entries, 555).is_none());
    }
}
