//! Structured log storage
//!
//! Claude Code keeps one JSONL file per session under
//! `<claude_home>/projects/<encoded-cwd>/<session-id>.jsonl`, where the
//! encoded cwd is the absolute path with every non-alphanumeric character
//! replaced by `-`. Debug output goes to `<claude_home>/debug/<session-id>.txt`
//! and each line starts with an RFC 3339 timestamp.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::debug;

use crate::agent::AgentKind;
use crate::error::Result;

/// Lines scanned for the first timestamped entry
const FIRST_ENTRY_SCAN_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogCandidate {
    pub path: PathBuf,
    pub session_id: String,
    pub modified: DateTime<Utc>,
    pub first_entry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugFile {
    pub session_id: String,
    pub first_timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Agent whose logs this store serves
    fn agent(&self) -> AgentKind;

    /// Session logs recorded for `cwd`
    async fn candidates(&self, cwd: &Path) -> Result<Vec<LogCandidate>>;

    async fn debug_files(&self) -> Result<Vec<DebugFile>>;

    /// Last `lines` non-empty lines of a log
    async fn read_tail(&self, path: &Path, lines: usize) -> Result<Vec<String>>;

    /// Complete lines appended after byte `offset`, plus the offset to
    /// continue from. A file shorter than `offset` is read from the start.
    async fn read_lines_since(&self, path: &Path, offset: u64) -> Result<(Vec<String>, u64)>;
}

pub struct ClaudeLogStore {
    home: PathBuf,
}

/// Directory name Claude Code uses for a project path
pub fn encode_project_dir(cwd: &Path) -> String {
    cwd.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

fn parse_leading_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let token = line.split_whitespace().next()?;
    DateTime::parse_from_rfc3339(token)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

impl ClaudeLogStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.home.join("projects")
    }

    pub fn project_dir(&self, cwd: &Path) -> PathBuf {
        self.projects_dir().join(encode_project_dir(cwd))
    }

    async fn first_entry(path: &Path) -> Option<DateTime<Utc>> {
        let file = fs::File::open(path).await.ok()?;
        let mut lines = BufReader::new(file).lines();
        for _ in 0..FIRST_ENTRY_SCAN_LINES {
            let line = lines.next_line().await.ok()??;
            let Ok(entry) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            if let Some(ts) = entry.get("timestamp").and_then(|v| v.as_str()) {
                if let Ok(t) = DateTime::parse_from_rfc3339(ts) {
                    return Some(t.with_timezone(&Utc));
                }
            }
        }
        None
    }
}

#[async_trait]
impl LogStore for ClaudeLogStore {
    fn agent(&self) -> AgentKind {
        AgentKind::ClaudeCode
    }

    async fn candidates(&self, cwd: &Path) -> Result<Vec<LogCandidate>> {
        let dir = self.project_dir(cwd);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "No project log directory");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let modified = entry.metadata().await?.modified()?;
            candidates.push(LogCandidate {
                first_entry: Self::first_entry(&path).await,
                path,
                session_id,
                modified: DateTime::<Utc>::from(modified),
            });
        }
        Ok(candidates)
    }

    async fn debug_files(&self) -> Result<Vec<DebugFile>> {
        let dir = self.home.join("debug");
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let Ok(file) = fs::File::open(&path).await else {
                continue;
            };
            let first = BufReader::new(file).lines().next_line().await.ok().flatten();
            if let Some(first_timestamp) = first.as_deref().and_then(parse_leading_timestamp) {
                files.push(DebugFile {
                    session_id,
                    first_timestamp,
                });
            }
        }
        Ok(files)
    }

    async fn read_tail(&self, path: &Path, lines: usize) -> Result<Vec<String>> {
        let content = fs::read_to_string(path).await?;
        let mut tail: Vec<String> = content
            .lines()
            .rev()
            .filter(|l| !l.trim().is_empty())
            .take(lines)
            .map(str::to_string)
            .collect();
        tail.reverse();
        Ok(tail)
    }

    async fn read_lines_since(&self, path: &Path, offset: u64) -> Result<(Vec<String>, u64)> {
        let mut file = fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let start = if len < offset { 0 } else { offset };
        file.seek(std::io::SeekFrom::Start(start)).await?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        // Leave a partially written last line for the next pass
        let complete = buf.iter().rposition(|&b| b == b'\n').map(|i| i + 1).unwrap_or(0);
        let lines = String::from_utf8_lossy(&buf[..complete])
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        Ok((lines, start + complete as u64))
    }
}
