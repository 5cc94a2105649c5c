//! Tail digests
//!
//! A timer samples the ring at a fixed interval and publishes the newest
//! lines as plain text. Nothing is published when the text did not change,
//! so a digest's `seq` only moves with content.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::ring::SharedRing;

static ANSI_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-9;?<>=!]*[ -/]*[@-~]",
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|\x1b[P^_][^\x1b]*\x1b\\",
        r"|\x1b[()*+][A-Za-z0-9]",
        r"|\x1b[=>78DEHMNOPZc]",
    ))
    .unwrap()
});

/// Remove escape sequences and stray control characters
pub fn strip_ansi(text: &str) -> String {
    ANSI_REGEX
        .replace_all(text, "")
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\r' || *c == '\t')
        .collect()
}

/// Newest `n` non-empty plain-text lines. A carriage return inside a line
/// means the terminal overwrote it; only the last segment is kept.
pub fn plain_lines(text: &str, n: usize) -> Vec<String> {
    let stripped = strip_ansi(text);
    let mut lines: Vec<String> = stripped
        .split('\n')
        .map(|line| {
            let line = line.strip_suffix('\r').unwrap_or(line);
            line.rsplit('\r').next().unwrap_or(line).trim_end().to_string()
        })
        .filter(|l| !l.is_empty())
        .collect();
    let keep = lines.len().saturating_sub(n);
    lines.drain(..keep);
    lines
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TailDigest {
    pub text: String,
    pub seq: u64,
}

/// Produces a digest only when the visible text changed
#[derive(Debug)]
pub struct TailDigester {
    lines: usize,
    seq: u64,
    last_head: Option<u64>,
    last_text: Option<String>,
}

impl TailDigester {
    pub fn new(lines: usize) -> Self {
        Self {
            lines,
            seq: 0,
            last_head: None,
            last_text: None,
        }
    }

    pub fn poll(&mut self, ring: &SharedRing) -> Option<TailDigest> {
        let text = {
            let ring = ring.lock().unwrap_or_else(|e| e.into_inner());
            if self.last_head == Some(ring.head()) {
                return None;
            }
            self.last_head = Some(ring.head());
            ring.tail_text(self.lines)
        };
        if self.last_text.as_deref() == Some(text.as_str()) {
            return None;
        }
        self.seq += 1;
        self.last_text = Some(text.clone());
        Some(TailDigest { text, seq: self.seq })
    }
}

/// Publish digests of `ring` on `tx` every `interval` until aborted
pub fn spawn_tail_task(
    ring: SharedRing,
    lines: usize,
    interval: Duration,
    tx: watch::Sender<Option<TailDigest>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut digester = TailDigester::new(lines);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Some(digest) = digester.poll(&ring) {
                debug!(seq = digest.seq, "Tail digest");
                if tx.send(Some(digest)).is_err() {
                    break;
                }
            }
        }
    })
}
