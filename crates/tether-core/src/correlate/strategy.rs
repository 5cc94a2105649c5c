//! Correlation strategies
//!
//! Each strategy turns the candidate set into matches tagged with its
//! confidence tier. Strategies run in order and the first one that yields
//! any match wins; inside a tier the smallest timestamp delta wins, then the
//! most recently modified log.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::store::{DebugFile, LogCandidate};

/// How a mapping was established, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Manual,
    DebugFile,
    FirstEntry,
    Recency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// A debug file started within `tolerance` of the process names its log
    DebugFile { tolerance: Duration },
    /// The log's first entry is within `tolerance` of the process start
    FirstEntry { tolerance: Duration },
    /// Most recently modified unclaimed log
    Recency,
}

/// What the strategies look at
pub struct CorrelationInput<'a> {
    pub candidates: &'a [LogCandidate],
    pub debug_files: &'a [DebugFile],
    /// Start of the agent process, when one was found
    pub started_at: Option<DateTime<Utc>>,
    /// Logs already mapped to other panes
    pub claimed: &'a HashSet<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub path: PathBuf,
    pub session_id: String,
    pub confidence: Confidence,
    pub delta: Duration,
    pub modified: DateTime<Utc>,
}

fn within(a: DateTime<Utc>, b: DateTime<Utc>, tolerance: Duration) -> Option<Duration> {
    let delta = (a - b).abs();
    (delta <= tolerance).then_some(delta)
}

impl Strategy {
    /// Default chain with the given tolerances
    pub fn chain(debug_tolerance: Duration, first_entry_tolerance: Duration) -> Vec<Strategy> {
        vec![
            Strategy::DebugFile {
                tolerance: debug_tolerance,
            },
            Strategy::FirstEntry {
                tolerance: first_entry_tolerance,
            },
            Strategy::Recency,
        ]
    }

    pub fn confidence(&self) -> Confidence {
        match self {
            Strategy::DebugFile { .. } => Confidence::DebugFile,
            Strategy::FirstEntry { .. } => Confidence::FirstEntry,
            Strategy::Recency => Confidence::Recency,
        }
    }

    pub fn evaluate(&self, input: &CorrelationInput<'_>) -> Vec<Match> {
        let confidence = self.confidence();
        let unclaimed = input
            .candidates
            .iter()
            .filter(|c| !input.claimed.contains(&c.path));
        let matched = |c: &LogCandidate, delta: Duration| Match {
            path: c.path.clone(),
            session_id: c.session_id.clone(),
            confidence,
            delta,
            modified: c.modified,
        };

        match *self {
            Strategy::DebugFile { tolerance } => {
                let Some(started) = input.started_at else {
                    return Vec::new();
                };
                unclaimed
                    .filter_map(|c| {
                        input
                            .debug_files
                            .iter()
                            .filter(|d| d.session_id == c.session_id)
                            .filter_map(|d| within(d.first_timestamp, started, tolerance))
                            .min()
                            .map(|delta| matched(c, delta))
                    })
                    .collect()
            }
            Strategy::FirstEntry { tolerance } => {
                let Some(started) = input.started_at else {
                    return Vec::new();
                };
                unclaimed
                    .filter_map(|c| {
                        c.first_entry
                            .and_then(|first| within(first, started, tolerance))
                            .map(|delta| matched(c, delta))
                    })
                    .collect()
            }
            Strategy::Recency => unclaimed.map(|c| matched(c, Duration::zero())).collect(),
        }
    }
}

/// Run `strategies` in order; first non-empty tier wins, then tie-break
pub fn pick(strategies: &[Strategy], input: &CorrelationInput<'_>) -> Option<Match> {
    strategies.iter().find_map(|strategy| {
        let mut matches = strategy.evaluate(input);
        matches.sort_by(|a, b| a.delta.cmp(&b.delta).then(b.modified.cmp(&a.modified)));
        matches.into_iter().next()
    })
}
