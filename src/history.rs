//! Record of closed polls
//!
//! This module keeps a bounded, append-only log of every closed poll for
//! the presenter's retrospective view. Entries are immutable snapshots;
//! once the log is full the oldest entry is evicted first.

use std::collections::VecDeque;

use serde::Serialize;

use super::poll::PollId;

/// A respondent's final answer as captured when the poll closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseRecord {
    /// The respondent's display name
    pub name: String,
    /// The option index the respondent chose, `None` if they never answered
    pub answer: Option<usize>,
    /// Whether the respondent answered before the poll closed
    pub has_answered: bool,
}

/// Immutable snapshot of a closed poll
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// The closed poll's id
    pub poll_id: PollId,
    /// The question that was asked
    pub question: String,
    /// The ordered option labels
    pub options: Vec<String>,
    /// Final vote counts, positionally aligned with `options`
    pub tally: Vec<u64>,
    /// Per-respondent final answers at close time
    pub responses: Vec<ResponseRecord>,
    /// When the poll closed, as unix milliseconds
    pub closed_at: u64,
}

/// Bounded FIFO log of closed polls
#[derive(Debug, Default)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
}

impl History {
    /// Appends a closed poll, evicting the oldest entry when full
    pub fn append(&mut self, entry: HistoryEntry) {
        if self.entries.len() >= crate::constants::history::MAX_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// The retained entries, oldest first / newest last
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no polls have closed yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
