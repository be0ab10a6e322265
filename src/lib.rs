//! # Livepoll Session Library
//!
//! This library provides the core state machine for a real-time classroom
//! polling session: one presenter broadcasts multiple-choice polls to many
//! respondents, collects at most one answer per respondent, and publishes
//! aggregated results when everyone has answered, when the deadline elapses,
//! or when the presenter closes the poll manually.
//!
//! The library is transport-agnostic: all outgoing traffic flows through the
//! [`tunnel::Tunnel`] trait and timers are values handed to a caller-supplied
//! scheduler, so the session can sit behind WebSockets, Server-Sent Events,
//! or an in-memory harness in tests.

#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::ignored_unit_patterns)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::wildcard_imports)]

use serde::{Deserialize, Serialize};

pub mod constants;

pub mod chat;
pub mod history;
pub mod poll;
pub mod roster;
pub mod session;
pub mod tally;
pub mod tunnel;
pub mod watcher;

use chat::ChatMessage;
use poll::{PollId, PollSnapshot};
use roster::RespondentStatus;
use session::StateSnapshot;

/// Converts a point in time to unix milliseconds for the wire
pub(crate) fn unix_millis(time: web_time::SystemTime) -> u64 {
    time.duration_since(web_time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Messages sent to notify connected clients about session changes
///
/// Every state mutation is followed by zero or more of these broadcasts,
/// fanned out by the session through the transport layer. Delivery is
/// best-effort: a missing tunnel is skipped, never an error.
#[derive(Debug, Serialize, Clone)]
pub enum UpdateMessage {
    /// The presenter's roster view changed (join, answer, leave)
    RosterUpdate(Vec<RespondentStatus>),
    /// A new poll opened and is accepting answers
    PollOpened(PollSnapshot),
    /// (PRESENTER ONLY) Live aggregation after an answer was recorded
    LiveTally {
        /// Vote counts positionally aligned with the poll's options
        tally: Vec<u64>,
        /// Number of respondents who have answered so far
        answered_count: usize,
        /// Number of connected respondents
        total_respondents: usize,
    },
    /// The current poll closed; final results are attached
    PollClosed {
        /// The closed poll's id
        poll_id: PollId,
        /// The question that was asked
        question: String,
        /// The ordered option labels
        options: Vec<String>,
        /// Final vote counts positionally aligned with `options`
        tally: Vec<u64>,
    },
    /// A chat message was posted
    Chat(ChatMessage),
    /// The receiving respondent was removed by the presenter
    Removed,
}

/// Messages sent to synchronize a client's view with the session state
///
/// Sent when a connection joins, registers, or reconnects, carrying a full
/// snapshot rather than an incremental change.
#[derive(Debug, Serialize, Clone)]
pub enum SyncMessage {
    /// Full reconciliation snapshot of the session
    State(StateSnapshot),
}

/// Alarm messages for timed events in the poll lifecycle
///
/// Each armed timer carries the id of the poll it was armed for; when it
/// fires, the session checks that id against the current poll and silently
/// drops stale alarms, so a timer can never act on a later poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmMessage {
    /// The poll's answer window elapsed
    Deadline {
        /// The poll the deadline timer was armed for
        poll_id: PollId,
    },
    /// The short grace period after every respondent answered elapsed
    AllAnsweredGrace {
        /// The poll the grace timer was armed for
        poll_id: PollId,
    },
}

impl UpdateMessage {
    /// Converts the update message to a JSON string for transmission
    ///
    /// # Panics
    ///
    /// This method panics if serialization fails, which should never happen
    /// with the default JSON serializer for well-formed data.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }
}

impl SyncMessage {
    /// Converts the sync message to a JSON string for transmission
    ///
    /// # Panics
    ///
    /// This method panics if serialization fails, which should never happen
    /// with the default JSON serializer for well-formed data.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_update_message_to_message() {
        let message = UpdateMessage::RosterUpdate(vec![RespondentStatus {
            name: "Alice".to_owned(),
            has_answered: false,
        }]);
        let json = message.to_message();

        assert!(json.contains("RosterUpdate"));
        assert!(json.contains("Alice"));
    }

    #[test]
    fn test_poll_closed_to_message() {
        let message = UpdateMessage::PollClosed {
            poll_id: PollId::first(),
            question: "Pick a color".to_owned(),
            options: vec!["Red".to_owned(), "Blue".to_owned()],
            tally: vec![1, 2],
        };
        let json = message.to_message();

        assert!(json.contains("PollClosed"));
        assert!(json.contains("Pick a color"));
    }

    #[test]
    fn test_alarm_message_round_trip() {
        let alarm = AlarmMessage::Deadline {
            poll_id: PollId::first(),
        };
        let json = serde_json::to_string(&alarm).unwrap();
        let back: AlarmMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(alarm, back);
    }

    #[test]
    fn test_unix_millis_epoch() {
        assert_eq!(unix_millis(web_time::SystemTime::UNIX_EPOCH), 0);
    }
}
