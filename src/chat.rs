//! Free-text chat side-channel
//!
//! A stateless fan-out with a bounded retention window: messages are
//! validated, censored, stamped with a monotonic id, and kept in a FIFO
//! log so late joiners can fetch recent context. Chat carries no
//! cross-references to polls or roster entries beyond the denormalized
//! sender name and role.

use std::collections::VecDeque;

use rustrict::CensorStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when posting a chat message
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The message is empty or contains only whitespace
    #[error("message cannot be empty")]
    Empty,
    /// The message exceeds the maximum allowed length
    #[error("message is too long")]
    TooLong,
}

/// The role of a chat message's sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    /// Sent by the presenter
    Presenter,
    /// Sent by a respondent
    Respondent,
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Monotonic, timestamp-derived message id
    pub id: u64,
    /// The message text, trimmed and censored
    pub message: String,
    /// The sender's display name
    pub sender: String,
    /// The sender's role
    pub role: SenderRole,
    /// When the message was posted, as unix milliseconds
    pub timestamp: u64,
}

/// Bounded FIFO log of chat messages
#[derive(Debug, Default)]
pub struct ChatLog {
    messages: VecDeque<ChatMessage>,
    /// Highest id handed out so far, so ids stay strictly increasing even
    /// when two messages land in the same millisecond
    last_id: u64,
}

impl ChatLog {
    /// Validates and appends a message, evicting the oldest when full
    ///
    /// The text is trimmed and profanity is censored rather than rejected,
    /// so a message is never silently dropped from the conversation.
    ///
    /// # Arguments
    ///
    /// * `message` - The raw message text
    /// * `sender` - The sender's display name
    /// * `role` - The sender's role
    /// * `now_millis` - Current server time as unix milliseconds
    ///
    /// # Returns
    ///
    /// The stored message, for broadcasting to all connections
    ///
    /// # Errors
    ///
    /// * `Error::Empty` - text is empty after trimming
    /// * `Error::TooLong` - text exceeds the maximum length
    pub fn post(
        &mut self,
        message: &str,
        sender: &str,
        role: SenderRole,
        now_millis: u64,
    ) -> Result<ChatMessage, Error> {
        let message = rustrict::trim_whitespace(message);
        if message.is_empty() {
            return Err(Error::Empty);
        }
        if message.chars().count() > crate::constants::chat::MAX_MESSAGE_LENGTH {
            return Err(Error::TooLong);
        }

        self.last_id = now_millis.max(self.last_id + 1);
        let chat_message = ChatMessage {
            id: self.last_id,
            message: message.censor(),
            sender: sender.to_owned(),
            role,
            timestamp: now_millis,
        };

        if self.messages.len() >= crate::constants::chat::MAX_MESSAGES {
            self.messages.pop_front();
        }
        self.messages.push_back(chat_message.clone());

        Ok(chat_message)
    }

    /// The retained messages, oldest first / newest last
    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    /// Number of retained messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether no messages have been posted yet
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
