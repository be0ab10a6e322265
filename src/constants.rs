//! Configuration constants for the live polling session
//!
//! This module contains all the limits and constraints used throughout
//! the session to ensure data integrity and provide consistent boundaries
//! for the different components.

/// Poll configuration constants
pub mod poll {
    /// Maximum length of a poll question in characters
    pub const MAX_QUESTION_LENGTH: usize = 200;
    /// Minimum number of answer options for a poll
    pub const MIN_OPTION_COUNT: usize = 2;
    /// Maximum number of answer options for a poll
    pub const MAX_OPTION_COUNT: usize = 6;
    /// Maximum length of a single option label in characters
    pub const MAX_OPTION_LENGTH: usize = 100;
    /// Minimum poll duration in seconds
    pub const MIN_DURATION: u64 = 10;
    /// Maximum poll duration in seconds
    pub const MAX_DURATION: u64 = 300;
    /// Poll duration in seconds used when the presenter does not pick one
    pub const DEFAULT_DURATION: u64 = 60;
}

/// Roster configuration constants
pub mod roster {
    /// Minimum length of a respondent display name in characters
    pub const MIN_NAME_LENGTH: usize = 2;
    /// Maximum length of a respondent display name in characters
    pub const MAX_NAME_LENGTH: usize = 30;
    /// Maximum number of simultaneously connected respondents
    pub const MAX_RESPONDENT_COUNT: usize = 1000;
}

/// History log configuration constants
pub mod history {
    /// Number of closed polls retained, oldest evicted first
    pub const MAX_ENTRIES: usize = 50;
}

/// Chat side-channel configuration constants
pub mod chat {
    /// Maximum length of a chat message in characters
    pub const MAX_MESSAGE_LENGTH: usize = 500;
    /// Number of chat messages retained, oldest evicted first
    pub const MAX_MESSAGES: usize = 100;
}

/// Session-wide timing constants
pub mod session {
    /// Delay in seconds between the last respondent answering and the poll
    /// closing, so the final live tally can be observed before finalization
    pub const ALL_ANSWERED_GRACE: u64 = 1;
}
