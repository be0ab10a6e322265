//! Poll definition and runtime value
//!
//! This module defines the shape of a poll: the validated configuration a
//! presenter submits (question, options, duration) and the runtime value the
//! session holds while a poll is open, including its deadline. The state
//! machine that opens and closes polls lives in [`crate::session`].

use std::{collections::HashSet, time::Duration};

use garde::Validate;
use serde::{Deserialize, Serialize};
use web_time::SystemTime;

use crate::unix_millis;

/// A monotonically-assigned identifier for a poll
///
/// Ids increase by one for every poll opened in the session, so history
/// entries sort naturally and a stale timer can be told apart from the
/// current poll by comparing ids.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
pub struct PollId(u64);

impl PollId {
    /// The id of the first poll of a session
    pub fn first() -> Self {
        Self(1)
    }

    /// The id following this one
    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

type ValidationResult = garde::Result;

/// Validates that a duration falls within specified bounds
fn validate_duration<const MIN_SECONDS: u64, const MAX_SECONDS: u64>(
    field: &'static str,
    val: &Duration,
) -> ValidationResult {
    if (MIN_SECONDS..=MAX_SECONDS).contains(&val.as_secs()) {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "{field} is outside of the bounds [{MIN_SECONDS},{MAX_SECONDS}]",
        )))
    }
}

/// Validates the time window a poll stays open for answers
fn validate_poll_duration(val: &Duration) -> ValidationResult {
    validate_duration::<
        { crate::constants::poll::MIN_DURATION },
        { crate::constants::poll::MAX_DURATION },
    >("duration", val)
}

/// Validates the poll question: non-empty after trimming, bounded length
fn validate_question(val: &str) -> ValidationResult {
    if val.trim().is_empty() {
        return Err(garde::Error::new("question cannot be empty"));
    }
    if val.chars().count() > crate::constants::poll::MAX_QUESTION_LENGTH {
        return Err(garde::Error::new(format!(
            "question is longer than {} characters",
            crate::constants::poll::MAX_QUESTION_LENGTH
        )));
    }
    Ok(())
}

/// Validates the option labels: count bounds, length, distinctness
fn validate_options(val: &[String]) -> ValidationResult {
    if val.len() < crate::constants::poll::MIN_OPTION_COUNT {
        return Err(garde::Error::new(format!(
            "at least {} options are required",
            crate::constants::poll::MIN_OPTION_COUNT
        )));
    }
    if val.len() > crate::constants::poll::MAX_OPTION_COUNT {
        return Err(garde::Error::new(format!(
            "at most {} options are allowed",
            crate::constants::poll::MAX_OPTION_COUNT
        )));
    }
    let mut seen = HashSet::new();
    for option in val {
        let trimmed = option.trim();
        if trimmed.is_empty() {
            return Err(garde::Error::new("options cannot be empty"));
        }
        if trimmed.chars().count() > crate::constants::poll::MAX_OPTION_LENGTH {
            return Err(garde::Error::new(format!(
                "option labels are limited to {} characters",
                crate::constants::poll::MAX_OPTION_LENGTH
            )));
        }
        if !seen.insert(trimmed) {
            return Err(garde::Error::new(format!("duplicate option: {trimmed}")));
        }
    }
    Ok(())
}

fn default_duration() -> Duration {
    Duration::from_secs(crate::constants::poll::DEFAULT_DURATION)
}

/// Configuration for a poll as submitted by the presenter
///
/// The configuration is normalized (question and options trimmed, blank
/// options dropped) before validation, so `" Red "` and `"Red"` are the
/// same label and trailing empty form fields are ignored.
#[serde_with::serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PollConfig {
    /// The question text shown to every respondent
    #[garde(custom(|v, _| validate_question(v)))]
    question: String,
    /// The ordered answer options respondents pick from
    #[garde(custom(|v, _| validate_options(v)))]
    options: Vec<String>,
    /// How long the poll accepts answers
    #[garde(custom(|v, _| validate_poll_duration(v)))]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_duration")]
    duration: Duration,
}

impl PollConfig {
    /// Creates a configuration from raw parts
    ///
    /// A missing duration falls back to the default of
    /// [`crate::constants::poll::DEFAULT_DURATION`] seconds.
    pub fn new(
        question: impl Into<String>,
        options: Vec<String>,
        duration: Option<Duration>,
    ) -> Self {
        Self {
            question: question.into(),
            options,
            duration: duration.unwrap_or_else(default_duration),
        }
    }

    /// Trims the question and options and drops blank option labels
    pub(crate) fn normalize(&mut self) {
        self.question = self.question.trim().to_owned();
        self.options = self
            .options
            .iter()
            .map(|option| option.trim().to_owned())
            .filter(|option| !option.is_empty())
            .collect();
    }

    /// The question text
    pub fn question(&self) -> &str {
        &self.question
    }

    /// The ordered option labels
    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// How long the poll accepts answers
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// A poll that is currently open and accepting answers
#[derive(Debug, Clone)]
pub struct Poll {
    /// The poll's session-unique id
    id: PollId,
    /// The normalized, validated configuration
    config: PollConfig,
    /// When the poll opened
    started: SystemTime,
    /// When the poll stops accepting answers
    ends: SystemTime,
}

impl Poll {
    /// Creates an open poll from a normalized configuration
    pub(crate) fn new(id: PollId, config: PollConfig, now: SystemTime) -> Self {
        let ends = now + config.duration;
        Self {
            id,
            config,
            started: now,
            ends,
        }
    }

    /// The poll's session-unique id
    pub fn id(&self) -> PollId {
        self.id
    }

    /// The question text
    pub fn question(&self) -> &str {
        self.config.question()
    }

    /// The ordered option labels
    pub fn options(&self) -> &[String] {
        self.config.options()
    }

    /// Number of answer options
    pub fn option_count(&self) -> usize {
        self.config.options().len()
    }

    /// Whether `option` is a valid index into the options
    pub fn has_option(&self, option: usize) -> bool {
        option < self.option_count()
    }

    /// When the poll opened
    pub fn started(&self) -> SystemTime {
        self.started
    }

    /// Whether the deadline has passed at `now`
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now > self.ends
    }

    /// Time remaining until the deadline, zero once passed
    pub fn time_left(&self, now: SystemTime) -> Duration {
        self.ends.duration_since(now).unwrap_or(Duration::ZERO)
    }

    /// A wire-level view of the poll as of `now`
    pub fn snapshot(&self, now: SystemTime) -> PollSnapshot {
        PollSnapshot {
            id: self.id,
            question: self.config.question().to_owned(),
            options: self.config.options().to_vec(),
            duration_seconds: self.config.duration().as_secs(),
            time_left_seconds: self.time_left(now).as_secs(),
            ends_at: unix_millis(self.ends),
        }
    }
}

/// Wire-level view of an open poll
///
/// `ends_at` is an absolute server timestamp and `time_left_seconds` a
/// relative countdown; clients combine the two with the snapshot's server
/// clock to correct for skew.
#[derive(Debug, Clone, Serialize)]
pub struct PollSnapshot {
    /// The poll's id
    pub id: PollId,
    /// The question text
    pub question: String,
    /// The ordered option labels
    pub options: Vec<String>,
    /// The full answer window in seconds
    pub duration_seconds: u64,
    /// Seconds remaining until the deadline
    pub time_left_seconds: u64,
    /// Deadline as unix milliseconds of the server clock
    pub ends_at: u64,
}
