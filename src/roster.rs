//! Respondent roster and answer status tracking
//!
//! This module owns the record of every registered respondent: their display
//! name, whether they have answered the current poll, and which option they
//! chose. It enforces name validation and uniqueness among currently
//! connected respondents, and the exactly-once rule for answer submission.

use std::collections::{HashMap, hash_map::Entry};

use rustrict::CensorStr;
use serde::Serialize;
use thiserror::Error;

use super::watcher::Id;

/// Errors that can occur during roster operations
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The name is empty or contains only whitespace
    #[error("name cannot be empty")]
    Empty,
    /// The name is shorter than the minimum allowed length
    #[error("name is too short")]
    TooShort,
    /// The name exceeds the maximum allowed length
    #[error("name is too long")]
    TooLong,
    /// The name contains inappropriate content
    #[error("name is inappropriate")]
    Sinful,
    /// The requested name is already in use by a connected respondent
    #[error("name already taken")]
    Used,
    /// The connection is already registered as a respondent
    #[error("connection is already registered")]
    Assigned,
    /// The session has reached the maximum number of respondents
    #[error("session is full")]
    Full,
    /// The connection has no registered respondent
    #[error("please register first")]
    NotRegistered,
    /// The respondent has already answered the current poll
    #[error("already answered")]
    AlreadyAnswered,
    /// No respondent with the given name exists
    #[error("respondent not found")]
    NotFound,
}

/// A registered respondent and their answer status for the current poll
#[derive(Debug, Clone)]
pub struct Respondent {
    /// The respondent's unique display name
    name: String,
    /// Whether the respondent has answered the current poll
    has_answered: bool,
    /// The option index the respondent chose, if any
    answer: Option<usize>,
}

impl Respondent {
    /// The respondent's display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the respondent has answered the current poll
    pub fn has_answered(&self) -> bool {
        self.has_answered
    }

    /// The option index the respondent chose, if any
    pub fn answer(&self) -> Option<usize> {
        self.answer
    }
}

/// Per-respondent status as shown on the presenter's roster view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RespondentStatus {
    /// The respondent's display name
    pub name: String,
    /// Whether the respondent has answered the current poll
    pub has_answered: bool,
}

/// Tracks every registered respondent in the session
///
/// The roster maintains a bidirectional mapping between connection IDs and
/// display names so that uniqueness checks and presenter-initiated removal
/// by name are both cheap.
#[derive(Debug, Default)]
pub struct Roster {
    /// Primary mapping from connection ID to respondent record
    mapping: HashMap<Id, Respondent>,
    /// Reverse mapping from display name to connection ID
    reverse_mapping: HashMap<String, Id>,
}

impl Roster {
    /// Registers a connection under a display name after validation
    ///
    /// The name is trimmed of surrounding whitespace before any checks.
    /// Uniqueness is case-sensitive and only considers currently connected
    /// respondents; a name freed by removal can be registered again.
    ///
    /// # Arguments
    ///
    /// * `id` - The connection to register
    /// * `name` - The requested display name
    ///
    /// # Returns
    ///
    /// The cleaned name that was assigned
    ///
    /// # Errors
    ///
    /// * `Error::Empty` / `Error::TooShort` / `Error::TooLong` - length bounds
    /// * `Error::Sinful` - name contains inappropriate content
    /// * `Error::Used` - name is taken by a connected respondent
    /// * `Error::Assigned` - the connection is already registered
    /// * `Error::Full` - the roster is at capacity
    pub fn register(&mut self, id: Id, name: &str) -> Result<String, Error> {
        let name = rustrict::trim_whitespace(name);
        if name.is_empty() {
            return Err(Error::Empty);
        }
        match name.chars().count() {
            n if n < crate::constants::roster::MIN_NAME_LENGTH => return Err(Error::TooShort),
            n if n > crate::constants::roster::MAX_NAME_LENGTH => return Err(Error::TooLong),
            _ => {}
        }
        if name.is_inappropriate() {
            return Err(Error::Sinful);
        }
        if self.mapping.len() >= crate::constants::roster::MAX_RESPONDENT_COUNT {
            return Err(Error::Full);
        }
        if self.reverse_mapping.contains_key(name) {
            return Err(Error::Used);
        }
        match self.mapping.entry(id) {
            Entry::Occupied(_) => Err(Error::Assigned),
            Entry::Vacant(v) => {
                v.insert(Respondent {
                    name: name.to_owned(),
                    has_answered: false,
                    answer: None,
                });
                self.reverse_mapping.insert(name.to_owned(), id);
                Ok(name.to_owned())
            }
        }
    }

    /// Records an answer for a respondent, enforcing exactly-once
    ///
    /// Option and timing validation belong to the poll lifecycle; this
    /// method only guards registration and double submission.
    ///
    /// # Errors
    ///
    /// * `Error::NotRegistered` - the connection has no respondent
    /// * `Error::AlreadyAnswered` - the respondent has already answered
    pub fn record_answer(&mut self, id: Id, option: usize) -> Result<(), Error> {
        let respondent = self.mapping.get_mut(&id).ok_or(Error::NotRegistered)?;
        if respondent.has_answered {
            return Err(Error::AlreadyAnswered);
        }
        respondent.has_answered = true;
        respondent.answer = Some(option);
        Ok(())
    }

    /// Removes a respondent by connection ID, freeing their name
    ///
    /// # Returns
    ///
    /// The removed record, or `None` if the connection was not registered
    pub fn remove(&mut self, id: Id) -> Option<Respondent> {
        let respondent = self.mapping.remove(&id)?;
        self.reverse_mapping.remove(&respondent.name);
        Some(respondent)
    }

    /// Removes a respondent by display name
    ///
    /// # Returns
    ///
    /// The connection ID that was registered under the name
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` when no connected respondent has the name.
    pub fn remove_by_name(&mut self, name: &str) -> Result<Id, Error> {
        let id = self.reverse_mapping.remove(name).ok_or(Error::NotFound)?;
        self.mapping.remove(&id);
        Ok(id)
    }

    /// Looks up the connection registered under a display name
    pub fn get_id(&self, name: &str) -> Option<Id> {
        self.reverse_mapping.get(name).copied()
    }

    /// Gets the display name of a registered connection
    pub fn get_name(&self, id: Id) -> Option<&str> {
        self.mapping.get(&id).map(|r| r.name.as_str())
    }

    /// Whether the connection is registered as a respondent
    pub fn is_registered(&self, id: Id) -> bool {
        self.mapping.contains_key(&id)
    }

    /// Whether the connection's respondent has answered the current poll
    ///
    /// An unregistered connection has not answered.
    pub fn has_answered(&self, id: Id) -> bool {
        self.mapping.get(&id).is_some_and(Respondent::has_answered)
    }

    /// Clears every respondent's answer state
    ///
    /// Invoked exactly once, when a new poll opens.
    pub fn reset_answers(&mut self) {
        for respondent in self.mapping.values_mut() {
            respondent.has_answered = false;
            respondent.answer = None;
        }
    }

    /// True iff the roster is non-empty and every respondent has answered
    ///
    /// An empty roster is not considered all-answered, so a poll cannot
    /// auto-close the instant it opens with zero respondents.
    pub fn all_answered(&self) -> bool {
        !self.mapping.is_empty() && self.mapping.values().all(|r| r.has_answered)
    }

    /// Number of respondents who have answered the current poll
    pub fn answered_count(&self) -> usize {
        self.mapping.values().filter(|r| r.has_answered).count()
    }

    /// Number of connected respondents
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    /// Whether no respondents are connected
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Iterates over the recorded answers of the current poll
    pub fn answers(&self) -> impl Iterator<Item = usize> + '_ {
        self.mapping.values().filter_map(Respondent::answer)
    }

    /// Iterates over all respondent records
    pub fn iter(&self) -> impl Iterator<Item = &Respondent> {
        self.mapping.values()
    }

    /// Per-respondent status list for the presenter's roster view
    ///
    /// Sorted by name so repeated broadcasts are stable.
    pub fn statuses(&self) -> Vec<RespondentStatus> {
        let mut statuses = self
            .mapping
            .values()
            .map(|r| RespondentStatus {
                name: r.name.clone(),
                has_answered: r.has_answered,
            })
            .collect::<Vec<_>>();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}
