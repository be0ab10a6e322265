//! Session facade and poll lifecycle state machine
//!
//! This module ties the other modules together: it owns the roster, the
//! connection registry, the poll state machine, the history log, and the
//! chat log, and exposes the single mutation surface the transport layer
//! calls into. All mutations funnel through `&mut self`, so the embedder
//! serializes access (one lock or actor per session) and no operation ever
//! observes a half-applied change.
//!
//! Closing a poll is single-flight: the deadline timer, the all-answered
//! grace timer, and a manual close can all race, but whichever reaches the
//! session first takes the poll out of the open state and the others find
//! nothing left to close.

use std::{mem, time::Duration};

use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;
use tracing::{debug, info};
use web_time::SystemTime;

use super::{
    AlarmMessage, SyncMessage, UpdateMessage,
    chat::{self, ChatLog, ChatMessage, SenderRole},
    history::{History, HistoryEntry, ResponseRecord},
    poll::{Poll, PollConfig, PollId, PollSnapshot},
    roster::{self, RespondentStatus, Roster},
    tally::tally,
    tunnel::Tunnel,
    unix_millis,
    watcher::{self, Id, Role, Watchers},
};

/// Errors a session operation can produce
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A roster operation failed (registration, removal, answering)
    #[error(transparent)]
    Roster(#[from] roster::Error),
    /// A chat message was rejected
    #[error(transparent)]
    Chat(#[from] chat::Error),
    /// A connection could not be added
    #[error(transparent)]
    Watcher(#[from] watcher::Error),
    /// The submitted poll configuration failed validation
    #[error("invalid poll: {0}")]
    InvalidPoll(String),
    /// A poll is already open and still accepting answers
    #[error("a poll is already active")]
    PollStillOpen,
    /// The answer targets a poll that is not the currently open one
    #[error("poll is not active")]
    PollNotActive,
    /// The chosen option is not part of the poll
    #[error("option is not part of the poll")]
    InvalidOption,
    /// The answer arrived after the poll's deadline
    #[error("poll deadline has passed")]
    Expired,
    /// There is no open poll to close
    #[error("no active poll")]
    NoActivePoll,
    /// The request is not allowed for the connection's current role
    #[error("request not allowed")]
    NotAllowed,
}

/// Coarse category of an error, included in failure acknowledgements so
/// clients can react uniformly without matching on message text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Malformed or out-of-bounds input
    Validation,
    /// The request conflicts with current state
    Conflict,
    /// The referenced entity does not exist
    NotFound,
    /// The request arrived outside its time window
    Timing,
}

impl Error {
    /// The coarse category this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Roster(error) => match error {
                roster::Error::Empty
                | roster::Error::TooShort
                | roster::Error::TooLong
                | roster::Error::Sinful => ErrorKind::Validation,
                roster::Error::Used
                | roster::Error::Assigned
                | roster::Error::Full
                | roster::Error::AlreadyAnswered => ErrorKind::Conflict,
                roster::Error::NotRegistered | roster::Error::NotFound => ErrorKind::NotFound,
            },
            Self::Chat(_) | Self::InvalidPoll(_) | Self::InvalidOption | Self::NotAllowed => {
                ErrorKind::Validation
            }
            Self::Watcher(_) | Self::PollStillOpen => ErrorKind::Conflict,
            Self::PollNotActive | Self::NoActivePoll => ErrorKind::NotFound,
            Self::Expired => ErrorKind::Timing,
        }
    }
}

/// Acknowledgement returned to the connection that issued a request
///
/// Broadcasts fan out to everyone; the acknowledgement goes only to the
/// requester, reporting success or the reason for rejection.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    /// Whether the request was applied
    pub ok: bool,
    /// The id of the poll that was opened, for poll creation requests
    pub poll_id: Option<PollId>,
    /// Human-readable rejection reason
    pub error: Option<String>,
    /// Coarse category of the rejection
    pub kind: Option<ErrorKind>,
}

impl Ack {
    /// A successful acknowledgement
    pub fn ok() -> Self {
        Self {
            ok: true,
            poll_id: None,
            error: None,
            kind: None,
        }
    }

    /// A successful acknowledgement carrying the opened poll's id
    pub fn opened(poll_id: PollId) -> Self {
        Self {
            poll_id: Some(poll_id),
            ..Self::ok()
        }
    }

    /// A failure acknowledgement for the given error
    pub fn err(error: &Error) -> Self {
        Self {
            ok: false,
            poll_id: None,
            error: Some(error.to_string()),
            kind: Some(error.kind()),
        }
    }

    /// Whether the request was applied
    pub fn is_ok(&self) -> bool {
        self.ok
    }
}

impl From<Result<(), Error>> for Ack {
    fn from(result: Result<(), Error>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(error) => Self::err(&error),
        }
    }
}

impl From<Result<PollId, Error>> for Ack {
    fn from(result: Result<PollId, Error>) -> Self {
        match result {
            Ok(poll_id) => Self::opened(poll_id),
            Err(error) => Self::err(&error),
        }
    }
}

/// Messages a not-yet-registered connection can send
#[derive(Debug, Clone, Deserialize)]
pub enum IncomingUnassignedMessage {
    /// Request to join the roster under a display name
    Register {
        /// The requested display name
        name: String,
    },
}

/// Messages a registered respondent can send
#[derive(Debug, Clone, Deserialize)]
pub enum IncomingRespondentMessage {
    /// Submit an answer to the currently open poll
    SubmitAnswer {
        /// The poll the answer is for; stale ids are rejected
        poll_id: PollId,
        /// Index of the chosen option
        option: usize,
    },
    /// Post a chat message under the respondent's registered name
    Chat {
        /// The message text
        message: String,
    },
}

/// Messages the presenter can send
#[derive(Debug, Clone, Deserialize)]
pub enum IncomingPresenterMessage {
    /// Open a new poll
    CreatePoll(PollConfig),
    /// Close the currently open poll immediately
    ClosePoll,
    /// Remove a respondent from the session by name
    RemoveRespondent {
        /// The display name of the respondent to remove
        name: String,
    },
    /// Post a chat message under a chosen display name
    Chat {
        /// The message text
        message: String,
        /// The display name to post under
        sender: String,
    },
}

/// An incoming request from a connection, partitioned by the role that may
/// send it
#[derive(Debug, Clone, Deserialize)]
pub enum IncomingMessage {
    /// A request only unassigned connections can make
    Unassigned(IncomingUnassignedMessage),
    /// A request only respondents can make
    Respondent(IncomingRespondentMessage),
    /// A request only the presenter can make
    Presenter(IncomingPresenterMessage),
}

impl IncomingMessage {
    /// Checks whether the message is allowed for the sender's current role
    fn follows(&self, role: Role) -> bool {
        matches!(
            (self, role),
            (Self::Unassigned(_), Role::Unassigned)
                | (Self::Respondent(_), Role::Respondent)
                | (Self::Presenter(_), Role::Presenter)
        )
    }
}

/// What caused a poll to close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTrigger {
    /// The answer window elapsed
    Deadline,
    /// Every respondent answered and the grace period elapsed
    AllAnswered,
    /// The presenter closed the poll
    Manual,
}

/// The poll lifecycle state
#[derive(Debug, Default)]
enum State {
    /// No poll is accepting answers
    #[default]
    Idle,
    /// A poll is open and accepting answers
    Open(Poll),
}

/// Full reconciliation snapshot of the session, personalized for one
/// connection
///
/// Sent on join, registration, and reconnect so a client can rebuild its
/// view from scratch. `server_time` lets clients correct deadline
/// countdowns for clock skew.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    /// The currently open poll, if any
    pub current_poll: Option<PollSnapshot>,
    /// Whether the receiving connection is registered as a respondent
    pub is_registered: bool,
    /// The receiving connection's registered name, if any
    pub respondent_name: Option<String>,
    /// Per-respondent status of everyone on the roster
    pub roster: Vec<RespondentStatus>,
    /// The server clock at snapshot time, as unix milliseconds
    pub server_time: u64,
}

/// A single polling session: one presenter, many respondents, at most one
/// open poll at a time
#[derive(Debug)]
pub struct Session {
    /// Connection registry and fan-out helpers
    watchers: Watchers,
    /// Registered respondents and their answer status
    roster: Roster,
    /// The poll lifecycle state
    state: State,
    /// The id the next poll will receive
    next_poll_id: PollId,
    /// Bounded log of closed polls
    history: History,
    /// Bounded log of chat messages
    chat: ChatLog,
}

impl Session {
    /// Creates a session with the presenter already connected
    pub fn new(presenter_id: Id) -> Self {
        Self {
            watchers: Watchers::with_presenter_id(presenter_id),
            roster: Roster::default(),
            state: State::default(),
            next_poll_id: PollId::first(),
            history: History::default(),
            chat: ChatLog::default(),
        }
    }

    /// Adds a new, not-yet-registered connection and sends it a snapshot
    ///
    /// # Errors
    ///
    /// Returns an error when the session is at its connection limit.
    pub fn add_unassigned<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        watcher: Id,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        self.watchers.add_watcher(watcher, Role::Unassigned)?;
        self.watchers.send_state(
            &SyncMessage::State(self.snapshot_for(watcher)),
            watcher,
            tunnel_finder,
        );
        Ok(())
    }

    /// Handles an incoming request from a connection
    ///
    /// The message is checked against the sender's current role before it is
    /// dispatched; a mismatch is rejected without touching any state. The
    /// returned acknowledgement goes only to the requester.
    ///
    /// # Arguments
    ///
    /// * `watcher_id` - The connection the request came from
    /// * `message` - The request
    /// * `schedule_message` - Callback to arm a timer that will deliver an
    ///   alarm back to [`Session::receive_alarm`] after the given duration
    /// * `tunnel_finder` - Function to retrieve the tunnel for a connection
    pub fn receive_message<
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        S: FnMut(AlarmMessage, Duration),
    >(
        &mut self,
        watcher_id: Id,
        message: IncomingMessage,
        schedule_message: S,
        tunnel_finder: F,
    ) -> Ack {
        let Some(role) = self.watchers.get_role(watcher_id) else {
            return Ack::err(&Error::NotAllowed);
        };
        if !message.follows(role) {
            return Ack::err(&Error::NotAllowed);
        }

        match message {
            IncomingMessage::Unassigned(IncomingUnassignedMessage::Register { name }) => {
                Ack::from(self.register(watcher_id, &name, tunnel_finder))
            }
            IncomingMessage::Respondent(IncomingRespondentMessage::SubmitAnswer {
                poll_id,
                option,
            }) => Ack::from(self.submit_answer(
                watcher_id,
                poll_id,
                option,
                schedule_message,
                tunnel_finder,
            )),
            IncomingMessage::Respondent(IncomingRespondentMessage::Chat { message }) => {
                Ack::from(self.send_respondent_chat(watcher_id, &message, tunnel_finder))
            }
            IncomingMessage::Presenter(IncomingPresenterMessage::CreatePoll(config)) => {
                Ack::from(self.create_poll(config, schedule_message, tunnel_finder))
            }
            IncomingMessage::Presenter(IncomingPresenterMessage::ClosePoll) => {
                Ack::from(self.close_poll(tunnel_finder))
            }
            IncomingMessage::Presenter(IncomingPresenterMessage::RemoveRespondent { name }) => {
                Ack::from(self.remove_respondent(&name, tunnel_finder))
            }
            IncomingMessage::Presenter(IncomingPresenterMessage::Chat { message, sender }) => {
                Ack::from(self.send_presenter_chat(&message, &sender, tunnel_finder))
            }
        }
    }

    /// Handles a fired timer
    ///
    /// Timers are never cancelled when a poll closes early; instead each
    /// alarm carries the id of the poll it was armed for and is dropped here
    /// when that poll is no longer the open one.
    pub fn receive_alarm<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        message: AlarmMessage,
        tunnel_finder: F,
    ) {
        let (poll_id, trigger) = match message {
            AlarmMessage::Deadline { poll_id } => (poll_id, CloseTrigger::Deadline),
            AlarmMessage::AllAnsweredGrace { poll_id } => (poll_id, CloseTrigger::AllAnswered),
        };

        match &self.state {
            State::Open(poll) if poll.id() == poll_id => {
                self.finalize_poll(trigger, tunnel_finder);
            }
            _ => debug!(%poll_id, "stale alarm ignored"),
        }
    }

    /// Registers an unassigned connection as a respondent
    ///
    /// On success the connection becomes a respondent, the presenter's
    /// roster view is refreshed, and the new respondent receives a full
    /// snapshot including any currently open poll.
    ///
    /// # Errors
    ///
    /// Name validation and uniqueness errors from the roster, or
    /// [`Error::NotAllowed`] when the connection already holds a role.
    pub fn register<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        watcher: Id,
        name: &str,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        if self.watchers.get_role(watcher) != Some(Role::Unassigned) {
            return Err(Error::NotAllowed);
        }

        let name = self.roster.register(watcher, name)?;
        self.watchers.update_role(watcher, Role::Respondent);
        debug!(%watcher, name, "respondent registered");

        self.announce_roster(&tunnel_finder);
        self.watchers.send_state(
            &SyncMessage::State(self.snapshot_for(watcher)),
            watcher,
            tunnel_finder,
        );
        Ok(())
    }

    /// Opens a new poll
    ///
    /// An open poll whose respondents have all answered is finalized first,
    /// so a presenter moving quickly never needs an explicit close between
    /// polls. An open poll that is still collecting answers blocks creation.
    ///
    /// The deadline timer is armed through `schedule_message`, tagged with
    /// the new poll's id.
    ///
    /// # Errors
    ///
    /// [`Error::PollStillOpen`] when a poll is still collecting answers, or
    /// [`Error::InvalidPoll`] when the configuration fails validation.
    pub fn create_poll<T: Tunnel, F: Fn(Id) -> Option<T>, S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        mut config: PollConfig,
        mut schedule_message: S,
        tunnel_finder: F,
    ) -> Result<PollId, Error> {
        if matches!(self.state, State::Open(_)) {
            if !self.roster.all_answered() {
                return Err(Error::PollStillOpen);
            }
            self.finalize_poll(CloseTrigger::AllAnswered, &tunnel_finder);
        }

        config.normalize();
        config
            .validate()
            .map_err(|report| Error::InvalidPoll(report.to_string()))?;

        self.roster.reset_answers();

        let id = self.next_poll_id;
        self.next_poll_id = id.next();

        let now = SystemTime::now();
        let duration = config.duration();
        let poll = Poll::new(id, config, now);
        let snapshot = poll.snapshot(now);
        self.state = State::Open(poll);

        schedule_message(AlarmMessage::Deadline { poll_id: id }, duration);
        info!(poll_id = %id, "poll opened");

        self.watchers
            .announce(&UpdateMessage::PollOpened(snapshot), &tunnel_finder);
        self.announce_roster(tunnel_finder);
        Ok(id)
    }

    /// Records a respondent's answer to the currently open poll
    ///
    /// On success the presenter receives a live tally; when this was the
    /// last missing answer, the all-answered grace timer is armed so a
    /// brief window remains for the results to settle before the poll
    /// closes. The poll is never closed from inside this call.
    ///
    /// # Errors
    ///
    /// [`Error::PollNotActive`] when no poll is open or `poll_id` is stale,
    /// [`Error::Expired`] past the deadline, roster errors for unregistered
    /// or double submissions, and [`Error::InvalidOption`] for an option
    /// index outside the poll.
    pub fn submit_answer<T: Tunnel, F: Fn(Id) -> Option<T>, S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        watcher: Id,
        poll_id: PollId,
        option: usize,
        schedule_message: S,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        self.submit_answer_at(
            watcher,
            poll_id,
            option,
            SystemTime::now(),
            schedule_message,
            tunnel_finder,
        )
    }

    fn submit_answer_at<T: Tunnel, F: Fn(Id) -> Option<T>, S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        watcher: Id,
        poll_id: PollId,
        option: usize,
        now: SystemTime,
        mut schedule_message: S,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        let (current_id, option_count, expired) = match &self.state {
            State::Open(poll) => (poll.id(), poll.option_count(), poll.is_expired(now)),
            State::Idle => return Err(Error::PollNotActive),
        };
        if current_id != poll_id {
            return Err(Error::PollNotActive);
        }
        if expired {
            return Err(Error::Expired);
        }
        if !self.roster.is_registered(watcher) {
            return Err(Error::Roster(roster::Error::NotRegistered));
        }
        if self.roster.has_answered(watcher) {
            return Err(Error::Roster(roster::Error::AlreadyAnswered));
        }
        if option >= option_count {
            return Err(Error::InvalidOption);
        }

        self.roster.record_answer(watcher, option)?;
        debug!(%watcher, %poll_id, option, "answer recorded");

        self.watchers.announce_specific(
            Role::Presenter,
            &UpdateMessage::LiveTally {
                tally: tally(option_count, self.roster.answers()),
                answered_count: self.roster.answered_count(),
                total_respondents: self.roster.len(),
            },
            &tunnel_finder,
        );
        self.announce_roster(tunnel_finder);

        if self.roster.all_answered() {
            debug!(%poll_id, "all respondents answered, arming grace timer");
            schedule_message(
                AlarmMessage::AllAnsweredGrace { poll_id },
                Duration::from_secs(crate::constants::session::ALL_ANSWERED_GRACE),
            );
        }
        Ok(())
    }

    /// Closes the currently open poll at the presenter's request
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActivePoll`] when no poll is open.
    pub fn close_poll<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        if self.finalize_poll(CloseTrigger::Manual, tunnel_finder) {
            Ok(())
        } else {
            Err(Error::NoActivePoll)
        }
    }

    /// Takes the poll out of the open state and publishes its results
    ///
    /// The `mem::replace` makes closing single-flight: whichever trigger
    /// arrives first wins, and later triggers find the session idle.
    ///
    /// # Returns
    ///
    /// Whether a poll was actually closed
    fn finalize_poll<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        trigger: CloseTrigger,
        tunnel_finder: F,
    ) -> bool {
        let State::Open(poll) = mem::replace(&mut self.state, State::Idle) else {
            return false;
        };

        let counts = tally(poll.option_count(), self.roster.answers());
        let mut responses = self
            .roster
            .iter()
            .map(|respondent| ResponseRecord {
                name: respondent.name().to_owned(),
                answer: respondent.answer(),
                has_answered: respondent.has_answered(),
            })
            .collect::<Vec<_>>();
        responses.sort_by(|a, b| a.name.cmp(&b.name));

        self.history.append(HistoryEntry {
            poll_id: poll.id(),
            question: poll.question().to_owned(),
            options: poll.options().to_vec(),
            tally: counts.clone(),
            responses,
            closed_at: unix_millis(SystemTime::now()),
        });

        info!(poll_id = %poll.id(), ?trigger, "poll closed");

        self.watchers.announce(
            &UpdateMessage::PollClosed {
                poll_id: poll.id(),
                question: poll.question().to_owned(),
                options: poll.options().to_vec(),
                tally: counts,
            },
            tunnel_finder,
        );
        true
    }

    /// Removes a respondent at the presenter's request
    ///
    /// The removed connection is notified, its tunnel is severed, and its
    /// name becomes available again. Any answer it already gave to the open
    /// poll is discarded with it.
    ///
    /// # Errors
    ///
    /// Returns a roster error when no respondent has the given name.
    pub fn remove_respondent<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        name: &str,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        let id = self.roster.remove_by_name(name)?;
        debug!(%id, name, "respondent removed by presenter");

        self.watchers
            .send_message(&UpdateMessage::Removed, id, &tunnel_finder);
        self.watchers.remove_watcher(id);
        self.watchers.remove_watcher_session(&id, &tunnel_finder);
        self.announce_roster(tunnel_finder);
        Ok(())
    }

    /// Handles a connection disappearing (network drop, tab closed)
    ///
    /// A departed respondent leaves the roster immediately; an open poll
    /// stays open even when everyone remaining has answered, its deadline
    /// or the presenter will close it.
    pub fn connection_closed<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        watcher: Id,
        tunnel_finder: F,
    ) {
        self.watchers.remove_watcher(watcher);
        if let Some(respondent) = self.roster.remove(watcher) {
            debug!(%watcher, name = respondent.name(), "respondent disconnected");
            self.announce_roster(tunnel_finder);
        }
    }

    /// Posts a chat message from a respondent under their registered name
    ///
    /// # Errors
    ///
    /// [`roster::Error::NotRegistered`] when the connection has no roster
    /// entry, or chat validation errors.
    pub fn send_respondent_chat<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        watcher: Id,
        message: &str,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        let sender = self
            .roster
            .get_name(watcher)
            .ok_or(roster::Error::NotRegistered)?
            .to_owned();
        self.post_chat(message, &sender, SenderRole::Respondent, tunnel_finder)
    }

    /// Posts a chat message from the presenter under a chosen display name
    ///
    /// # Errors
    ///
    /// Chat validation errors.
    pub fn send_presenter_chat<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        message: &str,
        sender: &str,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        let sender = match sender.trim() {
            "" => "Presenter",
            trimmed => trimmed,
        };
        self.post_chat(message, sender, SenderRole::Presenter, tunnel_finder)
    }

    fn post_chat<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        message: &str,
        sender: &str,
        role: SenderRole,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        let chat_message =
            self.chat
                .post(message, sender, role, unix_millis(SystemTime::now()))?;
        self.watchers
            .announce(&UpdateMessage::Chat(chat_message), tunnel_finder);
        Ok(())
    }

    /// A full reconciliation snapshot personalized for one connection
    pub fn current_state(&self, watcher: Id) -> StateSnapshot {
        self.snapshot_for(watcher)
    }

    fn snapshot_for(&self, watcher: Id) -> StateSnapshot {
        let now = SystemTime::now();
        StateSnapshot {
            current_poll: match &self.state {
                State::Open(poll) => Some(poll.snapshot(now)),
                State::Idle => None,
            },
            is_registered: self.roster.is_registered(watcher),
            respondent_name: self.roster.get_name(watcher).map(ToOwned::to_owned),
            roster: self.roster.statuses(),
            server_time: unix_millis(now),
        }
    }

    /// The id of the currently open poll, if any
    pub fn current_poll_id(&self) -> Option<PollId> {
        match &self.state {
            State::Open(poll) => Some(poll.id()),
            State::Idle => None,
        }
    }

    /// Whether no poll is currently open
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Closed polls, oldest first
    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.entries()
    }

    /// Retained chat messages, oldest first
    pub fn chat_history(&self) -> impl Iterator<Item = &ChatMessage> {
        self.chat.messages()
    }

    fn announce_roster<T: Tunnel, F: Fn(Id) -> Option<T>>(&self, tunnel_finder: F) {
        self.watchers.announce_specific(
            Role::Presenter,
            &UpdateMessage::RosterUpdate(self.roster.statuses()),
            tunnel_finder,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, Mutex},
    };

    use super::*;

    #[derive(Debug, Clone, Default)]
    struct MockTunnel {
        messages: Arc<Mutex<VecDeque<UpdateMessage>>>,
        states: Arc<Mutex<VecDeque<SyncMessage>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl Tunnel for MockTunnel {
        fn send_message(&self, message: &UpdateMessage) {
            self.messages.lock().unwrap().push_back(message.clone());
        }

        fn send_state(&self, state: &SyncMessage) {
            self.states.lock().unwrap().push_back(state.clone());
        }

        fn close(self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    impl MockTunnel {
        fn drain(&self) -> Vec<UpdateMessage> {
            self.messages.lock().unwrap().drain(..).collect()
        }

        fn drain_states(&self) -> Vec<SyncMessage> {
            self.states.lock().unwrap().drain(..).collect()
        }

        fn is_closed(&self) -> bool {
            *self.closed.lock().unwrap()
        }
    }

    fn finder(tunnels: &HashMap<Id, MockTunnel>) -> impl Fn(Id) -> Option<MockTunnel> + '_ {
        move |id| tunnels.get(&id).cloned()
    }

    fn no_alarms(_: AlarmMessage, _: Duration) {}

    fn setup() -> (Session, Id, HashMap<Id, MockTunnel>) {
        let presenter = Id::new();
        let mut tunnels = HashMap::new();
        tunnels.insert(presenter, MockTunnel::default());
        (Session::new(presenter), presenter, tunnels)
    }

    fn join(session: &mut Session, tunnels: &mut HashMap<Id, MockTunnel>, name: &str) -> Id {
        let id = Id::new();
        tunnels.insert(id, MockTunnel::default());
        session.add_unassigned(id, finder(tunnels)).unwrap();
        session.register(id, name, finder(tunnels)).unwrap();
        id
    }

    fn color_poll(seconds: u64) -> PollConfig {
        PollConfig::new(
            "Pick a color",
            vec!["Red".to_owned(), "Blue".to_owned()],
            Some(Duration::from_secs(seconds)),
        )
    }

    fn closed_count(messages: &[UpdateMessage]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, UpdateMessage::PollClosed { .. }))
            .count()
    }

    #[test]
    fn test_register_notifies_presenter_and_syncs_joiner() {
        let (mut session, presenter, mut tunnels) = setup();
        let alice = join(&mut session, &mut tunnels, "Alice");

        let presenter_messages = tunnels[&presenter].drain();
        assert!(presenter_messages.iter().any(|m| matches!(
            m,
            UpdateMessage::RosterUpdate(statuses) if statuses.len() == 1 && statuses[0].name == "Alice"
        )));

        let states = tunnels[&alice].drain_states();
        let SyncMessage::State(snapshot) = states.last().unwrap();
        assert!(snapshot.is_registered);
        assert_eq!(snapshot.respondent_name.as_deref(), Some("Alice"));
        assert!(snapshot.current_poll.is_none());
    }

    #[test]
    fn test_duplicate_name_freed_by_removal() {
        let (mut session, _, mut tunnels) = setup();
        let alice = join(&mut session, &mut tunnels, "Alice");

        let intruder = Id::new();
        tunnels.insert(intruder, MockTunnel::default());
        session.add_unassigned(intruder, finder(&tunnels)).unwrap();
        let error = session
            .register(intruder, "Alice", finder(&tunnels))
            .unwrap_err();
        assert_eq!(error, Error::Roster(roster::Error::Used));
        assert_eq!(error.kind(), ErrorKind::Conflict);

        session.remove_respondent("Alice", finder(&tunnels)).unwrap();
        assert!(tunnels[&alice].is_closed());
        assert!(tunnels[&alice]
            .drain()
            .iter()
            .any(|m| matches!(m, UpdateMessage::Removed)));

        // The freed name is available to the other connection now
        session.register(intruder, "Alice", finder(&tunnels)).unwrap();
    }

    #[test]
    fn test_create_poll_broadcasts_and_arms_deadline() {
        let (mut session, presenter, mut tunnels) = setup();
        let alice = join(&mut session, &mut tunnels, "Alice");
        tunnels[&presenter].drain();
        tunnels[&alice].drain();

        let mut alarms = Vec::new();
        let poll_id = session
            .create_poll(
                color_poll(60),
                |alarm, after| alarms.push((alarm, after)),
                finder(&tunnels),
            )
            .unwrap();

        assert_eq!(
            alarms,
            vec![(AlarmMessage::Deadline { poll_id }, Duration::from_secs(60))]
        );
        for id in [presenter, alice] {
            assert!(tunnels[&id]
                .drain()
                .iter()
                .any(|m| matches!(m, UpdateMessage::PollOpened(_))));
        }
        assert_eq!(session.current_poll_id(), Some(poll_id));
    }

    #[test]
    fn test_create_poll_rejected_while_answers_missing() {
        let (mut session, _, mut tunnels) = setup();
        join(&mut session, &mut tunnels, "Alice");

        session
            .create_poll(color_poll(60), no_alarms, finder(&tunnels))
            .unwrap();
        let error = session
            .create_poll(color_poll(60), no_alarms, finder(&tunnels))
            .unwrap_err();
        assert_eq!(error, Error::PollStillOpen);
        assert_eq!(error.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_create_poll_rejects_invalid_config() {
        let (mut session, _, tunnels) = setup();
        let config = PollConfig::new("Pick", vec!["Red".to_owned()], None);

        let error = session
            .create_poll(config, no_alarms, finder(&tunnels))
            .unwrap_err();
        assert!(matches!(error, Error::InvalidPoll(_)));
        assert!(session.is_idle());
    }

    #[test]
    fn test_submit_answer_sends_live_tally_to_presenter_only() {
        let (mut session, presenter, mut tunnels) = setup();
        let alice = join(&mut session, &mut tunnels, "Alice");
        let bob = join(&mut session, &mut tunnels, "Bob");
        let poll_id = session
            .create_poll(color_poll(60), no_alarms, finder(&tunnels))
            .unwrap();
        for id in [presenter, alice, bob] {
            tunnels[&id].drain();
        }

        session
            .submit_answer(alice, poll_id, 0, no_alarms, finder(&tunnels))
            .unwrap();

        let presenter_messages = tunnels[&presenter].drain();
        assert!(presenter_messages.iter().any(|m| matches!(
            m,
            UpdateMessage::LiveTally {
                tally,
                answered_count: 1,
                total_respondents: 2,
            } if *tally == vec![1, 0]
        )));
        assert!(closed_count(&tunnels[&alice].drain()) == 0);
    }

    #[test]
    fn test_all_answered_arms_grace_then_alarm_closes() {
        let (mut session, presenter, mut tunnels) = setup();
        let alice = join(&mut session, &mut tunnels, "Alice");
        let bob = join(&mut session, &mut tunnels, "Bob");

        let mut alarms = Vec::new();
        let poll_id = session
            .create_poll(
                color_poll(60),
                |alarm, after| alarms.push((alarm, after)),
                finder(&tunnels),
            )
            .unwrap();

        session
            .submit_answer(
                alice,
                poll_id,
                0,
                |alarm, after| alarms.push((alarm, after)),
                finder(&tunnels),
            )
            .unwrap();
        session
            .submit_answer(
                bob,
                poll_id,
                1,
                |alarm, after| alarms.push((alarm, after)),
                finder(&tunnels),
            )
            .unwrap();

        // The grace timer armed only once, after the final answer
        assert_eq!(
            alarms.last(),
            Some(&(
                AlarmMessage::AllAnsweredGrace { poll_id },
                Duration::from_secs(1)
            ))
        );
        assert_eq!(alarms.len(), 2);
        assert!(!session.is_idle());

        session.receive_alarm(AlarmMessage::AllAnsweredGrace { poll_id }, finder(&tunnels));

        assert!(session.is_idle());
        let entry = session.history().next().unwrap();
        assert_eq!(entry.tally, vec![1, 1]);
        for id in [presenter, alice, bob] {
            assert_eq!(closed_count(&tunnels[&id].drain()), 1);
        }
    }

    #[test]
    fn test_deadline_alarm_closes_with_zero_tally() {
        let (mut session, presenter, mut tunnels) = setup();
        join(&mut session, &mut tunnels, "Alice");
        let poll_id = session
            .create_poll(color_poll(60), no_alarms, finder(&tunnels))
            .unwrap();
        tunnels[&presenter].drain();

        session.receive_alarm(AlarmMessage::Deadline { poll_id }, finder(&tunnels));

        assert!(session.is_idle());
        let entry = session.history().next().unwrap();
        assert_eq!(entry.tally, vec![0, 0]);
        assert!(!entry.responses[0].has_answered);
        assert_eq!(closed_count(&tunnels[&presenter].drain()), 1);
    }

    #[test]
    fn test_close_is_single_flight() {
        let (mut session, presenter, mut tunnels) = setup();
        join(&mut session, &mut tunnels, "Alice");
        let poll_id = session
            .create_poll(color_poll(60), no_alarms, finder(&tunnels))
            .unwrap();
        tunnels[&presenter].drain();

        session.close_poll(finder(&tunnels)).unwrap();
        // The deadline timer was never cancelled; it fires into an idle
        // session and finds nothing to close
        session.receive_alarm(AlarmMessage::Deadline { poll_id }, finder(&tunnels));

        assert_eq!(session.history().count(), 1);
        assert_eq!(closed_count(&tunnels[&presenter].drain()), 1);
        assert_eq!(
            session.close_poll(finder(&tunnels)).unwrap_err(),
            Error::NoActivePoll
        );
    }

    #[test]
    fn test_stale_alarm_does_not_touch_next_poll() {
        let (mut session, _, mut tunnels) = setup();
        let alice = join(&mut session, &mut tunnels, "Alice");
        let first = session
            .create_poll(color_poll(60), no_alarms, finder(&tunnels))
            .unwrap();
        session
            .submit_answer(alice, first, 0, no_alarms, finder(&tunnels))
            .unwrap();

        // Creating over a fully-answered poll finalizes it first
        let second = session
            .create_poll(color_poll(60), no_alarms, finder(&tunnels))
            .unwrap();
        assert_eq!(session.history().count(), 1);
        assert_eq!(session.history().next().unwrap().poll_id, first);

        session.receive_alarm(
            AlarmMessage::AllAnsweredGrace { poll_id: first },
            finder(&tunnels),
        );
        session.receive_alarm(AlarmMessage::Deadline { poll_id: first }, finder(&tunnels));

        assert_eq!(session.current_poll_id(), Some(second));
        assert_eq!(session.history().count(), 1);
    }

    #[test]
    fn test_answer_validation_order() {
        let (mut session, _, mut tunnels) = setup();
        let alice = join(&mut session, &mut tunnels, "Alice");

        let stranger = Id::new();
        tunnels.insert(stranger, MockTunnel::default());
        session.add_unassigned(stranger, finder(&tunnels)).unwrap();

        assert_eq!(
            session
                .submit_answer(alice, PollId::first(), 0, no_alarms, finder(&tunnels))
                .unwrap_err(),
            Error::PollNotActive
        );

        let poll_id = session
            .create_poll(color_poll(60), no_alarms, finder(&tunnels))
            .unwrap();

        assert_eq!(
            session
                .submit_answer(stranger, poll_id, 0, no_alarms, finder(&tunnels))
                .unwrap_err(),
            Error::Roster(roster::Error::NotRegistered)
        );
        assert_eq!(
            session
                .submit_answer(alice, poll_id, 7, no_alarms, finder(&tunnels))
                .unwrap_err(),
            Error::InvalidOption
        );

        session
            .submit_answer(alice, poll_id, 0, no_alarms, finder(&tunnels))
            .unwrap();
        assert_eq!(
            session
                .submit_answer(alice, poll_id, 1, no_alarms, finder(&tunnels))
                .unwrap_err(),
            Error::Roster(roster::Error::AlreadyAnswered)
        );

        // The rejected attempts never changed the recorded answer
        let entry = {
            session.close_poll(finder(&tunnels)).unwrap();
            session.history().next().unwrap()
        };
        assert_eq!(entry.tally, vec![1, 0]);
    }

    #[test]
    fn test_submission_after_deadline_rejected() {
        let (mut session, _, mut tunnels) = setup();
        let alice = join(&mut session, &mut tunnels, "Alice");
        let poll_id = session
            .create_poll(color_poll(10), no_alarms, finder(&tunnels))
            .unwrap();

        let late = SystemTime::now() + Duration::from_secs(11);
        let error = session
            .submit_answer_at(alice, poll_id, 0, late, no_alarms, finder(&tunnels))
            .unwrap_err();
        assert_eq!(error, Error::Expired);
        assert_eq!(error.kind(), ErrorKind::Timing);
    }

    #[test]
    fn test_receive_message_enforces_roles() {
        let (mut session, presenter, mut tunnels) = setup();
        let alice = join(&mut session, &mut tunnels, "Alice");

        let ack = session.receive_message(
            alice,
            IncomingMessage::Presenter(IncomingPresenterMessage::ClosePoll),
            no_alarms,
            finder(&tunnels),
        );
        assert!(!ack.is_ok());
        assert_eq!(ack.kind, Some(ErrorKind::Validation));

        let ack = session.receive_message(
            presenter,
            IncomingMessage::Presenter(IncomingPresenterMessage::CreatePoll(color_poll(60))),
            no_alarms,
            finder(&tunnels),
        );
        assert!(ack.is_ok());
        assert_eq!(ack.poll_id, session.current_poll_id());

        // A connection unknown to the session is rejected outright
        let ack = session.receive_message(
            Id::new(),
            IncomingMessage::Presenter(IncomingPresenterMessage::ClosePoll),
            no_alarms,
            finder(&tunnels),
        );
        assert!(!ack.is_ok());
    }

    #[test]
    fn test_chat_fans_out_with_roster_name() {
        let (mut session, presenter, mut tunnels) = setup();
        let alice = join(&mut session, &mut tunnels, "Alice");
        tunnels[&presenter].drain();
        tunnels[&alice].drain();

        let ack = session.receive_message(
            alice,
            IncomingMessage::Respondent(IncomingRespondentMessage::Chat {
                message: "hello".to_owned(),
            }),
            no_alarms,
            finder(&tunnels),
        );
        assert!(ack.is_ok());

        for id in [presenter, alice] {
            let messages = tunnels[&id].drain();
            assert!(messages.iter().any(|m| matches!(
                m,
                UpdateMessage::Chat(chat) if chat.sender == "Alice"
                    && chat.role == SenderRole::Respondent
            )));
        }

        session
            .send_presenter_chat("welcome", "  ", finder(&tunnels))
            .unwrap();
        assert!(session
            .chat_history()
            .any(|chat| chat.sender == "Presenter" && chat.role == SenderRole::Presenter));
    }

    #[test]
    fn test_disconnect_updates_roster_without_closing_poll() {
        let (mut session, presenter, mut tunnels) = setup();
        let alice = join(&mut session, &mut tunnels, "Alice");
        let bob = join(&mut session, &mut tunnels, "Bob");
        let poll_id = session
            .create_poll(color_poll(60), no_alarms, finder(&tunnels))
            .unwrap();
        session
            .submit_answer(alice, poll_id, 0, no_alarms, finder(&tunnels))
            .unwrap();
        tunnels[&presenter].drain();

        // Bob never answered; his departure must not auto-close the poll
        session.connection_closed(bob, finder(&tunnels));

        assert_eq!(session.current_poll_id(), Some(poll_id));
        let messages = tunnels[&presenter].drain();
        assert!(messages.iter().any(|m| matches!(
            m,
            UpdateMessage::RosterUpdate(statuses) if statuses.len() == 1
                && statuses[0].name == "Alice"
        )));
    }

    #[test]
    fn test_snapshot_carries_open_poll_for_late_joiner() {
        let (mut session, _, mut tunnels) = setup();
        join(&mut session, &mut tunnels, "Alice");
        let poll_id = session
            .create_poll(color_poll(60), no_alarms, finder(&tunnels))
            .unwrap();

        let late = join(&mut session, &mut tunnels, "Bob");
        let states = tunnels[&late].drain_states();
        let SyncMessage::State(snapshot) = states.last().unwrap();
        let current = snapshot.current_poll.as_ref().unwrap();
        assert_eq!(current.id, poll_id);
        assert!(current.time_left_seconds <= 60);
        assert!(snapshot.server_time > 0);
    }
}
