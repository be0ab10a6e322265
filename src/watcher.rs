//! Connection and role management
//!
//! This module tracks every connection participating in the session, the
//! role each one currently holds, and provides the fan-out primitives for
//! sending messages to one connection, to every connection of a given role,
//! or to everyone at once.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    str::FromStr,
};

use enum_map::{Enum, EnumMap};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;
use uuid::Uuid;

use super::{SyncMessage, UpdateMessage, tunnel::Tunnel};

/// A unique identifier for a connection in the session
///
/// Each connection (presenter, respondent, or not-yet-registered) gets a
/// unique ID that persists for as long as it participates in the session.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, DeserializeFromStr, SerializeDisplay,
)]
pub struct Id(Uuid);

impl Id {
    /// Creates a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Id {
    /// Creates a new random connection ID (same as `new()`)
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Id {
    /// Formats the ID as a UUID string
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Id {
    type Err = uuid::Error;

    /// Parses an ID from a UUID string
    ///
    /// # Errors
    ///
    /// Returns a `uuid::Error` if the string is not a valid UUID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// The role a connection currently holds in the session
///
/// A connection joins unassigned and becomes a respondent once it registers
/// a display name. The presenter role is fixed at session creation. The role
/// determines which requests the session accepts from the connection and
/// which broadcasts it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A connection that has not registered yet
    Unassigned,
    /// The presenter who creates and closes polls
    Presenter,
    /// A registered respondent who answers polls
    Respondent,
}

/// Errors that can occur when managing connections
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The session has reached the maximum number of allowed connections
    #[error("maximum number of connections reached")]
    MaximumConnections,
}

/// Registry of all connections in the session
///
/// This struct tracks which role each connection holds and provides the
/// message fan-out helpers used after every state mutation. The reverse
/// index keeps per-role lookups cheap.
#[derive(Debug, Default)]
pub struct Watchers {
    /// Primary mapping from connection ID to its role
    mapping: HashMap<Id, Role>,

    /// Reverse mapping organized by role for efficient filtering
    reverse_mapping: EnumMap<Role, HashSet<Id>>,
}

impl Watchers {
    /// Creates a new registry with the presenter already connected
    ///
    /// # Arguments
    ///
    /// * `presenter_id` - The ID of the presenter connection
    pub fn with_presenter_id(presenter_id: Id) -> Self {
        Self {
            mapping: {
                let mut map = HashMap::default();
                map.insert(presenter_id, Role::Presenter);
                map
            },
            reverse_mapping: {
                let mut map: EnumMap<Role, HashSet<Id>> = EnumMap::default();
                map[Role::Presenter].insert(presenter_id);
                map
            },
        }
    }

    /// Gets a vector of all connections with their tunnels and roles
    ///
    /// Connections without an active tunnel are skipped; broadcasts are
    /// best-effort fan-out.
    ///
    /// # Arguments
    ///
    /// * `tunnel_finder` - Function to retrieve the tunnel for a given ID
    pub fn vec<T: Tunnel, F: Fn(Id) -> Option<T>>(&self, tunnel_finder: F) -> Vec<(Id, T, Role)> {
        self.reverse_mapping
            .values()
            .flat_map(|v| v.iter())
            .filter_map(|x| match (tunnel_finder(*x), self.mapping.get(x)) {
                (Some(t), Some(v)) => Some((*x, t, *v)),
                _ => None,
            })
            .collect_vec()
    }

    /// Gets a vector of connections of a specific role with their tunnels
    ///
    /// # Arguments
    ///
    /// * `filter` - The role to include
    /// * `tunnel_finder` - Function to retrieve the tunnel for a given ID
    pub fn specific_vec<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        filter: Role,
        tunnel_finder: F,
    ) -> Vec<(Id, T)> {
        self.reverse_mapping[filter]
            .iter()
            .filter_map(|x| tunnel_finder(*x).map(|t| (*x, t)))
            .collect_vec()
    }

    /// Gets the count of connections holding a specific role
    pub fn specific_count(&self, filter: Role) -> usize {
        self.reverse_mapping[filter].len()
    }

    /// Adds a new connection to the session
    ///
    /// # Arguments
    ///
    /// * `watcher_id` - The unique ID for the new connection
    /// * `role` - The role the connection starts with
    ///
    /// # Errors
    ///
    /// Returns `Error::MaximumConnections` if adding this connection would
    /// exceed the maximum allowed number of connections.
    pub fn add_watcher(&mut self, watcher_id: Id, role: Role) -> Result<(), Error> {
        if self.mapping.len() >= crate::constants::roster::MAX_RESPONDENT_COUNT {
            return Err(Error::MaximumConnections);
        }

        self.mapping.insert(watcher_id, role);
        self.reverse_mapping[role].insert(watcher_id);

        Ok(())
    }

    /// Updates the role of an existing connection
    ///
    /// This method properly moves the connection between role categories,
    /// e.g. from unassigned to respondent on successful registration.
    pub fn update_role(&mut self, watcher_id: Id, role: Role) {
        let Some(old_role) = self.mapping.get(&watcher_id).copied() else {
            return;
        };
        if old_role != role {
            self.reverse_mapping[old_role].remove(&watcher_id);
            self.reverse_mapping[role].insert(watcher_id);
        }
        self.mapping.insert(watcher_id, role);
    }

    /// Gets the role of a specific connection
    ///
    /// # Returns
    ///
    /// The connection's role if it exists, otherwise `None`
    pub fn get_role(&self, watcher_id: Id) -> Option<Role> {
        self.mapping.get(&watcher_id).copied()
    }

    /// Checks if a connection exists in the session
    pub fn has_watcher(&self, watcher_id: Id) -> bool {
        self.mapping.contains_key(&watcher_id)
    }

    /// Removes a connection from the registry
    ///
    /// # Returns
    ///
    /// The role the connection held, if it was present
    pub fn remove_watcher(&mut self, watcher_id: Id) -> Option<Role> {
        let role = self.mapping.remove(&watcher_id)?;
        self.reverse_mapping[role].remove(&watcher_id);
        Some(role)
    }

    /// Closes the tunnel of a connection, severing it
    ///
    /// # Arguments
    ///
    /// * `watcher_id` - The ID of the connection whose tunnel should close
    /// * `tunnel_finder` - Function to retrieve the tunnel for the connection
    pub fn remove_watcher_session<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        watcher_id: &Id,
        tunnel_finder: F,
    ) {
        if let Some(x) = tunnel_finder(*watcher_id) {
            x.close();
        }
    }

    /// Sends an update message to a specific connection
    ///
    /// # Arguments
    ///
    /// * `message` - The update message to send
    /// * `watcher_id` - The ID of the connection to send to
    /// * `tunnel_finder` - Function to retrieve the tunnel for the connection
    pub fn send_message<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        message: &UpdateMessage,
        watcher_id: Id,
        tunnel_finder: F,
    ) {
        let Some(session) = tunnel_finder(watcher_id) else {
            return;
        };

        session.send_message(message);
    }

    /// Sends a state synchronization message to a specific connection
    ///
    /// # Arguments
    ///
    /// * `message` - The sync message to send
    /// * `watcher_id` - The ID of the connection to send to
    /// * `tunnel_finder` - Function to retrieve the tunnel for the connection
    pub fn send_state<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        message: &SyncMessage,
        watcher_id: Id,
        tunnel_finder: F,
    ) {
        let Some(session) = tunnel_finder(watcher_id) else {
            return;
        };

        session.send_state(message);
    }

    /// Sends personalized messages to all connections using a sender function
    ///
    /// The sender function is called for each connection and can return
    /// different messages based on the connection's ID and role, or `None`
    /// to skip sending.
    ///
    /// # Arguments
    ///
    /// * `sender` - Function that generates messages for each connection
    /// * `tunnel_finder` - Function to retrieve tunnels for connections
    pub fn announce_with<S, T: Tunnel, F: Fn(Id) -> Option<T>>(&self, sender: S, tunnel_finder: F)
    where
        S: Fn(Id, Role) -> Option<UpdateMessage>,
    {
        for (watcher, session, role) in self.vec(tunnel_finder) {
            let Some(message) = sender(watcher, role) else {
                continue;
            };

            session.send_message(&message);
        }
    }

    /// Broadcasts an update message to all connections except unassigned ones
    ///
    /// # Arguments
    ///
    /// * `message` - The update message to broadcast
    /// * `tunnel_finder` - Function to retrieve tunnels for connections
    pub fn announce<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        message: &UpdateMessage,
        tunnel_finder: F,
    ) {
        self.announce_with(
            |_, role| {
                if matches!(role, Role::Unassigned) {
                    None
                } else {
                    Some(message.to_owned())
                }
            },
            tunnel_finder,
        );
    }

    /// Sends an update message to all connections holding a specific role
    ///
    /// # Arguments
    ///
    /// * `filter` - The role to send to
    /// * `message` - The update message to send
    /// * `tunnel_finder` - Function to retrieve tunnels for connections
    pub fn announce_specific<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        filter: Role,
        message: &UpdateMessage,
        tunnel_finder: F,
    ) {
        for (_, session) in self.specific_vec(filter, tunnel_finder) {
            session.send_message(message);
        }
    }
}
