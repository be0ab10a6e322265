//! Communication tunnel abstraction
//!
//! This module defines the trait for tunneling messages between the session
//! core and connected clients (the presenter and respondents). The tunnel
//! abstraction allows for different communication mechanisms while
//! maintaining a consistent interface.

use super::{SyncMessage, UpdateMessage};

/// Trait for sending messages through a communication tunnel
///
/// This trait abstracts the communication mechanism used to send messages
/// to connected clients. Implementations might use WebSockets, Server-Sent
/// Events, or other real-time communication protocols.
pub trait Tunnel {
    /// Sends an update message to the client
    ///
    /// Update messages notify clients about changes that affect their
    /// current view of the session.
    ///
    /// # Arguments
    ///
    /// * `message` - The update message to send
    fn send_message(&self, message: &UpdateMessage);

    /// Sends a state synchronization message to the client
    ///
    /// Sync messages carry a full snapshot so the client's view can be
    /// reconciled with the session, typically on connect or reconnect.
    ///
    /// # Arguments
    ///
    /// * `state` - The synchronization message to send
    fn send_state(&self, state: &SyncMessage);

    /// Closes the communication tunnel
    ///
    /// This method should be called when the client is removed from the
    /// session or when the communication is no longer needed.
    fn close(self);
}
