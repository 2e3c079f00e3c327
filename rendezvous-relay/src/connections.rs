//! Live connection table.
//!
//! Every accepted WebSocket gets a [`ConnId`] and an entry here holding its
//! role, its current session, and the sender half of its outbound queue.
//! The queue is drained by the connection's own writer task, so enqueueing
//! never waits on the network.

use std::collections::HashMap;
use std::fmt;

use rendezvous_proto::{ConnId, Envelope, codec};
use tokio::sync::mpsc;

/// Which endpoint a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    /// A peer on the signaling endpoint that joins sessions.
    Signaling,
    /// A client on the stream-bridge endpoint.
    Bridge,
}

impl fmt::Display for ConnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signaling => f.write_str("signaling"),
            Self::Bridge => f.write_str("bridge"),
        }
    }
}

/// A unit queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A UTF-8 text frame (envelopes, or verbatim backend text).
    Text(String),
    /// A binary frame (verbatim backend bytes that are not UTF-8).
    Binary(Vec<u8>),
    /// Close the connection after flushing earlier frames.
    Close,
}

impl OutboundFrame {
    /// Wraps an encoded envelope as a text frame.
    #[must_use]
    pub fn envelope(envelope: &Envelope) -> Self {
        Self::Text(codec::encode_to_string(envelope))
    }

    /// Wraps opaque bytes, as text when they are valid UTF-8.
    #[must_use]
    pub fn verbatim(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self::Text(text),
            Err(e) => Self::Binary(e.into_bytes()),
        }
    }
}

/// Sender half of a connection's outbound queue.
pub type OutboundSender = mpsc::UnboundedSender<OutboundFrame>;

/// Registry entry for one live connection.
#[derive(Debug)]
pub struct ConnectionEntry {
    role: ConnRole,
    session: Option<String>,
    outbound: OutboundSender,
}

impl ConnectionEntry {
    /// Creates an entry for a connection that has not joined a session yet.
    #[must_use]
    pub const fn new(role: ConnRole, outbound: OutboundSender) -> Self {
        Self {
            role,
            session: None,
            outbound,
        }
    }

    /// The connection's role tag.
    #[must_use]
    pub const fn role(&self) -> ConnRole {
        self.role
    }

    /// The session this connection is in, if any.
    #[must_use]
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Enqueues a frame without blocking.
    ///
    /// Returns `false` if the writer task is gone; the connection's own
    /// teardown will deregister it.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// In-memory `ConnId` → connection table.
///
/// Not synchronized on its own; see [`Registry`](crate::registry::Registry).
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnId, ConnectionEntry>,
}

impl ConnectionRegistry {
    /// Creates a new, empty connection table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection, returning any entry it replaced.
    pub fn insert(&mut self, id: ConnId, entry: ConnectionEntry) -> Option<ConnectionEntry> {
        self.connections.insert(id, entry)
    }

    /// Removes a connection, returning its entry if it existed.
    pub fn remove(&mut self, id: ConnId) -> Option<ConnectionEntry> {
        self.connections.remove(&id)
    }

    /// Looks up a connection.
    #[must_use]
    pub fn get(&self, id: ConnId) -> Option<&ConnectionEntry> {
        self.connections.get(&id)
    }

    /// Records the connection's current session.
    ///
    /// Returns the previous value, or `None` if the connection is unknown.
    pub fn set_session(&mut self, id: ConnId, session: Option<String>) -> Option<Option<String>> {
        self.connections
            .get_mut(&id)
            .map(|entry| std::mem::replace(&mut entry.session, session))
    }

    /// The session `id` is in, if the connection exists and has joined one.
    #[must_use]
    pub fn session_of(&self, id: ConnId) -> Option<&str> {
        self.connections.get(&id).and_then(ConnectionEntry::session)
    }

    /// Enqueues a frame for `id`. Returns `false` if unknown or closed.
    pub fn send(&self, id: ConnId, frame: OutboundFrame) -> bool {
        self.connections.get(&id).is_some_and(|c| c.send(frame))
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether there are no live connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Iterates over all live connections.
    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &ConnectionEntry)> {
        self.connections.iter().map(|(id, entry)| (*id, entry))
    }
}
