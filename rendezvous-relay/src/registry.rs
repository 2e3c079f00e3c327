//! Combined connection and session state.
//!
//! [`Registry`] owns both the [`ConnectionRegistry`] and the
//! [`SessionRegistry`] and is the only place that mutates membership, so the
//! two views cannot drift apart: a connection's recorded session always
//! contains it, and it is in no other session.

use rendezvous_proto::ConnId;

use crate::connections::{ConnectionEntry, ConnectionRegistry, OutboundFrame};
use crate::sessions::SessionRegistry;

/// A connection leaving a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// Session that was left.
    pub session_id: String,
    /// Members still in the session afterwards (sorted).
    pub remaining: Vec<ConnId>,
}

impl Departure {
    /// Whether the departure emptied and removed the session.
    #[must_use]
    pub fn closed_session(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// Result of [`Registry::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The session the connection had to leave first, if it was elsewhere.
    pub previous: Option<Departure>,
    /// Members of the session immediately before the joiner was added,
    /// excluding the joiner (sorted).
    pub participants: Vec<ConnId>,
    /// `false` if the connection was already a member of this session.
    pub newly_joined: bool,
}

/// Connection table plus session table, mutated together.
#[derive(Debug, Default)]
pub struct Registry {
    connections: ConnectionRegistry,
    sessions: SessionRegistry,
}

impl Registry {
    /// Creates a new, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly accepted connection.
    pub fn register(&mut self, id: ConnId, entry: ConnectionEntry) {
        if let Some(old) = self.connections.insert(id, entry)
            && let Some(session) = old.session()
        {
            // A replaced entry must not leave a dangling membership behind.
            self.sessions.remove(session, id);
        }
    }

    /// Removes a connection, leaving its session first.
    ///
    /// Returns the removed entry and the departure it caused, if any.
    pub fn deregister(&mut self, id: ConnId) -> Option<(ConnectionEntry, Option<Departure>)> {
        let departure = self.leave(id, None);
        self.connections.remove(id).map(|entry| (entry, departure))
    }

    /// Puts `conn` in `session_id`.
    ///
    /// If `conn` is in a different session it leaves that one first. Joining
    /// the session it is already in changes nothing. Returns `None` if the
    /// connection is not registered.
    pub fn join(&mut self, conn: ConnId, session_id: &str) -> Option<JoinOutcome> {
        let current = self.connections.get(conn)?.session().map(str::to_string);

        let previous = match current.as_deref() {
            Some(current) if current != session_id => self.leave(conn, Some(current)),
            _ => None,
        };

        let participants: Vec<ConnId> = self
            .sessions
            .members(session_id)
            .into_iter()
            .filter(|m| *m != conn)
            .collect();
        let newly_joined = self.sessions.insert(session_id, conn);
        self.connections
            .set_session(conn, Some(session_id.to_string()));

        Some(JoinOutcome {
            previous,
            participants,
            newly_joined,
        })
    }

    /// Takes `conn` out of a session.
    ///
    /// With `session_id` omitted the connection's current session is used.
    /// Returns `None` (and changes nothing) if the connection was not a
    /// member of that session.
    pub fn leave(&mut self, conn: ConnId, session_id: Option<&str>) -> Option<Departure> {
        let current = self.connections.session_of(conn)?.to_string();
        if session_id.is_some_and(|s| s != current) {
            return None;
        }
        if !self.sessions.remove(&current, conn) {
            return None;
        }
        self.connections.set_session(conn, None);
        Some(Departure {
            remaining: self.sessions.members(&current),
            session_id: current,
        })
    }

    /// Members of `session_id` (sorted, empty if absent).
    #[must_use]
    pub fn members(&self, session_id: &str) -> Vec<ConnId> {
        self.sessions.members(session_id)
    }

    /// Whether `conn` is currently in `session_id`.
    #[must_use]
    pub fn is_member(&self, session_id: &str, conn: ConnId) -> bool {
        self.sessions.contains(session_id, conn)
    }

    /// The session `conn` is in, if any.
    #[must_use]
    pub fn session_of(&self, conn: ConnId) -> Option<&str> {
        self.connections.session_of(conn)
    }

    /// Looks up a live connection.
    #[must_use]
    pub fn connection(&self, conn: ConnId) -> Option<&ConnectionEntry> {
        self.connections.get(conn)
    }

    /// Enqueues a frame for `conn`. Returns `false` if unknown or closed.
    pub fn send(&self, conn: ConnId, frame: OutboundFrame) -> bool {
        self.connections.send(conn, frame)
    }

    /// Read access to the connection table.
    #[must_use]
    pub const fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Read access to the session table.
    #[must_use]
    pub const fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Checks the membership invariants, returning a description of the
    /// first violation found.
    ///
    /// # Errors
    ///
    /// Returns a message naming the inconsistent session or connection.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (session_id, count) in self.sessions.iter() {
            if count == 0 {
                return Err(format!("session {session_id} is empty"));
            }
            for member in self.sessions.members(session_id) {
                match self.connections.session_of(member) {
                    Some(s) if s == session_id => {}
                    other => {
                        return Err(format!(
                            "connection {member} is in session {session_id} but records {other:?}"
                        ));
                    }
                }
            }
        }
        for (id, entry) in self.connections.iter() {
            if let Some(session) = entry.session()
                && !self.sessions.contains(session, id)
            {
                return Err(format!(
                    "connection {id} records session {session} but is not a member"
                ));
            }
        }
        Ok(())
    }
}
