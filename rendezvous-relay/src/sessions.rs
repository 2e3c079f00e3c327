//! Session membership table.
//!
//! Maps a session identifier to the set of connections currently in it.
//! Sessions are created by the first insert and removed as soon as their
//! last member leaves, so an empty session is never observable.
//!
//! Session entries are ephemeral, lost on relay restart.

use std::collections::{HashMap, HashSet};

use rendezvous_proto::ConnId;

/// In-memory session → members table.
///
/// Not synchronized on its own; the relay keeps it inside
/// [`Registry`](crate::registry::Registry) behind a single lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, HashSet<ConnId>>,
}

impl SessionRegistry {
    /// Creates a new, empty session table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn` to `session_id`, creating the session if needed.
    ///
    /// Returns `true` if `conn` was not already a member.
    pub fn insert(&mut self, session_id: &str, conn: ConnId) -> bool {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(conn)
    }

    /// Removes `conn` from `session_id`, deleting the session if it empties.
    ///
    /// Returns `true` if `conn` was a member. Removing from a session that
    /// does not exist is a no-op.
    pub fn remove(&mut self, session_id: &str, conn: ConnId) -> bool {
        let Some(members) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let removed = members.remove(&conn);
        if members.is_empty() {
            self.sessions.remove(session_id);
        }
        removed
    }

    /// Members of `session_id`, sorted; empty if the session does not exist.
    #[must_use]
    pub fn members(&self, session_id: &str) -> Vec<ConnId> {
        let mut members: Vec<ConnId> = self
            .sessions
            .get(session_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    /// Whether `conn` is currently a member of `session_id`.
    #[must_use]
    pub fn contains(&self, session_id: &str, conn: ConnId) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|m| m.contains(&conn))
    }

    /// Whether a session with this identifier exists.
    #[must_use]
    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no live sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Iterates over `(session_id, member_count)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.sessions.iter().map(|(id, m)| (id.as_str(), m.len()))
    }
}
