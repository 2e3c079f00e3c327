//! Relay dispatcher: membership changes and message routing.
//!
//! The dispatcher owns the [`Registry`] behind a single mutex. Every
//! operation takes the lock once, resolves recipients, and enqueues frames on
//! their outbound channels before releasing it. Enqueueing is non-blocking,
//! so the lock is never held across network I/O.

use parking_lot::Mutex;
use rendezvous_proto::envelope::fields;
use rendezvous_proto::{ConnId, Envelope, EventType};

use crate::connections::{ConnRole, ConnectionEntry, OutboundFrame, OutboundSender};
use crate::registry::{Departure, JoinOutcome, Registry};

/// Why an inbound envelope produced no dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// `join` without a usable `sessionId`.
    #[error("missing sessionId")]
    MissingSessionId,
    /// `join` with a wrong or missing shared secret.
    #[error("invalid secret")]
    InvalidSecret,
    /// The sender is not a live connection.
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnId),
    /// A negotiation message with no explicit or current session.
    #[error("no session to relay `{0}` into")]
    NoSession(EventType),
    /// A negotiation message naming a session the sender is not in.
    #[error("sender is not a member of session {0}")]
    NotMember(String),
    /// A type peers may not send.
    #[error("unsupported event type `{0}`")]
    UnsupportedEvent(String),
}

/// Routes envelopes between connections that share a session.
pub struct Dispatcher {
    registry: Mutex<Registry>,
    shared_secret: Option<String>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Dispatcher {
    /// Creates a dispatcher. With `shared_secret` set, every `join` must
    /// present it.
    #[must_use]
    pub fn new(shared_secret: Option<String>) -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
            shared_secret,
        }
    }

    /// Registers a newly accepted connection and returns its identifier.
    pub fn connect(&self, role: ConnRole, outbound: OutboundSender) -> ConnId {
        let id = ConnId::new();
        self.registry
            .lock()
            .register(id, ConnectionEntry::new(role, outbound));
        tracing::info!(conn_id = %id, role = %role, "connection registered");
        id
    }

    /// Removes a closed connection, notifying its session first.
    ///
    /// Returns `false` if the connection was already gone.
    pub fn disconnect(&self, conn: ConnId) -> bool {
        let mut reg = self.registry.lock();
        if let Some(session_id) = reg.session_of(conn).map(str::to_string) {
            depart_locked(&mut reg, conn, &session_id);
        }
        let removed = reg.deregister(conn).is_some();
        drop(reg);
        if removed {
            tracing::info!(conn_id = %conn, "connection deregistered");
        }
        removed
    }

    /// Handles one inbound envelope from a signaling connection.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] describing why nothing was dispatched.
    /// Only join failures are reported to the sender (as an `error`
    /// envelope); all other errors are for the caller to log.
    pub fn handle(&self, sender: ConnId, envelope: Envelope) -> Result<(), DispatchError> {
        match envelope.kind().clone() {
            EventType::Join => self
                .join(
                    sender,
                    envelope.str_field(fields::SESSION_ID),
                    envelope.str_field(fields::SECRET),
                )
                .map(|_| ()),
            EventType::Leave => {
                self.leave(sender);
                Ok(())
            }
            kind if kind.is_negotiation() => self.relay(sender, envelope).map(|_| ()),
            other => Err(DispatchError::UnsupportedEvent(other.to_string())),
        }
    }

    /// Puts `conn` into `session_id`.
    ///
    /// The joiner receives `joined` with the members present before it was
    /// added; those members receive `peer-joined`. A connection already in
    /// another session leaves it first, with `peer-left` sent there.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::UnknownConnection`] if `conn` is not registered.
    /// - [`DispatchError::MissingSessionId`] if `session_id` is absent or empty.
    /// - [`DispatchError::InvalidSecret`] if a shared secret is configured and
    ///   `secret` does not match.
    ///
    /// The last two also send an `error` envelope to `conn`.
    pub fn join(
        &self,
        conn: ConnId,
        session_id: Option<&str>,
        secret: Option<&str>,
    ) -> Result<JoinOutcome, DispatchError> {
        let mut reg = self.registry.lock();
        if reg.connection(conn).is_none() {
            return Err(DispatchError::UnknownConnection(conn));
        }

        let Some(session_id) = session_id.filter(|s| !s.is_empty()) else {
            reject_locked(&reg, conn, &DispatchError::MissingSessionId);
            return Err(DispatchError::MissingSessionId);
        };
        if !self.secret_matches(secret) {
            tracing::warn!(conn_id = %conn, session_id = %session_id, "join rejected: invalid secret");
            reject_locked(&reg, conn, &DispatchError::InvalidSecret);
            return Err(DispatchError::InvalidSecret);
        }

        let previous = match reg.session_of(conn).map(str::to_string) {
            Some(current) if current != session_id => depart_locked(&mut reg, conn, &current),
            _ => None,
        };
        let mut outcome = reg
            .join(conn, session_id)
            .ok_or(DispatchError::UnknownConnection(conn))?;
        outcome.previous = previous;

        reg.send(
            conn,
            OutboundFrame::envelope(&Envelope::joined(session_id, conn, &outcome.participants)),
        );
        if outcome.newly_joined {
            let notice = Envelope::peer_joined(session_id, conn);
            broadcast_locked(&reg, session_id, conn, &notice);
        }
        drop(reg);

        tracing::info!(
            conn_id = %conn,
            session_id = %session_id,
            participants = outcome.participants.len(),
            rejoin = !outcome.newly_joined,
            "joined session"
        );
        Ok(outcome)
    }

    /// Takes `conn` out of its current session, notifying the others.
    ///
    /// Returns `None` if it was not in a session.
    pub fn leave(&self, conn: ConnId) -> Option<Departure> {
        let mut reg = self.registry.lock();
        let session_id = reg.session_of(conn)?.to_string();
        depart_locked(&mut reg, conn, &session_id)
    }

    /// Relays an `offer`, `answer` or `candidate` from `sender`.
    ///
    /// The session comes from `sessionId`, or the sender's current session
    /// when absent; the sender must be a member. `targetConnId` narrows
    /// delivery to one member. `targetConnId` and `secret` are stripped,
    /// `sessionId` and `from` are set. Returns the number of recipients.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::UnsupportedEvent`] for non-negotiation types.
    /// - [`DispatchError::NoSession`] if no session can be resolved, or
    ///   `sessionId` is present but not a string.
    /// - [`DispatchError::NotMember`] if the sender is not in that session.
    pub fn relay(&self, sender: ConnId, envelope: Envelope) -> Result<usize, DispatchError> {
        if !envelope.kind().is_negotiation() {
            return Err(DispatchError::UnsupportedEvent(envelope.kind().to_string()));
        }
        if envelope
            .get(fields::SESSION_ID)
            .is_some_and(|id| !id.is_string())
        {
            return Err(DispatchError::NoSession(envelope.kind().clone()));
        }
        let explicit = envelope.str_field(fields::SESSION_ID).map(str::to_string);
        let target = envelope.str_field(fields::TARGET_CONN_ID).map(str::to_string);
        let mut outgoing = envelope;
        outgoing.remove(fields::TARGET_CONN_ID);
        outgoing.remove(fields::SECRET);

        let reg = self.registry.lock();
        let Some(session_id) = explicit.or_else(|| reg.session_of(sender).map(str::to_string))
        else {
            return Err(DispatchError::NoSession(outgoing.kind().clone()));
        };
        if !reg.is_member(&session_id, sender) {
            return Err(DispatchError::NotMember(session_id));
        }
        outgoing.insert(fields::SESSION_ID, session_id.as_str());
        Ok(dispatch_locked(
            &reg,
            sender,
            &session_id,
            &outgoing,
            target.as_deref(),
        ))
    }

    /// Delivers `envelope` within `session_id` on behalf of `sender`.
    ///
    /// With `target`, only that connection receives it, and only if it is a
    /// current member; otherwise every member except `sender` does. `from`
    /// is always overwritten with `sender`. Returns the number of recipients
    /// the frame was enqueued for.
    pub fn dispatch(
        &self,
        sender: ConnId,
        session_id: &str,
        envelope: &Envelope,
        target: Option<&str>,
    ) -> usize {
        let reg = self.registry.lock();
        dispatch_locked(&reg, sender, session_id, envelope, target)
    }

    /// Enqueues a frame for a single connection.
    pub fn send_to(&self, conn: ConnId, frame: OutboundFrame) -> bool {
        self.registry.lock().send(conn, frame)
    }

    /// Members of `session_id` (sorted, empty if absent).
    #[must_use]
    pub fn members(&self, session_id: &str) -> Vec<ConnId> {
        self.registry.lock().members(session_id)
    }

    /// The session `conn` is in, if any.
    #[must_use]
    pub fn session_of(&self, conn: ConnId) -> Option<String> {
        self.registry.lock().session_of(conn).map(str::to_string)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.lock().connections().len()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.registry.lock().sessions().len()
    }

    /// Runs `f` with the registry locked.
    pub fn with_registry<R>(&self, f: impl FnOnce(&Registry) -> R) -> R {
        f(&self.registry.lock())
    }

    /// Queues a close frame for every live connection. Returns how many
    /// connections were signalled.
    pub fn close_all(&self) -> usize {
        let reg = self.registry.lock();
        let mut closed = 0;
        for (id, entry) in reg.connections().iter() {
            tracing::info!(conn_id = %id, "sending close frame");
            if entry.send(OutboundFrame::Close) {
                closed += 1;
            }
        }
        closed
    }

    fn secret_matches(&self, provided: Option<&str>) -> bool {
        self.shared_secret
            .as_deref()
            .is_none_or(|expected| provided == Some(expected))
    }
}

/// Sends an `error` envelope describing `err` to `conn`.
fn reject_locked(reg: &Registry, conn: ConnId, err: &DispatchError) {
    reg.send(conn, OutboundFrame::envelope(&Envelope::error(err.to_string())));
}

/// Announces `conn`'s departure to the rest of `session_id`, then removes it.
fn depart_locked(reg: &mut Registry, conn: ConnId, session_id: &str) -> Option<Departure> {
    if !reg.is_member(session_id, conn) {
        return None;
    }
    let notice = Envelope::peer_left(session_id, conn);
    let notified = broadcast_locked(reg, session_id, conn, &notice);
    let departure = reg.leave(conn, Some(session_id));
    tracing::info!(
        conn_id = %conn,
        session_id = %session_id,
        notified,
        session_closed = departure.as_ref().is_some_and(Departure::closed_session),
        "left session"
    );
    departure
}

/// Sends a relay-originated envelope to every member except `exclude`.
fn broadcast_locked(reg: &Registry, session_id: &str, exclude: ConnId, envelope: &Envelope) -> usize {
    let frame = OutboundFrame::envelope(envelope);
    reg.members(session_id)
        .into_iter()
        .filter(|m| *m != exclude)
        .filter(|m| reg.send(*m, frame.clone()))
        .count()
}

fn dispatch_locked(
    reg: &Registry,
    sender: ConnId,
    session_id: &str,
    envelope: &Envelope,
    target: Option<&str>,
) -> usize {
    let recipients: Vec<ConnId> = match target {
        Some(raw) => raw
            .parse::<ConnId>()
            .ok()
            .filter(|id| reg.is_member(session_id, *id))
            .into_iter()
            .collect(),
        None => reg
            .members(session_id)
            .into_iter()
            .filter(|m| *m != sender)
            .collect(),
    };

    let stamped = envelope.clone().with(fields::FROM, sender);
    let frame = OutboundFrame::envelope(&stamped);
    let delivered = recipients
        .into_iter()
        .filter(|r| reg.send(*r, frame.clone()))
        .count();

    tracing::debug!(
        from = %sender,
        session_id = %session_id,
        kind = %envelope.kind(),
        target = target.unwrap_or("*"),
        delivered,
        "dispatched"
    );
    delivered
}
