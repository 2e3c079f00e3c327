//! Wire envelope types for the rendezvous relay.
//!
//! Every message exchanged with the relay is a JSON object carrying a string
//! `type` tag plus fields specific to that type. [`Envelope`] keeps the tag
//! as a typed [`EventType`] and the remaining fields as an opaque JSON map,
//! so the relay can route on a few well-known keys while forwarding
//! everything else untouched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Well-known envelope field names.
pub mod fields {
    /// The reserved tag field.
    pub const TYPE: &str = "type";
    /// Session the envelope refers to.
    pub const SESSION_ID: &str = "sessionId";
    /// Shared secret presented on `join`.
    pub const SECRET: &str = "secret";
    /// Explicit unicast recipient.
    pub const TARGET_CONN_ID: &str = "targetConnId";
    /// Sender identity, always stamped by the relay.
    pub const FROM: &str = "from";
    /// Opaque negotiation data (SDP, candidate, ...).
    pub const PAYLOAD: &str = "payload";
    /// Member snapshot in a `joined` envelope.
    pub const PARTICIPANTS: &str = "participants";
    /// Connection id in `joined`, `peer-joined`, `peer-left` and `status`.
    pub const SOCKET_ID: &str = "socketId";
    /// Human-readable text in `error` and `status`.
    pub const MESSAGE: &str = "message";
    /// Machine-readable state in `status`.
    pub const STATE: &str = "state";
    /// Backend host in a bridge `config`.
    pub const BACKEND_HOST: &str = "backendHost";
    /// Backend port in a bridge `config`.
    pub const BACKEND_PORT: &str = "backendPort";
    /// Resolved backend address in a bridge `status`.
    pub const BACKEND: &str = "backend";
}

/// Opaque identifier assigned to a connection when the relay accepts it.
///
/// Time-ordered (UUID v7) and rendered on the wire as the hyphenated string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(Uuid);

impl ConnId {
    /// Creates a fresh connection identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ConnId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<ConnId> for Value {
    fn from(id: ConnId) -> Self {
        Self::String(id.to_string())
    }
}

/// The `type` tag of an envelope.
///
/// Unrecognized tags are preserved verbatim in [`EventType::Unknown`] so that
/// decoding never loses information; the dispatcher decides what to reject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Client asks to enter a session.
    Join,
    /// Client leaves its current session.
    Leave,
    /// Connection offer (SDP).
    Offer,
    /// Connection answer (SDP).
    Answer,
    /// Network candidate.
    Candidate,
    /// Relay tells session members that someone joined.
    PeerJoined,
    /// Relay tells session members that someone left.
    PeerLeft,
    /// Relay confirms a join with a member snapshot.
    Joined,
    /// Relay reports a rejected request.
    Error,
    /// Relay reports connection or bridge state.
    Status,
    /// Bridge client names its backend.
    Config,
    /// Any tag outside the vocabulary above.
    Unknown(String),
}

impl EventType {
    /// Returns the wire spelling of this tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::PeerJoined => "peer-joined",
            Self::PeerLeft => "peer-left",
            Self::Joined => "joined",
            Self::Error => "error",
            Self::Status => "status",
            Self::Config => "config",
            Self::Unknown(other) => other,
        }
    }

    /// Whether this is one of the negotiation messages peers relay to each
    /// other (`offer`, `answer`, `candidate`).
    #[must_use]
    pub const fn is_negotiation(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::Candidate)
    }
}

impl From<&str> for EventType {
    fn from(tag: &str) -> Self {
        match tag {
            "join" => Self::Join,
            "leave" => Self::Leave,
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "candidate" => Self::Candidate,
            "peer-joined" => Self::PeerJoined,
            "peer-left" => Self::PeerLeft,
            "joined" => Self::Joined,
            "error" => Self::Error,
            "status" => Self::Status,
            "config" => Self::Config,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded wire message: a type tag plus the remaining JSON fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    kind: EventType,
    fields: Map<String, Value>,
}

impl Envelope {
    /// Creates an envelope with no fields besides the tag.
    #[must_use]
    pub fn new(kind: EventType) -> Self {
        Self {
            kind,
            fields: Map::new(),
        }
    }

    /// Creates an envelope from a tag and an existing field map.
    ///
    /// A `type` key in `fields` is discarded; the tag always comes from `kind`.
    #[must_use]
    pub fn from_parts(kind: EventType, mut fields: Map<String, Value>) -> Self {
        fields.remove(fields::TYPE);
        Self { kind, fields }
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Sets a field, returning the previous value.
    ///
    /// The reserved `type` key is ignored and `None` is returned.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) -> Option<Value> {
        if key == fields::TYPE {
            return None;
        }
        self.fields.insert(key.to_string(), value.into())
    }

    /// Removes a field, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// The envelope's type tag.
    #[must_use]
    pub const fn kind(&self) -> &EventType {
        &self.kind
    }

    /// Returns a field by name.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns a field if it is a JSON string.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// All fields except `type`.
    #[must_use]
    pub const fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Splits the envelope into its tag and field map.
    #[must_use]
    pub fn into_parts(self) -> (EventType, Map<String, Value>) {
        (self.kind, self.fields)
    }

    // --- Relay-originated envelopes ---

    /// `joined`: sent to a connection that just entered `session_id`.
    ///
    /// `participants` is the member list as it was before the joiner was added.
    #[must_use]
    pub fn joined(session_id: &str, socket_id: ConnId, participants: &[ConnId]) -> Self {
        let list: Vec<Value> = participants.iter().copied().map(Value::from).collect();
        Self::new(EventType::Joined)
            .with(fields::SESSION_ID, session_id)
            .with(fields::SOCKET_ID, socket_id)
            .with(fields::PARTICIPANTS, list)
    }

    /// `peer-joined`: tells existing members about a newcomer.
    #[must_use]
    pub fn peer_joined(session_id: &str, socket_id: ConnId) -> Self {
        Self::new(EventType::PeerJoined)
            .with(fields::SESSION_ID, session_id)
            .with(fields::SOCKET_ID, socket_id)
    }

    /// `peer-left`: tells remaining members about a departure.
    #[must_use]
    pub fn peer_left(session_id: &str, socket_id: ConnId) -> Self {
        Self::new(EventType::PeerLeft)
            .with(fields::SESSION_ID, session_id)
            .with(fields::SOCKET_ID, socket_id)
    }

    /// `error` with a human-readable message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventType::Error).with(fields::MESSAGE, message.into())
    }

    /// `status` with a machine-readable state.
    #[must_use]
    pub fn status(state: &str) -> Self {
        Self::new(EventType::Status).with(fields::STATE, state)
    }
}
