//! Serialization and deserialization for the relay wire envelope.
//!
//! Envelopes travel as single-line JSON objects. Decoding is strict about
//! the envelope shape (an object with a string `type`) but keeps the raw
//! input on failure, so stream-transport callers can still forward bytes
//! that were never meant to be envelopes.

use serde_json::{Map, Value};

use crate::envelope::{Envelope, EventType, fields};
use crate::framer::DELIMITER;

/// Why a byte sequence is not an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeErrorKind {
    /// The input is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// The input is JSON but not an object.
    #[error("envelope must be a JSON object")]
    NotAnObject,
    /// The object has no `type` field.
    #[error("envelope has no `type` field")]
    MissingType,
    /// The `type` field is not a string.
    #[error("envelope `type` must be a string")]
    TypeNotString,
}

/// Error returned by [`decode`], carrying the undecodable input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}")]
pub struct DecodeFailure {
    kind: DecodeErrorKind,
    raw: Vec<u8>,
}

impl DecodeFailure {
    /// Why decoding failed.
    #[must_use]
    pub const fn kind(&self) -> &DecodeErrorKind {
        &self.kind
    }

    /// The original input bytes.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Consumes the failure, returning the original input bytes.
    #[must_use]
    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }
}

/// Decodes an [`Envelope`] from JSON bytes.
///
/// # Errors
///
/// Returns a [`DecodeFailure`] holding the input if it is not a JSON object
/// with a string `type` field.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeFailure> {
    let fail = |kind| DecodeFailure {
        kind,
        raw: bytes.to_vec(),
    };

    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| fail(DecodeErrorKind::InvalidJson(e.to_string())))?;
    let Value::Object(mut map) = value else {
        return Err(fail(DecodeErrorKind::NotAnObject));
    };
    let kind = match map.remove(fields::TYPE) {
        Some(Value::String(tag)) => EventType::from(tag.as_str()),
        Some(_) => return Err(fail(DecodeErrorKind::TypeNotString)),
        None => return Err(fail(DecodeErrorKind::MissingType)),
    };
    Ok(Envelope::from_parts(kind, map))
}

/// Encodes an [`Envelope`] as a single-line JSON string.
///
/// JSON string escaping guarantees the output never contains a raw newline,
/// so the result is always safe to frame with [`DELIMITER`].
#[must_use]
pub fn encode_to_string(envelope: &Envelope) -> String {
    let mut map = Map::with_capacity(envelope.fields().len() + 1);
    map.insert(
        fields::TYPE.to_string(),
        Value::String(envelope.kind().as_str().to_string()),
    );
    for (key, value) in envelope.fields() {
        map.insert(key.clone(), value.clone());
    }
    Value::Object(map).to_string()
}

/// Encodes an [`Envelope`] into JSON bytes.
#[must_use]
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    encode_to_string(envelope).into_bytes()
}

/// Encodes an [`Envelope`] followed by the stream delimiter.
///
/// This is the unit written to stream-oriented backends.
#[must_use]
pub fn encode_line(envelope: &Envelope) -> Vec<u8> {
    let mut line = encode(envelope);
    line.push(DELIMITER);
    line
}
