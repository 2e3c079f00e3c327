//! Shared protocol definitions for the rendezvous relay wire format.

pub mod codec;
pub mod envelope;
pub mod framer;

pub use codec::{DecodeErrorKind, DecodeFailure};
pub use envelope::{ConnId, Envelope, EventType};
pub use framer::{FrameError, LineFramer};
