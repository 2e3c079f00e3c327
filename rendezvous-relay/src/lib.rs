//! Rendezvous relay server library.
//!
//! Exposes the relay server for use in tests and embedding.
//! The relay accepts WebSocket connections, groups them into sessions, and
//! routes negotiation envelopes between session members. A second endpoint
//! bridges WebSocket clients to newline-delimited TCP backends.

pub mod bridge;
pub mod config;
pub mod connections;
pub mod dispatch;
pub mod registry;
pub mod relay;
pub mod sessions;
