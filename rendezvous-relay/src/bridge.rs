//! Stream bridge: pairs a WebSocket client with a TCP backend.
//!
//! A `/bridge` connection starts [`BridgeState::Unbound`]. The client's
//! first valid `config {backendHost, backendPort}` opens a TCP connection to
//! that backend and moves it to [`BridgeState::Bound`], which is terminal.
//! While bound, every client envelope is queued for the backend as one
//! newline-terminated JSON line, and backend bytes are split into lines by a
//! [`LineFramer`] and forwarded to the client one frame per line. Backend
//! writes happen on their own task, so a backend that stops reading never
//! stalls traffic towards the client.
//!
//! [`BridgeSession`] is the synchronous state machine; [`run`] drives it
//! against the sockets.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocket;
use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use rendezvous_proto::envelope::fields;
use rendezvous_proto::{ConnId, Envelope, EventType, FrameError, LineFramer, codec};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::connections::{OutboundFrame, OutboundSender};
use crate::relay::{Inbound, RelayState, read_inbound};

/// Size of a single backend read.
const READ_CHUNK: usize = 8 * 1024;

/// How long a closing bridge waits for queued lines to reach the backend.
const BACKEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors raised while binding or running a bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// `config` without a usable `backendHost`.
    #[error("missing backendHost")]
    MissingHost,

    /// `backendPort` absent, not a number, or out of range.
    #[error("invalid backendPort: {0}")]
    InvalidPort(String),

    /// The host is not in the configured allow-list.
    #[error("backend host not allowed: {0}")]
    HostNotAllowed(String),

    /// The backend did not accept within the connect timeout.
    #[error("connect to {backend} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Backend address attempted.
        backend: String,
        /// Configured limit.
        timeout: Duration,
    },

    /// The backend refused or the address did not resolve.
    #[error("connect to {backend} failed: {source}")]
    Connect {
        /// Backend address attempted.
        backend: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Reading from or writing to the backend failed.
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend sent an over-long unterminated line.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ---------------------------------------------------------------------------
// Backend target
// ---------------------------------------------------------------------------

/// Backend address named by a client's `config` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    host: String,
    port: u16,
}

impl BackendTarget {
    /// Creates a target from a host and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Extracts and validates the target from a `config` envelope.
    ///
    /// `backendPort` may be a JSON number or a numeric string.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::MissingHost`] if `backendHost` is absent or blank.
    /// - [`BridgeError::InvalidPort`] if `backendPort` is absent, zero, or
    ///   not a valid port.
    /// - [`BridgeError::HostNotAllowed`] if `policy` rejects the host.
    pub fn from_config(envelope: &Envelope, policy: &BridgeConfig) -> Result<Self, BridgeError> {
        let host = envelope
            .str_field(fields::BACKEND_HOST)
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(BridgeError::MissingHost)?;
        let port = parse_port(envelope.get(fields::BACKEND_PORT))?;
        if !policy.host_allowed(host) {
            return Err(BridgeError::HostNotAllowed(host.to_string()));
        }
        Ok(Self::new(host, port))
    }

    /// Backend host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Backend TCP port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(value: Option<&Value>) -> Result<u16, BridgeError> {
    let port = match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
        _ => None,
    };
    match port {
        Some(p) if p != 0 => Ok(p),
        _ => Err(BridgeError::InvalidPort(
            value.map_or_else(|| "missing".to_string(), Value::to_string),
        )),
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Binding state of one bridge connection.
#[derive(Debug)]
pub enum BridgeState {
    /// Waiting for a valid `config`.
    Unbound,
    /// Connected to a backend; terminal.
    Bound {
        /// The backend in use.
        target: BackendTarget,
        /// Splits backend bytes into lines.
        framer: LineFramer,
    },
}

/// What the driver should do with a client envelope.
#[derive(Debug)]
pub enum ClientAction {
    /// Open a TCP connection to this backend, then call
    /// [`BridgeSession::bind`].
    Connect(BackendTarget),
    /// Write this newline-terminated line to the backend.
    Forward(Vec<u8>),
    /// Report the error to the client; the state is unchanged.
    Reject(BridgeError),
    /// Drop the envelope.
    Ignore,
}

/// Protocol state for one bridge connection, independent of I/O.
#[derive(Debug)]
pub struct BridgeSession {
    state: BridgeState,
    config: BridgeConfig,
}

impl BridgeSession {
    /// Creates an unbound session governed by `config`.
    #[must_use]
    pub const fn new(config: BridgeConfig) -> Self {
        Self {
            state: BridgeState::Unbound,
            config,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &BridgeState {
        &self.state
    }

    /// The bound backend, if any.
    #[must_use]
    pub const fn target(&self) -> Option<&BackendTarget> {
        match &self.state {
            BridgeState::Unbound => None,
            BridgeState::Bound { target, .. } => Some(target),
        }
    }

    /// Decides what to do with an envelope from the client.
    #[must_use]
    pub fn on_client_message(&self, envelope: &Envelope) -> ClientAction {
        match (&self.state, envelope.kind()) {
            (BridgeState::Unbound, EventType::Config) => {
                match BackendTarget::from_config(envelope, &self.config) {
                    Ok(target) => ClientAction::Connect(target),
                    Err(e) => ClientAction::Reject(e),
                }
            }
            (BridgeState::Unbound, _) | (BridgeState::Bound { .. }, EventType::Config) => {
                ClientAction::Ignore
            }
            (BridgeState::Bound { .. }, _) => ClientAction::Forward(codec::encode_line(envelope)),
        }
    }

    /// Marks the backend connection as established.
    ///
    /// Returns `false` (and changes nothing) if already bound.
    pub fn bind(&mut self, target: BackendTarget) -> bool {
        if matches!(self.state, BridgeState::Bound { .. }) {
            return false;
        }
        self.state = BridgeState::Bound {
            target,
            framer: LineFramer::with_max_buffered(self.config.max_frame_len),
        };
        true
    }

    /// Converts a chunk of backend bytes into client frames pushed onto
    /// `out`.
    ///
    /// Lines that decode as envelopes are re-encoded as text frames; any
    /// other line is forwarded verbatim. Lines completed before an overflow
    /// are still pushed.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Frame`] if the unterminated tail exceeds
    /// `max_frame_len`.
    pub fn on_backend_chunk(
        &mut self,
        chunk: &[u8],
        out: &mut Vec<OutboundFrame>,
    ) -> Result<(), BridgeError> {
        let BridgeState::Bound { framer, .. } = &mut self.state else {
            return Ok(());
        };
        let mut lines = Vec::new();
        let result = framer.feed_into(chunk, &mut lines);
        out.extend(lines.into_iter().map(|line| match codec::decode(&line) {
            Ok(envelope) => OutboundFrame::envelope(&envelope),
            Err(failure) => {
                tracing::debug!(reason = %failure, "forwarding non-envelope backend line verbatim");
                OutboundFrame::verbatim(failure.into_raw())
            }
        }));
        result.map_err(BridgeError::from)
    }
}

// ---------------------------------------------------------------------------
// Async driver
// ---------------------------------------------------------------------------

/// Runs the bridge protocol for one accepted `/bridge` connection until the
/// client or backend goes away.
///
/// `outbound` feeds the connection's writer task.
pub async fn run(
    conn_id: ConnId,
    mut ws_receiver: SplitStream<WebSocket>,
    outbound: OutboundSender,
    state: Arc<RelayState>,
) {
    let mut session = BridgeSession::new(state.bridge_config().clone());
    let mut reader: Option<OwnedReadHalf> = None;
    let mut writer: Option<BackendWriter> = None;
    let mut buf = vec![0u8; READ_CHUNK];

    // `true` when the client side ended and queued lines should still be
    // delivered to the backend.
    let drain = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let Some(Ok(msg)) = msg else {
                    break true;
                };
                let envelope = match read_inbound(conn_id, msg, &state) {
                    Inbound::Envelope(envelope) => envelope,
                    Inbound::Skip => continue,
                    Inbound::Close => {
                        tracing::info!(conn_id = %conn_id, "bridge client closed");
                        break true;
                    }
                };
                match session.on_client_message(&envelope) {
                    ClientAction::Connect(target) => {
                        let stream = match connect_backend(&target, state.bridge_config().connect_timeout).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                fail(conn_id, &outbound, &e);
                                break false;
                            }
                        };
                        let (r, w) = stream.into_split();
                        reader = Some(r);
                        writer = Some(BackendWriter::spawn(conn_id, w, outbound.clone()));
                        tracing::info!(conn_id = %conn_id, backend = %target, "bridge bound");
                        let status = Envelope::status("connected").with(fields::BACKEND, target.to_string());
                        let _ = outbound.send(OutboundFrame::envelope(&status));
                        session.bind(target);
                    }
                    ClientAction::Forward(line) => {
                        if let Some(w) = writer.as_ref()
                            && !w.send(line)
                        {
                            tracing::debug!(conn_id = %conn_id, "backend writer gone");
                            break false;
                        }
                    }
                    ClientAction::Reject(e) => {
                        tracing::warn!(conn_id = %conn_id, error = %e, "bridge config rejected");
                        let _ = outbound.send(OutboundFrame::envelope(&Envelope::error(e.to_string())));
                    }
                    ClientAction::Ignore => {
                        tracing::debug!(
                            conn_id = %conn_id,
                            kind = %envelope.kind(),
                            bound = session.target().is_some(),
                            "bridge envelope ignored"
                        );
                    }
                }
            }
            read = read_backend(reader.as_mut(), &mut buf) => {
                match read {
                    Ok(0) => {
                        tracing::info!(conn_id = %conn_id, "backend closed the stream");
                        let _ = outbound.send(OutboundFrame::Close);
                        break false;
                    }
                    Ok(n) => {
                        let mut frames = Vec::new();
                        let result = session.on_backend_chunk(&buf[..n], &mut frames);
                        for frame in frames {
                            let _ = outbound.send(frame);
                        }
                        if let Err(e) = result {
                            fail(conn_id, &outbound, &e);
                            break false;
                        }
                    }
                    Err(e) => {
                        fail(conn_id, &outbound, &BridgeError::Io(e));
                        break false;
                    }
                }
            }
        }
    };

    drop(reader);
    if let Some(mut writer) = writer
        && drain
    {
        writer.finish().await;
    }
}

/// Lines queued for the backend and the task writing them.
///
/// Dropping it aborts the task, which closes the backend's write side.
struct BackendWriter {
    lines: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl BackendWriter {
    fn spawn(conn_id: ConnId, writer: OwnedWriteHalf, outbound: OutboundSender) -> Self {
        let (lines, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_backend(conn_id, writer, rx, outbound));
        Self {
            lines: Some(lines),
            task,
        }
    }

    /// Queues a line; `false` once the writer task has stopped.
    fn send(&self, line: Vec<u8>) -> bool {
        self.lines
            .as_ref()
            .is_some_and(|lines| lines.send(line).is_ok())
    }

    /// Stops accepting lines and waits, bounded, for the queue to drain.
    async fn finish(&mut self) {
        self.lines = None;
        if tokio::time::timeout(BACKEND_DRAIN_TIMEOUT, &mut self.task)
            .await
            .is_err()
        {
            self.task.abort();
        }
    }
}

impl Drop for BackendWriter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Writes queued lines to the backend until the queue closes, then shuts
/// down the write side. A write error fails the bridge.
async fn write_backend(
    conn_id: ConnId,
    mut writer: OwnedWriteHalf,
    mut lines: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: OutboundSender,
) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = write_line(&mut writer, &line).await {
            fail(conn_id, &outbound, &BridgeError::Io(e));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Opens the backend connection, bounded by `timeout`.
///
/// # Errors
///
/// Returns [`BridgeError::ConnectTimeout`] or [`BridgeError::Connect`].
pub async fn connect_backend(
    target: &BackendTarget,
    timeout: Duration,
) -> Result<TcpStream, BridgeError> {
    match tokio::time::timeout(timeout, TcpStream::connect((target.host(), target.port()))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(BridgeError::Connect {
            backend: target.to_string(),
            source,
        }),
        Err(_elapsed) => Err(BridgeError::ConnectTimeout {
            backend: target.to_string(),
            timeout,
        }),
    }
}

async fn read_backend(
    reader: Option<&mut OwnedReadHalf>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await
}

/// Reports a bridge failure to the client and closes it.
fn fail(conn_id: ConnId, outbound: &OutboundSender, err: &BridgeError) {
    tracing::warn!(conn_id = %conn_id, error = %err, "bridge failed");
    let status = Envelope::status("error").with(fields::MESSAGE, err.to_string());
    let _ = outbound.send(OutboundFrame::envelope(&status));
    let _ = outbound.send(OutboundFrame::Close);
}
