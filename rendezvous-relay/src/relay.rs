//! Relay server core: shared state, WebSocket handlers, and the per-connection
//! task pair.
//!
//! Every accepted WebSocket is registered with the [`Dispatcher`] and served
//! by two tasks: a writer draining the connection's outbound queue onto the
//! socket, and a reader turning inbound frames into envelopes. `/ws` readers
//! hand envelopes to the dispatcher; `/bridge` readers run the stream bridge.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rendezvous_proto::envelope::fields;
use rendezvous_proto::{ConnId, Envelope, codec};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge;
use crate::config::{BridgeConfig, RelayConfig};
use crate::connections::{ConnRole, OutboundFrame};
use crate::dispatch::Dispatcher;

/// Default maximum allowed inbound frame size in bytes (64 KB).
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// How long a finished reader waits for its writer to flush queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared relay server state.
pub struct RelayState {
    dispatcher: Dispatcher,
    /// Maximum allowed inbound frame size in bytes.
    max_payload_size: usize,
    bridge: BridgeConfig,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay state with no shared secret and default limits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dispatcher: Dispatcher::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            bridge: BridgeConfig::default(),
        }
    }

    /// Creates a relay state from a resolved [`RelayConfig`].
    #[must_use]
    pub fn with_config(config: &RelayConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(config.shared_secret.clone()),
            max_payload_size: config.max_payload_size,
            bridge: config.bridge.clone(),
        }
    }

    /// The session dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Maximum allowed inbound frame size in bytes.
    #[must_use]
    pub const fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Stream-bridge settings.
    #[must_use]
    pub const fn bridge_config(&self) -> &BridgeConfig {
        &self.bridge
    }

    /// Send a WebSocket Close frame to every live connection.
    ///
    /// Each writer task flushes what is already queued, sends the close
    /// frame, and exits. Used for graceful shutdown.
    pub fn close_all_connections(&self) -> usize {
        self.dispatcher.close_all()
    }
}

// ---------------------------------------------------------------------------
// Connection handlers
// ---------------------------------------------------------------------------

/// Handles an upgraded `/ws` signaling connection.
///
/// The connection lifecycle:
/// 1. Register the connection and send `status {state: "connected", socketId}`.
/// 2. Dispatch every inbound envelope until the socket closes.
/// 3. Leave the current session (notifying its members) and deregister.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (ws_sender, mut ws_receiver) = socket.split();

    let (tx, rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let conn_id = state.dispatcher.connect(ConnRole::Signaling, tx);

    let hello = Envelope::status("connected").with(fields::SOCKET_ID, conn_id);
    state
        .dispatcher
        .send_to(conn_id, OutboundFrame::envelope(&hello));

    let write_task = tokio::spawn(write_outbound(conn_id, ws_sender, rx));

    let reader_state = Arc::clone(&state);
    let read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match read_inbound(conn_id, msg, &reader_state) {
                Inbound::Envelope(envelope) => {
                    let kind = envelope.kind().clone();
                    if let Err(e) = reader_state.dispatcher.handle(conn_id, envelope) {
                        tracing::warn!(conn_id = %conn_id, kind = %kind, error = %e, "envelope rejected");
                    }
                }
                Inbound::Skip => {}
                Inbound::Close => {
                    tracing::info!(conn_id = %conn_id, "received close frame");
                    break;
                }
            }
        }
    });

    finish_connection(conn_id, &state, read_task, write_task).await;
}

/// Handles an upgraded `/bridge` stream-bridge connection.
pub async fn handle_bridge_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (ws_sender, ws_receiver) = socket.split();

    let (tx, rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let conn_id = state.dispatcher.connect(ConnRole::Bridge, tx.clone());

    let write_task = tokio::spawn(write_outbound(conn_id, ws_sender, rx));
    let read_task = tokio::spawn(bridge::run(conn_id, ws_receiver, tx, Arc::clone(&state)));

    finish_connection(conn_id, &state, read_task, write_task).await;
}

/// Waits for either task of a connection to finish, then tears it down.
///
/// If the reader finished first the writer gets a short grace period to
/// flush frames queued before teardown (e.g. a final status and close).
async fn finish_connection(
    conn_id: ConnId,
    state: &RelayState,
    mut read_task: JoinHandle<()>,
    mut write_task: JoinHandle<()>,
) {
    let reader_finished = tokio::select! {
        _ = &mut read_task => true,
        _ = &mut write_task => {
            read_task.abort();
            false
        }
    };

    state.dispatcher.disconnect(conn_id);

    if reader_finished
        && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut write_task)
            .await
            .is_err()
    {
        write_task.abort();
    }
    tracing::info!(conn_id = %conn_id, "connection closed");
}

/// Drains a connection's outbound queue onto its socket.
///
/// Stops after sending a close frame, on a write error, or once every sender
/// has been dropped.
async fn write_outbound(
    conn_id: ConnId,
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let closing = frame == OutboundFrame::Close;
        if ws_sender.send(into_message(frame)).await.is_err() {
            tracing::warn!(conn_id = %conn_id, "WebSocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
}

fn into_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Text(text) => Message::Text(text.into()),
        OutboundFrame::Binary(bytes) => Message::Binary(bytes.into()),
        OutboundFrame::Close => Message::Close(None),
    }
}

/// Result of reading one inbound WebSocket frame.
pub(crate) enum Inbound {
    /// A decoded envelope ready for processing.
    Envelope(Envelope),
    /// Nothing to process (control frame, oversized or malformed input).
    Skip,
    /// The client sent a close frame.
    Close,
}

/// Decodes an inbound frame, enforcing the payload size limit.
///
/// Oversized frames are answered with an `error` envelope; malformed ones
/// are logged and dropped.
pub(crate) fn read_inbound(conn_id: ConnId, msg: Message, state: &RelayState) -> Inbound {
    let data = match msg {
        Message::Text(ref text) => text.as_str().as_bytes(),
        Message::Binary(ref bytes) => &bytes[..],
        Message::Close(_) => return Inbound::Close,
        Message::Ping(_) | Message::Pong(_) => return Inbound::Skip,
    };

    if data.len() > state.max_payload_size {
        tracing::warn!(
            conn_id = %conn_id,
            size = data.len(),
            max = state.max_payload_size,
            "payload exceeds size limit"
        );
        let err = Envelope::error(format!(
            "payload too large: {} bytes (max {})",
            data.len(),
            state.max_payload_size
        ));
        state
            .dispatcher
            .send_to(conn_id, OutboundFrame::envelope(&err));
        return Inbound::Skip;
    }

    match codec::decode(data) {
        Ok(envelope) => Inbound::Envelope(envelope),
        Err(failure) => {
            tracing::warn!(
                conn_id = %conn_id,
                error = %failure,
                len = failure.raw().len(),
                "failed to decode envelope"
            );
            Inbound::Skip
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry points
// ---------------------------------------------------------------------------

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// Use [`RelayState::with_config`] to create a state from the resolved
/// [`RelayConfig`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/bridge", axum::routing::get(bridge_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// Starts the relay server in-process for testing.
///
/// Binds to `127.0.0.1:0` (OS-assigned port) and returns the bound address
/// and a [`tokio::task::JoinHandle`] for cleanup.
#[cfg(test)]
pub async fn start_test_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    start_server("127.0.0.1:0")
        .await
        .expect("failed to start test server")
}

/// axum handler that upgrades an HTTP request to a signaling WebSocket.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// axum handler that upgrades an HTTP request to a stream-bridge WebSocket.
async fn bridge_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_bridge_socket(socket, state))
}
