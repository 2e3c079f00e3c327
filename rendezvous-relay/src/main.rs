//! Rendezvous relay server: a session rendezvous point for peers negotiating
//! a direct connection.
//!
//! An axum WebSocket server that groups peers into sessions and relays their
//! offers, answers and candidates. The relay never interprets negotiation
//! payloads; it only routes them by session and connection id.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin rendezvous-relay
//!
//! # Run on custom address with a shared secret
//! cargo run --bin rendezvous-relay -- --bind 127.0.0.1:8080 --shared-secret hunter2
//!
//! # Or via environment variables
//! RELAY_ADDR=127.0.0.1:8080 RELAY_SECRET=hunter2 cargo run --bin rendezvous-relay
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rendezvous_relay::config::{RelayCliArgs, RelayConfig};
use rendezvous_relay::relay::{self, RelayState};
use tracing_appender::non_blocking::WorkerGuard;

/// Time given to writer tasks to flush close frames on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Held until exit so buffered log lines are flushed.
    let _log_guard = init_logging(&config.log_level, config.log_file.as_deref());

    tracing::info!(
        addr = %config.bind_addr,
        auth = config.shared_secret.is_some(),
        "starting rendezvous relay server"
    );

    let state = Arc::new(RelayState::with_config(&config));

    let (bound_addr, mut handle) =
        match relay::start_server_with_state(&config.bind_addr, Arc::clone(&state)).await {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(error = %e, "failed to start relay server");
                std::process::exit(1);
            }
        };
    tracing::info!(addr = %bound_addr, "relay server listening");

    tokio::select! {
        result = &mut handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            let closed = state.close_all_connections();
            tracing::info!(closed, "shutting down");
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            handle.abort();
        }
    }
}

/// Initialize logging to stderr, or to `file_path` when given.
///
/// File output goes through a non-blocking writer; the returned
/// [`WorkerGuard`] must be held until shutdown to flush it.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(log_path) = file_path else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return None;
    };

    let log_dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let Some(file_name) = log_path.file_name() else {
        eprintln!("Invalid log file path: {}", log_path.display());
        std::process::exit(1);
    };

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
