//! Unix socket control server for the sieve supervisor.
//!
//! The server:
//! - Listens on a Unix socket for operator connections
//! - Spawns a ConnectionHandler for each connection
//! - Answers exactly one request per connection
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  ControlServer  │
//! │                 │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ConnectionHandler│────▶│ SupervisorHandle │
//! │ (per connection)│     └──────────────────┘
//! └───────┬─────────┘
//!         │ after update_filters
//!         ▼
//! ┌─────────────────┐
//! │ TelemetryHandle │
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the loop continues

mod connection;

pub use connection::ConnectionHandler;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::supervisor::SupervisorHandle;
use crate::telemetry::TelemetryHandle;

pub use sieve_protocol::DEFAULT_SOCKET_PATH;

/// Control socket server.
pub struct ControlServer {
    /// Path to the Unix socket
    socket_path: PathBuf,

    supervisor: SupervisorHandle,

    /// Rebuilt after every update so telemetry follows the configuration
    telemetry: TelemetryHandle,

    cancel_token: CancellationToken,

    /// Connection counter for log correlation
    connection_counter: AtomicU64,
}

impl ControlServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        supervisor: SupervisorHandle,
        telemetry: TelemetryHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            supervisor,
            telemetry,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the control socket.
    ///
    /// A stale socket file left by a previous run is removed first, and the
    /// parent directory is created if needed.
    pub fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_error)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_error)?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(setup_error)?;

        info!(socket = %self.socket_path.display(), "Control server listening");
        Ok(listener)
    }

    /// Accepts connections on `listener` until the cancellation token fires,
    /// then removes the socket file.
    pub async fn serve(&self, listener: UnixListener) {
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Control server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        drop(listener);
        self.cleanup();
    }

    /// Binds and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }

    /// Handles a connection on its own task so a slow update does not block
    /// accepting further connections.
    fn handle_connection(&self, stream: UnixStream, connection_number: u64) {
        let handler = ConnectionHandler::new(
            stream,
            self.supervisor.clone(),
            self.telemetry.clone(),
            connection_number,
        );
        tokio::spawn(handler.run());
    }

    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Control server cleanup complete");
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },
}
