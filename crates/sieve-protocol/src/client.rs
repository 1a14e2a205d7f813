//! Control socket client.
//!
//! Every request opens its own connection: the server answers exactly one
//! request per connection and then closes it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::net::UnixStream;
use tracing::debug;

use crate::framing::{FramedChannel, FramingError};
use crate::message::{ControlRequest, MonitorReport, UpdateResponse};

/// Default control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/sieve.sock";

/// Default time to wait for a response.
///
/// Updates wait for every replaced worker to pass readiness, so this is
/// much longer than the framing default.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

/// Client for the supervisor's control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    response_timeout: Duration,
}

impl ControlClient {
    /// Creates a client for the socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Overrides how long to wait for a response.
    #[must_use]
    pub fn with_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sends one request and returns the raw response document.
    pub async fn request(&self, request: &ControlRequest) -> Result<Value, FramingError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| FramingError::Io(format!("{}: {e}", self.socket_path.display())))?;

        let mut channel = FramedChannel::new(stream).with_timeout(self.response_timeout);
        let doc = serde_json::to_value(request).map_err(|e| FramingError::Json(e.to_string()))?;

        debug!(socket = %self.socket_path.display(), request = ?request, "Sending control request");
        channel.send(&doc).await?;
        channel.receive().await
    }

    /// Asks the supervisor to replace the named workers.
    pub async fn update_filters(&self, filters: Vec<String>) -> Result<UpdateResponse, FramingError> {
        let response = self
            .request(&ControlRequest::update_filters(filters))
            .await?;
        serde_json::from_value(response).map_err(|e| FramingError::Json(e.to_string()))
    }

    /// Collects the status of every worker.
    pub async fn monitor(
        &self,
        proc_stats: Option<Vec<String>>,
    ) -> Result<MonitorReport, FramingError> {
        match self.request(&ControlRequest::monitor(proc_stats)).await? {
            Value::Object(report) => Ok(report),
            other => Err(FramingError::Json(format!(
                "expected a monitor report object, got {other}"
            ))),
        }
    }
}

impl Default for ControlClient {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_PATH)
    }
}
