//! Handler for a single control connection.
//!
//! A connection carries exactly one request and one response:
//! - receive one framed document (short timeout)
//! - dispatch on its `type`
//! - send the response best-effort and close
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Receive and send failures are logged and end the connection

use serde_json::Value;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use sieve_protocol::{
    empty_response, ControlRequest, FilterError, FramedChannel, UpdateResponse,
};

use crate::supervisor::{SupervisorHandle, CONFIG_ERROR_FILTER};
use crate::telemetry::TelemetryHandle;

/// Connection handler for one control client.
pub struct ConnectionHandler {
    channel: FramedChannel<UnixStream>,
    supervisor: SupervisorHandle,
    telemetry: TelemetryHandle,
    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        stream: UnixStream,
        supervisor: SupervisorHandle,
        telemetry: TelemetryHandle,
        connection_number: u64,
    ) -> Self {
        Self {
            channel: FramedChannel::new(stream),
            supervisor,
            telemetry,
            connection_number,
        }
    }

    /// Serves the connection's single request.
    pub async fn run(mut self) {
        let doc = match self.channel.receive().await {
            Ok(doc) => doc,
            Err(e) => {
                debug!(
                    connection = self.connection_number,
                    error = %e,
                    "Failed to receive control request"
                );
                return;
            }
        };

        let request = ControlRequest::from_value(doc);
        debug!(connection = self.connection_number, request = ?request, "Control request");

        let response = self.dispatch(request).await;

        if let Err(e) = self.channel.send(&response).await {
            warn!(
                connection = self.connection_number,
                error = %e,
                "Failed to send control response"
            );
        }
    }

    async fn dispatch(&self, request: ControlRequest) -> Value {
        match request {
            ControlRequest::UpdateFilters { filters } => self.handle_update(filters).await,
            ControlRequest::Monitor { proc_stats } => self.handle_monitor(proc_stats).await,
            ControlRequest::Unknown => empty_response(),
        }
    }

    async fn handle_update(&self, filters: Vec<String>) -> Value {
        info!(connection = self.connection_number, ?filters, "Update requested");

        let errors = match self.supervisor.update(filters).await {
            Ok(errors) => errors,
            Err(e) => vec![FilterError::new(CONFIG_ERROR_FILTER, e.to_string())],
        };

        // A rejected configuration leaves the live target alone.
        if Self::reload_rejected(&errors) {
            debug!(connection = self.connection_number, "Telemetry target kept");
        } else {
            match self.supervisor.report_stats().await {
                Ok(stats) => self.telemetry.apply(&stats).await,
                Err(e) => warn!(error = %e, "Could not refresh telemetry target"),
            }
        }

        let response = UpdateResponse::from_errors(errors);
        if !response.is_ok() {
            warn!(connection = self.connection_number, response = ?response, "Update finished with errors");
        }
        serde_json::to_value(&response).unwrap_or_else(|_| empty_response())
    }

    fn reload_rejected(errors: &[FilterError]) -> bool {
        matches!(errors, [only] if only.filter == CONFIG_ERROR_FILTER)
    }

    async fn handle_monitor(&self, proc_stats: Option<Vec<String>>) -> Value {
        match self.supervisor.monitor(proc_stats).await {
            Ok(report) => Value::Object(report),
            Err(e) => {
                warn!(error = %e, "Monitor request failed");
                empty_response()
            }
        }
    }
}
