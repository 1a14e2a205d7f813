//! Client interface for the supervisor actor.
//!
//! These are the locked variants of every lifecycle operation: each call
//! queues behind whatever the actor is doing and runs with exclusive access
//! to the fleet.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `SupervisorError::ChannelClosed`

use tokio::sync::{mpsc, oneshot};

use sieve_core::ReportStats;
use sieve_protocol::{FilterError, MonitorReport};

use super::commands::{SupervisorCommand, SupervisorError, WorkerSummary};

/// Cheap-to-clone handle to the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    pub fn new(sender: mpsc::Sender<SupervisorCommand>) -> Self {
        Self { sender }
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T, SupervisorError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(command(tx))
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?;

        rx.await.map_err(|_| SupervisorError::ChannelClosed)
    }

    /// Starts every configured worker.
    ///
    /// Returns the workers that failed; those are left `dead` for the
    /// heartbeat to recover.
    pub async fn start_all(&self) -> Result<Vec<FilterError>, SupervisorError> {
        self.call(|respond_to| SupervisorCommand::StartAll { respond_to })
            .await
    }

    /// Reloads the configuration and replaces the named workers
    /// (blue/green). An empty list targets every added or removed worker.
    ///
    /// Returns per-worker errors; an empty list is full success.
    pub async fn update(&self, names: Vec<String>) -> Result<Vec<FilterError>, SupervisorError> {
        self.call(|respond_to| SupervisorCommand::Update { names, respond_to })
            .await
    }

    /// Runs one liveness sweep.
    pub async fn heartbeat(&self) -> Result<(), SupervisorError> {
        self.call(|respond_to| SupervisorCommand::Heartbeat { respond_to })
            .await
    }

    /// Collects every worker's status document.
    pub async fn monitor(
        &self,
        proc_stats: Option<Vec<String>>,
    ) -> Result<MonitorReport, SupervisorError> {
        self.call(|respond_to| SupervisorCommand::Monitor {
            proc_stats,
            respond_to,
        })
        .await
    }

    /// Sends the log-rotation signal to every worker.
    pub async fn rotate_logs(&self) -> Result<(), SupervisorError> {
        self.call(|respond_to| SupervisorCommand::RotateLogs { respond_to })
            .await
    }

    /// Stops every worker.
    pub async fn stop_all(&self) -> Result<(), SupervisorError> {
        self.call(|respond_to| SupervisorCommand::StopAll { respond_to })
            .await
    }

    /// Removes every worker's leftover files.
    pub async fn clean_all(&self) -> Result<(), SupervisorError> {
        self.call(|respond_to| SupervisorCommand::CleanAll { respond_to })
            .await
    }

    /// Returns the current telemetry definition.
    pub async fn report_stats(&self) -> Result<ReportStats, SupervisorError> {
        self.call(|respond_to| SupervisorCommand::ReportStats { respond_to })
            .await
    }

    /// Returns a snapshot of every worker record.
    pub async fn workers(&self) -> Result<Vec<WorkerSummary>, SupervisorError> {
        self.call(|respond_to| SupervisorCommand::Workers { respond_to })
            .await
    }
}
