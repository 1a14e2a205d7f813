//! Supervisor actor commands, errors and fleet snapshots.
//!
//! - `SupervisorCommand`: commands sent to the actor
//! - `SupervisorError`: errors raised by lifecycle operations
//! - `WorkerSummary`: a read-only view of one worker record

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use sieve_core::{ConfigError, Generation, ReportStats};
use sieve_protocol::{FilterError, MonitorReport};

// ============================================================================
// Supervisor Commands
// ============================================================================

/// Commands sent to the supervisor actor.
///
/// The actor handles one command at a time, so every command observes and
/// leaves a consistent fleet. Each command carries a oneshot channel for
/// its response.
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Start every configured worker.
    ///
    /// Responds with the workers that failed to start.
    StartAll {
        respond_to: oneshot::Sender<Vec<FilterError>>,
    },

    /// Reload the configuration and replace the named workers.
    Update {
        /// Names to replace; empty means everything added or removed
        names: Vec<String>,
        respond_to: oneshot::Sender<Vec<FilterError>>,
    },

    /// Run one liveness sweep, restarting dead workers.
    Heartbeat { respond_to: oneshot::Sender<()> },

    /// Collect the status document of every worker.
    Monitor {
        /// Process fields to sample instead of the configured ones
        proc_stats: Option<Vec<String>>,
        respond_to: oneshot::Sender<MonitorReport>,
    },

    /// Ask every worker to reopen its log file.
    RotateLogs { respond_to: oneshot::Sender<()> },

    /// Stop every worker.
    StopAll { respond_to: oneshot::Sender<()> },

    /// Remove every worker's leftover files.
    CleanAll { respond_to: oneshot::Sender<()> },

    /// Current telemetry definition.
    ReportStats {
        respond_to: oneshot::Sender<ReportStats>,
    },

    /// Snapshot of every worker record.
    Workers {
        respond_to: oneshot::Sender<Vec<WorkerSummary>>,
    },
}

// ============================================================================
// Supervisor Errors
// ============================================================================

/// Errors raised by worker lifecycle operations.
///
/// Per-worker errors never abort a fleet-wide operation; they end up in a
/// log line, an update's error list, or a `dead` worker.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    /// A started process never became ready.
    #[error("{0}")]
    Readiness(String),

    /// Spawning failed or the process exited unexpectedly.
    #[error("{0}")]
    Process(String),

    /// A socket exchange with a worker failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The actor has shut down.
    #[error("supervisor channel closed")]
    ChannelClosed,
}

// ============================================================================
// Worker Snapshots
// ============================================================================

/// Lifecycle status of a worker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Dead,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Read-only view of a worker record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub name: String,
    pub generation: Generation,
    pub status: WorkerStatus,
    pub failures: u32,
    pub pid: Option<u32>,
}
