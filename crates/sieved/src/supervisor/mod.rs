//! Worker supervisor using the actor pattern.
//!
//! The supervisor owns the authoritative set of running worker records and
//! the configuration store. It receives commands over a tokio mpsc channel
//! and executes them strictly one at a time, which is what serializes every
//! lifecycle operation on the fleet.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  ControlServer  │──┐
//! └─────────────────┘  │
//! ┌─────────────────┐  │  SupervisorCommand   ┌─────────────────┐     ┌──────────────┐
//! │ heartbeat task  │──┼─────────────────────▶│ SupervisorActor │────▶│ WorkerRecord │
//! └─────────────────┘  │   (mpsc channel)     │  + ConfigStore  │     │  (per name)  │
//! ┌─────────────────┐  │                      └─────────────────┘     └──────┬───────┘
//! │ telemetry task  │──┘                                                     │ spawn / signal
//! └─────────────────┘                                                        ▼
//!                                                                      worker processes
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - Per-worker failures are logged or reported, never propagated as panics
//! - Channel operations handle closure gracefully

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use sieve_core::ConfigStore;

mod actor;
mod commands;
mod handle;
mod process;
mod readiness;
mod record;

pub use actor::{SupervisorActor, CONFIG_ERROR_FILTER, FILTER_NOT_EXISTING};
pub use commands::{SupervisorCommand, SupervisorError, WorkerStatus, WorkerSummary};
pub use handle::SupervisorHandle;
pub use record::WorkerRecord;

/// Channel buffer size
const COMMAND_BUFFER: usize = 32;

/// Heartbeat interval
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Retry counts and intervals used by lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorTimings {
    /// How long a launched worker may take to detach
    pub daemonize_timeout: Duration,
    /// Process-level readiness attempts and spacing
    pub phase1_attempts: u32,
    pub phase1_interval: Duration,
    /// Protocol-level readiness attempts and spacing
    pub phase2_attempts: u32,
    pub phase2_interval: Duration,
    /// Polls for a terminated process to exit before it is killed
    pub stop_attempts: u32,
    pub stop_interval: Duration,
    /// Connect and read budget for a monitoring socket exchange
    pub probe_timeout: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            daemonize_timeout: Duration::from_secs(10),
            phase1_attempts: 3,
            phase1_interval: Duration::from_millis(200),
            phase2_attempts: 10,
            phase2_interval: Duration::from_secs(1),
            stop_attempts: 10,
            stop_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
impl SupervisorTimings {
    pub(crate) fn fast() -> Self {
        Self {
            daemonize_timeout: Duration::from_secs(2),
            phase1_attempts: 3,
            phase1_interval: Duration::from_millis(50),
            phase2_attempts: 3,
            phase2_interval: Duration::from_millis(50),
            stop_attempts: 20,
            stop_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(300),
        }
    }
}

/// Spawns the supervisor actor and returns a handle to it.
///
/// The store should already hold the initial configuration; no worker is
/// started until [`SupervisorHandle::start_all`] is called.
pub fn spawn_supervisor(store: ConfigStore, timings: SupervisorTimings) -> SupervisorHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let actor = SupervisorActor::new(cmd_rx, store, timings);
    tokio::spawn(actor.run());

    SupervisorHandle::new(cmd_tx)
}

/// Spawns the heartbeat loop: one liveness sweep per [`HEARTBEAT_INTERVAL`].
///
/// A sweep that restarts workers can outlast the interval; missed ticks are
/// delayed rather than bunched up.
pub fn spawn_heartbeat_task(
    supervisor: SupervisorHandle,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Heartbeat task stopping: shutdown requested");
                    break;
                }
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Heartbeat task stopping: shutdown requested");
                    break;
                }
                result = supervisor.heartbeat() => {
                    if result.is_err() {
                        debug!("Heartbeat task stopping: supervisor channel closed");
                        break;
                    }
                }
            }
        }
    })
}
