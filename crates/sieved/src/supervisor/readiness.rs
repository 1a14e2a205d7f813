//! Two-phase readiness gate and monitoring-socket probes.
//!
//! Phase 1 is process level: pid file readable, process alive, monitoring
//! socket present. Phase 2 is protocol level: the monitoring socket must
//! answer with a document mentioning `running`, and the primary socket
//! must exist.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::time::{sleep, timeout};
use tracing::debug;

use sieve_core::{pid_alive, read_pid, Endpoint, WorkerPaths};
use sieve_protocol::FramedChannel;

use super::commands::SupervisorError;
use super::process::reap_child;
use super::SupervisorTimings;

/// Connects to a monitoring socket and returns the raw reply.
///
/// Nothing is written: connecting is the probe.
pub(crate) async fn probe_raw(path: &Path, probe_timeout: Duration) -> Result<String, SupervisorError> {
    let stream = match timeout(probe_timeout, UnixStream::connect(path)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(SupervisorError::Transport(format!(
                "{}: {e}",
                path.display()
            )))
        }
        Err(_) => {
            return Err(SupervisorError::Transport(format!(
                "{}: connect timed out",
                path.display()
            )))
        }
    };

    FramedChannel::new(stream)
        .with_timeout(probe_timeout)
        .receive_raw()
        .await
        .map_err(|e| SupervisorError::Transport(format!("{}: {e}", path.display())))
}

/// Queries a monitoring socket for its status document.
pub(crate) async fn query_status(path: &Path, probe_timeout: Duration) -> Result<Value, SupervisorError> {
    let raw = probe_raw(path, probe_timeout).await?;
    serde_json::from_str(&raw).map_err(|e| SupervisorError::Transport(e.to_string()))
}

fn process_check(name: &str, paths: &WorkerPaths, child: &mut Option<Child>) -> Result<u32, String> {
    if reap_child(name, child) {
        return Err("worker process exited during startup".to_string());
    }
    let pid = read_pid(&paths.pid_file)
        .ok_or_else(|| format!("pid file {} not readable", paths.pid_file.display()))?;
    if !pid_alive(pid) {
        return Err(format!("process {pid} is not alive"));
    }
    if !Endpoint::Unix(paths.monitoring_socket.clone()).reachable() {
        return Err(format!(
            "monitoring socket {} not reachable",
            paths.monitoring_socket.display()
        ));
    }
    Ok(pid)
}

async fn protocol_check(paths: &WorkerPaths, timings: &SupervisorTimings) -> Result<(), String> {
    let reply = probe_raw(&paths.monitoring_socket, timings.probe_timeout)
        .await
        .map_err(|e| e.to_string())?;
    if !reply.contains("running") {
        return Err(format!("worker not running yet: {reply}"));
    }
    if !Endpoint::Unix(paths.socket.clone()).reachable() {
        return Err(format!(
            "primary socket {} not reachable",
            paths.socket.display()
        ));
    }
    Ok(())
}

/// Waits until a freshly spawned worker is ready.
///
/// On failure the error names the check that did not pass; the caller is
/// responsible for stopping and cleaning the worker.
pub(crate) async fn wait_ready(
    name: &str,
    paths: &WorkerPaths,
    child: &mut Option<Child>,
    timings: &SupervisorTimings,
) -> Result<(), SupervisorError> {
    let mut attempt = 0;
    let pid = loop {
        attempt += 1;
        match process_check(name, paths, child) {
            Ok(pid) => break pid,
            Err(reason) if attempt >= timings.phase1_attempts => {
                return Err(SupervisorError::Readiness(reason));
            }
            Err(reason) => {
                debug!(worker = %name, attempt, %reason, "Worker process not up yet");
                sleep(timings.phase1_interval).await;
            }
        }
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        match protocol_check(paths, timings).await {
            Ok(()) => {
                debug!(worker = %name, pid, "Worker ready");
                return Ok(());
            }
            Err(reason) if attempt >= timings.phase2_attempts => {
                return Err(SupervisorError::Readiness(reason));
            }
            Err(reason) => {
                debug!(worker = %name, attempt, %reason, "Worker not ready yet");
                sleep(timings.phase2_interval).await;
            }
        }
    }
}
