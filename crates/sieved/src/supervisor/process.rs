//! Worker process plumbing: spawning, terminating, files and symlinks.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Termination is best-effort: every failure is logged and the caller
//!   always gets control back within the configured stop budget

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use sieve_core::{
    find_pids_by_cmdline, pid_alive, read_pid, send_signal, RuntimeLayout, Signal, WorkerPaths,
    WorkerSpec,
};

use super::commands::SupervisorError;
use super::SupervisorTimings;

// ============================================================================
// Spawning
// ============================================================================

/// Launches a worker process.
///
/// Outside the verbose DEVELOPER level the launched process is expected to
/// detach and exit; this waits for that and returns `None`. A worker that
/// neither detaches nor exits within the daemonize timeout is killed.
/// In DEVELOPER mode the worker stays in the foreground and its child
/// handle is returned.
pub(crate) async fn spawn_worker(
    spec: &WorkerSpec,
    paths: &WorkerPaths,
    layout: &RuntimeLayout,
    timings: &SupervisorTimings,
) -> Result<Option<Child>, SupervisorError> {
    let developer = spec.log_level.is_developer();

    let mut command = Command::new(&spec.exec_path);
    command
        .args(spec.arguments(paths, layout))
        .stdin(Stdio::null());
    if !developer {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }

    let mut child = command.spawn().map_err(|e| {
        SupervisorError::Process(format!(
            "failed to spawn {}: {e}",
            spec.exec_path.display()
        ))
    })?;

    debug!(
        worker = %spec.name,
        launcher_pid = ?child.id(),
        developer,
        "Worker process launched"
    );

    if developer {
        return Ok(Some(child));
    }

    match timeout(timings.daemonize_timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(None),
        Ok(Ok(status)) => Err(SupervisorError::Process(format!(
            "worker exited before detaching ({status})"
        ))),
        Ok(Err(e)) => Err(SupervisorError::Process(format!(
            "failed to wait for worker launch: {e}"
        ))),
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!(worker = %spec.name, error = %e, "Failed to kill undetached worker");
            }
            Err(SupervisorError::Process(format!(
                "worker did not detach within {:?}",
                timings.daemonize_timeout
            )))
        }
    }
}

// ============================================================================
// Termination
// ============================================================================

/// Reaps a foreground child if it has exited. Returns true if it had.
pub(crate) fn reap_child(name: &str, child: &mut Option<Child>) -> bool {
    let Some(process) = child.as_mut() else {
        return false;
    };
    match process.try_wait() {
        Ok(Some(status)) => {
            debug!(worker = %name, %status, "Reaped worker child");
            *child = None;
            true
        }
        Ok(None) => false,
        Err(e) => {
            warn!(worker = %name, error = %e, "Failed to poll worker child");
            false
        }
    }
}

/// Stops the process of one generation, located through its pid file.
///
/// Never touches the published symlink. When the pid file is missing the
/// process table is scanned for the generation's primary socket path, since
/// a worker can die before writing its pid file. The scan is allowed to
/// miss.
pub(crate) async fn terminate(
    name: &str,
    paths: &WorkerPaths,
    child: &mut Option<Child>,
    timings: &SupervisorTimings,
) {
    reap_child(name, child);

    let pids = match read_pid(&paths.pid_file) {
        Some(pid) => vec![pid],
        None => match child.as_ref().and_then(Child::id) {
            Some(pid) => vec![pid],
            None => scan_for_worker(name, paths).await,
        },
    };

    for pid in pids {
        terminate_pid(name, pid, child, timings).await;
    }

    if let Some(mut process) = child.take() {
        if let Err(e) = process.kill().await {
            debug!(worker = %name, error = %e, "Child already gone");
        }
    }
}

async fn scan_for_worker(name: &str, paths: &WorkerPaths) -> Vec<u32> {
    let needle = paths.socket.to_string_lossy().into_owned();
    warn!(
        worker = %name,
        pid_file = %paths.pid_file.display(),
        "Pid file missing, scanning process table"
    );

    match tokio::task::spawn_blocking(move || find_pids_by_cmdline(&needle)).await {
        Ok(pids) => {
            if !pids.is_empty() {
                info!(worker = %name, ?pids, "Found worker processes by command line");
            }
            pids
        }
        Err(e) => {
            warn!(worker = %name, error = %e, "Process table scan failed");
            Vec::new()
        }
    }
}

async fn terminate_pid(
    name: &str,
    pid: u32,
    child: &mut Option<Child>,
    timings: &SupervisorTimings,
) {
    if !pid_alive(pid) {
        debug!(worker = %name, pid, "Process already gone");
        return;
    }

    if let Err(e) = send_signal(pid, Signal::Terminate) {
        warn!(worker = %name, pid, error = %e, "Failed to send SIGTERM");
    }

    if wait_for_exit(name, pid, child, timings).await {
        info!(worker = %name, pid, "Worker stopped");
        return;
    }

    warn!(
        worker = %name,
        pid,
        attempts = timings.stop_attempts,
        "Worker ignored SIGTERM, killing"
    );
    if let Err(e) = send_signal(pid, Signal::Kill) {
        warn!(worker = %name, pid, error = %e, "Failed to send SIGKILL");
    }
    reap_child(name, child);
}

async fn wait_for_exit(
    name: &str,
    pid: u32,
    child: &mut Option<Child>,
    timings: &SupervisorTimings,
) -> bool {
    for _ in 0..timings.stop_attempts {
        if reap_child(name, child) || !pid_alive(pid) {
            return true;
        }
        sleep(timings.stop_interval).await;
    }
    reap_child(name, child) || !pid_alive(pid)
}

// ============================================================================
// Files
// ============================================================================

/// Removes a file, treating absence as success.
fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Removes the pid file and both sockets of one generation. Idempotent.
pub(crate) fn clean_files(name: &str, paths: &WorkerPaths) {
    for path in paths.generation_files() {
        if let Err(e) = remove_if_present(path) {
            warn!(worker = %name, path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

/// Points the published socket at this generation's primary socket.
///
/// The link is created under a temporary name and renamed over the
/// published path, so clients always find either the old or the new target.
pub(crate) fn publish(paths: &WorkerPaths) -> io::Result<()> {
    let file_name = paths
        .published_socket
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = paths
        .published_socket
        .with_file_name(format!(".{file_name}.tmp"));

    remove_if_present(&staging)?;
    symlink(&paths.socket, &staging)?;
    fs::rename(&staging, &paths.published_socket)
}

/// Removes the published symlink if present.
pub(crate) fn unpublish(name: &str, paths: &WorkerPaths) {
    let is_link = fs::symlink_metadata(&paths.published_socket)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    if !is_link {
        return;
    }
    if let Err(e) = remove_if_present(&paths.published_socket) {
        warn!(
            worker = %name,
            path = %paths.published_socket.display(),
            error = %e,
            "Failed to remove published socket"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_core::Generation;

    #[test]
    fn test_publish_replaces_link_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::under(dir.path());
        layout.create_dirs().unwrap();

        let a = layout.paths_for("w1", Generation::A);
        let b = layout.paths_for("w1", Generation::B);

        publish(&a).unwrap();
        assert_eq!(fs::read_link(&a.published_socket).unwrap(), a.socket);

        publish(&b).unwrap();
        assert_eq!(fs::read_link(&b.published_socket).unwrap(), b.socket);

        let leftovers: Vec<_> = fs::read_dir(&layout.socket_dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        unpublish("w1", &b);
        assert!(fs::symlink_metadata(&b.published_socket).is_err());
        unpublish("w1", &b);
    }

    #[test]
    fn test_clean_files_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::under(dir.path());
        layout.create_dirs().unwrap();
        let paths = layout.paths_for("w1", Generation::A);

        for path in paths.generation_files() {
            fs::write(path, "x").unwrap();
        }
        clean_files("w1", &paths);
        clean_files("w1", &paths);

        for path in paths.generation_files() {
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn test_terminate_foreground_child() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimeLayout::under(dir.path()).paths_for("w1", Generation::A);
        let timings = SupervisorTimings::fast();

        let mut child = Some(Command::new("sleep").arg("30").spawn().unwrap());
        let pid = child.as_ref().and_then(Child::id).unwrap();

        terminate("w1", &paths, &mut child, &timings).await;

        assert!(child.is_none());
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::under(dir.path());
        let spec = WorkerSpec::new("w1", dir.path().join("missing-binary"), "/tmp/c");
        let paths = layout.paths_for("w1", Generation::A);

        let result = spawn_worker(&spec, &paths, &layout, &SupervisorTimings::fast()).await;
        assert!(matches!(result, Err(SupervisorError::Process(_))));
    }

    #[tokio::test]
    async fn test_launcher_failure_is_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::under(dir.path());
        let spec = WorkerSpec::new("w1", "false", "/tmp/c");
        let paths = layout.paths_for("w1", Generation::A);

        let result = spawn_worker(&spec, &paths, &layout, &SupervisorTimings::fast()).await;
        assert!(matches!(result, Err(SupervisorError::Process(_))));
    }
}
