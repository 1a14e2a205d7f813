//! Runtime record of one supervised worker and its lifecycle steps.
//!
//! ```text
//!   starting ──▶ running ──▶ stopping ──▶ stopped
//!      ▲            │
//!      │            │ heartbeat fault
//!      └── restart ─┴──▶ dead
//! ```
//!
//! These methods are the unlocked building blocks: they assume the caller
//! (the supervisor actor) already has exclusive access to the fleet.

use tokio::process::Child;
use tracing::{info, warn};

use sieve_core::{pid_alive, read_pid, Endpoint, Generation, RuntimeLayout, WorkerPaths, WorkerSpec};

use super::commands::{SupervisorError, WorkerStatus, WorkerSummary};
use super::process::{clean_files, publish, reap_child, spawn_worker, terminate, unpublish};
use super::readiness::wait_ready;
use super::SupervisorTimings;

/// One worker as the supervisor tracks it.
#[derive(Debug)]
pub struct WorkerRecord {
    pub spec: WorkerSpec,
    pub generation: Generation,
    pub paths: WorkerPaths,
    pub status: WorkerStatus,
    /// Heartbeat-detected faults, carried across restarts and updates
    pub failures: u32,
    /// Foreground process handle (DEVELOPER mode only)
    child: Option<Child>,
}

impl WorkerRecord {
    /// Creates a stopped record for `spec` at `generation`.
    pub fn new(spec: WorkerSpec, generation: Generation, layout: &RuntimeLayout) -> Self {
        Self {
            paths: layout.paths_for(&spec.name, generation),
            spec,
            generation,
            status: WorkerStatus::Stopped,
            failures: 0,
            child: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Pid of the live process, from the pid file or the foreground child.
    pub fn pid(&self) -> Option<u32> {
        read_pid(&self.paths.pid_file).or_else(|| self.child.as_ref().and_then(Child::id))
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            name: self.spec.name.clone(),
            generation: self.generation,
            status: self.status,
            failures: self.failures,
            pid: self.pid(),
        }
    }

    /// Spawns the process and waits for readiness without publishing it.
    ///
    /// On failure the half-started process is stopped through its pid file
    /// only, its files are cleaned and the record is left `dead`.
    pub async fn boot(
        &mut self,
        layout: &RuntimeLayout,
        timings: &SupervisorTimings,
    ) -> Result<(), SupervisorError> {
        self.status = WorkerStatus::Starting;
        info!(worker = %self.spec.name, generation = %self.generation, "Starting worker");

        let result = match spawn_worker(&self.spec, &self.paths, layout, timings).await {
            Ok(child) => {
                self.child = child;
                wait_ready(&self.spec.name, &self.paths, &mut self.child, timings).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(
                worker = %self.spec.name,
                generation = %self.generation,
                error = %e,
                "Worker failed to start"
            );
            self.halt(timings).await;
            self.clean();
            self.status = WorkerStatus::Dead;
        }
        result
    }

    /// Points the published socket at this record's generation.
    pub fn publish(&self) -> Result<(), SupervisorError> {
        publish(&self.paths).map_err(|e| {
            SupervisorError::Process(format!(
                "failed to publish {}: {e}",
                self.paths.published_socket.display()
            ))
        })
    }

    /// Boots and publishes the worker.
    pub async fn start(
        &mut self,
        layout: &RuntimeLayout,
        timings: &SupervisorTimings,
    ) -> Result<(), SupervisorError> {
        self.boot(layout, timings).await?;

        if let Err(e) = self.publish() {
            warn!(worker = %self.spec.name, error = %e, "Worker started but could not be published");
            self.halt(timings).await;
            self.clean();
            self.status = WorkerStatus::Dead;
            return Err(e);
        }

        self.status = WorkerStatus::Running;
        info!(
            worker = %self.spec.name,
            generation = %self.generation,
            pid = ?self.pid(),
            "Worker running"
        );
        Ok(())
    }

    /// Stops this generation's process without touching the published link.
    pub async fn halt(&mut self, timings: &SupervisorTimings) {
        terminate(&self.spec.name, &self.paths, &mut self.child, timings).await;
    }

    /// Stops the worker and withdraws its published socket. Idempotent.
    pub async fn stop(&mut self, timings: &SupervisorTimings) {
        self.status = WorkerStatus::Stopping;
        self.halt(timings).await;
        unpublish(&self.spec.name, &self.paths);
        self.clean();
        self.status = WorkerStatus::Stopped;
    }

    /// Removes leftover pid file and sockets of this generation. Idempotent.
    pub fn clean(&self) {
        clean_files(&self.spec.name, &self.paths);
    }

    /// Stop, clean, start. Leaves the record `dead` if the new start fails.
    pub async fn restart(
        &mut self,
        layout: &RuntimeLayout,
        timings: &SupervisorTimings,
    ) -> Result<(), SupervisorError> {
        info!(worker = %self.spec.name, failures = self.failures, "Restarting worker");
        self.stop(timings).await;
        self.clean();
        self.start(layout, timings).await
    }

    /// Runs the heartbeat checks, returning the first one that fails.
    pub fn check_liveness(&mut self) -> Result<(), String> {
        if reap_child(&self.spec.name, &mut self.child) {
            return Err("worker process exited".to_string());
        }
        let pid = read_pid(&self.paths.pid_file)
            .ok_or_else(|| format!("pid file {} not readable", self.paths.pid_file.display()))?;
        if !pid_alive(pid) {
            return Err(format!("process {pid} is not alive"));
        }
        if !Endpoint::Unix(self.paths.socket.clone()).reachable() {
            return Err(format!("socket {} not reachable", self.paths.socket.display()));
        }
        if !Endpoint::Unix(self.paths.monitoring_socket.clone()).reachable() {
            return Err(format!(
                "monitoring socket {} not reachable",
                self.paths.monitoring_socket.display()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_new_record_is_stopped() {
        let layout = RuntimeLayout::new("/run/sieve/pids", "/run/sieve/sockets");
        let record = WorkerRecord::new(WorkerSpec::new("w1", "/bin/w", "/tmp/c"), Generation::B, &layout);

        let summary = record.summary();
        assert_eq!(summary.status, WorkerStatus::Stopped);
        assert_eq!(summary.generation, Generation::B);
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.pid, None);
        assert!(record.paths.socket.ends_with("w1_b.sock"));
    }

    #[test]
    fn test_liveness_reports_first_failing_check() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::under(dir.path());
        layout.create_dirs().unwrap();
        let mut record = WorkerRecord::new(WorkerSpec::new("w1", "/bin/w", "/tmp/c"), Generation::A, &layout);

        let reason = record.check_liveness().unwrap_err();
        assert!(reason.starts_with("pid file"));

        fs::write(&record.paths.pid_file, std::process::id().to_string()).unwrap();
        let reason = record.check_liveness().unwrap_err();
        assert!(reason.starts_with("socket"));

        fs::write(&record.paths.socket, "").unwrap();
        let reason = record.check_liveness().unwrap_err();
        assert!(reason.starts_with("monitoring socket"));

        fs::write(&record.paths.monitoring_socket, "").unwrap();
        assert!(record.check_liveness().is_ok());
        assert_eq!(record.pid(), Some(std::process::id()));
    }

    #[tokio::test]
    async fn test_failed_boot_leaves_record_dead_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::under(dir.path());
        layout.create_dirs().unwrap();
        let mut record = WorkerRecord::new(WorkerSpec::new("w1", "true", "/tmp/c"), Generation::A, &layout);

        let result = record.start(&layout, &SupervisorTimings::fast()).await;

        assert!(matches!(result, Err(SupervisorError::Readiness(_))));
        assert_eq!(record.status, WorkerStatus::Dead);
        assert!(fs::symlink_metadata(&record.paths.published_socket).is_err());
        for path in record.paths.generation_files() {
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn test_worker_that_never_detaches_is_killed_and_dead() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::under(dir.path());
        layout.create_dirs().unwrap();

        // Stays in the foreground; records its pid before becoming `sleep`.
        let launcher_pid = dir.path().join("launcher.pid");
        let script = dir.path().join("foreground-worker");
        fs::write(
            &script,
            format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n", launcher_pid.display()),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut record = WorkerRecord::new(WorkerSpec::new("w1", &script, "/tmp/c"), Generation::A, &layout);
        let timings = SupervisorTimings {
            daemonize_timeout: Duration::from_millis(300),
            ..SupervisorTimings::fast()
        };

        let result = record.start(&layout, &timings).await;

        match result {
            Err(SupervisorError::Process(reason)) => assert!(reason.contains("did not detach")),
            other => panic!("expected a process error, got {other:?}"),
        }
        assert_eq!(record.status, WorkerStatus::Dead);

        let pid: u32 = fs::read_to_string(&launcher_pid).unwrap().trim().parse().unwrap();
        assert!(!pid_alive(pid));
        let socket = record.paths.socket.to_string_lossy().into_owned();
        assert!(sieve_core::find_pids_by_cmdline(&socket).is_empty());
        assert!(fs::symlink_metadata(&record.paths.published_socket).is_err());
    }
}
