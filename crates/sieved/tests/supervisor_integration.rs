//! Integration tests for the supervisor against real worker processes.
//!
//! Every test runs its own fleet of `sieve-echo-worker` instances in a temp
//! dir. DEVELOPER level keeps workers in the foreground so the tests can
//! kill and observe them directly.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;

use common::{echo_through, Fleet};
use sieve_core::{pid_alive, send_signal, Generation, Signal};
use sieved::supervisor::{SupervisorHandle, WorkerStatus, WorkerSummary};

async fn summary(supervisor: &SupervisorHandle, name: &str) -> WorkerSummary {
    supervisor
        .workers()
        .await
        .unwrap()
        .into_iter()
        .find(|worker| worker.name == name)
        .unwrap_or_else(|| panic!("worker {name} not supervised"))
}

// ============================================================================
// Start / Stop
// ============================================================================

#[tokio::test]
async fn test_daemonized_worker_starts_published_and_echoes() {
    let fleet = Fleet::new();
    fleet.write_config(vec![fleet.worker("w1", "WARNING")]);
    let supervisor = fleet.supervisor();

    let errors = supervisor.start_all().await.unwrap();
    assert!(errors.is_empty(), "unexpected start errors: {errors:?}");

    let w1 = summary(&supervisor, "w1").await;
    assert_eq!(w1.status, WorkerStatus::Running);
    assert_eq!(w1.generation, Generation::A);
    assert!(w1.pid.is_some());

    let published = fleet.layout.published_socket("w1");
    let target = std::fs::read_link(&published).unwrap();
    assert_eq!(target, fleet.layout.paths_for("w1", Generation::A).socket);
    assert_eq!(echo_through(&published, "hello").await, "hello");

    supervisor.stop_all().await.unwrap();
    assert!(std::fs::symlink_metadata(&published).is_err());
    assert_eq!(summary(&supervisor, "w1").await.status, WorkerStatus::Stopped);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_leaves_no_files() {
    let fleet = Fleet::new();
    fleet.write_config(vec![fleet.worker("w1", "DEVELOPER")]);
    let supervisor = fleet.supervisor();
    supervisor.start_all().await.unwrap();

    let pid = summary(&supervisor, "w1").await.pid.unwrap();

    supervisor.stop_all().await.unwrap();
    supervisor.stop_all().await.unwrap();
    supervisor.clean_all().await.unwrap();

    assert!(!pid_alive(pid));
    let paths = fleet.layout.paths_for("w1", Generation::A);
    for path in paths.generation_files() {
        assert!(!path.exists(), "{} left behind", path.display());
    }
    assert!(std::fs::symlink_metadata(&paths.published_socket).is_err());
}

#[tokio::test]
async fn test_worker_that_never_gets_ready_is_dead() {
    let fleet = Fleet::new();
    fleet.write_config(vec![fleet.worker("ok", "DEVELOPER"), fleet.stuck_worker("stuck")]);
    let supervisor = fleet.supervisor();

    let errors = supervisor.start_all().await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].filter, "stuck");

    assert_eq!(summary(&supervisor, "ok").await.status, WorkerStatus::Running);
    assert_eq!(summary(&supervisor, "stuck").await.status, WorkerStatus::Dead);

    let paths = fleet.layout.paths_for("stuck", Generation::A);
    assert!(!paths.pid_file.exists());
    assert!(!paths.monitoring_socket.exists());

    let report = supervisor.monitor(Some(vec![])).await.unwrap();
    assert_eq!(report["stuck"], json!({"status": "error"}));
    assert_eq!(report["ok"]["status"], "running");

    supervisor.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_rotate_logs_keeps_workers_serving() {
    let fleet = Fleet::new();
    fleet.write_config(vec![fleet.worker("w1", "WARNING")]);
    let supervisor = fleet.supervisor();
    supervisor.start_all().await.unwrap();
    let pid = summary(&supervisor, "w1").await.pid.unwrap();

    supervisor.rotate_logs().await.unwrap();
    sleep(Duration::from_millis(200)).await;

    assert!(pid_alive(pid));
    assert_eq!(summary(&supervisor, "w1").await.pid, Some(pid));
    let published = fleet.layout.published_socket("w1");
    assert_eq!(echo_through(&published, "rotated").await, "rotated");

    supervisor.heartbeat().await.unwrap();
    assert_eq!(summary(&supervisor, "w1").await.failures, 0);

    supervisor.stop_all().await.unwrap();
    assert!(!pid_alive(pid));
}

// ============================================================================
// Heartbeat
// ============================================================================

#[tokio::test]
async fn test_heartbeat_restarts_killed_worker() {
    let fleet = Fleet::new();
    fleet.write_config(vec![fleet.worker("w1", "DEVELOPER")]);
    let supervisor = fleet.supervisor();
    supervisor.start_all().await.unwrap();

    let first_pid = summary(&supervisor, "w1").await.pid.unwrap();
    send_signal(first_pid, Signal::Kill).unwrap();
    sleep(Duration::from_millis(200)).await;

    supervisor.heartbeat().await.unwrap();

    let w1 = summary(&supervisor, "w1").await;
    assert_eq!(w1.failures, 1);
    assert_eq!(w1.status, WorkerStatus::Running);
    assert_ne!(w1.pid, Some(first_pid));

    // A healthy sweep leaves the counter alone.
    supervisor.heartbeat().await.unwrap();
    assert_eq!(summary(&supervisor, "w1").await.failures, 1);

    let report = supervisor.monitor(Some(vec![])).await.unwrap();
    assert_eq!(report["w1"]["failures"], 1);

    supervisor.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_restarts_killed_daemonized_worker() {
    let fleet = Fleet::new();
    fleet.write_config(vec![fleet.worker("w1", "WARNING")]);
    let supervisor = fleet.supervisor();
    supervisor.start_all().await.unwrap();

    let first_pid = summary(&supervisor, "w1").await.pid.unwrap();
    send_signal(first_pid, Signal::Kill).unwrap();
    for _ in 0..100 {
        if !pid_alive(first_pid) {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(!pid_alive(first_pid), "killed worker {first_pid} still alive");

    supervisor.heartbeat().await.unwrap();

    let w1 = summary(&supervisor, "w1").await;
    assert_eq!(w1.failures, 1);
    assert_eq!(w1.status, WorkerStatus::Running);
    let new_pid = w1.pid.unwrap();
    assert_ne!(new_pid, first_pid);
    assert!(pid_alive(new_pid));

    let published = fleet.layout.published_socket("w1");
    assert_eq!(echo_through(&published, "restarted").await, "restarted");

    supervisor.stop_all().await.unwrap();
}

// ============================================================================
// Update
// ============================================================================

#[tokio::test]
async fn test_update_swaps_generation() {
    let fleet = Fleet::new();
    fleet.write_config(vec![fleet.worker("w1", "DEVELOPER")]);
    let supervisor = fleet.supervisor();
    supervisor.start_all().await.unwrap();
    let old_pid = summary(&supervisor, "w1").await.pid.unwrap();

    let errors = supervisor.update(vec!["w1".to_string()]).await.unwrap();
    assert!(errors.is_empty(), "unexpected update errors: {errors:?}");

    let w1 = summary(&supervisor, "w1").await;
    assert_eq!(w1.generation, Generation::B);
    assert_eq!(w1.status, WorkerStatus::Running);
    assert!(!pid_alive(old_pid));

    let published = fleet.layout.published_socket("w1");
    assert_eq!(
        std::fs::read_link(&published).unwrap(),
        fleet.layout.paths_for("w1", Generation::B).socket
    );
    assert!(!fleet.layout.paths_for("w1", Generation::A).socket.exists());
    assert_eq!(echo_through(&published, "after swap").await, "after swap");

    supervisor.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_published_socket_never_disappears_during_updates() {
    let fleet = Fleet::new();
    fleet.write_config(vec![fleet.worker("w1", "DEVELOPER")]);
    let supervisor = fleet.supervisor();
    supervisor.start_all().await.unwrap();

    let published = fleet.layout.published_socket("w1");
    let done = Arc::new(AtomicBool::new(false));
    let watcher = {
        let done = Arc::clone(&done);
        let published = published.clone();
        std::thread::spawn(move || {
            let (mut checks, mut misses) = (0u64, 0u64);
            while !done.load(Ordering::Relaxed) {
                checks += 1;
                if std::fs::metadata(&published).is_err() {
                    misses += 1;
                }
                std::thread::yield_now();
            }
            (checks, misses)
        })
    };

    for _ in 0..3 {
        let errors = supervisor.update(vec!["w1".to_string()]).await.unwrap();
        assert!(errors.is_empty(), "unexpected update errors: {errors:?}");
    }

    done.store(true, Ordering::Relaxed);
    let (checks, misses) = watcher.join().unwrap();
    assert!(checks > 0);
    assert_eq!(misses, 0, "published socket missing in {misses} of {checks} checks");

    // Three swaps end on the other generation.
    assert_eq!(summary(&supervisor, "w1").await.generation, Generation::B);
    assert_eq!(echo_through(&published, "steady").await, "steady");

    supervisor.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_update_unknown_name_is_reported() {
    let fleet = Fleet::new();
    fleet.write_config(vec![]);
    let supervisor = fleet.supervisor();
    supervisor.start_all().await.unwrap();

    let errors = supervisor.update(vec!["ghost".to_string()]).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].filter, "ghost");
    assert_eq!(errors[0].error, "Filter not existing");
}

#[tokio::test]
async fn test_broken_config_keeps_running_fleet() {
    let fleet = Fleet::new();
    fleet.write_config(vec![fleet.worker("w1", "DEVELOPER")]);
    let supervisor = fleet.supervisor();
    supervisor.start_all().await.unwrap();

    fleet.write_raw_config("{\"version\": 2, \"filters\": [");
    let errors = supervisor.update(vec![]).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].filter, "*");

    let w1 = summary(&supervisor, "w1").await;
    assert_eq!(w1.status, WorkerStatus::Running);
    assert_eq!(w1.generation, Generation::A);

    supervisor.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_update_without_names_adds_and_removes() {
    let fleet = Fleet::new();
    fleet.write_config(vec![fleet.worker("w1", "DEVELOPER")]);
    let supervisor = fleet.supervisor();
    supervisor.start_all().await.unwrap();

    fleet.write_config(vec![fleet.worker("w2", "DEVELOPER")]);
    let errors = supervisor.update(vec![]).await.unwrap();
    assert!(errors.is_empty(), "unexpected update errors: {errors:?}");

    let names: Vec<String> = supervisor
        .workers()
        .await
        .unwrap()
        .into_iter()
        .map(|worker| worker.name)
        .collect();
    assert_eq!(names, vec!["w2".to_string()]);

    assert!(std::fs::symlink_metadata(fleet.layout.published_socket("w1")).is_err());
    assert_eq!(
        echo_through(&fleet.layout.published_socket("w2"), "new").await,
        "new"
    );

    supervisor.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_failed_replacement_keeps_previous_instance() {
    let fleet = Fleet::new();
    fleet.write_config(vec![fleet.worker("w1", "DEVELOPER")]);
    let supervisor = fleet.supervisor();
    supervisor.start_all().await.unwrap();
    let pid = summary(&supervisor, "w1").await.pid.unwrap();

    // The replacement reads the same worker config and never gets ready.
    fleet.worker_config("w1", false);
    let errors = supervisor.update(vec!["w1".to_string()]).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].filter, "w1");

    let w1 = summary(&supervisor, "w1").await;
    assert_eq!(w1.generation, Generation::A);
    assert_eq!(w1.status, WorkerStatus::Running);
    assert_eq!(w1.pid, Some(pid));
    assert!(!fleet.layout.paths_for("w1", Generation::B).pid_file.exists());

    let published = fleet.layout.published_socket("w1");
    assert_eq!(echo_through(&published, "still here").await, "still here");

    supervisor.stop_all().await.unwrap();
}

// ============================================================================
// Monitor
// ============================================================================

#[tokio::test]
async fn test_monitor_merges_worker_document_and_proc_stats() {
    let fleet = Fleet::new();
    fleet.write_config(vec![fleet.worker("w1", "DEVELOPER")]);
    let supervisor = fleet.supervisor();
    supervisor.start_all().await.unwrap();
    let pid = summary(&supervisor, "w1").await.pid.unwrap();

    let report = supervisor
        .monitor(Some(vec!["pid".to_string(), "memory_rss".to_string()]))
        .await
        .unwrap();

    let w1 = &report["w1"];
    assert_eq!(w1["status"], "running");
    assert_eq!(w1["name"], "w1");
    assert_eq!(w1["failures"], 0);
    assert_eq!(w1["proc_stats"]["pid"], json!(pid));
    assert!(w1["proc_stats"]["memory_rss"].is_u64());

    supervisor.stop_all().await.unwrap();
}
