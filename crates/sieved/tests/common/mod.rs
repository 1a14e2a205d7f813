//! Shared fixtures for the sieved integration tests.
//!
//! Every fixture lives in its own temp dir: runtime layout, fleet config and
//! worker config files. Workers are instances of the `sieve-echo-worker`
//! binary built alongside these tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use sieve_core::{ConfigStore, RuntimeLayout};
use sieved::supervisor::{spawn_supervisor, SupervisorHandle, SupervisorTimings};

/// Path of the reference worker binary.
pub fn echo_worker() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_sieve-echo-worker"))
}

/// Short retry windows so failing readiness does not stall the suite.
pub fn fast_timings() -> SupervisorTimings {
    SupervisorTimings {
        daemonize_timeout: Duration::from_secs(5),
        phase1_attempts: 20,
        phase1_interval: Duration::from_millis(100),
        phase2_attempts: 5,
        phase2_interval: Duration::from_millis(100),
        stop_attempts: 30,
        stop_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(500),
    }
}

/// A fleet rooted in a temp dir.
pub struct Fleet {
    pub dir: TempDir,
    pub layout: RuntimeLayout,
    pub config_path: PathBuf,
}

impl Fleet {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let layout = RuntimeLayout::under(dir.path());
        layout.create_dirs().expect("create runtime dirs");
        let config_path = dir.path().join("workers.json");

        Self {
            dir,
            layout,
            config_path,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes a worker config file; `ready: false` keeps the worker from
    /// ever reporting `running`.
    pub fn worker_config(&self, name: &str, ready: bool) -> PathBuf {
        let path = self.path().join(format!("{name}.conf"));
        std::fs::write(&path, json!({ "ready": ready }).to_string()).expect("write worker config");
        path
    }

    /// A v2 worker entry running the echo worker.
    pub fn worker(&self, name: &str, level: &str) -> Value {
        json!({
            "name": name,
            "exec_path": echo_worker(),
            "config_file": self.worker_config(name, true),
            "log_level": level,
        })
    }

    /// Same as [`Fleet::worker`] but never passes readiness.
    pub fn stuck_worker(&self, name: &str) -> Value {
        json!({
            "name": name,
            "exec_path": echo_worker(),
            "config_file": self.worker_config(name, false),
            "log_level": "DEVELOPER",
        })
    }

    /// Writes a v2 fleet config with the given worker entries.
    pub fn write_config(&self, filters: Vec<Value>) {
        let doc = json!({ "version": 2, "filters": filters, "report_stats": {} });
        std::fs::write(&self.config_path, doc.to_string()).expect("write fleet config");
    }

    pub fn write_raw_config(&self, text: &str) {
        std::fs::write(&self.config_path, text).expect("write fleet config");
    }

    /// Loads the config and spawns a supervisor for it.
    pub fn supervisor(&self) -> SupervisorHandle {
        let mut store = ConfigStore::new(&self.config_path, self.layout.clone());
        store.load(&self.config_path).expect("load fleet config");
        spawn_supervisor(store, fast_timings())
    }
}

/// Sends one line on a worker socket and reads the echo back.
pub async fn echo_through(socket: &Path, line: &str) -> String {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let stream = tokio::net::UnixStream::connect(socket)
        .await
        .expect("connect to worker socket");
    let (reader, mut writer) = stream.into_split();
    writer.write_all(format!("{line}\n").as_bytes()).await.unwrap();

    let mut reply = String::new();
    tokio::time::timeout(
        Duration::from_secs(2),
        BufReader::new(reader).read_line(&mut reply),
    )
    .await
    .expect("echo timed out")
    .expect("read echo");
    reply.trim_end().to_string()
}
