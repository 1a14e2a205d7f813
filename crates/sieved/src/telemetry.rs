//! Periodic telemetry delivery.
//!
//! Every interval the aggregated monitor report is serialized once and
//! handed to each configured sink:
//! - redis: `PUBLISH` on a channel and/or `RPUSH` onto a list
//! - file: appended as one JSON document per line
//!
//! Delivery is best-effort. A sink that fails is dropped and stays dropped
//! until the target is rebuilt, which happens after every `update_filters`.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Sink failures are logged; the loop keeps running

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sieve_core::{FileReport, RedisReport, ReportStats, DEFAULT_REPORT_INTERVAL};
use sieve_protocol::MonitorReport;

use crate::supervisor::SupervisorHandle;

/// Connect, read and write timeout for the key-value store.
const REDIS_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors raised while delivering telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("file {path}: {reason}")]
    File { path: PathBuf, reason: String },
}

// ============================================================================
// Sinks
// ============================================================================

struct RedisSink {
    url: String,
    channel: Option<String>,
    list: Option<String>,
    connection: redis::Connection,
}

impl RedisSink {
    fn connect(report: &RedisReport) -> Result<Self, TelemetryError> {
        let url = report.endpoint.url();
        let client = redis::Client::open(url.as_str())?;
        let connection = client.get_connection_with_timeout(REDIS_IO_TIMEOUT)?;
        connection.set_read_timeout(Some(REDIS_IO_TIMEOUT))?;
        connection.set_write_timeout(Some(REDIS_IO_TIMEOUT))?;

        Ok(Self {
            url,
            channel: report.channel.clone(),
            list: report.list.clone(),
            connection,
        })
    }

    fn deliver(&mut self, payload: &str) -> Result<(), TelemetryError> {
        if let Some(channel) = &self.channel {
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query::<i64>(&mut self.connection)?;
        }
        if let Some(list) = &self.list {
            redis::cmd("RPUSH")
                .arg(list)
                .arg(payload)
                .query::<i64>(&mut self.connection)?;
        }
        Ok(())
    }
}

struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    fn open(report: &FileReport) -> Result<Self, TelemetryError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(report.permissions)
            .open(&report.path)
            .map_err(|e| TelemetryError::File {
                path: report.path.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            path: report.path.clone(),
            file,
        })
    }

    fn deliver(&mut self, payload: &str) -> Result<(), TelemetryError> {
        let mut line = String::with_capacity(payload.len() + 1);
        line.push_str(payload);
        line.push('\n');

        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .map_err(|e| TelemetryError::File {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }
}

// ============================================================================
// Telemetry Target
// ============================================================================

/// The resolved delivery destinations of one configuration.
pub struct TelemetryTarget {
    interval: Duration,
    redis: Option<RedisSink>,
    file: Option<FileSink>,
}

impl TelemetryTarget {
    /// Connects every configured sink. Blocking.
    ///
    /// Sinks that cannot be reached are logged and left out.
    fn connect(stats: &ReportStats) -> Self {
        let redis = stats.redis.as_ref().and_then(|report| match RedisSink::connect(report) {
            Ok(sink) => {
                info!(url = %sink.url, "Telemetry redis sink connected");
                Some(sink)
            }
            Err(e) => {
                warn!(error = %e, "Telemetry redis sink unavailable");
                None
            }
        });

        let file = stats.file.as_ref().and_then(|report| match FileSink::open(report) {
            Ok(sink) => {
                info!(path = %sink.path.display(), "Telemetry file sink opened");
                Some(sink)
            }
            Err(e) => {
                warn!(error = %e, "Telemetry file sink unavailable");
                None
            }
        });

        Self {
            interval: stats.interval,
            redis,
            file,
        }
    }

    fn has_sinks(&self) -> bool {
        self.redis.is_some() || self.file.is_some()
    }

    /// Hands `payload` to every sink, dropping the ones that fail. Blocking.
    fn deliver(&mut self, payload: &str) {
        if let Some(sink) = self.redis.as_mut() {
            if let Err(e) = sink.deliver(payload) {
                warn!(url = %sink.url, error = %e, "Telemetry redis delivery failed, disabling sink");
                self.redis = None;
            }
        }
        if let Some(sink) = self.file.as_mut() {
            if let Err(e) = sink.deliver(payload) {
                warn!(error = %e, "Telemetry file delivery failed, disabling sink");
                self.file = None;
            }
        }
    }
}

/// Shared, swappable telemetry target.
///
/// Blocking sink I/O runs on the blocking pool; the async side only ever
/// swaps or inspects the target.
#[derive(Clone, Default)]
pub struct TelemetryHandle {
    target: Arc<Mutex<Option<TelemetryTarget>>>,
    /// Signalled every time the target is rebuilt
    changed: Arc<Notify>,
}

impl TelemetryHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the target from a telemetry definition.
    pub async fn apply(&self, stats: &ReportStats) {
        let target = if stats.has_targets() {
            let stats = stats.clone();
            match tokio::task::spawn_blocking(move || TelemetryTarget::connect(&stats)).await {
                Ok(target) => Some(target),
                Err(e) => {
                    warn!(error = %e, "Telemetry target setup failed");
                    None
                }
            }
        } else {
            debug!("No telemetry target configured");
            None
        };

        *self.target.lock().await = target;
        self.changed.notify_one();
    }

    /// Returns true if at least one sink is live.
    pub async fn is_active(&self) -> bool {
        self.target
            .lock()
            .await
            .as_ref()
            .map(TelemetryTarget::has_sinks)
            .unwrap_or(false)
    }

    /// Delivery interval of the current target.
    pub async fn interval(&self) -> Duration {
        self.target
            .lock()
            .await
            .as_ref()
            .map(|target| target.interval)
            .unwrap_or(DEFAULT_REPORT_INTERVAL)
    }

    /// Serializes the report and delivers it to every live sink.
    pub async fn deliver(&self, report: &MonitorReport) {
        let payload = match serde_json::to_string(report) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize telemetry report");
                return;
            }
        };

        let target = Arc::clone(&self.target);
        let delivery = tokio::task::spawn_blocking(move || {
            if let Some(target) = target.blocking_lock().as_mut() {
                target.deliver(&payload);
            }
        });

        if let Err(e) = delivery.await {
            warn!(error = %e, "Telemetry delivery task failed");
        }
    }
}

/// Spawns the telemetry loop.
///
/// Each wake collects a fresh monitor report and delivers it, unless no
/// sink is live. Rebuilding the target cuts the current sleep short and
/// restarts the wait with the new interval.
pub fn spawn_telemetry_task(
    supervisor: SupervisorHandle,
    telemetry: TelemetryHandle,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let period = telemetry.interval().await;

            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Telemetry task stopping: shutdown requested");
                    break;
                }
                _ = telemetry.changed.notified() => {
                    debug!("Telemetry target changed, restarting interval");
                    continue;
                }
                _ = sleep(period) => {}
            }

            if !telemetry.is_active().await {
                continue;
            }

            let report = tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Telemetry task stopping: shutdown requested");
                    break;
                }
                result = supervisor.monitor(None) => match result {
                    Ok(report) => report,
                    Err(e) => {
                        debug!(error = %e, "Telemetry task stopping");
                        break;
                    }
                },
            };

            telemetry.deliver(&report).await;
            debug!(workers = report.len(), "Telemetry delivered");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{spawn_supervisor, SupervisorTimings};
    use serde_json::json;
    use sieve_core::{ConfigStore, RedisEndpoint, RuntimeLayout};
    use std::os::unix::fs::PermissionsExt;
    use tokio::time::timeout;

    fn file_stats(path: PathBuf) -> ReportStats {
        ReportStats {
            file: Some(FileReport {
                path,
                permissions: 0o600,
            }),
            interval: Duration::from_secs(5),
            ..ReportStats::default()
        }
    }

    #[tokio::test]
    async fn test_file_sink_appends_one_line_per_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.log");
        let telemetry = TelemetryHandle::new();

        telemetry.apply(&file_stats(path.clone())).await;
        assert!(telemetry.is_active().await);
        assert_eq!(telemetry.interval().await, Duration::from_secs(5));

        let mut report = MonitorReport::new();
        report.insert("w1".to_string(), json!({"status": "running", "failures": 0}));
        telemetry.deliver(&report).await;
        telemetry.deliver(&report).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["w1"]["status"], "running");

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_left_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = file_stats(dir.path().join("stats.log"));
        stats.redis = Some(RedisReport {
            endpoint: RedisEndpoint::Unix(dir.path().join("no-redis.sock")),
            channel: Some("stats".to_string()),
            list: None,
        });

        let telemetry = TelemetryHandle::new();
        telemetry.apply(&stats).await;

        let target = telemetry.target.lock().await;
        let target = target.as_ref().unwrap();
        assert!(target.redis.is_none());
        assert!(target.file.is_some());
    }

    #[tokio::test]
    async fn test_unwritable_file_disables_target() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = TelemetryHandle::new();

        telemetry
            .apply(&file_stats(dir.path().join("missing-dir").join("stats.log")))
            .await;
        assert!(!telemetry.is_active().await);
    }

    #[tokio::test]
    async fn test_failed_file_write_drops_sink() {
        let telemetry = TelemetryHandle::new();

        // Opens fine, every write fails with ENOSPC.
        telemetry.apply(&file_stats(PathBuf::from("/dev/full"))).await;
        assert!(telemetry.is_active().await);

        let mut report = MonitorReport::new();
        report.insert("w1".to_string(), json!({"status": "running"}));
        telemetry.deliver(&report).await;

        assert!(!telemetry.is_active().await);
        assert!(telemetry.target.lock().await.as_ref().unwrap().file.is_none());
    }

    #[tokio::test]
    async fn test_task_delivers_and_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::under(dir.path());
        layout.create_dirs().unwrap();
        let config = dir.path().join("workers.json");
        std::fs::write(&config, "{}").unwrap();
        let mut store = ConfigStore::new(&config, layout);
        store.load(&config).unwrap();
        let supervisor = spawn_supervisor(store, SupervisorTimings::fast());

        let telemetry = TelemetryHandle::new();
        let cancel_token = CancellationToken::new();
        let task = spawn_telemetry_task(supervisor, telemetry.clone(), cancel_token.clone());

        // Applied after the task is already waiting out the default interval.
        let path = dir.path().join("stats.log");
        let mut stats = file_stats(path.clone());
        stats.interval = Duration::from_secs(1);
        telemetry.apply(&stats).await;

        let mut delivered = String::new();
        for _ in 0..50 {
            delivered = std::fs::read_to_string(&path).unwrap_or_default();
            if !delivered.is_empty() {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        let first = delivered.lines().next().expect("no telemetry line delivered");
        let parsed: serde_json::Value = serde_json::from_str(first).unwrap();
        assert_eq!(parsed, json!({}));

        cancel_token.cancel();
        timeout(Duration::from_secs(1), task)
            .await
            .expect("telemetry task did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_targets_means_inactive() {
        let telemetry = TelemetryHandle::new();
        telemetry.apply(&ReportStats::default()).await;

        assert!(!telemetry.is_active().await);
        assert_eq!(telemetry.interval().await, DEFAULT_REPORT_INTERVAL);
    }
}
