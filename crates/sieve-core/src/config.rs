//! Fleet configuration store.
//!
//! Loads the JSON configuration describing which workers to run, validates
//! it against one of two schema versions, and holds the committed result:
//!
//! - **v1** (legacy): a flat map of `name -> worker`, no telemetry section.
//! - **v2**: `{"version": <number>, "filters": [...], "report_stats": {...}}`.
//!
//! A document is treated as v2 when it carries a numeric `version` field.
//! Loading is validate-then-commit: a document that fails validation leaves
//! the previously loaded configuration untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::worker::{Generation, LogLevel, RuntimeLayout, WorkerPaths, WorkerSpec};

/// Telemetry delivery interval used when `report_stats.interval` is absent.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Permission bits of the telemetry file when none are configured.
pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o640;

/// Process fields sampled for each worker when none are configured.
pub const DEFAULT_PROC_STATS: [&str; 2] = ["memory_percent", "cpu_percent"];

/// Which schema a configuration document was validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    V1,
    V2,
}

/// Where the key-value store listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisEndpoint {
    Unix(PathBuf),
    Tcp { ip: String, port: u16 },
}

impl RedisEndpoint {
    /// Connection URL understood by the redis client.
    pub fn url(&self) -> String {
        match self {
            Self::Unix(path) => format!("redis+unix://{}", path.display()),
            Self::Tcp { ip, port } if ip.contains(':') && !ip.starts_with('[') => {
                format!("redis://[{ip}]:{port}/")
            }
            Self::Tcp { ip, port } => format!("redis://{ip}:{port}/"),
        }
    }
}

/// Key-value store telemetry target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisReport {
    pub endpoint: RedisEndpoint,
    /// Pub/sub channel to publish each report on
    pub channel: Option<String>,
    /// List each report is appended to
    pub list: Option<String>,
}

/// Append-only file telemetry target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub path: PathBuf,
    /// POSIX permission bits used when the file is created
    pub permissions: u32,
}

/// Telemetry delivery definition (`report_stats`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportStats {
    pub redis: Option<RedisReport>,
    pub file: Option<FileReport>,
    pub interval: Duration,
    pub proc_stats: Vec<String>,
}

impl Default for ReportStats {
    fn default() -> Self {
        Self {
            redis: None,
            file: None,
            interval: DEFAULT_REPORT_INTERVAL,
            proc_stats: DEFAULT_PROC_STATS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl ReportStats {
    /// Returns true if at least one delivery target is configured.
    pub fn has_targets(&self) -> bool {
        self.redis.is_some() || self.file.is_some()
    }
}

/// A worker as committed by the store: its spec plus the paths of its
/// initial generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredWorker {
    pub spec: WorkerSpec,
    pub generation: Generation,
    pub paths: WorkerPaths,
}

/// A fully validated configuration document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedConfig {
    pub version: SchemaVersion,
    pub workers: BTreeMap<String, ConfiguredWorker>,
    pub report_stats: ReportStats,
}

impl LoadedConfig {
    fn empty() -> Self {
        Self {
            version: SchemaVersion::V1,
            workers: BTreeMap::new(),
            report_stats: ReportStats::default(),
        }
    }
}

// ============================================================================
// Raw documents
// ============================================================================

fn default_nb_thread() -> u32 {
    WorkerSpec::DEFAULT_NB_THREAD
}

fn default_threshold() -> u64 {
    WorkerSpec::DEFAULT_THRESHOLD
}

fn default_output() -> String {
    WorkerSpec::DEFAULT_OUTPUT.to_string()
}

fn default_interval_secs() -> u64 {
    DEFAULT_REPORT_INTERVAL.as_secs()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWorker {
    #[serde(default)]
    name: Option<String>,
    exec_path: String,
    config_file: String,
    #[serde(default = "default_nb_thread")]
    nb_thread: u32,
    #[serde(default)]
    log_level: LogLevel,
    #[serde(default)]
    cache_size: u64,
    #[serde(default = "default_output")]
    output: String,
    #[serde(default)]
    next_filter: Option<String>,
    #[serde(default = "default_threshold")]
    threshold: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfigV2 {
    #[allow(dead_code)]
    version: serde_json::Number,
    filters: Vec<RawWorker>,
    report_stats: RawReportStats,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReportStats {
    redis: Option<RawRedis>,
    file: Option<RawFile>,
    #[serde(default = "default_interval_secs")]
    interval: u64,
    proc_stats: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRedis {
    unix_path: Option<String>,
    ip: Option<String>,
    port: Option<u16>,
    channel: Option<String>,
    list: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    filepath: String,
    #[serde(default)]
    permissions: Option<u32>,
}

// ============================================================================
// Validation
// ============================================================================

/// Parses and validates a configuration document.
///
/// Pure function: nothing is committed anywhere.
pub fn parse_config(text: &str, layout: &RuntimeLayout) -> ConfigResult<LoadedConfig> {
    let document: Value = serde_json::from_str(text).map_err(ConfigError::parse)?;

    let is_v2 = document
        .get("version")
        .map(Value::is_number)
        .unwrap_or(false);

    if is_v2 {
        let raw: RawConfigV2 = serde_json::from_value(document).map_err(ConfigError::parse)?;

        let mut workers = BTreeMap::new();
        for raw_worker in raw.filters {
            let name = raw_worker
                .name
                .clone()
                .ok_or_else(|| ConfigError::parse("missing field `name` in filter"))?;
            if workers.contains_key(&name) {
                return Err(ConfigError::invalid(
                    "name",
                    format!("duplicate filter name '{name}'"),
                ));
            }
            let worker = build_worker(name.clone(), raw_worker, layout)?;
            workers.insert(name, worker);
        }

        Ok(LoadedConfig {
            version: SchemaVersion::V2,
            workers,
            report_stats: build_report_stats(raw.report_stats)?,
        })
    } else {
        let raw: BTreeMap<String, RawWorker> =
            serde_json::from_value(document).map_err(ConfigError::parse)?;

        let mut workers = BTreeMap::new();
        for (name, raw_worker) in raw {
            if let Some(inner) = raw_worker.name.as_deref() {
                if inner != name {
                    return Err(ConfigError::invalid(
                        "name",
                        format!("filter '{name}' declares a different name '{inner}'"),
                    ));
                }
            }
            let worker = build_worker(name.clone(), raw_worker, layout)?;
            workers.insert(name, worker);
        }

        Ok(LoadedConfig {
            version: SchemaVersion::V1,
            workers,
            report_stats: ReportStats::default(),
        })
    }
}

fn validate_name(name: &str) -> ConfigResult<()> {
    if name.is_empty() {
        return Err(ConfigError::invalid("name", "filter name must not be empty"));
    }
    if name.contains('/') || name == "." || name == ".." || name.contains('\0') {
        return Err(ConfigError::invalid(
            "name",
            format!("'{name}' cannot be used in a file name"),
        ));
    }
    Ok(())
}

fn build_worker(
    name: String,
    raw: RawWorker,
    layout: &RuntimeLayout,
) -> ConfigResult<ConfiguredWorker> {
    validate_name(&name)?;

    if raw.exec_path.is_empty() {
        return Err(ConfigError::invalid(
            "exec_path",
            format!("filter '{name}' has an empty exec_path"),
        ));
    }
    if raw.nb_thread == 0 {
        return Err(ConfigError::invalid(
            "nb_thread",
            format!("filter '{name}' must run at least 1 thread"),
        ));
    }

    let spec = WorkerSpec {
        name: name.clone(),
        exec_path: PathBuf::from(raw.exec_path),
        config_file: PathBuf::from(raw.config_file),
        nb_thread: raw.nb_thread,
        log_level: raw.log_level,
        cache_size: raw.cache_size,
        output: raw.output,
        next_filter: raw.next_filter.filter(|next| !next.is_empty()),
        threshold: raw.threshold,
    };

    let generation = Generation::default();
    Ok(ConfiguredWorker {
        paths: layout.paths_for(&name, generation),
        spec,
        generation,
    })
}

fn build_report_stats(raw: RawReportStats) -> ConfigResult<ReportStats> {
    let redis = raw.redis.map(build_redis).transpose()?;

    let file = raw
        .file
        .map(|file| -> ConfigResult<FileReport> {
            if file.filepath.is_empty() {
                return Err(ConfigError::invalid("file.filepath", "must not be empty"));
            }
            Ok(FileReport {
                path: PathBuf::from(file.filepath),
                permissions: match file.permissions {
                    Some(digits) => permissions_from_digits(digits)?,
                    None => DEFAULT_FILE_PERMISSIONS,
                },
            })
        })
        .transpose()?;

    if raw.interval == 0 {
        return Err(ConfigError::invalid("interval", "must be at least 1 second"));
    }

    Ok(ReportStats {
        redis,
        file,
        interval: Duration::from_secs(raw.interval),
        proc_stats: raw
            .proc_stats
            .unwrap_or_else(|| DEFAULT_PROC_STATS.iter().map(|f| f.to_string()).collect()),
    })
}

fn build_redis(raw: RawRedis) -> ConfigResult<RedisReport> {
    let endpoint = match (raw.unix_path, raw.ip, raw.port) {
        (Some(path), _, _) => RedisEndpoint::Unix(PathBuf::from(path)),
        (None, Some(ip), Some(port)) => RedisEndpoint::Tcp { ip, port },
        _ => {
            return Err(ConfigError::invalid(
                "redis",
                "either unix_path or both ip and port are required",
            ))
        }
    };

    if raw.channel.is_none() && raw.list.is_none() {
        return Err(ConfigError::invalid(
            "redis",
            "at least one of channel or list is required",
        ));
    }

    Ok(RedisReport {
        endpoint,
        channel: raw.channel,
        list: raw.list,
    })
}

/// Reads chmod-style digits (`640`) as permission bits (`0o640`).
fn permissions_from_digits(digits: u32) -> ConfigResult<u32> {
    let text = digits.to_string();
    u32::from_str_radix(&text, 8)
        .ok()
        .filter(|bits| *bits <= 0o7777)
        .ok_or_else(|| {
            ConfigError::invalid(
                "file.permissions",
                format!("{text} is not an octal permission mode"),
            )
        })
}

// ============================================================================
// Config Store
// ============================================================================

/// Holds the committed fleet configuration.
///
/// Owned by the supervisor; there is no process-wide configuration state.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    layout: RuntimeLayout,
    current: LoadedConfig,
}

impl ConfigStore {
    /// Creates an empty store that will read from `path`.
    pub fn new(path: impl Into<PathBuf>, layout: RuntimeLayout) -> Self {
        Self {
            path: path.into(),
            layout,
            current: LoadedConfig::empty(),
        }
    }

    /// Loads, validates and commits the configuration at `path`.
    ///
    /// On error the previously committed configuration is kept.
    pub fn load(&mut self, path: &Path) -> ConfigResult<()> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let loaded = parse_config(&text, &self.layout)?;

        info!(
            path = %path.display(),
            version = ?loaded.version,
            workers = loaded.workers.len(),
            telemetry = loaded.report_stats.has_targets(),
            "Configuration loaded"
        );

        self.current = loaded;
        self.path = path.to_path_buf();
        Ok(())
    }

    /// Re-reads the configuration from the path it was last loaded from.
    pub fn reload(&mut self) -> ConfigResult<()> {
        let path = self.path.clone();
        debug!(path = %path.display(), "Reloading configuration");
        self.load(&path)
    }

    /// Returns the configuration file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the runtime layout paths are derived from.
    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    /// Returns the schema version of the committed configuration.
    pub fn version(&self) -> SchemaVersion {
        self.current.version
    }

    /// Returns all configured workers keyed by name.
    pub fn workers(&self) -> &BTreeMap<String, ConfiguredWorker> {
        &self.current.workers
    }

    /// Returns a single configured worker.
    pub fn worker(&self, name: &str) -> Option<&ConfiguredWorker> {
        self.current.workers.get(name)
    }

    /// Returns the names of all configured workers.
    pub fn names(&self) -> BTreeSet<String> {
        self.current.workers.keys().cloned().collect()
    }

    /// Returns the telemetry definition.
    pub fn report_stats(&self) -> &ReportStats {
        &self.current.report_stats
    }

    /// Names that were added or removed between two fleets.
    ///
    /// This is the target set of an update that names no specific workers.
    pub fn diff(current: &BTreeSet<String>, new: &BTreeSet<String>) -> BTreeSet<String> {
        current.symmetric_difference(new).cloned().collect()
    }
}
