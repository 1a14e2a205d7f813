//! Worker definitions and the filesystem layout derived from them.
//!
//! A [`WorkerSpec`] is what the configuration says about a worker. Every
//! running instance of a worker also carries a [`Generation`] tag, which is
//! appended to its pid file and socket paths so that a replacement instance
//! can start while the previous one is still serving.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sentinel passed to a worker that has no downstream worker.
pub const NO_DOWNSTREAM: &str = "no";

/// Log level handed to a worker on its command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    #[default]
    Warning,
    Error,
    Critical,
    /// Verbose mode: the worker stays in the foreground instead of detaching.
    Developer,
}

impl LogLevel {
    /// Returns the level as written on the worker command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Notice => "NOTICE",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
            Self::Developer => "DEVELOPER",
        }
    }

    /// Returns true for the verbose level, where workers do not daemonize.
    pub fn is_developer(&self) -> bool {
        matches!(self, Self::Developer)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "NOTICE" => Ok(Self::Notice),
            "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            "DEVELOPER" => Ok(Self::Developer),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation tag distinguishing the old and new instance of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    #[default]
    A,
    B,
}

impl Generation {
    /// Returns the other generation.
    #[must_use]
    pub fn flip(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Suffix appended to the worker's tagged paths.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Configured definition of a worker. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Unique worker name
    pub name: String,

    /// Executable launched for this worker
    pub exec_path: PathBuf,

    /// Worker-specific configuration file, passed through untouched
    pub config_file: PathBuf,

    /// Number of worker threads
    pub nb_thread: u32,

    /// Log level for the worker
    pub log_level: LogLevel,

    /// Cache size (0 disables the cache)
    pub cache_size: u64,

    /// Output mode, opaque to the supervisor
    pub output: String,

    /// Name of the downstream worker, if any
    pub next_filter: Option<String>,

    /// Alert threshold
    pub threshold: u64,
}

impl WorkerSpec {
    pub const DEFAULT_NB_THREAD: u32 = 5;
    pub const DEFAULT_CACHE_SIZE: u64 = 0;
    pub const DEFAULT_THRESHOLD: u64 = 100;
    pub const DEFAULT_OUTPUT: &'static str = "NONE";

    /// Creates a spec with every optional field at its default.
    pub fn new(
        name: impl Into<String>,
        exec_path: impl Into<PathBuf>,
        config_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            exec_path: exec_path.into(),
            config_file: config_file.into(),
            nb_thread: Self::DEFAULT_NB_THREAD,
            log_level: LogLevel::default(),
            cache_size: Self::DEFAULT_CACHE_SIZE,
            output: Self::DEFAULT_OUTPUT.to_string(),
            next_filter: None,
            threshold: Self::DEFAULT_THRESHOLD,
        }
    }

    /// Builds the command-line arguments (everything after the executable).
    ///
    /// Order follows the worker process contract:
    /// `-l LEVEL name socket config monitoring pid output downstream threads cache threshold`
    pub fn arguments(&self, paths: &WorkerPaths, layout: &RuntimeLayout) -> Vec<OsString> {
        let downstream = match self.next_filter.as_deref() {
            Some(next) if !next.is_empty() => layout.published_socket(next).into_os_string(),
            _ => OsString::from(NO_DOWNSTREAM),
        };

        vec![
            OsString::from("-l"),
            OsString::from(self.log_level.as_str()),
            OsString::from(&self.name),
            paths.socket.clone().into_os_string(),
            self.config_file.clone().into_os_string(),
            paths.monitoring_socket.clone().into_os_string(),
            paths.pid_file.clone().into_os_string(),
            OsString::from(&self.output),
            downstream,
            OsString::from(self.nb_thread.to_string()),
            OsString::from(self.cache_size.to_string()),
            OsString::from(self.threshold.to_string()),
        ]
    }
}

/// Filesystem paths of one generation of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPaths {
    /// Pid file written by the worker itself
    pub pid_file: PathBuf,

    /// Primary socket the worker serves on
    pub socket: PathBuf,

    /// Monitoring socket answering status probes
    pub monitoring_socket: PathBuf,

    /// Stable, tag-free symlink pointing at the live generation's socket
    pub published_socket: PathBuf,
}

impl WorkerPaths {
    /// Tagged files owned by this generation (the published symlink excluded).
    pub fn generation_files(&self) -> [&Path; 3] {
        [&self.pid_file, &self.socket, &self.monitoring_socket]
    }
}

/// Runtime directories holding pid files and sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    pub pid_dir: PathBuf,
    pub socket_dir: PathBuf,
}

impl RuntimeLayout {
    pub fn new(pid_dir: impl Into<PathBuf>, socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            pid_dir: pid_dir.into(),
            socket_dir: socket_dir.into(),
        }
    }

    /// Layout with `pids/` and `sockets/` under a single root.
    pub fn under(root: &Path) -> Self {
        Self::new(root.join("pids"), root.join("sockets"))
    }

    /// Creates both runtime directories.
    pub fn create_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.pid_dir)?;
        fs::create_dir_all(&self.socket_dir)
    }

    /// Stable socket path external clients use to reach a worker.
    pub fn published_socket(&self, name: &str) -> PathBuf {
        self.socket_dir.join(format!("{name}.sock"))
    }

    /// Derives every path of `name` for the given generation.
    pub fn paths_for(&self, name: &str, generation: Generation) -> WorkerPaths {
        let tag = generation.suffix();
        WorkerPaths {
            pid_file: self.pid_dir.join(format!("{name}_{tag}.pid")),
            socket: self.socket_dir.join(format!("{name}_{tag}.sock")),
            monitoring_socket: self.socket_dir.join(format!("{name}_mon_{tag}.sock")),
            published_socket: self.published_socket(name),
        }
    }
}
