//! sieve core - shared types for the worker supervisor
//!
//! This crate holds everything that does not need an async runtime:
//! - `worker` - worker definitions, generation tags and derived paths
//! - `config` - the fleet configuration store (schema v1/v2)
//! - `liveness` - pid, pid-file and endpoint probes
//! - `signal` - signals sent to worker processes
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod error;
pub mod liveness;
pub mod signal;
pub mod worker;

// Re-exports for convenience
pub use config::{
    parse_config, ConfigStore, ConfiguredWorker, FileReport, LoadedConfig, RedisEndpoint,
    RedisReport, ReportStats, SchemaVersion, DEFAULT_FILE_PERMISSIONS, DEFAULT_PROC_STATS,
    DEFAULT_REPORT_INTERVAL,
};
pub use error::{ConfigError, ConfigResult};
pub use liveness::{find_pids_by_cmdline, pid_alive, read_pid, Endpoint};
pub use signal::{send_signal, Signal};
pub use worker::{Generation, LogLevel, RuntimeLayout, WorkerPaths, WorkerSpec, NO_DOWNSTREAM};
