//! Process-resource sampling for worker status reports.
//!
//! Looks worker processes up in the OS process table and extracts the
//! fields requested by a `monitor` call or configured under
//! `report_stats.proc_stats`.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A process that cannot be found yields an empty field set

use serde_json::{json, Map, Value};
use sysinfo::{Pid, Process, System};
use tracing::debug;

/// Every field the sampler knows how to produce.
pub const PROC_STAT_FIELDS: [&str; 12] = [
    "pid",
    "name",
    "status",
    "cpu_percent",
    "memory_percent",
    "memory_rss",
    "memory_vms",
    "start_time",
    "run_time",
    "disk_read",
    "disk_written",
    "cmdline",
];

/// Samples resource usage of worker processes.
///
/// Uses the `sysinfo` crate. CPU usage is computed between two refreshes,
/// so the first sample after creation reports 0.
pub struct ProcStatSampler {
    system: System,
}

impl ProcStatSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Refreshes the process table.
    ///
    /// refresh_all() is required for CPU and memory percentages to be
    /// computed; refreshing single processes leaves them at zero.
    pub fn refresh(&mut self) {
        self.system.refresh_all();
    }

    /// Finds a worker's process by pid, falling back to a process whose
    /// command line carries the worker name as an argument.
    fn find(&self, pid: Option<u32>, worker: &str) -> Option<&Process> {
        if let Some(process) = pid.and_then(|pid| self.system.process(Pid::from_u32(pid))) {
            return Some(process);
        }
        self.system
            .processes()
            .values()
            .find(|process| process.cmd().iter().any(|arg| arg.to_string_lossy() == worker))
    }

    /// Extracts `fields` for a worker's process. Unknown fields are skipped.
    pub fn sample(&self, pid: Option<u32>, worker: &str, fields: &[String]) -> Map<String, Value> {
        let mut stats = Map::new();

        let Some(process) = self.find(pid, worker) else {
            debug!(worker, ?pid, "Worker process not found for stats");
            return stats;
        };

        for field in fields {
            match self.field(process, field) {
                Some(value) => {
                    stats.insert(field.clone(), value);
                }
                None => debug!(worker, field = %field, "Unknown process stat"),
            }
        }
        stats
    }

    fn field(&self, process: &Process, field: &str) -> Option<Value> {
        let value = match field {
            "pid" => json!(process.pid().as_u32()),
            "name" => json!(process.name().to_string_lossy()),
            "status" => json!(process.status().to_string()),
            "cpu_percent" => json!(process.cpu_usage()),
            "memory_percent" => {
                let total = self.system.total_memory();
                if total == 0 {
                    json!(0.0)
                } else {
                    json!(process.memory() as f64 * 100.0 / total as f64)
                }
            }
            "memory_rss" => json!(process.memory()),
            "memory_vms" => json!(process.virtual_memory()),
            "start_time" => json!(process.start_time()),
            "run_time" => json!(process.run_time()),
            "disk_read" => json!(process.disk_usage().total_read_bytes),
            "disk_written" => json!(process.disk_usage().total_written_bytes),
            "cmdline" => Value::Array(
                process
                    .cmd()
                    .iter()
                    .map(|arg| Value::String(arg.to_string_lossy().into_owned()))
                    .collect(),
            ),
            _ => return None,
        };
        Some(value)
    }
}

impl Default for ProcStatSampler {
    fn default() -> Self {
        Self::new()
    }
}
