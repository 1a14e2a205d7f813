//! Supervisor actor - owns the worker fleet and processes commands.
//!
//! The actor is the single owner of every `WorkerRecord` and of the
//! `ConfigStore`. Commands are handled one at a time, including the slow
//! ones (a blue/green update waits for every replacement to pass
//! readiness), so no two lifecycle operations ever overlap.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A failing worker never aborts an operation spanning the fleet
//! - Responder send failures are ignored (the caller went away)

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use sieve_core::{send_signal, ConfigStore, Generation, Signal, WorkerSpec};
use sieve_protocol::{unreachable_status, FilterError, MonitorReport};

use crate::monitor::ProcStatSampler;

use super::commands::{SupervisorCommand, SupervisorError, WorkerStatus};
use super::readiness::query_status;
use super::record::WorkerRecord;
use super::SupervisorTimings;

/// Error reported for an update naming a worker that is neither running
/// nor configured.
pub const FILTER_NOT_EXISTING: &str = "Filter not existing";

/// Filter name used when an update fails before any worker is touched.
pub const CONFIG_ERROR_FILTER: &str = "*";

/// The supervisor actor.
pub struct SupervisorActor {
    /// Command receiver
    receiver: mpsc::Receiver<SupervisorCommand>,

    /// Target configuration
    store: ConfigStore,

    /// Running fleet keyed by worker name
    workers: BTreeMap<String, WorkerRecord>,

    timings: SupervisorTimings,

    sampler: ProcStatSampler,
}

impl SupervisorActor {
    pub fn new(
        receiver: mpsc::Receiver<SupervisorCommand>,
        store: ConfigStore,
        timings: SupervisorTimings,
    ) -> Self {
        Self {
            receiver,
            store,
            workers: BTreeMap::new(),
            timings,
            sampler: ProcStatSampler::new(),
        }
    }

    /// Runs the actor until every handle is dropped.
    pub async fn run(mut self) {
        info!(configured = self.store.workers().len(), "Supervisor actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }

        info!(workers = self.workers.len(), "Supervisor actor stopped");
    }

    async fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::StartAll { respond_to } => {
                let result = self.start_all().await;
                let _ = respond_to.send(result);
            }
            SupervisorCommand::Update { names, respond_to } => {
                let result = self.update(names).await;
                let _ = respond_to.send(result);
            }
            SupervisorCommand::Heartbeat { respond_to } => {
                self.heartbeat_all().await;
                let _ = respond_to.send(());
            }
            SupervisorCommand::Monitor {
                proc_stats,
                respond_to,
            } => {
                let result = self.monitor_all(proc_stats).await;
                let _ = respond_to.send(result);
            }
            SupervisorCommand::RotateLogs { respond_to } => {
                self.rotate_logs_all();
                let _ = respond_to.send(());
            }
            SupervisorCommand::StopAll { respond_to } => {
                self.stop_all().await;
                let _ = respond_to.send(());
            }
            SupervisorCommand::CleanAll { respond_to } => {
                self.clean_all();
                let _ = respond_to.send(());
            }
            SupervisorCommand::ReportStats { respond_to } => {
                let _ = respond_to.send(self.store.report_stats().clone());
            }
            SupervisorCommand::Workers { respond_to } => {
                let summaries = self.workers.values().map(WorkerRecord::summary).collect();
                let _ = respond_to.send(summaries);
            }
        }
    }

    // ========================================================================
    // Fleet Operations
    // ========================================================================

    /// Starts every configured worker. A failing worker does not stop the
    /// others; it stays in the fleet as `dead`.
    async fn start_all(&mut self) -> Vec<FilterError> {
        let layout = self.store.layout().clone();
        let configured: Vec<(String, WorkerSpec, Generation)> = self
            .store
            .workers()
            .iter()
            .map(|(name, worker)| (name.clone(), worker.spec.clone(), worker.generation))
            .collect();

        let mut errors = Vec::new();
        for (name, spec, generation) in configured {
            if self.workers.contains_key(&name) {
                debug!(worker = %name, "Already supervised, skipping start");
                continue;
            }

            let mut record = WorkerRecord::new(spec, generation, &layout);
            record.clean();
            if let Err(e) = record.start(&layout, &self.timings).await {
                errors.push(FilterError::new(name.clone(), e.to_string()));
            }
            self.workers.insert(name, record);
        }

        info!(
            started = self.workers.len().saturating_sub(errors.len()),
            failed = errors.len(),
            "Fleet started"
        );
        errors
    }

    /// Blue/green reload of the named workers.
    async fn update(&mut self, requested: Vec<String>) -> Vec<FilterError> {
        if let Err(e) = self.store.reload() {
            error!(error = %e, "Update aborted: configuration rejected");
            return vec![FilterError::new(CONFIG_ERROR_FILTER, e.to_string())];
        }

        let targets: BTreeSet<String> = if requested.is_empty() {
            let running: BTreeSet<String> = self.workers.keys().cloned().collect();
            ConfigStore::diff(&running, &self.store.names())
        } else {
            requested.into_iter().collect()
        };

        info!(targets = ?targets, "Updating workers");

        let mut errors = Vec::new();
        for name in targets {
            let spec = self.store.worker(&name).map(|worker| worker.spec.clone());
            match spec {
                Some(spec) => {
                    if let Err(e) = self.replace_worker(spec).await {
                        errors.push(FilterError::new(name, e.to_string()));
                    }
                }
                None if self.workers.contains_key(&name) => self.remove_worker(&name).await,
                None => {
                    warn!(worker = %name, "Update requested for unknown worker");
                    errors.push(FilterError::new(name, FILTER_NOT_EXISTING));
                }
            }
        }
        errors
    }

    /// Starts the other generation of a worker and swaps it in once ready.
    ///
    /// Until the swap the previous instance keeps serving and stays
    /// authoritative; on failure it is left untouched.
    async fn replace_worker(&mut self, spec: WorkerSpec) -> Result<(), SupervisorError> {
        let name = spec.name.clone();
        let layout = self.store.layout().clone();

        let (generation, failures) = match self.workers.get(&name) {
            Some(current) => (current.generation.flip(), current.failures),
            None => (Generation::A, 0),
        };

        let mut candidate = WorkerRecord::new(spec, generation, &layout);
        candidate.failures = failures;
        candidate.clean();

        candidate.boot(&layout, &self.timings).await?;

        if let Err(e) = candidate.publish() {
            candidate.halt(&self.timings).await;
            candidate.clean();
            return Err(e);
        }
        candidate.status = WorkerStatus::Running;

        if let Some(mut previous) = self.workers.remove(&name) {
            info!(
                worker = %name,
                generation = %previous.generation,
                "Retiring previous generation"
            );
            previous.halt(&self.timings).await;
            previous.clean();
        }

        info!(
            worker = %name,
            generation = %candidate.generation,
            pid = ?candidate.pid(),
            "Worker replaced"
        );
        self.workers.insert(name, candidate);
        Ok(())
    }

    async fn remove_worker(&mut self, name: &str) {
        if let Some(mut record) = self.workers.remove(name) {
            info!(worker = %name, "Removing worker no longer configured");
            record.stop(&self.timings).await;
            record.clean();
        }
    }

    /// One liveness sweep. The first failing check marks the worker dead,
    /// bumps its failure counter and restarts it.
    async fn heartbeat_all(&mut self) {
        let layout = self.store.layout().clone();

        for record in self.workers.values_mut() {
            if record.status == WorkerStatus::Stopped {
                continue;
            }

            let Err(reason) = record.check_liveness() else {
                continue;
            };

            record.failures += 1;
            record.status = WorkerStatus::Dead;
            warn!(
                worker = %record.name(),
                failures = record.failures,
                %reason,
                "Heartbeat failed"
            );

            if let Err(e) = record.restart(&layout, &self.timings).await {
                error!(worker = %record.name(), error = %e, "Restart after heartbeat failure failed");
            }
        }
    }

    /// Gathers every worker's status document, merged with its failure
    /// counter and process stats. Unreachable workers report an error
    /// status instead.
    async fn monitor_all(&mut self, proc_stats: Option<Vec<String>>) -> MonitorReport {
        let fields = proc_stats.unwrap_or_else(|| self.store.report_stats().proc_stats.clone());
        if !fields.is_empty() {
            self.sampler.refresh();
        }

        let mut report = MonitorReport::new();
        for (name, record) in &self.workers {
            let status = match query_status(&record.paths.monitoring_socket, self.timings.probe_timeout).await {
                Ok(Value::Object(mut doc)) => {
                    doc.insert("failures".to_string(), json!(record.failures));
                    if !fields.is_empty() {
                        let stats = self.sampler.sample(record.pid(), name, &fields);
                        doc.insert("proc_stats".to_string(), Value::Object(stats));
                    }
                    Value::Object(doc)
                }
                Ok(other) => {
                    debug!(worker = %name, reply = %other, "Monitoring reply is not an object");
                    unreachable_status()
                }
                Err(e) => {
                    debug!(worker = %name, error = %e, "Monitoring socket unreachable");
                    unreachable_status()
                }
            };
            report.insert(name.clone(), status);
        }
        report
    }

    /// Sends SIGHUP to every worker so it reopens its log file.
    fn rotate_logs_all(&self) {
        for record in self.workers.values() {
            if record.status == WorkerStatus::Stopped {
                continue;
            }
            let Some(pid) = record.pid() else {
                warn!(worker = %record.name(), "No pid for log rotation");
                continue;
            };
            match send_signal(pid, Signal::Hangup) {
                Ok(()) => debug!(worker = %record.name(), pid, "Sent log rotation signal"),
                Err(e) => warn!(worker = %record.name(), pid, error = %e, "Log rotation signal failed"),
            }
        }
    }

    async fn stop_all(&mut self) {
        info!(workers = self.workers.len(), "Stopping all workers");
        for record in self.workers.values_mut() {
            record.stop(&self.timings).await;
        }
    }

    fn clean_all(&self) {
        for record in self.workers.values() {
            record.clean();
        }
    }
}
