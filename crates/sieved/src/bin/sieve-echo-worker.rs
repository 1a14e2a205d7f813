//! Reference worker for the sieve supervisor.
//!
//! Implements the worker process contract and nothing more: it echoes every
//! line received on its primary socket and answers status probes on its
//! monitoring socket. Used by the integration tests and as a template for
//! real workers.
//!
//! # Usage
//!
//! ```bash
//! sieve-echo-worker -l LEVEL NAME SOCKET CONFIG MONITORING PID_FILE \
//!     OUTPUT DOWNSTREAM NB_THREAD CACHE_SIZE THRESHOLD
//! ```
//!
//! Outside the DEVELOPER level the worker detaches (the launcher exits once
//! the daemon is forked). The config file is optional JSON; the only key it
//! reads is `ready` (default `true`). With `{"ready": false}` the worker
//! reports `starting` forever and never passes readiness.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sieve_core::LogLevel;
use sieve_protocol::FramedChannel;

/// sieve reference worker
#[derive(Parser, Debug)]
#[command(name = "sieve-echo-worker", version, about)]
struct Args {
    /// Log level; DEVELOPER keeps the worker in the foreground
    #[arg(short = 'l', default_value = "WARNING")]
    level: LogLevel,
    name: String,
    socket: PathBuf,
    config: PathBuf,
    monitoring_socket: PathBuf,
    pid_file: PathBuf,
    output: String,
    /// Downstream socket, or `no`
    downstream: String,
    nb_thread: u32,
    cache_size: u64,
    threshold: u64,
}

#[derive(Debug, Deserialize)]
struct WorkerConfig {
    #[serde(default = "ready_by_default")]
    ready: bool,
}

fn ready_by_default() -> bool {
    true
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { ready: true }
    }
}

impl WorkerConfig {
    /// Missing or unreadable config files mean defaults.
    fn load(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = WorkerConfig::load(&args.config);

    if !args.level.is_developer() {
        daemonize::Daemonize::new()
            .start()
            .context("Failed to daemonize")?;
    }

    run(args, config)
}

fn tracing_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Developer => "sieve_echo_worker=trace",
        LogLevel::Debug => "sieve_echo_worker=debug",
        LogLevel::Info | LogLevel::Notice => "sieve_echo_worker=info",
        LogLevel::Warning => "sieve_echo_worker=warn",
        LogLevel::Error | LogLevel::Critical => "sieve_echo_worker=error",
    }
}

#[tokio::main]
async fn run(args: Args, config: WorkerConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing_directive(args.level).parse()?),
        )
        .init();

    // Registered before the sockets exist, so readiness implies HUP is handled.
    let signals = Signals::register()?;
    let primary = bind(&args.socket)?;
    let monitoring = bind(&args.monitoring_socket)?;
    write_pid(&args.pid_file)?;

    info!(
        worker = %args.name,
        pid = process::id(),
        output = %args.output,
        downstream = %args.downstream,
        nb_thread = args.nb_thread,
        cache_size = args.cache_size,
        threshold = args.threshold,
        ready = config.ready,
        "Worker started"
    );

    let cancel_token = CancellationToken::new();
    let started = Instant::now();

    let echo = tokio::spawn(serve_primary(primary, cancel_token.clone()));
    let status = tokio::spawn(serve_monitoring(
        monitoring,
        args.name.clone(),
        config.ready,
        started,
        cancel_token.clone(),
    ));

    signals.wait().await;
    cancel_token.cancel();
    let _ = echo.await;
    let _ = status.await;

    for path in [&args.socket, &args.monitoring_socket, &args.pid_file] {
        let _ = fs::remove_file(path);
    }
    info!(worker = %args.name, "Worker stopped");
    Ok(())
}

fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("Failed to bind {}", path.display()))
}

fn write_pid(path: &Path) -> Result<()> {
    let mut file = fs::File::create(path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

async fn serve_primary(listener: UnixListener, cancel_token: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, _)) => {
                    tokio::spawn(echo_lines(stream));
                }
                Err(e) => warn!(error = %e, "Failed to accept on primary socket"),
            },
        }
    }
}

async fn echo_lines(stream: UnixStream) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        debug!(bytes = line.len(), "Echoing line");
        if writer.write_all(line.as_bytes()).await.is_err()
            || writer.write_all(b"\n").await.is_err()
        {
            break;
        }
    }
}

async fn serve_monitoring(
    listener: UnixListener,
    name: String,
    ready: bool,
    started: Instant,
    cancel_token: CancellationToken,
) {
    let state = if ready { "running" } else { "starting" };

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, _)) => {
                    let status = json!({
                        "status": state,
                        "name": name,
                        "pid": process::id(),
                        "uptime": started.elapsed().as_secs(),
                    });
                    let mut channel = FramedChannel::new(stream);
                    if let Err(e) = channel.send(&status).await {
                        debug!(error = %e, "Failed to answer status probe");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to accept on monitoring socket"),
            },
        }
    }
}

struct Signals {
    terminate: Signal,
    interrupt: Signal,
    hangup: Signal,
}

impl Signals {
    fn register() -> Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate()).context("Failed to handle SIGTERM")?,
            interrupt: signal(SignalKind::interrupt()).context("Failed to handle SIGINT")?,
            hangup: signal(SignalKind::hangup()).context("Failed to handle SIGHUP")?,
        })
    }

    /// Returns on TERM or INT. HUP only reopens logs, which go to stderr here.
    async fn wait(mut self) {
        loop {
            tokio::select! {
                _ = self.terminate.recv() => return,
                _ = self.interrupt.recv() => return,
                _ = self.hangup.recv() => info!("Received SIGHUP, nothing to reopen"),
            }
        }
    }
}
