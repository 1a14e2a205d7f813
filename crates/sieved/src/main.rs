//! sieve daemon - worker fleet supervisor
//!
//! Starts every configured worker, keeps them alive, serves the control
//! socket and delivers periodic telemetry.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! sieved start --config /etc/sieve/workers.json
//!
//! # Start the daemon (background/daemonized)
//! sieved start -d
//!
//! # Stop the daemon
//! sieved stop
//!
//! # Check daemon status
//! sieved status
//!
//! # Custom control socket and runtime directory
//! SIEVE_SOCKET=/run/sieve.sock SIEVE_RUN_DIR=/run/sieve sieved start
//!
//! # Enable debug logging
//! RUST_LOG=sieved=debug sieved start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown (workers are stopped and cleaned)
//! - SIGHUP: Forwarded to every worker so they reopen their logs

use std::env;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sieve_core::{pid_alive, read_pid, send_signal, ConfigStore, RuntimeLayout, Signal};
use sieved::server::{ControlServer, DEFAULT_SOCKET_PATH};
use sieved::supervisor::{
    spawn_heartbeat_task, spawn_supervisor, SupervisorHandle, SupervisorTimings,
};
use sieved::telemetry::{spawn_telemetry_task, TelemetryHandle};

/// Default fleet configuration file
const DEFAULT_CONFIG_PATH: &str = "/etc/sieve/workers.json";

/// Default runtime directory holding `pids/` and `sockets/`
const DEFAULT_RUN_DIR: &str = "/var/run/sieve";

/// How long background tasks get to finish once shutdown starts
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between stopping workers and removing their files
const CLEAN_DELAY: Duration = Duration::from_millis(500);

/// sieve daemon - worker fleet supervisor
#[derive(Parser, Debug)]
#[command(name = "sieved", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start(StartArgs),
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

#[derive(clap::Args, Debug, Default)]
struct StartArgs {
    /// Run as a background daemon (fork to background)
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Fleet configuration file [env: SIEVE_CONFIG]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control socket path [env: SIEVE_SOCKET]
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Runtime directory for worker pid files and sockets [env: SIEVE_RUN_DIR]
    #[arg(long)]
    run_dir: Option<PathBuf>,
}

/// Resolved daemon settings.
#[derive(Debug)]
struct Settings {
    config_path: PathBuf,
    socket_path: PathBuf,
    layout: RuntimeLayout,
}

impl Settings {
    /// Flag, then environment variable, then built-in default.
    fn resolve(args: StartArgs) -> Self {
        let pick = |flag: Option<PathBuf>, var: &str, default: &str| {
            flag.or_else(|| env::var_os(var).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(default))
        };

        let run_dir = pick(args.run_dir, "SIEVE_RUN_DIR", DEFAULT_RUN_DIR);
        Self {
            config_path: pick(args.config, "SIEVE_CONFIG", DEFAULT_CONFIG_PATH),
            socket_path: pick(args.socket, "SIEVE_SOCKET", DEFAULT_SOCKET_PATH),
            layout: RuntimeLayout::under(&run_dir),
        }
    }
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("sieve")
}

/// Returns the path to the PID file.
fn pid_file_path() -> PathBuf {
    state_dir().join("sieved.pid")
}

/// Returns the path to the log file.
fn log_file_path() -> PathBuf {
    state_dir().join("sieved.log")
}

/// Writes the current PID to the PID file.
fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

/// Removes the PID file.
fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Checks if the daemon is already running.
fn is_daemon_running() -> Option<u32> {
    let pid = read_pid(&pid_file_path())?;
    if pid_alive(pid) {
        return Some(pid);
    }
    // Stale PID file
    remove_pid_file();
    None
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args
        .command
        .unwrap_or_else(|| Command::Start(StartArgs::default()));

    match command {
        Command::Start(start) => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'sieved stop' to stop it first.");
                process::exit(1);
            }

            let daemon = start.daemon;
            let settings = Settings::resolve(start);

            if daemon {
                // Daemonize before starting tokio runtime
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(settings);
            remove_pid_file();

            result
        }
        Command::Stop => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                return Ok(());
            };

            println!("Stopping daemon (PID {pid})...");
            if let Err(e) = send_signal(pid, Signal::Terminate) {
                bail!("Failed to send SIGTERM to process {pid}: {e}");
            }

            // Stopping the fleet can take a while: every worker gets its own
            // termination window.
            for _ in 0..300 {
                if !pid_alive(pid) {
                    println!("Daemon stopped.");
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(100));
            }

            eprintln!("Daemon did not stop within 30 seconds.");
            process::exit(1);
        }
        Command::Status => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                process::exit(1);
            };

            println!("Daemon is running (PID {pid})");
            let socket_path =
                env::var("SIEVE_SOCKET").unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string());
            if Path::new(&socket_path).exists() {
                println!("Socket: {socket_path}");
            }
            Ok(())
        }
    }
}

/// Daemonizes the current process.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::options()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to open log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(settings: Settings) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("sieved=info".parse()?)
                .add_directive("sieve_core=info".parse()?)
                .add_directive("sieve_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        config = %settings.config_path.display(),
        "sieve daemon starting"
    );

    // Without the runtime directories there is no fleet to supervise.
    settings.layout.create_dirs().with_context(|| {
        format!(
            "Failed to create runtime directories {} and {}",
            settings.layout.pid_dir.display(),
            settings.layout.socket_dir.display()
        )
    })?;

    let mut store = ConfigStore::new(&settings.config_path, settings.layout.clone());
    store
        .load(&settings.config_path)
        .context("Failed to load fleet configuration")?;

    let telemetry = TelemetryHandle::new();
    telemetry.apply(store.report_stats()).await;

    let cancel_token = CancellationToken::new();
    let supervisor = spawn_supervisor(store, SupervisorTimings::default());

    spawn_signal_task(supervisor.clone(), cancel_token.clone());

    let server = ControlServer::new(
        &settings.socket_path,
        supervisor.clone(),
        telemetry.clone(),
        cancel_token.clone(),
    );
    let listener = server.bind()?;

    let failed = supervisor.start_all().await?;
    for failure in &failed {
        warn!(worker = %failure.filter, error = %failure.error, "Worker failed to start");
    }

    let heartbeat = spawn_heartbeat_task(supervisor.clone(), cancel_token.clone());
    let telemetry_task =
        spawn_telemetry_task(supervisor.clone(), telemetry, cancel_token.clone());
    info!("Heartbeat and telemetry tasks started");

    server.serve(listener).await;

    shutdown(supervisor, [heartbeat, telemetry_task]).await;

    info!("sieve daemon stopped");
    Ok(())
}

/// Stops every worker once the background loops have drained.
async fn shutdown<const N: usize>(
    supervisor: SupervisorHandle,
    tasks: [tokio::task::JoinHandle<()>; N],
) {
    for task in tasks {
        if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }

    if let Err(e) = supervisor.stop_all().await {
        error!(error = %e, "Failed to stop workers");
    }

    tokio::time::sleep(CLEAN_DELAY).await;

    if let Err(e) = supervisor.clean_all().await {
        error!(error = %e, "Failed to clean worker files");
    }
}

/// Spawns the signal task: TERM/INT trigger shutdown, HUP is forwarded to
/// every worker.
fn spawn_signal_task(supervisor: SupervisorHandle, cancel_token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signals(&supervisor, &cancel_token).await {
            error!(error = %e, "Error waiting for signals");
        }
        cancel_token.cancel();
    });
}

async fn wait_for_signals(
    supervisor: &SupervisorHandle,
    cancel_token: &CancellationToken,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => return Ok(()),
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, rotating worker logs");
                if supervisor.rotate_logs().await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
