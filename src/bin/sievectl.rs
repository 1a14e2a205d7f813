//! sievectl - operator client for the sieve supervisor
//!
//! Sends one control request over the supervisor's socket and prints the
//! JSON answer.
//!
//! # Usage
//!
//! ```text
//! sievectl update              # replace every added or removed worker
//! sievectl update w1 w2        # blue/green restart of w1 and w2
//! sievectl monitor             # status of every worker
//! sievectl monitor --proc-stats pid --proc-stats memory_rss
//! SIEVE_SOCKET=/run/sieve.sock sievectl monitor
//! ```
//!
//! Exits non-zero when the supervisor cannot be reached or an update
//! reports errors.

use std::env;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use sieve_protocol::{ControlClient, DEFAULT_RESPONSE_TIMEOUT, DEFAULT_SOCKET_PATH};

// ============================================================================
// CLI Arguments
// ============================================================================

/// sievectl - control a running sieve supervisor
#[derive(Parser, Debug)]
#[command(name = "sievectl", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Control socket path [env: SIEVE_SOCKET]
    #[arg(long, short = 's', global = true)]
    socket: Option<PathBuf>,

    /// Seconds to wait for the answer
    #[arg(long, short = 't', global = true, default_value_t = DEFAULT_RESPONSE_TIMEOUT.as_secs())]
    timeout: u64,

    /// Print compact JSON instead of pretty-printed
    #[arg(long, global = true)]
    compact: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reload the configuration and replace workers
    Update {
        /// Workers to replace; none means every added or removed worker
        names: Vec<String>,
    },
    /// Collect the status of every worker
    Monitor {
        /// Process fields to sample instead of the configured ones
        #[arg(long = "proc-stats", value_name = "FIELD")]
        proc_stats: Vec<String>,
    },
}

fn socket_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| env::var_os("SIEVE_SOCKET").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

fn print(doc: &Value, compact: bool) -> Result<()> {
    let text = if compact {
        serde_json::to_string(doc)?
    } else {
        serde_json::to_string_pretty(doc)?
    };
    println!("{text}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("sievectl=warn".parse()?))
        .init();

    let args = Args::parse();
    let client = ControlClient::new(socket_path(args.socket))
        .with_timeout(Duration::from_secs(args.timeout));
    debug!(socket = %client.socket_path().display(), "Connecting to supervisor");

    match args.command {
        Command::Update { names } => {
            let response = client
                .update_filters(names)
                .await
                .with_context(|| format!("update via {}", client.socket_path().display()))?;
            print(&serde_json::to_value(&response)?, args.compact)?;
            if !response.is_ok() {
                process::exit(1);
            }
        }
        Command::Monitor { proc_stats } => {
            let proc_stats = (!proc_stats.is_empty()).then_some(proc_stats);
            let report = client
                .monitor(proc_stats)
                .await
                .with_context(|| format!("monitor via {}", client.socket_path().display()))?;
            print(&Value::Object(report), args.compact)?;
        }
    }

    Ok(())
}
