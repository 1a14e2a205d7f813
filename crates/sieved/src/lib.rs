//! sieve daemon - worker fleet supervisor
//!
//! This crate provides the daemon's moving parts:
//! - `supervisor` - actor owning every worker record and the configuration
//! - `server` - Unix socket control server (`update_filters`, `monitor`)
//! - `telemetry` - periodic delivery of status reports to redis and/or a file
//! - `monitor` - process-resource sampling for status reports
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        sieved daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  ControlServer  │────▶│      SupervisorActor        │    │
//! │  │  (Unix Socket)  │     │  (fleet + config owner)     │    │
//! │  └────────┬────────┘     └──────────────┬──────────────┘    │
//! │           │                  ▲     ▲    │                   │
//! │           │ connections      │     │    │ spawn / probe     │
//! │           ▼                  │     │    ▼                   │
//! │  ┌─────────────────┐  ┌──────┴──┐ ┌┴────────────┐           │
//! │  │ConnectionHandler│  │heartbeat│ │  telemetry  │           │
//! │  │ (per request)   │  │  task   │ │    task     │           │
//! │  └─────────────────┘  └─────────┘ └─────────────┘           │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod monitor;
pub mod server;
pub mod supervisor;
pub mod telemetry;
