//! sieve protocol - control channel between operators and the supervisor
//!
//! This crate provides:
//! - `framing` - brace-delimited JSON documents over a stream socket
//! - `message` - control requests and responses
//! - `client` - a client for the supervisor's control socket
//!
//! The same framing is used by the supervisor to talk to each worker's
//! monitoring socket.

pub mod client;
pub mod framing;
pub mod message;

pub use client::{ControlClient, DEFAULT_RESPONSE_TIMEOUT, DEFAULT_SOCKET_PATH};
pub use framing::{FramedChannel, FramingError, DEFAULT_RECEIVE_TIMEOUT, MAX_MESSAGE_SIZE};
pub use message::{
    empty_response, unreachable_status, ControlRequest, FilterError, MonitorReport,
    UpdateResponse,
};
