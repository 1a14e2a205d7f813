//! Signals sent to worker processes.

use std::io;

/// Signals the supervisor sends to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Signal 0: existence and permission check only
    Probe,
    /// SIGTERM: orderly shutdown
    Terminate,
    /// SIGKILL: forceful stop after the grace period
    Kill,
    /// SIGHUP: reopen log files
    Hangup,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Self::Probe => 0,
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Hangup => libc::SIGHUP,
        }
    }
}

/// Sends `signal` to `pid`.
///
/// Pids that do not fit a `pid_t` or that would address a process group
/// (0 and below) are rejected with `InvalidInput` instead of being sent.
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let raw_pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}")))?;

    // SAFETY: kill(2) has no memory-safety preconditions; the pid is a
    // positive value so it never targets a process group.
    let rc = unsafe { libc::kill(raw_pid, signal.as_raw()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
