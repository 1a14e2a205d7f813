//! Stateless liveness probes.
//!
//! None of these functions return errors: a probe either succeeds or it
//! does not, and the caller decides what a failed probe means.

use std::fmt;
use std::fs;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::signal::{send_signal, Signal};

/// Connect timeout used when probing TCP endpoints.
pub const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Returns true unless the OS reports that `pid` does not exist or the
/// process has already exited and waits to be reaped.
///
/// A process owned by another user answers the probe with `EPERM`,
/// which still means it is alive.
pub fn pid_alive(pid: u32) -> bool {
    let exists = match send_signal(pid, Signal::Probe) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => false,
        Err(e) => e.raw_os_error() != Some(libc::ESRCH),
    };
    exists && !is_zombie(pid)
}

/// Exited but not yet reaped; such a process still answers signal 0.
fn is_zombie(pid: u32) -> bool {
    i32::try_from(pid)
        .ok()
        .and_then(|pid| procfs::process::Process::new(pid).ok())
        .and_then(|process| process.stat().ok())
        .map(|stat| stat.state == 'Z')
        .unwrap_or(false)
}

/// Reads a pid file. Any I/O or parse failure yields `None`.
pub fn read_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

/// Something a worker listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix-domain socket path
    Unix(PathBuf),
    /// `host:port`, IPv6 literals bracketed
    Tcp(String),
    /// `host:port`; connectionless, cannot be probed
    Udp(String),
}

impl Endpoint {
    /// Returns whether the endpoint can currently be reached.
    pub fn reachable(&self) -> bool {
        match self {
            Self::Unix(path) => path.exists(),
            Self::Tcp(address) => tcp_connectable(address, TCP_PROBE_TIMEOUT),
            Self::Udp(_) => true,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(address) => write!(f, "tcp:{address}"),
            Self::Udp(address) => write!(f, "udp:{address}"),
        }
    }
}

fn tcp_connectable(address: &str, timeout: Duration) -> bool {
    let addrs = match address.to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!(address, error = %e, "Could not resolve endpoint");
            return false;
        }
    };

    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}

/// Scans the process table for processes whose command line contains
/// `needle`. The calling process is never returned.
///
/// Best effort: processes that vanish or cannot be read mid-scan are skipped.
pub fn find_pids_by_cmdline(needle: &str) -> Vec<u32> {
    let own_pid = std::process::id();

    let processes = match procfs::process::all_processes() {
        Ok(processes) => processes,
        Err(e) => {
            debug!(error = %e, "Process table scan unavailable");
            return Vec::new();
        }
    };

    processes
        .filter_map(Result::ok)
        .filter_map(|process| {
            let pid = u32::try_from(process.pid()).ok()?;
            if pid == own_pid {
                return None;
            }
            let cmdline = process.cmdline().ok()?;
            cmdline
                .iter()
                .any(|arg| arg.contains(needle))
                .then_some(pid)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_pid_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }

    #[test]
    fn test_exited_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!pid_alive(pid));
    }

    #[test]
    fn test_unreaped_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();

        let mut zombie = false;
        for _ in 0..100 {
            if is_zombie(pid) {
                zombie = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(zombie, "child never exited");
        assert!(!pid_alive(pid));

        child.wait().unwrap();
    }

    #[test]
    fn test_read_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.pid");

        assert_eq!(read_pid(&path), None);

        fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid(&path), Some(4242));

        fs::write(&path, "not a pid").unwrap();
        assert_eq!(read_pid(&path), None);

        fs::write(&path, "").unwrap();
        assert_eq!(read_pid(&path), None);
    }

    #[test]
    fn test_unix_endpoint_is_path_existence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.sock");
        assert!(!Endpoint::Unix(path.clone()).reachable());

        fs::write(&path, "").unwrap();
        assert!(Endpoint::Unix(path).reachable());
    }

    #[test]
    fn test_tcp_endpoint_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        assert!(Endpoint::Tcp(address.clone()).reachable());

        drop(listener);
        assert!(!Endpoint::Tcp(address).reachable());
        assert!(!Endpoint::Tcp("not an address".to_string()).reachable());
    }

    #[test]
    fn test_udp_endpoint_is_always_reachable() {
        assert!(Endpoint::Udp("[::1]:9".to_string()).reachable());
    }

    #[test]
    fn test_cmdline_scan_finds_child() {
        let marker = format!("sieve-scan-marker-{}", std::process::id());
        let mut child = std::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 5; true")
            .arg(&marker)
            .spawn()
            .unwrap();

        let found = find_pids_by_cmdline(&marker);
        child.kill().unwrap();
        child.wait().unwrap();

        assert_eq!(found, vec![child.id()]);
    }
}
