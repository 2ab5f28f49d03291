//! Process liveness probing
//!
//! Answers one question for the lock: does a PID still refer to a running
//! process? Probes never affect the target process.

use std::io;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Outcome of probing a process identifier
#[derive(Debug)]
pub enum Liveness {
    /// The process exists and could be signalled
    Alive,
    /// No process with this PID exists
    Dead,
    /// The process exists but belongs to another user
    PermissionDenied,
    /// The probe itself failed; the state is unknown
    Error(io::Error),
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Dead => "dead",
            Self::PermissionDenied => "permission-denied",
            Self::Error(_) => "error",
        }
    }
}

/// Capability to check whether a process is still running
pub trait ProcessLivenessChecker: Send + Sync {
    fn probe(&self, pid: u32) -> Liveness;
}

/// Probe by sending the null signal (`kill(pid, 0)`)
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

#[cfg(unix)]
impl ProcessLivenessChecker for SignalProbe {
    fn probe(&self, pid: u32) -> Liveness {
        // 0 and negative values address process groups, never a single process
        let target = match libc::pid_t::try_from(pid) {
            Ok(raw) if raw > 0 => raw,
            _ => {
                return Liveness::Error(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is not a valid process identifier", pid),
                ))
            }
        };

        // SAFETY: signal 0 performs only the existence and permission checks.
        let result = unsafe { libc::kill(target, 0) };
        if result == 0 {
            return Liveness::Alive;
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Liveness::Dead,
            Some(libc::EPERM) => Liveness::PermissionDenied,
            _ => Liveness::Error(err),
        }
    }
}

/// Probe by looking the PID up in the system process table
///
/// Works on every platform `sysinfo` supports. It cannot observe ownership,
/// so it never reports `PermissionDenied`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoProbe;

impl ProcessLivenessChecker for SysinfoProbe {
    fn probe(&self, pid: u32) -> Liveness {
        if pid == 0 {
            return Liveness::Error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "0 is not a valid process identifier",
            ));
        }

        let target = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

        if sys.process(target).is_some() {
            Liveness::Alive
        } else {
            Liveness::Dead
        }
    }
}

/// The preferred checker for this platform
pub fn default_checker() -> Box<dyn ProcessLivenessChecker> {
    #[cfg(unix)]
    {
        Box::new(SignalProbe)
    }
    #[cfg(not(unix))]
    {
        Box::new(SysinfoProbe)
    }
}
