//! Single-instance vault lock
//!
//! A lock record is a file containing exactly `"<pid>\n"`, created
//! exclusively at a well-known path. A record whose process no longer
//! exists is stray and gets reclaimed automatically.
//!
//! Known race: between probing a stray holder and deleting its record,
//! another instance may reclaim the record and acquire the lock itself. The
//! delete then removes that fresh record and both instances believe they
//! hold the lock. This is a best-effort guard for a single local user, not a
//! linearizable lock, and the window is accepted rather than closed.

use crate::process::{default_checker, Liveness, ProcessLivenessChecker};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound on stray records met in one `acquire` call, the last of
/// which is reported as contention instead of being reclaimed
pub const MAX_ACQUIRE_ATTEMPTS: usize = 2;

/// Lock-specific errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("could not create the lock file {path:?}")]
    CreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not read the lock file {path:?}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("could not check whether process {pid} from the lock file is running")]
    ProbeFailed {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("could not remove the stray lock file {path:?}")]
    ReclaimFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not delete the lock file {path:?}")]
    ReleaseFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("lock file {path:?} was still contended after {attempts} attempts")]
    Contended { path: PathBuf, attempts: usize },
}

/// Result of an `acquire` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// The lock record now names this process
    Granted,
    /// A live process holds the lock
    Held { holder: u32 },
}

impl Acquisition {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Acquires and releases the machine-wide vault lock
pub struct LockManager {
    path: PathBuf,
    pid: u32,
    checker: Box<dyn ProcessLivenessChecker>,
}

impl LockManager {
    /// Lock manager for the record at `path`, holding on behalf of this process
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pid: std::process::id(),
            checker: default_checker(),
        }
    }

    /// Replace the liveness checker
    pub fn with_checker(mut self, checker: Box<dyn ProcessLivenessChecker>) -> Self {
        self.checker = checker;
        self
    }

    /// Record `pid` as the holder instead of this process
    pub fn with_holder_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock, reclaiming a stray record if one is found
    pub fn acquire(&self) -> Result<Acquisition, LockError> {
        self.acquire_reading(Self::read_record)
    }

    /// Acquire loop with the record reader supplied by the caller.
    ///
    /// Only stray records count towards `MAX_ACQUIRE_ATTEMPTS`; a record that
    /// vanishes before it can be read just sends the loop round again.
    fn acquire_reading<F>(&self, mut read_record: F) -> Result<Acquisition, LockError>
    where
        F: FnMut(&Self) -> Result<Option<u32>, LockError>,
    {
        let mut strays = 0;
        loop {
            if self.try_create()? {
                info!(path = %self.path.display(), pid = self.pid, "Lock acquired");
                return Ok(Acquisition::Granted);
            }

            let holder = match read_record(self)? {
                Some(pid) => pid,
                None => {
                    debug!(path = %self.path.display(), "Lock file vanished before it could be read");
                    continue;
                }
            };

            let liveness = self.checker.probe(holder);
            debug!(holder, liveness = liveness.as_str(), "Probed lock holder");
            match liveness {
                Liveness::Alive => return Ok(Acquisition::Held { holder }),
                // Can't prove the holder is gone, so leave it alone
                Liveness::PermissionDenied => return Ok(Acquisition::Held { holder }),
                Liveness::Error(source) => {
                    return Err(LockError::ProbeFailed {
                        pid: holder,
                        source,
                    })
                }
                Liveness::Dead => {
                    strays += 1;
                    if strays >= MAX_ACQUIRE_ATTEMPTS {
                        return Err(LockError::Contended {
                            path: self.path.clone(),
                            attempts: MAX_ACQUIRE_ATTEMPTS,
                        });
                    }
                    warn!(path = %self.path.display(), holder, "Reclaiming stray lock");
                    remove_if_exists(&self.path).map_err(|source| LockError::ReclaimFailed {
                        path: self.path.clone(),
                        source,
                    })?;
                }
            }
        }
    }

    /// Delete the lock record. Releasing an absent lock succeeds.
    pub fn release(&self) -> Result<(), LockError> {
        let removed = remove_if_exists(&self.path).map_err(|source| LockError::ReleaseFailed {
            path: self.path.clone(),
            source,
        })?;
        if removed {
            info!(path = %self.path.display(), "Lock released");
        }
        Ok(())
    }

    /// PID named by the current lock record, if any
    pub fn holder(&self) -> Result<Option<u32>, LockError> {
        self.read_record()
    }

    /// Returns false when a record already exists
    fn try_create(&self) -> Result<bool, LockError> {
        let file = match open_exclusive(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(source) => {
                return Err(LockError::CreationFailed {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if let Err(source) = write_record(file, self.pid) {
            // A half-written record would read as unparseable forever
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Could not remove a partially written lock file, remove it manually"
                );
            }
            return Err(LockError::CreationFailed {
                path: self.path.clone(),
                source,
            });
        }

        Ok(true)
    }

    /// Returns None when the record disappeared before it could be opened
    fn read_record(&self) -> Result<Option<u32>, LockError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.unreadable(format!("could not open: {}", e))),
        };

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|e| self.unreadable(format!("could not read: {}", e)))?;

        parse_record(&contents).map(Some).map_err(|reason| self.unreadable(reason))
    }

    fn unreadable(&self, reason: String) -> LockError {
        LockError::Unreadable {
            path: self.path.clone(),
            reason,
        }
    }
}

fn open_exclusive(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn write_record(mut file: File, pid: u32) -> io::Result<()> {
    file.write_all(format!("{}\n", pid).as_bytes())?;
    file.sync_all()
}

/// Parse `"<digits>\n"` into a process identifier
fn parse_record(contents: &[u8]) -> Result<u32, String> {
    let text = std::str::from_utf8(contents).map_err(|_| "content is not UTF-8".to_string())?;

    let parts: Vec<&str> = text.split('\n').collect();
    if parts.len() != 2 || !parts[1].is_empty() {
        return Err("expected a single line ending with a newline".to_string());
    }

    let digits = parts[0];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid PID {:?}", digits));
    }

    let pid: u32 = digits
        .parse()
        .map_err(|e| format!("invalid PID {:?}: {}", digits, e))?;
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(format!("PID {} is out of range", pid));
    }

    Ok(pid)
}

/// Returns whether a file was actually removed
fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
