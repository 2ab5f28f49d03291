//! Session orchestration
//!
//! Startup order is fixed: the engine is checked first, and only then is the
//! machine-wide lock taken. A session releases the lock when it ends.

use crate::codec::SecureCodec;
use anyhow::{Context, Result};
use strongbox_core::{Acquisition, LockError, LockManager};
use tracing::warn;

/// Outcome of starting up
pub enum Startup {
    /// This process holds the lock
    Ready(Session),
    /// Another live instance holds the lock
    AlreadyRunning { holder: u32 },
}

/// Check the engine, then take the lock
pub fn start(codec: &SecureCodec, locks: LockManager) -> Result<Startup> {
    codec
        .preflight()
        .context("could not check for the encryption engine")?;

    match locks.acquire().context("could not hold the process lock")? {
        Acquisition::Granted => Ok(Startup::Ready(Session {
            locks,
            released: false,
        })),
        Acquisition::Held { holder } => Ok(Startup::AlreadyRunning { holder }),
    }
}

/// Holds the vault lock until closed or dropped
pub struct Session {
    locks: LockManager,
    released: bool,
}

impl Session {
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Release the lock, reporting failure to the caller
    pub fn close(mut self) -> Result<(), LockError> {
        self.released = true;
        self.locks.release()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.locks.release() {
            warn!(
                path = %self.locks.path().display(),
                error = %e,
                "Could not release the process lock, remove it manually"
            );
        }
    }
}
