//! Strongbox Core - Shared functionality for the Strongbox vault
//!
//! Runtime paths, configuration, process liveness probing and the
//! machine-wide lock that keeps two instances off the same vault.

pub mod config;
pub mod lock;
pub mod paths;
pub mod process;

pub use config::Config;
pub use lock::{Acquisition, LockError, LockManager};
pub use paths::Paths;
pub use process::{Liveness, ProcessLivenessChecker};
