//! Standard paths used by Strongbox

use std::path::{Path, PathBuf};

/// File name of the single-instance lock record
pub const LOCK_FILE_NAME: &str = "strongbox.lock";

/// Standard Strongbox paths
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory (~/.config/strongbox)
    pub config: PathBuf,
    /// Directory holding the lock record (system temp dir unless overridden)
    pub runtime: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("strongbox");

        Self {
            config,
            runtime: std::env::temp_dir(),
        }
    }

    /// Same layout, with the lock record kept under `dir`
    pub fn with_runtime(mut self, dir: impl AsRef<Path>) -> Self {
        self.runtime = dir.as_ref().to_path_buf();
        self
    }

    /// Path of the YAML configuration file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.yaml")
    }

    /// Path of the machine-wide lock record
    pub fn lock_file(&self) -> PathBuf {
        self.runtime.join(LOCK_FILE_NAME)
    }
}
