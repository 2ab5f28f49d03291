//! Strongbox configuration management
//!
//! Configuration file:
//! - ~/.config/strongbox/config.yaml
//!
//! Environment overrides (applied on top of the file):
//! - STRONGBOX_ENGINE   - encryption engine executable
//! - STRONGBOX_LOCK_DIR - directory holding the lock record

use crate::paths::Paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENGINE_ENV_VAR: &str = "STRONGBOX_ENGINE";
pub const LOCK_DIR_ENV_VAR: &str = "STRONGBOX_LOCK_DIR";

const DEFAULT_ENGINE: &str = "gpg";
const DEFAULT_DECRYPT_ATTEMPTS: u32 = 3;

/// Global Strongbox configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Executable of the external encryption engine
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Directory for the lock record (system temp dir when unset)
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,

    /// How many times a wrong passphrase may be re-entered
    #[serde(default = "default_decrypt_attempts")]
    pub decrypt_attempts: u32,
}

fn default_engine() -> String {
    DEFAULT_ENGINE.to_string()
}

fn default_decrypt_attempts() -> u32 {
    DEFAULT_DECRYPT_ATTEMPTS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            lock_dir: None,
            decrypt_attempts: default_decrypt_attempts(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, then apply environment overrides
    pub fn load() -> Result<Self> {
        let paths = Paths::new();
        let config = Self::load_from(&paths.config_file())?;
        Ok(config.with_overrides(|key| std::env::var(key).ok()))
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {:?}", path))?;
        Ok(config)
    }

    /// Apply overrides looked up by environment variable name
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(engine) = lookup(ENGINE_ENV_VAR).filter(|v| !v.trim().is_empty()) {
            self.engine = engine;
        }
        if let Some(dir) = lookup(LOCK_DIR_ENV_VAR).filter(|v| !v.trim().is_empty()) {
            self.lock_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// Resolve the runtime paths this configuration points at
    pub fn paths(&self) -> Paths {
        let paths = Paths::new();
        match &self.lock_dir {
            Some(dir) => paths.with_runtime(dir),
            None => paths,
        }
    }

    /// Path of the lock record
    pub fn lock_file(&self) -> PathBuf {
        self.paths().lock_file()
    }
}
