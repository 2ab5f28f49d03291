//! SecureCodec - encrypt to and decrypt from a vault file via the engine
//!
//! The engine reads the passphrase as the first line of its standard input.
//! When encrypting, the rest of standard input is the plaintext; when
//! decrypting, standard output is the plaintext. Secret material only ever
//! travels through pipes, never through a temporary file.

use crate::channel::{retry_exec_busy, EngineChannel, EngineCommand, Exited, InputOpen};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Default engine executable
pub const DEFAULT_ENGINE: &str = "gpg";

/// Flags shared by every engine invocation: batch mode, overwrite allowed,
/// passphrase read from file descriptor 0
const COMMON_ARGS: [&str; 5] = [
    "--batch",
    "--yes",
    "--quiet",
    "--pinentry-mode=loopback",
    "--passphrase-fd=0",
];

/// Codec-specific errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encryption engine {engine:?} is not available")]
    EngineUnavailable {
        engine: String,
        #[source]
        source: io::Error,
    },

    #[error("could not {stage}")]
    SubprocessIo {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("encryption engine reported failure ({status}): {stderr}")]
    EncryptionFailed { status: ExitStatus, stderr: String },

    #[error("decryption failed, the passphrase is wrong or the vault is damaged ({status}): {stderr}")]
    DecryptionFailed { status: ExitStatus, stderr: String },

    #[error("invalid passphrase: {0}")]
    InvalidPassphrase(&'static str),
}

impl CodecError {
    /// Whether re-entering the passphrase could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DecryptionFailed { .. })
    }
}

fn io_stage(stage: &'static str) -> impl FnOnce(io::Error) -> CodecError {
    move |source| CodecError::SubprocessIo { stage, source }
}

/// A passphrase held in memory only, wiped on drop
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(Zeroizing<Vec<u8>>);

impl Passphrase {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The passphrase travels as a single line, so it can't contain one
    fn check(&self) -> Result<(), CodecError> {
        if self.0.contains(&b'\n') {
            return Err(CodecError::InvalidPassphrase("must not contain a newline"));
        }
        Ok(())
    }
}

impl From<String> for Passphrase {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl From<&str> for Passphrase {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Drives the external encryption engine
#[derive(Debug, Clone)]
pub struct SecureCodec {
    engine: String,
}

impl Default for SecureCodec {
    fn default() -> Self {
        Self::new(DEFAULT_ENGINE)
    }
}

impl SecureCodec {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Check that the engine is installed and runs
    pub fn preflight(&self) -> Result<(), CodecError> {
        let unavailable = |source| CodecError::EngineUnavailable {
            engine: self.engine.clone(),
            source,
        };

        let status = retry_exec_busy(|| {
            Command::new(&self.engine)
                .arg("--version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
        })
        .map_err(unavailable)?;

        if !status.success() {
            return Err(unavailable(io::Error::other(format!(
                "`{} --version` exited with {}",
                self.engine, status
            ))));
        }

        debug!(engine = %self.engine, "Encryption engine available");
        Ok(())
    }

    /// Encrypt `plaintext` into `output`
    ///
    /// The engine writes to a sibling file which replaces `output` only once
    /// the engine has succeeded, so a failed call leaves any existing vault
    /// as it was. An existing vault keeps its permissions.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        passphrase: &Passphrase,
        output: &Path,
    ) -> Result<(), CodecError> {
        passphrase.check()?;

        let staging = staging_path(output);
        let result = self
            .encrypt_into(plaintext, passphrase, &staging)
            .and_then(|()| keep_permissions(output, &staging))
            .and_then(|()| {
                fs::rename(&staging, output)
                    .map_err(io_stage("move the encrypted vault into place"))
            });
        if result.is_err() {
            let _ = fs::remove_file(&staging);
            return result;
        }

        info!(path = %output.display(), engine = %self.engine(), "Vault encrypted");
        Ok(())
    }

    fn encrypt_into(
        &self,
        plaintext: &[u8],
        passphrase: &Passphrase,
        output: &Path,
    ) -> Result<(), CodecError> {
        let mut channel = EngineCommand::new(&self.engine)
            .args(COMMON_ARGS)
            .args(["--symmetric", "--armor", "--output"])
            .path_arg(output)
            .start()
            .map_err(io_stage("start the encryption engine"))?;

        // One contiguous write: the passphrase line, then the payload
        let mut input = Zeroizing::new(Vec::with_capacity(
            passphrase.as_bytes().len() + 1 + plaintext.len(),
        ));
        input.extend_from_slice(passphrase.as_bytes());
        input.push(b'\n');
        input.extend_from_slice(plaintext);

        let broken = feed(&mut channel, &input, ENCRYPT_STAGES.write)?;
        let exited = finish(channel, &ENCRYPT_STAGES)?;

        if !exited.status.success() {
            return Err(CodecError::EncryptionFailed {
                status: exited.status,
                stderr: exited.stderr,
            });
        }
        if let Some(source) = broken {
            return Err(CodecError::SubprocessIo {
                stage: ENCRYPT_STAGES.write,
                source,
            });
        }
        Ok(())
    }

    /// Decrypt the vault at `input`
    pub fn decrypt(
        &self,
        input: &Path,
        passphrase: &Passphrase,
    ) -> Result<Zeroizing<Vec<u8>>, CodecError> {
        passphrase.check()?;

        let mut channel = EngineCommand::new(&self.engine)
            .args(COMMON_ARGS)
            .arg("--decrypt")
            .path_arg(input)
            .capture_output()
            .start()
            .map_err(io_stage("start the decryption engine"))?;

        let mut line = Zeroizing::new(Vec::with_capacity(passphrase.as_bytes().len() + 1));
        line.extend_from_slice(passphrase.as_bytes());
        line.push(b'\n');

        let broken = feed(&mut channel, &line, DECRYPT_STAGES.write)?;
        let exited = finish(channel, &DECRYPT_STAGES)?;

        if !exited.status.success() {
            return Err(CodecError::DecryptionFailed {
                status: exited.status,
                stderr: exited.stderr,
            });
        }
        if let Some(source) = broken {
            return Err(CodecError::SubprocessIo {
                stage: DECRYPT_STAGES.write,
                source,
            });
        }

        debug!(path = %input.display(), engine = %self.engine(), bytes = exited.output.len(), "Vault decrypted");
        Ok(exited.output)
    }
}

/// Error stages for the tail of one invocation
struct Stages {
    write: &'static str,
    close: &'static str,
    read: &'static str,
    wait: &'static str,
}

const ENCRYPT_STAGES: Stages = Stages {
    write: "write into the encryption engine's input",
    close: "close the pipe to the encryption engine's input",
    read: "read from the encryption engine's output",
    wait: "wait for the encryption engine",
};

const DECRYPT_STAGES: Stages = Stages {
    write: "write into the decryption engine's input",
    close: "close the pipe to the decryption engine's input",
    read: "read from the decryption engine's output",
    wait: "wait for the decryption engine",
};

/// Write the engine's input. An engine that exits early closes its end of
/// the pipe; that error is handed back so its exit status can be reported
/// first.
fn feed(
    channel: &mut EngineChannel<InputOpen>,
    bytes: &[u8],
    stage: &'static str,
) -> Result<Option<io::Error>, CodecError> {
    match channel.write_input(bytes) {
        Ok(()) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("Engine closed its input early");
            Ok(Some(e))
        }
        Err(e) => Err(io_stage(stage)(e)),
    }
}

/// Close input, drain output, then reap the engine
fn finish(channel: EngineChannel<InputOpen>, stages: &Stages) -> Result<Exited, CodecError> {
    channel
        .close_input()
        .map_err(io_stage(stages.close))?
        .drain_output()
        .map_err(io_stage(stages.read))?
        .wait()
        .map_err(io_stage(stages.wait))
}

/// Give `staging` the permissions of the vault it is about to replace
fn keep_permissions(output: &Path, staging: &Path) -> Result<(), CodecError> {
    let permissions = match fs::metadata(output) {
        Ok(metadata) => metadata.permissions(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_stage("read the permissions of the existing vault")(e)),
    };
    fs::set_permissions(staging, permissions)
        .map_err(io_stage("copy the vault permissions onto the new vault"))
}

/// Sibling path the engine writes to before the result replaces `output`
fn staging_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vault".to_string());
    output.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}
