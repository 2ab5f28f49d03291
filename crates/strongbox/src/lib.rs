//! Strongbox - a local secrets vault
//!
//! The vault is a JSON document kept encrypted at rest by an external
//! engine (gpg by default). Only one instance runs at a time per machine.

pub mod channel;
pub mod codec;
pub mod commands;
pub mod document;
pub mod report;
pub mod session;

#[cfg(all(test, unix))]
mod testing;

pub use codec::{CodecError, Passphrase, SecureCodec};
pub use commands::{Commands, SecretPrompt, TerminalPrompt};
pub use document::{DocumentError, VaultDocument};
pub use session::{Session, Startup};
