//! strongbox - Local secrets vault
//!
//! "Your secrets, encrypted at rest, one instance at a time."

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use strongbox::{
    report,
    session::{self, Startup},
    Commands as Vault, SecureCodec, TerminalPrompt,
};
use strongbox_core::{Config, LockManager};

/// Exit code when another instance holds the lock
const EXIT_ALREADY_RUNNING: u8 = 2;

/// strongbox - Local secrets vault
#[derive(Parser)]
#[command(name = "strongbox")]
#[command(version)]
#[command(about = "Local secrets vault encrypted at rest with gpg")]
#[command(long_about = "Local secrets vault encrypted at rest with gpg.\n\n\
    The vault is a JSON document of fields grouped by name, e.g.\n\
    Work/GitLab/Password. Keys starting with '_' are hidden from listings\n\
    unless --hidden is given. Passphrases and plaintext reach the engine\n\
    through pipes only.")]
struct Cli {
    /// Encryption engine executable (default: gpg)
    #[arg(long, global = true)]
    engine: Option<String>,

    /// Directory holding the process lock (default: the temp directory)
    #[arg(long, global = true)]
    lock_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault with sample content
    Create {
        /// Path of the vault file
        #[arg(default_value = "vault")]
        path: PathBuf,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },

    /// List the fields of a vault, or print one value
    Read {
        /// Path of the vault file
        path: PathBuf,

        /// Field to print (e.g. Work/GitLab/Password)
        field: Option<String>,

        /// Include hidden fields in the listing
        #[arg(long)]
        hidden: bool,

        /// Output the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Change the contents or passphrase of a vault
    Update {
        #[command(subcommand)]
        action: UpdateAction,
    },
}

#[derive(Subcommand)]
enum UpdateAction {
    /// Set one field, prompting for the value if not given
    Data {
        /// Path of the vault file
        path: PathBuf,

        /// Field to set (groups are created as needed)
        field: String,

        /// New value (prompted without echo when omitted)
        value: Option<String>,
    },

    /// Remove one field
    Remove {
        /// Path of the vault file
        path: PathBuf,

        /// Field to remove
        field: String,
    },

    /// Re-encrypt the vault under a new passphrase
    Password {
        /// Path of the vault file
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", report::render(&e));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load()?;
    if let Some(engine) = cli.engine {
        config.engine = engine;
    }
    if let Some(dir) = cli.lock_dir {
        config.lock_dir = Some(dir);
    }
    debug!(engine = %config.engine, lock = %config.lock_file().display(), "Configuration loaded");

    let codec = SecureCodec::new(config.engine.clone());
    let locks = LockManager::new(config.lock_file());

    let session = match session::start(&codec, locks)? {
        Startup::Ready(session) => session,
        Startup::AlreadyRunning { holder } => {
            eprintln!("Another instance of strongbox is running (pid {})", holder);
            return Ok(ExitCode::from(EXIT_ALREADY_RUNNING));
        }
    };

    let mut prompt = TerminalPrompt;
    let mut stdout = io::stdout().lock();
    let result = {
        let mut vault = Vault::new(&codec, &mut prompt, &mut stdout, config.decrypt_attempts);
        dispatch(&mut vault, cli.command)
    };

    let lock_path = session.locks().path().to_path_buf();
    if let Err(e) = session.close() {
        warn!(error = %e, "Could not release the process lock");
        eprintln!(
            "warning: the lock file {} could not be removed; delete it by hand once no strongbox is running",
            lock_path.display()
        );
    }

    result.map(|_| ExitCode::SUCCESS)
}

fn dispatch(vault: &mut Vault<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Create { path, force } => vault.create(&path, force),
        Commands::Read {
            path,
            field,
            hidden,
            json,
        } => vault.read(&path, field.as_deref(), hidden, json),
        Commands::Update { action } => match action {
            UpdateAction::Data { path, field, value } => vault.set_field(&path, &field, value),
            UpdateAction::Remove { path, field } => vault.remove_field(&path, &field),
            UpdateAction::Password { path } => vault.change_passphrase(&path),
        },
    }
}
