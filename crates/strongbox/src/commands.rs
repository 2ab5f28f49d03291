//! Vault commands: create, read and update an encrypted vault

use crate::codec::{CodecError, Passphrase, SecureCodec};
use crate::document::VaultDocument;
use anyhow::{anyhow, bail, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Source of secret input (passphrases and field values)
pub trait SecretPrompt {
    fn secret(&mut self, label: &str) -> Result<String>;
}

/// Hidden terminal input
pub struct TerminalPrompt;

impl SecretPrompt for TerminalPrompt {
    fn secret(&mut self, label: &str) -> Result<String> {
        rpassword::prompt_password(format!("{}: ", label)).context("Failed to read from the terminal")
    }
}

/// Runs vault commands against one codec
pub struct Commands<'a> {
    codec: &'a SecureCodec,
    prompt: &'a mut dyn SecretPrompt,
    out: &'a mut dyn Write,
    decrypt_attempts: u32,
}

impl<'a> Commands<'a> {
    pub fn new(
        codec: &'a SecureCodec,
        prompt: &'a mut dyn SecretPrompt,
        out: &'a mut dyn Write,
        decrypt_attempts: u32,
    ) -> Self {
        Self {
            codec,
            prompt,
            out,
            decrypt_attempts: decrypt_attempts.max(1),
        }
    }

    /// Create a new vault with starter content
    pub fn create(&mut self, path: &Path, force: bool) -> Result<()> {
        let path = absolute(path)?;
        if path.exists() && !force {
            bail!(
                "A file already exists at {} (use --force to replace it)",
                path.display()
            );
        }

        let passphrase = self.new_passphrase("Enter the desired passphrase for your vault")?;
        let document = VaultDocument::starter();
        self.codec
            .encrypt(&document.to_bytes()?, &passphrase, &path)
            .context("could not encrypt the vault content")?;

        writeln!(
            self.out,
            "A new vault file (with some sample content) was created ({}).",
            path.display()
        )?;
        Ok(())
    }

    /// List fields, or print one field's value
    pub fn read(&mut self, path: &Path, field: Option<&str>, hidden: bool, json: bool) -> Result<()> {
        let path = absolute(path)?;
        let (passphrase, document) = self.unlock(&path)?;

        if hidden {
            let again = Passphrase::from(self.prompt.secret("Enter your passphrase again to show hidden fields")?);
            if again != passphrase {
                bail!("The passphrase doesn't match; hidden fields were not shown");
            }
        }

        if let Some(field) = field {
            let value = document.get(field)?;
            writeln!(self.out, "{}", value)?;
            return Ok(());
        }

        let fields = document.fields(hidden);
        if json {
            let keys: Vec<&str> = fields.keys().map(String::as_str).collect();
            writeln!(self.out, "{}", serde_json::to_string_pretty(&keys)?)?;
            return Ok(());
        }

        for key in fields.keys() {
            writeln!(self.out, "  {}", key)?;
        }
        Ok(())
    }

    /// Set one field, prompting for the value when none is given
    pub fn set_field(&mut self, path: &Path, field: &str, value: Option<String>) -> Result<()> {
        let path = absolute(path)?;
        let (passphrase, mut document) = self.unlock(&path)?;

        let value = match value {
            Some(v) => v,
            None => self.prompt.secret(&format!("Enter the value for {}", field))?,
        };
        document.set(field, value)?;

        self.save(&path, &document, &passphrase)?;
        writeln!(self.out, "Vault was updated ({}).", field)?;
        Ok(())
    }

    /// Remove one field
    pub fn remove_field(&mut self, path: &Path, field: &str) -> Result<()> {
        let path = absolute(path)?;
        let (passphrase, mut document) = self.unlock(&path)?;

        document.remove(field)?;

        self.save(&path, &document, &passphrase)?;
        writeln!(self.out, "Vault was updated ({} removed).", field)?;
        Ok(())
    }

    /// Re-encrypt the vault under a new passphrase
    pub fn change_passphrase(&mut self, path: &Path) -> Result<()> {
        let path = absolute(path)?;
        let (_, document) = self.unlock(&path)?;

        let passphrase = self.new_passphrase("Enter your new passphrase")?;
        self.save(&path, &document, &passphrase)?;
        writeln!(self.out, "The vault passphrase was updated.")?;
        Ok(())
    }

    /// Prompt for the passphrase and decrypt, re-prompting on a wrong one
    fn unlock(&mut self, path: &Path) -> Result<(Passphrase, VaultDocument)> {
        if !path.exists() {
            bail!("Vault file not found: {}", path.display());
        }

        let mut attempt = 1;
        loop {
            let passphrase = Passphrase::from(self.prompt.secret("Enter your passphrase")?);
            match self.codec.decrypt(path, &passphrase) {
                Ok(plaintext) => {
                    let document = VaultDocument::from_bytes(&plaintext)
                        .context("the decrypted vault file has invalid content")?;
                    return Ok((passphrase, document));
                }
                Err(e) if e.is_retryable() && attempt < self.decrypt_attempts => {
                    writeln!(self.out, "warning: {}", retry_hint(&e))?;
                    attempt += 1;
                }
                Err(e) => return Err(anyhow!(e).context("could not decrypt the vault file")),
            }
        }
    }

    fn new_passphrase(&mut self, label: &str) -> Result<Passphrase> {
        let first = Passphrase::from(self.prompt.secret(label)?);
        if first.is_empty() {
            bail!("Empty passphrase not allowed");
        }
        let confirmation = Passphrase::from(self.prompt.secret("Enter it again")?);
        if first != confirmation {
            bail!(
                "The passphrases don't match. Take your time and make sure no accidental typos are made; the vault was left unchanged"
            );
        }
        Ok(first)
    }

    fn save(&mut self, path: &Path, document: &VaultDocument, passphrase: &Passphrase) -> Result<()> {
        self.codec
            .encrypt(&document.to_bytes()?, passphrase, path)
            .context("could not encrypt the vault content")
    }
}

fn retry_hint(error: &CodecError) -> &'static str {
    match error {
        CodecError::DecryptionFailed { .. } => "wrong passphrase or damaged vault, try again",
        _ => "try again",
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .context("could not find the absolute path for the vault file")?;
    Ok(cwd.join(path))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::fake_engine;
    use std::collections::VecDeque;

    /// Answers prompts from a fixed script
    struct Scripted(VecDeque<&'static str>);

    impl Scripted {
        fn new(answers: &[&'static str]) -> Self {
            Self(answers.iter().copied().collect())
        }
    }

    impl SecretPrompt for Scripted {
        fn secret(&mut self, label: &str) -> Result<String> {
            self.0
                .pop_front()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("unexpected prompt: {}", label))
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        codec: SecureCodec,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let codec = SecureCodec::new(fake_engine(dir.path()));
            Self { dir, codec }
        }

        fn vault(&self) -> PathBuf {
            self.dir.path().join("vault")
        }

        /// Run one command with scripted answers, returning its output
        fn run<F>(&self, answers: &[&'static str], f: F) -> Result<String>
        where
            F: FnOnce(&mut Commands<'_>) -> Result<()>,
        {
            let mut prompt = Scripted::new(answers);
            let mut out = Vec::new();
            {
                let mut commands = Commands::new(&self.codec, &mut prompt, &mut out, 3);
                f(&mut commands)?;
            }
            assert!(prompt.0.is_empty(), "unused answers: {:?}", prompt.0);
            Ok(String::from_utf8(out).unwrap())
        }

        fn document(&self, passphrase: &str) -> VaultDocument {
            let plaintext = self
                .codec
                .decrypt(&self.vault(), &Passphrase::from(passphrase))
                .unwrap();
            VaultDocument::from_bytes(&plaintext).unwrap()
        }
    }

    #[test]
    fn test_create_writes_starter_document() {
        let fx = Fixture::new();
        let vault = fx.vault();
        let output = fx.run(&["pw", "pw"], |c| c.create(&vault, false)).unwrap();

        assert!(output.contains("was created"));
        assert_eq!(fx.document("pw"), VaultDocument::starter());
    }

    #[test]
    fn test_create_refuses_to_overwrite() {
        let fx = Fixture::new();
        let vault = fx.vault();
        std::fs::write(&vault, "existing").unwrap();

        let err = fx.run(&[], |c| c.create(&vault, false)).unwrap_err();
        assert!(err.to_string().contains("--force"));
        assert_eq!(std::fs::read_to_string(&vault).unwrap(), "existing");

        fx.run(&["pw", "pw"], |c| c.create(&vault, true)).unwrap();
        assert_eq!(fx.document("pw"), VaultDocument::starter());
    }

    #[test]
    fn test_create_rejects_mismatched_passphrases() {
        let fx = Fixture::new();
        let vault = fx.vault();

        let err = fx.run(&["pw", "pv"], |c| c.create(&vault, false)).unwrap_err();
        assert!(err.to_string().contains("don't match"));
        assert!(!vault.exists());
    }

    #[test]
    fn test_read_lists_and_prints_fields() {
        let fx = Fixture::new();
        let vault = fx.vault();
        fx.run(&["pw", "pw"], |c| c.create(&vault, false)).unwrap();

        let listing = fx.run(&["pw"], |c| c.read(&vault, None, false, false)).unwrap();
        assert!(listing.contains("  Work/GitLab/Password"));
        assert!(!listing.contains("Recovery Codes"));

        let hidden = fx.run(&["pw", "pw"], |c| c.read(&vault, None, true, true)).unwrap();
        let keys: Vec<String> = serde_json::from_str(&hidden).unwrap();
        assert!(keys.contains(&"Personal/_Recovery Codes/Primary".to_string()));

        let value = fx
            .run(&["pw"], |c| c.read(&vault, Some("Work/GitLab/URL"), false, false))
            .unwrap();
        assert_eq!(value, "gitlab.example.org\n");
    }

    #[test]
    fn test_hidden_fields_need_passphrase_again() {
        let fx = Fixture::new();
        let vault = fx.vault();
        fx.run(&["pw", "pw"], |c| c.create(&vault, false)).unwrap();

        let err = fx
            .run(&["pw", "guess"], |c| c.read(&vault, None, true, false))
            .unwrap_err();
        assert!(err.to_string().contains("hidden fields were not shown"));
    }

    #[test]
    fn test_wrong_passphrase_is_retried() {
        let fx = Fixture::new();
        let vault = fx.vault();
        fx.run(&["pw", "pw"], |c| c.create(&vault, false)).unwrap();

        let output = fx
            .run(&["nope", "pw"], |c| c.read(&vault, Some("Work/GitLab/Username"), false, false))
            .unwrap();
        assert!(output.contains("wrong passphrase"));
        assert!(output.ends_with("me\n"));
    }

    #[test]
    fn test_wrong_passphrase_attempts_are_bounded() {
        let fx = Fixture::new();
        let vault = fx.vault();
        fx.run(&["pw", "pw"], |c| c.create(&vault, false)).unwrap();

        let err = fx
            .run(&["a", "b", "c"], |c| c.read(&vault, None, false, false))
            .unwrap_err();
        let cause = err.root_cause().downcast_ref::<CodecError>();
        assert!(matches!(cause, Some(CodecError::DecryptionFailed { .. })));
    }

    #[test]
    fn test_set_and_remove_fields() {
        let fx = Fixture::new();
        let vault = fx.vault();
        fx.run(&["pw", "pw"], |c| c.create(&vault, false)).unwrap();

        fx.run(&["pw"], |c| {
            c.set_field(&vault, "Home/Wifi", Some("hunter2".to_string()))
        })
        .unwrap();
        fx.run(&["pw", "s3cret\nwith newline"], |c| c.set_field(&vault, "Home/_Alarm", None))
            .unwrap();
        assert_eq!(fx.document("pw").get("Home/Wifi").unwrap(), "hunter2");
        assert_eq!(fx.document("pw").get("Home/_Alarm").unwrap(), "s3cret\nwith newline");

        fx.run(&["pw"], |c| c.remove_field(&vault, "Home/Wifi")).unwrap();
        assert!(fx.document("pw").get("Home/Wifi").is_err());
    }

    #[test]
    fn test_change_passphrase() {
        let fx = Fixture::new();
        let vault = fx.vault();
        fx.run(&["old", "old"], |c| c.create(&vault, false)).unwrap();

        fx.run(&["old", "new", "new"], |c| c.change_passphrase(&vault))
            .unwrap();
        assert_eq!(fx.document("new"), VaultDocument::starter());

        let err = fx
            .codec
            .decrypt(&vault, &Passphrase::from("old"))
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_change_passphrase_mismatch_keeps_vault() {
        let fx = Fixture::new();
        let vault = fx.vault();
        fx.run(&["old", "old"], |c| c.create(&vault, false)).unwrap();
        let before = std::fs::read(&vault).unwrap();

        let err = fx
            .run(&["old", "new", "typo"], |c| c.change_passphrase(&vault))
            .unwrap_err();
        assert!(err.to_string().contains("left unchanged"));
        assert_eq!(std::fs::read(&vault).unwrap(), before);
    }

    #[test]
    fn test_missing_vault() {
        let fx = Fixture::new();
        let vault = fx.vault();
        let err = fx.run(&[], |c| c.read(&vault, None, false, false)).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
