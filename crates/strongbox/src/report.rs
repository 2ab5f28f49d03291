//! Human-readable error reports for the terminal

use std::fmt::Write;

/// The error, then one `> ` line per underlying cause
pub fn render(error: &anyhow::Error) -> String {
    let mut report = format!("error: {}", error);
    for cause in error.chain().skip(1) {
        let _ = write!(report, "\n> {}", cause);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn test_render_single() {
        let err = anyhow!("Vault file not found: /tmp/v");
        assert_eq!(render(&err), "error: Vault file not found: /tmp/v");
    }

    #[test]
    fn test_render_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory");
        let err = Err::<(), _>(io)
            .context("could not start the decryption engine")
            .context("could not decrypt the vault file")
            .unwrap_err();

        assert_eq!(
            render(&err),
            "error: could not decrypt the vault file\n\
             > could not start the decryption engine\n\
             > No such file or directory"
        );
    }
}
