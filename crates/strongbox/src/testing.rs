//! Test helpers: a stand-in encryption engine speaking the gpg stdin protocol

use std::fs;
use std::path::Path;

/// Reads the passphrase line first, like the real engine. "Ciphertext" is
/// the passphrase line followed by the payload. A passphrase of
/// `fail-encrypt` writes partial output and exits non-zero.
const FAKE_ENGINE: &str = r#"#!/bin/sh
mode=""
out=""
src=""
while [ $# -gt 0 ]; do
    case "$1" in
        --version) echo "fake-engine 1.0"; exit 0 ;;
        --symmetric) mode=encrypt ;;
        --decrypt) mode=decrypt ;;
        --output) shift; out="$1" ;;
        --*) ;;
        *) src="$1" ;;
    esac
    shift
done

IFS= read -r pass || { echo "fake-engine: no passphrase" >&2; exit 4; }

case "$mode" in
    encrypt)
        if [ "$pass" = "fail-encrypt" ]; then
            cat > /dev/null
            echo "partial" > "$out"
            echo "fake-engine: simulated failure" >&2
            exit 3
        fi
        { printf '%s\n' "$pass"; cat; } > "$out" || { cat > /dev/null; exit 2; }
        ;;
    decrypt)
        IFS= read -r stored < "$src" || { echo "fake-engine: no valid OpenPGP data found" >&2; exit 2; }
        if [ "$stored" != "$pass" ]; then
            echo "fake-engine: decryption failed: Bad session key" >&2
            exit 2
        fi
        tail -n +2 "$src"
        ;;
    *)
        exit 64
        ;;
esac
"#;

/// Install the fake engine in `dir` and return its path
pub fn fake_engine(dir: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-engine");
    fs::write(&path, FAKE_ENGINE).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}
