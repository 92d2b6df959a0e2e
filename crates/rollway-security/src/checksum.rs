use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    digest_reader(BufReader::new(file))
        .with_context(|| format!("failed to hash {}", path.display()))
}

/// Compares two hex digests without short-circuiting on the first differing
/// byte. Case and surrounding whitespace are ignored; a length mismatch is
/// still reported as unequal.
pub fn constant_time_eq_hex(left: &str, right: &str) -> bool {
    let left = left.trim().as_bytes();
    let right = right.trim().as_bytes();
    if left.len() != right.len() {
        return false;
    }

    let mut diff = 0_u8;
    for (a, b) in left.iter().zip(right.iter()) {
        diff |= a.to_ascii_lowercase() ^ b.to_ascii_lowercase();
    }
    diff == 0
}

fn digest_reader<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];
    loop {
        let read = reader.read(&mut buffer).context("failed reading input")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn sha256_hex_matches_known_vectors() {
        assert_eq!(sha256_hex(b""), EMPTY_SHA256);
        assert_eq!(sha256_hex(b"abc"), ABC_SHA256);
    }

    #[test]
    fn constant_time_eq_hex_ignores_case_and_whitespace() {
        let actual = sha256_hex(b"abc");
        assert!(constant_time_eq_hex(&actual, &ABC_SHA256.to_ascii_uppercase()));
        assert!(constant_time_eq_hex(&actual, &format!("  {ABC_SHA256}\n")));
        assert!(!constant_time_eq_hex(&sha256_hex(b"abd"), ABC_SHA256));
    }

    #[test]
    fn constant_time_eq_hex_rejects_length_mismatch() {
        assert!(!constant_time_eq_hex("abcd", "abc"));
        assert!(constant_time_eq_hex("", ""));
    }

    #[test]
    fn sha256_file_hex_hashes_file_contents() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("rollway-security-test-{nanos}.bin"));
        std::fs::write(&path, b"abc").expect("must write file");

        assert_eq!(sha256_file_hex(&path).expect("must hash"), ABC_SHA256);
        std::fs::write(&path, b"").expect("must truncate file");
        assert_eq!(sha256_file_hex(&path).expect("must hash"), EMPTY_SHA256);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sha256_file_hex_errors_for_missing_file() {
        let path = std::env::temp_dir().join("rollway-security-test-missing-file.bin");
        let _ = std::fs::remove_file(&path);
        assert!(sha256_file_hex(&path).is_err());
    }
}
