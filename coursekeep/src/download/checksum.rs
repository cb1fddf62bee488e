//! SHA-256 verification of downloaded files.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::job::JobFailure;

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of an in-memory buffer.
pub fn checksum_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Lowercase hex SHA-256 of a file's contents.
pub fn calculate_file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Check a downloaded file against its expected checksum.
///
/// A mismatch is a corrupted transfer and therefore transient; an unreadable
/// file is a local storage problem and permanent.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<(), JobFailure> {
    let actual = calculate_file_checksum(path).map_err(|e| {
        JobFailure::permanent(format!("failed to read {}: {}", path.display(), e))
    })?;

    if !actual.eq_ignore_ascii_case(expected) {
        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        return Err(JobFailure::transient(format!(
            "checksum mismatch for {}: expected {}, got {}",
            name, expected, actual
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::job::FailureKind;
    use std::io::Write;
    use tempfile::TempDir;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_checksum_bytes() {
        assert_eq!(checksum_bytes(b"hello world"), HELLO_WORLD);
        assert_eq!(
            checksum_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_file_checksum_spans_buffers() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("large.bin");
        let data = vec![0xABu8; BUFFER_SIZE * 2 + 17];
        File::create(&path).unwrap().write_all(&data).unwrap();

        assert_eq!(calculate_file_checksum(&path).unwrap(), checksum_bytes(&data));
    }

    #[test]
    fn test_verify_mismatch_is_transient() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lesson.mp4");
        File::create(&path).unwrap().write_all(b"hello world").unwrap();

        assert!(verify_checksum(&path, HELLO_WORLD).is_ok());
        assert!(verify_checksum(&path, &HELLO_WORLD.to_uppercase()).is_ok());

        let err = verify_checksum(&path, "deadbeef").unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
        assert!(err.message.contains("lesson.mp4"));
    }

    #[test]
    fn test_verify_unreadable_is_permanent() {
        let err = verify_checksum(Path::new("/nonexistent/file.txt"), HELLO_WORLD).unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
    }
}
