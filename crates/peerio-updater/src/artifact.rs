//! Downloaded artifact verification.
//!
//! Artifacts are checked against the size and SHA-512 hash promised by the
//! signed manifest before anything else touches them. Hashing streams the
//! file in chunks so large installers never sit in memory, and the hash
//! comparison is constant-time.

use std::path::Path;

use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use tokio::io::AsyncReadExt;

use crate::error::UpdateError;

/// Chunk size for streaming hash computation.
const HASH_BUFFER_SIZE: usize = 8192;

/// Compute the SHA-512 hash of a file as lowercase hex.
pub async fn compute_sha512(path: &Path) -> Result<String, UpdateError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha512::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify a file's SHA-512 hash against an expected hex digest.
///
/// The comparison is case-insensitive over the hex text and constant-time
/// over the bytes.
pub async fn verify_hash(expected_hex: &str, path: &Path) -> Result<(), UpdateError> {
    let expected = expected_hex.to_ascii_lowercase();
    let actual = compute_sha512(path).await?;

    if actual.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
        tracing::error!(path = %path.display(), expected, actual, "artifact hash mismatch");
        return Err(UpdateError::HashMismatch { expected, actual });
    }

    tracing::debug!(path = %path.display(), hash = %actual, "artifact hash verified");
    Ok(())
}

/// Verify a file's size against the manifest-declared byte count.
pub async fn verify_size(expected: u64, path: &Path) -> Result<(), UpdateError> {
    let actual = tokio::fs::metadata(path).await?.len();

    if actual != expected {
        tracing::error!(path = %path.display(), expected, actual, "artifact size mismatch");
        return Err(UpdateError::SizeMismatch { expected, actual });
    }

    tracing::debug!(path = %path.display(), size = actual, "artifact size verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    /// SHA-512 of the empty input.
    const EMPTY_SHA512: &str = "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce\
                                47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e";

    fn file_with(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn empty_file_known_answer() {
        let file = file_with(b"");
        assert_eq!(compute_sha512(file.path()).await.unwrap(), EMPTY_SHA512);
    }

    #[tokio::test]
    async fn hash_streams_across_chunks() {
        let content: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let file = file_with(&content);

        let streamed = compute_sha512(file.path()).await.unwrap();
        let direct = hex::encode(Sha512::digest(&content));
        assert_eq!(streamed, direct);
    }

    #[tokio::test]
    async fn verify_hash_accepts_matching_file() {
        let file = file_with(b"Test file\nOK\n");
        let digest = compute_sha512(file.path()).await.unwrap();
        verify_hash(&digest, file.path()).await.unwrap();
    }

    #[tokio::test]
    async fn verify_hash_is_case_insensitive() {
        let file = file_with(b"Test file\nOK\n");
        let digest = compute_sha512(file.path()).await.unwrap().to_uppercase();
        verify_hash(&digest, file.path()).await.unwrap();
    }

    #[tokio::test]
    async fn verify_hash_rejects_mismatch() {
        let file = file_with(b"Test file\nOK\n");
        let mut digest = compute_sha512(file.path()).await.unwrap();
        // Flip one nibble of the expected digest.
        let flipped = if digest.starts_with('0') { "1" } else { "0" };
        digest.replace_range(0..1, flipped);

        let err = verify_hash(&digest, file.path()).await.unwrap_err();
        assert!(matches!(err, UpdateError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn verify_hash_rejects_wrong_length_digest() {
        let file = file_with(b"content");
        let err = verify_hash("deadbeef", file.path()).await.unwrap_err();
        assert!(matches!(err, UpdateError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn verify_hash_missing_file_is_io_error() {
        let err = verify_hash(EMPTY_SHA512, Path::new("/nonexistent/artifact.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Io(_)));
    }

    #[tokio::test]
    async fn verify_size_accepts_exact_size() {
        let file = file_with(b"twelve bytes");
        verify_size(12, file.path()).await.unwrap();
    }

    #[tokio::test]
    async fn verify_size_rejects_mismatch() {
        let file = file_with(b"twelve bytes");
        let err = verify_size(13, file.path()).await.unwrap_err();
        assert!(matches!(err, UpdateError::SizeMismatch { expected: 13, actual: 12 }));
    }
}
