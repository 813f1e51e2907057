//! File verification.
//!
//! Stateless comparisons of a local file against declared expectations:
//! size, content hash (SHA-256), and structural version.
//!
//! Hashes are rendered as upper-case hex and compared case-insensitively
//! in constant time, so manifests may carry either case.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::UpdateError;
use crate::version::AppVersion;

/// Buffer size for reading files during hash computation.
const HASH_BUFFER_SIZE: usize = 8192;

/// Compares local files against declared size, hash, and version.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileVerifier;

impl FileVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Compute the SHA-256 hash of a file as upper-case hex.
    ///
    /// Reads the file in chunks so large payloads are never held in memory.
    pub fn compute_hash(&self, path: &Path) -> Result<String, UpdateError> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; HASH_BUFFER_SIZE];

        loop {
            let bytes_read = file.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hex::encode_upper(hasher.finalize()))
    }

    /// Whether the file's content hash equals `expected`.
    pub fn hash_matches(&self, path: &Path, expected: &str) -> Result<bool, UpdateError> {
        let actual = self.compute_hash(path)?;
        Ok(hashes_equal(&actual, expected))
    }

    /// Verify the file's content hash, failing with `HashMismatch`.
    pub fn verify_hash(&self, path: &Path, expected: &str) -> Result<(), UpdateError> {
        let actual = self.compute_hash(path)?;

        if !hashes_equal(&actual, expected) {
            tracing::error!(
                expected = %expected,
                actual = %actual,
                path = %path.display(),
                "Content hash mismatch"
            );
            return Err(UpdateError::HashMismatch {
                expected: expected.to_ascii_uppercase(),
                actual,
            });
        }

        tracing::debug!(hash = %actual, path = %path.display(), "Content hash verified");
        Ok(())
    }

    /// Whether the file's size equals `expected`.
    pub fn size_matches(&self, path: &Path, expected: u64) -> Result<bool, UpdateError> {
        Ok(std::fs::metadata(path)?.len() == expected)
    }

    /// Verify the file's size, failing with `SizeMismatch`.
    pub fn verify_size(&self, path: &Path, expected: u64) -> Result<(), UpdateError> {
        let actual = std::fs::metadata(path)?.len();

        if actual != expected {
            tracing::error!(
                expected = expected,
                actual = actual,
                path = %path.display(),
                "File size mismatch"
            );
            return Err(UpdateError::SizeMismatch { expected, actual });
        }

        Ok(())
    }

    /// Whether a local file with version `local` is stale against `declared`.
    ///
    /// An empty declared version is always stale, as is a local file whose
    /// version cannot be determined or a declared version that does not parse.
    pub fn version_differs(&self, local: Option<AppVersion>, declared: &str) -> bool {
        let declared = declared.trim();
        if declared.is_empty() {
            return true;
        }
        match (local, declared.parse::<AppVersion>()) {
            (Some(local), Ok(declared)) => local != declared,
            _ => true,
        }
    }
}

/// Case-insensitive, constant-time comparison of two hex digests.
pub fn hashes_equal(a: &str, b: &str) -> bool {
    let a = a.trim().to_ascii_uppercase();
    let b = b.trim().to_ascii_uppercase();
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).unwrap_u8() == 1
}
