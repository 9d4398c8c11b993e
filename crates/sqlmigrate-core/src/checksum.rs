//! SHA-256 content digests for migration files.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::{catalog, CoreError};

/// Hash a migration file's text content.
///
/// # Errors
/// Returns [`CoreError::Read`] when the file is missing, unreadable or not UTF-8.
pub fn checksum(dir: &Path, file_name: &str) -> Result<String, CoreError> {
    let content = catalog::read_migration(dir, file_name)?;
    Ok(checksum_str(&content))
}

/// Lowercase hex SHA-256 of `content`.
#[must_use]
pub fn checksum_str(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
