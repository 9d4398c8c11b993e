//! Reconciles the migrations directory against the recorded history.
//!
//! Only successful history rows count as installed. A file whose attempts all
//! failed is pending again, and its checksum is not compared because the file
//! is expected to change before the retry.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use serde::Serialize;

use crate::{
    catalog, checksum, CoreError, InstalledMigration, MigrationFile, TamperKind,
    TamperedMigration, TRACING_TARGET_MIGRATION,
};

/// Outcome of reconciling a directory against the history.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Files to apply, ascending by version.
    pub pending: Vec<MigrationFile>,
    /// Number of files with a successful history row.
    pub installed_count: usize,
    /// Pending files that already have failed attempts recorded.
    pub failed_attempts: Vec<String>,
}

impl MigrationPlan {
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

fn successful_file_names(installed: &[InstalledMigration]) -> HashSet<&str> {
    installed.iter().filter(|m| m.success).map(|m| m.file_name.as_str()).collect()
}

/// Find successful installs whose file vanished or whose content changed.
///
/// # Errors
/// Returns [`CoreError::Read`] when a catalogued file cannot be hashed.
pub fn detect_tampering<S: AsRef<str>>(
    dir: &Path,
    installed: &[InstalledMigration],
    catalog_names: &[S],
) -> Result<Vec<TamperedMigration>, CoreError> {
    let on_disk: HashSet<&str> = catalog_names.iter().map(AsRef::as_ref).collect();

    // Last successful row wins should a file ever have been recorded twice.
    let mut expected: BTreeMap<&str, &str> = BTreeMap::new();
    for record in installed.iter().filter(|m| m.success) {
        expected.insert(record.file_name.as_str(), record.checksum.as_str());
    }

    let mut tampered = Vec::new();
    for (file_name, recorded) in expected {
        if !on_disk.contains(file_name) {
            tampered.push(TamperedMigration {
                file_name: file_name.to_string(),
                kind: TamperKind::Missing,
            });
            continue;
        }

        let actual = checksum::checksum(dir, file_name)?;
        if actual != recorded {
            tampered.push(TamperedMigration {
                file_name: file_name.to_string(),
                kind: TamperKind::Modified { expected: recorded.to_string(), actual },
            });
        }
    }

    Ok(tampered)
}

/// Catalog files without a successful history row, ascending by version.
///
/// # Errors
/// Returns [`CoreError::MalformedName`] if a name was not validated beforehand.
pub fn compute_pending<S: AsRef<str>>(
    catalog_names: &[S],
    installed: &[InstalledMigration],
) -> Result<Vec<MigrationFile>, CoreError> {
    let done = successful_file_names(installed);

    let mut pending = catalog_names
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| !done.contains(name))
        .map(MigrationFile::parse)
        .collect::<Result<Vec<_>, _>>()?;

    pending.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.file_name.cmp(&b.file_name)));
    Ok(pending)
}

fn check_unique_versions<S: AsRef<str>>(catalog_names: &[S]) -> Result<(), CoreError> {
    let mut by_version: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for name in catalog_names.iter().map(AsRef::as_ref) {
        by_version.entry(catalog::extract_version(name)?).or_default().push(name.to_string());
    }

    if let Some((version, mut files)) = by_version.into_iter().find(|(_, files)| files.len() > 1) {
        files.sort();
        return Err(CoreError::DuplicateVersion { version, files });
    }
    Ok(())
}

/// Validate names, refuse tampered history and compute the pending set.
///
/// # Errors
/// - [`CoreError::InvalidNaming`] if any file breaks the naming pattern.
/// - [`CoreError::DuplicateVersion`] if two files share a version.
/// - [`CoreError::IntegrityViolation`] if any installed migration was edited or removed.
/// - [`CoreError::Read`] if a file cannot be hashed.
pub fn plan<S: AsRef<str>>(
    dir: &Path,
    catalog_names: &[S],
    installed: &[InstalledMigration],
) -> Result<MigrationPlan, CoreError> {
    if !catalog::validate_name_syntax(catalog_names) {
        let files = catalog::invalid_names(catalog_names);
        tracing::error!(
            target: TRACING_TARGET_MIGRATION,
            files = ?files,
            "invalid migration file names, expected V{{version}}__{{migration_name}}.sql"
        );
        return Err(CoreError::InvalidNaming { files });
    }

    check_unique_versions(catalog_names)?;

    let tampered = detect_tampering(dir, installed, catalog_names)?;
    if !tampered.is_empty() {
        tracing::error!(
            target: TRACING_TARGET_MIGRATION,
            tampered = ?tampered.iter().map(|t| t.file_name.as_str()).collect::<Vec<_>>(),
            "installed migrations were edited after being applied"
        );
        return Err(CoreError::IntegrityViolation { tampered });
    }

    let pending = compute_pending(catalog_names, installed)?;
    let installed_count = successful_file_names(installed).len();

    let failed: BTreeSet<&str> =
        installed.iter().filter(|m| !m.success).map(|m| m.file_name.as_str()).collect();
    let failed_attempts = pending
        .iter()
        .filter(|file| failed.contains(file.file_name.as_str()))
        .map(|file| file.file_name.clone())
        .collect();

    Ok(MigrationPlan { pending, installed_count, failed_attempts })
}
