//! Discovery and name validation of migration files.
//!
//! A migration file must be named `V<digits>__<word characters>.sql`, for
//! example `V1__create_table_car.sql`. Listing is one shallow `read_dir` with
//! no filtering and no sorting; stray entries surface as naming failures.

use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex_lite::Regex;

use crate::CoreError;

#[allow(clippy::expect_used)]
static MIGRATION_NAME: Lazy<Regex> = Lazy::new(|| {
    // Literal pattern, compiling it cannot fail.
    Regex::new(r"^V(\d+)__(\w+)\.sql$").expect("migration name pattern must compile")
});

// Statement-leading transaction control. Trigger bodies open with a bare
// `BEGIN` and close with `END;`, neither of which matches.
#[allow(clippy::expect_used)]
static TRANSACTION_CONTROL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^\s*(?:BEGIN(?:\s+(?:DEFERRED|IMMEDIATE|EXCLUSIVE))?(?:\s+TRANSACTION)?\s*;|COMMIT\b|END\s+TRANSACTION\b|ROLLBACK\s*(?:TRANSACTION\s*)?;)",
    )
    .expect("transaction control pattern must compile")
});

/// List every entry of `dir` in directory order.
///
/// # Errors
/// Returns [`CoreError::Read`] when the directory cannot be read.
pub fn list(dir: &Path) -> Result<Vec<String>, CoreError> {
    let read_err = |source| CoreError::Read { path: dir.to_path_buf(), source };

    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }

    tracing::debug!(
        target: crate::TRACING_TARGET_MIGRATION,
        dir = %dir.display(),
        entries = names.len(),
        "listed migrations directory"
    );
    Ok(names)
}

/// `true` when every name follows the migration naming pattern.
#[must_use]
pub fn validate_name_syntax<S: AsRef<str>>(file_names: &[S]) -> bool {
    file_names.iter().all(|name| MIGRATION_NAME.is_match(name.as_ref()))
}

/// The names that do not follow the migration naming pattern.
#[must_use]
pub fn invalid_names<S: AsRef<str>>(file_names: &[S]) -> Vec<String> {
    file_names
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| !MIGRATION_NAME.is_match(name))
        .map(ToString::to_string)
        .collect()
}

/// Version number of a migration file name.
///
/// # Errors
/// Returns [`CoreError::MalformedName`] for names that were not validated first.
pub fn extract_version(file_name: &str) -> Result<i64, CoreError> {
    split_name(file_name).map(|(version, _)| version)
}

pub(crate) fn split_name(file_name: &str) -> Result<(i64, &str), CoreError> {
    let malformed = || CoreError::MalformedName(file_name.to_string());
    let captures = MIGRATION_NAME.captures(file_name).ok_or_else(malformed)?;
    let digits = captures.get(1).ok_or_else(malformed)?.as_str();
    let name = captures.get(2).ok_or_else(malformed)?.as_str();
    let version = digits.parse::<i64>().map_err(|_| malformed())?;
    Ok((version, name))
}

/// Read a migration's SQL text.
///
/// # Errors
/// Returns [`CoreError::Read`] when the file is missing, unreadable or not UTF-8.
pub fn read_migration(dir: &Path, file_name: &str) -> Result<String, CoreError> {
    let path = dir.join(file_name);
    fs::read_to_string(&path).map_err(|source| CoreError::Read { path, source })
}

/// `true` when the SQL starts, commits or rolls back a transaction itself.
///
/// Only statements at the start of a line are considered.
#[must_use]
pub fn manages_own_transaction(sql: &str) -> bool {
    TRANSACTION_CONTROL.is_match(sql)
}
