//! Filesystem side of the sqlmigrate engine.
//!
//! This crate knows how to find versioned `V<version>__<name>.sql` files, hash
//! them, and reconcile them against the migration history a store hands back.
//! It never talks to a database itself; see `sqlmigrate-store-sqlite` for that.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod catalog;
pub mod checksum;
pub mod planner;

pub use catalog::{
    extract_version, invalid_names, list, manages_own_transaction, read_migration,
    validate_name_syntax,
};
pub use checksum::{checksum, checksum_str};
pub use planner::{compute_pending, detect_tampering, plan, MigrationPlan};

/// Tracing target for everything migration related.
pub const TRACING_TARGET_MIGRATION: &str = "sqlmigrate::migrations";

/// Recorded as `installed_by` when no identity was supplied.
pub const UNKNOWN_INSTALLER: &str = "unknown";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(
        "invalid migration file name(s): {}; expected V{{version}}__{{migration_name}}.sql",
        .files.join(", ")
    )]
    InvalidNaming { files: Vec<String> },
    #[error("migration version {version} is used by more than one file: {}", .files.join(", "))]
    DuplicateVersion { version: i64, files: Vec<String> },
    #[error(
        "migrations have been edited or removed after being installed: {}; revert the changes and try again",
        format_tampered(.tampered)
    )]
    IntegrityViolation { tampered: Vec<TamperedMigration> },
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed migration file name: {0}")]
    MalformedName(String),
}

fn format_tampered(tampered: &[TamperedMigration]) -> String {
    tampered.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// A migration file found in the migrations directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MigrationFile {
    pub version: i64,
    pub name: String,
    pub file_name: String,
}

impl MigrationFile {
    /// Parse a raw directory entry such as `V3__add_index.sql`.
    ///
    /// # Errors
    /// Returns [`CoreError::MalformedName`] when the name does not follow the
    /// migration naming pattern.
    pub fn parse(file_name: &str) -> Result<Self, CoreError> {
        let (version, name) = catalog::split_name(file_name)?;
        Ok(Self { version, name: name.to_string(), file_name: file_name.to_string() })
    }

    /// Human readable label, `create_table_car` becomes `create table car`.
    #[must_use]
    pub fn description(&self) -> String {
        self.name.replace('_', " ")
    }
}

impl Display for MigrationFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.file_name)
    }
}

/// One row of the migration history, i.e. one application attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledMigration {
    pub version: i64,
    pub file_name: String,
    pub checksum: String,
    pub installed_by: String,
    pub success: bool,
    pub installed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TamperKind {
    Modified { expected: String, actual: String },
    Missing,
}

/// An installed migration whose file no longer matches the history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TamperedMigration {
    pub file_name: String,
    #[serde(flatten)]
    pub kind: TamperKind,
}

impl Display for TamperedMigration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TamperKind::Modified { .. } => write!(f, "{} (modified)", self.file_name),
            TamperKind::Missing => write!(f, "{} (missing)", self.file_name),
        }
    }
}

/// Resolve the identity recorded in `installed_by`, falling back to
/// [`UNKNOWN_INSTALLER`] for absent or blank values.
#[must_use]
pub fn resolve_installed_by(candidate: Option<&str>) -> String {
    candidate
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map_or_else(|| UNKNOWN_INSTALLER.to_string(), ToString::to_string)
}
