//! SQLite backend for sqlmigrate: the history table, the advisory lock and the
//! runner that applies pending migrations through a borrowed connection.

use rusqlite::{params, Connection};
use sqlmigrate_core::CoreError;
use thiserror::Error;
use time::OffsetDateTime;

pub mod history;
pub mod lock;
pub mod runner;

pub use history::{HistoryStore, HISTORY_TABLE};
pub use lock::{current_holder, force_release, LockInfo, MigrationLock, LOCK_TABLE};
pub use runner::{
    AppliedMigration, MigrationReport, MigrationStatus, Migrator, MigratorConfig, RunPhase,
};

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("failed to apply migration version {version} ({file_name}): {source}")]
    Apply {
        version: i64,
        file_name: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("migration lock is held by {owner} since {acquired_at}")]
    LockHeld { owner: String, acquired_at: String },
    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to format RFC3339 timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

pub type Result<T, E = MigrateError> = std::result::Result<T, E>;

pub(crate) fn now_rfc3339() -> Result<String> {
    Ok(OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339)?)
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table_name],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}
