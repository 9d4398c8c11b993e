//! Append-only `schema_history` ledger.

use rusqlite::{params, Connection};
use sqlmigrate_core::InstalledMigration;

use crate::{now_rfc3339, table_exists, Result};

pub const HISTORY_TABLE: &str = "schema_history";

const CREATE_SCHEMA_HISTORY_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  version INTEGER NOT NULL,
  file_name TEXT NOT NULL,
  check_sum TEXT NOT NULL,
  installed_by TEXT NOT NULL,
  installed_at TEXT NOT NULL,
  success INTEGER NOT NULL CHECK (success IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_schema_history_file_name ON schema_history(file_name);
";

/// Reads and appends rows of the migration history through a borrowed connection.
pub struct HistoryStore<'c> {
    conn: &'c Connection,
}

impl<'c> HistoryStore<'c> {
    #[must_use]
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Create the history table if it does not exist yet.
    ///
    /// # Errors
    /// Returns an error when the DDL cannot be executed.
    pub fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(CREATE_SCHEMA_HISTORY_SQL)?;
        Ok(())
    }

    /// Every recorded attempt, oldest first.
    ///
    /// # Errors
    /// Returns an error when the table cannot be queried.
    pub fn list_installed(&self) -> Result<Vec<InstalledMigration>> {
        let mut stmt = self.conn.prepare(
            "SELECT version, file_name, check_sum, installed_by, success, installed_at
             FROM schema_history
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(InstalledMigration {
                version: row.get(0)?,
                file_name: row.get(1)?,
                checksum: row.get(2)?,
                installed_by: row.get(3)?,
                success: row.get(4)?,
                installed_at: row.get(5)?,
            })
        })?;

        let mut installed = Vec::new();
        for row in rows {
            installed.push(row?);
        }
        Ok(installed)
    }

    /// Like [`HistoryStore::list_installed`], but an absent table reads as an
    /// empty history instead of being created.
    ///
    /// # Errors
    /// Returns an error when the table exists but cannot be queried.
    pub fn list_installed_if_present(&self) -> Result<Vec<InstalledMigration>> {
        if !table_exists(self.conn, HISTORY_TABLE)? {
            return Ok(Vec::new());
        }
        self.list_installed()
    }

    /// Append one attempt. Existing rows are never touched.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn record_attempt(
        &self,
        version: i64,
        file_name: &str,
        checksum: &str,
        installed_by: &str,
        success: bool,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO schema_history (version, file_name, check_sum, installed_by, installed_at, success)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![version, file_name, checksum, installed_by, now_rfc3339()?, success],
        )?;
        Ok(())
    }
}
