//! Advisory lock row that keeps two migrators off the same database.
//!
//! The lock is a single row in `schema_history_lock`. Taking it is an insert
//! into a table whose primary key only admits `id = 1`, so a second migrator
//! fails on the constraint instead of racing. A crashed process leaves the row
//! behind; [`force_release`] clears it.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use ulid::Ulid;

use sqlmigrate_core::TRACING_TARGET_MIGRATION;

use crate::{now_rfc3339, table_exists, MigrateError, Result};

pub const LOCK_TABLE: &str = "schema_history_lock";

const CREATE_LOCK_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_history_lock (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  token TEXT NOT NULL,
  owner TEXT NOT NULL,
  acquired_at TEXT NOT NULL
);
";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LockInfo {
    pub owner: String,
    pub acquired_at: String,
}

/// Held lock; released on [`MigrationLock::release`] or drop.
#[derive(Debug)]
pub struct MigrationLock<'c> {
    conn: &'c Connection,
    token: String,
    released: bool,
}

impl<'c> MigrationLock<'c> {
    /// Take the lock on behalf of `owner`.
    ///
    /// # Errors
    /// Returns [`MigrateError::LockHeld`] when another migrator holds the lock,
    /// or a database error when the lock table cannot be written.
    pub fn acquire(conn: &'c Connection, owner: &str) -> Result<Self> {
        conn.execute_batch(CREATE_LOCK_TABLE_SQL)?;

        let token = Ulid::new().to_string();
        let inserted = conn.execute(
            "INSERT INTO schema_history_lock (id, token, owner, acquired_at) VALUES (1, ?1, ?2, ?3)",
            params![token, owner, now_rfc3339()?],
        );

        match inserted {
            Ok(_) => {
                tracing::debug!(target: TRACING_TARGET_MIGRATION, %owner, %token, "acquired migration lock");
                Ok(Self { conn, token, released: false })
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                let holder = current_holder(conn)?.unwrap_or_else(|| LockInfo {
                    owner: "unknown".to_string(),
                    acquired_at: "unknown".to_string(),
                });
                tracing::error!(
                    target: TRACING_TARGET_MIGRATION,
                    owner = %holder.owner,
                    acquired_at = %holder.acquired_at,
                    "migration lock is already held"
                );
                Err(MigrateError::LockHeld { owner: holder.owner, acquired_at: holder.acquired_at })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Give the lock back.
    ///
    /// # Errors
    /// Returns an error when the lock row cannot be deleted.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.delete_own_row()
    }

    fn delete_own_row(&self) -> Result<()> {
        self.conn
            .execute("DELETE FROM schema_history_lock WHERE id = 1 AND token = ?1", params![self.token])?;
        tracing::debug!(target: TRACING_TARGET_MIGRATION, token = %self.token, "released migration lock");
        Ok(())
    }
}

impl Drop for MigrationLock<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.delete_own_row() {
            tracing::warn!(
                target: TRACING_TARGET_MIGRATION,
                error = %err,
                "failed to release migration lock; run `sqlmigrate unlock` to clear it"
            );
        }
    }
}

/// Current lock holder, if any. Does not create the lock table.
///
/// # Errors
/// Returns an error when the lock table cannot be read.
pub fn current_holder(conn: &Connection) -> Result<Option<LockInfo>> {
    if !table_exists(conn, LOCK_TABLE)? {
        return Ok(None);
    }
    let holder = conn
        .query_row("SELECT owner, acquired_at FROM schema_history_lock WHERE id = 1", [], |row| {
            Ok(LockInfo { owner: row.get(0)?, acquired_at: row.get(1)? })
        })
        .optional()?;
    Ok(holder)
}

/// Clear a lock left behind by a crashed migrator, returning who held it.
///
/// # Errors
/// Returns an error when the lock table cannot be read or written.
pub fn force_release(conn: &Connection) -> Result<Option<LockInfo>> {
    let Some(holder) = current_holder(conn)? else {
        return Ok(None);
    };
    conn.execute("DELETE FROM schema_history_lock WHERE id = 1", [])?;
    tracing::warn!(
        target: TRACING_TARGET_MIGRATION,
        owner = %holder.owner,
        acquired_at = %holder.acquired_at,
        "forcibly released migration lock"
    );
    Ok(Some(holder))
}
