//! Applies pending migrations, one at a time, through a borrowed connection.
//!
//! A run moves through [`RunPhase`]s and stops at the first failure. Nothing
//! here exits the process; every fatal condition comes back as a
//! [`MigrateError`] and the host decides what to do with it.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::Serialize;
use sqlmigrate_core::{
    catalog, checksum_str, planner, resolve_installed_by, CoreError, InstalledMigration,
    MigrationFile, MigrationPlan, TamperedMigration, TRACING_TARGET_MIGRATION,
};

use crate::lock::{current_holder, LockInfo, MigrationLock};
use crate::{HistoryStore, MigrateError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratorConfig {
    pub migrations_dir: PathBuf,
    pub installed_by: String,
    /// Run each migration and its history row in one transaction.
    pub transactional: bool,
    /// Hold the advisory lock for the duration of a run.
    pub use_lock: bool,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self::new("./migrations")
    }
}

impl MigratorConfig {
    #[must_use]
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
            installed_by: resolve_installed_by(None),
            transactional: true,
            use_lock: true,
        }
    }

    #[must_use]
    pub fn with_installed_by(mut self, installed_by: Option<&str>) -> Self {
        self.installed_by = resolve_installed_by(installed_by);
        self
    }

    #[must_use]
    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    #[must_use]
    pub fn with_lock(mut self, use_lock: bool) -> Self {
        self.use_lock = use_lock;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    SchemaEnsured,
    Locked,
    Validated,
    Diffed,
    Applying(usize),
    Done,
    Aborted,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: i64,
    pub file_name: String,
    pub description: String,
    pub checksum: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: Vec<AppliedMigration>,
    pub already_installed: usize,
    pub retried: Vec<String>,
    pub duration_ms: u64,
}

impl MigrationReport {
    #[must_use]
    pub fn is_no_op(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Read-only view of the migrations directory against the history.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MigrationStatus {
    pub installed: Vec<InstalledMigration>,
    pub pending: Vec<MigrationFile>,
    pub failed_attempts: Vec<String>,
    pub tampered: Vec<TamperedMigration>,
    pub invalid_names: Vec<String>,
    pub lock: Option<LockInfo>,
}

impl MigrationStatus {
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty() && self.tampered.is_empty() && self.invalid_names.is_empty()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub struct Migrator<'c> {
    conn: &'c Connection,
    config: MigratorConfig,
    phase: RunPhase,
}

impl<'c> Migrator<'c> {
    #[must_use]
    pub fn new(conn: &'c Connection, config: MigratorConfig) -> Self {
        Self { conn, config, phase: RunPhase::Init }
    }

    #[must_use]
    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    /// Phase reached by the last run.
    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn dir(&self) -> &Path {
        &self.config.migrations_dir
    }

    fn enter(&mut self, phase: RunPhase) {
        tracing::debug!(target: TRACING_TARGET_MIGRATION, from = ?self.phase, to = ?phase, "migration run phase");
        self.phase = phase;
    }

    /// Apply every pending migration in ascending version order.
    ///
    /// # Errors
    /// - [`MigrateError::Core`] for naming, duplicate version, integrity or read failures;
    ///   nothing is applied in these cases.
    /// - [`MigrateError::LockHeld`] when another migrator holds the lock.
    /// - [`MigrateError::Apply`] when a migration's SQL fails; the failure is recorded and
    ///   the remaining migrations are not attempted.
    /// - [`MigrateError::Database`] when the history cannot be read or written.
    pub fn run(&mut self) -> Result<MigrationReport> {
        self.enter(RunPhase::Init);
        let started = Instant::now();

        let result = self.run_to_completion(started);
        if let Err(err) = &result {
            tracing::error!(target: TRACING_TARGET_MIGRATION, error = %err, "migration run aborted");
            self.enter(RunPhase::Aborted);
        }
        result
    }

    fn run_to_completion(&mut self, started: Instant) -> Result<MigrationReport> {
        let history = HistoryStore::new(self.conn);
        history.ensure_schema()?;
        self.enter(RunPhase::SchemaEnsured);

        let lock = if self.config.use_lock {
            Some(MigrationLock::acquire(self.conn, &self.config.installed_by)?)
        } else {
            None
        };
        self.enter(RunPhase::Locked);

        let names = catalog::list(self.dir())?;
        if !catalog::validate_name_syntax(&names) {
            return Err(CoreError::InvalidNaming { files: catalog::invalid_names(&names) }.into());
        }
        self.enter(RunPhase::Validated);

        let installed = history.list_installed()?;
        let plan = planner::plan(self.dir(), &names, &installed)?;
        self.enter(RunPhase::Diffed);

        for file_name in &plan.failed_attempts {
            tracing::warn!(
                target: TRACING_TARGET_MIGRATION,
                file = %file_name,
                "retrying migration that failed previously"
            );
        }

        let mut applied = Vec::with_capacity(plan.pending.len());
        for (index, file) in plan.pending.iter().enumerate() {
            self.enter(RunPhase::Applying(index));
            applied.push(self.apply(&history, file)?);
        }

        if let Some(lock) = lock {
            lock.release()?;
        }
        self.enter(RunPhase::Done);

        tracing::info!(
            target: TRACING_TARGET_MIGRATION,
            applied = applied.len(),
            already_installed = plan.installed_count,
            "all migrations up to date"
        );

        Ok(MigrationReport {
            applied,
            already_installed: plan.installed_count,
            retried: plan.failed_attempts,
            duration_ms: millis(started.elapsed()),
        })
    }

    fn apply(&self, history: &HistoryStore<'_>, file: &MigrationFile) -> Result<AppliedMigration> {
        let content = catalog::read_migration(self.dir(), &file.file_name)?;
        let checksum = checksum_str(&content);
        let started = Instant::now();

        let wrapped = self.config.transactional && !catalog::manages_own_transaction(&content);
        if self.config.transactional && !wrapped {
            tracing::debug!(
                target: TRACING_TARGET_MIGRATION,
                file = %file.file_name,
                "migration controls its own transaction, running it unwrapped"
            );
        }

        if wrapped {
            let tx = self.conn.unchecked_transaction()?;
            if let Err(source) = tx.execute_batch(&content) {
                drop(tx);
                return Err(self.record_failure(history, file, &checksum, source));
            }
            if self.conn.is_autocommit() {
                // The batch already ended the wrapping transaction.
                drop(tx);
                self.record_success(history, file, &checksum)?;
            } else {
                self.record_success(history, file, &checksum)?;
                tx.commit()?;
            }
        } else {
            if let Err(source) = self.conn.execute_batch(&content) {
                return Err(self.record_failure(history, file, &checksum, source));
            }
            self.record_success(history, file, &checksum)?;
        }

        let elapsed = started.elapsed();
        tracing::info!(
            target: TRACING_TARGET_MIGRATION,
            version = file.version,
            process = %file.description(),
            elapsed_ms = millis(elapsed),
            "migration applied successfully"
        );

        Ok(AppliedMigration {
            version: file.version,
            file_name: file.file_name.clone(),
            description: file.description(),
            checksum,
            duration_ms: millis(elapsed),
        })
    }

    fn record_success(
        &self,
        history: &HistoryStore<'_>,
        file: &MigrationFile,
        checksum: &str,
    ) -> Result<()> {
        history.record_attempt(file.version, &file.file_name, checksum, &self.config.installed_by, true)
    }

    fn record_failure(
        &self,
        history: &HistoryStore<'_>,
        file: &MigrationFile,
        checksum: &str,
        source: rusqlite::Error,
    ) -> MigrateError {
        tracing::error!(
            target: TRACING_TARGET_MIGRATION,
            version = file.version,
            file = %file.file_name,
            error = %source,
            "error applying migration"
        );

        if let Err(record_err) =
            history.record_attempt(file.version, &file.file_name, checksum, &self.config.installed_by, false)
        {
            tracing::error!(
                target: TRACING_TARGET_MIGRATION,
                file = %file.file_name,
                error = %record_err,
                "failed to record unsuccessful migration attempt"
            );
        }

        MigrateError::Apply { version: file.version, file_name: file.file_name.clone(), source }
    }

    /// Reconcile without applying anything. The database is only read; a
    /// missing history table counts as an empty history.
    ///
    /// # Errors
    /// Same validation and integrity errors as [`Migrator::run`].
    pub fn plan_only(&self) -> Result<MigrationPlan> {
        let names = catalog::list(self.dir())?;
        let installed = HistoryStore::new(self.conn).list_installed_if_present()?;
        Ok(planner::plan(self.dir(), &names, &installed)?)
    }

    /// Check names and installed checksums, returning how many installs verified.
    ///
    /// # Errors
    /// Returns [`CoreError::IntegrityViolation`] (wrapped) when any installed
    /// migration was edited or removed, or a naming error.
    pub fn verify(&self) -> Result<usize> {
        self.plan_only().map(|plan| plan.installed_count)
    }

    /// Describe the directory against the history without failing on problems.
    /// Names that break the pattern or overflow the version are listed in
    /// `invalid_names`. Nothing is written to the database.
    ///
    /// # Errors
    /// Returns an error only when the directory or the history cannot be read.
    pub fn status(&self) -> Result<MigrationStatus> {
        let names = catalog::list(self.dir())?;
        let attempts = HistoryStore::new(self.conn).list_installed_if_present()?;

        let (valid, invalid): (Vec<&str>, Vec<&str>) =
            names.iter().map(String::as_str).partition(|name| MigrationFile::parse(name).is_ok());
        let invalid_names = invalid.into_iter().map(ToString::to_string).collect();

        let tampered = planner::detect_tampering(self.dir(), &attempts, &names)?;
        let pending = planner::compute_pending(&valid, &attempts)?;
        let failed_attempts = pending
            .iter()
            .filter(|file| attempts.iter().any(|m| !m.success && m.file_name == file.file_name))
            .map(|file| file.file_name.clone())
            .collect();
        let installed = attempts.into_iter().filter(|m| m.success).collect();

        Ok(MigrationStatus {
            installed,
            pending,
            failed_attempts,
            tampered,
            invalid_names,
            lock: current_holder(self.conn)?,
        })
    }

    /// Every recorded attempt, oldest first.
    ///
    /// # Errors
    /// Returns an error when the history cannot be read.
    pub fn history(&self) -> Result<Vec<InstalledMigration>> {
        HistoryStore::new(self.conn).list_installed_if_present()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::{HISTORY_TABLE, LOCK_TABLE};

    struct Fixture {
        dir: TempDir,
        conn: Connection,
    }

    impl Fixture {
        fn new(files: &[(&str, &str)]) -> anyhow::Result<Self> {
            let dir = TempDir::new()?;
            for (name, sql) in files {
                fs::write(dir.path().join(name), sql)?;
            }
            Ok(Self { dir, conn: Connection::open_in_memory()? })
        }

        fn write(&self, name: &str, sql: &str) -> anyhow::Result<()> {
            fs::write(self.dir.path().join(name), sql)?;
            Ok(())
        }

        fn migrator(&self) -> Migrator<'_> {
            let config = MigratorConfig::new(self.dir.path()).with_installed_by(Some("tester"));
            Migrator::new(&self.conn, config)
        }

        fn history(&self) -> anyhow::Result<Vec<InstalledMigration>> {
            Ok(HistoryStore::new(&self.conn).list_installed()?)
        }

        fn table_exists(&self, table: &str) -> anyhow::Result<bool> {
            let exists: i64 = self.conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                [table],
                |row| row.get(0),
            )?;
            Ok(exists == 1)
        }
    }

    const CAR: &str = "CREATE TABLE car (id INTEGER PRIMARY KEY, name TEXT NOT NULL);";
    const DRIVER: &str = "CREATE TABLE driver (id INTEGER PRIMARY KEY);\nINSERT INTO driver (id) VALUES (1);";
    const BROKEN: &str = "CREATE TABLE broken (id INTEGER PRIMARY KEY;";

    #[test]
    fn applies_pending_migrations_and_records_them() -> anyhow::Result<()> {
        let fx = Fixture::new(&[("V1__create_car.sql", CAR), ("V2__create_driver.sql", DRIVER)])?;
        let mut migrator = fx.migrator();

        let report = migrator.run()?;
        assert_eq!(migrator.phase(), RunPhase::Done);
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.applied[0].description, "create car");
        assert!(fx.table_exists("car")?);
        assert!(fx.table_exists("driver")?);

        let history = fx.history()?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].file_name, "V1__create_car.sql");
        assert_eq!(history[0].checksum, checksum_str(CAR));
        assert_eq!(history[0].installed_by, "tester");
        assert!(history.iter().all(|m| m.success));
        Ok(())
    }

    #[test]
    fn second_run_is_a_no_op() -> anyhow::Result<()> {
        let fx = Fixture::new(&[("V1__create_car.sql", CAR)])?;
        fx.migrator().run()?;

        let report = fx.migrator().run()?;
        assert!(report.is_no_op());
        assert_eq!(report.already_installed, 1);
        assert_eq!(fx.history()?.len(), 1);
        Ok(())
    }

    #[test]
    fn failure_stops_the_run_and_is_recorded() -> anyhow::Result<()> {
        let fx = Fixture::new(&[
            ("V1__create_car.sql", CAR),
            ("V2__broken.sql", BROKEN),
            ("V3__create_driver.sql", DRIVER),
        ])?;
        let mut migrator = fx.migrator();

        match migrator.run() {
            Err(MigrateError::Apply { version, file_name, .. }) => {
                assert_eq!(version, 2);
                assert_eq!(file_name, "V2__broken.sql");
            }
            other => panic!("expected Apply error, got {other:?}"),
        }
        assert_eq!(migrator.phase(), RunPhase::Aborted);

        let history = fx.history()?;
        assert_eq!(history.len(), 2);
        assert_eq!((history[0].file_name.as_str(), history[0].success), ("V1__create_car.sql", true));
        assert_eq!((history[1].file_name.as_str(), history[1].success), ("V2__broken.sql", false));
        assert!(!fx.table_exists("driver")?);
        assert_eq!(current_holder(&fx.conn)?, None);
        Ok(())
    }

    #[test]
    fn failed_migration_is_retried_once_fixed() -> anyhow::Result<()> {
        let fx = Fixture::new(&[("V1__create_car.sql", CAR), ("V2__broken.sql", BROKEN)])?;
        assert!(fx.migrator().run().is_err());

        fx.write("V2__broken.sql", "CREATE TABLE broken (id INTEGER PRIMARY KEY);")?;
        let report = fx.migrator().run()?;
        assert_eq!(report.retried, vec!["V2__broken.sql"]);
        assert_eq!(report.applied.len(), 1);
        assert!(fx.table_exists("broken")?);

        let history = fx.history()?;
        assert_eq!(history.len(), 3);
        assert!(history[2].success);
        Ok(())
    }

    #[test]
    fn transactional_failure_leaves_no_partial_schema() -> anyhow::Result<()> {
        let fx = Fixture::new(&[(
            "V1__half.sql",
            "CREATE TABLE half (id INTEGER PRIMARY KEY);\nINSERT INTO missing_table VALUES (1);",
        )])?;
        assert!(fx.migrator().run().is_err());
        assert!(!fx.table_exists("half")?);
        Ok(())
    }

    #[test]
    fn non_transactional_failure_keeps_earlier_statements() -> anyhow::Result<()> {
        let fx = Fixture::new(&[(
            "V1__half.sql",
            "CREATE TABLE half (id INTEGER PRIMARY KEY);\nINSERT INTO missing_table VALUES (1);",
        )])?;
        let config = MigratorConfig::new(fx.dir.path()).with_transactional(false);
        assert!(Migrator::new(&fx.conn, config).run().is_err());
        assert!(fx.table_exists("half")?);
        assert_eq!(fx.history()?.len(), 1);
        Ok(())
    }

    #[test]
    fn tampered_file_blocks_every_pending_migration() -> anyhow::Result<()> {
        let fx = Fixture::new(&[("V1__create_car.sql", CAR)])?;
        fx.migrator().run()?;

        fx.write("V1__create_car.sql", "CREATE TABLE car (id INTEGER PRIMARY KEY);")?;
        fx.write("V2__create_driver.sql", DRIVER)?;

        let mut migrator = fx.migrator();
        let err = migrator.run();
        assert!(matches!(err, Err(MigrateError::Core(CoreError::IntegrityViolation { .. }))));
        assert_eq!(migrator.phase(), RunPhase::Aborted);
        assert!(!fx.table_exists("driver")?);
        assert_eq!(fx.history()?.len(), 1);
        Ok(())
    }

    #[test]
    fn removed_installed_file_is_an_integrity_violation() -> anyhow::Result<()> {
        let fx = Fixture::new(&[("V1__create_car.sql", CAR)])?;
        fx.migrator().run()?;
        fs::remove_file(fx.dir.path().join("V1__create_car.sql"))?;

        assert!(matches!(fx.migrator().verify(), Err(MigrateError::Core(CoreError::IntegrityViolation { .. }))));
        Ok(())
    }

    #[test]
    fn bad_file_name_aborts_without_applying() -> anyhow::Result<()> {
        let fx = Fixture::new(&[("V1__create_car.sql", CAR), ("bad_name.sql", DRIVER)])?;
        let mut migrator = fx.migrator();

        match migrator.run() {
            Err(MigrateError::Core(CoreError::InvalidNaming { files })) => {
                assert_eq!(files, vec!["bad_name.sql"]);
            }
            other => panic!("expected InvalidNaming, got {other:?}"),
        }
        assert!(!fx.table_exists("car")?);
        assert!(fx.history()?.is_empty());
        Ok(())
    }

    #[test]
    fn applies_in_version_order_not_name_order() -> anyhow::Result<()> {
        let fx = Fixture::new(&[
            ("V10__add_driver_fk.sql", "ALTER TABLE car ADD COLUMN driver_id INTEGER;"),
            ("V2__create_car.sql", CAR),
        ])?;
        let report = fx.migrator().run()?;
        let versions: Vec<_> = report.applied.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![2, 10]);
        Ok(())
    }

    #[test]
    fn held_lock_blocks_a_run() -> anyhow::Result<()> {
        let fx = Fixture::new(&[("V1__create_car.sql", CAR)])?;
        let lock = MigrationLock::acquire(&fx.conn, "other-host")?;

        assert!(matches!(fx.migrator().run(), Err(MigrateError::LockHeld { .. })));
        assert!(!fx.table_exists("car")?);

        lock.release()?;
        assert_eq!(fx.migrator().run()?.applied.len(), 1);
        Ok(())
    }

    #[test]
    fn plan_only_leaves_a_fresh_database_untouched() -> anyhow::Result<()> {
        let fx = Fixture::new(&[("V1__create_car.sql", CAR)])?;
        let plan = fx.migrator().plan_only()?;
        assert_eq!(plan.pending.len(), 1);
        assert!(!fx.table_exists("car")?);
        assert!(!fx.table_exists(HISTORY_TABLE)?);
        assert!(!fx.table_exists(LOCK_TABLE)?);

        fx.migrator().status()?;
        fx.migrator().history()?;
        assert!(!fx.table_exists(HISTORY_TABLE)?);
        assert!(!fx.table_exists(LOCK_TABLE)?);
        Ok(())
    }

    #[test]
    fn file_with_its_own_transaction_runs_unwrapped() -> anyhow::Result<()> {
        let fx = Fixture::new(&[
            ("V1__tx.sql", "BEGIN;\nCREATE TABLE t (id INTEGER);\nCOMMIT;"),
            ("V2__create_driver.sql", DRIVER),
        ])?;

        let report = fx.migrator().run()?;
        assert_eq!(report.applied.len(), 2);
        assert!(fx.table_exists("t")?);
        assert!(fx.table_exists("driver")?);

        let history = fx.history()?;
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| m.success));
        Ok(())
    }

    #[test]
    fn inline_commit_ending_the_wrapper_still_records_success() -> anyhow::Result<()> {
        let fx = Fixture::new(&[
            ("V1__c.sql", "CREATE TABLE c (id INTEGER); COMMIT;"),
            ("V2__create_driver.sql", DRIVER),
        ])?;

        let report = fx.migrator().run()?;
        assert_eq!(report.applied.len(), 2);
        assert!(fx.table_exists("c")?);
        assert!(fx.table_exists("driver")?);
        assert!(fx.conn.is_autocommit());

        let outcomes: Vec<_> =
            fx.history()?.into_iter().map(|m| (m.file_name, m.success)).collect();
        assert_eq!(
            outcomes,
            vec![("V1__c.sql".to_string(), true), ("V2__create_driver.sql".to_string(), true)]
        );
        Ok(())
    }

    #[test]
    fn status_lists_overflowing_versions_as_invalid() -> anyhow::Result<()> {
        let fx = Fixture::new(&[
            ("V1__create_car.sql", CAR),
            ("V99999999999999999999__huge.sql", DRIVER),
        ])?;

        let status = fx.migrator().status()?;
        assert_eq!(status.invalid_names, vec!["V99999999999999999999__huge.sql"]);
        assert_eq!(status.pending.len(), 1);
        assert!(!status.is_up_to_date());
        Ok(())
    }

    #[test]
    fn status_reports_problems_instead_of_failing() -> anyhow::Result<()> {
        let fx = Fixture::new(&[("V1__create_car.sql", CAR)])?;
        fx.migrator().run()?;
        fx.write("V1__create_car.sql", "-- edited")?;
        fx.write("V2__create_driver.sql", DRIVER)?;
        fx.write("notes.txt", "todo")?;

        let status = fx.migrator().status()?;
        assert_eq!(status.installed.len(), 1);
        assert_eq!(status.pending.len(), 1);
        assert_eq!(status.tampered.len(), 1);
        assert_eq!(status.invalid_names, vec!["notes.txt"]);
        assert!(!status.is_up_to_date());
        Ok(())
    }
}
