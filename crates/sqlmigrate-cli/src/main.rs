use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rusqlite::Connection;
use serde_json::Value;
use sqlmigrate_store_sqlite::{force_release, Migrator, MigratorConfig};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "sqlmigrate")]
#[command(about = "Forward-only SQL schema migrations for SQLite")]
struct Cli {
    #[arg(long, env = "SQLMIGRATE_DB", default_value = "./sqlmigrate.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "SQLMIGRATE_DIR", default_value = "./migrations")]
    dir: PathBuf,

    /// Identity recorded with every attempt; falls back to $USER, then "unknown".
    #[arg(long, env = "SQLMIGRATE_INSTALLED_BY")]
    installed_by: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending migrations.
    Migrate(MigrateArgs),
    /// Show installed, pending, failed and tampered migrations.
    Status,
    /// Check file names and installed checksums without applying anything.
    Verify,
    /// List every recorded attempt.
    History,
    /// Clear a lock left behind by a crashed migrator.
    Unlock,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Run migrations outside a transaction (for files that manage their own).
    #[arg(long, default_value_t = false)]
    no_transaction: bool,
    #[arg(long, default_value_t = false)]
    no_lock: bool,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize tracing: {err}"))
}

fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    tracing::debug!(db = %path.display(), "opened sqlite database");
    Ok(conn)
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "data": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let conn = open_database(&cli.db)?;
    let installed_by = cli.installed_by.clone().or_else(|| std::env::var("USER").ok());
    let config = MigratorConfig::new(&cli.dir).with_installed_by(installed_by.as_deref());

    match cli.command {
        Command::Migrate(args) => run_migrate(&args, &conn, config),
        Command::Status => run_status(&Migrator::new(&conn, config)),
        Command::Verify => run_verify(&Migrator::new(&conn, config)),
        Command::History => run_history(&Migrator::new(&conn, config)),
        Command::Unlock => run_unlock(&conn),
    }
}

fn run_migrate(args: &MigrateArgs, conn: &Connection, config: MigratorConfig) -> Result<()> {
    let config = config.with_transactional(!args.no_transaction).with_lock(!args.no_lock);
    let dir = config.migrations_dir.clone();
    let mut migrator = Migrator::new(conn, config);

    if args.dry_run {
        let plan = migrator
            .plan_only()
            .with_context(|| format!("failed to plan migrations in {}", dir.display()))?;
        return emit_json(serde_json::json!({
            "dry_run": true,
            "already_installed": plan.installed_count,
            "would_apply": plan.pending,
            "retries": plan.failed_attempts
        }));
    }

    let report = migrator
        .run()
        .with_context(|| format!("failed to apply migrations from {}", dir.display()))?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "applied": report.applied,
        "already_installed": report.already_installed,
        "retried": report.retried,
        "duration_ms": report.duration_ms,
        "up_to_date": true
    }))
}

fn run_status(migrator: &Migrator<'_>) -> Result<()> {
    let status = migrator.status().context("failed to read migration status")?;
    let mut value = serde_json::to_value(&status).context("failed to serialize status")?;
    if let Value::Object(object) = &mut value {
        object.insert("up_to_date".to_string(), Value::Bool(status.is_up_to_date()));
    }
    emit_json(value)
}

fn run_verify(migrator: &Migrator<'_>) -> Result<()> {
    let verified = migrator.verify().context("migration history verification failed")?;
    emit_json(serde_json::json!({
        "verified": verified,
        "status": "ok"
    }))
}

fn run_history(migrator: &Migrator<'_>) -> Result<()> {
    let attempts = migrator.history().context("failed to read migration history")?;
    emit_json(serde_json::json!({ "attempts": attempts }))
}

fn run_unlock(conn: &Connection) -> Result<()> {
    let released = force_release(conn).context("failed to release migration lock")?;
    emit_json(serde_json::json!({
        "released": released.is_some(),
        "previous_holder": released
    }))
}
