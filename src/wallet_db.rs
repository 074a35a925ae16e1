use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{db_err, io_err, DashboardError, Result};

pub const DEFAULT_WALLET_DB_RELATIVE_PATH: &str = "wallet/wallet.db";

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_init.sql",
        include_str!("../db/migrations/0001_init.sql"),
    ),
    (
        "0002_nav_snapshots.sql",
        include_str!("../db/migrations/0002_nav_snapshots.sql"),
    ),
];

const REQUIRED_TABLES: &[&str] = &[
    "account_value",
    "account_history",
    "nav_snapshots",
    "import_jobs",
];

#[derive(Debug, Serialize)]
pub struct WalletDbStatus {
    pub db_path: String,
    pub exists: bool,
    pub migration_files: Vec<String>,
    pub applied_versions: Vec<String>,
    pub pending_versions: Vec<String>,
    pub schema_migrations_table_exists: bool,
    pub ready: bool,
}

#[derive(Debug, Serialize)]
pub struct WalletDbMigrateResult {
    pub db_path: String,
    pub created: bool,
    pub applied_now: Vec<String>,
    pub skipped: Vec<String>,
    pub applied_total: usize,
    pub pending_total: usize,
}

#[cfg(feature = "desktop")]
pub(crate) fn resolve_wallet_db_path(app: &tauri::AppHandle) -> Result<PathBuf> {
    use tauri::Manager;

    let base = app
        .path()
        .app_local_data_dir()
        .map_err(|e| DashboardError::Config(format!("cannot resolve app_local_data_dir: {e}")))?;
    Ok(base.join(DEFAULT_WALLET_DB_RELATIVE_PATH))
}

#[cfg(feature = "desktop")]
pub(crate) fn resolve_config_dir(app: &tauri::AppHandle) -> Result<PathBuf> {
    use tauri::Manager;

    app.path()
        .app_config_dir()
        .map_err(|e| DashboardError::Config(format!("cannot resolve app_config_dir: {e}")))
}

/// Opens an existing database with foreign keys on. A missing file is a
/// `NotFound`, not an empty database.
pub(crate) fn open_existing(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        return Err(DashboardError::NotFound(format!(
            "database does not exist: {}",
            db_path.to_string_lossy()
        )));
    }
    let conn = Connection::open(db_path).map_err(db_err("open database"))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(db_err("enable foreign_keys"))?;
    Ok(conn)
}

/// Fails with a hint to migrate when any wallet table is missing.
pub(crate) fn ensure_schema_ready(conn: &Connection) -> Result<()> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table'")
        .map_err(db_err("inspect tables"))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(db_err("inspect tables"))?;
    let mut names = HashSet::new();
    for row in rows {
        names.insert(row.map_err(db_err("inspect tables"))?);
    }
    let missing = REQUIRED_TABLES
        .iter()
        .filter(|t| !names.contains(**t))
        .copied()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(DashboardError::Config(format!(
            "database is missing tables: {}; run migrations first",
            missing.join(", ")
        )));
    }
    Ok(())
}

fn ensure_schema_migrations_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )
}

fn has_schema_migrations_table(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_migrations')",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|v| v != 0)
}

fn load_applied_versions(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version ASC")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut versions = Vec::new();
    for row in rows {
        versions.push(row?);
    }
    Ok(versions)
}

pub fn inspect_status_at_path(db_path: &Path) -> Result<WalletDbStatus> {
    let migration_files = MIGRATIONS
        .iter()
        .map(|(v, _)| (*v).to_string())
        .collect::<Vec<_>>();
    if !db_path.exists() {
        return Ok(WalletDbStatus {
            db_path: db_path.to_string_lossy().to_string(),
            exists: false,
            migration_files: migration_files.clone(),
            applied_versions: Vec::new(),
            pending_versions: migration_files,
            schema_migrations_table_exists: false,
            ready: false,
        });
    }

    let conn = Connection::open(db_path).map_err(db_err("open database"))?;
    let schema_table_exists =
        has_schema_migrations_table(&conn).map_err(db_err("check schema_migrations"))?;
    let applied_versions = if schema_table_exists {
        load_applied_versions(&conn).map_err(db_err("read schema_migrations"))?
    } else {
        Vec::new()
    };
    let applied_set = applied_versions.iter().cloned().collect::<HashSet<_>>();
    let pending_versions = migration_files
        .iter()
        .filter(|v| !applied_set.contains(*v))
        .cloned()
        .collect::<Vec<_>>();

    Ok(WalletDbStatus {
        db_path: db_path.to_string_lossy().to_string(),
        exists: true,
        migration_files,
        applied_versions,
        ready: pending_versions.is_empty(),
        pending_versions,
        schema_migrations_table_exists: schema_table_exists,
    })
}

pub fn apply_embedded_migrations(db_path: &Path) -> Result<WalletDbMigrateResult> {
    let created = !db_path.exists();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err("create database directory"))?;
    }

    let mut conn = Connection::open(db_path).map_err(db_err("open database"))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(db_err("enable foreign_keys"))?;
    ensure_schema_migrations_table(&conn).map_err(db_err("create schema_migrations"))?;

    let already = load_applied_versions(&conn)
        .map_err(db_err("read schema_migrations"))?
        .into_iter()
        .collect::<HashSet<_>>();

    let mut applied_now = Vec::new();
    let mut skipped = Vec::new();
    for (version, sql) in MIGRATIONS {
        if already.contains(*version) {
            skipped.push((*version).to_string());
            continue;
        }
        let tx = conn.transaction().map_err(db_err("begin migration"))?;
        tx.execute_batch(sql).map_err(db_err("apply migration"))?;
        tx.execute(
            "INSERT INTO schema_migrations(version) VALUES (?1)",
            [*version],
        )
        .map_err(db_err("record migration"))?;
        tx.commit().map_err(db_err("commit migration"))?;
        log::info!("applied migration {version} to {}", db_path.to_string_lossy());
        applied_now.push((*version).to_string());
    }

    let applied_total = load_applied_versions(&conn)
        .map_err(db_err("read schema_migrations"))?
        .len();

    Ok(WalletDbMigrateResult {
        db_path: db_path.to_string_lossy().to_string(),
        created,
        applied_now,
        skipped,
        applied_total,
        pending_total: MIGRATIONS.len().saturating_sub(applied_total),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use uuid::Uuid;

    fn create_temp_test_db() -> PathBuf {
        std::env::temp_dir().join(format!(
            "wallet_db_test_{}_{}.db",
            std::process::id(),
            Uuid::new_v4()
        ))
    }

    #[test]
    fn migrate_is_idempotent_and_status_reports_ready() {
        let db_path = create_temp_test_db();

        let before = inspect_status_at_path(&db_path).expect("status before");
        assert!(!before.exists);
        assert_eq!(before.pending_versions.len(), MIGRATIONS.len());

        let first = apply_embedded_migrations(&db_path).expect("first migrate");
        assert!(first.created);
        assert_eq!(first.applied_now.len(), MIGRATIONS.len());
        assert_eq!(first.pending_total, 0);

        let second = apply_embedded_migrations(&db_path).expect("second migrate");
        assert!(!second.created);
        assert!(second.applied_now.is_empty());
        assert_eq!(second.skipped.len(), MIGRATIONS.len());

        let status = inspect_status_at_path(&db_path).expect("status after");
        assert!(status.ready);
        assert!(status.schema_migrations_table_exists);

        let conn = open_existing(&db_path).expect("open");
        ensure_schema_ready(&conn).expect("schema ready");

        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn missing_database_is_not_found() {
        let err = open_existing(&create_temp_test_db()).expect_err("missing db");
        assert_eq!(err.category(), "NO_DATA_ERROR");
    }

    #[test]
    fn unmigrated_database_is_rejected() {
        let db_path = create_temp_test_db();
        let conn = Connection::open(&db_path).expect("create empty db");
        let err = ensure_schema_ready(&conn).expect_err("no tables");
        assert!(err.to_string().contains("account_value"));
        drop(conn);
        let _ = fs::remove_file(&db_path);
    }
}
