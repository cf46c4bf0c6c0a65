//! # Database Migration Management
//!
//! Applies the `migrations/*.sql` files in filename order. Each file runs in
//! its own transaction and is recorded in `_routeplane_migrations` together
//! with a checksum of its content.

use crate::errors::{Result, RouteplaneError};
use crate::storage::pool::DbPool;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const TRACKING_TABLE_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS _routeplane_migrations (
        version BIGINT PRIMARY KEY,
        description TEXT NOT NULL,
        checksum BYTEA NOT NULL,
        execution_time BIGINT NOT NULL,
        installed_on TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
"#;

/// Applied migration as recorded in the tracking table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub version: i64,
    pub description: String,
    pub installed_on: chrono::DateTime<chrono::Utc>,
    pub execution_time: i64,
    pub checksum: Vec<u8>,
}

/// A migration file found on disk
#[derive(Debug, Clone)]
struct MigrationFile {
    version: i64,
    name: String,
    sql: String,
}

/// `./migrations`, falling back to the directory next to the executable
fn migrations_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let local = cwd.join("migrations");
    if local.exists() {
        return local;
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("migrations")
}

fn load_migrations() -> Result<Vec<MigrationFile>> {
    load_migrations_from(&migrations_dir())
}

fn load_migrations_from(dir: &Path) -> Result<Vec<MigrationFile>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        RouteplaneError::config(format!(
            "Failed to read migrations directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| RouteplaneError::config(format!("Failed to read migration entry: {}", e)))?
            .path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| {
                RouteplaneError::config(format!("Invalid migration filename: {}", path.display()))
            })?
            .to_string();
        let sql = std::fs::read_to_string(&path).map_err(|e| {
            RouteplaneError::config(format!("Failed to read migration {}: {}", path.display(), e))
        })?;
        files.push(MigrationFile { version: extract_version_from_filename(&name)?, name, sql });
    }

    if files.is_empty() {
        return Err(RouteplaneError::config(format!(
            "No migration files found in {}",
            dir.display()
        )));
    }

    files.sort_by_key(|file| file.version);
    info!(count = files.len(), dir = %dir.display(), "Loaded migration files");
    Ok(files)
}

/// Run all pending database migrations
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::query(TRACKING_TABLE_DDL).execute(pool).await.map_err(|e| {
        RouteplaneError::database(e, "Failed to create migration tracking table")
    })?;

    let applied = applied_versions(pool).await?;
    let mut ran = 0;

    for file in load_migrations()? {
        if applied.contains(&file.version) {
            continue;
        }
        apply_migration(pool, &file).await?;
        ran += 1;
    }

    if ran > 0 {
        info!(count = ran, "Database migrations completed");
    } else {
        info!("No pending migrations");
    }
    Ok(())
}

async fn apply_migration(pool: &DbPool, file: &MigrationFile) -> Result<()> {
    info!(version = file.version, name = %file.name, "Running migration");
    let started = std::time::Instant::now();

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| RouteplaneError::database(e, "Failed to start migration transaction"))?;

    // raw_sql allows multi-statement files
    sqlx::raw_sql(&file.sql).execute(&mut *tx).await.map_err(|e| {
        error!(error = %e, migration = %file.name, "Migration failed");
        RouteplaneError::database(e, format!("Migration failed: {}", file.name))
    })?;

    let execution_time = started.elapsed().as_millis() as i64;
    sqlx::query(
        "INSERT INTO _routeplane_migrations (version, description, checksum, execution_time, installed_on) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(file.version)
    .bind(&file.name)
    .bind(calculate_checksum(&file.sql))
    .bind(execution_time)
    .bind(chrono::Utc::now())
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        error!(error = %e, migration = %file.name, "Failed to record migration");
        RouteplaneError::database(e, format!("Failed to record migration: {}", file.name))
    })?;

    tx.commit()
        .await
        .map_err(|e| RouteplaneError::database(e, "Failed to commit migration transaction"))?;

    info!(version = file.version, execution_time_ms = execution_time, "Migration completed");
    Ok(())
}

fn is_missing_tracking_table(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err)
        if db_err.message().contains("relation \"_routeplane_migrations\" does not exist"))
}

async fn applied_versions(pool: &DbPool) -> Result<Vec<i64>> {
    match sqlx::query("SELECT version FROM _routeplane_migrations ORDER BY version")
        .fetch_all(pool)
        .await
    {
        Ok(rows) => Ok(rows.into_iter().map(|row| row.get::<i64, _>("version")).collect()),
        Err(e) if is_missing_tracking_table(&e) => Ok(Vec::new()),
        Err(e) => Err(RouteplaneError::database(e, "Failed to get applied migrations")),
    }
}

/// Version prefix of a `NNNN_description` filename
fn extract_version_from_filename(filename: &str) -> Result<i64> {
    filename
        .split('_')
        .next()
        .and_then(|prefix| prefix.parse::<i64>().ok())
        .ok_or_else(|| {
            RouteplaneError::config(format!("Invalid version in migration filename: {}", filename))
        })
}

fn calculate_checksum(content: &str) -> Vec<u8> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish().to_le_bytes().to_vec()
}

/// Check that the applied set equals the bundled set
pub async fn validate_migrations(pool: &DbPool) -> Result<bool> {
    let expected: Vec<i64> = load_migrations()?.iter().map(|file| file.version).collect();
    let applied = applied_versions(pool).await?;

    if let Some(missing) = expected.iter().find(|v| !applied.contains(v)) {
        warn!(version = missing, "Missing migration");
        return Ok(false);
    }
    if let Some(unexpected) = applied.iter().find(|v| !expected.contains(v)) {
        warn!(version = unexpected, "Unexpected migration found");
        return Ok(false);
    }
    Ok(true)
}

/// Highest applied migration version, 0 when none
pub async fn get_migration_version(pool: &DbPool) -> Result<i64> {
    Ok(applied_versions(pool).await?.into_iter().max().unwrap_or(0))
}

pub async fn list_applied_migrations(pool: &DbPool) -> Result<Vec<MigrationInfo>> {
    match sqlx::query("SELECT version, description, checksum, execution_time, installed_on FROM _routeplane_migrations ORDER BY version")
        .fetch_all(pool)
        .await
    {
        Ok(rows) => Ok(rows
            .into_iter()
            .map(|row| MigrationInfo {
                version: row.get("version"),
                description: row.get("description"),
                installed_on: row.get("installed_on"),
                execution_time: row.get("execution_time"),
                checksum: row.get("checksum"),
            })
            .collect()),
        Err(e) if is_missing_tracking_table(&e) => Ok(Vec::new()),
        Err(e) => Err(RouteplaneError::database(e, "Failed to list applied migrations")),
    }
}
