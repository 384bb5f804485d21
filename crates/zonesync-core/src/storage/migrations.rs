//! Versioned schema migrations for the zone database
//!
//! The `schema_version` ledger records every applied version. Migrations
//! newer than the highest recorded version run in ascending order, each in
//! its own transaction; the first failure stops the run and leaves the
//! database at the last fully-applied version.
//!
//! The ledger table itself is created lazily, together with the first
//! migration that succeeds, so a database created by an older build without
//! a ledger starts from version 0 and replays every (idempotent) step.

use rusqlite::{params, Connection, Transaction};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Highest schema version known to this build
pub const LATEST_VERSION: i64 = 6;

/// Columns of `areas` after every migration, in table order
const AREA_COLUMNS: &str = "id, global_id, name, path, color_r, color_g, color_b, color_a, \
     hide, owner_id, created_at, updated_at, sync_version, sync_status, last_sync_at, \
     deleted, zone_sync";

/// Values some migrations need from configuration
#[derive(Debug, Clone, Default)]
pub struct MigrationContext {
    /// Sync group stamped onto zones that have none (version 5)
    pub default_sync_group: Option<String>,
}

/// Errors raised while migrating
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Failed to read schema version ledger: {0}")]
    Ledger(#[source] rusqlite::Error),

    #[error("Migration {version} ({description}) failed: {source}")]
    Failed {
        version: i64,
        description: &'static str,
        #[source]
        source: rusqlite::Error,
    },
}

type ApplyFn = fn(&Transaction<'_>, &MigrationContext) -> rusqlite::Result<()>;

struct Migration {
    version: i64,
    description: &'static str,
    apply: ApplyFn,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 2,
        description: "create zone tables",
        apply: create_tables,
    },
    Migration {
        version: 3,
        description: "add icon data to slots",
        apply: add_slot_icons,
    },
    Migration {
        version: 4,
        description: "add sync group column",
        apply: add_sync_group,
    },
    Migration {
        version: 5,
        description: "backfill sync group",
        apply: backfill_sync_group,
    },
    Migration {
        version: 6,
        description: "drop uniqueness of global id",
        apply: relax_global_id,
    },
];

/// Highest applied version, 0 when the ledger does not exist yet
pub fn current_version(conn: &Connection) -> rusqlite::Result<i64> {
    if !ledger_exists(conn)? {
        return Ok(0);
    }
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Every version recorded in the ledger, ascending
pub fn applied_versions(conn: &Connection) -> rusqlite::Result<Vec<i64>> {
    if !ledger_exists(conn)? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare("SELECT version FROM schema_version ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(versions)
}

/// Apply every pending migration; returns the versions applied by this run
pub fn run_migrations(
    conn: &mut Connection,
    ctx: &MigrationContext,
) -> Result<Vec<i64>, MigrationError> {
    migrate_to(conn, ctx, LATEST_VERSION)
}

/// Apply pending migrations up to and including `target`
pub fn migrate_to(
    conn: &mut Connection,
    ctx: &MigrationContext,
    target: i64,
) -> Result<Vec<i64>, MigrationError> {
    let current = current_version(conn).map_err(MigrationError::Ledger)?;
    let mut applied = Vec::new();

    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > current && m.version <= target)
    {
        debug!(
            "Applying migration {}: {}",
            migration.version, migration.description
        );
        apply_one(conn, ctx, migration).map_err(|source| MigrationError::Failed {
            version: migration.version,
            description: migration.description,
            source,
        })?;
        applied.push(migration.version);
    }

    if !applied.is_empty() {
        info!(
            "Schema migrated from version {} to {}",
            current,
            applied.last().copied().unwrap_or(current)
        );
    }
    Ok(applied)
}

fn apply_one(
    conn: &mut Connection,
    ctx: &MigrationContext,
    migration: &Migration,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    (migration.apply)(&tx, ctx)?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![migration.version],
    )?;
    tx.commit()
}

fn ledger_exists(conn: &Connection) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

// ==================== Migration Steps ====================

fn create_tables(tx: &Transaction<'_>, _ctx: &MigrationContext) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS areas (
            id INTEGER PRIMARY KEY,
            global_id VARCHAR(64) UNIQUE,
            name VARCHAR(255) NOT NULL,
            path VARCHAR(255),
            color_r INTEGER DEFAULT 194,
            color_g INTEGER DEFAULT 194,
            color_b INTEGER DEFAULT 65,
            color_a INTEGER DEFAULT 56,
            hide INTEGER DEFAULT 0,
            owner_id VARCHAR(64),
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            sync_version INTEGER DEFAULT 1,
            sync_status VARCHAR(20) DEFAULT 'local',
            last_sync_at TIMESTAMP,
            deleted INTEGER DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS area_spaces (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            area_id INTEGER NOT NULL,
            grid_id BIGINT NOT NULL,
            begin_x INTEGER NOT NULL,
            begin_y INTEGER NOT NULL,
            end_x INTEGER NOT NULL,
            end_y INTEGER NOT NULL,
            FOREIGN KEY (area_id) REFERENCES areas(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS area_inputs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            area_id INTEGER NOT NULL,
            name VARCHAR(255) NOT NULL,
            type VARCHAR(50),
            FOREIGN KEY (area_id) REFERENCES areas(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS area_outputs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            area_id INTEGER NOT NULL,
            name VARCHAR(255) NOT NULL,
            type VARCHAR(50),
            th INTEGER,
            FOREIGN KEY (area_id) REFERENCES areas(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS area_specialisations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            area_id INTEGER NOT NULL,
            name VARCHAR(255) NOT NULL,
            subtype VARCHAR(255),
            FOREIGN KEY (area_id) REFERENCES areas(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_area_spaces_area_id ON area_spaces(area_id);
        "#,
    )
}

fn add_slot_icons(tx: &Transaction<'_>, _ctx: &MigrationContext) -> rusqlite::Result<()> {
    add_column(tx, "area_inputs", "icon_data", "TEXT")?;
    add_column(tx, "area_outputs", "icon_data", "TEXT")
}

fn add_sync_group(tx: &Transaction<'_>, _ctx: &MigrationContext) -> rusqlite::Result<()> {
    add_column(tx, "areas", "zone_sync", "VARCHAR(100)")
}

fn backfill_sync_group(tx: &Transaction<'_>, ctx: &MigrationContext) -> rusqlite::Result<()> {
    let Some(group) = ctx
        .default_sync_group
        .as_deref()
        .filter(|g| !g.trim().is_empty())
    else {
        debug!("No default sync group configured, nothing to backfill");
        return Ok(());
    };

    match tx.execute(
        "UPDATE areas SET zone_sync = ?1 WHERE zone_sync IS NULL OR zone_sync = ''",
        params![group],
    ) {
        Ok(updated) => debug!("Assigned sync group '{}' to {} zones", group, updated),
        Err(e) => warn!("Could not backfill sync group: {}", e),
    }
    Ok(())
}

/// Rebuild `areas` without the unique constraint on `global_id`
///
/// Foreign keys must stay off on this connection: with them on, dropping the
/// old table cascades into every child table.
fn relax_global_id(tx: &Transaction<'_>, _ctx: &MigrationContext) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        DROP TABLE IF EXISTS areas_new;
        CREATE TABLE areas_new (
            id INTEGER PRIMARY KEY,
            global_id VARCHAR(64),
            name VARCHAR(255) NOT NULL,
            path VARCHAR(255),
            color_r INTEGER DEFAULT 194,
            color_g INTEGER DEFAULT 194,
            color_b INTEGER DEFAULT 65,
            color_a INTEGER DEFAULT 56,
            hide INTEGER DEFAULT 0,
            owner_id VARCHAR(64),
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            sync_version INTEGER DEFAULT 1,
            sync_status VARCHAR(20) DEFAULT 'local',
            last_sync_at TIMESTAMP,
            deleted INTEGER DEFAULT 0,
            zone_sync VARCHAR(100)
        );
        "#,
    )?;
    tx.execute_batch(&format!(
        "INSERT INTO areas_new ({cols}) SELECT {cols} FROM areas;",
        cols = AREA_COLUMNS
    ))?;
    tx.execute_batch(
        r#"
        DROP TABLE areas;
        ALTER TABLE areas_new RENAME TO areas;
        CREATE INDEX IF NOT EXISTS idx_areas_global_id ON areas(global_id);
        "#,
    )
}

/// Add a column unless it is already there
fn add_column(
    tx: &Transaction<'_>,
    table: &str,
    column: &str,
    declaration: &str,
) -> rusqlite::Result<()> {
    if tx
        .prepare(&format!("SELECT {} FROM {} LIMIT 1", column, table))
        .is_ok()
    {
        debug!("Column {}.{} already present", table, column);
        return Ok(());
    }

    match tx.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table, column, declaration
    )) {
        Err(e) if e.to_string().to_lowercase().contains("duplicate column") => {
            debug!("Column {}.{} added concurrently", table, column);
            Ok(())
        }
        other => other,
    }
}
