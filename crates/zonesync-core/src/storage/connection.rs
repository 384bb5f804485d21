//! Connection management for the zone database
//!
//! One SQLite connection per store, guarded by a mutex: concurrent callers
//! queue on the lock instead of getting parallel access. The connection is
//! tuned for concurrent readers (WAL, bounded busy wait, NORMAL sync) and
//! migrated to the latest schema before it is handed out.

use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::{StorageError, StorageResult};
use super::migrations::{self, MigrationContext};
use crate::config::Config;

/// Settings for opening the zone database
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub path: PathBuf,
    pub busy_timeout: Duration,
    pub migration: MigrationContext,
}

impl ConnectionOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_millis(5_000),
            migration: MigrationContext::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            path: config.database_path(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            migration: MigrationContext {
                default_sync_group: config.sync_group.clone(),
            },
        }
    }
}

/// Owner of the single live database connection
#[derive(Debug)]
pub struct ConnectionManager {
    options: ConnectionOptions,
    conn: Mutex<Option<Connection>>,
}

impl ConnectionManager {
    /// Open the database, apply pragmas and run pending migrations
    ///
    /// A migration failure is returned to the caller; the startup path
    /// decides whether to fall back to another backend.
    pub fn open(options: ConnectionOptions) -> StorageResult<Self> {
        let conn = establish(&options)?;
        Ok(Self {
            options,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Run `f` against the live connection, reconnecting first if it was closed
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut guard = self.lock();
        if guard.is_none() {
            debug!("Connection closed, reconnecting to {:?}", self.options.path);
            *guard = Some(establish(&self.options)?);
        }
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(StorageError::Unavailable(
                "database connection is closed".to_string(),
            )),
        }
    }

    /// Drop the current connection and open a fresh one
    pub fn reconnect(&self) -> StorageResult<()> {
        let mut guard = self.lock();
        if let Some(old) = guard.take() {
            if let Err((_, e)) = old.close() {
                warn!("Error closing database connection: {}", e);
            }
        }
        *guard = Some(establish(&self.options)?);
        Ok(())
    }

    /// Whether a connection is currently held
    pub fn is_available(&self) -> bool {
        self.lock().is_some()
    }

    /// Close the connection; the next use reconnects
    pub fn close(&self) {
        if let Some(conn) = self.lock().take() {
            match conn.close() {
                Ok(()) => debug!("Closed database {:?}", self.options.path),
                Err((_, e)) => warn!("Error closing database connection: {}", e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.options.path
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn establish(options: &ConnectionOptions) -> StorageResult<Connection> {
    if let Some(parent) = options.path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let mut conn = Connection::open_with_flags(&options.path, flags)?;
    apply_pragmas(&conn, options.busy_timeout);

    let applied = migrations::run_migrations(&mut conn, &options.migration)?;
    if !applied.is_empty() {
        info!(
            "Opened {:?} and applied migrations {:?}",
            options.path, applied
        );
    }
    Ok(conn)
}

/// Pragma failures only degrade performance, so they are logged and ignored
fn apply_pragmas(conn: &Connection, busy_timeout: Duration) {
    if let Err(e) = conn.execute_batch("PRAGMA journal_mode = WAL;") {
        warn!("Could not enable WAL journal mode: {}", e);
    }
    if let Err(e) = conn.busy_timeout(busy_timeout) {
        warn!("Could not set busy timeout: {}", e);
    }
    if let Err(e) = conn.execute_batch("PRAGMA synchronous = NORMAL;") {
        warn!("Could not set synchronous mode: {}", e);
    }
}
