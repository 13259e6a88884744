//! Shared `SQLite` handle.
//!
//! Every store in this crate (accounts, settings, session state, API
//! credentials) reads and writes through one [`Database`]. The bot loop and
//! the API daemon may each open their own handle on the same file; WAL mode
//! lets readers proceed while a writer holds the lock, and `busy_timeout`
//! makes a second writer wait instead of failing immediately.
//!
//! Writes that still lose a lock race (`SQLITE_BUSY` / `SQLITE_LOCKED` after
//! the busy timeout) are retried a bounded number of times by
//! [`Database::write`] and then surface as [`DbError::Contention`]. They are
//! never reported as success.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OpenFlags};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DatabaseConfig;

const CONNECTION_PRAGMAS: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
";

/// Errors from the shared database handle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A write kept losing the lock race and was abandoned.
    #[error("database busy: write abandoned after {attempts} attempts")]
    Contention {
        /// Number of attempts made, including the first.
        attempts: u32,
    },

    /// I/O error while preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Returns `true` if the failure was a lost lock race rather than a
    /// broken query or database.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

/// A cloneable handle to the shared `SQLite` connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    contention_retries: u32,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("contention_retries", &self.contention_retries)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens or creates the database described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// database cannot be opened.
    pub fn open(config: &DatabaseConfig) -> Result<Self, DbError> {
        Self::open_path(
            &config.path,
            config.busy_timeout(),
            config.contention_retries,
        )
    }

    /// Opens or creates a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// database cannot be opened.
    pub fn open_path(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
        contention_retries: u32,
    ) -> Result<Self, DbError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(CONNECTION_PRAGMAS)?;

        debug!(path = %path.display(), "opened database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
            contention_retries,
        })
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            contention_retries: 3,
        })
    }

    /// Returns the database file path, or `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Locks the connection.
    ///
    /// A poisoned lock is recovered: an interrupted `rusqlite` transaction
    /// rolls back when dropped, so the connection is still consistent.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a read-only operation.
    ///
    /// # Errors
    ///
    /// Returns the `SQLite` error produced by `op`.
    pub fn read<T>(&self, op: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T, DbError> {
        let conn = self.lock();
        op(&conn).map_err(DbError::from)
    }

    /// Runs a write operation, retrying it when it loses a lock race.
    ///
    /// `op` may run more than once, so it must not have side effects outside
    /// the database; each attempt should open its own transaction when it
    /// issues more than one statement.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Contention`] once the retry budget is spent, or the
    /// first non-contention `SQLite` error.
    pub fn write<T>(
        &self,
        mut op: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, DbError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = {
                let mut conn = self.lock();
                op(&mut conn)
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if is_contention(&e) => {
                    if attempts > self.contention_retries {
                        warn!(attempts, "database write abandoned after repeated contention");
                        return Err(DbError::Contention { attempts });
                    }
                    debug!(attempts, error = %e, "database busy, retrying write");
                    std::thread::sleep(backoff(attempts));
                },
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(10 * u64::from(attempt.min(10)))
}

/// Converts stored Unix seconds to a UTC timestamp.
#[must_use]
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Returns the column names of `table`.
pub(crate) fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info('{table}')"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Adds each `(column, definition)` missing from `table`.
///
/// Definitions must carry a default so existing rows stay valid.
pub(crate) fn ensure_columns(
    conn: &Connection,
    table: &str,
    columns: &[(&str, &str)],
) -> rusqlite::Result<()> {
    let existing = table_columns(conn, table)?;
    for (name, definition) in columns {
        if !existing.iter().any(|c| c == name) {
            debug!(table, column = name, "adding missing column");
            conn.execute(
                &format!("ALTER TABLE {table} ADD COLUMN {name} {definition}"),
                [],
            )?;
        }
    }
    Ok(())
}
