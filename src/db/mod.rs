pub mod migration;
pub mod schema;
pub mod version;

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::error::StockPulseError;
use migration::Migrator;

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Handle to the single store file.
///
/// The pool is capped at one connection: every logical operation checks the
/// connection out, runs, and hands it back. A `Database` only exists once
/// the schema is current, because `open` runs the migration engine before
/// returning.
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl Database {
    const BUSY_TIMEOUT_MS: u32 = 5000;
    const POOL_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn open(path: &Path) -> Result<Self, StockPulseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|c| {
            c.execute_batch(&format!(
                "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
                Self::BUSY_TIMEOUT_MS
            ))
        });

        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Self::POOL_TIMEOUT)
            .build(manager)?;

        debug!("Database opened at: {}", path.display());

        let db = Database {
            pool,
            path: path.to_owned(),
        };

        {
            let conn = db.get_connection()?;
            let report = Migrator::ensure_current_schema(&conn)?;
            if report.applied.is_empty() {
                debug!("Schema is current at version {}", report.final_version);
            } else {
                info!(
                    "Upgraded schema from version {} to {}",
                    report.initial_version, report.final_version
                );
            }
        }

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_connection(&self) -> Result<DbConnection, StockPulseError> {
        Ok(self.pool.get()?)
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction on `conn`.
    ///
    /// Commits when `f` returns `Ok`, rolls back on `Err`. Nested use is not
    /// supported: `conn` must be in autocommit mode.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, StockPulseError>
    where
        F: FnOnce(&Connection) -> Result<T, StockPulseError>,
    {
        if !conn.is_autocommit() {
            return Err(StockPulseError::Error(
                "immediate_transaction called while a transaction is already open".into(),
            ));
        }

        conn.execute_batch("BEGIN IMMEDIATE")?;

        match f(conn) {
            Ok(value) => match conn.execute_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(e) => {
                    Self::rollback_quietly(conn);
                    Err(e.into())
                }
            },
            Err(e) => {
                Self::rollback_quietly(conn);
                Err(e)
            }
        }
    }

    fn rollback_quietly(conn: &Connection) {
        if conn.is_autocommit() {
            return;
        }
        if let Err(rb_err) = conn.execute_batch("ROLLBACK") {
            error!("Rollback failed: {}", rb_err);
        }
    }

    pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, StockPulseError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>, StockPulseError> {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?)")?;
        let names = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, StockPulseError> {
        Ok(Self::column_names(conn, table)?
            .iter()
            .any(|name| name == column))
    }
}
