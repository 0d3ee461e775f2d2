use rusqlite::Connection;

use crate::error::StockPulseError;

/// The persisted schema version.
///
/// Stored in SQLite's `user_version` header field, so it lives in the store
/// file itself and is written transactionally together with whatever else the
/// enclosing transaction changes. A fresh file reads as 0.
pub struct SchemaVersion;

impl SchemaVersion {
    pub fn read(conn: &Connection) -> Result<u32, StockPulseError> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        u32::try_from(version).map_err(|_| {
            StockPulseError::Error(format!("Invalid schema version in store: {}", version))
        })
    }

    pub fn write(conn: &Connection, version: u32) -> Result<(), StockPulseError> {
        // PRAGMA arguments cannot be bound as parameters
        conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        Ok(())
    }
}
