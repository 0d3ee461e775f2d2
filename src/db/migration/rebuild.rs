use log::info;
use rusqlite::{Connection, OptionalExtension};

use crate::db::Database;
use crate::error::StockPulseError;

/// A destructive table rebuild for changes SQLite cannot make in place
/// (column renames on old engines, retyping, dropping columns with
/// constraints).
///
/// Sequence: create `staging` → populate from `table` → verify every row was
/// carried → drop `table` → rename `staging` to `table` → restore the
/// AUTOINCREMENT high-water mark. Must run inside the caller's transaction;
/// any error leaves the old table untouched once the transaction rolls back.
pub struct TableRebuild<'a> {
    pub table: &'a str,
    pub staging: &'a str,
    /// Creates `staging`.
    pub create_sql: &'a str,
    /// Copies every row of `table` into `staging`.
    pub populate_sql: &'a str,
    /// Runs after the rename (indexes).
    pub finish_sql: Option<&'a str>,
}

impl TableRebuild<'_> {
    pub fn run(&self, conn: &Connection) -> Result<usize, StockPulseError> {
        if conn.is_autocommit() {
            return Err(StockPulseError::Error(format!(
                "Rebuild of '{}' must run inside a transaction",
                self.table
            )));
        }

        let old_rows = row_count(conn, self.table)?;
        let old_seq = sequence_value(conn, self.table)?;

        conn.execute_batch(self.create_sql)?;
        conn.execute_batch(self.populate_sql)?;

        let new_rows = row_count(conn, self.staging)?;
        if new_rows != old_rows {
            return Err(StockPulseError::Error(format!(
                "Rebuild of '{}' copied {} of {} rows; aborting",
                self.table, new_rows, old_rows
            )));
        }

        conn.execute_batch(&format!(
            "DROP TABLE \"{table}\";
             ALTER TABLE \"{staging}\" RENAME TO \"{table}\";",
            table = self.table,
            staging = self.staging
        ))?;

        if let Some(seq) = old_seq {
            set_sequence_floor(conn, self.table, seq)?;
        }

        if let Some(sql) = self.finish_sql {
            conn.execute_batch(sql)?;
        }

        info!("Rebuilt table '{}' ({} rows)", self.table, new_rows);

        Ok(new_rows)
    }
}

pub fn row_count(conn: &Connection, table: &str) -> Result<usize, StockPulseError> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| {
        row.get(0)
    })?;
    Ok(count as usize)
}

/// Current AUTOINCREMENT high-water mark for `table`, if any.
pub fn sequence_value(conn: &Connection, table: &str) -> Result<Option<i64>, StockPulseError> {
    if !Database::table_exists(conn, "sqlite_sequence")? {
        return Ok(None);
    }
    let seq = conn
        .query_row(
            "SELECT MAX(seq) FROM sqlite_sequence WHERE name = ?",
            [table],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()?
        .flatten();
    Ok(seq)
}

/// Raises the AUTOINCREMENT high-water mark of `table` to at least `floor`.
///
/// `sqlite_sequence` has no unique constraint on `name`, so this updates the
/// existing row rather than using INSERT OR REPLACE.
pub fn set_sequence_floor(conn: &Connection, table: &str, floor: i64) -> Result<(), StockPulseError> {
    if !Database::table_exists(conn, "sqlite_sequence")? {
        return Err(StockPulseError::Error(format!(
            "Cannot set sequence for '{}': no AUTOINCREMENT table exists",
            table
        )));
    }

    let updated = conn.execute(
        "UPDATE sqlite_sequence SET seq = MAX(seq, ?1) WHERE name = ?2",
        rusqlite::params![floor, table],
    )?;

    if updated == 0 {
        conn.execute(
            "INSERT INTO sqlite_sequence (name, seq) VALUES (?1, ?2)",
            rusqlite::params![table, floor],
        )?;
    }
    Ok(())
}
