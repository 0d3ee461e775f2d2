use log::{info, warn};
use rusqlite::Connection;

use crate::categories::DEFAULT_CATEGORY;
use crate::db::Database;
use crate::error::StockPulseError;

pub const UPGRADE_1_TO_2_PRE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL
);

ALTER TABLE items ADD COLUMN category_id INTEGER REFERENCES categories(id);
"#;

pub fn category_column_exists(conn: &Connection) -> Result<bool, StockPulseError> {
    Database::has_column(conn, "items", "category_id")
}

pub fn migrate_1_to_2(conn: &Connection) -> Result<(), StockPulseError> {
    let resolved = resolve_category_labels(conn)?;
    info!("Resolved category references for {} item(s)", resolved);
    Ok(())
}

/// Points every item whose `category_id` is NULL or dangling at the category
/// named by its legacy `kategorie` label, creating categories as needed.
///
/// Labels are trimmed; a blank label files the item under the default
/// category. Existing categories win over new inserts. Fails if any item is
/// still unresolved afterwards.
pub(crate) fn resolve_category_labels(conn: &Connection) -> Result<usize, StockPulseError> {
    let labels: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT kategorie FROM items
             WHERE category_id IS NULL
                OR category_id NOT IN (SELECT id FROM categories)",
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, Option<String>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(|label| label.unwrap_or_default()).collect()
    };

    let mut resolved = 0;

    for label in &labels {
        let name = match label.trim() {
            "" => DEFAULT_CATEGORY,
            trimmed => trimmed,
        };

        conn.execute("INSERT OR IGNORE INTO categories (name) VALUES (?)", [name])?;
        let category_id: i64 =
            conn.query_row("SELECT id FROM categories WHERE name = ?", [name], |row| {
                row.get(0)
            })?;

        resolved += conn.execute(
            "UPDATE items SET category_id = ?1
             WHERE IFNULL(kategorie, '') = ?2
               AND (category_id IS NULL OR category_id NOT IN (SELECT id FROM categories))",
            rusqlite::params![category_id, label],
        )?;
    }

    let unresolved: i64 = conn.query_row(
        "SELECT COUNT(*) FROM items
         WHERE category_id IS NULL OR category_id NOT IN (SELECT id FROM categories)",
        [],
        |row| row.get(0),
    )?;

    if unresolved > 0 {
        warn!("{} item(s) left without a category", unresolved);
        return Err(StockPulseError::Error(format!(
            "Category backfill left {} item(s) unresolved",
            unresolved
        )));
    }

    Ok(resolved)
}
