use log::info;
use rusqlite::Connection;

use crate::db::Database;
use crate::error::StockPulseError;

// First-generation search index. Stores its own copy of the text columns;
// superseded by `item_search` in version 7.
pub const UPGRADE_2_TO_3_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS items_fts USING fts5(
    name, kategorie, ort, notiz,
    tokenize = 'porter'
);
"#;

pub fn search_index_exists(conn: &Connection) -> Result<bool, StockPulseError> {
    Ok(Database::table_exists(conn, "items_fts")? || Database::table_exists(conn, "item_search")?)
}

pub fn migrate_2_to_3(conn: &Connection) -> Result<(), StockPulseError> {
    // Some stores of the first layout already name the location column `shop`
    let location = if Database::has_column(conn, "items", "ort")? {
        "ort"
    } else {
        "shop"
    };

    let indexed = conn.execute(
        &format!(
            "INSERT INTO items_fts (rowid, name, kategorie, ort, notiz)
             SELECT id, name, kategorie, {}, notiz FROM items
             WHERE name IS NOT NULL",
            location
        ),
        [],
    )?;

    info!("Indexed {} item(s) for search", indexed);
    Ok(())
}
