use rusqlite::Connection;

use crate::db::Database;
use crate::error::StockPulseError;

// The first store layout: one flat items table carrying the category label,
// a quantity counter and a free-text location.
pub const UPGRADE_0_TO_1_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    kategorie TEXT NOT NULL,
    anzahl INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    ort TEXT,
    notiz TEXT,
    datum_bestellt TEXT,
    datum_eingetroffen TEXT
);
"#;

pub fn items_table_exists(conn: &Connection) -> Result<bool, StockPulseError> {
    Database::table_exists(conn, "items")
}
