use rusqlite::Connection;

use crate::db::migration::rebuild::TableRebuild;
use crate::db::Database;
use crate::error::StockPulseError;

const CREATE_ITEMS_V5: &str = r#"
CREATE TABLE items_v5 (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    kategorie TEXT NOT NULL,
    category_id INTEGER REFERENCES categories(id),
    anzahl INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    shop TEXT,
    notiz TEXT,
    datum_bestellt TEXT,
    datum_eingetroffen TEXT
);
"#;

const POPULATE_ITEMS_V5: &str = r#"
INSERT INTO items_v5 (
    id, name, kategorie, category_id, anzahl, status, shop, notiz,
    datum_bestellt, datum_eingetroffen
)
SELECT id, name, kategorie, category_id, anzahl, status, ort, notiz,
       datum_bestellt, datum_eingetroffen
FROM items;
"#;

/// Stores created by later builds of the first layout already call the
/// column `shop`.
pub fn location_already_renamed(conn: &Connection) -> Result<bool, StockPulseError> {
    let columns = Database::column_names(conn, "items")?;
    let has = |name: &str| columns.iter().any(|c| c == name);
    Ok(has("shop") || !has("ort"))
}

pub fn migrate_4_to_5(conn: &Connection) -> Result<(), StockPulseError> {
    TableRebuild {
        table: "items",
        staging: "items_v5",
        create_sql: CREATE_ITEMS_V5,
        populate_sql: POPULATE_ITEMS_V5,
        finish_sql: None,
    }
    .run(conn)?;
    Ok(())
}
