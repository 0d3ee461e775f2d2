use log::info;
use rusqlite::Connection;

use crate::db::Database;
use crate::error::StockPulseError;

pub const UPGRADE_5_TO_6_PRE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS stock_movements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id INTEGER REFERENCES items(id),
    movement_type TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    movement_date TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    reference_date TEXT,
    notes TEXT
);

CREATE INDEX IF NOT EXISTS idx_stock_movements_item ON stock_movements (item_id);
"#;

const OPENING_BALANCE_NOTE: &str = "Opening balance from item quantity";

pub fn ledger_exists(conn: &Connection) -> Result<bool, StockPulseError> {
    Database::table_exists(conn, "stock_movements")
}

/// Turns each item's quantity counter into opening ledger rows.
///
/// Ordered items get a single order row. Every other item gets a receipt for
/// its quantity, followed by an installation or defect row when its status
/// says the parts are no longer on hand. Items with a zero counter produce no
/// rows.
pub fn migrate_5_to_6(conn: &Connection) -> Result<(), StockPulseError> {
    let receipts = conn.execute(
        "INSERT INTO stock_movements (item_id, movement_type, quantity, reference_date, notes)
         SELECT id,
                CASE WHEN status = 'bestellt' THEN 'bestellung' ELSE 'eingang' END,
                anzahl,
                CASE WHEN status = 'bestellt' THEN datum_bestellt ELSE datum_eingetroffen END,
                ?1
         FROM items
         WHERE anzahl > 0
         ORDER BY id",
        [OPENING_BALANCE_NOTE],
    )?;

    let withdrawals = conn.execute(
        "INSERT INTO stock_movements (item_id, movement_type, quantity, reference_date, notes)
         SELECT id, status, anzahl, datum_eingetroffen, ?1
         FROM items
         WHERE anzahl > 0 AND status IN ('verbaut', 'defekt')
         ORDER BY id",
        [OPENING_BALANCE_NOTE],
    )?;

    info!(
        "Converted item quantities into {} ledger row(s)",
        receipts + withdrawals
    );
    Ok(())
}
