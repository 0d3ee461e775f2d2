use log::info;
use rusqlite::Connection;

use crate::db::migration::rebuild::{sequence_value, set_sequence_floor};
use crate::error::StockPulseError;

/// First id handed out once the floor is in place.
pub const FIRST_ITEM_ID: i64 = 100_000;

fn max_item_id(conn: &Connection) -> Result<Option<i64>, StockPulseError> {
    Ok(conn.query_row("SELECT MAX(id) FROM items", [], |row| row.get(0))?)
}

pub fn id_floor_in_place(conn: &Connection) -> Result<bool, StockPulseError> {
    let seq = sequence_value(conn, "items")?.unwrap_or(0);
    let max_id = max_item_id(conn)?.unwrap_or(0);
    Ok(seq >= FIRST_ITEM_ID - 1 || max_id >= FIRST_ITEM_ID)
}

pub fn migrate_3_to_4(conn: &Connection) -> Result<(), StockPulseError> {
    match max_item_id(conn)? {
        Some(max_id) if max_id >= FIRST_ITEM_ID => {}
        _ => {
            set_sequence_floor(conn, "items", FIRST_ITEM_ID - 1)?;
            info!("New item ids now start at {}", FIRST_ITEM_ID);
        }
    }
    Ok(())
}
