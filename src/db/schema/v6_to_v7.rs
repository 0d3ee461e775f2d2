use log::{info, warn};
use rusqlite::Connection;

use crate::db::migration::rebuild::TableRebuild;
use crate::db::schema::v1_to_v2::resolve_category_labels;
use crate::db::Database;
use crate::error::StockPulseError;
use crate::items::ItemStatus;
use crate::ledger::MovementKind;
use crate::search::SearchIndex;
use crate::validate;

// The legacy search index was kept in sync by triggers on items. Sync is
// now done by the write path, so both go.
pub const UPGRADE_6_TO_7_PRE_SQL: &str = r#"
DROP TRIGGER IF EXISTS items_fts_insert;
DROP TRIGGER IF EXISTS items_fts_delete;
DROP TRIGGER IF EXISTS items_fts_update;
DROP TABLE IF EXISTS items_fts;
"#;

pub const UPGRADE_6_TO_7_POST_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_items_category ON items (category_id);
CREATE INDEX IF NOT EXISTS idx_stock_movements_item ON stock_movements (item_id);
"#;

const CREATE_ITEMS_V7: &str = r#"
CREATE TABLE items_v7 (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    category_id INTEGER NOT NULL REFERENCES categories(id),
    category_name TEXT NOT NULL,
    status TEXT NOT NULL,
    shop TEXT,
    note TEXT,
    ordered_on TEXT,
    arrived_on TEXT
);
"#;

const CREATE_MOVEMENTS_V7: &str = r#"
CREATE TABLE stock_movements_v7 (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id INTEGER NOT NULL REFERENCES items(id),
    kind TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    recorded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    reference_date TEXT,
    note TEXT
);
"#;

pub fn vocabulary_normalized(conn: &Connection) -> Result<bool, StockPulseError> {
    Database::has_column(conn, "items", "category_name")
}

pub fn migrate_6_to_7(conn: &Connection) -> Result<(), StockPulseError> {
    resolve_category_labels(conn)?;

    check_stored_values(conn, "items", "status", |s| {
        ItemStatus::from_stored(s).is_some()
    })?;
    check_stored_values(conn, "stock_movements", "movement_type", |s| {
        MovementKind::from_stored(s).is_some()
    })?;

    purge_unusable_movements(conn)?;
    check_unsigned_quantities(conn)?;

    rebuild_items(conn)?;
    rebuild_movements(conn)?;

    let mut normalized = 0;
    normalized += normalize_date_column(conn, "items", "ordered_on")?;
    normalized += normalize_date_column(conn, "items", "arrived_on")?;
    normalized += normalize_date_column(conn, "stock_movements", "reference_date")?;
    if normalized > 0 {
        info!("Normalized {} date value(s) to YYYY-MM-DD", normalized);
    }

    conn.execute_batch(SearchIndex::CREATE_SQL)?;
    let indexed = SearchIndex::rebuild_locked(conn)?;
    info!("Built search projection for {} item(s)", indexed);

    Ok(())
}

fn rebuild_items(conn: &Connection) -> Result<usize, StockPulseError> {
    let status_case = legacy_case(
        "i.status",
        ItemStatus::LEGACY_NAMES
            .iter()
            .map(|(legacy, status)| (*legacy, status.as_str())),
    );

    let populate_sql = format!(
        "INSERT INTO items_v7 (
             id, name, category_id, category_name, status, shop, note, ordered_on, arrived_on
         )
         SELECT i.id, i.name, i.category_id, c.name, {}, i.shop, NULLIF(TRIM(i.notiz), ''),
                i.datum_bestellt, i.datum_eingetroffen
         FROM items i
         JOIN categories c ON c.id = i.category_id;",
        status_case
    );

    TableRebuild {
        table: "items",
        staging: "items_v7",
        create_sql: CREATE_ITEMS_V7,
        populate_sql: &populate_sql,
        finish_sql: None,
    }
    .run(conn)
}

fn rebuild_movements(conn: &Connection) -> Result<usize, StockPulseError> {
    let kind_case = legacy_case(
        "movement_type",
        MovementKind::LEGACY_NAMES
            .iter()
            .map(|(legacy, kind)| (*legacy, kind.as_str())),
    );

    let populate_sql = format!(
        "INSERT INTO stock_movements_v7 (
             id, item_id, kind, quantity, recorded_at, reference_date, note
         )
         SELECT id, item_id, {}, quantity, movement_date,
                reference_date, NULLIF(TRIM(notes), '')
         FROM stock_movements;",
        kind_case
    );

    TableRebuild {
        table: "stock_movements",
        staging: "stock_movements_v7",
        create_sql: CREATE_MOVEMENTS_V7,
        populate_sql: &populate_sql,
        finish_sql: None,
    }
    .run(conn)
}

/// `CASE column WHEN 'legacy' THEN 'current' ... ELSE column END`.
/// Values are compile-time vocabulary, never user input.
fn legacy_case<'a>(column: &str, pairs: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    let mut sql = format!("CASE {}", column);
    for (legacy, current) in pairs {
        sql.push_str(&format!(" WHEN '{}' THEN '{}'", legacy, current));
    }
    sql.push_str(&format!(" ELSE {} END", column));
    sql
}

fn check_stored_values(
    conn: &Connection,
    table: &str,
    column: &str,
    accept: impl Fn(&str) -> bool,
) -> Result<(), StockPulseError> {
    let mut stmt = conn.prepare(&format!("SELECT DISTINCT {} FROM {}", column, table))?;
    let values = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let unknown: Vec<String> = values.into_iter().filter(|v| !accept(v)).collect();
    if unknown.is_empty() {
        return Ok(());
    }

    Err(StockPulseError::Error(format!(
        "Unrecognized {} value(s) in {}: {}",
        column,
        table,
        unknown.join(", ")
    )))
}

/// Movements whose item is gone cannot satisfy the new NOT NULL foreign key,
/// and zero-quantity rows carry no stock effect.
fn purge_unusable_movements(conn: &Connection) -> Result<(), StockPulseError> {
    let orphans = conn.execute(
        "DELETE FROM stock_movements
         WHERE item_id IS NULL OR item_id NOT IN (SELECT id FROM items)",
        [],
    )?;
    if orphans > 0 {
        warn!("Removed {} ledger row(s) referencing missing items", orphans);
    }

    let empty = conn.execute("DELETE FROM stock_movements WHERE quantity = 0", [])?;
    if empty > 0 {
        warn!("Removed {} zero-quantity ledger row(s)", empty);
    }
    Ok(())
}

/// Quantities are stored unsigned with the direction given by the kind. A
/// negative legacy row has no unambiguous reading, so the step stops.
fn check_unsigned_quantities(conn: &Connection) -> Result<(), StockPulseError> {
    let mut stmt = conn.prepare(
        "SELECT id, movement_type, quantity FROM stock_movements
         WHERE quantity < 0
         ORDER BY id",
    )?;
    let negative = stmt
        .query_map([], |row| {
            Ok(format!(
                "#{} {} {}",
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if negative.is_empty() {
        return Ok(());
    }

    Err(StockPulseError::Error(format!(
        "{} ledger row(s) with a negative quantity: {}",
        negative.len(),
        negative.join(", ")
    )))
}

/// Rewrites dates in `column` to ISO form. Blank values become NULL; values
/// in neither accepted shape are kept as-is and reported.
fn normalize_date_column(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<usize, StockPulseError> {
    let rows: Vec<(i64, String)> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, {} FROM {} WHERE {} IS NOT NULL",
            column, table, column
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let update_sql = format!("UPDATE {} SET {} = ?1 WHERE id = ?2", table, column);
    let mut changed = 0;

    for (id, raw) in rows {
        let normalized = if raw.trim().is_empty() {
            None
        } else {
            match validate::parse_date(&raw) {
                Some(date) => Some(date.format("%Y-%m-%d").to_string()),
                None => {
                    warn!(
                        "Keeping unrecognized date '{}' in {}.{} (row {})",
                        raw, table, column, id
                    );
                    continue;
                }
            }
        };

        if normalized.as_deref() != Some(raw.as_str()) {
            conn.execute(&update_sql, rusqlite::params![normalized, id])?;
            changed += 1;
        }
    }

    Ok(changed)
}
