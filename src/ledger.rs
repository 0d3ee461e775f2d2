use std::collections::BTreeMap;

use log::{debug, warn, Level};
use logging_timer::timer;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::db::Database;
use crate::error::StockPulseError;
use crate::items::Item;
use crate::validate;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Inbound,
    Outbound,
    Ordered,
    Cancelled,
    Defective,
    ConsumedInProject,
}

/// How a movement kind moves the on-hand quantity.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StockEffect {
    Increase,
    Decrease,
    /// Tracked separately as ordered quantity; stock is unchanged.
    Pending,
}

impl MovementKind {
    /// Kind names written by stores older than schema version 7.
    pub const LEGACY_NAMES: [(&'static str, MovementKind); 6] = [
        ("eingang", MovementKind::Inbound),
        ("ausgang", MovementKind::Outbound),
        ("bestellung", MovementKind::Ordered),
        ("storno", MovementKind::Cancelled),
        ("defekt", MovementKind::Defective),
        ("verbaut", MovementKind::ConsumedInProject),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::Inbound => "inbound",
            MovementKind::Outbound => "outbound",
            MovementKind::Ordered => "ordered",
            MovementKind::Cancelled => "cancelled",
            MovementKind::Defective => "defective",
            MovementKind::ConsumedInProject => "consumed_in_project",
        }
    }

    pub fn effect(&self) -> StockEffect {
        match self {
            MovementKind::Inbound => StockEffect::Increase,
            MovementKind::Outbound
            | MovementKind::Cancelled
            | MovementKind::Defective
            | MovementKind::ConsumedInProject => StockEffect::Decrease,
            MovementKind::Ordered => StockEffect::Pending,
        }
    }

    /// Contribution of `quantity` units of this kind to current stock.
    pub fn signed(&self, quantity: i64) -> i64 {
        match self.effect() {
            StockEffect::Increase => quantity,
            StockEffect::Decrease => -quantity,
            StockEffect::Pending => 0,
        }
    }

    pub fn from_stored(s: &str) -> Option<Self> {
        MovementKind::iter()
            .find(|kind| kind.as_str() == s)
            .or_else(|| Self::from_legacy(s))
    }

    pub fn from_legacy(s: &str) -> Option<Self> {
        Self::LEGACY_NAMES
            .iter()
            .find(|(legacy, _)| *legacy == s)
            .map(|(_, kind)| *kind)
    }

    /// Parses user input. Case-insensitive, `-` and `_` are interchangeable,
    /// legacy names are accepted.
    pub fn parse(s: &str) -> Result<Self, StockPulseError> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        normalized
            .parse::<MovementKind>()
            .ok()
            .or_else(|| Self::from_legacy(&normalized))
            .ok_or_else(|| {
                let valid: Vec<&str> = MovementKind::iter().map(|k| k.as_str()).collect();
                StockPulseError::ValidationError(format!(
                    "Unknown movement kind '{}' (expected one of: {})",
                    s.trim(),
                    valid.join(", ")
                ))
            })
    }
}

impl ToSql for MovementKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MovementKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        MovementKind::from_stored(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown movement kind '{}'", s).into()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StockMovement {
    pub movement_id: i64,
    pub item_id: i64,
    pub kind: MovementKind,
    pub quantity: i64,
    pub recorded_at: String,
    pub reference_date: Option<String>,
    pub note: Option<String>,
}

impl StockMovement {
    const SELECT_COLUMNS: &'static str =
        "id, item_id, kind, quantity, recorded_at, reference_date, note";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(StockMovement {
            movement_id: row.get(0)?,
            item_id: row.get(1)?,
            kind: row.get(2)?,
            quantity: row.get(3)?,
            recorded_at: row.get(4)?,
            reference_date: row.get(5)?,
            note: row.get(6)?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StockLevel {
    pub item_id: i64,
    pub current_stock: i64,
    pub ordered_quantity: i64,
    pub consumed_quantity: i64,
    pub defective_quantity: i64,
}

impl StockLevel {
    /// Recomputes the aggregate for `item_id` from its ledger rows in memory.
    /// Rows belonging to other items are ignored.
    pub fn fold(item_id: i64, movements: &[StockMovement]) -> Self {
        movements
            .iter()
            .filter(|m| m.item_id == item_id)
            .fold(
                StockLevel {
                    item_id,
                    ..Default::default()
                },
                |mut level, m| {
                    level.apply(m.kind, m.quantity);
                    level
                },
            )
    }

    fn apply(&mut self, kind: MovementKind, quantity: i64) {
        self.current_stock += kind.signed(quantity);
        match kind {
            MovementKind::Ordered => self.ordered_quantity += quantity,
            MovementKind::ConsumedInProject => self.consumed_quantity += quantity,
            MovementKind::Defective => self.defective_quantity += quantity,
            _ => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LowStockItem {
    pub item_id: i64,
    pub name: String,
    pub current_stock: i64,
}

/// An item whose SQL aggregate disagrees with the in-memory fold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LedgerDivergence {
    pub item_id: i64,
    pub aggregated: StockLevel,
    pub recomputed: StockLevel,
}

/// The append-only stock ledger. Rows are never updated; the only delete is
/// the purge that accompanies deleting the item itself.
pub struct Ledger;

impl Ledger {
    // One row per item; items without movements aggregate to zero
    const AGGREGATE_SQL: &'static str = "SELECT i.id AS item_id,
            COALESCE(SUM(CASE
                WHEN m.kind = 'inbound' THEN m.quantity
                WHEN m.kind IN ('outbound', 'cancelled', 'defective', 'consumed_in_project') THEN -m.quantity
                ELSE 0 END), 0) AS current_stock,
            COALESCE(SUM(CASE WHEN m.kind = 'ordered' THEN m.quantity ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN m.kind = 'consumed_in_project' THEN m.quantity ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN m.kind = 'defective' THEN m.quantity ELSE 0 END), 0)
        FROM items i
        LEFT JOIN stock_movements m ON m.item_id = i.id";

    fn level_from_row(row: &rusqlite::Row) -> rusqlite::Result<StockLevel> {
        Ok(StockLevel {
            item_id: row.get(0)?,
            current_stock: row.get(1)?,
            ordered_quantity: row.get(2)?,
            consumed_quantity: row.get(3)?,
            defective_quantity: row.get(4)?,
        })
    }

    /// Appends one movement and returns its id.
    pub fn record_movement(
        conn: &Connection,
        item_id: i64,
        kind: MovementKind,
        quantity: i64,
        note: Option<&str>,
        reference_date: Option<&str>,
    ) -> Result<i64, StockPulseError> {
        let quantity = validate::quantity(quantity)?;
        let reference_date = validate::date("Reference date", reference_date)?;
        let note = validate::note(note);

        Database::immediate_transaction(conn, |c| {
            if !Item::exists_locked(c, item_id)? {
                return Err(StockPulseError::item_not_found(item_id));
            }

            c.execute(
                "INSERT INTO stock_movements (item_id, kind, quantity, reference_date, note)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![item_id, kind, quantity, reference_date, note],
            )?;
            let movement_id = c.last_insert_rowid();

            debug!(
                "Recorded {} x{} for item {:06} (movement {})",
                kind, quantity, item_id, movement_id
            );
            Ok(movement_id)
        })
    }

    pub fn stock_level(conn: &Connection, item_id: i64) -> Result<StockLevel, StockPulseError> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE i.id = ? GROUP BY i.id",
            Self::AGGREGATE_SQL
        ))?;
        let mut rows = stmt.query_map([item_id], Self::level_from_row)?;

        match rows.next() {
            Some(level) => Ok(level?),
            None => Err(StockPulseError::item_not_found(item_id)),
        }
    }

    pub fn current_stock(conn: &Connection, item_id: i64) -> Result<i64, StockPulseError> {
        Ok(Self::stock_level(conn, item_id)?.current_stock)
    }

    pub fn stock_levels(conn: &Connection) -> Result<Vec<StockLevel>, StockPulseError> {
        let _tmr = timer!(Level::Debug; "Ledger::stock_levels");

        let mut stmt = conn.prepare(&format!(
            "{} GROUP BY i.id ORDER BY i.id",
            Self::AGGREGATE_SQL
        ))?;
        let levels = stmt
            .query_map([], Self::level_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(levels)
    }

    /// Every item whose current stock is at or below `threshold`, lowest id
    /// first.
    pub fn low_stock(conn: &Connection, threshold: i64) -> Result<Vec<LowStockItem>, StockPulseError> {
        let _tmr = timer!(Level::Debug; "Ledger::low_stock", "threshold {}", threshold);

        let mut stmt = conn.prepare(&format!(
            "SELECT agg.item_id, items.name, agg.current_stock
             FROM ({} GROUP BY i.id) AS agg
             JOIN items ON items.id = agg.item_id
             WHERE agg.current_stock <= ?
             ORDER BY agg.item_id",
            Self::AGGREGATE_SQL
        ))?;

        let rows = stmt
            .query_map([threshold], |row| {
                Ok(LowStockItem {
                    item_id: row.get(0)?,
                    name: row.get(1)?,
                    current_stock: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Movements for one item, newest first.
    pub fn recent_movements(
        conn: &Connection,
        item_id: i64,
        limit: usize,
    ) -> Result<Vec<StockMovement>, StockPulseError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM stock_movements WHERE item_id = ? ORDER BY id DESC LIMIT ?",
            StockMovement::SELECT_COLUMNS
        ))?;
        let movements = stmt
            .query_map(rusqlite::params![item_id, limit as i64], StockMovement::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(movements)
    }

    pub fn all_movements(conn: &Connection) -> Result<Vec<StockMovement>, StockPulseError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM stock_movements ORDER BY id",
            StockMovement::SELECT_COLUMNS
        ))?;
        let movements = stmt
            .query_map([], StockMovement::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(movements)
    }

    /// Compares the SQL aggregate of every item against a fold of its rows.
    pub fn verify(conn: &Connection) -> Result<Vec<LedgerDivergence>, StockPulseError> {
        let _tmr = timer!(Level::Debug; "Ledger::verify");

        let mut by_item: BTreeMap<i64, Vec<StockMovement>> = BTreeMap::new();
        for movement in Self::all_movements(conn)? {
            by_item.entry(movement.item_id).or_default().push(movement);
        }

        let mut divergences = Vec::new();
        for aggregated in Self::stock_levels(conn)? {
            let rows = by_item
                .get(&aggregated.item_id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let recomputed = StockLevel::fold(aggregated.item_id, rows);
            if recomputed != aggregated {
                warn!(
                    "Ledger aggregate for item {:06} disagrees with its rows",
                    aggregated.item_id
                );
                divergences.push(LedgerDivergence {
                    item_id: aggregated.item_id,
                    aggregated,
                    recomputed,
                });
            }
        }
        Ok(divergences)
    }

    /// Removes every ledger row of `item_id`. Only item deletion calls this,
    /// inside its own transaction.
    pub(crate) fn purge_item_locked(conn: &Connection, item_id: i64) -> Result<usize, StockPulseError> {
        Ok(conn.execute("DELETE FROM stock_movements WHERE item_id = ?", [item_id])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::FIRST_ITEM_ID;
    use crate::db::test_support::open_temp_db;
    use crate::items::{ItemStatus, NewItem};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use proptest::test_runner::{Config, TestRunner};

    fn add_item(conn: &Connection, name: &str) -> i64 {
        Item::create(
            conn,
            &NewItem {
                name: name.into(),
                category: Some("Parts".into()),
                status: ItemStatus::Arrived,
                shop: None,
                note: None,
                ordered_on: None,
                arrived_on: None,
            },
        )
        .unwrap()
        .item_id
    }

    #[test]
    fn test_kind_parse_variants() {
        assert_eq!(
            MovementKind::parse("consumed-in-project").unwrap(),
            MovementKind::ConsumedInProject
        );
        assert_eq!(
            MovementKind::parse("Consumed_In_Project").unwrap(),
            MovementKind::ConsumedInProject
        );
        assert_eq!(MovementKind::parse("storno").unwrap(), MovementKind::Cancelled);
        assert!(matches!(
            MovementKind::parse("stolen"),
            Err(StockPulseError::ValidationError(_))
        ));
    }

    #[test]
    fn test_kind_strings_match_display() {
        for kind in MovementKind::iter() {
            assert_eq!(kind.to_string(), kind.as_str());
        }
    }

    #[test]
    fn test_scenario_inbound_consumed_defective() {
        let (_dir, db) = open_temp_db();
        let conn = db.get_connection().unwrap();

        add_item(&conn, "first");
        let item_id = add_item(&conn, "second");
        assert_eq!(item_id, 100001);

        Ledger::record_movement(&conn, item_id, MovementKind::Inbound, 10, None, None).unwrap();
        Ledger::record_movement(&conn, item_id, MovementKind::ConsumedInProject, 3, None, None).unwrap();
        Ledger::record_movement(&conn, item_id, MovementKind::Defective, 1, None, None).unwrap();

        let level = Ledger::stock_level(&conn, item_id).unwrap();
        assert_eq!(
            level,
            StockLevel {
                item_id,
                current_stock: 6,
                ordered_quantity: 0,
                consumed_quantity: 3,
                defective_quantity: 1,
            }
        );
    }

    #[test]
    fn test_low_stock_threshold() {
        let (_dir, db) = open_temp_db();
        let conn = db.get_connection().unwrap();

        add_item(&conn, "unused");
        let a = add_item(&conn, "six");
        let b = add_item(&conn, "two");
        let c = add_item(&conn, "none");
        assert_eq!((a, b, c), (100001, 100002, 100003));

        // Item 100000 gets plenty so only the three under test are in play
        Ledger::record_movement(&conn, FIRST_ITEM_ID, MovementKind::Inbound, 50, None, None).unwrap();
        Ledger::record_movement(&conn, a, MovementKind::Inbound, 6, None, None).unwrap();
        Ledger::record_movement(&conn, b, MovementKind::Inbound, 5, None, None).unwrap();
        Ledger::record_movement(&conn, b, MovementKind::Outbound, 3, None, None).unwrap();
        Ledger::record_movement(&conn, c, MovementKind::Ordered, 20, None, None).unwrap();

        let low: Vec<i64> = Ledger::low_stock(&conn, 5)
            .unwrap()
            .into_iter()
            .map(|l| l.item_id)
            .collect();
        assert_eq!(low, vec![100002, 100003]);

        let levels = Ledger::stock_levels(&conn).unwrap();
        assert_eq!(levels.len(), 4);
        assert_eq!(levels[3].ordered_quantity, 20);
        assert_eq!(levels[3].current_stock, 0);
    }

    #[test]
    fn test_record_rejects_bad_input() {
        let (_dir, db) = open_temp_db();
        let conn = db.get_connection().unwrap();
        let item_id = add_item(&conn, "x");

        assert!(matches!(
            Ledger::record_movement(&conn, item_id, MovementKind::Inbound, 0, None, None),
            Err(StockPulseError::ValidationError(_))
        ));
        assert!(matches!(
            Ledger::record_movement(&conn, item_id, MovementKind::Inbound, 1, None, Some("32.01.2024")),
            Err(StockPulseError::ValidationError(_))
        ));
        assert!(matches!(
            Ledger::record_movement(&conn, 4242, MovementKind::Inbound, 1, None, None),
            Err(StockPulseError::NotFound { .. })
        ));
        assert!(matches!(
            Ledger::stock_level(&conn, 4242),
            Err(StockPulseError::NotFound { .. })
        ));
        assert!(Ledger::all_movements(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_recent_movements_newest_first() {
        let (_dir, db) = open_temp_db();
        let conn = db.get_connection().unwrap();
        let item_id = add_item(&conn, "x");

        for q in 1..=5 {
            Ledger::record_movement(&conn, item_id, MovementKind::Inbound, q, Some("batch"), Some("01.01.2024"))
                .unwrap();
        }

        let recent = Ledger::recent_movements(&conn, item_id, 3).unwrap();
        let quantities: Vec<i64> = recent.iter().map(|m| m.quantity).collect();
        assert_eq!(quantities, vec![5, 4, 3]);
        assert_eq!(recent[0].reference_date.as_deref(), Some("2024-01-01"));
        assert_eq!(recent[0].note.as_deref(), Some("batch"));
        assert_eq!(recent[0].recorded_at.len(), "YYYY-MM-DD HH:MM:SS".len());
    }

    #[test]
    fn test_verify_reports_nothing_for_consistent_ledger() {
        let (_dir, db) = open_temp_db();
        let conn = db.get_connection().unwrap();
        let a = add_item(&conn, "a");
        add_item(&conn, "b");

        Ledger::record_movement(&conn, a, MovementKind::Inbound, 7, None, None).unwrap();
        Ledger::record_movement(&conn, a, MovementKind::Cancelled, 2, None, None).unwrap();

        assert!(Ledger::verify(&conn).unwrap().is_empty());
    }

    // Written out independently of MovementKind::effect
    fn stock_delta(kind: MovementKind, quantity: i64) -> i64 {
        match kind {
            MovementKind::Inbound => quantity,
            MovementKind::Outbound
            | MovementKind::Cancelled
            | MovementKind::Defective
            | MovementKind::ConsumedInProject => -quantity,
            MovementKind::Ordered => 0,
        }
    }

    #[test]
    fn test_oversized_quantity_is_rejected_and_aggregation_survives() {
        let (_dir, db) = open_temp_db();
        let conn = db.get_connection().unwrap();
        let a = add_item(&conn, "a");
        let b = add_item(&conn, "b");

        Ledger::record_movement(&conn, b, MovementKind::Inbound, 1, None, None).unwrap();
        assert!(matches!(
            Ledger::record_movement(&conn, a, MovementKind::Inbound, i64::MAX, None, None),
            Err(StockPulseError::ValidationError(_))
        ));
        assert!(matches!(
            Ledger::record_movement(&conn, a, MovementKind::Inbound, validate::MAX_QUANTITY + 1, None, None),
            Err(StockPulseError::ValidationError(_))
        ));
        Ledger::record_movement(&conn, a, MovementKind::Inbound, validate::MAX_QUANTITY, None, None)
            .unwrap();

        let low: Vec<i64> = Ledger::low_stock(&conn, 5)
            .unwrap()
            .into_iter()
            .map(|l| l.item_id)
            .collect();
        assert_eq!(low, vec![b]);
        assert_eq!(Ledger::current_stock(&conn, a).unwrap(), validate::MAX_QUANTITY);
        assert!(Ledger::verify(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_aggregate_matches_fold_for_random_sequences() {
        let (_dir, db) = open_temp_db();
        let conn = db.get_connection().unwrap();

        let kinds: Vec<MovementKind> = MovementKind::iter().collect();
        let strategy = prop::collection::vec((prop::sample::select(kinds), 1i64..10_000), 0..30);

        let mut runner = TestRunner::new(Config::with_cases(32));
        runner
            .run(&strategy, |moves| {
                let item_id = add_item(&conn, "prop");
                for (kind, quantity) in &moves {
                    Ledger::record_movement(&conn, item_id, *kind, *quantity, None, None).unwrap();
                }

                let expected: i64 = moves.iter().map(|(k, q)| stock_delta(*k, *q)).sum();
                let ordered: i64 = moves
                    .iter()
                    .filter(|(k, _)| *k == MovementKind::Ordered)
                    .map(|(_, q)| q)
                    .sum();
                let level = Ledger::stock_level(&conn, item_id).unwrap();
                prop_assert_eq!(level.current_stock, expected);
                prop_assert_eq!(level.ordered_quantity, ordered);

                let rows = Ledger::recent_movements(&conn, item_id, moves.len() + 1).unwrap();
                prop_assert_eq!(StockLevel::fold(item_id, &rows), level);
                Ok(())
            })
            .unwrap();

        assert!(Ledger::verify(&conn).unwrap().is_empty());
    }
}
