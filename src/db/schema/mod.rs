mod v0_to_v1;
pub(crate) mod v1_to_v2;
mod v2_to_v3;
mod v3_to_v4;
mod v4_to_v5;
mod v5_to_v6;
mod v6_to_v7;

pub use v3_to_v4::FIRST_ITEM_ID;

use crate::db::migration::{Migration, MigrationKind};

/// Every store layout ever shipped, oldest first. Append only: a released
/// step is never edited, later corrections go into a new step.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        target_version: 1,
        name: "create_items",
        kind: MigrationKind::Additive,
        already_applied: v0_to_v1::items_table_exists,
        pre_sql: Some(v0_to_v1::UPGRADE_0_TO_1_SQL),
        code_fn: None,
        post_sql: None,
    },
    Migration {
        target_version: 2,
        name: "category_backfill",
        kind: MigrationKind::Backfill,
        already_applied: v1_to_v2::category_column_exists,
        pre_sql: Some(v1_to_v2::UPGRADE_1_TO_2_PRE_SQL),
        code_fn: Some(v1_to_v2::migrate_1_to_2),
        post_sql: None,
    },
    Migration {
        target_version: 3,
        name: "legacy_search_index",
        kind: MigrationKind::Additive,
        already_applied: v2_to_v3::search_index_exists,
        pre_sql: Some(v2_to_v3::UPGRADE_2_TO_3_SQL),
        code_fn: Some(v2_to_v3::migrate_2_to_3),
        post_sql: None,
    },
    Migration {
        target_version: 4,
        name: "six_digit_ids",
        kind: MigrationKind::Additive,
        already_applied: v3_to_v4::id_floor_in_place,
        pre_sql: None,
        code_fn: Some(v3_to_v4::migrate_3_to_4),
        post_sql: None,
    },
    Migration {
        target_version: 5,
        name: "rename_location_to_shop",
        kind: MigrationKind::Rebuild,
        already_applied: v4_to_v5::location_already_renamed,
        pre_sql: None,
        code_fn: Some(v4_to_v5::migrate_4_to_5),
        post_sql: None,
    },
    Migration {
        target_version: 6,
        name: "stock_ledger",
        kind: MigrationKind::Backfill,
        already_applied: v5_to_v6::ledger_exists,
        pre_sql: Some(v5_to_v6::UPGRADE_5_TO_6_PRE_SQL),
        code_fn: Some(v5_to_v6::migrate_5_to_6),
        post_sql: None,
    },
    Migration {
        target_version: 7,
        name: "normalize_vocabulary",
        kind: MigrationKind::Rebuild,
        already_applied: v6_to_v7::vocabulary_normalized,
        pre_sql: Some(v6_to_v7::UPGRADE_6_TO_7_PRE_SQL),
        code_fn: Some(v6_to_v7::migrate_6_to_7),
        post_sql: Some(v6_to_v7::UPGRADE_6_TO_7_POST_SQL),
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migration::Migrator;
    use crate::db::version::SchemaVersion;
    use crate::db::Database;
    use crate::error::StockPulseError;
    use crate::search::SearchIndex;
    use pretty_assertions::assert_eq;
    use rusqlite::types::Value;
    use rusqlite::Connection;

    fn store_at(version: u32) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON").unwrap();
        Migrator::migrate_to(&conn, version).unwrap();
        conn
    }

    fn dump(conn: &Connection, table: &str) -> Vec<Vec<Value>> {
        let mut stmt = conn
            .prepare(&format!("SELECT * FROM {} ORDER BY 1", table))
            .unwrap();
        let columns = stmt.column_count();
        stmt.query_map([], |row| {
            (0..columns)
                .map(|i| row.get::<_, Value>(i))
                .collect::<Result<Vec<_>, _>>()
        })
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    /// A store as the first layout left it, with German vocabulary and
    /// mixed date formats.
    fn seed_v1(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO items (name, kategorie, anzahl, status, ort, notiz, datum_bestellt, datum_eingetroffen) VALUES
                ('ESP32 DevKit', 'MCU', 10, 'eingetroffen', 'Reichelt', 'WiFi board', '01.02.2023', '2023-02-10'),
                ('BME280', 'Sensoren', 4, 'verbaut', 'AliExpress', NULL, NULL, '15.03.2023'),
                ('Arduino Nano', 'MCU', 3, 'bestellt', NULL, '', '2023-04-01', NULL),
                ('Broken LCD', '', 1, 'defekt', 'eBay', NULL, NULL, 'sometime'),
                ('Spare fuse', 'Misc', 0, 'nachbestellen', NULL, NULL, NULL, NULL);",
        )
        .unwrap();
    }

    #[test]
    fn test_fresh_store_reaches_latest() {
        let conn = store_at(Migrator::latest_version());
        assert_eq!(SchemaVersion::read(&conn).unwrap(), 7);
        assert!(Database::has_column(&conn, "items", "category_name").unwrap());
        assert!(!Database::has_column(&conn, "items", "anzahl").unwrap());
        assert!(Database::table_exists(&conn, "item_search").unwrap());
        assert!(!Database::table_exists(&conn, "items_fts").unwrap());
    }

    #[test]
    fn test_category_backfill_is_total() {
        let conn = store_at(1);
        let labels = ["MCU", "Sensors", "Passives", "Tools"];
        for i in 0..40 {
            conn.execute(
                "INSERT INTO items (name, kategorie, status) VALUES (?1, ?2, 'bestellt')",
                rusqlite::params![format!("part {}", i), labels[i % labels.len()]],
            )
            .unwrap();
        }

        Migrator::migrate_to(&conn, 2).unwrap();

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM categories"), 4);
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM items WHERE category_id IS NULL"),
            0
        );
        assert_eq!(
            count(
                &conn,
                "SELECT COUNT(*) FROM items i JOIN categories c ON c.id = i.category_id
                 WHERE c.name != i.kategorie"
            ),
            0
        );
    }

    #[test]
    fn test_blank_label_goes_to_default_category() {
        let conn = store_at(1);
        conn.execute_batch(
            "INSERT INTO items (name, kategorie, status) VALUES ('a', '  ', 'bestellt'), ('b', '', 'bestellt');",
        )
        .unwrap();
        Migrator::migrate_to(&conn, 2).unwrap();

        let names: Vec<String> = conn
            .prepare("SELECT name FROM categories")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(names, vec!["Uncategorized".to_string()]);
    }

    #[test]
    fn test_id_floor_applies_to_new_rows_only() {
        let conn = store_at(3);
        conn.execute(
            "INSERT INTO items (name, kategorie, status) VALUES ('old', 'MCU', 'bestellt')",
            [],
        )
        .unwrap();
        Migrator::migrate_to(&conn, 5).unwrap();

        conn.execute(
            "INSERT INTO items (name, kategorie, status) VALUES ('new', 'MCU', 'bestellt')",
            [],
        )
        .unwrap();
        assert_eq!(conn.last_insert_rowid(), FIRST_ITEM_ID);
        assert_eq!(count(&conn, "SELECT MIN(id) FROM items"), 1);
    }

    #[test]
    fn test_location_rename_keeps_rows_and_sequence() {
        let conn = store_at(4);
        conn.execute_batch(
            "INSERT INTO items (name, kategorie, status, ort) VALUES ('x', 'MCU', 'bestellt', 'Conrad');",
        )
        .unwrap();
        Migrator::migrate_to(&conn, 5).unwrap();

        assert!(Database::has_column(&conn, "items", "shop").unwrap());
        assert!(!Database::has_column(&conn, "items", "ort").unwrap());
        let shop: String = conn
            .query_row("SELECT shop FROM items WHERE id = ?", [FIRST_ITEM_ID], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(shop, "Conrad");

        conn.execute(
            "INSERT INTO items (name, kategorie, status) VALUES ('y', 'MCU', 'bestellt')",
            [],
        )
        .unwrap();
        assert_eq!(conn.last_insert_rowid(), FIRST_ITEM_ID + 1);
    }

    #[test]
    fn test_quantity_counter_becomes_opening_movements() {
        let conn = store_at(1);
        seed_v1(&conn);
        Migrator::migrate_to(&conn, 6).unwrap();

        let rows: Vec<(String, String, i64)> = conn
            .prepare(
                "SELECT i.name, m.movement_type, m.quantity
                 FROM stock_movements m JOIN items i ON i.id = m.item_id
                 ORDER BY m.id",
            )
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        let expected: Vec<(String, String, i64)> = vec![
            ("ESP32 DevKit".into(), "eingang".into(), 10),
            ("BME280".into(), "eingang".into(), 4),
            ("Arduino Nano".into(), "bestellung".into(), 3),
            ("Broken LCD".into(), "eingang".into(), 1),
            ("BME280".into(), "verbaut".into(), 4),
            ("Broken LCD".into(), "defekt".into(), 1),
        ];
        assert_eq!(rows, expected);
    }

    #[test]
    fn test_legacy_store_upgrades_to_current_vocabulary() {
        let conn = store_at(1);
        seed_v1(&conn);

        let report = Migrator::ensure_current_schema(&conn).unwrap();
        assert_eq!(report.applied, vec![2, 3, 4, 5, 6, 7]);
        assert_eq!(report.final_version, 7);

        type Row = (
            i64,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
        );
        let items: Vec<Row> = conn
            .prepare(
                "SELECT id, name, category_name, status, shop, ordered_on, arrived_on
                 FROM items ORDER BY id",
            )
            .unwrap()
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        let expected: Vec<Row> = vec![
            (1, "ESP32 DevKit".into(), "MCU".into(), "arrived".into(), Some("Reichelt".into()), Some("2023-02-01".into()), Some("2023-02-10".into())),
            (2, "BME280".into(), "Sensoren".into(), "installed".into(), Some("AliExpress".into()), None, Some("2023-03-15".into())),
            (3, "Arduino Nano".into(), "MCU".into(), "ordered".into(), None, Some("2023-04-01".into()), None),
            (4, "Broken LCD".into(), "Uncategorized".into(), "defective".into(), Some("eBay".into()), None, Some("sometime".into())),
            (5, "Spare fuse".into(), "Misc".into(), "reorder".into(), None, None, None),
        ];
        assert_eq!(items, expected);

        let kinds: Vec<String> = conn
            .prepare("SELECT DISTINCT kind FROM stock_movements ORDER BY kind")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            kinds,
            vec!["consumed_in_project", "defective", "inbound", "ordered"]
        );

        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM item_search"),
            count(&conn, "SELECT COUNT(*) FROM items")
        );
        assert!(SearchIndex::verify(&conn).unwrap().is_empty());

        let fk: i64 = count(&conn, "PRAGMA foreign_keys");
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_rerun_from_zero_is_idempotent() {
        let conn = store_at(1);
        seed_v1(&conn);
        Migrator::ensure_current_schema(&conn).unwrap();

        let tables = ["items", "categories", "stock_movements"];
        let before: Vec<_> = tables.iter().map(|t| dump(&conn, t)).collect();

        let second = Migrator::ensure_current_schema(&conn).unwrap();
        assert!(second.applied.is_empty());
        assert!(second.skipped.is_empty());

        SchemaVersion::write(&conn, 0).unwrap();
        let replay = Migrator::ensure_current_schema(&conn).unwrap();
        assert!(replay.applied.is_empty());
        assert_eq!(replay.skipped, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(SchemaVersion::read(&conn).unwrap(), 7);

        let after: Vec<_> = tables.iter().map(|t| dump(&conn, t)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_every_historical_version_upgrades() {
        for version in 1..Migrator::latest_version() {
            let conn = store_at(1);
            seed_v1(&conn);
            Migrator::migrate_to(&conn, version).unwrap();

            Migrator::ensure_current_schema(&conn).unwrap();
            assert_eq!(SchemaVersion::read(&conn).unwrap(), 7, "from v{}", version);
            assert_eq!(count(&conn, "SELECT COUNT(*) FROM items"), 5);
            assert_eq!(count(&conn, "SELECT COUNT(*) FROM stock_movements"), 6);
        }
    }

    #[test]
    fn test_first_layout_with_shop_column_upgrades() {
        // Later builds of the first layout shipped `shop` instead of `ort`
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE items (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL,
                 kategorie TEXT NOT NULL,
                 anzahl INTEGER NOT NULL DEFAULT 0,
                 status TEXT NOT NULL,
                 shop TEXT,
                 notiz TEXT,
                 datum_bestellt TEXT,
                 datum_eingetroffen TEXT
             );
             INSERT INTO items (name, kategorie, anzahl, status, shop) VALUES ('Relay', 'Power', 2, 'eingetroffen', 'Pollin');
             PRAGMA user_version = 1;",
        )
        .unwrap();

        let report = Migrator::ensure_current_schema(&conn).unwrap();
        assert_eq!(report.skipped, vec![5]);

        let shop: String = conn
            .query_row("SELECT shop FROM items", [], |row| row.get(0))
            .unwrap();
        assert_eq!(shop, "Pollin");
    }

    #[test]
    fn test_unknown_status_aborts_vocabulary_step() {
        let conn = store_at(6);
        conn.execute_batch(
            "INSERT INTO categories (name) VALUES ('MCU');
             INSERT INTO items (name, kategorie, category_id, status) VALUES ('x', 'MCU', 1, 'verloren');",
        )
        .unwrap();

        let err = Migrator::ensure_current_schema(&conn).unwrap_err();
        match err {
            StockPulseError::MigrationError { version, reason } => {
                assert_eq!(version, 7);
                assert!(reason.contains("verloren"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(SchemaVersion::read(&conn).unwrap(), 6);
        assert!(Database::has_column(&conn, "items", "kategorie").unwrap());
        assert!(!Database::table_exists(&conn, "items_v7").unwrap());
    }

    #[test]
    fn test_negative_legacy_quantity_aborts_vocabulary_step() {
        let conn = store_at(6);
        conn.execute_batch(
            "INSERT INTO categories (name) VALUES ('MCU');
             INSERT INTO items (name, kategorie, category_id, status) VALUES ('x', 'MCU', 1, 'eingetroffen');
             INSERT INTO stock_movements (item_id, movement_type, quantity) VALUES (100000, 'eingang', 5);
             INSERT INTO stock_movements (item_id, movement_type, quantity) VALUES (100000, 'ausgang', -3);",
        )
        .unwrap();

        let err = Migrator::ensure_current_schema(&conn).unwrap_err();
        match err {
            StockPulseError::MigrationError { version, reason } => {
                assert_eq!(version, 7);
                assert!(reason.contains("negative quantity"));
                assert!(reason.contains("ausgang -3"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(SchemaVersion::read(&conn).unwrap(), 6);
        assert!(Database::has_column(&conn, "stock_movements", "movement_type").unwrap());
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM stock_movements WHERE quantity < 0"),
            1
        );
    }

    #[test]
    fn test_orphan_movements_are_purged() {
        let conn = store_at(6);
        conn.execute_batch(
            "PRAGMA foreign_keys = OFF;
             INSERT INTO categories (name) VALUES ('MCU');
             INSERT INTO items (name, kategorie, category_id, status) VALUES ('x', 'MCU', 1, 'eingetroffen');
             INSERT INTO stock_movements (item_id, movement_type, quantity) VALUES (100000, 'eingang', 5);
             INSERT INTO stock_movements (item_id, movement_type, quantity) VALUES (424242, 'eingang', 9);",
        )
        .unwrap();

        Migrator::ensure_current_schema(&conn).unwrap();

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM stock_movements"), 1);
        assert_eq!(
            count(&conn, "SELECT SUM(quantity) FROM stock_movements WHERE kind = 'inbound'"),
            5
        );
    }
}
