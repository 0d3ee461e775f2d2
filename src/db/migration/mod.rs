pub mod rebuild;

use log::{info, warn, Level};
use logging_timer::timer;
use rusqlite::Connection;

use crate::db::schema::MIGRATIONS;
use crate::db::version::SchemaVersion;
use crate::db::Database;
use crate::error::StockPulseError;

/// Function type for migration code that transforms data during schema upgrades.
pub type MigrationFn = fn(&Connection) -> Result<(), StockPulseError>;

/// Idempotence guard: returns true when the store already reflects the
/// step's target layout, in which case the engine only records the version.
pub type GuardFn = fn(&Connection) -> Result<bool, StockPulseError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MigrationKind {
    /// New tables or columns with defaults. Existing rows are untouched.
    Additive,
    /// Derives structured data from legacy data. Must be total.
    Backfill,
    /// Copy-new-table, populate, drop-old, rename-new.
    Rebuild,
}

/// Migration descriptor supporting 3-phase migrations:
/// - pre_sql: SQL batch to run before Rust code (optional)
/// - code_fn: Rust function for complex transformations (optional)
/// - post_sql: SQL batch to run after Rust code (optional)
///
/// All three phases, the foreign key check and the version bump run inside a
/// single immediate transaction. Steps must never issue BEGIN/COMMIT.
pub struct Migration {
    pub target_version: u32,
    pub name: &'static str,
    pub kind: MigrationKind,
    pub already_applied: GuardFn,
    pub pre_sql: Option<&'static str>,
    pub code_fn: Option<MigrationFn>,
    pub post_sql: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub initial_version: u32,
    pub final_version: u32,
    /// Target versions whose phases ran.
    pub applied: Vec<u32>,
    /// Target versions whose guard reported the layout already present.
    pub skipped: Vec<u32>,
}

pub struct Migrator;

impl Migrator {
    pub fn latest_version() -> u32 {
        Self::last_target(MIGRATIONS)
    }

    /// Returns (stored version, newest version this build knows).
    pub fn status(conn: &Connection) -> Result<(u32, u32), StockPulseError> {
        Ok((SchemaVersion::read(conn)?, Self::latest_version()))
    }

    pub fn ensure_current_schema(conn: &Connection) -> Result<MigrationReport, StockPulseError> {
        Self::run(conn, MIGRATIONS, Self::latest_version())
    }

    /// Applies registered steps up to and including `target`.
    #[cfg(test)]
    pub fn migrate_to(conn: &Connection, target: u32) -> Result<MigrationReport, StockPulseError> {
        Self::run(conn, MIGRATIONS, target)
    }

    pub(crate) fn run(
        conn: &Connection,
        steps: &[Migration],
        target: u32,
    ) -> Result<MigrationReport, StockPulseError> {
        let _tmr = timer!(Level::Debug; "Migrator::run", "target {}", target);

        Self::check_registry(steps)?;

        let initial_version = SchemaVersion::read(conn)?;
        let latest = Self::last_target(steps);

        if initial_version > latest {
            return Err(StockPulseError::MigrationError {
                version: initial_version,
                reason: format!(
                    "store schema version {} is newer than the newest supported version {}",
                    initial_version, latest
                ),
            });
        }

        if target > latest {
            return Err(StockPulseError::Error(format!(
                "No migration step targets version {}",
                target
            )));
        }

        let mut report = MigrationReport {
            initial_version,
            final_version: initial_version,
            applied: Vec::new(),
            skipped: Vec::new(),
        };

        let pending: Vec<&Migration> = steps
            .iter()
            .filter(|m| m.target_version > initial_version && m.target_version <= target)
            .collect();

        if pending.is_empty() {
            return Ok(report);
        }

        info!(
            "Schema version {} is behind {}; {} migration step(s) pending",
            initial_version,
            target,
            pending.len()
        );

        // foreign_keys cannot be toggled inside a transaction, and rebuild
        // steps drop tables that other tables reference.
        conn.execute_batch("PRAGMA foreign_keys = OFF")?;

        let result = Self::apply_pending(conn, &pending, &mut report);

        let restore = conn.execute_batch("PRAGMA foreign_keys = ON");
        result?;
        restore?;

        Ok(report)
    }

    fn apply_pending(
        conn: &Connection,
        pending: &[&Migration],
        report: &mut MigrationReport,
    ) -> Result<(), StockPulseError> {
        for step in pending {
            let skipped = Self::apply_step(conn, step).map_err(|e| {
                warn!(
                    "Migration '{}' to version {} failed and was rolled back: {}",
                    step.name, step.target_version, e
                );
                StockPulseError::MigrationError {
                    version: step.target_version,
                    reason: e.to_string(),
                }
            })?;

            if skipped {
                report.skipped.push(step.target_version);
            } else {
                report.applied.push(step.target_version);
            }
            report.final_version = step.target_version;
        }
        Ok(())
    }

    fn apply_step(conn: &Connection, step: &Migration) -> Result<bool, StockPulseError> {
        Database::immediate_transaction(conn, |c| {
            let skipped = (step.already_applied)(c)?;

            if skipped {
                info!(
                    "Migration {} ({:?}, '{}'): layout already present, recording version only",
                    step.target_version, step.kind, step.name
                );
            } else {
                info!(
                    "Migration {} ({:?}, '{}'): applying",
                    step.target_version, step.kind, step.name
                );
                if let Some(sql) = step.pre_sql {
                    c.execute_batch(sql)?;
                }
                if let Some(code_fn) = step.code_fn {
                    code_fn(c)?;
                }
                if let Some(sql) = step.post_sql {
                    c.execute_batch(sql)?;
                }
            }

            Self::check_foreign_keys(c)?;
            SchemaVersion::write(c, step.target_version)?;

            Ok(skipped)
        })
    }

    fn check_foreign_keys(conn: &Connection) -> Result<(), StockPulseError> {
        let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
        let violations = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if violations.is_empty() {
            return Ok(());
        }

        let sample: Vec<String> = violations
            .iter()
            .take(5)
            .map(|(table, rowid, parent)| match rowid {
                Some(rowid) => format!("{}[{}] -> {}", table, rowid, parent),
                None => format!("{} -> {}", table, parent),
            })
            .collect();

        Err(StockPulseError::Error(format!(
            "{} foreign key violation(s): {}",
            violations.len(),
            sample.join(", ")
        )))
    }

    fn check_registry(steps: &[Migration]) -> Result<(), StockPulseError> {
        let mut previous = 0;
        for step in steps {
            if step.target_version <= previous {
                return Err(StockPulseError::Error(format!(
                    "Migration registry out of order: '{}' targets {} after {}",
                    step.name, step.target_version, previous
                )));
            }
            previous = step.target_version;
        }
        Ok(())
    }

    fn last_target(steps: &[Migration]) -> u32 {
        steps.last().map(|m| m.target_version).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn never_applied(_: &Connection) -> Result<bool, StockPulseError> {
        Ok(false)
    }

    fn table_t_exists(conn: &Connection) -> Result<bool, StockPulseError> {
        Database::table_exists(conn, "t")
    }

    fn fail(_: &Connection) -> Result<(), StockPulseError> {
        Err(StockPulseError::Error("step exploded".into()))
    }

    const TOY_STEPS: &[Migration] = &[
        Migration {
            target_version: 1,
            name: "create_t",
            kind: MigrationKind::Additive,
            already_applied: table_t_exists,
            pre_sql: Some("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);"),
            code_fn: None,
            post_sql: None,
        },
        Migration {
            target_version: 2,
            name: "seed_t",
            kind: MigrationKind::Backfill,
            already_applied: never_applied,
            pre_sql: Some("INSERT INTO t (v) VALUES ('a');"),
            code_fn: None,
            post_sql: None,
        },
        Migration {
            target_version: 3,
            name: "broken",
            kind: MigrationKind::Backfill,
            already_applied: never_applied,
            pre_sql: Some("INSERT INTO t (v) VALUES ('half-done');"),
            code_fn: Some(fail),
            post_sql: None,
        },
    ];

    fn row_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_failed_step_rolls_back_and_keeps_version() {
        let conn = Connection::open_in_memory().unwrap();

        let err = Migrator::run(&conn, TOY_STEPS, 3).unwrap_err();
        match err {
            StockPulseError::MigrationError { version, reason } => {
                assert_eq!(version, 3);
                assert!(reason.contains("step exploded"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Steps 1 and 2 committed; step 3's insert was rolled back
        assert_eq!(SchemaVersion::read(&conn).unwrap(), 2);
        assert_eq!(row_count(&conn), 1);
        assert!(conn.is_autocommit());

        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_guard_skips_phases_but_records_version() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);")
            .unwrap();

        let report = Migrator::run(&conn, TOY_STEPS, 1).unwrap();
        assert_eq!(report.skipped, vec![1]);
        assert!(report.applied.is_empty());
        assert_eq!(SchemaVersion::read(&conn).unwrap(), 1);
    }

    #[test]
    fn test_run_is_a_no_op_when_current() {
        let conn = Connection::open_in_memory().unwrap();
        Migrator::run(&conn, TOY_STEPS, 2).unwrap();

        let report = Migrator::run(&conn, TOY_STEPS, 2).unwrap();
        assert_eq!(
            report,
            MigrationReport {
                initial_version: 2,
                final_version: 2,
                applied: vec![],
                skipped: vec![],
            }
        );
        assert_eq!(row_count(&conn), 1);
    }

    #[test]
    fn test_newer_store_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        SchemaVersion::write(&conn, 99).unwrap();

        let err = Migrator::run(&conn, TOY_STEPS, 3).unwrap_err();
        assert!(matches!(err, StockPulseError::MigrationError { version: 99, .. }));
        assert_eq!(SchemaVersion::read(&conn).unwrap(), 99);
    }

    #[test]
    fn test_registry_order_is_enforced() {
        const BAD: &[Migration] = &[
            Migration {
                target_version: 2,
                name: "two",
                kind: MigrationKind::Additive,
                already_applied: never_applied,
                pre_sql: None,
                code_fn: None,
                post_sql: None,
            },
            Migration {
                target_version: 2,
                name: "two_again",
                kind: MigrationKind::Additive,
                already_applied: never_applied,
                pre_sql: None,
                code_fn: None,
                post_sql: None,
            },
        ];
        let conn = Connection::open_in_memory().unwrap();
        assert!(Migrator::run(&conn, BAD, 2).is_err());
        assert_eq!(SchemaVersion::read(&conn).unwrap(), 0);
    }

    #[test]
    fn test_registered_steps_are_ascending() {
        assert!(Migrator::check_registry(MIGRATIONS).is_ok());
        assert_eq!(Migrator::latest_version(), 7);
    }

    #[test]
    fn test_foreign_key_violation_fails_step() {
        fn orphan(conn: &Connection) -> Result<(), StockPulseError> {
            conn.execute_batch(
                "CREATE TABLE parent (id INTEGER PRIMARY KEY);
                 CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id));
                 INSERT INTO child (parent_id) VALUES (42);",
            )?;
            Ok(())
        }
        const STEPS: &[Migration] = &[Migration {
            target_version: 1,
            name: "orphan",
            kind: MigrationKind::Additive,
            already_applied: never_applied,
            pre_sql: None,
            code_fn: Some(orphan),
            post_sql: None,
        }];

        let conn = Connection::open_in_memory().unwrap();
        let err = Migrator::run(&conn, STEPS, 1).unwrap_err();
        assert!(err.to_string().contains("foreign key violation"));
        assert_eq!(SchemaVersion::read(&conn).unwrap(), 0);
        assert!(!Database::table_exists(&conn, "child").unwrap());
    }
}
