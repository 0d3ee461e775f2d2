use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::Utc;
use hex::encode;
use log::{error, info, warn};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::migration::Migrator;
use crate::db::version::SchemaVersion;
use crate::db::Database;
use crate::error::StockPulseError;

const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";
const REQUIRED_TABLES: [&str; 2] = ["items", "categories"];

// Layout of a store at the newest schema version
const CURRENT_LAYOUT: [(&str, &[&str]); 4] = [
    (
        "items",
        &[
            "id",
            "name",
            "category_id",
            "category_name",
            "status",
            "shop",
            "note",
            "ordered_on",
            "arrived_on",
        ],
    ),
    ("categories", &["id", "name"]),
    (
        "stock_movements",
        &[
            "id",
            "item_id",
            "kind",
            "quantity",
            "recorded_at",
            "reference_date",
            "note",
        ],
    ),
    ("item_search", &["name", "category", "shop", "note"]),
];

#[derive(Clone, Debug, Serialize)]
pub struct ImportReport {
    /// Copy of the previous store, if there was one.
    pub backup_path: Option<PathBuf>,
    pub source_version: u32,
    pub schema_version: u32,
}

pub struct Backup;

impl Backup {
    /// Copies the store file byte for byte. Returns the number of bytes copied.
    pub fn export(db_path: &Path, dest: &Path) -> Result<u64, StockPulseError> {
        if !db_path.is_file() {
            return Err(StockPulseError::Error(format!(
                "No store at '{}'",
                db_path.display()
            )));
        }
        if same_file(db_path, dest) {
            return Err(StockPulseError::Error(
                "Export destination is the store itself".into(),
            ));
        }

        let bytes = fs::copy(db_path, dest)?;
        info!("Exported {} bytes to '{}'", bytes, dest.display());
        Ok(bytes)
    }

    /// Replaces the store at `db_path` with the store file at `source`.
    ///
    /// The source is validated first; an invalid source leaves the current
    /// store untouched. The current store is then copied to
    /// `<store>.bak.<unix-timestamp>` and the copy verified before anything is
    /// replaced. If replacing or migrating the new store fails, the backup is
    /// copied back. The backup is kept either way.
    pub fn import(db_path: &Path, source: &Path) -> Result<ImportReport, StockPulseError> {
        if same_file(db_path, source) {
            return Err(StockPulseError::ImportError(
                "Source is the active store".into(),
            ));
        }

        let source_version = Self::validate_store(source)?;

        let backup_path = if db_path.exists() {
            Some(Self::create_verified_backup(db_path)?)
        } else {
            None
        };

        match Self::replace_and_open(db_path, source) {
            Ok(schema_version) => {
                info!(
                    "Imported '{}' (schema version {} -> {})",
                    source.display(),
                    source_version,
                    schema_version
                );
                Ok(ImportReport {
                    backup_path,
                    source_version,
                    schema_version,
                })
            }
            Err(e) => {
                error!("Import of '{}' failed: {}", source.display(), e);
                let restored = match &backup_path {
                    Some(backup) => fs::copy(backup, db_path).map(|_| ()),
                    None => fs::remove_file(db_path),
                };
                match restored {
                    Ok(()) => Err(StockPulseError::ImportError(format!(
                        "{}; previous store restored",
                        e
                    ))),
                    Err(restore_err) => Err(StockPulseError::ImportError(format!(
                        "{}; restoring the previous store also failed: {} (backup kept at {})",
                        e,
                        restore_err,
                        backup_path
                            .as_deref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| "-".into())
                    ))),
                }
            }
        }
    }

    /// Checks that `path` is a readable store this build can upgrade.
    /// Returns its schema version.
    pub fn validate_store(path: &Path) -> Result<u32, StockPulseError> {
        let invalid =
            |reason: String| StockPulseError::ImportError(format!("'{}': {}", path.display(), reason));

        let mut header = [0u8; 16];
        File::open(path)
            .and_then(|mut f| f.read_exact(&mut header))
            .map_err(|e| invalid(format!("cannot read file header ({})", e)))?;
        if &header != SQLITE_HEADER {
            return Err(invalid("not a SQLite database".into()));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| invalid(format!("cannot open ({})", e)))?;

        let check: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| invalid(format!("integrity check failed ({})", e)))?;
        if check != "ok" {
            return Err(invalid(format!("integrity check failed ({})", check)));
        }

        for table in REQUIRED_TABLES {
            let exists =
                Database::table_exists(&conn, table).map_err(|e| invalid(e.to_string()))?;
            if !exists {
                return Err(invalid(format!("missing '{}' table", table)));
            }
        }

        let version = SchemaVersion::read(&conn).map_err(|e| invalid(e.to_string()))?;
        let latest = Migrator::latest_version();
        if version > latest {
            return Err(invalid(format!(
                "schema version {} is newer than supported version {}",
                version, latest
            )));
        }

        // A store claiming the newest version is not migrated on open, so it
        // has to be complete already
        if version == latest {
            let problems = Self::layout_problems(&conn).map_err(|e| invalid(e.to_string()))?;
            if !problems.is_empty() {
                return Err(invalid(format!(
                    "incomplete store for schema version {} ({})",
                    version,
                    problems.join(", ")
                )));
            }
        }

        Ok(version)
    }

    /// Tables and columns of the current layout that `conn` lacks.
    fn layout_problems(conn: &Connection) -> Result<Vec<String>, StockPulseError> {
        let mut problems = Vec::new();
        for (table, columns) in CURRENT_LAYOUT {
            if !Database::table_exists(conn, table)? {
                problems.push(format!("missing '{}' table", table));
                continue;
            }
            let present = Database::column_names(conn, table)?;
            for column in columns {
                if !present.iter().any(|c| c.as_str() == *column) {
                    problems.push(format!("missing column '{}.{}'", table, column));
                }
            }
        }
        Ok(problems)
    }

    fn create_verified_backup(db_path: &Path) -> Result<PathBuf, StockPulseError> {
        let backup = Self::next_backup_path(db_path, Utc::now().timestamp());
        fs::copy(db_path, &backup)?;

        let original = file_sha256(db_path)?;
        let copy = file_sha256(&backup)?;
        if original != copy {
            if let Err(e) = fs::remove_file(&backup) {
                warn!("Could not remove bad backup '{}': {}", backup.display(), e);
            }
            return Err(StockPulseError::ImportError(format!(
                "Backup copy of '{}' does not match the original",
                db_path.display()
            )));
        }

        info!("Backed up store to '{}' (sha256 {})", backup.display(), original);
        Ok(backup)
    }

    /// `<store>.bak.<timestamp>`, with `.1`, `.2`, ... appended if taken.
    pub fn next_backup_path(db_path: &Path, timestamp: i64) -> PathBuf {
        let mut base = OsString::from(db_path.as_os_str());
        base.push(format!(".bak.{}", timestamp));
        let base = PathBuf::from(base);

        if !base.exists() {
            return base;
        }

        let mut n = 1;
        loop {
            let mut candidate = OsString::from(base.as_os_str());
            candidate.push(format!(".{}", n));
            let candidate = PathBuf::from(candidate);
            if !candidate.exists() {
                return candidate;
            }
            n += 1;
        }
    }

    fn replace_and_open(db_path: &Path, source: &Path) -> Result<u32, StockPulseError> {
        let mut staged = OsString::from(db_path.as_os_str());
        staged.push(".import");
        let staged = PathBuf::from(staged);

        fs::copy(source, &staged)?;
        if let Err(e) = fs::rename(&staged, db_path) {
            let _ = fs::remove_file(&staged);
            return Err(e.into());
        }

        let db = Database::open(db_path)?;
        let conn = db.get_connection()?;

        let problems = Self::layout_problems(&conn)?;
        if !problems.is_empty() {
            return Err(StockPulseError::ImportError(format!(
                "store is incomplete after migration ({})",
                problems.join(", ")
            )));
        }

        SchemaVersion::read(&conn)
    }
}

fn file_sha256(path: &Path) -> Result<String, StockPulseError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(encode(hasher.finalize()))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
