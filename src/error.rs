use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StockPulseError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into StockPulseError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Invalid value: {0}")]
    ValidationError(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Migration to schema version {version} failed: {reason}")]
    MigrationError { version: u32, reason: String },

    #[error("Import failed: {0}")]
    ImportError(String),

    #[error("{0}")]
    ReferentialError(String),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl StockPulseError {
    pub fn item_not_found(item_id: i64) -> Self {
        StockPulseError::NotFound {
            entity: "Item",
            id: format!("{:06}", item_id),
        }
    }

    pub fn category_not_found(category: impl ToString) -> Self {
        StockPulseError::NotFound {
            entity: "Category",
            id: category.to_string(),
        }
    }

    /// True for the error kinds a caller can report and carry on from.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StockPulseError::ValidationError(_)
                | StockPulseError::NotFound { .. }
                | StockPulseError::ImportError(_)
                | StockPulseError::ReferentialError(_)
        )
    }

    /// Process exit status: 1 for rejected input, 2 for store or system failures.
    pub fn exit_code(&self) -> i32 {
        if self.is_recoverable() {
            1
        } else {
            2
        }
    }
}
