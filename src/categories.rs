use log::debug;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::db::Database;
use crate::error::StockPulseError;
use crate::search::SearchIndex;
use crate::validate;

/// Where items without a category label are filed.
pub const DEFAULT_CATEGORY: &str = "Uncategorized";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Category {
    pub category_id: i64,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CategoryUsage {
    #[serde(flatten)]
    pub category: Category,
    pub item_count: i64,
}

impl Category {
    pub fn create(conn: &Connection, name: &str) -> Result<Self, StockPulseError> {
        let name = validate::category_name(name)?;

        Database::immediate_transaction(conn, |c| {
            if Self::get_by_name(c, &name)?.is_some() {
                return Err(StockPulseError::ValidationError(format!(
                    "Category '{}' already exists",
                    name
                )));
            }

            let category_id: i64 = c.query_row(
                "INSERT INTO categories (name) VALUES (?) RETURNING id",
                [&name],
                |row| row.get(0),
            )?;

            debug!("Created category {} '{}'", category_id, name);
            Ok(Category { category_id, name })
        })
    }

    pub fn get_by_id(conn: &Connection, category_id: i64) -> Result<Option<Self>, StockPulseError> {
        let category = conn
            .query_row(
                "SELECT id, name FROM categories WHERE id = ?",
                [category_id],
                |row| {
                    Ok(Category {
                        category_id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(category)
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<Self>, StockPulseError> {
        let category = conn
            .query_row(
                "SELECT id, name FROM categories WHERE name = ?",
                [name.trim()],
                |row| {
                    Ok(Category {
                        category_id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(category)
    }

    /// Resolves a category given either its numeric id or its name. Names
    /// take precedence so a category literally named "12" stays reachable.
    pub fn find(conn: &Connection, key: &str) -> Result<Self, StockPulseError> {
        if let Some(category) = Self::get_by_name(conn, key)? {
            return Ok(category);
        }
        if let Ok(category_id) = key.trim().parse::<i64>() {
            if let Some(category) = Self::get_by_id(conn, category_id)? {
                return Ok(category);
            }
        }
        Err(StockPulseError::category_not_found(key.trim()))
    }

    /// Returns the category called `label`, creating it if needed. A missing
    /// label resolves to the default category. Caller holds the transaction.
    pub(crate) fn get_or_create_locked(
        conn: &Connection,
        label: Option<&str>,
    ) -> Result<Self, StockPulseError> {
        let name = label
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(DEFAULT_CATEGORY);

        conn.execute("INSERT OR IGNORE INTO categories (name) VALUES (?)", [name])?;

        Self::get_by_name(conn, name)?.ok_or_else(|| StockPulseError::category_not_found(name))
    }

    pub fn list(conn: &Connection) -> Result<Vec<CategoryUsage>, StockPulseError> {
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, COUNT(i.id)
             FROM categories c
             LEFT JOIN items i ON i.category_id = c.id
             GROUP BY c.id
             ORDER BY c.name",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(CategoryUsage {
                    category: Category {
                        category_id: row.get(0)?,
                        name: row.get(1)?,
                    },
                    item_count: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Renames a category and rewrites the denormalized name on every item
    /// that references it, search projection included.
    pub fn rename(
        conn: &Connection,
        category_id: i64,
        new_name: &str,
    ) -> Result<Self, StockPulseError> {
        let new_name = validate::category_name(new_name)?;

        Database::immediate_transaction(conn, |c| {
            let current = Self::get_by_id(c, category_id)?
                .ok_or_else(|| StockPulseError::category_not_found(category_id))?;

            if current.name == new_name {
                return Ok(current);
            }

            if let Some(other) = Self::get_by_name(c, &new_name)? {
                if other.category_id != category_id {
                    return Err(StockPulseError::ValidationError(format!(
                        "Category '{}' already exists",
                        new_name
                    )));
                }
            }

            c.execute(
                "UPDATE categories SET name = ?1 WHERE id = ?2",
                rusqlite::params![new_name, category_id],
            )?;
            let items = c.execute(
                "UPDATE items SET category_name = ?1 WHERE category_id = ?2",
                rusqlite::params![new_name, category_id],
            )?;
            SearchIndex::refresh_category_locked(c, category_id)?;

            debug!(
                "Renamed category '{}' to '{}' ({} item(s))",
                current.name, new_name, items
            );

            Ok(Category {
                category_id,
                name: new_name,
            })
        })
    }

    /// Deletes an unreferenced category.
    pub fn delete(conn: &Connection, category_id: i64) -> Result<(), StockPulseError> {
        Database::immediate_transaction(conn, |c| {
            let category = Self::get_by_id(c, category_id)?
                .ok_or_else(|| StockPulseError::category_not_found(category_id))?;

            let in_use: i64 = c.query_row(
                "SELECT COUNT(*) FROM items WHERE category_id = ?",
                [category_id],
                |row| row.get(0),
            )?;

            if in_use > 0 {
                return Err(StockPulseError::ReferentialError(format!(
                    "Category '{}' is still used by {} item(s)",
                    category.name, in_use
                )));
            }

            c.execute("DELETE FROM categories WHERE id = ?", [category_id])?;
            debug!("Deleted category '{}'", category.name);
            Ok(())
        })
    }
}
