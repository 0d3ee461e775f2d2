use std::collections::BTreeSet;

use log::{debug, info};
use rusqlite::Connection;
use serde::Serialize;

use crate::db::Database;
use crate::error::StockPulseError;
use crate::items::Item;

/// Which strategy produced a search result.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    FullText,
    Prefix,
    Substring,
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchResult {
    pub mode: SearchMode,
    pub items: Vec<Item>,
}

/// The `item_search` full-text projection of the item table.
///
/// rowid is the item id. The write paths keep it in sync by calling the
/// `_locked` functions inside the transaction that changed the item.
pub struct SearchIndex;

impl SearchIndex {
    pub const CREATE_SQL: &'static str = "CREATE VIRTUAL TABLE IF NOT EXISTS item_search USING fts5(
        name, category, shop, note,
        tokenize = 'porter unicode61'
    );";

    const PROJECT_SQL: &'static str = "INSERT INTO item_search (rowid, name, category, shop, note)
        SELECT id, name, category_name, shop, note FROM items";

    pub(crate) fn upsert_locked(conn: &Connection, item: &Item) -> Result<(), StockPulseError> {
        conn.execute("DELETE FROM item_search WHERE rowid = ?", [item.item_id])?;
        conn.execute(
            "INSERT INTO item_search (rowid, name, category, shop, note) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![item.item_id, item.name, item.category_name, item.shop, item.note],
        )?;
        Ok(())
    }

    pub(crate) fn remove_locked(conn: &Connection, item_id: i64) -> Result<(), StockPulseError> {
        conn.execute("DELETE FROM item_search WHERE rowid = ?", [item_id])?;
        Ok(())
    }

    pub(crate) fn refresh_category_locked(
        conn: &Connection,
        category_id: i64,
    ) -> Result<(), StockPulseError> {
        conn.execute(
            "DELETE FROM item_search WHERE rowid IN (SELECT id FROM items WHERE category_id = ?)",
            [category_id],
        )?;
        conn.execute(
            &format!("{} WHERE category_id = ?", Self::PROJECT_SQL),
            [category_id],
        )?;
        Ok(())
    }

    /// Regenerates the whole projection from the item table.
    pub fn rebuild_locked(conn: &Connection) -> Result<usize, StockPulseError> {
        conn.execute("DELETE FROM item_search", [])?;
        Ok(conn.execute(Self::PROJECT_SQL, [])?)
    }

    pub fn rebuild(conn: &Connection) -> Result<usize, StockPulseError> {
        let indexed = Database::immediate_transaction(conn, Self::rebuild_locked)?;
        info!("Rebuilt search projection for {} item(s)", indexed);
        Ok(indexed)
    }

    /// Full-text search with FTS5 query syntax (phrases, `term*`, AND/OR/NOT).
    ///
    /// A single bare term that matches nothing is retried as a prefix. When
    /// that also finds nothing, or the query is not valid FTS syntax, falls
    /// back to a case-insensitive substring scan.
    pub fn search(conn: &Connection, query: &str) -> Result<SearchResult, StockPulseError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(StockPulseError::ValidationError(
                "Search query must not be empty".into(),
            ));
        }

        match Self::fts_match(conn, query) {
            Ok(ids) if !ids.is_empty() => {
                return Ok(SearchResult {
                    mode: SearchMode::FullText,
                    items: Self::load_items(conn, &ids)?,
                })
            }
            Ok(_) => {}
            Err(e) => debug!("Full-text query '{}' rejected: {}", query, e),
        }

        if Self::is_bare_term(query) {
            let ids = Self::fts_match(conn, &format!("{}*", query)).unwrap_or_default();
            if !ids.is_empty() {
                return Ok(SearchResult {
                    mode: SearchMode::Prefix,
                    items: Self::load_items(conn, &ids)?,
                });
            }
        }

        Ok(SearchResult {
            mode: SearchMode::Substring,
            items: Self::load_items(conn, &Self::substring_scan(conn, query)?)?,
        })
    }

    fn fts_match(conn: &Connection, query: &str) -> rusqlite::Result<Vec<i64>> {
        let mut stmt = conn.prepare(
            "SELECT rowid FROM item_search
             WHERE item_search MATCH ?
             ORDER BY rank",
        )?;
        let ids = stmt
            .query_map([query], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn substring_scan(conn: &Connection, query: &str) -> Result<Vec<i64>, StockPulseError> {
        let pattern = format!("%{}%", escape_like(query));
        let mut stmt = conn.prepare(
            "SELECT id FROM items
             WHERE name LIKE ?1 ESCAPE '\\'
                OR category_name LIKE ?1 ESCAPE '\\'
                OR shop LIKE ?1 ESCAPE '\\'
                OR note LIKE ?1 ESCAPE '\\'
             ORDER BY id",
        )?;
        let ids = stmt
            .query_map([&pattern], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn load_items(conn: &Connection, ids: &[i64]) -> Result<Vec<Item>, StockPulseError> {
        let mut items = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(item) = Item::get_by_id(conn, id)? {
                items.push(item);
            }
        }
        Ok(items)
    }

    fn is_bare_term(query: &str) -> bool {
        !matches!(query, "AND" | "OR" | "NOT" | "NEAR")
            && query.chars().all(|c| c.is_alphanumeric() || c == '_')
    }

    /// Item ids whose projection row is missing, stale, or has no item.
    pub fn verify(conn: &Connection) -> Result<Vec<i64>, StockPulseError> {
        let mut out_of_sync = BTreeSet::new();

        for sql in [
            "SELECT id FROM (
                 SELECT id, name, category_name, shop, note FROM items
                 EXCEPT
                 SELECT rowid, name, category, shop, note FROM item_search
             )",
            "SELECT id FROM (
                 SELECT rowid AS id, name, category, shop, note FROM item_search
                 EXCEPT
                 SELECT id, name, category_name, shop, note FROM items
             )",
        ] {
            let mut stmt = conn.prepare(sql)?;
            for id in stmt.query_map([], |row| row.get::<_, i64>(0))? {
                out_of_sync.insert(id?);
            }
        }

        Ok(out_of_sync.into_iter().collect())
    }
}

fn escape_like(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
