use log::debug;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::categories::Category;
use crate::db::Database;
use crate::error::StockPulseError;
use crate::ledger::Ledger;
use crate::search::SearchIndex;
use crate::validate;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Ordered,
    Arrived,
    Installed,
    Defective,
    Reorder,
}

impl ItemStatus {
    /// Status names written by stores older than schema version 7.
    pub const LEGACY_NAMES: [(&'static str, ItemStatus); 5] = [
        ("bestellt", ItemStatus::Ordered),
        ("eingetroffen", ItemStatus::Arrived),
        ("verbaut", ItemStatus::Installed),
        ("defekt", ItemStatus::Defective),
        ("nachbestellen", ItemStatus::Reorder),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Ordered => "ordered",
            ItemStatus::Arrived => "arrived",
            ItemStatus::Installed => "installed",
            ItemStatus::Defective => "defective",
            ItemStatus::Reorder => "reorder",
        }
    }

    /// Exact match against current or legacy stored names.
    pub fn from_stored(s: &str) -> Option<Self> {
        ItemStatus::iter()
            .find(|status| status.as_str() == s)
            .or_else(|| Self::from_legacy(s))
    }

    pub fn from_legacy(s: &str) -> Option<Self> {
        Self::LEGACY_NAMES
            .iter()
            .find(|(legacy, _)| *legacy == s)
            .map(|(_, status)| *status)
    }

    /// Parses user input. Case-insensitive; legacy names are accepted too.
    pub fn parse(s: &str) -> Result<Self, StockPulseError> {
        let s = s.trim();
        s.parse::<ItemStatus>()
            .ok()
            .or_else(|| Self::from_legacy(&s.to_ascii_lowercase()))
            .ok_or_else(|| {
                let valid: Vec<&str> = ItemStatus::iter().map(|st| st.as_str()).collect();
                StockPulseError::ValidationError(format!(
                    "Unknown status '{}' (expected one of: {})",
                    s,
                    valid.join(", ")
                ))
            })
    }
}

impl ToSql for ItemStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ItemStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        ItemStatus::from_stored(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown item status '{}'", s).into()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Item {
    pub item_id: i64,
    pub name: String,
    pub category_id: i64,
    pub category_name: String,
    pub status: ItemStatus,
    pub shop: Option<String>,
    pub note: Option<String>,
    pub ordered_on: Option<String>,
    pub arrived_on: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewItem {
    pub name: String,
    /// Blank or missing files the item under the default category.
    pub category: Option<String>,
    pub status: ItemStatus,
    pub shop: Option<String>,
    pub note: Option<String>,
    pub ordered_on: Option<String>,
    pub arrived_on: Option<String>,
}

/// A partial update. `None` leaves a field alone; for the optional fields
/// `Some(None)` clears the value.
#[derive(Clone, Debug, Default)]
pub struct ItemUpdate {
    pub name: Option<String>,
    pub category: Option<String>,
    pub status: Option<ItemStatus>,
    pub shop: Option<Option<String>>,
    pub note: Option<Option<String>>,
    pub ordered_on: Option<Option<String>>,
    pub arrived_on: Option<Option<String>>,
}

impl ItemUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.category.is_none()
            && self.status.is_none()
            && self.shop.is_none()
            && self.note.is_none()
            && self.ordered_on.is_none()
            && self.arrived_on.is_none()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ItemFilter {
    pub category: Option<String>,
    pub status: Option<ItemStatus>,
}

impl Item {
    const SELECT_COLUMNS: &'static str =
        "id, name, category_id, category_name, status, shop, note, ordered_on, arrived_on";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Item {
            item_id: row.get(0)?,
            name: row.get(1)?,
            category_id: row.get(2)?,
            category_name: row.get(3)?,
            status: row.get(4)?,
            shop: row.get(5)?,
            note: row.get(6)?,
            ordered_on: row.get(7)?,
            arrived_on: row.get(8)?,
        })
    }

    /// The six-digit display form of the id.
    pub fn display_id(&self) -> String {
        format_item_id(self.item_id)
    }

    pub fn create(conn: &Connection, new_item: &NewItem) -> Result<Self, StockPulseError> {
        let name = validate::item_name(&new_item.name)?;
        let shop = validate::shop(new_item.shop.as_deref())?;
        let note = validate::note(new_item.note.as_deref());
        let ordered_on = validate::date("Order date", new_item.ordered_on.as_deref())?;
        let arrived_on = validate::date("Arrival date", new_item.arrived_on.as_deref())?;
        let category_label = match new_item.category.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => Some(validate::category_name(label)?),
            _ => None,
        };

        Database::immediate_transaction(conn, |c| {
            let category = Category::get_or_create_locked(c, category_label.as_deref())?;

            let item_id: i64 = c.query_row(
                "INSERT INTO items (name, category_id, category_name, status, shop, note, ordered_on, arrived_on)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 RETURNING id",
                rusqlite::params![
                    name,
                    category.category_id,
                    category.name,
                    new_item.status,
                    shop,
                    note,
                    ordered_on,
                    arrived_on,
                ],
                |row| row.get(0),
            )?;

            let item = Item {
                item_id,
                name,
                category_id: category.category_id,
                category_name: category.name,
                status: new_item.status,
                shop,
                note,
                ordered_on,
                arrived_on,
            };

            SearchIndex::upsert_locked(c, &item)?;
            debug!("Created item {} '{}'", item.display_id(), item.name);

            Ok(item)
        })
    }

    pub fn get_by_id(conn: &Connection, item_id: i64) -> Result<Option<Self>, StockPulseError> {
        let item = conn
            .query_row(
                &format!("SELECT {} FROM items WHERE id = ?", Self::SELECT_COLUMNS),
                [item_id],
                Self::from_row,
            )
            .optional()?;
        Ok(item)
    }

    pub fn get_required(conn: &Connection, item_id: i64) -> Result<Self, StockPulseError> {
        Self::get_by_id(conn, item_id)?.ok_or_else(|| StockPulseError::item_not_found(item_id))
    }

    pub(crate) fn exists_locked(conn: &Connection, item_id: i64) -> Result<bool, StockPulseError> {
        let found: Option<i64> = conn
            .query_row("SELECT id FROM items WHERE id = ?", [item_id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list(conn: &Connection, filter: &ItemFilter) -> Result<Vec<Self>, StockPulseError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM items
             WHERE (?1 IS NULL OR category_name = ?1)
               AND (?2 IS NULL OR status = ?2)
             ORDER BY id",
            Self::SELECT_COLUMNS
        ))?;

        let items = stmt
            .query_map(
                rusqlite::params![filter.category.as_deref().map(str::trim), filter.status],
                Self::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(items)
    }

    /// Applies a partial update and returns the item as stored afterwards.
    pub fn update(
        conn: &Connection,
        item_id: i64,
        update: &ItemUpdate,
    ) -> Result<Self, StockPulseError> {
        let name = update.name.as_deref().map(validate::item_name).transpose()?;
        let category_label = update
            .category
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(validate::category_name)
            .transpose()?;
        let shop = match &update.shop {
            Some(value) => Some(validate::shop(value.as_deref())?),
            None => None,
        };
        let note = update.note.as_ref().map(|v| validate::note(v.as_deref()));
        let ordered_on = match &update.ordered_on {
            Some(value) => Some(validate::date("Order date", value.as_deref())?),
            None => None,
        };
        let arrived_on = match &update.arrived_on {
            Some(value) => Some(validate::date("Arrival date", value.as_deref())?),
            None => None,
        };

        Database::immediate_transaction(conn, |c| {
            let mut item = Self::get_by_id(c, item_id)?
                .ok_or_else(|| StockPulseError::item_not_found(item_id))?;

            if update.is_empty() {
                return Ok(item);
            }

            if let Some(name) = name {
                item.name = name;
            }
            if update.category.is_some() {
                let category = Category::get_or_create_locked(c, category_label.as_deref())?;
                item.category_id = category.category_id;
                item.category_name = category.name;
            }
            if let Some(status) = update.status {
                item.status = status;
            }
            if let Some(shop) = shop {
                item.shop = shop;
            }
            if let Some(note) = note {
                item.note = note;
            }
            if let Some(ordered_on) = ordered_on {
                item.ordered_on = ordered_on;
            }
            if let Some(arrived_on) = arrived_on {
                item.arrived_on = arrived_on;
            }

            c.execute(
                "UPDATE items
                 SET name = ?1, category_id = ?2, category_name = ?3, status = ?4,
                     shop = ?5, note = ?6, ordered_on = ?7, arrived_on = ?8
                 WHERE id = ?9",
                rusqlite::params![
                    item.name,
                    item.category_id,
                    item.category_name,
                    item.status,
                    item.shop,
                    item.note,
                    item.ordered_on,
                    item.arrived_on,
                    item.item_id,
                ],
            )?;

            SearchIndex::upsert_locked(c, &item)?;
            debug!("Updated item {}", item.display_id());

            Ok(item)
        })
    }

    /// Deletes the item together with its ledger rows. Returns the number of
    /// ledger rows removed.
    pub fn delete(conn: &Connection, item_id: i64) -> Result<usize, StockPulseError> {
        Database::immediate_transaction(conn, |c| {
            if !Self::exists_locked(c, item_id)? {
                return Err(StockPulseError::item_not_found(item_id));
            }

            let purged = Ledger::purge_item_locked(c, item_id)?;
            c.execute("DELETE FROM items WHERE id = ?", [item_id])?;
            SearchIndex::remove_locked(c, item_id)?;

            debug!(
                "Deleted item {} and {} ledger row(s)",
                format_item_id(item_id),
                purged
            );
            Ok(purged)
        })
    }
}

pub fn format_item_id(item_id: i64) -> String {
    format!("{:06}", item_id)
}

/// Accepts the padded display form (`000042`) or a plain integer.
pub fn parse_item_id(s: &str) -> Result<i64, StockPulseError> {
    let s = s.trim();
    let invalid = || StockPulseError::ValidationError(format!("Invalid item id '{}'", s));

    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let id = s.parse::<i64>().map_err(|_| invalid())?;
    if id <= 0 {
        return Err(invalid());
    }
    Ok(id)
}
